use std::sync::Arc;

use octopolicy_bundle::BundleService;
use octopolicy_engine::PolicyService;
use octopolicy_storage::DynStorage;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub storage: DynStorage,
    pub policies: Arc<PolicyService>,
    pub bundles: Arc<BundleService>,
}
