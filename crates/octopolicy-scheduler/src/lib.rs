//! # octopolicy-scheduler
//!
//! Background loops driven by claims on the policy store:
//!
//! - [`DataRefresher`] replaces a policy's static data with the body fetched
//!   from its data refresh config, on the config's period.
//! - [`AutoImporter`] downloads signed bundles from registered source URLs
//!   and imports them.
//!
//! Both loops recover from every per-item error and stop after the current
//! tick once their shutdown token is cancelled.

pub mod config;
pub mod error;
pub mod importer;
pub mod refresh;

pub use config::{AutoImportConfig, RefreshConfig};
pub use error::SchedulerError;
pub use importer::{AutoImporter, ImportSummary};
pub use refresh::{DataRefresher, RefreshOutcome, RefreshSummary};
