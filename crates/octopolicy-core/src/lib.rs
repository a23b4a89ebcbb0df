//! # octopolicy-core
//!
//! Shared vocabulary for the OctoPolicy service: the policy identity model,
//! subscribers, auto-import configurations, data refresh configuration and
//! the service-level [`Error`] with its [`ErrorKind`] taxonomy.

pub mod data_config;
pub mod duration;
pub mod error;
pub mod events;
pub mod import;
pub mod policy;
pub mod subscriber;

pub use data_config::{DataConfig, DataConfigError, RefreshMethod};
pub use error::{Error, ErrorKind, Result};
pub use events::{ChangeKind, PolicyChangeEvent};
pub use import::ImportConfig;
pub use policy::{ExportConfig, Policy, PolicyFilter, PolicyId};
pub use subscriber::Subscriber;
