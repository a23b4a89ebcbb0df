//! # octopolicy-clients
//!
//! HTTP clients for the services policies and the bundle codec talk to:
//! the evaluation result cache, the signer, a DID resolver, the task service
//! and the proof exchange service. Each collaborator sits behind a trait so
//! callers and tests can substitute their own implementation.

pub mod cache;
pub mod did;
pub mod error;
pub mod http;
pub mod ocm;
pub mod signer;
pub mod task;

pub use cache::{CacheClient, MemoryCache, ResultCache};
pub use did::{DidResolver, DidResolverClient};
pub use error::ClientError;
pub use http::{ServiceClient, ServiceConfig};
pub use ocm::{OcmClient, ProofExchange};
pub use signer::{Signer, SignerClient};
pub use task::{TaskClient, TaskService};
