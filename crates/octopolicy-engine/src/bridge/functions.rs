//! Standard capability functions and the collaborators they call.

use std::sync::Arc;

use octopolicy_clients::{DidResolver, ProofExchange, ResultCache, Signer, TaskService};
use octopolicy_storage::DynStorage;
use serde_json::Value;
use tracing::{debug, info};

use super::{ArgKind, Args, Capability, CapabilityRegistry, FunctionDecl, handler_fn};
use crate::error::BridgeError;

/// Services reachable from policies.
///
/// Key/value storage is always present. Functions whose collaborator is not
/// configured are left out of the registry.
#[derive(Clone)]
pub struct Collaborators {
    pub storage: DynStorage,
    pub cache: Option<Arc<dyn ResultCache>>,
    pub signer: Option<Arc<dyn Signer>>,
    pub did: Option<Arc<dyn DidResolver>>,
    pub tasks: Option<Arc<dyn TaskService>>,
    pub ocm: Option<Arc<dyn ProofExchange>>,
}

impl Collaborators {
    pub fn new(storage: DynStorage) -> Self {
        Self {
            storage,
            cache: None,
            signer: None,
            did: None,
            tasks: None,
            ocm: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_did_resolver(mut self, did: Arc<dyn DidResolver>) -> Self {
        self.did = Some(did);
        self
    }

    pub fn with_tasks(mut self, tasks: Arc<dyn TaskService>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn with_ocm(mut self, ocm: Arc<dyn ProofExchange>) -> Self {
        self.ocm = Some(ocm);
        self
    }
}

fn decl(name: &str, params: &[ArgKind], returns: ArgKind) -> FunctionDecl {
    FunctionDecl::new(name, params, returns)
}

pub(super) fn register_all(registry: &mut CapabilityRegistry, c: Collaborators) {
    register_storage(registry, c.storage);
    if let Some(cache) = c.cache {
        register_cache(registry, cache);
    }
    if let Some(signer) = c.signer {
        register_signer(registry, signer);
    }
    if let Some(did) = c.did {
        register_did(registry, did);
    }
    if let Some(tasks) = c.tasks {
        register_tasks(registry, tasks);
    }
    if let Some(ocm) = c.ocm {
        register_ocm(registry, ocm);
    }
    info!(functions = registry.len(), "Capability registry ready");
}

fn register_storage(registry: &mut CapabilityRegistry, storage: DynStorage) {
    let s = storage.clone();
    registry.register(Capability::new(
        decl("storage.get", &[ArgKind::String], ArgKind::Any),
        handler_fn(move |args: Args| {
            let storage = s.clone();
            async move {
                let value = storage
                    .get_data(args.str(0)?)
                    .await
                    .map_err(|e| BridgeError::Call(e.to_string()))?;
                Ok(value.unwrap_or(Value::Null))
            }
        }),
    ));

    let s = storage.clone();
    registry.register(Capability::new(
        decl("storage.set", &[ArgKind::String, ArgKind::Any], ArgKind::Any),
        handler_fn(move |args: Args| {
            let storage = s.clone();
            async move {
                storage
                    .set_data(args.str(0)?, args.value(1)?)
                    .await
                    .map_err(|e| BridgeError::Call(e.to_string()))?;
                Ok(Value::Null)
            }
        }),
    ));

    registry.register(Capability::new(
        decl("storage.delete", &[ArgKind::String], ArgKind::Any),
        handler_fn(move |args: Args| {
            let storage = storage.clone();
            async move {
                storage
                    .delete_data(args.str(0)?)
                    .await
                    .map_err(|e| BridgeError::Call(e.to_string()))?;
                Ok(Value::Null)
            }
        }),
    ));
}

fn register_cache(registry: &mut CapabilityRegistry, cache: Arc<dyn ResultCache>) {
    let c = cache.clone();
    registry.register(Capability::new(
        decl(
            "cache.get",
            &[ArgKind::String, ArgKind::String, ArgKind::String],
            ArgKind::Any,
        ),
        handler_fn(move |args: Args| {
            let cache = c.clone();
            async move {
                let bytes = cache.get(args.str(0)?, args.str(1)?, args.str(2)?).await?;
                // Non-JSON entries come back as strings.
                Ok(serde_json::from_slice(&bytes)
                    .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned())))
            }
        }),
    ));

    registry.register(Capability::new(
        decl(
            "cache.set",
            &[ArgKind::String, ArgKind::String, ArgKind::String, ArgKind::Any],
            ArgKind::Any,
        ),
        handler_fn(move |args: Args| {
            let cache = cache.clone();
            async move {
                let body = serde_json::to_vec(&args.value(3)?)
                    .map_err(|e| BridgeError::invalid_argument(args.function(), e.to_string()))?;
                cache
                    .set(args.str(0)?, args.str(1)?, args.str(2)?, body, None)
                    .await?;
                Ok(Value::Null)
            }
        }),
    ));
}

fn register_signer(registry: &mut CapabilityRegistry, signer: Arc<dyn Signer>) {
    let s = signer.clone();
    registry.register(Capability::new(
        decl("keys.get", &[ArgKind::String, ArgKind::String], ArgKind::Object),
        handler_fn(move |args: Args| {
            let signer = s.clone();
            async move { Ok(signer.get_key(args.str(0)?, args.str(1)?).await?) }
        }),
    ));

    let s = signer.clone();
    registry.register(Capability::new(
        decl("keys.getAll", &[ArgKind::String], ArgKind::Any),
        handler_fn(move |args: Args| {
            let signer = s.clone();
            async move { Ok(signer.get_all_keys(args.str(0)?).await?) }
        }),
    ));

    let s = signer.clone();
    registry.register(Capability::new(
        decl("proof.create", &[ArgKind::Object], ArgKind::Object),
        handler_fn(move |args: Args| {
            let signer = s.clone();
            async move { Ok(signer.create_proof(args.value(0)?).await?) }
        }),
    ));

    registry.register(Capability::new(
        decl("proof.verify", &[ArgKind::Object], ArgKind::Object),
        handler_fn(move |args: Args| {
            let signer = signer.clone();
            async move { Ok(signer.verify_proof(args.value(0)?).await?) }
        }),
    ));
}

fn register_did(registry: &mut CapabilityRegistry, did: Arc<dyn DidResolver>) {
    registry.register(Capability::new(
        decl("did.resolve", &[ArgKind::String], ArgKind::Object),
        handler_fn(move |args: Args| {
            let did = did.clone();
            async move {
                let id = args.str(0)?;
                debug!(did = %id, "Resolving DID");
                Ok(did.resolve(id).await?)
            }
        }),
    ));
}

fn register_tasks(registry: &mut CapabilityRegistry, tasks: Arc<dyn TaskService>) {
    let t = tasks.clone();
    registry.register(Capability::new(
        decl("task.create", &[ArgKind::String, ArgKind::Object], ArgKind::Object),
        handler_fn(move |args: Args| {
            let tasks = t.clone();
            async move { Ok(tasks.create_task(args.str(0)?, args.value(1)?).await?) }
        }),
    ));

    registry.register(Capability::new(
        decl(
            "tasklist.create",
            &[ArgKind::String, ArgKind::Object],
            ArgKind::Object,
        ),
        handler_fn(move |args: Args| {
            let tasks = tasks.clone();
            async move { Ok(tasks.create_task_list(args.str(0)?, args.value(1)?).await?) }
        }),
    ));
}

fn register_ocm(registry: &mut CapabilityRegistry, ocm: Arc<dyn ProofExchange>) {
    let o = ocm.clone();
    registry.register(Capability::new(
        decl(
            "ocm.getLoginProofInvitation",
            &[ArgKind::Array],
            ArgKind::Object,
        ),
        handler_fn(move |args: Args| {
            let ocm = o.clone();
            async move {
                let types = args
                    .array(0)?
                    .iter()
                    .map(|v| {
                        v.as_str().map(str::to_string).ok_or_else(|| {
                            BridgeError::invalid_argument(
                                args.function(),
                                "credential types must be strings",
                            )
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ocm.get_login_proof_invitation(&types).await?)
            }
        }),
    ));

    registry.register(Capability::new(
        decl("ocm.getLoginProofResult", &[ArgKind::String], ArgKind::Object),
        handler_fn(move |args: Args| {
            let ocm = ocm.clone();
            async move { Ok(ocm.get_login_proof_result(args.str(0)?).await?) }
        }),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::EvalScope;
    use octopolicy_clients::{DidResolverClient, MemoryCache, ServiceConfig};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn storage() -> DynStorage {
        octopolicy_db_memory::create_storage()
    }

    #[tokio::test]
    async fn test_storage_only_registry() {
        let registry = CapabilityRegistry::standard(Collaborators::new(storage()));
        let names: Vec<_> = registry.names().collect();
        assert_eq!(names, vec!["storage.delete", "storage.get", "storage.set"]);
    }

    #[tokio::test]
    async fn test_full_registry_names() {
        let server = MockServer::start().await;
        let config = ServiceConfig::new(server.uri());
        let collaborators = Collaborators::new(storage())
            .with_cache(Arc::new(MemoryCache::new()))
            .with_signer(Arc::new(octopolicy_clients::SignerClient::new(&config).unwrap()))
            .with_did_resolver(Arc::new(DidResolverClient::new(&config).unwrap()))
            .with_tasks(Arc::new(octopolicy_clients::TaskClient::new(&config).unwrap()))
            .with_ocm(Arc::new(octopolicy_clients::OcmClient::new(&config).unwrap()));
        let registry = CapabilityRegistry::standard(collaborators);
        assert_eq!(registry.len(), 14);
        for name in [
            "cache.get",
            "cache.set",
            "did.resolve",
            "keys.get",
            "keys.getAll",
            "proof.create",
            "proof.verify",
            "task.create",
            "tasklist.create",
            "ocm.getLoginProofInvitation",
            "ocm.getLoginProofResult",
        ] {
            assert!(registry.get(name).is_some(), "{name}");
        }
    }

    #[tokio::test]
    async fn test_storage_functions() {
        let registry = CapabilityRegistry::standard(Collaborators::new(storage()));
        let scope = EvalScope::default();

        let missing = registry
            .invoke("storage.get", vec![json!("k")], &scope)
            .await
            .unwrap();
        assert_eq!(missing, Value::Null);

        registry
            .invoke("storage.set", vec![json!("k"), json!({"v": 1})], &scope)
            .await
            .unwrap();
        let found = registry
            .invoke("storage.get", vec![json!("k")], &EvalScope::default())
            .await
            .unwrap();
        assert_eq!(found, json!({"v": 1}));
    }

    #[tokio::test]
    async fn test_cache_round_trip() {
        let registry = CapabilityRegistry::standard(
            Collaborators::new(storage()).with_cache(Arc::new(MemoryCache::new())),
        );
        registry
            .invoke(
                "cache.set",
                vec![json!("k"), json!("ns"), json!("sc"), json!({"hit": true})],
                &EvalScope::default(),
            )
            .await
            .unwrap();
        let value = registry
            .invoke(
                "cache.get",
                vec![json!("k"), json!("ns"), json!("sc")],
                &EvalScope::default(),
            )
            .await
            .unwrap();
        assert_eq!(value, json!({"hit": true}));
    }

    #[tokio::test]
    async fn test_remote_status_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/1.0/identifiers/did:web:gone"))
            .respond_with(ResponseTemplate::new(410).set_body_string("gone"))
            .mount(&server)
            .await;

        let did = DidResolverClient::new(&ServiceConfig::new(server.uri())).unwrap();
        let registry =
            CapabilityRegistry::standard(Collaborators::new(storage()).with_did_resolver(Arc::new(did)));
        let err = registry
            .invoke("did.resolve", vec![json!("did:web:gone")], &EvalScope::default())
            .await
            .unwrap_err();
        assert_eq!(err.remote_status(), Some(410));
    }

    #[tokio::test]
    async fn test_invitation_rejects_non_string_types() {
        let server = MockServer::start().await;
        let ocm = octopolicy_clients::OcmClient::new(&ServiceConfig::new(server.uri())).unwrap();
        let registry =
            CapabilityRegistry::standard(Collaborators::new(storage()).with_ocm(Arc::new(ocm)));
        let err = registry
            .invoke(
                "ocm.getLoginProofInvitation",
                vec![json!(["EmailCredential", 7])],
                &EvalScope::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument { .. }));
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }
}
