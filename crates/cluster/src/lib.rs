//! Vigil cluster collaborators.
//!
//! The engine never talks to Kubernetes directly; it goes through the
//! [`DiscoveryClient`] and [`ObjectClient`] traits defined here. The
//! kube-backed implementations adapt `kube::Client`; tests substitute
//! scripted mocks.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use serde_json::Value as Json;
use vigil_core::{ResourceMeta, VigilError};

mod cache;
mod retry;

pub use cache::{KindCache, DEFAULT_TTL_MS};
pub use retry::call_with_retry;

/// Error from a remote call, carrying the HTTP status when the control
/// plane answered at all.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("api error (status {code}): {message}")]
    Status { code: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
}

impl CallError {
    pub fn code(&self) -> Option<u16> {
        match self {
            CallError::Status { code, .. } => Some(*code),
            CallError::Transport(_) => None,
        }
    }

    /// "Not found" is a legitimate terminal answer, never retried.
    pub fn is_not_found(&self) -> bool {
        self.code() == Some(404)
    }

    /// 5xx and transport failures are worth retrying; 4xx is not.
    pub fn is_transient(&self) -> bool {
        match self.code() {
            Some(code) => code >= 500,
            None => true,
        }
    }

    /// Taxonomy form for a discovery failure surfaced to a caller.
    pub fn into_discovery_error(self, api_version: &str) -> VigilError {
        VigilError::DiscoveryUnavailable {
            api_version: api_version.to_string(),
            message: self.to_string(),
        }
    }
}

impl From<kube::Error> for CallError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) => CallError::Status { code: ae.code, message: ae.message },
            other => CallError::Transport(other.to_string()),
        }
    }
}

/// Control-plane discovery: which kinds does an apiVersion serve.
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    async fn list_resource_kinds(&self, api_version: &str) -> Result<Vec<ResourceMeta>, CallError>;
}

/// Dynamic object access, one verb per engine need.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    async fn read(
        &self,
        api_version: &str,
        meta: &ResourceMeta,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Json, CallError>;

    async fn apply(
        &self,
        api_version: &str,
        meta: &ResourceMeta,
        namespace: Option<&str>,
        name: &str,
        obj: &Json,
    ) -> Result<Json, CallError>;

    async fn replace(
        &self,
        api_version: &str,
        meta: &ResourceMeta,
        namespace: Option<&str>,
        name: &str,
        obj: &Json,
    ) -> Result<Json, CallError>;

    async fn delete(
        &self,
        api_version: &str,
        meta: &ResourceMeta,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), CallError>;
}

/// Discovery over the raw `/api/<v>` and `/apis/<group>/<v>` endpoints.
#[derive(Clone)]
pub struct KubeDiscovery {
    client: Client,
}

impl KubeDiscovery {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DiscoveryClient for KubeDiscovery {
    async fn list_resource_kinds(&self, api_version: &str) -> Result<Vec<ResourceMeta>, CallError> {
        let list = if api_version.contains('/') {
            self.client.list_api_group_resources(api_version).await?
        } else {
            self.client.list_core_api_resources(api_version).await?
        };
        let kinds = list
            .resources
            .into_iter()
            // subresources come back as "pods/log" etc.
            .filter(|r| !r.name.contains('/'))
            .map(|r| ResourceMeta { kind: r.kind, plural: r.name, namespaced: r.namespaced })
            .collect();
        Ok(kinds)
    }
}

/// Object verbs over `Api<DynamicObject>`.
#[derive(Clone)]
pub struct KubeObjects {
    client: Client,
    field_manager: String,
}

impl KubeObjects {
    pub fn new(client: Client) -> Self {
        Self { client, field_manager: "vigil".to_string() }
    }

    fn dynamic_api(
        &self,
        api_version: &str,
        meta: &ResourceMeta,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>, CallError> {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", api_version),
        };
        let gvk = GroupVersionKind::gvk(group, version, &meta.kind);
        let ar = ApiResource::from_gvk_with_plural(&gvk, &meta.plural);
        Ok(match namespace {
            Some(ns) if meta.namespaced => Api::namespaced_with(self.client.clone(), ns, &ar),
            Some(ns) => {
                return Err(CallError::Transport(format!(
                    "kind {} is cluster-scoped but namespace {ns:?} was given",
                    meta.kind
                )))
            }
            None => Api::all_with(self.client.clone(), &ar),
        })
    }
}

#[async_trait]
impl ObjectClient for KubeObjects {
    async fn read(
        &self,
        api_version: &str,
        meta: &ResourceMeta,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Json, CallError> {
        let api = self.dynamic_api(api_version, meta, namespace)?;
        let obj = api.get(name).await?;
        serde_json::to_value(&obj).map_err(|e| CallError::Transport(e.to_string()))
    }

    async fn apply(
        &self,
        api_version: &str,
        meta: &ResourceMeta,
        namespace: Option<&str>,
        name: &str,
        obj: &Json,
    ) -> Result<Json, CallError> {
        let api = self.dynamic_api(api_version, meta, namespace)?;
        let pp = PatchParams::apply(&self.field_manager).force();
        let applied = api.patch(name, &pp, &Patch::Apply(obj)).await?;
        serde_json::to_value(&applied).map_err(|e| CallError::Transport(e.to_string()))
    }

    async fn replace(
        &self,
        api_version: &str,
        meta: &ResourceMeta,
        namespace: Option<&str>,
        name: &str,
        obj: &Json,
    ) -> Result<Json, CallError> {
        let api = self.dynamic_api(api_version, meta, namespace)?;
        let data: DynamicObject = serde_json::from_value(obj.clone())
            .map_err(|e| CallError::Transport(format!("object is not replaceable: {e}")))?;
        let replaced = api.replace(name, &PostParams::default(), &data).await?;
        serde_json::to_value(&replaced).map_err(|e| CallError::Transport(e.to_string()))
    }

    async fn delete(
        &self,
        api_version: &str,
        meta: &ResourceMeta,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), CallError> {
        let api = self.dynamic_api(api_version, meta, namespace)?;
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_by_status_code() {
        let not_found = CallError::Status { code: 404, message: "no".into() };
        assert!(not_found.is_not_found());
        assert!(!not_found.is_transient());

        let forbidden = CallError::Status { code: 403, message: "rbac".into() };
        assert!(!forbidden.is_not_found());
        assert!(!forbidden.is_transient());

        let unavailable = CallError::Status { code: 503, message: "etcd".into() };
        assert!(unavailable.is_transient());

        let io = CallError::Transport("connection reset".into());
        assert!(io.is_transient());
        assert_eq!(io.code(), None);
    }

    #[test]
    fn discovery_failures_map_to_taxonomy() {
        let e = CallError::Status { code: 404, message: "unknown apiVersion".into() };
        match e.into_discovery_error("nope.io/v1") {
            VigilError::DiscoveryUnavailable { api_version, message } => {
                assert_eq!(api_version, "nope.io/v1");
                assert!(message.contains("unknown apiVersion"));
            }
            other => panic!("expected DiscoveryUnavailable, got {other}"),
        }
    }
}
