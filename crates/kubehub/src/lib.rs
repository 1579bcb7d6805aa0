//! devops-manager kubehub: the single seam between the reconciler and a cluster.
//!
//! `ClusterClient` is what every operation is written against; `KubeCluster`
//! backs it with kube-rs, and `fake::FakeCluster` (feature `fake`) backs it
//! with an in-memory store for tests.

#![forbid(unsafe_code)]

use std::future::Future;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::{
    api::{Api, DeleteParams, PostParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope as KubeScope},
    Client,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use dvm_core::{RestMapping, Scope};

pub mod discovery;
#[cfg(any(test, feature = "fake"))]
pub mod fake;

pub use discovery::{gvk_key, parse_gvk_key, DiscoverySnapshot};
pub use kube::core::GroupVersionKind;

/// One served (group, version, kind) as advertised by cluster discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn mapping(&self) -> RestMapping {
        RestMapping {
            group: self.group.clone(),
            version: self.version.clone(),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
            scope: if self.namespaced { Scope::Namespaced } else { Scope::Cluster },
        }
    }
}

/// Cluster call failures, classified by what the callers need to branch on.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// The object changed between read and write (resourceVersion mismatch).
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("api error {code} ({reason}): {message}")]
    Api { code: u16, reason: String, message: String },
    #[error("transport: {0}")]
    Transport(#[source] kube::Error),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict(_))
    }
}

impl From<kube::Error> for ClusterError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) => match (ae.code, ae.reason.as_str()) {
                (404, _) => ClusterError::NotFound(ae.message),
                (409, "AlreadyExists") => ClusterError::AlreadyExists(ae.message),
                (409, _) => ClusterError::Conflict(ae.message),
                _ => ClusterError::Api { code: ae.code, reason: ae.reason, message: ae.message },
            },
            other => ClusterError::Transport(other),
        }
    }
}

/// Everything the reconciler needs from a cluster.
///
/// Dynamic methods address a resource through a resolved [`RestMapping`];
/// `namespace` must be `Some` for namespaced mappings and is ignored otherwise.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// List every served version of every resource kind.
    async fn discover(&self) -> Result<Vec<DiscoveredResource>, ClusterError>;

    async fn get_object(&self, mapping: &RestMapping, namespace: Option<&str>, name: &str) -> Result<DynamicObject, ClusterError>;
    async fn create_object(&self, mapping: &RestMapping, namespace: Option<&str>, obj: &DynamicObject) -> Result<DynamicObject, ClusterError>;
    /// Whole-object replace (PUT); fields absent from `obj` are dropped server-side.
    async fn replace_object(&self, mapping: &RestMapping, namespace: Option<&str>, name: &str, obj: &DynamicObject) -> Result<DynamicObject, ClusterError>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, ClusterError>;
    async fn replace_deployment(&self, namespace: &str, name: &str, deployment: &Deployment) -> Result<Deployment, ClusterError>;

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
}

/// kube-rs backed client. Connection setup is whatever `kube::Client` resolves.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build from the ambient kubeconfig or in-cluster service account.
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        Ok(Self { client })
    }

    fn dynamic_api(&self, mapping: &RestMapping, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = ApiResource {
            group: mapping.group.clone(),
            version: mapping.version.clone(),
            api_version: mapping.api_version(),
            kind: mapping.kind.clone(),
            plural: mapping.plural.clone(),
        };
        match (mapping.namespaced(), namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            // Namespaced kind without a namespace: fall back to the client's default namespace
            (true, None) => Api::default_namespaced_with(self.client.clone(), &ar),
            (false, _) => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn discover(&self) -> Result<Vec<DiscoveredResource>, ClusterError> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        let mut out = Vec::new();
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    out.push(DiscoveredResource {
                        group: ar.group,
                        version: ar.version,
                        kind: ar.kind,
                        plural: ar.plural,
                        namespaced: matches!(caps.scope, KubeScope::Namespaced),
                    });
                }
            }
        }
        info!(resources = out.len(), "discovery completed");
        Ok(out)
    }

    async fn get_object(&self, mapping: &RestMapping, namespace: Option<&str>, name: &str) -> Result<DynamicObject, ClusterError> {
        Ok(self.dynamic_api(mapping, namespace).get(name).await?)
    }

    async fn create_object(&self, mapping: &RestMapping, namespace: Option<&str>, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        Ok(self.dynamic_api(mapping, namespace).create(&PostParams::default(), obj).await?)
    }

    async fn replace_object(&self, mapping: &RestMapping, namespace: Option<&str>, name: &str, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        Ok(self.dynamic_api(mapping, namespace).replace(name, &PostParams::default(), obj).await?)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, ClusterError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn replace_deployment(&self, namespace: &str, name: &str, deployment: &Deployment) -> Result<Deployment, ClusterError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.replace(name, &PostParams::default(), deployment).await?)
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        debug!(ns = %namespace, name = %name, "deployment delete accepted");
        Ok(())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

/// Drive `fut` unless `cancel` fires first; `None` means cancelled.
/// Work the cluster already committed is not undone.
pub async fn until_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}
