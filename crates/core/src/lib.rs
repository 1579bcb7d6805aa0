//! devops-manager core types: resolved mappings, operation outcomes and the
//! reconcile error taxonomy. Nothing in here talks to a cluster.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Whether a resource lives inside a namespace or at cluster level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Namespaced,
    Cluster,
}

/// A group/version/kind resolved to the plural REST resource the cluster serves it under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestMapping {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub scope: Scope,
}

impl RestMapping {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn namespaced(&self) -> bool {
        matches!(self.scope, Scope::Namespaced)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApplyAction {
    Created,
    Updated,
}

impl fmt::Display for ApplyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyAction::Created => f.write_str("created"),
            ApplyAction::Updated => f.write_str("updated"),
        }
    }
}

/// Result of one successful create-or-update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedResource {
    pub action: ApplyAction,
    pub kind: String,
    pub name: String,
    /// None for cluster-scoped resources.
    pub namespace: Option<String>,
}

/// Target replica count for a Deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScaleRequest {
    pub namespace: String,
    pub name: String,
    pub replicas: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScaleOutcome {
    /// Replica count stored by the winning write.
    pub replicas: i32,
    /// Replica count read on the winning attempt, before mutation.
    pub previous: Option<i32>,
    pub attempts: u32,
}

/// Closed set of kinds the deleter knows how to remove.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeleteKind {
    Deployment,
    Service,
    Pod,
    ConfigMap,
}

impl DeleteKind {
    pub const ALL: [DeleteKind; 4] = [DeleteKind::Deployment, DeleteKind::Service, DeleteKind::Pod, DeleteKind::ConfigMap];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeleteKind::Deployment => "deployment",
            DeleteKind::Service => "service",
            DeleteKind::Pod => "pod",
            DeleteKind::ConfigMap => "configmap",
        }
    }

    /// Accepted spellings, lowercase, canonical name first.
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            DeleteKind::Deployment => &["deployment", "deployments", "deploy"],
            DeleteKind::Service => &["service", "services", "svc"],
            DeleteKind::Pod => &["pod", "pods", "po"],
            DeleteKind::ConfigMap => &["configmap", "configmaps", "cm"],
        }
    }
}

impl fmt::Display for DeleteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeleteKind {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_ascii_lowercase();
        DeleteKind::ALL
            .into_iter()
            .find(|k| k.aliases().contains(&tag.as_str()))
            .ok_or_else(|| ReconcileError::UnsupportedKind(s.to_string()))
    }
}

/// Every failure the reconciler reports. Each one belongs to a single
/// document (apply) or a single operation (scale, delete).
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("decode: {0}")]
    Decode(String),
    #[error("cannot resolve kind {gvk}: {reason}")]
    UnresolvableKind { gvk: String, reason: String },
    #[error("apply {kind}/{name}: {source}")]
    Apply {
        kind: String,
        name: String,
        #[source]
        source: BoxError,
    },
    #[error("scale {namespace}/{name}: still conflicting after {attempts} attempts")]
    ConflictExhausted { namespace: String, name: String, attempts: u32 },
    #[error("unsupported resource kind: {0:?} (expected deployment, service, pod or configmap)")]
    UnsupportedKind(String),
    #[error("{op}: {source}")]
    Cluster {
        op: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("validation: {0}")]
    Validation(String),
    #[error("cancelled")]
    Cancelled,
}

impl ReconcileError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReconcileError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_kind_parses_aliases() {
        assert_eq!("Deployment".parse::<DeleteKind>().unwrap(), DeleteKind::Deployment);
        assert_eq!("svc".parse::<DeleteKind>().unwrap(), DeleteKind::Service);
        assert_eq!(" po ".parse::<DeleteKind>().unwrap(), DeleteKind::Pod);
        assert_eq!("cm".parse::<DeleteKind>().unwrap(), DeleteKind::ConfigMap);
        for k in DeleteKind::ALL {
            assert_eq!(k.aliases()[0], k.as_str());
            assert_eq!(k.as_str().parse::<DeleteKind>().unwrap(), k);
        }
    }

    #[test]
    fn delete_kind_rejects_unknown() {
        let err = "statefulset".parse::<DeleteKind>().unwrap_err();
        assert!(matches!(err, ReconcileError::UnsupportedKind(ref k) if k == "statefulset"));
        assert!(err.to_string().contains("statefulset"));
    }

    #[test]
    fn rest_mapping_api_version() {
        let mut m = RestMapping {
            group: String::new(),
            version: "v1".into(),
            kind: "ConfigMap".into(),
            plural: "configmaps".into(),
            scope: Scope::Namespaced,
        };
        assert_eq!(m.api_version(), "v1");
        assert!(m.namespaced());
        m.group = "apps".into();
        m.scope = Scope::Cluster;
        assert_eq!(m.api_version(), "apps/v1");
        assert!(!m.namespaced());
    }
}
