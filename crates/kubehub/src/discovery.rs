//! Discovery snapshot and GVK -> REST mapping resolution.

use std::collections::BTreeMap;

use kube::core::GroupVersionKind;
use metrics::counter;
use tracing::debug;

use dvm_core::{ReconcileError, RestMapping};

use crate::{ClusterClient, ClusterError, DiscoveredResource};

/// Point-in-time view of the kinds a cluster serves, indexed by (group, kind).
///
/// Taken once per apply call and passed explicitly; a CRD added or removed
/// after the snapshot was taken is not seen until the next call.
#[derive(Debug, Clone, Default)]
pub struct DiscoverySnapshot {
    table: BTreeMap<(String, String), Vec<RestMapping>>,
}

impl DiscoverySnapshot {
    /// One discovery round-trip against the cluster.
    pub async fn fetch(client: &dyn ClusterClient) -> Result<Self, ClusterError> {
        counter!("discovery_fetch_total", 1u64);
        let resources = client.discover().await?;
        Ok(Self::from_resources(resources))
    }

    pub fn from_resources(resources: impl IntoIterator<Item = DiscoveredResource>) -> Self {
        let mut table: BTreeMap<(String, String), Vec<RestMapping>> = BTreeMap::new();
        for r in resources {
            let entry = table.entry((r.group.clone(), r.kind.clone())).or_default();
            if !entry.iter().any(|m| m.version == r.version) {
                entry.push(r.mapping());
            }
        }
        Self { table }
    }

    pub fn len(&self) -> usize {
        self.table.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Versions served for a (group, kind), in discovery order.
    pub fn served_versions(&self, group: &str, kind: &str) -> Vec<&str> {
        self.table
            .get(&(group.to_string(), kind.to_string()))
            .map(|ms| ms.iter().map(|m| m.version.as_str()).collect())
            .unwrap_or_default()
    }

    /// Resolve a GVK to exactly one mapping, or fail with `UnresolvableKind`.
    pub fn resolve(&self, gvk: &GroupVersionKind) -> Result<RestMapping, ReconcileError> {
        let unresolvable = |reason: String| ReconcileError::UnresolvableKind { gvk: gvk_key(gvk), reason };
        if gvk.kind.is_empty() {
            return Err(unresolvable("document has no kind".into()));
        }
        if gvk.version.is_empty() {
            return Err(unresolvable("document has no apiVersion".into()));
        }
        let candidates = self
            .table
            .get(&(gvk.group.clone(), gvk.kind.clone()))
            .ok_or_else(|| unresolvable("kind is not served by the cluster".into()))?;
        match candidates.iter().find(|m| m.version == gvk.version) {
            Some(m) => {
                debug!(gvk = %gvk_key(gvk), plural = %m.plural, scope = ?m.scope, "resolved");
                Ok(m.clone())
            }
            None => Err(unresolvable(format!(
                "version {} is not served (served: {})",
                gvk.version,
                self.served_versions(&gvk.group, &gvk.kind).join(", ")
            ))),
        }
    }
}

/// `v1/Kind` for the core group, `group/version/Kind` otherwise.
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind, ReconcileError> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(ReconcileError::Validation(format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key))),
    }
}
