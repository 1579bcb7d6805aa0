//! Typed delete over the fixed [`DeleteKind`] set.

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::info;

use dvm_core::{DeleteKind, ReconcileError};
use dvm_kubehub::{until_cancelled, ClusterClient};

/// Parse `kind_tag` and delete. An unknown tag fails before any cluster call.
pub async fn delete_resource(
    client: &dyn ClusterClient,
    namespace: &str,
    kind_tag: &str,
    name: &str,
    cancel: &CancellationToken,
) -> Result<(), ReconcileError> {
    let kind: DeleteKind = kind_tag.parse()?;
    delete_kind(client, namespace, kind, name, cancel).await
}

pub async fn delete_kind(
    client: &dyn ClusterClient,
    namespace: &str,
    kind: DeleteKind,
    name: &str,
    cancel: &CancellationToken,
) -> Result<(), ReconcileError> {
    let call = async {
        match kind {
            DeleteKind::Deployment => client.delete_deployment(namespace, name).await,
            DeleteKind::Service => client.delete_service(namespace, name).await,
            DeleteKind::Pod => client.delete_pod(namespace, name).await,
            DeleteKind::ConfigMap => client.delete_config_map(namespace, name).await,
        }
    };
    until_cancelled(cancel, call)
        .await
        .ok_or(ReconcileError::Cancelled)?
        .map_err(|e| ReconcileError::Cluster { op: "delete", source: Box::new(e) })?;
    counter!("delete_ok_total", 1u64);
    info!(ns = %namespace, kind = %kind, name = %name, "deleted");
    Ok(())
}
