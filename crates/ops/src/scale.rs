//! Deployment scaling under optimistic concurrency.

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dvm_core::{ReconcileError, ScaleOutcome, ScaleRequest};
use dvm_kubehub::{until_cancelled, ClusterClient, ClusterError};

use crate::retry::RetryPolicy;

fn cluster_err(op: &'static str) -> impl Fn(ClusterError) -> ReconcileError {
    move |e| ReconcileError::Cluster { op, source: Box::new(e) }
}

/// Read, set `spec.replicas`, write back; restart on a resourceVersion conflict
/// until `policy.attempts` is used up. Non-conflict errors are returned at once.
pub async fn scale_deployment(
    client: &dyn ClusterClient,
    req: &ScaleRequest,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<ScaleOutcome, ReconcileError> {
    let replicas = i32::try_from(req.replicas)
        .map_err(|_| ReconcileError::Validation(format!("replica count {} is out of range", req.replicas)))?;
    let attempts = policy.attempts.max(1);

    for attempt in 1..=attempts {
        let mut deployment = until_cancelled(cancel, client.get_deployment(&req.namespace, &req.name))
            .await
            .ok_or(ReconcileError::Cancelled)?
            .map_err(cluster_err("get deployment"))?;
        let previous = deployment.spec.as_ref().and_then(|s| s.replicas);
        deployment.spec.get_or_insert_with(Default::default).replicas = Some(replicas);

        let written = until_cancelled(cancel, client.replace_deployment(&req.namespace, &req.name, &deployment))
            .await
            .ok_or(ReconcileError::Cancelled)?;
        match written {
            Ok(stored) => {
                counter!("scale_ok_total", 1u64);
                let stored_replicas = stored.spec.and_then(|s| s.replicas).unwrap_or(replicas);
                info!(ns = %req.namespace, name = %req.name, replicas = stored_replicas, previous = ?previous, attempt, "scaled");
                return Ok(ScaleOutcome { replicas: stored_replicas, previous, attempts: attempt });
            }
            Err(e) if e.is_conflict() => {
                counter!("scale_conflicts_total", 1u64);
                debug!(ns = %req.namespace, name = %req.name, attempt, error = %e, "update conflict");
                if attempt < attempts {
                    let delay = policy.backoff.delay(attempt);
                    if !delay.is_zero() && until_cancelled(cancel, tokio::time::sleep(delay)).await.is_none() {
                        return Err(ReconcileError::Cancelled);
                    }
                }
            }
            Err(e) => return Err(cluster_err("update deployment")(e)),
        }
    }

    warn!(ns = %req.namespace, name = %req.name, attempts, "scale gave up after repeated conflicts");
    Err(ReconcileError::ConflictExhausted { namespace: req.namespace.clone(), name: req.name.clone(), attempts })
}
