//! devops-manager ops: targeted mutations on statically known kinds.
//! Scaling retries on optimistic-concurrency conflicts; deletes dispatch
//! over a closed kind set. Neither needs discovery.

#![forbid(unsafe_code)]

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use dvm_core::{DeleteKind, ReconcileError, ScaleOutcome, ScaleRequest};
use dvm_kubehub::ClusterClient;

mod delete;
mod retry;
mod scale;

pub use delete::{delete_kind, delete_resource};
pub use retry::{Backoff, FixedBackoff, NoBackoff, RetryPolicy};
pub use scale::scale_deployment;

/// Client handle plus the retry policy scaling runs under.
#[derive(Clone)]
pub struct Ops {
    client: Arc<dyn ClusterClient>,
    retry: RetryPolicy,
}

impl Ops {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client, retry: RetryPolicy::default() }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn scale(&self, req: &ScaleRequest, cancel: &CancellationToken) -> Result<ScaleOutcome, ReconcileError> {
        scale_deployment(self.client.as_ref(), req, &self.retry, cancel).await
    }

    pub async fn delete(&self, namespace: &str, kind: DeleteKind, name: &str, cancel: &CancellationToken) -> Result<(), ReconcileError> {
        delete_kind(self.client.as_ref(), namespace, kind, name, cancel).await
    }
}
