//! devops-manager apply: idempotent create-or-update of multi-document manifests.
//!
//! Each document is split out, decoded into a schema-less tree, resolved
//! against one discovery snapshot per call, then written with a
//! get-then-create-or-replace. Failures are per document; earlier writes
//! are never rolled back.

#![forbid(unsafe_code)]

use std::path::Path;
use std::time::Instant;

use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dvm_core::{ApplyAction, AppliedResource, ReconcileError};
use dvm_kubehub::{gvk_key, until_cancelled, ClusterClient, ClusterError, DiscoverySnapshot, GroupVersionKind};

mod decode;
mod split;

pub use decode::{decode_document, DecodeLimits, ResourceDocument};
pub use split::split_manifest;

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Namespace for namespaced documents that do not name one.
    pub default_namespace: String,
    pub limits: DecodeLimits,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self { default_namespace: "default".to_string(), limits: DecodeLimits::default() }
    }
}

impl ApplyOptions {
    /// Options for `namespace` (or "default") with size guards taken from the environment.
    pub fn from_env(namespace: Option<&str>) -> Self {
        Self {
            default_namespace: namespace.unwrap_or("default").to_string(),
            limits: DecodeLimits::from_env(),
        }
    }
}

/// Outcome for one non-blank document; `index` counts documents from 0 in source order.
#[derive(Debug)]
pub struct DocumentOutcome {
    pub index: usize,
    pub kind: Option<String>,
    pub name: Option<String>,
    pub result: Result<AppliedResource, ReconcileError>,
}

#[derive(Debug, Default)]
pub struct ApplyReport {
    pub outcomes: Vec<DocumentOutcome>,
    /// Set when cancellation stopped the run before every document was attempted.
    pub cancelled: bool,
}

impl ApplyReport {
    fn count_action(&self, action: ApplyAction) -> usize {
        self.outcomes.iter().filter(|o| matches!(&o.result, Ok(r) if r.action == action)).count()
    }

    pub fn created(&self) -> usize {
        self.count_action(ApplyAction::Created)
    }

    pub fn updated(&self) -> usize {
        self.count_action(ApplyAction::Updated)
    }

    pub fn errors(&self) -> impl Iterator<Item = (usize, &ReconcileError)> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().err().map(|e| (o.index, e)))
    }

    pub fn failed(&self) -> usize {
        self.errors().count()
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failed() == 0
    }
}

/// Discovery taken lazily, at most once per apply call.
struct LazyDiscovery<'a> {
    client: &'a dyn ClusterClient,
    state: Option<Result<DiscoverySnapshot, String>>,
}

impl<'a> LazyDiscovery<'a> {
    fn new(client: &'a dyn ClusterClient) -> Self {
        Self { client, state: None }
    }

    async fn snapshot(&mut self, gvk: &GroupVersionKind, cancel: &CancellationToken) -> Result<&DiscoverySnapshot, ReconcileError> {
        let state = match self.state.take() {
            Some(s) => s,
            None => match until_cancelled(cancel, DiscoverySnapshot::fetch(self.client)).await {
                None => return Err(ReconcileError::Cancelled),
                Some(Ok(snap)) => {
                    debug!(mappings = snap.len(), "discovery snapshot taken");
                    Ok(snap)
                }
                Some(Err(e)) => {
                    warn!(error = %e, "discovery failed; no document can be resolved");
                    Err(e.to_string())
                }
            },
        };
        match self.state.insert(state) {
            Ok(snap) => Ok(&*snap),
            Err(reason) => Err(ReconcileError::UnresolvableKind {
                gvk: gvk_key(gvk),
                reason: format!("discovery unavailable: {}", reason),
            }),
        }
    }
}

/// Apply every document of `manifest` in order and report each outcome.
pub async fn apply_manifest(client: &dyn ClusterClient, manifest: &[u8], opts: &ApplyOptions, cancel: &CancellationToken) -> ApplyReport {
    let t0 = Instant::now();
    let mut report = ApplyReport::default();
    let mut discovery = LazyDiscovery::new(client);

    for (index, raw) in split_manifest(manifest).into_iter().enumerate() {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        counter!("apply_documents_total", 1u64);
        let (kind, name, result) = match decode_document(raw, &opts.limits) {
            Ok(doc) => {
                let kind = doc.kind().map(str::to_string);
                let name = doc.name().map(str::to_string);
                (kind, name, apply_document(client, doc, &mut discovery, opts, cancel).await)
            }
            Err(e) => (None, None, Err(e)),
        };
        match &result {
            Ok(r) => {
                match r.action {
                    ApplyAction::Created => counter!("apply_created_total", 1u64),
                    ApplyAction::Updated => counter!("apply_updated_total", 1u64),
                }
                info!(index, kind = %r.kind, name = %r.name, ns = ?r.namespace, action = %r.action, "applied");
            }
            Err(ReconcileError::Cancelled) => {
                report.cancelled = true;
                warn!(index, "apply cancelled");
            }
            Err(e) => {
                counter!("apply_err_total", 1u64);
                warn!(index, kind = ?kind, name = ?name, error = %e, "document failed");
            }
        }
        report.outcomes.push(DocumentOutcome { index, kind, name, result });
        if report.cancelled {
            break;
        }
    }

    histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    report
}

/// Read a manifest from disk and apply it.
pub async fn apply_manifest_file(
    client: &dyn ClusterClient,
    path: impl AsRef<Path>,
    opts: &ApplyOptions,
    cancel: &CancellationToken,
) -> std::io::Result<ApplyReport> {
    let data = tokio::fs::read(path.as_ref()).await?;
    Ok(apply_manifest(client, &data, opts, cancel).await)
}

async fn apply_document(
    client: &dyn ClusterClient,
    mut doc: ResourceDocument,
    discovery: &mut LazyDiscovery<'_>,
    opts: &ApplyOptions,
    cancel: &CancellationToken,
) -> Result<AppliedResource, ReconcileError> {
    let gvk = doc.gvk();
    let mapping = discovery.snapshot(&gvk, cancel).await?.resolve(&gvk)?;

    let name = match doc.name() {
        Some(n) => n.to_string(),
        None => {
            return Err(ReconcileError::Apply {
                kind: mapping.kind.clone(),
                name: String::new(),
                source: "document has no metadata.name".into(),
            })
        }
    };
    let namespace = if mapping.namespaced() {
        let ns = doc.namespace().unwrap_or(&opts.default_namespace).to_string();
        doc.set_namespace(&ns);
        Some(ns)
    } else {
        if let Some(ns) = doc.namespace() {
            debug!(kind = %mapping.kind, name = %name, ns = %ns, "ignoring namespace on cluster-scoped kind");
        }
        None
    };
    let obj = doc.into_dynamic()?;
    let apply_err = |e: ClusterError| ReconcileError::Apply { kind: mapping.kind.clone(), name: name.clone(), source: Box::new(e) };

    let existing = until_cancelled(cancel, client.get_object(&mapping, namespace.as_deref(), &name))
        .await
        .ok_or(ReconcileError::Cancelled)?;
    let action = match existing {
        Ok(_) => {
            // Whole-object replace: server-side fields absent from the manifest are dropped.
            until_cancelled(cancel, client.replace_object(&mapping, namespace.as_deref(), &name, &obj))
                .await
                .ok_or(ReconcileError::Cancelled)?
                .map_err(apply_err)?;
            ApplyAction::Updated
        }
        Err(e) if e.is_not_found() => {
            until_cancelled(cancel, client.create_object(&mapping, namespace.as_deref(), &obj))
                .await
                .ok_or(ReconcileError::Cancelled)?
                .map_err(apply_err)?;
            ApplyAction::Created
        }
        Err(e) => return Err(apply_err(e)),
    };

    Ok(AppliedResource { action, kind: mapping.kind.clone(), name, namespace })
}
