#![forbid(unsafe_code)]

use dvm_apply::{apply_manifest, apply_manifest_file, ApplyOptions};
use dvm_core::{ApplyAction, ReconcileError};
use dvm_kubehub::fake::{Call, FakeCluster};
use dvm_kubehub::ClusterError;
use tokio_util::sync::CancellationToken;

const STACK: &str = r#"
apiVersion: v1
kind: Namespace
metadata:
  name: shop
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
  namespace: shop
data:
  mode: fast
---
apiVersion: example.com/v1
kind: Widget
metadata:
  name: gizmo
spec:
  size: 3
"#;

fn discover_calls(fake: &FakeCluster) -> usize {
    fake.calls().iter().filter(|c| **c == Call::Discover).count()
}

#[tokio::test]
async fn applying_twice_creates_then_updates() {
    let fake = FakeCluster::with_builtin_kinds();
    let opts = ApplyOptions::default();
    let cancel = CancellationToken::new();

    let first = apply_manifest(&fake, STACK.as_bytes(), &opts, &cancel).await;
    assert!(first.is_success(), "{:?}", first);
    assert_eq!(first.outcomes.len(), 3);
    assert_eq!(first.created(), 3);
    for o in &first.outcomes {
        assert_eq!(o.result.as_ref().unwrap().action, ApplyAction::Created);
    }

    let second = apply_manifest(&fake, STACK.as_bytes(), &opts, &cancel).await;
    assert!(second.is_success(), "{:?}", second);
    assert_eq!(second.updated(), 3);
    assert_eq!(second.created(), 0);

    // One discovery round-trip per apply call, regardless of document count
    assert_eq!(discover_calls(&fake), 2);
    assert_eq!(fake.object_count(), 3);
}

#[tokio::test]
async fn namespaces_follow_scope() {
    let fake = FakeCluster::with_builtin_kinds();
    let opts = ApplyOptions { default_namespace: "team-a".into(), ..Default::default() };
    let report = apply_manifest(&fake, STACK.as_bytes(), &opts, &CancellationToken::new()).await;
    assert!(report.is_success());

    let ns = report.outcomes[0].result.as_ref().unwrap();
    assert_eq!(ns.kind, "Namespace");
    assert_eq!(ns.namespace, None);
    assert!(fake.object("", "namespaces", None, "shop").is_some());

    // Declared namespace wins over the default
    assert!(fake.object("", "configmaps", Some("shop"), "settings").is_some());

    // Undeclared namespace falls back to the default and is written into the object
    let widget = fake.object("example.com", "widgets", Some("team-a"), "gizmo").expect("widget stored");
    assert_eq!(widget["metadata"]["namespace"], "team-a");
    assert_eq!(widget["spec"]["size"], 3);
}

#[tokio::test]
async fn malformed_document_does_not_block_siblings() {
    let manifest = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\nkind: [broken\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: b\n";
    let fake = FakeCluster::with_builtin_kinds();
    let report = apply_manifest(&fake, manifest.as_bytes(), &ApplyOptions::default(), &CancellationToken::new()).await;

    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.created(), 2);
    let errors: Vec<_> = report.errors().collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, 1);
    assert!(matches!(errors[0].1, ReconcileError::Decode(_)));
    assert!(fake.object("", "configmaps", Some("default"), "b").is_some());
}

#[tokio::test]
async fn unknown_kind_is_skipped_without_mutation() {
    let manifest = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\napiVersion: example.com/v1\nkind: Gadget\nmetadata:\n  name: g\n---\napiVersion: v1\nkind: Secret\nmetadata:\n  name: s\n";
    let fake = FakeCluster::with_builtin_kinds();
    let report = apply_manifest(&fake, manifest.as_bytes(), &ApplyOptions::default(), &CancellationToken::new()).await;

    assert_eq!(report.created(), 2);
    assert_eq!(report.failed(), 1);
    assert!(matches!(report.outcomes[1].result, Err(ReconcileError::UnresolvableKind { ref gvk, .. }) if gvk == "example.com/v1/Gadget"));
    assert!(!fake.calls().iter().any(|c| matches!(c, Call::Get { name, .. } | Call::Create { name, .. } if name == "g")));
}

#[tokio::test]
async fn update_replaces_the_whole_object() {
    let fake = FakeCluster::with_builtin_kinds();
    fake.seed_object(
        "",
        "configmaps",
        Some("default"),
        "cfg",
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "cfg", "namespace": "default", "labels": { "owner": "ops" } },
            "data": { "a": "1", "b": "2" }
        }),
    );
    let manifest = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\ndata:\n  a: \"10\"\n";
    let report = apply_manifest(&fake, manifest.as_bytes(), &ApplyOptions::default(), &CancellationToken::new()).await;
    assert_eq!(report.updated(), 1);

    let stored = fake.object("", "configmaps", Some("default"), "cfg").unwrap();
    assert_eq!(stored["data"], serde_json::json!({ "a": "10" }));
    assert!(stored["metadata"].get("labels").is_none());
}

#[tokio::test]
async fn write_failure_is_reported_and_processing_continues() {
    let fake = FakeCluster::with_builtin_kinds();
    fake.fail_writes_for("settings");
    let report = apply_manifest(&fake, STACK.as_bytes(), &ApplyOptions::default(), &CancellationToken::new()).await;

    assert_eq!(report.created(), 2);
    match &report.outcomes[1].result {
        Err(ReconcileError::Apply { kind, name, .. }) => {
            assert_eq!(kind, "ConfigMap");
            assert_eq!(name, "settings");
        }
        other => panic!("unexpected {:?}", other),
    }
    // Earlier document stays applied
    assert!(fake.object("", "namespaces", None, "shop").is_some());
}

#[tokio::test]
async fn discovery_outage_fails_every_document_without_writes() {
    let fake = FakeCluster::with_builtin_kinds();
    fake.fail_discovery();
    let report = apply_manifest(&fake, STACK.as_bytes(), &ApplyOptions::default(), &CancellationToken::new()).await;

    assert_eq!(report.failed(), 3);
    for (_, e) in report.errors() {
        assert!(matches!(e, ReconcileError::UnresolvableKind { reason, .. } if reason.contains("discovery unavailable")));
    }
    assert_eq!(fake.calls(), vec![Call::Discover]);
}

#[tokio::test]
async fn no_decodable_documents_means_no_discovery() {
    let fake = FakeCluster::with_builtin_kinds();
    let report = apply_manifest(&fake, b"---\n- a\n---\n\n---\n", &ApplyOptions::default(), &CancellationToken::new()).await;
    assert_eq!(report.outcomes.len(), 1);
    assert!(matches!(report.outcomes[0].result, Err(ReconcileError::Decode(_))));
    assert_eq!(fake.call_count(), 0);
}

#[tokio::test]
async fn missing_name_fails_before_any_cluster_write() {
    let fake = FakeCluster::with_builtin_kinds();
    let report = apply_manifest(&fake, b"apiVersion: v1\nkind: ConfigMap\ndata:\n  a: b\n", &ApplyOptions::default(), &CancellationToken::new()).await;
    assert!(matches!(report.outcomes[0].result, Err(ReconcileError::Apply { .. })));
    assert!(!fake.calls().iter().any(Call::is_write));
}

#[tokio::test]
async fn cancelled_token_stops_before_any_call() {
    let fake = FakeCluster::with_builtin_kinds();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = apply_manifest(&fake, STACK.as_bytes(), &ApplyOptions::default(), &cancel).await;
    assert!(report.cancelled);
    assert!(report.outcomes.is_empty());
    assert!(!report.is_success());
    assert_eq!(fake.call_count(), 0);
}

#[tokio::test]
async fn applies_manifest_from_file() {
    let path = std::env::temp_dir().join(format!("dvm-apply-{}.yaml", std::process::id()));
    std::fs::write(&path, STACK).unwrap();
    let fake = FakeCluster::with_builtin_kinds();
    let report = apply_manifest_file(&fake, &path, &ApplyOptions::default(), &CancellationToken::new()).await.unwrap();
    let _ = std::fs::remove_file(&path);
    assert_eq!(report.created(), 3);

    let missing = apply_manifest_file(&fake, path.with_extension("missing"), &ApplyOptions::default(), &CancellationToken::new()).await;
    assert!(missing.is_err());
}

#[tokio::test]
async fn failed_lookup_is_an_apply_error_and_skips_create() {
    let fake = FakeCluster::with_builtin_kinds();
    fake.fail_reads_for("settings");
    let report = apply_manifest(&fake, STACK.as_bytes(), &ApplyOptions::default(), &CancellationToken::new()).await;

    assert_eq!(report.created(), 2);
    assert_eq!(report.failed(), 1);
    match &report.outcomes[1].result {
        Err(ReconcileError::Apply { kind, name, source }) => {
            assert_eq!((kind.as_str(), name.as_str()), ("ConfigMap", "settings"));
            let cluster = source.downcast_ref::<ClusterError>().expect("cluster error source");
            assert!(matches!(cluster, ClusterError::Api { code: 403, .. }));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(!fake.calls().iter().any(|c| matches!(c, Call::Create { name, .. } | Call::Replace { name, .. } if name == "settings")));
    assert!(fake.object("", "configmaps", Some("shop"), "settings").is_none());
    assert!(fake.object("example.com", "widgets", Some("default"), "gizmo").is_some());
}

#[tokio::test]
async fn cancellation_mid_call_stops_remaining_documents() {
    let fake = FakeCluster::with_builtin_kinds();
    let cancel = CancellationToken::new();
    fake.cancel_during_get("settings", cancel.clone());

    let report = apply_manifest(&fake, STACK.as_bytes(), &ApplyOptions::default(), &cancel).await;

    assert!(report.cancelled);
    assert!(!report.is_success());
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.outcomes[0].result.as_ref().unwrap().action, ApplyAction::Created);
    assert!(matches!(report.outcomes[1].result, Err(ReconcileError::Cancelled)));

    // Committed work stays; the third document is never touched
    assert!(fake.object("", "namespaces", None, "shop").is_some());
    assert!(!fake.calls().iter().any(|c| matches!(c, Call::Get { name, .. } | Call::Create { name, .. } if name == "gizmo")));
    assert!(!fake.calls().iter().any(|c| matches!(c, Call::Create { name, .. } if name == "settings")));
}
