//! In-memory `ClusterClient` for tests: seeded discovery, a flat object
//! store, a call journal and a few injectable failures.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use kube::core::{DynamicObject, ObjectMeta};
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;

use dvm_core::RestMapping;

use crate::{ClusterClient, ClusterError, DiscoveredResource};

/// One recorded call against the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Discover,
    Get { plural: String, name: String },
    Create { plural: String, name: String },
    Replace { plural: String, name: String },
    Delete { plural: String, name: String },
}

impl Call {
    pub fn is_write(&self) -> bool {
        matches!(self, Call::Create { .. } | Call::Replace { .. } | Call::Delete { .. })
    }
}

/// (group, plural, namespace or "", name)
type Key = (String, String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Json>,
    calls: Vec<Call>,
    next_rv: u64,
    discovery_down: bool,
    failing_writes: HashSet<String>,
    failing_reads: HashSet<String>,
    stall_reads: HashMap<String, CancellationToken>,
    pending_conflicts: u32,
}

impl State {
    fn bump_rv(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }
}

pub struct FakeCluster {
    resources: Vec<DiscoveredResource>,
    state: Mutex<State>,
}

fn resource(group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> DiscoveredResource {
    DiscoveredResource {
        group: group.into(),
        version: version.into(),
        kind: kind.into(),
        plural: plural.into(),
        namespaced,
    }
}

fn key(group: &str, plural: &str, namespace: Option<&str>, name: &str) -> Key {
    (group.to_string(), plural.to_string(), namespace.unwrap_or("").to_string(), name.to_string())
}

fn rv_of(v: &Json) -> Option<&str> {
    v.get("metadata").and_then(|m| m.get("resourceVersion")).and_then(Json::as_str)
}

fn set_meta(v: &mut Json, field: &str, value: &str) {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        meta.insert(field.to_string(), Json::String(value.to_string()));
    }
}

fn internal_error(name: &str) -> ClusterError {
    ClusterError::Api { code: 500, reason: "InternalError".into(), message: format!("injected write failure for {}", name) }
}

impl FakeCluster {
    pub fn new(resources: Vec<DiscoveredResource>) -> Self {
        Self { resources, state: Mutex::new(State::default()) }
    }

    /// Common built-in kinds plus one namespaced CRD (`example.com/v1/Widget`).
    pub fn with_builtin_kinds() -> Self {
        Self::new(vec![
            resource("", "v1", "ConfigMap", "configmaps", true),
            resource("", "v1", "Secret", "secrets", true),
            resource("", "v1", "Service", "services", true),
            resource("", "v1", "Pod", "pods", true),
            resource("", "v1", "Namespace", "namespaces", false),
            resource("apps", "v1", "Deployment", "deployments", true),
            resource("rbac.authorization.k8s.io", "v1", "ClusterRole", "clusterroles", false),
            resource("example.com", "v1", "Widget", "widgets", true),
        ])
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("fake cluster state poisoned")
    }

    /// Make every discovery call fail.
    pub fn fail_discovery(&self) {
        self.state().discovery_down = true;
    }

    /// Make create/replace of any object with this name fail with a 500.
    pub fn fail_writes_for(&self, name: &str) {
        self.state().failing_writes.insert(name.to_string());
    }

    /// Make a dynamic get of any object with this name fail with a 403.
    pub fn fail_reads_for(&self, name: &str) {
        self.state().failing_reads.insert(name.to_string());
    }

    /// A dynamic get of `name` cancels `token` and then never completes,
    /// like a request still in flight when the caller gives up.
    pub fn cancel_during_get(&self, name: &str, token: CancellationToken) {
        self.state().stall_reads.insert(name.to_string(), token);
    }

    /// The next `n` Deployment replaces report a resourceVersion conflict.
    pub fn inject_conflicts(&self, n: u32) {
        self.state().pending_conflicts = n;
    }

    pub fn seed_deployment(&self, namespace: &str, name: &str, replicas: i32) {
        let dep = Deployment {
            metadata: ObjectMeta { name: Some(name.into()), namespace: Some(namespace.into()), ..Default::default() },
            spec: Some(DeploymentSpec { replicas: Some(replicas), ..Default::default() }),
            ..Default::default()
        };
        let mut st = self.state();
        let mut v = serde_json::to_value(&dep).expect("deployment serializes");
        let rv = st.bump_rv();
        set_meta(&mut v, "resourceVersion", &rv);
        st.objects.insert(key("apps", "deployments", Some(namespace), name), v);
    }

    pub fn seed_object(&self, group: &str, plural: &str, namespace: Option<&str>, name: &str, mut obj: Json) {
        let mut st = self.state();
        let rv = st.bump_rv();
        set_meta(&mut obj, "resourceVersion", &rv);
        st.objects.insert(key(group, plural, namespace, name), obj);
    }

    pub fn object(&self, group: &str, plural: &str, namespace: Option<&str>, name: &str) -> Option<Json> {
        self.state().objects.get(&key(group, plural, namespace, name)).cloned()
    }

    pub fn deployment_replicas(&self, namespace: &str, name: &str) -> Option<i32> {
        self.object("apps", "deployments", Some(namespace), name)
            .and_then(|v| v.pointer("/spec/replicas").and_then(Json::as_i64))
            .map(|r| r as i32)
    }

    pub fn object_count(&self) -> usize {
        self.state().objects.len()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    fn mapping_ns<'a>(mapping: &RestMapping, namespace: Option<&'a str>) -> Option<&'a str> {
        if mapping.namespaced() { namespace } else { None }
    }

    fn delete_typed(&self, group: &str, plural: &str, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let mut st = self.state();
        st.calls.push(Call::Delete { plural: plural.into(), name: name.into() });
        match st.objects.remove(&key(group, plural, Some(namespace), name)) {
            Some(_) => Ok(()),
            None => Err(ClusterError::NotFound(format!("{} \"{}\" not found", plural, name))),
        }
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn discover(&self) -> Result<Vec<DiscoveredResource>, ClusterError> {
        let mut st = self.state();
        st.calls.push(Call::Discover);
        if st.discovery_down {
            return Err(ClusterError::Api { code: 403, reason: "Forbidden".into(), message: "discovery is forbidden".into() });
        }
        Ok(self.resources.clone())
    }

    async fn get_object(&self, mapping: &RestMapping, namespace: Option<&str>, name: &str) -> Result<DynamicObject, ClusterError> {
        let stall = {
            let mut st = self.state();
            st.calls.push(Call::Get { plural: mapping.plural.clone(), name: name.into() });
            st.stall_reads.get(name).cloned()
        };
        if let Some(token) = stall {
            token.cancel();
            std::future::pending::<()>().await;
        }
        let st = self.state();
        if st.failing_reads.contains(name) {
            return Err(ClusterError::Api { code: 403, reason: "Forbidden".into(), message: format!("injected read failure for {}", name) });
        }
        let ns = Self::mapping_ns(mapping, namespace);
        let v = st
            .objects
            .get(&key(&mapping.group, &mapping.plural, ns, name))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("{} \"{}\" not found", mapping.plural, name)))?;
        Ok(serde_json::from_value(v).expect("stored object is a valid DynamicObject"))
    }

    async fn create_object(&self, mapping: &RestMapping, namespace: Option<&str>, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        let mut st = self.state();
        st.calls.push(Call::Create { plural: mapping.plural.clone(), name: name.clone() });
        if st.failing_writes.contains(&name) {
            return Err(internal_error(&name));
        }
        let ns = Self::mapping_ns(mapping, namespace);
        let k = key(&mapping.group, &mapping.plural, ns, &name);
        if st.objects.contains_key(&k) {
            return Err(ClusterError::AlreadyExists(format!("{} \"{}\" already exists", mapping.plural, name)));
        }
        let mut v = serde_json::to_value(obj).expect("DynamicObject serializes");
        let rv = st.bump_rv();
        set_meta(&mut v, "resourceVersion", &rv);
        st.objects.insert(k, v.clone());
        Ok(serde_json::from_value(v).expect("stored object is a valid DynamicObject"))
    }

    async fn replace_object(&self, mapping: &RestMapping, namespace: Option<&str>, name: &str, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let mut st = self.state();
        st.calls.push(Call::Replace { plural: mapping.plural.clone(), name: name.into() });
        if st.failing_writes.contains(name) {
            return Err(internal_error(name));
        }
        let ns = Self::mapping_ns(mapping, namespace);
        let k = key(&mapping.group, &mapping.plural, ns, name);
        let current_rv = match st.objects.get(&k) {
            Some(cur) => rv_of(cur).map(str::to_string),
            None => return Err(ClusterError::NotFound(format!("{} \"{}\" not found", mapping.plural, name))),
        };
        let mut v = serde_json::to_value(obj).expect("DynamicObject serializes");
        if let Some(sent) = rv_of(&v) {
            if Some(sent) != current_rv.as_deref() {
                return Err(ClusterError::Conflict(format!("{} \"{}\": object has been modified", mapping.plural, name)));
            }
        }
        let rv = st.bump_rv();
        set_meta(&mut v, "resourceVersion", &rv);
        st.objects.insert(k, v.clone());
        Ok(serde_json::from_value(v).expect("stored object is a valid DynamicObject"))
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, ClusterError> {
        let mut st = self.state();
        st.calls.push(Call::Get { plural: "deployments".into(), name: name.into() });
        let v = st
            .objects
            .get(&key("apps", "deployments", Some(namespace), name))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("deployments \"{}\" not found", name)))?;
        Ok(serde_json::from_value(v).expect("stored deployment deserializes"))
    }

    async fn replace_deployment(&self, namespace: &str, name: &str, deployment: &Deployment) -> Result<Deployment, ClusterError> {
        let mut st = self.state();
        st.calls.push(Call::Replace { plural: "deployments".into(), name: name.into() });
        if st.pending_conflicts > 0 {
            // Simulates a concurrent writer winning the race
            st.pending_conflicts -= 1;
            return Err(ClusterError::Conflict(format!("deployments \"{}\": object has been modified", name)));
        }
        let k = key("apps", "deployments", Some(namespace), name);
        let current_rv = match st.objects.get(&k) {
            Some(cur) => rv_of(cur).map(str::to_string),
            None => return Err(ClusterError::NotFound(format!("deployments \"{}\" not found", name))),
        };
        if deployment.metadata.resource_version.is_some() && deployment.metadata.resource_version != current_rv {
            return Err(ClusterError::Conflict(format!("deployments \"{}\": object has been modified", name)));
        }
        let mut v = serde_json::to_value(deployment).expect("deployment serializes");
        let rv = st.bump_rv();
        set_meta(&mut v, "resourceVersion", &rv);
        st.objects.insert(k, v.clone());
        Ok(serde_json::from_value(v).expect("stored deployment deserializes"))
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.delete_typed("apps", "deployments", namespace, name)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.delete_typed("", "services", namespace, name)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.delete_typed("", "pods", namespace, name)
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.delete_typed("", "configmaps", namespace, name)
    }
}
