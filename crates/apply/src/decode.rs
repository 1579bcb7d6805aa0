//! Schema-less decoding of one manifest document.

use kube::core::{DynamicObject, GroupVersionKind};
use serde_json::Value as Json;

use dvm_core::ReconcileError;

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(default)
}

/// Size guards applied before and after parsing a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self { max_bytes: 1_000_000, max_nodes: 100_000 }
    }
}

impl DecodeLimits {
    /// Defaults overridden by `DVM_MAX_YAML_BYTES` / `DVM_MAX_YAML_NODES`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_bytes: env_usize("DVM_MAX_YAML_BYTES", d.max_bytes),
            max_nodes: env_usize("DVM_MAX_YAML_NODES", d.max_nodes),
        }
    }
}

/// One decoded document held as an attribute tree (null/bool/number/string/
/// sequence/mapping). Only `apiVersion`, `kind` and `metadata.*` are ever
/// interpreted; everything else is carried through untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDocument {
    tree: Json,
}

impl ResourceDocument {
    pub fn from_tree(tree: Json) -> Result<Self, ReconcileError> {
        if !tree.is_object() {
            return Err(ReconcileError::Decode(format!("top-level value is {}, expected a mapping", type_name(&tree))));
        }
        Ok(Self { tree })
    }

    fn str_at(&self, pointer: &str) -> Option<&str> {
        self.tree.pointer(pointer).and_then(Json::as_str).filter(|s| !s.is_empty())
    }

    pub fn api_version(&self) -> Option<&str> {
        self.str_at("/apiVersion")
    }

    pub fn kind(&self) -> Option<&str> {
        self.str_at("/kind")
    }

    pub fn name(&self) -> Option<&str> {
        self.str_at("/metadata/name")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.str_at("/metadata/namespace")
    }

    /// Missing parts come back empty; resolution is where they are rejected.
    pub fn gvk(&self) -> GroupVersionKind {
        let api_version = self.api_version().unwrap_or("");
        let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
        GroupVersionKind::gvk(group, version, self.kind().unwrap_or(""))
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        if let Some(root) = self.tree.as_object_mut() {
            let meta = root.entry("metadata").or_insert_with(|| Json::Object(serde_json::Map::new()));
            if let Some(meta) = meta.as_object_mut() {
                meta.insert("namespace".into(), Json::String(namespace.to_string()));
            }
        }
    }

    pub fn into_dynamic(self) -> Result<DynamicObject, ReconcileError> {
        serde_json::from_value(self.tree).map_err(|e| ReconcileError::Decode(format!("not a valid object: {}", e)))
    }
}

fn type_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "a boolean",
        Json::Number(_) => "a number",
        Json::String(_) => "a string",
        Json::Array(_) => "a sequence",
        Json::Object(_) => "a mapping",
    }
}

/// Counts at most `max + 1` nodes.
fn node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur > max {
            return;
        }
        *cur += 1;
        let children: Vec<&Json> = match v {
            Json::Object(map) => map.values().collect(),
            Json::Array(arr) => arr.iter().collect(),
            _ => return,
        };
        for vv in children {
            if *cur > max {
                break;
            }
            walk(vv, cur, max);
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count > max
}

/// Rejects non-string mapping keys (`1:`, `true:`) anywhere in the tree.
fn check_keys(v: &serde_yaml::Value, path: &mut Vec<String>) -> Result<(), ReconcileError> {
    use serde_yaml::Value as Yaml;
    match v {
        Yaml::Mapping(map) => {
            for (k, vv) in map {
                let Yaml::String(key) = k else {
                    let at = if path.is_empty() { "top level".to_string() } else { path.join(".") };
                    return Err(ReconcileError::Decode(format!("non-string mapping key {:?} at {}", k, at)));
                };
                path.push(key.clone());
                check_keys(vv, path)?;
                path.pop();
            }
            Ok(())
        }
        Yaml::Sequence(seq) => seq.iter().try_for_each(|vv| check_keys(vv, path)),
        Yaml::Tagged(t) => check_keys(&t.value, path),
        _ => Ok(()),
    }
}

/// Parse one document's bytes into a [`ResourceDocument`].
pub fn decode_document(bytes: &[u8], limits: &DecodeLimits) -> Result<ResourceDocument, ReconcileError> {
    if bytes.len() > limits.max_bytes {
        return Err(ReconcileError::Decode(format!("document too large (>{} bytes)", limits.max_bytes)));
    }
    let mut yaml: serde_yaml::Value = serde_yaml::from_slice(bytes).map_err(|e| ReconcileError::Decode(format!("invalid YAML: {}", e)))?;
    yaml.apply_merge().map_err(|e| ReconcileError::Decode(format!("invalid merge key: {}", e)))?;
    check_keys(&yaml, &mut Vec::new())?;
    let tree = serde_json::to_value(yaml).map_err(|e| ReconcileError::Decode(format!("unsupported YAML structure: {}", e)))?;
    if node_budget_exceeded(&tree, limits.max_nodes) {
        return Err(ReconcileError::Decode(format!("document too complex (>{} nodes)", limits.max_nodes)));
    }
    ResourceDocument::from_tree(tree)
}
