use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Static description of a served resource type (as returned by discovery).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceDescriptor {
    /// API group; empty for the core group.
    pub group: String,
    pub version: String,
    /// Plural name, optionally with a subresource suffix (`nodes/status`).
    pub name: String,
    pub kind: String,
    pub namespaced: bool,
    #[serde(default)]
    pub verbs: Vec<String>,
    #[serde(default)]
    pub short_names: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
}

impl ResourceDescriptor {
    /// `group_version` is either `v1` (core) or `group/version`.
    pub fn new(group_version: &str, name: &str, kind: &str, namespaced: bool) -> Self {
        let (group, version) = match group_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), group_version.to_string()),
        };
        Self {
            group,
            version,
            name: name.to_string(),
            kind: kind.to_string(),
            namespaced,
            verbs: Vec::new(),
            short_names: Vec::new(),
            categories: Vec::new(),
        }
    }

    pub fn with_verbs(mut self, verbs: &[&str]) -> Self {
        self.verbs = verbs.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn with_short_names(mut self, names: &[&str]) -> Self {
        self.short_names = names.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn with_categories(mut self, cats: &[&str]) -> Self {
        self.categories = cats.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn group_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// `/api/v1` for the core group, `/apis/{group}/{version}` otherwise.
    pub fn api_prefix(&self) -> String {
        if self.group.is_empty() { format!("/api/{}", self.version) } else { format!("/apis/{}/{}", self.group, self.version) }
    }

    /// Plural without any subresource suffix.
    pub fn plural(&self) -> &str {
        self.name.split_once('/').map(|(p, _)| p).unwrap_or(&self.name)
    }

    /// Subresource suffix carried by the descriptor name, if any.
    pub fn subresource(&self) -> Option<&str> {
        self.name.split_once('/').map(|(_, s)| s).filter(|s| !s.is_empty())
    }

    /// Empty verb list means unknown; treat as permissive.
    pub fn supports(&self, verb: &str) -> bool {
        self.verbs.is_empty() || self.verbs.iter().any(|v| v == verb)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    /// Server-managed keys we do not model (managedFields, selfLink, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ObjectMeta {
    pub fn is_empty(&self) -> bool { self == &ObjectMeta::default() }
}

/// Generic resource envelope. Top-level keys beyond the common ones
/// (`data`, `rules`, Status fields, ...) are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInstance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "ObjectMeta::is_empty")]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResourceInstance {
    pub fn new(api_version: &str, kind: &str, name: &str) -> Self {
        Self {
            api_version: Some(api_version.to_string()),
            kind: Some(kind.to_string()),
            metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
            ..Default::default()
        }
    }

    pub fn name(&self) -> Option<&str> { self.metadata.name.as_deref() }
    pub fn namespace(&self) -> Option<&str> { self.metadata.namespace.as_deref() }
    pub fn resource_version(&self) -> Option<&str> { self.metadata.resource_version.as_deref() }
    pub fn kind(&self) -> Option<&str> { self.kind.as_deref() }

    /// `ns/name` or `name` for cluster-scoped objects.
    pub fn key(&self) -> String {
        let name = self.name().unwrap_or("");
        match self.namespace() {
            Some(ns) => format!("{}/{}", ns, name),
            None => name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, rename = "continue", skip_serializing_if = "Option::is_none")]
    pub continue_token: Option<String>,
}

/// `{kind: XList, metadata, items}` as returned by list and delete-collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceList {
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default)]
    pub items: Vec<ResourceInstance>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    Error,
    Bookmark,
}

/// One change notification of a watch stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub object: ResourceInstance,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_splits_group_version_and_subresource() {
        let d = ResourceDescriptor::new("apps/v1", "deployments/scale", "Scale", true);
        assert_eq!(d.group, "apps");
        assert_eq!(d.api_prefix(), "/apis/apps/v1");
        assert_eq!(d.plural(), "deployments");
        assert_eq!(d.subresource(), Some("scale"));

        let core = ResourceDescriptor::new("v1", "nodes", "Node", false).with_verbs(&["get", "list"]);
        assert_eq!(core.group_version(), "v1");
        assert_eq!(core.api_prefix(), "/api/v1");
        assert_eq!(core.subresource(), None);
        assert!(core.supports("list"));
        assert!(!core.supports("delete"));
    }

    #[test]
    fn instance_serializes_only_present_fields() {
        let mut node = ResourceInstance::new("v1", "Node", "test");
        node.api_version = None;
        node.metadata.resource_version = Some("1".into());
        node.spec = Some(serde_json::json!({"unschedulable": true}));
        let v = serde_json::to_value(&node).expect("ser");
        assert_eq!(v, serde_json::json!({
            "kind": "Node",
            "metadata": {"name": "test", "resourceVersion": "1"},
            "spec": {"unschedulable": true}
        }));
    }

    #[test]
    fn instance_keeps_unmodelled_keys() {
        let raw = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "namespace": "ns", "managedFields": [{"manager": "x"}]},
            "data": {"k": "v"}
        });
        let obj: ResourceInstance = serde_json::from_value(raw.clone()).expect("de");
        assert_eq!(obj.key(), "ns/cm");
        assert!(obj.extra.contains_key("data"));
        assert!(obj.metadata.extra.contains_key("managedFields"));
        assert_eq!(serde_json::to_value(&obj).expect("ser"), raw);
    }

    #[test]
    fn watch_event_type_is_uppercase_on_the_wire() {
        let ev: WatchEvent = serde_json::from_str(r#"{"type":"MODIFIED","object":{"kind":"Pod","metadata":{"name":"p"}}}"#).expect("de");
        assert_eq!(ev.event_type, EventType::Modified);
        assert_eq!(ev.object.name(), Some("p"));
    }

    #[test]
    fn sparse_owner_reference_still_decodes() {
        let obj: ResourceInstance = serde_json::from_value(serde_json::json!({
            "kind": "Pod",
            "metadata": {"name": "web-0", "ownerReferences": [{"name": "web", "uid": "1234"}]}
        }))
        .expect("decode");
        let owner = &obj.metadata.owner_references[0];
        assert_eq!((owner.name.as_str(), owner.uid.as_str()), ("web", "1234"));
        assert!(owner.kind.is_empty() && owner.api_version.is_empty());
    }
}
