use k8s_openapi::api::core::v1::ConfigMap as KubeConfigMap;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub const CONFIGMAP_KIND: &str = "ConfigMap";

/*
 * ObjectKey is the identity of a watched object, everything the engine
 * tracks (store records, dispatch queues) is keyed on it.
 */
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
    pub kind: String,
}

impl ObjectKey {

    pub fn new(namespace: &str, name: &str, kind: &str) -> Self {
	Self{
	    namespace: namespace.to_string(),
	    name: name.to_string(),
	    kind: kind.to_string(),
	}
    }

    pub fn configmap(namespace: &str, name: &str) -> Self {
	Self::new(namespace, name, CONFIGMAP_KIND)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/*
 * A single entry of the object's field map. ConfigMaps carry both `.data`
 * (text) and `.binaryData` (raw bytes, already base64-decoded by the client).
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Binary(Vec<u8>),
}

/*
 * WatchedObject is the typed view of a cluster object the engine works on.
 * It is a transient copy, valid for the processing of a single event.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedObject {
    pub key: ObjectKey,
    pub labels: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("object is missing {0}")]
pub struct MissingMetadata(pub &'static str);

impl WatchedObject {

    pub fn label(&self, key: &str) -> Option<&str> {
	self.labels.get(key).map(String::as_str)
    }

    pub fn name(&self) -> &str {
	self.key.name.as_str()
    }

    pub fn namespace(&self) -> &str {
	self.key.namespace.as_str()
    }
}

/*
 * This is the only place where the shape of a ConfigMap is looked at:
 * past this point the rest of the engine deals with WatchedObject only.
 *
 * A key present in both `.data` and `.binaryData` is rejected by the API
 * server, so merging both maps cannot lose entries.
 */
impl TryFrom<&KubeConfigMap> for WatchedObject {
    type Error = MissingMetadata;

    fn try_from(cm: &KubeConfigMap) -> Result<Self, Self::Error> {
	let name = cm.metadata.name.as_deref().ok_or(MissingMetadata(".metadata.name"))?;
	let namespace = cm.metadata.namespace.as_deref().ok_or(MissingMetadata(".metadata.namespace"))?;

	let mut fields = BTreeMap::new();
	if let Some(data) = &cm.data {
	    for (key, value) in data {
		fields.insert(key.clone(), FieldValue::Text(value.clone()));
	    }
	}
	if let Some(binary) = &cm.binary_data {
	    for (key, value) in binary {
		fields.insert(key.clone(), FieldValue::Binary(value.0.clone()));
	    }
	}

	Ok(Self{
	    key: ObjectKey::configmap(namespace, name),
	    labels: cm.metadata.labels.clone().unwrap_or_default(),
	    fields: fields,
	    resource_version: cm.metadata.resource_version.clone(),
	})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn configmap(value: serde_json::Value) -> KubeConfigMap {
	serde_json::from_value(value).unwrap()
    }

    #[test]
    fn converts_data_and_binary_data() {
	let cm = configmap(json!({
	    "apiVersion": "v1",
	    "kind": "ConfigMap",
	    "metadata": {
		"name": "cm1",
		"namespace": "ns-a",
		"resourceVersion": "42",
		"labels": { "app": "foo" },
	    },
	    "data": { "rules.yaml": "groups: []" },
	    "binaryData": { "extra.yaml": "Z3JvdXBzOiBbXQ==" },
	}));

	let obj = WatchedObject::try_from(&cm).unwrap();
	assert_eq!(obj.key, ObjectKey::configmap("ns-a", "cm1"));
	assert_eq!(obj.key.to_string(), "ConfigMap/ns-a/cm1");
	assert_eq!(obj.label("app"), Some("foo"));
	assert_eq!(obj.resource_version.as_deref(), Some("42"));
	assert_eq!(obj.fields.get("rules.yaml"), Some(&FieldValue::Text("groups: []".to_string())));
	assert_eq!(obj.fields.get("extra.yaml"), Some(&FieldValue::Binary(b"groups: []".to_vec())));
    }

    #[test]
    fn objects_without_data_have_no_fields() {
	let cm = configmap(json!({
	    "metadata": { "name": "empty", "namespace": "ns-a" },
	}));

	let obj = WatchedObject::try_from(&cm).unwrap();
	assert!(obj.fields.is_empty());
	assert!(obj.labels.is_empty());
    }

    #[test]
    fn rejects_objects_without_namespace() {
	let cm = configmap(json!({
	    "metadata": { "name": "cluster-scoped" },
	}));

	let err = WatchedObject::try_from(&cm).unwrap_err();
	assert_eq!(err, MissingMetadata(".metadata.namespace"));
	assert_eq!(err.to_string(), "object is missing .metadata.namespace");
    }
}
