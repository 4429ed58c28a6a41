//! Tether core types: the normalized event envelope every watch produces,
//! watch descriptors, and the decode boundary for upstream watch lines.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod descriptor;
pub mod line;

pub use descriptor::{DescriptorError, WatchDescriptor, WatchKey};
pub use line::{decode_line, LineKind, WatchLine};

/// Kind of change carried by an [`Envelope`]. Closed set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Added => "ADDED",
            EventKind::Modified => "MODIFIED",
            EventKind::Deleted => "DELETED",
            EventKind::Error => "ERROR",
        }
    }
}

/// Normalized watch event. Serializes as
/// `{"type": "ADDED", "object": {..}, "resourceVersion": ".."}`.
///
/// An `Error` envelope never carries a usable resource; use [`Envelope::resource`]
/// rather than reading `object` directly when treating an envelope as an update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Opaque cursor from `object.metadata.resourceVersion`; diagnostics only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

const FALLBACK_ERROR: &str = "upstream watch error";

impl Envelope {
    /// Build an update envelope. `kind` must not be `Error`; use [`Envelope::error`] for that.
    pub fn update(kind: EventKind, object: serde_json::Value) -> Self {
        debug_assert!(kind != EventKind::Error);
        let resource_version = object
            .get("metadata")
            .and_then(|m| m.get("resourceVersion"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        Self { kind, object: Some(object), error: None, resource_version }
    }

    /// Build an error envelope. The message is never empty.
    pub fn error(message: impl Into<String>, object: Option<serde_json::Value>) -> Self {
        let mut message = message.into();
        if message.trim().is_empty() {
            message = FALLBACK_ERROR.to_string();
        }
        Self { kind: EventKind::Error, object, error: Some(message), resource_version: None }
    }

    pub fn is_error(&self) -> bool { self.kind == EventKind::Error }

    /// The resource payload, or `None` for error envelopes.
    pub fn resource(&self) -> Option<&serde_json::Value> {
        if self.is_error() { None } else { self.object.as_ref() }
    }

    pub fn name(&self) -> Option<&str> {
        self.resource()?.get("metadata")?.get("name")?.as_str()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.resource()?.get("metadata")?.get("namespace")?.as_str()
    }

    /// See [`object_key`]; empty for error envelopes.
    pub fn object_key(&self) -> String {
        self.resource().map(object_key).unwrap_or_default()
    }
}

/// `namespace/name` of a resource object, or just `name` for cluster-scoped objects.
pub fn object_key(object: &serde_json::Value) -> String {
    let meta = object.get("metadata");
    let name = meta.and_then(|m| m.get("name")).and_then(|v| v.as_str()).unwrap_or("");
    match meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()) {
        Some(ns) => format!("{}/{}", ns, name),
        None => name.to_string(),
    }
}

pub mod prelude {
    pub use super::{decode_line, object_key, Envelope, EventKind, WatchDescriptor, WatchKey};
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_lifts_resource_version() {
        let env = Envelope::update(
            EventKind::Added,
            json!({"metadata": {"name": "x", "namespace": "demo", "resourceVersion": "42"}}),
        );
        assert_eq!(env.resource_version.as_deref(), Some("42"));
        assert_eq!(env.object_key(), "demo/x");
    }

    #[test]
    fn error_envelope_hides_resource_and_is_never_empty() {
        let env = Envelope::error("  ", Some(json!({"spec": {"a": 1}})));
        assert!(env.is_error());
        assert!(env.resource().is_none());
        assert_eq!(env.error.as_deref(), Some(FALLBACK_ERROR));
        assert_eq!(env.object_key(), "");
    }

    #[test]
    fn object_key_of_raw_list_items() {
        assert_eq!(object_key(&json!({"metadata": {"name": "p1", "namespace": "demo"}})), "demo/p1");
        assert_eq!(object_key(&json!({"metadata": {"name": "node-a"}})), "node-a");
        assert_eq!(object_key(&json!({})), "");
    }

    #[test]
    fn serializes_with_upstream_type_names() {
        let env = Envelope::update(EventKind::Modified, json!({"metadata": {"name": "a"}}));
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "MODIFIED");
        assert!(v.get("error").is_none());
        assert!(v.get("resourceVersion").is_none());
    }
}
