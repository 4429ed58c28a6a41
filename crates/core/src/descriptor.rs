//! Watch descriptors: the identity of one upstream watch connection.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("{field} contains an invalid character: {value:?}")]
    InvalidSegment { field: &'static str, value: String },
}

/// Composite identity of a watch: `(group, version, resource, namespace, labelSelector, fieldSelector)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchKey {
    pub api_group: String,
    pub api_version: String,
    /// Plural resource name as it appears in the collection path.
    pub resource: String,
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.api_group.is_empty() {
            write!(f, "{}/{}", self.api_version, self.resource)?;
        } else {
            write!(f, "{}/{}/{}", self.api_group, self.api_version, self.resource)?;
        }
        write!(f, "@{}", self.namespace.as_deref().unwrap_or("*"))?;
        let mut sep = '?';
        if let Some(l) = &self.label_selector {
            write!(f, "{}labelSelector={}", sep, l)?;
            sep = '&';
        }
        if let Some(fs) = &self.field_selector {
            write!(f, "{}fieldSelector={}", sep, fs)?;
        }
        Ok(())
    }
}

/// A fully specified watch request: the key fields plus non-key options
/// (`resource_version` start cursor, server-side `timeout_seconds`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchDescriptor {
    pub api_group: String,
    pub api_version: String,
    pub resource: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub label_selector: Option<String>,
    #[serde(default)]
    pub field_selector: Option<String>,
    #[serde(default)]
    pub resource_version: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u32>,
}

impl WatchDescriptor {
    pub fn new(api_group: impl Into<String>, api_version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            api_group: api_group.into(),
            api_version: api_version.into(),
            resource: resource.into(),
            namespace: None,
            label_selector: None,
            field_selector: None,
            resource_version: None,
            timeout_seconds: None,
        }
    }

    pub fn namespace(mut self, ns: impl Into<String>) -> Self { self.namespace = Some(ns.into()); self }
    pub fn labels(mut self, selector: impl Into<String>) -> Self { self.label_selector = Some(selector.into()); self }
    pub fn fields(mut self, selector: impl Into<String>) -> Self { self.field_selector = Some(selector.into()); self }
    pub fn resource_version(mut self, rv: impl Into<String>) -> Self { self.resource_version = Some(rv.into()); self }
    pub fn timeout_seconds(mut self, secs: u32) -> Self { self.timeout_seconds = Some(secs); self }

    pub fn key(&self) -> WatchKey {
        WatchKey {
            api_group: self.api_group.clone(),
            api_version: self.api_version.clone(),
            resource: self.resource.clone(),
            namespace: self.namespace.clone(),
            label_selector: self.label_selector.clone(),
            field_selector: self.field_selector.clone(),
        }
    }

    /// Reject descriptors that cannot form a collection path.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.api_version.is_empty() {
            return Err(DescriptorError::Empty { field: "apiVersion" });
        }
        if self.resource.is_empty() {
            return Err(DescriptorError::Empty { field: "resource" });
        }
        if matches!(self.namespace.as_deref(), Some("")) {
            return Err(DescriptorError::Empty { field: "namespace" });
        }
        let segments = [
            ("apiGroup", self.api_group.as_str()),
            ("apiVersion", self.api_version.as_str()),
            ("resource", self.resource.as_str()),
            ("namespace", self.namespace.as_deref().unwrap_or("")),
        ];
        for (field, value) in segments {
            if value.contains(|c: char| c == '/' || c == '?' || c == '#' || c.is_whitespace()) {
                return Err(DescriptorError::InvalidSegment { field, value: value.to_string() });
            }
        }
        Ok(())
    }

    /// Collection path without query string:
    /// `/apis/{group}/{version}[/namespaces/{ns}]/{plural}`, or `/api/{version}/..` for the core group.
    pub fn collection_path(&self) -> String {
        let mut path = if self.api_group.is_empty() {
            format!("/api/{}", self.api_version)
        } else {
            format!("/apis/{}/{}", self.api_group, self.api_version)
        };
        if let Some(ns) = &self.namespace {
            path.push_str("/namespaces/");
            path.push_str(ns);
        }
        path.push('/');
        path.push_str(&self.resource);
        path
    }
}
