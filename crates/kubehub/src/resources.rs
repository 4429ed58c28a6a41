//! Per-kind convenience layer: binds group/version/plural for the dashboard's
//! resource kinds and forwards everything else to [`WatchRegistry`] unchanged.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tether_core::WatchDescriptor;

use crate::registry::{WatchHandle, WatchRegistry, WatchSink};
use crate::WatchError;

pub const API_GROUP: &str = "tether.dev";
pub const API_VERSION: &str = "v1alpha1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Agent,
    Model,
    Tool,
    Persona,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown resource kind: {0} (expected agents, models, tools or personas)")]
pub struct UnknownKind(pub String);

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [ResourceKind::Agent, ResourceKind::Model, ResourceKind::Tool, ResourceKind::Persona];

    pub fn plural(&self) -> &'static str {
        match self {
            ResourceKind::Agent => "agents",
            ResourceKind::Model => "models",
            ResourceKind::Tool => "tools",
            ResourceKind::Persona => "personas",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ResourceKind::Agent => "Agent",
            ResourceKind::Model => "Model",
            ResourceKind::Tool => "Tool",
            ResourceKind::Persona => "Persona",
        }
    }

    pub fn descriptor(&self, opts: &ResourceWatch) -> WatchDescriptor {
        WatchDescriptor {
            api_group: API_GROUP.to_string(),
            api_version: API_VERSION.to_string(),
            resource: self.plural().to_string(),
            namespace: opts.namespace.clone(),
            label_selector: opts.label_selector.clone(),
            field_selector: opts.field_selector.clone(),
            resource_version: opts.resource_version.clone(),
            timeout_seconds: opts.timeout_seconds,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.plural()) }
}

impl FromStr for ResourceKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        ResourceKind::ALL
            .into_iter()
            .find(|k| k.plural() == lower || k.kind().eq_ignore_ascii_case(&lower))
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// Everything except group/version/plural. Deserializes from query strings
/// (`namespace`, `labelSelector`, `fieldSelector`, `resourceVersion`, `timeoutSeconds`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceWatch {
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

impl ResourceWatch {
    pub fn in_namespace(ns: impl Into<String>) -> Self {
        Self { namespace: Some(ns.into()), ..Default::default() }
    }
}

pub async fn watch_resource<S: WatchSink>(registry: &WatchRegistry, kind: ResourceKind, opts: &ResourceWatch, sink: S) -> WatchHandle {
    registry.start_watch(kind.descriptor(opts), sink).await
}

pub async fn list_resource(registry: &WatchRegistry, kind: ResourceKind, opts: &ResourceWatch) -> Result<serde_json::Value, WatchError> {
    registry.list(&kind.descriptor(opts)).await
}

pub async fn watch_agents<S: WatchSink>(registry: &WatchRegistry, opts: &ResourceWatch, sink: S) -> WatchHandle {
    watch_resource(registry, ResourceKind::Agent, opts, sink).await
}

pub async fn watch_models<S: WatchSink>(registry: &WatchRegistry, opts: &ResourceWatch, sink: S) -> WatchHandle {
    watch_resource(registry, ResourceKind::Model, opts, sink).await
}

pub async fn watch_tools<S: WatchSink>(registry: &WatchRegistry, opts: &ResourceWatch, sink: S) -> WatchHandle {
    watch_resource(registry, ResourceKind::Tool, opts, sink).await
}

pub async fn watch_personas<S: WatchSink>(registry: &WatchRegistry, opts: &ResourceWatch, sink: S) -> WatchHandle {
    watch_resource(registry, ResourceKind::Persona, opts, sink).await
}

pub async fn list_agents(registry: &WatchRegistry, opts: &ResourceWatch) -> Result<serde_json::Value, WatchError> {
    list_resource(registry, ResourceKind::Agent, opts).await
}

pub async fn list_models(registry: &WatchRegistry, opts: &ResourceWatch) -> Result<serde_json::Value, WatchError> {
    list_resource(registry, ResourceKind::Model, opts).await
}

pub async fn list_tools(registry: &WatchRegistry, opts: &ResourceWatch) -> Result<serde_json::Value, WatchError> {
    list_resource(registry, ResourceKind::Tool, opts).await
}

pub async fn list_personas(registry: &WatchRegistry, opts: &ResourceWatch) -> Result<serde_json::Value, WatchError> {
    list_resource(registry, ResourceKind::Persona, opts).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plural_and_singular_names() {
        assert_eq!("agents".parse::<ResourceKind>().unwrap(), ResourceKind::Agent);
        assert_eq!("Persona".parse::<ResourceKind>().unwrap(), ResourceKind::Persona);
        assert!("pods".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn descriptor_binds_group_version_plural() {
        let opts = ResourceWatch { label_selector: Some("team=a".into()), ..ResourceWatch::in_namespace("demo") };
        let d = ResourceKind::Tool.descriptor(&opts);
        assert_eq!(d.collection_path(), "/apis/tether.dev/v1alpha1/namespaces/demo/tools");
        assert_eq!(d.label_selector.as_deref(), Some("team=a"));
    }
}
