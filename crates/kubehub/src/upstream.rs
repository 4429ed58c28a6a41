use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use kube::{
    api::{ListParams, WatchParams},
    core::Request,
    Client,
};
use tether_core::WatchDescriptor;
use tracing::{debug, info};

use crate::WatchError;

/// Raw watch response body: newline-delimited JSON split at arbitrary chunk boundaries.
pub type ByteStream = BoxStream<'static, Result<Bytes, WatchError>>;

/// The orchestration API, treated as a black box exposing `list` and `watch`.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Open a watch on the descriptor's collection. Resolves once the response
    /// has started; errors here are connection-establishment failures.
    async fn watch(&self, descriptor: &WatchDescriptor) -> Result<ByteStream, WatchError>;

    /// List the descriptor's collection (a `*List` object with `metadata.resourceVersion`).
    async fn list(&self, descriptor: &WatchDescriptor) -> Result<serde_json::Value, WatchError>;
}

/// Control plane backed by a kube-rs client (kubeconfig or in-cluster config).
#[derive(Clone)]
pub struct KubeControlPlane {
    client: Client,
}

impl KubeControlPlane {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        info!("kube client ready");
        Ok(Self::new(client))
    }

    fn watch_params(d: &WatchDescriptor) -> WatchParams {
        let mut wp = WatchParams::default().disable_bookmarks();
        if let Some(l) = d.label_selector.as_deref() { wp = wp.labels(l); }
        if let Some(f) = d.field_selector.as_deref() { wp = wp.fields(f); }
        if let Some(t) = d.timeout_seconds { wp = wp.timeout(t); }
        wp
    }

    fn list_params(d: &WatchDescriptor) -> ListParams {
        let mut lp = ListParams::default();
        if let Some(l) = d.label_selector.as_deref() { lp = lp.labels(l); }
        if let Some(f) = d.field_selector.as_deref() { lp = lp.fields(f); }
        lp
    }
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    async fn watch(&self, descriptor: &WatchDescriptor) -> Result<ByteStream, WatchError> {
        use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};
        descriptor.validate()?;
        let path = descriptor.collection_path();
        // "0" asks for any cached state: initial ADDED events followed by changes
        let version = descriptor.resource_version.as_deref().unwrap_or("0");
        let req = Request::new(path.as_str())
            .watch(&Self::watch_params(descriptor), version)
            .map_err(|e| WatchError::Connect(e.to_string()))?;
        debug!(path = %path, rv = %version, "opening watch request");
        let reader = self.client.request_stream(req).await?;
        // futures AsyncBufRead -> tokio AsyncRead -> Bytes stream
        let stream = ReaderStream::new(reader.compat()).map_err(|e| WatchError::Stream(e.to_string()));
        Ok(stream.boxed())
    }

    async fn list(&self, descriptor: &WatchDescriptor) -> Result<serde_json::Value, WatchError> {
        descriptor.validate()?;
        let req = Request::new(descriptor.collection_path())
            .list(&Self::list_params(descriptor))
            .map_err(|e| WatchError::Connect(e.to_string()))?;
        let list = self.client.request::<serde_json::Value>(req).await?;
        Ok(list)
    }
}
