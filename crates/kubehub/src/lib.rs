//! Tether kubehub: control-plane watch wiring.
//!
//! - [`ControlPlane`]: seam over the orchestration API (`watch` + `list`), with a
//!   kube-backed implementation and an in-memory mock.
//! - [`WatchRegistry`]: owns long-lived watch connections keyed by [`WatchKey`] and
//!   delivers decoded envelopes only while the key is still registered.
//! - [`resources`]: per-kind convenience layer over the registry.

#![forbid(unsafe_code)]

pub mod mock;
mod pump;
pub mod registry;
pub mod resources;
mod upstream;

pub use mock::{MockControlPlane, MockFeed};
pub use registry::{callbacks, Callbacks, WatchHandle, WatchRegistry, WatchSink, WatchState};
pub use resources::{ResourceKind, ResourceWatch};
pub use upstream::{ByteStream, ControlPlane, KubeControlPlane};

pub use tether_core::{Envelope, EventKind, WatchDescriptor, WatchKey};

/// Failures a watch can report through `on_error`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WatchError {
    #[error("invalid descriptor: {0}")]
    Descriptor(#[from] tether_core::DescriptorError),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("watch stream failed: {0}")]
    Stream(String),
}

impl WatchError {
    /// True when the error came from establishing the connection (nothing was registered).
    pub fn is_connect(&self) -> bool {
        matches!(self, WatchError::Descriptor(_) | WatchError::Connect(_))
    }
}

impl From<kube::Error> for WatchError {
    fn from(e: kube::Error) -> Self { WatchError::Connect(e.to_string()) }
}
