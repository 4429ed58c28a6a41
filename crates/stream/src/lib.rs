//! Tether push streams: one server-sent event stream per client.
//!
//! A [`PushSession`] owns exactly one [`Transport`]. `send` is the only write
//! path and degrades to `false` once the session is inactive; cleanup runs
//! exactly once when the disconnect signal fires or the session is closed.

#![forbid(unsafe_code)]

pub mod frame;
pub mod mock;
pub mod session;
pub mod transport;

pub use frame::{parse_frames, SseFrame};
pub use mock::RecordingTransport;
pub use session::{PushSession, SessionOptions, CONNECTION_EVENT, ERROR_EVENT, HEARTBEAT_EVENT};
pub use transport::{channel, ChannelTransport, Transport, TransportError};
