//! Room-keyed signaling: the JSON envelope, the WebSocket channel a
//! camera keeps to its room, and the per-camera endpoint that routes
//! messages to viewer sessions.

pub mod channel;
pub mod endpoint;
pub mod envelope;

pub use channel::{SignalingTransport, TransportEvent, WsSignalingChannel};
pub use endpoint::{SignalingEndpoint, SignalingSender};
pub use envelope::{Envelope, MessageType, RetCode, Sender, room_from_path};
