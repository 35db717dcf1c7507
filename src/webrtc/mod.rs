//! Per-viewer WebRTC: the H.264 track, the branch spliced onto the
//! camera pipeline, and the session controller driving SDP/ICE.

pub mod branch;
pub mod config;
pub mod session;
pub mod track;

pub use branch::PeerBranch;
pub use config::{TurnServer, WebRtcConfig};
pub use session::{
    IceCandidateMsg, SessionController, SessionEvent, SessionHandle, SessionMachine, SessionState,
};
pub use track::H264SampleTrack;
