//! RTSP source plumbing: a blocking client for camera sessions, SDP
//! interpretation, and RTP depacketization back to Annex B access units.

pub mod client;
pub mod rtp;
pub mod sdp;
pub mod sps;

pub use client::RtspClient;
pub use rtp::{AccessUnit, Depacketizer};
pub use sdp::{VideoCodec, VideoDescription};
