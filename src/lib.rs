//! camgate - multi-camera RTSP ingestion and WebRTC distribution node
//!
//! Each camera is a remote RTSP source; each viewer is a WebRTC peer.
//! One hardware-transcoded H.264 stream per camera is shared across all
//! of its viewers. Network and hardware faults are recovered in place,
//! without restarting the process or disturbing other cameras.

pub mod camera;
pub mod config;
pub mod error;
pub mod rtsp;
pub mod signaling;
pub mod video;
pub mod webrtc;

pub use error::{AppError, Result};
