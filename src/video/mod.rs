//! Per-camera media path: DMA-BUF frames, hardware decode, NV12
//! normalization, hardware H.264 re-encode and the multi-viewer fan-out
//! pipeline.

pub mod convert;
pub mod decoder;
pub mod encoder;
pub mod frame;
pub mod pipeline;
pub mod source;

pub use frame::{DmaFormat, DmaFrame, FrameQueue, WaitQueue};
pub use pipeline::{EncodedVideoFrame, VideoPipeline};
pub use source::{FrameSource, ProbeResult, StreamInfo, VideoCodec};
