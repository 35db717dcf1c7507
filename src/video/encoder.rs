//! H.264 re-encode stage on top of hwcodec (FFmpeg wrapper).
//!
//! The contract towards WebRTC is fixed: constrained-baseline level
//! 3.1, CBR with frame-level rate control, closed GOPs keyed on demand
//! only (no forced keyframe interval), Annex B output.

use std::sync::Once;

use hwcodec::common::{DataFormat, Quality, RateControl};
use hwcodec::ffmpeg::AVPixelFormat;
use hwcodec::ffmpeg_ram::encode::{EncodeContext, Encoder as HwEncoder};
use hwcodec::ffmpeg_ram::CodecInfo;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};

/// Keyframes are produced on request only; the interval just has to be
/// out of the way.
const ON_DEMAND_GOP: i32 = i32::MAX;

static INIT_LOGGING: Once = Once::new();

fn init_hwcodec_logging() {
    INIT_LOGGING.call_once(|| {
        // hwcodec logs through the `log` facade; our tracing subscriber
        // picks it up
        debug!("hwcodec logging initialized");
    });
}

/// One encoded H.264 access unit.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    /// Annex B byte stream.
    pub data: Vec<u8>,
    pub pts_ms: i64,
    pub key: bool,
}

/// The encode stage of the media graph. Object-safe so the pipeline
/// can be exercised with a stub in tests.
pub trait VideoEncoder: Send {
    /// Encode one packed NV12 frame.
    fn encode(&mut self, nv12: &[u8], pts_ms: i64) -> Result<Vec<EncodedPacket>>;
    /// Make the next frame an IDR.
    fn request_keyframe(&mut self);
    fn codec_name(&self) -> &str;
}

/// Factory signature the pipeline uses to build its encoder lazily.
pub type EncoderFactory = dyn Fn() -> Result<Box<dyn VideoEncoder>> + Send + Sync;

/// List the H.264 encoders hwcodec can open at this geometry.
pub fn available_h264_encoders(width: u32, height: u32) -> Vec<CodecInfo> {
    init_hwcodec_logging();
    let ctx = probe_context(width, height);
    HwEncoder::available_encoders(ctx, None)
}

fn probe_context(width: u32, height: u32) -> EncodeContext {
    EncodeContext {
        name: String::new(),
        mc_name: None,
        width: width as i32,
        height: height as i32,
        pixfmt: AVPixelFormat::AV_PIX_FMT_NV12,
        align: 1,
        fps: 30,
        gop: 30,
        rc: RateControl::RC_CBR,
        quality: Quality::Quality_Low,
        kbs: 2000,
        q: 23,
        thread_count: 4,
    }
}

/// Pick the best available H.264 codec name, hardware first. The SoC
/// decoders this node targets pair with rkmpp or v4l2m2m encoders;
/// anything else present (vaapi, software) still works.
pub fn detect_h264_encoder(width: u32, height: u32) -> Option<String> {
    let encoders = available_h264_encoders(width, height);
    if encoders.is_empty() {
        warn!("no H.264 encoder available from hwcodec");
        return None;
    }

    let h264: Vec<&CodecInfo> = encoders
        .iter()
        .filter(|c| c.format == DataFormat::H264)
        .collect();
    for preferred in ["rkmpp", "v4l2m2m", "vaapi"] {
        if let Some(codec) = h264.iter().find(|c| c.name.contains(preferred)) {
            return Some(codec.name.clone());
        }
    }
    h264.first().map(|c| c.name.clone())
}

/// Hardware H.264 encoder consuming packed NV12.
pub struct H264Encoder {
    inner: HwEncoder,
    codec_name: String,
    /// Exact input buffer length hwcodec expects.
    frame_len: usize,
}

impl H264Encoder {
    /// Open the best available encoder for this geometry.
    pub fn new(width: u32, height: u32, fps: u32, bitrate_kbps: u32) -> Result<Self> {
        let codec_name = detect_h264_encoder(width, height)
            .ok_or_else(|| AppError::Video("no H.264 encoder available".into()))?;
        Self::with_codec(&codec_name, width, height, fps, bitrate_kbps)
    }

    pub fn with_codec(
        codec_name: &str,
        width: u32,
        height: u32,
        fps: u32,
        bitrate_kbps: u32,
    ) -> Result<Self> {
        init_hwcodec_logging();

        let ctx = EncodeContext {
            name: codec_name.to_string(),
            mc_name: None,
            width: width as i32,
            height: height as i32,
            pixfmt: AVPixelFormat::AV_PIX_FMT_NV12,
            align: 1,
            fps: fps as i32,
            gop: ON_DEMAND_GOP,
            rc: RateControl::RC_CBR,
            quality: Quality::Quality_Low,
            kbs: bitrate_kbps as i32,
            q: 23,
            thread_count: 4,
        };

        let inner = HwEncoder::new(ctx)
            .map_err(|_| AppError::Video(format!("failed to create encoder {}", codec_name)))?;
        let frame_len = inner.length as usize;

        info!(
            "H.264 encoder {} ready: {}x{} @ {} fps, {} kbps CBR, keyed on demand",
            codec_name, width, height, fps, bitrate_kbps
        );

        Ok(Self {
            inner,
            codec_name: codec_name.to_string(),
            frame_len,
        })
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }
}

// SAFETY: the wrapped FFmpeg context holds raw pointers that never
// escape this struct; encoding is driven from exactly one thread.
unsafe impl Send for H264Encoder {}

impl VideoEncoder for H264Encoder {
    fn encode(&mut self, nv12: &[u8], pts_ms: i64) -> Result<Vec<EncodedPacket>> {
        if nv12.len() < self.frame_len {
            return Err(AppError::Video(format!(
                "frame data too small: {} < {}",
                nv12.len(),
                self.frame_len
            )));
        }
        match self.inner.encode(nv12, pts_ms) {
            Ok(frames) => Ok(frames
                .drain(..)
                .map(|f| EncodedPacket {
                    data: f.data,
                    pts_ms: f.pts,
                    key: f.key == 1,
                })
                .collect()),
            Err(e) => Err(AppError::Video(format!("encode failed: {}", e))),
        }
    }

    fn request_keyframe(&mut self) {
        self.inner.request_keyframe();
    }

    fn codec_name(&self) -> &str {
        &self.codec_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_detection_runs() {
        // hardware presence varies; only the call contract is checked
        let name = detect_h264_encoder(1280, 720);
        if let Some(ref name) = name {
            assert!(!name.is_empty());
        }
    }
}
