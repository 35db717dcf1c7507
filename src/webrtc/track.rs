//! H.264 sample track feeding one viewer.
//!
//! Encoded access units arrive as Annex B; each NAL unit is written
//! separately, without start codes, and the track packetizes to RTP
//! (single NAL / STAP-A / FU-A) internally. SPS/PPS are cached and
//! injected ahead of IDR frames for hardware encoders that do not
//! repeat them.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, trace};
use webrtc::api::media_engine::MIME_TYPE_H264;
use webrtc::media::io::h264_reader::H264Reader;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::Result;

/// H264 RTP clock rate per RFC 6184.
pub const H264_CLOCK_RATE: u32 = 90_000;
/// Fixed payload type of the outgoing stream.
pub const H264_PAYLOAD_TYPE: u8 = 96;
/// Constrained baseline level 3.1, the maximum-compatibility profile
/// the encoder is pinned to.
pub const PROFILE_LEVEL_ID: &str = "42e01f";

/// SDP fmtp line advertised for the video track.
pub fn h264_fmtp_line() -> String {
    format!(
        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id={}",
        PROFILE_LEVEL_ID
    )
}

pub fn h264_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_H264.to_string(),
        clock_rate: H264_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line: h264_fmtp_line(),
        rtcp_feedback: vec![],
    }
}

/// The per-viewer send track.
pub struct H264SampleTrack {
    track: Arc<TrackLocalStaticSample>,
    cached_sps: Mutex<Option<Bytes>>,
    cached_pps: Mutex<Option<Bytes>>,
}

impl H264SampleTrack {
    pub fn new(client_id: &str, camera: &str) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            h264_codec_capability(),
            format!("video-{}", client_id),
            format!("{}-stream", camera),
        ));
        Self {
            track,
            cached_sps: Mutex::new(None),
            cached_pps: Mutex::new(None),
        }
    }

    pub fn as_track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    /// Write one Annex B access unit to the track.
    pub async fn write_access_unit(&self, data: &[u8], is_keyframe: bool) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let cursor = Cursor::new(data);
        let mut reader = H264Reader::new(cursor, 1024 * 1024);

        let mut nals: Vec<Bytes> = Vec::new();
        let mut has_sps = false;
        let mut has_pps = false;
        let mut has_idr = false;

        while let Ok(nal) = reader.next_nal() {
            if nal.data.is_empty() {
                continue;
            }
            let nal_type = nal.data[0] & 0x1f;
            // AUD and filler carry nothing a browser needs
            if nal_type == 9 || nal_type == 12 {
                continue;
            }
            match nal_type {
                5 => has_idr = true,
                7 => {
                    has_sps = true;
                    *self.cached_sps.lock().await = Some(nal.data.clone().freeze());
                }
                8 => {
                    has_pps = true;
                    *self.cached_pps.lock().await = Some(nal.data.clone().freeze());
                }
                _ => {}
            }
            nals.push(nal.data.freeze());
        }

        if has_idr && (!has_sps || !has_pps) {
            let mut injected: Vec<Bytes> = Vec::new();
            if !has_sps {
                if let Some(sps) = self.cached_sps.lock().await.clone() {
                    debug!("injecting cached SPS ahead of IDR");
                    injected.push(sps);
                }
            }
            if !has_pps {
                if let Some(pps) = self.cached_pps.lock().await.clone() {
                    debug!("injecting cached PPS ahead of IDR");
                    injected.push(pps);
                }
            }
            if !injected.is_empty() {
                injected.extend(nals);
                nals = injected;
            }
        }

        for nal in nals {
            let sample = Sample {
                data: nal,
                duration: Duration::from_secs(1),
                ..Default::default()
            };
            if let Err(e) = self.track.write_sample(&sample).await {
                // expected while the peer is still connecting
                trace!("write_sample: {}", e);
            }
        }

        trace!("access unit written (keyframe: {})", is_keyframe);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fmtp_pins_constrained_baseline() {
        let fmtp = h264_fmtp_line();
        assert!(fmtp.contains("profile-level-id=42e01f"));
        assert!(fmtp.contains("packetization-mode=1"));
    }

    #[test]
    fn capability_is_h264_90khz() {
        let cap = h264_codec_capability();
        assert_eq!(cap.mime_type, MIME_TYPE_H264);
        assert_eq!(cap.clock_rate, 90_000);
    }
}
