//! Interpretation of the SDP returned by DESCRIBE: the first video
//! substream's codec, its control URL, and any out-of-band parameter
//! sets or framerate hints.

use base64::Engine;

use crate::error::{AppError, Result};

/// Codec family of a video substream. Anything else a camera may serve
/// (MJPEG and friends) is rejected at probe time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoCodec::H264 => write!(f, "H.264"),
            VideoCodec::H265 => write!(f, "H.265"),
        }
    }
}

/// What the media description tells us about the first video substream.
#[derive(Debug, Clone)]
pub struct VideoDescription {
    pub codec: VideoCodec,
    pub payload_type: u8,
    /// Control URL for SETUP, absolute or relative to the content base.
    pub control: Option<String>,
    /// `a=framerate` hint, as a rational.
    pub framerate: Option<(u32, u32)>,
    /// Parameter-set NAL units from `sprop-*` fmtp fields, without
    /// start codes. Primes the decoder before in-band sets arrive.
    pub parameter_sets: Vec<Vec<u8>>,
}

/// Parse the DESCRIBE body and extract the first video substream.
pub fn parse_video_description(body: &[u8]) -> Result<VideoDescription> {
    let session = sdp_types::Session::parse(body)
        .map_err(|e| AppError::Rtsp(format!("SDP parse failed: {}", e)))?;

    let media = session
        .medias
        .iter()
        .find(|m| m.media.eq_ignore_ascii_case("video"))
        .ok_or_else(|| AppError::Rtsp("no video substream in SDP".into()))?;

    let rtpmap = attribute(media, "rtpmap")
        .ok_or_else(|| AppError::Rtsp("video substream carries no rtpmap".into()))?;
    let (payload_type, encoding) = parse_rtpmap(rtpmap)?;

    let codec = match encoding.to_ascii_uppercase().as_str() {
        "H264" => VideoCodec::H264,
        "H265" | "HEVC" => VideoCodec::H265,
        other => {
            return Err(AppError::UnsupportedCodec {
                codec: other.to_string(),
            })
        }
    };

    let control = attribute(media, "control").map(|s| s.to_string());
    let framerate = attribute(media, "framerate").and_then(parse_framerate);

    let mut parameter_sets = Vec::new();
    if let Some(fmtp) = attribute(media, "fmtp") {
        for key in ["sprop-parameter-sets", "sprop-vps", "sprop-sps", "sprop-pps"] {
            if let Some(value) = fmtp_field(fmtp, key) {
                for item in value.split(',') {
                    if let Ok(nal) =
                        base64::engine::general_purpose::STANDARD.decode(item.trim())
                    {
                        if !nal.is_empty() {
                            parameter_sets.push(nal);
                        }
                    }
                }
            }
        }
    }

    Ok(VideoDescription {
        codec,
        payload_type,
        control,
        framerate,
        parameter_sets,
    })
}

fn attribute<'a>(media: &'a sdp_types::Media, name: &str) -> Option<&'a str> {
    media
        .attributes
        .iter()
        .find(|a| a.attribute.eq_ignore_ascii_case(name))
        .and_then(|a| a.value.as_deref())
}

fn parse_rtpmap(value: &str) -> Result<(u8, &str)> {
    // "96 H264/90000"
    let mut parts = value.split_whitespace();
    let pt = parts
        .next()
        .and_then(|p| p.parse::<u8>().ok())
        .ok_or_else(|| AppError::Rtsp(format!("bad rtpmap: {}", value)))?;
    let encoding = parts
        .next()
        .and_then(|rest| rest.split('/').next())
        .ok_or_else(|| AppError::Rtsp(format!("bad rtpmap: {}", value)))?;
    Ok((pt, encoding))
}

fn parse_framerate(value: &str) -> Option<(u32, u32)> {
    let value = value.trim();
    if let Some((num, den)) = value.split_once('/') {
        let num = num.trim().parse::<u32>().ok()?;
        let den = den.trim().parse::<u32>().ok()?;
        return (num > 0 && den > 0).then_some((num, den));
    }
    if let Ok(fps) = value.parse::<u32>() {
        return (fps > 0).then_some((fps, 1));
    }
    // fractional, e.g. "29.97"
    let fps = value.parse::<f64>().ok()?;
    if fps <= 0.0 {
        return None;
    }
    Some(((fps * 1000.0).round() as u32, 1000))
}

/// Extract one key from an fmtp attribute value, e.g.
/// `96 packetization-mode=1;sprop-parameter-sets=Z0IA...,aM4...`.
fn fmtp_field<'a>(fmtp: &'a str, key: &str) -> Option<&'a str> {
    let params = fmtp.split_once(' ').map(|(_, p)| p).unwrap_or(fmtp);
    for item in params.split(';') {
        let (k, v) = item.trim().split_once('=')?;
        if k.eq_ignore_ascii_case(key) {
            return Some(v);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const H264_SDP: &str = "v=0\r\n\
o=- 0 0 IN IP4 10.0.0.5\r\n\
s=Media Presentation\r\n\
c=IN IP4 0.0.0.0\r\n\
t=0 0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=control:trackID=1\r\n\
a=rtpmap:96 H264/90000\r\n\
a=framerate:25\r\n\
a=fmtp:96 packetization-mode=1;profile-level-id=42e01f;sprop-parameter-sets=Z0LgH9oBQBbsBEAAAAMAQAAADCPGDKg=,aM48gA==\r\n\
m=audio 0 RTP/AVP 97\r\n\
a=rtpmap:97 MPEG4-GENERIC/16000/1\r\n";

    #[test]
    fn parses_h264_video_media() {
        let desc = parse_video_description(H264_SDP.as_bytes()).unwrap();
        assert_eq!(desc.codec, VideoCodec::H264);
        assert_eq!(desc.payload_type, 96);
        assert_eq!(desc.control.as_deref(), Some("trackID=1"));
        assert_eq!(desc.framerate, Some((25, 1)));
        // SPS + PPS decoded from sprop-parameter-sets
        assert_eq!(desc.parameter_sets.len(), 2);
        assert_eq!(desc.parameter_sets[0][0] & 0x1f, 7);
        assert_eq!(desc.parameter_sets[1][0] & 0x1f, 8);
    }

    #[test]
    fn rejects_unsupported_codec() {
        let sdp = "v=0\r\n\
o=- 0 0 IN IP4 0.0.0.0\r\n\
s=-\r\n\
t=0 0\r\n\
m=video 0 RTP/AVP 26\r\n\
a=rtpmap:26 JPEG/90000\r\n";
        match parse_video_description(sdp.as_bytes()) {
            Err(AppError::UnsupportedCodec { codec }) => assert_eq!(codec, "JPEG"),
            other => panic!("expected UnsupportedCodec, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn missing_video_media_is_an_error() {
        let sdp = "v=0\r\n\
o=- 0 0 IN IP4 0.0.0.0\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 0 RTP/AVP 0\r\n\
a=rtpmap:0 PCMU/8000\r\n";
        assert!(parse_video_description(sdp.as_bytes()).is_err());
    }

    #[test]
    fn fractional_framerate() {
        assert_eq!(parse_framerate("29.97"), Some((29970, 1000)));
        assert_eq!(parse_framerate("30000/1001"), Some((30000, 1001)));
        assert_eq!(parse_framerate("0"), None);
    }
}
