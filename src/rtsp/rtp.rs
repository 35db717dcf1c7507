//! RTP parsing and H.264/H.265 depacketization.
//!
//! Packets are reassembled into Annex B access units: every NAL unit of
//! one timestamp, each prefixed with a four-byte start code. An access
//! unit is emitted when the marker bit closes it or the timestamp moves
//! on.

use tracing::{debug, trace};

use super::sdp::VideoCodec;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Fixed fields of an RTP header we care about.
#[derive(Debug, Clone, Copy)]
pub struct RtpHeader {
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub marker: bool,
    pub ssrc: u32,
}

/// Parse an RTP packet, returning the header and the payload slice.
/// Handles CSRC lists, header extensions and padding. Returns `None`
/// for anything malformed.
pub fn parse_packet(packet: &[u8]) -> Option<(RtpHeader, &[u8])> {
    if packet.len() < 12 {
        return None;
    }
    let version = packet[0] >> 6;
    if version != 2 {
        return None;
    }
    let has_padding = packet[0] & 0x20 != 0;
    let has_extension = packet[0] & 0x10 != 0;
    let csrc_count = (packet[0] & 0x0f) as usize;
    let marker = packet[1] & 0x80 != 0;
    let payload_type = packet[1] & 0x7f;
    let sequence = u16::from_be_bytes([packet[2], packet[3]]);
    let timestamp = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
    let ssrc = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);

    let mut offset = 12 + csrc_count * 4;
    if packet.len() < offset {
        return None;
    }
    if has_extension {
        if packet.len() < offset + 4 {
            return None;
        }
        let ext_words = u16::from_be_bytes([packet[offset + 2], packet[offset + 3]]) as usize;
        offset += 4 + ext_words * 4;
        if packet.len() < offset {
            return None;
        }
    }
    let mut end = packet.len();
    if has_padding {
        let pad = *packet.last()? as usize;
        if pad == 0 || pad > end - offset {
            return None;
        }
        end -= pad;
    }

    Some((
        RtpHeader {
            payload_type,
            sequence,
            timestamp,
            marker,
            ssrc,
        },
        &packet[offset..end],
    ))
}

/// One reassembled access unit in Annex B form.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub data: Vec<u8>,
    /// RTP timestamp (90 kHz clock for both codec families).
    pub timestamp: u32,
}

/// Codec-dispatching depacketizer.
pub enum Depacketizer {
    H264(H264Depacketizer),
    H265(H265Depacketizer),
}

impl Depacketizer {
    pub fn new(codec: VideoCodec) -> Self {
        match codec {
            VideoCodec::H264 => Depacketizer::H264(H264Depacketizer::default()),
            VideoCodec::H265 => Depacketizer::H265(H265Depacketizer::default()),
        }
    }

    /// Feed one RTP packet; returns a finished access unit when the
    /// packet completes one.
    pub fn push(&mut self, header: &RtpHeader, payload: &[u8]) -> Option<AccessUnit> {
        match self {
            Depacketizer::H264(d) => d.push(header, payload),
            Depacketizer::H265(d) => d.push(header, payload),
        }
    }

    /// Drop any partial state, e.g. after a reconnect.
    pub fn reset(&mut self) {
        match self {
            Depacketizer::H264(d) => *d = H264Depacketizer::default(),
            Depacketizer::H265(d) => *d = H265Depacketizer::default(),
        }
    }
}

/// Shared access-unit accumulator.
#[derive(Default)]
struct AuAssembler {
    data: Vec<u8>,
    timestamp: Option<u32>,
    last_sequence: Option<u16>,
    broken: bool,
}

impl AuAssembler {
    /// Returns a finished unit if `timestamp` starts a new one.
    fn roll_over(&mut self, timestamp: u32) -> Option<AccessUnit> {
        let finished = match self.timestamp {
            Some(ts) if ts != timestamp => self.take(),
            _ => None,
        };
        self.timestamp = Some(timestamp);
        finished
    }

    fn observe_sequence(&mut self, sequence: u16) {
        if let Some(last) = self.last_sequence {
            if sequence.wrapping_sub(last) != 1 {
                debug!(
                    "RTP sequence gap: {} -> {}, access unit will be dropped",
                    last, sequence
                );
                self.broken = true;
            }
        }
        self.last_sequence = Some(sequence);
    }

    fn push_nal(&mut self, nal: &[u8]) {
        if nal.is_empty() {
            return;
        }
        self.data.extend_from_slice(&START_CODE);
        self.data.extend_from_slice(nal);
    }

    fn take(&mut self) -> Option<AccessUnit> {
        let timestamp = self.timestamp?;
        let data = std::mem::take(&mut self.data);
        let broken = std::mem::replace(&mut self.broken, false);
        self.timestamp = None;
        if broken || data.is_empty() {
            return None;
        }
        Some(AccessUnit { data, timestamp })
    }
}

/// RFC 6184 depacketizer: single NAL units, STAP-A, FU-A.
#[derive(Default)]
pub struct H264Depacketizer {
    au: AuAssembler,
    fragment: Vec<u8>,
}

impl H264Depacketizer {
    pub fn push(&mut self, header: &RtpHeader, payload: &[u8]) -> Option<AccessUnit> {
        if payload.is_empty() {
            return None;
        }
        let finished = self.au.roll_over(header.timestamp);
        self.au.observe_sequence(header.sequence);

        let nal_type = payload[0] & 0x1f;
        match nal_type {
            1..=23 => self.au.push_nal(payload),
            24 => self.push_stap_a(&payload[1..]),
            28 => self.push_fu_a(payload),
            other => {
                trace!("ignoring H264 packetization type {}", other);
            }
        }

        if header.marker {
            return finished.or_else(|| self.au.take());
        }
        finished
    }

    fn push_stap_a(&mut self, mut rest: &[u8]) {
        while rest.len() >= 2 {
            let size = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            rest = &rest[2..];
            if size == 0 || rest.len() < size {
                self.au.broken = true;
                return;
            }
            self.au.push_nal(&rest[..size]);
            rest = &rest[size..];
        }
    }

    fn push_fu_a(&mut self, payload: &[u8]) {
        if payload.len() < 2 {
            self.au.broken = true;
            return;
        }
        let indicator = payload[0];
        let fu_header = payload[1];
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;

        if start {
            self.fragment.clear();
            // reconstructed NAL header: F/NRI from the indicator, type
            // from the FU header
            self.fragment.push((indicator & 0xe0) | (fu_header & 0x1f));
        } else if self.fragment.is_empty() {
            // middle of a fragment we never saw the start of
            self.au.broken = true;
            return;
        }
        self.fragment.extend_from_slice(&payload[2..]);
        if end {
            let nal = std::mem::take(&mut self.fragment);
            self.au.push_nal(&nal);
        }
    }
}

/// RFC 7798 depacketizer: single NAL units, aggregation (48),
/// fragmentation (49).
#[derive(Default)]
pub struct H265Depacketizer {
    au: AuAssembler,
    fragment: Vec<u8>,
}

impl H265Depacketizer {
    pub fn push(&mut self, header: &RtpHeader, payload: &[u8]) -> Option<AccessUnit> {
        if payload.len() < 2 {
            return None;
        }
        let finished = self.au.roll_over(header.timestamp);
        self.au.observe_sequence(header.sequence);

        let nal_type = (payload[0] >> 1) & 0x3f;
        match nal_type {
            48 => self.push_aggregation(&payload[2..]),
            49 => self.push_fu(payload),
            _ => self.au.push_nal(payload),
        }

        if header.marker {
            return finished.or_else(|| self.au.take());
        }
        finished
    }

    fn push_aggregation(&mut self, mut rest: &[u8]) {
        while rest.len() >= 2 {
            let size = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            rest = &rest[2..];
            if size == 0 || rest.len() < size {
                self.au.broken = true;
                return;
            }
            self.au.push_nal(&rest[..size]);
            rest = &rest[size..];
        }
    }

    fn push_fu(&mut self, payload: &[u8]) {
        if payload.len() < 3 {
            self.au.broken = true;
            return;
        }
        let fu_header = payload[2];
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;
        let nal_type = fu_header & 0x3f;

        if start {
            self.fragment.clear();
            // rebuild the two-byte NAL header with the real type
            self.fragment.push((payload[0] & 0x81) | (nal_type << 1));
            self.fragment.push(payload[1]);
        } else if self.fragment.is_empty() {
            self.au.broken = true;
            return;
        }
        self.fragment.extend_from_slice(&payload[3..]);
        if end {
            let nal = std::mem::take(&mut self.fragment);
            self.au.push_nal(&nal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtp(seq: u16, ts: u32, marker: bool, payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0x80, if marker { 0x80 | 96 } else { 96 }];
        pkt.extend_from_slice(&seq.to_be_bytes());
        pkt.extend_from_slice(&ts.to_be_bytes());
        pkt.extend_from_slice(&0x1234_5678u32.to_be_bytes());
        pkt.extend_from_slice(payload);
        pkt
    }

    #[test]
    fn parses_plain_header() {
        let pkt = rtp(7, 9000, true, &[0x41, 0xaa]);
        let (header, payload) = parse_packet(&pkt).unwrap();
        assert_eq!(header.payload_type, 96);
        assert_eq!(header.sequence, 7);
        assert_eq!(header.timestamp, 9000);
        assert!(header.marker);
        assert_eq!(payload, &[0x41, 0xaa]);
    }

    #[test]
    fn parses_padding_and_csrc() {
        // version 2, padding, 1 CSRC
        let mut pkt = vec![0x80 | 0x20 | 0x01, 96];
        pkt.extend_from_slice(&1u16.to_be_bytes());
        pkt.extend_from_slice(&100u32.to_be_bytes());
        pkt.extend_from_slice(&1u32.to_be_bytes());
        pkt.extend_from_slice(&0xdeadbeefu32.to_be_bytes()); // CSRC
        pkt.extend_from_slice(&[0x41, 0x01, 0x02]);
        pkt.extend_from_slice(&[0, 0, 3]); // 3 bytes padding
        let (_, payload) = parse_packet(&pkt).unwrap();
        assert_eq!(payload, &[0x41, 0x01, 0x02]);
    }

    #[test]
    fn rejects_truncated() {
        assert!(parse_packet(&[0x80, 96, 0]).is_none());
    }

    #[test]
    fn single_nal_unit_on_marker() {
        let mut d = H264Depacketizer::default();
        let (h, p) = {
            let pkt = rtp(1, 1000, true, &[0x65, 0x11, 0x22]);
            let parsed = parse_packet(&pkt).unwrap();
            (parsed.0, parsed.1.to_vec())
        };
        let au = d.push(&h, &p).unwrap();
        assert_eq!(au.timestamp, 1000);
        assert_eq!(au.data, [0, 0, 0, 1, 0x65, 0x11, 0x22]);
    }

    #[test]
    fn stap_a_splits_nals() {
        let mut d = H264Depacketizer::default();
        // STAP-A carrying SPS (2 bytes) and PPS (2 bytes)
        let payload = [0x18, 0x00, 0x02, 0x67, 0x42, 0x00, 0x02, 0x68, 0xce];
        let pkt = rtp(1, 2000, true, &payload);
        let (h, p) = parse_packet(&pkt).unwrap();
        let au = d.push(&h, p).unwrap();
        assert_eq!(
            au.data,
            [0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xce]
        );
    }

    #[test]
    fn fu_a_reassembles() {
        let mut d = H264Depacketizer::default();
        // IDR (type 5, NRI 3) fragmented over three packets
        let start = rtp(1, 3000, false, &[0x7c, 0x85, 0xaa]);
        let middle = rtp(2, 3000, false, &[0x7c, 0x05, 0xbb]);
        let end = rtp(3, 3000, true, &[0x7c, 0x45, 0xcc]);

        for pkt in [&start, &middle] {
            let (h, p) = parse_packet(pkt).unwrap();
            assert!(d.push(&h, p).is_none());
        }
        let (h, p) = parse_packet(&end).unwrap();
        let au = d.push(&h, p).unwrap();
        assert_eq!(au.data, [0, 0, 0, 1, 0x65, 0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn sequence_gap_drops_unit() {
        let mut d = H264Depacketizer::default();
        let first = rtp(1, 4000, false, &[0x7c, 0x85, 0xaa]);
        // sequence jumps from 1 to 3
        let last = rtp(3, 4000, true, &[0x7c, 0x45, 0xcc]);
        let (h, p) = parse_packet(&first).unwrap();
        assert!(d.push(&h, p).is_none());
        let (h, p) = parse_packet(&last).unwrap();
        assert!(d.push(&h, p).is_none());
    }

    #[test]
    fn timestamp_change_flushes_previous_unit() {
        let mut d = H264Depacketizer::default();
        // unit at ts=5000 without marker (some cameras never set it)
        let first = rtp(1, 5000, false, &[0x41, 0x01]);
        let (h, p) = parse_packet(&first).unwrap();
        assert!(d.push(&h, p).is_none());
        // next timestamp flushes it
        let second = rtp(2, 5100, false, &[0x41, 0x02]);
        let (h, p) = parse_packet(&second).unwrap();
        let au = d.push(&h, p).unwrap();
        assert_eq!(au.timestamp, 5000);
        assert_eq!(au.data, [0, 0, 0, 1, 0x41, 0x01]);
    }

    #[test]
    fn h265_fragmentation_unit() {
        let mut d = H265Depacketizer::default();
        // FU carrying an IDR_W_RADL (type 19)
        let fu_indicator = [49u8 << 1, 0x01];
        let start = rtp(1, 6000, false, &[fu_indicator[0], fu_indicator[1], 0x80 | 19, 0xaa]);
        let end = rtp(2, 6000, true, &[fu_indicator[0], fu_indicator[1], 0x40 | 19, 0xbb]);
        let (h, p) = parse_packet(&start).unwrap();
        assert!(d.push(&h, p).is_none());
        let (h, p) = parse_packet(&end).unwrap();
        let au = d.push(&h, p).unwrap();
        assert_eq!(au.data, [0, 0, 0, 1, 19 << 1, 0x01, 0xaa, 0xbb]);
    }
}
