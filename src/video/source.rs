//! FrameSource: RTSP probe, steady-state ingestion and reconnect.
//!
//! The probe learns the codec from the media description and the
//! geometry (plus framerate, when available) from the parsed elementary
//! stream, bounded per attempt and retried. Steady state runs two
//! workers: a reader thread demuxing RTP into access units, and a
//! decode thread turning them into DMA-BUF frames. Consumers only ever
//! see the frame queue; failures surface as a timestamp gap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

pub use crate::rtsp::sdp::VideoCodec;

use crate::config::CameraConfig;
use crate::error::{AppError, Result};
use crate::rtsp::client::{RtspClient, SessionData};
use crate::rtsp::rtp::{parse_packet, AccessUnit, Depacketizer};
use crate::rtsp::sdp::{parse_video_description, VideoDescription};
use crate::rtsp::sps;
use crate::video::decoder::M2mDecoder;
use crate::video::frame::{FrameQueue, WaitQueue};

const AU_QUEUE_DEPTH: usize = 16;
const STOP_POLL: Duration = Duration::from_millis(100);
const RTP_CLOCK_HZ: u64 = 90_000;
/// Access-unit deltas sampled when the SPS carries no timing info.
const FRAMERATE_SAMPLES: usize = 4;

/// What the probe has learned so far. `ready` only once the codec and
/// the full mode line are known.
#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
    pub codec: Option<VideoCodec>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub framerate: Option<(u32, u32)>,
    pub profile: Option<String>,
}

impl ProbeResult {
    pub fn ready(&self) -> bool {
        self.codec.is_some()
            && self.width.is_some()
            && self.height.is_some()
            && self.framerate.is_some()
    }
}

/// A completed probe: everything the media graph needs to build.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub framerate: (u32, u32),
    pub profile: Option<String>,
    description: VideoDescription,
}

impl StreamInfo {
    pub fn fps(&self) -> f64 {
        self.framerate.0 as f64 / self.framerate.1 as f64
    }
}

enum SourceItem {
    Unit { data: Vec<u8>, pts_ms: i64 },
    /// Stream restarted; the decoder must be rebuilt.
    Reset,
}

/// 32-bit RTP timestamps unwrapped onto a monotonic 64-bit clock.
#[derive(Default)]
struct TimestampUnwrapper {
    last: Option<u32>,
    extended: u64,
}

impl TimestampUnwrapper {
    fn extend(&mut self, ts: u32) -> u64 {
        if let Some(last) = self.last {
            self.extended = self.extended.wrapping_add(ts.wrapping_sub(last) as u64);
        }
        self.last = Some(ts);
        self.extended
    }
}

/// Per-camera RTSP ingestion worker pair.
pub struct FrameSource {
    config: CameraConfig,
    frames: Arc<FrameQueue>,
    au_queue: Arc<WaitQueue<SourceItem>>,
    stop: Arc<AtomicBool>,
    decode_error: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    decoder: Option<JoinHandle<()>>,
}

impl FrameSource {
    pub fn new(config: CameraConfig) -> Self {
        let frames = Arc::new(FrameQueue::new(config.max_inflight_frames));
        Self {
            config,
            frames,
            au_queue: Arc::new(WaitQueue::new(AU_QUEUE_DEPTH)),
            stop: Arc::new(AtomicBool::new(false)),
            decode_error: Arc::new(AtomicBool::new(false)),
            reader: None,
            decoder: None,
        }
    }

    /// The decoded-frame queue consumers read from.
    pub fn frames(&self) -> Arc<FrameQueue> {
        self.frames.clone()
    }

    /// Shared stop flag, so an in-flight probe can be interrupted
    /// without waiting for the source lock.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Run the full probe protocol: per-attempt timeout, N attempts
    /// with a delay in between. `UnsupportedCodec` is fatal
    /// immediately; exhausting the attempts is `SourceUnreachable`.
    pub fn probe(&self) -> Result<StreamInfo> {
        let attempts = self.config.probe_attempts.max(1);
        for attempt in 1..=attempts {
            if self.stop.load(Ordering::Acquire) {
                return Err(AppError::SourceUnreachable { attempts: attempt });
            }
            match self.probe_once() {
                Ok(info) => {
                    info!(
                        "[{}] probe complete: {} {}x{} @ {:.1} fps",
                        self.config.name,
                        info.codec,
                        info.width,
                        info.height,
                        info.fps()
                    );
                    return Ok(info);
                }
                Err(e @ AppError::UnsupportedCodec { .. }) => return Err(e),
                Err(e) => {
                    warn!(
                        "[{}] probe attempt {}/{} failed: {}",
                        self.config.name, attempt, attempts, e
                    );
                    if attempt < attempts {
                        sleep_interruptible(
                            Duration::from_secs(self.config.probe_delay_secs),
                            &self.stop,
                        );
                    }
                }
            }
        }
        Err(AppError::SourceUnreachable { attempts })
    }

    /// One bounded probe attempt.
    fn probe_once(&self) -> Result<StreamInfo> {
        let budget = Duration::from_secs(self.config.probe_timeout_secs.max(1));
        let deadline = Instant::now() + budget;
        let remaining = |deadline: Instant| -> Result<Duration> {
            deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
                .ok_or(AppError::ProbeTimeout)
        };

        let mut client =
            RtspClient::connect(&self.config.url, self.config.transport, remaining(deadline)?)
                .map_err(map_probe_io)?;
        client.options().map_err(map_probe_io)?;

        // event one: the media description names the codec
        let sdp_body = client.describe().map_err(map_probe_io)?;
        let description = parse_video_description(&sdp_body)?;

        let mut probe = ProbeResult {
            codec: Some(description.codec),
            framerate: description.framerate,
            ..Default::default()
        };
        absorb_parameter_sets(&mut probe, description.codec, &description.parameter_sets);

        // event two: geometry (and maybe timing) from the parsed
        // elementary stream
        if !probe.ready() {
            client.set_timeout(remaining(deadline)?).map_err(map_probe_io)?;
            client
                .setup(description.control.as_deref())
                .map_err(map_probe_io)?;
            client.play().map_err(map_probe_io)?;

            let mut depay = Depacketizer::new(description.codec);
            let mut au_timestamps: Vec<u32> = Vec::new();

            while !probe.ready() {
                client.set_timeout(remaining(deadline)?).map_err(map_probe_io)?;
                let packet = match client.read_data().map_err(map_probe_io)? {
                    SessionData::Rtp(packet) => packet,
                    SessionData::Other => continue,
                };
                let Some((header, payload)) = parse_packet(&packet) else {
                    continue;
                };
                if header.payload_type != description.payload_type {
                    continue;
                }
                if let Some(au) = depay.push(&header, payload) {
                    absorb_access_unit(&mut probe, description.codec, &au);
                    if probe.framerate.is_none() {
                        if au_timestamps.last() != Some(&au.timestamp) {
                            au_timestamps.push(au.timestamp);
                        }
                        probe.framerate = measure_framerate(&au_timestamps);
                    }
                }
            }
        }

        let (Some(codec), Some(width), Some(height), Some(framerate)) =
            (probe.codec, probe.width, probe.height, probe.framerate)
        else {
            return Err(AppError::ProbeTimeout);
        };
        Ok(StreamInfo {
            codec,
            width,
            height,
            framerate,
            profile: probe.profile,
            description,
        })
    }

    /// Launch the reader and decode workers for a probed stream.
    pub fn start(&mut self, info: StreamInfo) -> Result<()> {
        if self.reader.is_some() {
            return Ok(());
        }
        self.stop.store(false, Ordering::Release);
        self.frames.reopen();
        self.au_queue.reopen();

        let reader = {
            let config = self.config.clone();
            let info = info.clone();
            let au_queue = self.au_queue.clone();
            let stop = self.stop.clone();
            let decode_error = self.decode_error.clone();
            std::thread::Builder::new()
                .name(format!("{}-read", self.config.name))
                .spawn(move || run_reader(config, info, au_queue, stop, decode_error))
                .map_err(AppError::Io)?
        };
        let decoder = {
            let config = self.config.clone();
            let au_queue = self.au_queue.clone();
            let frames = self.frames.clone();
            let stop = self.stop.clone();
            let decode_error = self.decode_error.clone();
            std::thread::Builder::new()
                .name(format!("{}-dec", self.config.name))
                .spawn(move || run_decoder(config, info, au_queue, frames, stop, decode_error))
        };
        let decoder = match decoder {
            Ok(handle) => handle,
            Err(e) => {
                // unwind the reader before surfacing the failure
                self.stop.store(true, Ordering::Release);
                self.au_queue.close();
                self.frames.close();
                let _ = reader.join();
                return Err(AppError::Io(e));
            }
        };

        self.reader = Some(reader);
        self.decoder = Some(decoder);
        Ok(())
    }

    /// Cooperative stop: flag, queue wake-ups, join.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.au_queue.close();
        self.frames.close();
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.decoder.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn map_probe_io(e: AppError) -> AppError {
    match e {
        AppError::Io(ref io)
            if matches!(
                io.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) =>
        {
            AppError::ProbeTimeout
        }
        other => other,
    }
}

fn absorb_parameter_sets(probe: &mut ProbeResult, codec: VideoCodec, sets: &[Vec<u8>]) {
    for nal in sets {
        absorb_nal(probe, codec, nal);
    }
}

fn absorb_access_unit(probe: &mut ProbeResult, codec: VideoCodec, au: &AccessUnit) {
    for nal in split_annexb(&au.data) {
        absorb_nal(probe, codec, nal);
    }
}

fn absorb_nal(probe: &mut ProbeResult, codec: VideoCodec, nal: &[u8]) {
    if nal.is_empty() || probe.width.is_some() && probe.framerate.is_some() {
        return;
    }
    match codec {
        VideoCodec::H264 if nal[0] & 0x1f == 7 => {
            if let Ok(info) = sps::parse_h264_sps(nal) {
                probe.width = Some(info.width);
                probe.height = Some(info.height);
                if probe.framerate.is_none() {
                    probe.framerate = info.framerate;
                }
                probe.profile = Some(info.profile_level_id(0));
            }
        }
        VideoCodec::H265 if (nal[0] >> 1) & 0x3f == 33 => {
            if let Ok(info) = sps::parse_h265_sps(nal) {
                probe.width = Some(info.width);
                probe.height = Some(info.height);
            }
        }
        _ => {}
    }
}

/// Walk Annex B data, yielding NAL payload slices.
fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let mut i = 0;
    let mut current_start: Option<usize> = None;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            let code_len = if data[i + 2] == 1 {
                Some(3)
            } else if i + 3 < data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                Some(4)
            } else {
                None
            };
            if let Some(code_len) = code_len {
                if let Some(start) = current_start {
                    nals.push(&data[start..i]);
                }
                current_start = Some(i + code_len);
                i += code_len;
                continue;
            }
        }
        i += 1;
    }
    if let Some(start) = current_start {
        nals.push(&data[start..]);
    }
    nals
}

/// Estimate a framerate from a run of distinct access-unit timestamps.
fn measure_framerate(timestamps: &[u32]) -> Option<(u32, u32)> {
    if timestamps.len() < FRAMERATE_SAMPLES {
        return None;
    }
    let mut deltas: Vec<u32> = timestamps
        .windows(2)
        .map(|w| w[1].wrapping_sub(w[0]))
        .filter(|&d| d > 0 && d < RTP_CLOCK_HZ as u32)
        .collect();
    if deltas.len() < FRAMERATE_SAMPLES - 1 {
        return None;
    }
    deltas.sort_unstable();
    let median = deltas[deltas.len() / 2];
    Some((RTP_CLOCK_HZ as u32, median))
}

fn sleep_interruptible(total: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline && !stop.load(Ordering::Acquire) {
        std::thread::sleep(STOP_POLL.min(deadline - Instant::now()));
    }
}

/// Reader worker: RTSP session, RTP demux, access-unit hand-off.
/// Reconnects on any failure and never surfaces errors downstream.
fn run_reader(
    config: CameraConfig,
    info: StreamInfo,
    au_queue: Arc<WaitQueue<SourceItem>>,
    stop: Arc<AtomicBool>,
    decode_error: Arc<AtomicBool>,
) {
    let reconnect_delay = Duration::from_secs(config.reconnect_delay_secs.max(1));

    'session: while !stop.load(Ordering::Acquire) {
        let mut client = match open_session(&config, &info) {
            Ok(client) => client,
            Err(e) => {
                warn!("[{}] source connect failed: {}", config.name, e);
                sleep_interruptible(reconnect_delay, &stop);
                continue 'session;
            }
        };
        info!("[{}] source streaming", config.name);

        au_queue.push(SourceItem::Reset);
        // prime the decoder with the out-of-band parameter sets
        if !info.description.parameter_sets.is_empty() {
            let mut primer = Vec::new();
            for nal in &info.description.parameter_sets {
                primer.extend_from_slice(&[0, 0, 0, 1]);
                primer.extend_from_slice(nal);
            }
            au_queue.push(SourceItem::Unit {
                data: primer,
                pts_ms: 0,
            });
        }

        let mut depay = Depacketizer::new(info.codec);
        let mut clock = TimestampUnwrapper::default();

        loop {
            if stop.load(Ordering::Acquire) {
                break 'session;
            }
            if decode_error.swap(false, Ordering::AcqRel) {
                warn!("[{}] decode failure, reconnecting source", config.name);
                break;
            }
            match client.read_data() {
                Ok(SessionData::Rtp(packet)) => {
                    let Some((header, payload)) = parse_packet(&packet) else {
                        continue;
                    };
                    if header.payload_type != info.description.payload_type {
                        continue;
                    }
                    if let Some(au) = depay.push(&header, payload) {
                        let extended = clock.extend(au.timestamp);
                        let pts_ms = (extended * 1000 / RTP_CLOCK_HZ) as i64;
                        au_queue.push(SourceItem::Unit {
                            data: au.data,
                            pts_ms,
                        });
                    }
                }
                Ok(SessionData::Other) => {}
                Err(AppError::Io(ref io))
                    if matches!(
                        io.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    // idle tick; loop back to honor stop and keepalive
                }
                Err(e) => {
                    warn!("[{}] source read failed: {}, reconnecting", config.name, e);
                    break;
                }
            }
        }

        drop(client);
        sleep_interruptible(reconnect_delay, &stop);
    }
    debug!("[{}] reader thread done", config.name);
}

fn open_session(config: &CameraConfig, info: &StreamInfo) -> Result<RtspClient> {
    let timeout = Duration::from_secs(config.probe_timeout_secs.max(1));
    let mut client = RtspClient::connect(&config.url, config.transport, timeout)?;
    client.options()?;
    // the camera may have been reconfigured while we were away; a
    // codec change is a decode-path reset, not a crash
    let sdp_body = client.describe()?;
    let description = parse_video_description(&sdp_body)?;
    if description.codec != info.codec {
        return Err(AppError::Rtsp(format!(
            "stream codec changed from {} to {}",
            info.codec, description.codec
        )));
    }
    client.setup(description.control.as_deref())?;
    client.play()?;
    // steady-state reads poll at a coarser cadence
    client.set_timeout(Duration::from_millis(500))?;
    Ok(client)
}

/// Decode worker: access units in, DMA-BUF frames out.
fn run_decoder(
    config: CameraConfig,
    info: StreamInfo,
    au_queue: Arc<WaitQueue<SourceItem>>,
    frames: Arc<FrameQueue>,
    stop: Arc<AtomicBool>,
    decode_error: Arc<AtomicBool>,
) {
    let mut decoder: Option<M2mDecoder> = None;

    while !stop.load(Ordering::Acquire) {
        let item = match au_queue.pop_timeout(STOP_POLL) {
            Some(item) => item,
            None => continue,
        };
        match item {
            SourceItem::Reset => {
                // closes the exported descriptors with it
                decoder = None;
            }
            SourceItem::Unit { data, pts_ms } => {
                if decoder.is_none() {
                    match M2mDecoder::open(
                        info.codec,
                        info.width,
                        info.height,
                        config.max_inflight_frames as u32,
                    ) {
                        Ok(d) => decoder = Some(d),
                        Err(e) => {
                            warn!("[{}] decoder unavailable: {}", config.name, e);
                            sleep_interruptible(Duration::from_secs(1), &stop);
                            continue;
                        }
                    }
                }
                let Some(d) = decoder.as_mut() else { continue };
                match d.decode(&data, pts_ms) {
                    Ok(decoded) => {
                        for frame in decoded {
                            frames.push(frame);
                        }
                    }
                    Err(e) => {
                        warn!("[{}] decode failed: {}", config.name, e);
                        decoder = None;
                        decode_error.store(true, Ordering::Release);
                    }
                }
            }
        }
    }
    debug!("[{}] decode thread done", config.name);
}
