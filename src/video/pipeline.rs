//! The per-camera media graph: DMA-BUF import, NV12 normalization,
//! hardware H.264 encode and fan-out to viewer branches.
//!
//! The graph idles while nobody watches. The encoder exists exactly
//! while at least one branch is attached; frames pushed with no branch
//! attached are dropped on the spot, descriptor closed. Branch attach
//! and detach are table edits under one lock and are safe while frames
//! keep flowing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::error::{AppError, Result};
use crate::video::convert;
use crate::video::encoder::{EncoderFactory, VideoEncoder};
use crate::video::frame::DmaFrame;

/// One encoded access unit, shared across all branch queues.
#[derive(Debug, Clone)]
pub struct EncodedVideoFrame {
    /// Annex B byte stream.
    pub data: Bytes,
    pub pts_ms: i64,
    pub key: bool,
    pub sequence: u64,
}

pub type BranchId = u64;

struct BranchSlot {
    id: BranchId,
    client_id: String,
    tx: mpsc::Sender<Arc<EncodedVideoFrame>>,
}

struct PipelineState {
    encoder: Option<Box<dyn VideoEncoder>>,
    branches: Vec<BranchSlot>,
    next_branch: BranchId,
    sequence: u64,
    last_pts: Option<i64>,
    keyframe_requested: bool,
    frames_encoded: u64,
    frames_dropped: u64,
}

/// Per-camera encode-and-tee graph.
pub struct VideoPipeline {
    camera: String,
    factory: Box<EncoderFactory>,
    state: Mutex<PipelineState>,
    viewers_cv: Condvar,
    stopped: AtomicBool,
}

impl VideoPipeline {
    pub fn new(
        camera: impl Into<String>,
        factory: Box<EncoderFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            camera: camera.into(),
            factory,
            state: Mutex::new(PipelineState {
                encoder: None,
                branches: Vec::new(),
                next_branch: 1,
                sequence: 0,
                last_pts: None,
                keyframe_requested: false,
                frames_encoded: 0,
                frames_dropped: 0,
            }),
            viewers_cv: Condvar::new(),
            stopped: AtomicBool::new(false),
        })
    }

    /// Allocate a fan-out slot for a new viewer. Starting the first
    /// branch brings the encoder up and schedules a keyframe.
    pub fn attach_branch(
        &self,
        client_id: &str,
        queue_depth: usize,
    ) -> Result<(BranchId, mpsc::Receiver<Arc<EncodedVideoFrame>>)> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(AppError::BranchAttachFailed("pipeline is stopped".into()));
        }
        let mut state = self.state.lock();

        if state.encoder.is_none() {
            let encoder = (self.factory)()
                .map_err(|e| AppError::BranchAttachFailed(format!("encoder start: {}", e)))?;
            info!(
                "[{}] first viewer, encoder {} started",
                self.camera,
                encoder.codec_name()
            );
            state.encoder = Some(encoder);
            state.last_pts = None;
        }

        let id = state.next_branch;
        state.next_branch += 1;
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        state.branches.push(BranchSlot {
            id,
            client_id: client_id.to_string(),
            tx,
        });
        state.keyframe_requested = true;

        debug!(
            "[{}] branch {} attached for {} ({} total)",
            self.camera,
            id,
            client_id,
            state.branches.len()
        );
        drop(state);
        self.viewers_cv.notify_all();
        Ok((id, rx))
    }

    /// Remove a branch. Dropping the last one shuts the encoder down;
    /// the rest of the graph keeps running untouched.
    pub fn detach_branch(&self, id: BranchId) {
        let mut state = self.state.lock();
        let before = state.branches.len();
        state.branches.retain(|b| b.id != id);
        if state.branches.len() == before {
            return;
        }
        debug!(
            "[{}] branch {} detached ({} left)",
            self.camera,
            id,
            state.branches.len()
        );
        if state.branches.is_empty() {
            info!("[{}] last viewer gone, encoder stopped", self.camera);
            state.encoder = None;
            state.last_pts = None;
        }
    }

    pub fn branch_count(&self) -> usize {
        self.state.lock().branches.len()
    }

    /// True while at least one branch is attached (PLAYING analog).
    pub fn is_streaming(&self) -> bool {
        let state = self.state.lock();
        !state.branches.is_empty() && state.encoder.is_some()
    }

    /// Ask for an IDR on the next encoded frame.
    pub fn request_keyframe(&self) {
        self.state.lock().keyframe_requested = true;
    }

    /// Block the frame-push worker until a viewer is attached or the
    /// pipeline shuts down. Returns false on shutdown.
    pub fn wait_for_viewers(&self) -> bool {
        let mut state = self.state.lock();
        while state.branches.is_empty() {
            if self.stopped.load(Ordering::Acquire) {
                return false;
            }
            self.viewers_cv.wait(&mut state);
        }
        !self.stopped.load(Ordering::Acquire)
    }

    /// Tear the graph down: drop the encoder, all branches, and wake
    /// any waiter.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        {
            let mut state = self.state.lock();
            state.encoder = None;
            state.branches.clear();
        }
        self.viewers_cv.notify_all();
    }

    /// Push one decoded frame through import -> encode -> tee.
    ///
    /// The frame is consumed either way; with no viewer attached or on
    /// any stage failure it is simply dropped (the descriptor closes
    /// when it goes out of scope). `scratch` is the reusable NV12
    /// staging buffer owned by the push worker.
    pub fn push_frame(&self, frame: DmaFrame, scratch: &mut Vec<u8>) {
        if !self.is_streaming() {
            self.state.lock().frames_dropped += 1;
            return;
        }

        // import outside the lock; attach/detach stay responsive
        if let Err(e) = convert::import_nv12(&frame, scratch) {
            warn!("[{}] frame import failed: {}", self.camera, e);
            self.state.lock().frames_dropped += 1;
            return;
        }
        let pts_ms = frame.pts_ms;
        drop(frame); // descriptor closed as early as possible

        let mut state = self.state.lock();
        if state.branches.is_empty() {
            state.frames_dropped += 1;
            return;
        }
        // non-decreasing PTS towards the encoder, stale frames dropped
        if let Some(last) = state.last_pts {
            if pts_ms < last {
                trace!("[{}] stale frame dropped (pts {} < {})", self.camera, pts_ms, last);
                state.frames_dropped += 1;
                return;
            }
        }
        state.last_pts = Some(pts_ms);

        if state.keyframe_requested {
            if let Some(enc) = state.encoder.as_mut() {
                enc.request_keyframe();
            }
            state.keyframe_requested = false;
        }

        let packets = match state.encoder.as_mut() {
            Some(encoder) => match encoder.encode(scratch, pts_ms) {
                Ok(packets) => packets,
                Err(e) => {
                    // encoder backpressure is not an error; the frame
                    // is dropped, never requeued
                    trace!("[{}] frame not encoded: {}", self.camera, e);
                    state.frames_dropped += 1;
                    return;
                }
            },
            None => return,
        };

        for packet in packets {
            state.sequence += 1;
            let shared = Arc::new(EncodedVideoFrame {
                data: Bytes::from(packet.data),
                pts_ms: packet.pts_ms,
                key: packet.key,
                sequence: state.sequence,
            });
            state.frames_encoded += 1;
            for branch in &state.branches {
                // leaky towards slow viewers
                if branch.tx.try_send(shared.clone()).is_err() {
                    trace!(
                        "[{}] viewer {} queue full, frame dropped",
                        self.camera,
                        branch.client_id
                    );
                }
            }
        }
    }

    pub fn frames_encoded(&self) -> u64 {
        self.state.lock().frames_encoded
    }

    pub fn frames_dropped(&self) -> u64 {
        self.state.lock().frames_dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::encoder::EncodedPacket;
    use crate::video::frame::test_support::blank_nv12;
    use std::sync::atomic::AtomicUsize;

    /// Deterministic encoder stand-in: one packet per frame, keyframe
    /// iff requested since the last frame.
    struct StubEncoder {
        keyframe_pending: bool,
        keyframes_requested: Arc<AtomicUsize>,
    }

    impl VideoEncoder for StubEncoder {
        fn encode(&mut self, _nv12: &[u8], pts_ms: i64) -> Result<Vec<EncodedPacket>> {
            let key = std::mem::take(&mut self.keyframe_pending);
            Ok(vec![EncodedPacket {
                data: vec![0, 0, 0, 1, if key { 0x65 } else { 0x41 }],
                pts_ms,
                key,
            }])
        }

        fn request_keyframe(&mut self) {
            self.keyframe_pending = true;
            self.keyframes_requested.fetch_add(1, Ordering::SeqCst);
        }

        fn codec_name(&self) -> &str {
            "stub"
        }
    }

    fn stub_pipeline() -> (Arc<VideoPipeline>, Arc<AtomicUsize>) {
        let keyframes = Arc::new(AtomicUsize::new(0));
        let keyframes_factory = keyframes.clone();
        let pipeline = VideoPipeline::new(
            "camera_1",
            Box::new(move || {
                Ok(Box::new(StubEncoder {
                    keyframe_pending: false,
                    keyframes_requested: keyframes_factory.clone(),
                }) as Box<dyn VideoEncoder>)
            }),
        );
        (pipeline, keyframes)
    }

    #[test]
    fn idle_until_first_branch() {
        let (pipeline, _) = stub_pipeline();
        assert!(!pipeline.is_streaming());

        let mut scratch = Vec::new();
        pipeline.push_frame(blank_nv12(4, 4, 0), &mut scratch);
        assert_eq!(pipeline.frames_dropped(), 1);
        assert_eq!(pipeline.frames_encoded(), 0);

        let (id, _rx) = pipeline.attach_branch("C1", 4).unwrap();
        assert!(pipeline.is_streaming());
        pipeline.detach_branch(id);
        assert!(!pipeline.is_streaming());
    }

    #[test]
    fn idle_drop_closes_descriptor() {
        let (pipeline, _) = stub_pipeline();
        let frame = blank_nv12(4, 4, 0);
        let raw = frame.raw_fd();
        let mut scratch = Vec::new();
        pipeline.push_frame(frame, &mut scratch);
        assert!(nix::fcntl::fcntl(raw, nix::fcntl::FcntlArg::F_GETFD).is_err());
    }

    #[tokio::test]
    async fn fan_out_and_independent_detach() {
        let (pipeline, _) = stub_pipeline();
        let (id_a, mut rx_a) = pipeline.attach_branch("C1", 4).unwrap();
        let (_id_b, mut rx_b) = pipeline.attach_branch("C2", 4).unwrap();
        assert_eq!(pipeline.branch_count(), 2);

        let mut scratch = Vec::new();
        pipeline.push_frame(blank_nv12(4, 4, 100), &mut scratch);

        let a = rx_a.recv().await.unwrap();
        let b = rx_b.recv().await.unwrap();
        assert_eq!(a.pts_ms, 100);
        assert_eq!(b.pts_ms, 100);
        assert_eq!(a.sequence, b.sequence);

        // detaching one viewer leaves the other streaming
        pipeline.detach_branch(id_a);
        pipeline.push_frame(blank_nv12(4, 4, 140), &mut scratch);
        let b2 = rx_b.recv().await.unwrap();
        assert_eq!(b2.pts_ms, 140);
        assert!(b2.pts_ms > b.pts_ms);
        assert!(rx_a.recv().await.is_none());
    }

    #[test]
    fn stale_pts_dropped() {
        let (pipeline, _) = stub_pipeline();
        let (_id, _rx) = pipeline.attach_branch("C1", 4).unwrap();
        let mut scratch = Vec::new();
        pipeline.push_frame(blank_nv12(4, 4, 200), &mut scratch);
        pipeline.push_frame(blank_nv12(4, 4, 100), &mut scratch);
        assert_eq!(pipeline.frames_encoded(), 1);
        assert_eq!(pipeline.frames_dropped(), 1);
    }

    #[test]
    fn attach_requests_keyframe() {
        let (pipeline, keyframes) = stub_pipeline();
        let (_id, _rx) = pipeline.attach_branch("C1", 4).unwrap();
        let mut scratch = Vec::new();
        pipeline.push_frame(blank_nv12(4, 4, 0), &mut scratch);
        assert_eq!(keyframes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn encoder_failure_fails_attach() {
        let pipeline = VideoPipeline::new(
            "camera_1",
            Box::new(|| Err(AppError::Video("no encoder".into()))),
        );
        match pipeline.attach_branch("C1", 4) {
            Err(AppError::BranchAttachFailed(_)) => {}
            other => panic!("expected BranchAttachFailed, got {:?}", other.map(|_| ())),
        }
        assert!(!pipeline.is_streaming());
        assert_eq!(pipeline.branch_count(), 0);
    }

    #[test]
    fn wait_for_viewers_unblocks_on_attach() {
        let (pipeline, _) = stub_pipeline();
        let p = pipeline.clone();
        let waiter = std::thread::spawn(move || p.wait_for_viewers());
        std::thread::sleep(std::time::Duration::from_millis(50));
        let (_id, _rx) = pipeline.attach_branch("C1", 4).unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn wait_for_viewers_unblocks_on_shutdown() {
        let (pipeline, _) = stub_pipeline();
        let p = pipeline.clone();
        let waiter = std::thread::spawn(move || p.wait_for_viewers());
        std::thread::sleep(std::time::Duration::from_millis(50));
        pipeline.shutdown();
        assert!(!waiter.join().unwrap());
    }
}
