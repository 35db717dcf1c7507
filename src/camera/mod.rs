//! One camera: its frame source, media pipeline, signaling endpoint
//! and the frame-push worker tying them together.

pub mod manager;

pub use manager::CameraManager;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{CameraConfig, SignalingConfig};
use crate::error::{AppError, Result};
use crate::signaling::channel::{SignalingTransport, WsSignalingChannel};
use crate::signaling::endpoint::SignalingEndpoint;
use crate::video::encoder::{H264Encoder, VideoEncoder};
use crate::video::pipeline::VideoPipeline;
use crate::video::source::{FrameSource, StreamInfo};
use crate::webrtc::config::WebRtcConfig;

const PUSH_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraState {
    /// Not yet successfully probed.
    Initializing,
    /// Probed; pipeline can be built, not yet started.
    Ready,
    Running,
    /// Fatal per-camera condition (unsupported codec). Signaling still
    /// answers, with faults.
    Disabled,
    Stopped,
}

impl std::fmt::Display for CameraState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraState::Initializing => write!(f, "initializing"),
            CameraState::Ready => write!(f, "ready"),
            CameraState::Running => write!(f, "running"),
            CameraState::Disabled => write!(f, "disabled"),
            CameraState::Stopped => write!(f, "stopped"),
        }
    }
}

/// A camera instance. Exclusively owns its source, pipeline and
/// endpoint; everything else refers to it by name.
pub struct Camera {
    config: CameraConfig,
    signaling: SignalingConfig,
    webrtc: WebRtcConfig,
    state: Mutex<CameraState>,
    source: Mutex<FrameSource>,
    source_stop: Arc<AtomicBool>,
    stream_info: Mutex<Option<StreamInfo>>,
    pipeline: Mutex<Option<Arc<VideoPipeline>>>,
    endpoint: Mutex<Option<Arc<SignalingEndpoint>>>,
    transport: Mutex<Option<Arc<dyn SignalingTransport>>>,
    push_worker: Mutex<Option<std::thread::JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
}

impl Camera {
    pub fn new(config: CameraConfig, signaling: SignalingConfig, webrtc: WebRtcConfig) -> Arc<Self> {
        let source = FrameSource::new(config.clone());
        let source_stop = source.stop_flag();
        Arc::new(Self {
            config,
            signaling,
            webrtc,
            state: Mutex::new(CameraState::Initializing),
            source: Mutex::new(source),
            source_stop,
            stream_info: Mutex::new(None),
            pipeline: Mutex::new(None),
            endpoint: Mutex::new(None),
            transport: Mutex::new(None),
            push_worker: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> CameraState {
        *self.state.lock()
    }

    /// Probe the source. One full per-camera retry cycle; the manager
    /// may call again on the next batch round.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        match self.state() {
            CameraState::Initializing => {}
            CameraState::Disabled => {
                return Err(AppError::UnsupportedCodec {
                    codec: "previously rejected".into(),
                })
            }
            _ => return Ok(()),
        }

        info!(
            "[{}] probing {}",
            self.config.name,
            self.config.redacted_url()
        );
        let this = self.clone();
        let probed = tokio::task::spawn_blocking(move || this.source.lock().probe())
            .await
            .map_err(|e| AppError::Video(format!("probe task failed: {}", e)))?;

        match probed {
            Ok(info) => {
                *self.pipeline.lock() = Some(self.build_pipeline(&info));
                *self.stream_info.lock() = Some(info);
                *self.state.lock() = CameraState::Ready;
                Ok(())
            }
            Err(e @ AppError::UnsupportedCodec { .. }) => {
                warn!("[{}] disabled: {}", self.config.name, e);
                *self.state.lock() = CameraState::Disabled;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// The media graph for this camera's probed mode. H.265 sources
    /// decode to raw frames just the same; the outgoing side is always
    /// H.264.
    fn build_pipeline(&self, info: &StreamInfo) -> Arc<VideoPipeline> {
        let width = info.width;
        let height = info.height;
        let fps = self.config.framerate;
        let bitrate_kbps = default_bitrate_kbps(width, height);
        VideoPipeline::new(
            self.config.name.clone(),
            Box::new(move || {
                let encoder = H264Encoder::new(width, height, fps, bitrate_kbps)?;
                Ok(Box::new(encoder) as Box<dyn VideoEncoder>)
            }),
        )
    }

    /// Bring the camera up: source workers, push worker, room channel.
    /// A disabled camera still joins its room so viewers get faults
    /// instead of silence.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let state = self.state();
        match state {
            CameraState::Ready | CameraState::Disabled => {}
            CameraState::Running => return Ok(()),
            _ => {
                return Err(AppError::Video(format!(
                    "camera {} cannot start while {}",
                    self.config.name, state
                )))
            }
        }
        self.stop.store(false, Ordering::Release);

        let pipeline = {
            let mut guard = self.pipeline.lock();
            match guard.as_ref() {
                Some(pipeline) => pipeline.clone(),
                None => {
                    // disabled cameras still need an endpoint target
                    let name = self.config.name.clone();
                    let pipeline = VideoPipeline::new(
                        name.clone(),
                        Box::new(move || {
                            Err(AppError::BranchAttachFailed(format!(
                                "camera {} is disabled",
                                name
                            )))
                        }),
                    );
                    *guard = Some(pipeline.clone());
                    pipeline
                }
            }
        };

        // room channel + endpoint
        let url = self.signaling.room_url(&self.config.name);
        let (channel, events) = WsSignalingChannel::spawn(url);
        let transport: Arc<dyn SignalingTransport> = channel;
        let endpoint = SignalingEndpoint::new(
            self.config.name.clone(),
            pipeline.clone(),
            self.webrtc.clone(),
            transport.clone(),
        );
        endpoint.spawn_dispatch(events);
        if state == CameraState::Disabled {
            endpoint.set_enabled(false).await;
        }
        *self.endpoint.lock() = Some(endpoint);
        *self.transport.lock() = Some(transport);

        if state == CameraState::Ready {
            let info = self.stream_info.lock().clone().ok_or_else(|| {
                AppError::Video(format!("camera {} was never probed", self.config.name))
            })?;
            let this = self.clone();
            let started = tokio::task::spawn_blocking(move || this.source.lock().start(info))
                .await
                .map_err(|e| AppError::Video(format!("source start task failed: {}", e)))?;
            started?;

            let frames = self.source.lock().frames();
            let stop = self.stop.clone();
            let name = self.config.name.clone();
            let worker = std::thread::Builder::new()
                .name(format!("{}-push", self.config.name))
                .spawn(move || {
                    let mut scratch = Vec::new();
                    loop {
                        if stop.load(Ordering::Acquire) {
                            break;
                        }
                        // idle while nobody watches; frames queued in
                        // the meantime age out of the bounded queue
                        if !pipeline.wait_for_viewers() {
                            break;
                        }
                        let Some(frame) = frames.pop_timeout(PUSH_POLL) else {
                            continue;
                        };
                        pipeline.push_frame(frame, &mut scratch);
                    }
                    debug!("[{}] push worker done", name);
                })
                .map_err(AppError::Io)?;
            *self.push_worker.lock() = Some(worker);
        }

        if state == CameraState::Ready {
            *self.state.lock() = CameraState::Running;
        }
        info!("[{}] camera started ({})", self.config.name, state);
        Ok(())
    }

    /// Cooperative stop: flag, wake every waiter, join workers.
    pub async fn stop(self: &Arc<Self>) {
        self.stop.store(true, Ordering::Release);
        // interrupts an in-flight probe as well
        self.source_stop.store(true, Ordering::Release);

        if let Some(endpoint) = self.endpoint.lock().clone() {
            endpoint.close_all_sessions().await;
        }
        if let Some(pipeline) = self.pipeline.lock().clone() {
            pipeline.shutdown();
        }

        let this = self.clone();
        let _ = tokio::task::spawn_blocking(move || {
            this.source.lock().stop();
            if let Some(worker) = this.push_worker.lock().take() {
                let _ = worker.join();
            }
        })
        .await;

        if let Some(transport) = self.transport.lock().take() {
            transport.shutdown();
        }
        *self.endpoint.lock() = None;

        let mut state = self.state.lock();
        if *state != CameraState::Disabled {
            *state = CameraState::Stopped;
        }
        info!("[{}] camera stopped", self.config.name);
    }

    /// Viewer count across this camera's sessions.
    pub async fn viewer_count(&self) -> usize {
        let endpoint = self.endpoint.lock().clone();
        match endpoint {
            Some(endpoint) => endpoint.session_count().await,
            None => 0,
        }
    }
}

/// A sane CBR target for the geometry: scales from 4 Mbps at 1080p,
/// clamped to [1, 8] Mbps.
fn default_bitrate_kbps(width: u32, height: u32) -> u32 {
    let pixels = (width * height) as u64;
    let kbps = pixels * 4000 / (1920 * 1080);
    kbps.clamp(1000, 8000) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrate_scales_with_geometry() {
        assert_eq!(default_bitrate_kbps(1920, 1080), 4000);
        assert_eq!(default_bitrate_kbps(3840, 2160), 8000);
        assert_eq!(default_bitrate_kbps(640, 480), 1000);
    }
}
