//! One viewer's branch: a bounded queue and a WebRTC endpoint spliced
//! onto the camera pipeline.
//!
//! Attach is a three-phase edit with deterministic rollback:
//!   1. allocate the fan-out slot on the tee,
//!   2. build the peer connection and track, detached,
//!   3. link the forward task draining the slot into the track.
//! Any failure unwinds the completed phases; the rest of the graph
//! keeps streaming. Detach is the reverse and never disturbs other
//! branches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

use crate::error::{AppError, Result};
use crate::video::pipeline::{BranchId, EncodedVideoFrame, VideoPipeline};
use crate::webrtc::config::{WebRtcConfig, BRANCH_QUEUE_DEPTH};
use crate::webrtc::session::{IceCandidateMsg, SessionEvent};
use crate::webrtc::track::{h264_codec_capability, H264SampleTrack, H264_PAYLOAD_TYPE};

/// One viewer's media endpoint, exclusively owned by its session.
pub struct PeerBranch {
    camera: String,
    client_id: String,
    pc: Arc<RTCPeerConnection>,
    pipeline: Arc<VideoPipeline>,
    slot: BranchId,
    forward: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PeerBranch {
    /// Splice a new branch onto the pipeline for `client_id`.
    pub async fn attach(
        pipeline: Arc<VideoPipeline>,
        config: &WebRtcConfig,
        camera: &str,
        client_id: &str,
    ) -> Result<Arc<Self>> {
        // phase 1: tee slot (starts the encoder on the first viewer)
        let (slot, frame_rx) = pipeline.attach_branch(client_id, BRANCH_QUEUE_DEPTH)?;

        // phase 2: WebRTC endpoint, still detached from the media flow
        let built = build_endpoint(config, camera, client_id).await;
        let (pc, track) = match built {
            Ok(parts) => parts,
            Err(e) => {
                pipeline.detach_branch(slot);
                return Err(AppError::BranchAttachFailed(e.to_string()));
            }
        };

        // phase 3: link
        let branch = Arc::new(Self {
            camera: camera.to_string(),
            client_id: client_id.to_string(),
            pc,
            pipeline,
            slot,
            forward: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let forward = tokio::spawn(forward_frames(
            frame_rx,
            track,
            camera.to_string(),
            client_id.to_string(),
        ));
        *branch.forward.lock() = Some(forward);

        info!("[{}/{}] peer branch attached", camera, client_id);
        Ok(branch)
    }

    /// Route peer-connection callbacks into the session event queue.
    /// Callbacks never touch session state directly; they only enqueue.
    pub fn wire_events(&self, events: mpsc::UnboundedSender<SessionEvent>) {
        let ice_events = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = ice_events.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    let Ok(init) = candidate.to_json() else { return };
                    let _ = events.send(SessionEvent::LocalIce(IceCandidateMsg {
                        candidate: init.candidate,
                        sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
                        sdp_mid: init.sdp_mid,
                    }));
                })
            }));

        let conn_events = events.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let events = conn_events.clone();
                Box::pin(async move {
                    match state {
                        RTCIceConnectionState::Connected => {
                            let _ = events.send(SessionEvent::IceConnected);
                        }
                        RTCIceConnectionState::Failed => {
                            let _ = events.send(SessionEvent::Shutdown);
                        }
                        _ => {}
                    }
                })
            }));

        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events = events.clone();
                Box::pin(async move {
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                    ) {
                        let _ = events.send(SessionEvent::Shutdown);
                    }
                })
            }));
    }

    /// Create the send-only offer and install it locally. Candidates
    /// trickle afterwards through `on_ice_candidate`.
    pub async fn create_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;
        Ok(sdp)
    }

    /// Remote descriptions are accepted as received.
    pub async fn set_remote_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp)?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    /// Viewer-initiated offer: apply it and produce our answer.
    pub async fn accept_remote_offer(&self, sdp: String) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp)?;
        self.pc.set_remote_description(offer).await?;
        let answer = self.pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await?;
        Ok(sdp)
    }

    pub async fn add_ice_candidate(&self, candidate: IceCandidateMsg) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: Some(candidate.sdp_mline_index),
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    /// Reverse of attach: stop forwarding, close the endpoint, release
    /// the tee slot. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(forward) = self.forward.lock().take() {
            forward.abort();
        }
        if let Err(e) = self.pc.close().await {
            debug!("[{}/{}] peer close: {}", self.camera, self.client_id, e);
        }
        self.pipeline.detach_branch(self.slot);
        info!("[{}/{}] peer branch detached", self.camera, self.client_id);
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

/// Build the peer connection and its H.264 send track.
async fn build_endpoint(
    config: &WebRtcConfig,
    camera: &str,
    client_id: &str,
) -> Result<(Arc<RTCPeerConnection>, Arc<H264SampleTrack>)> {
    let mut media_engine = MediaEngine::default();
    // only H.264 at the pinned payload type goes into local offers
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: h264_codec_capability(),
            payload_type: H264_PAYLOAD_TYPE,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = Arc::new(
        api.new_peer_connection(config.to_rtc_configuration())
            .await?,
    );

    let track = Arc::new(H264SampleTrack::new(client_id, camera));
    pc.add_transceiver_from_track(
        track.as_track_local(),
        Some(RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Sendonly,
            send_encodings: vec![],
        }),
    )
    .await?;

    Ok((pc, track))
}

/// Drain the branch queue into the track until the slot is released.
async fn forward_frames(
    mut frame_rx: mpsc::Receiver<Arc<EncodedVideoFrame>>,
    track: Arc<H264SampleTrack>,
    camera: String,
    client_id: String,
) {
    while let Some(frame) = frame_rx.recv().await {
        if let Err(e) = track.write_access_unit(&frame.data, frame.key).await {
            trace!("[{}/{}] frame not written: {}", camera, client_id, e);
        }
    }
    debug!("[{}/{}] forward task done", camera, client_id);
}
