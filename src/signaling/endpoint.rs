//! The per-camera room endpoint.
//!
//! One full-duplex channel per room. Inbound messages are validated,
//! demultiplexed by `client_id` and handed to that viewer's session
//! queue in arrival order. Outbound messages are unicast: each carries
//! the `client_id` it is meant for and goes out over the room channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::signaling::channel::{SignalingTransport, TransportEvent};
use crate::signaling::envelope::{Envelope, MessageType, RetCode};
use crate::video::pipeline::VideoPipeline;
use crate::webrtc::branch::PeerBranch;
use crate::webrtc::config::WebRtcConfig;
use crate::webrtc::session::{SessionController, SessionEvent, SessionHandle};
use crate::webrtc::IceCandidateMsg;

/// Cloneable outbound half handed to session controllers.
#[derive(Clone)]
pub struct SignalingSender {
    transport: Arc<dyn SignalingTransport>,
}

impl SignalingSender {
    pub fn new(transport: Arc<dyn SignalingTransport>) -> Self {
        Self { transport }
    }

    pub fn send(&self, envelope: Envelope) -> Result<()> {
        self.transport.send(envelope.to_json()?)
    }
}

/// Room endpoint binding one camera to its viewer sessions.
pub struct SignalingEndpoint {
    camera: String,
    transport: Arc<dyn SignalingTransport>,
    pipeline: Arc<VideoPipeline>,
    webrtc: WebRtcConfig,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    /// Cleared when the camera is disabled; viewers then only ever get
    /// `connection` faults.
    enabled: AtomicBool,
}

impl SignalingEndpoint {
    pub fn new(
        camera: impl Into<String>,
        pipeline: Arc<VideoPipeline>,
        webrtc: WebRtcConfig,
        transport: Arc<dyn SignalingTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            camera: camera.into(),
            transport,
            pipeline,
            webrtc,
            sessions: Mutex::new(HashMap::new()),
            enabled: AtomicBool::new(true),
        })
    }

    /// Run the inbound dispatch loop until the channel task ends.
    pub fn spawn_dispatch(
        self: &Arc<Self>,
        mut events: tokio::sync::mpsc::UnboundedReceiver<TransportEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let endpoint = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Connected => {
                        info!("[{}] room channel connected", endpoint.camera);
                    }
                    TransportEvent::Message(text) => {
                        endpoint.handle_message(&text).await;
                    }
                    TransportEvent::Disconnected => {
                        // viewers re-issue `connection` after the
                        // channel comes back
                        let closed = endpoint.close_all_sessions().await;
                        if closed > 0 {
                            info!(
                                "[{}] room channel dropped, {} sessions closed",
                                endpoint.camera, closed
                            );
                        }
                    }
                }
            }
            debug!("[{}] dispatch loop done", endpoint.camera);
        })
    }

    pub fn sender(&self) -> SignalingSender {
        SignalingSender::new(self.transport.clone())
    }

    /// Disable the room (unsupported codec path): existing sessions
    /// are closed and new connections are refused.
    pub async fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        if !enabled {
            self.close_all_sessions().await;
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Current machine state of one viewer's session, if any.
    pub async fn session_state(
        &self,
        client_id: &str,
    ) -> Option<crate::webrtc::session::SessionState> {
        self.sessions
            .lock()
            .await
            .get(client_id)
            .map(|handle| handle.state())
    }

    pub async fn close_all_sessions(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let count = sessions.len();
        for (client_id, handle) in sessions.drain() {
            debug!("[{}] closing session {}", self.camera, client_id);
            handle.send(SessionEvent::Shutdown);
        }
        count
    }

    /// Validate and route one inbound message.
    async fn handle_message(&self, text: &str) {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("[{}] inbound message dropped: {}", self.camera, e);
                return;
            }
        };
        let client_id = match envelope.client_id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                warn!(
                    "[{}] inbound {:?} without client_id dropped",
                    self.camera, envelope.message_type
                );
                return;
            }
        };

        match envelope.message_type {
            MessageType::Connection => self.handle_connection(&client_id).await,
            MessageType::Offer => match envelope.sdp {
                Some(sdp) if !sdp.is_empty() => {
                    self.route(&client_id, SessionEvent::RemoteOffer(sdp)).await;
                }
                _ => warn!("[{}] offer without sdp from {}", self.camera, client_id),
            },
            MessageType::Answer => match envelope.sdp {
                Some(sdp) if !sdp.is_empty() => {
                    self.route(&client_id, SessionEvent::RemoteAnswer(sdp)).await;
                }
                _ => warn!("[{}] answer without sdp from {}", self.camera, client_id),
            },
            MessageType::Ice => match (envelope.candidate, envelope.sdp_mline_index) {
                (Some(candidate), Some(sdp_mline_index)) => {
                    self.route(
                        &client_id,
                        SessionEvent::RemoteIce(IceCandidateMsg {
                            candidate,
                            sdp_mline_index,
                            sdp_mid: envelope.sdp_mid,
                        }),
                    )
                    .await;
                }
                _ => warn!(
                    "[{}] ice without candidate fields from {}",
                    self.camera, client_id
                ),
            },
            MessageType::Close => {
                if let Some(handle) = self.sessions.lock().await.remove(&client_id) {
                    info!("[{}] viewer {} closed", self.camera, client_id);
                    handle.send(SessionEvent::Shutdown);
                }
            }
            MessageType::Open => {
                debug!("[{}] viewer {} announced", self.camera, client_id);
            }
        }
    }

    /// `connection`: open a fresh session unless the client_id is live.
    async fn handle_connection(&self, client_id: &str) {
        let mut sessions = self.sessions.lock().await;

        if let Some(existing) = sessions.get(client_id) {
            if !existing.is_closed() {
                // the original session stays untouched
                warn!(
                    "[{}] duplicate connection from {}",
                    self.camera, client_id
                );
                self.reply(Envelope::connection_reply(
                    &self.camera,
                    client_id,
                    RetCode::Fault,
                    format!("client {} already started", client_id),
                ));
                return;
            }
            sessions.remove(client_id);
        }

        if !self.enabled.load(Ordering::Acquire) {
            self.reply(Envelope::connection_reply(
                &self.camera,
                client_id,
                RetCode::Fault,
                "camera is disabled",
            ));
            return;
        }

        match PeerBranch::attach(self.pipeline.clone(), &self.webrtc, &self.camera, client_id)
            .await
        {
            Ok(branch) => {
                // acknowledged before the controller starts, so the
                // success reply precedes the offer on the wire
                self.reply(Envelope::connection_reply(
                    &self.camera,
                    client_id,
                    RetCode::Success,
                    "session opened",
                ));
                let handle = SessionController::spawn(
                    self.camera.clone(),
                    client_id.to_string(),
                    branch,
                    self.sender(),
                );
                sessions.insert(client_id.to_string(), handle);
                info!("[{}] viewer {} connected", self.camera, client_id);
            }
            Err(e) => {
                warn!(
                    "[{}] branch attach for {} failed: {}",
                    self.camera, client_id, e
                );
                self.reply(Envelope::connection_reply(
                    &self.camera,
                    client_id,
                    RetCode::Fault,
                    e.to_string(),
                ));
            }
        }
    }

    async fn route(&self, client_id: &str, event: SessionEvent) {
        let sessions = self.sessions.lock().await;
        match sessions.get(client_id) {
            Some(handle) => handle.send(event),
            None => warn!(
                "[{}] message for unknown client {} dropped",
                self.camera, client_id
            ),
        }
    }

    fn reply(&self, envelope: Envelope) {
        if let Err(e) = self.sender().send(envelope) {
            warn!("[{}] outbound send failed: {}", self.camera, e);
        }
    }
}
