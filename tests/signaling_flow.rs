//! Signaling and session flows against an in-process fake channel.
//!
//! No network, no cameras, no hardware codecs: the transport is a
//! captured queue, the encoder a deterministic stub. What runs for
//! real is the envelope handling, the routing, the session machines
//! and the WebRTC peer connections.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Notify;

use camgate::error::Result;
use camgate::signaling::channel::{SignalingTransport, TransportEvent};
use camgate::signaling::endpoint::SignalingEndpoint;
use camgate::signaling::envelope::{Envelope, MessageType, RetCode};
use camgate::video::encoder::{EncodedPacket, VideoEncoder};
use camgate::video::pipeline::VideoPipeline;
use camgate::webrtc::{SessionState, WebRtcConfig};

/// Outbound capture standing in for the room channel.
struct FakeTransport {
    sent: Mutex<Vec<Envelope>>,
    notify: Notify,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    /// Wait for the first outbound message matching the predicate.
    /// Trickle ICE interleaves with everything else on the wire, so
    /// tests match by content, never by position.
    async fn wait_matching(
        &self,
        timeout: Duration,
        matches: impl Fn(&Envelope) -> bool,
    ) -> Option<Envelope> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(envelope) = self
                .sent
                .lock()
                .unwrap()
                .iter()
                .find(|e| matches(e))
                .cloned()
            {
                return Some(envelope);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            let _ = tokio::time::timeout(Duration::from_millis(50), self.notify.notified()).await;
        }
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn sent_of_type(&self, message_type: MessageType) -> Vec<Envelope> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.message_type == message_type)
            .cloned()
            .collect()
    }
}

impl SignalingTransport for FakeTransport {
    fn send(&self, text: String) -> Result<()> {
        let envelope = Envelope::from_json(&text)?;
        self.sent.lock().unwrap().push(envelope);
        self.notify.notify_waiters();
        Ok(())
    }

    fn shutdown(&self) {}
}

/// Deterministic encoder so the pipeline can start without hardware.
struct StubEncoder;

impl VideoEncoder for StubEncoder {
    fn encode(&mut self, _nv12: &[u8], pts_ms: i64) -> Result<Vec<EncodedPacket>> {
        Ok(vec![EncodedPacket {
            data: vec![0, 0, 0, 1, 0x65],
            pts_ms,
            key: true,
        }])
    }

    fn request_keyframe(&mut self) {}

    fn codec_name(&self) -> &str {
        "stub"
    }
}

struct TestRoom {
    endpoint: Arc<SignalingEndpoint>,
    transport: Arc<FakeTransport>,
    inbound: mpsc::UnboundedSender<TransportEvent>,
}

impl TestRoom {
    fn new(camera: &str) -> Self {
        let pipeline = VideoPipeline::new(
            camera,
            Box::new(|| Ok(Box::new(StubEncoder) as Box<dyn VideoEncoder>)),
        );
        let transport = FakeTransport::new();
        let endpoint = SignalingEndpoint::new(
            camera,
            pipeline,
            WebRtcConfig::default(),
            transport.clone(),
        );
        let (inbound, events) = mpsc::unbounded_channel();
        endpoint.spawn_dispatch(events);
        inbound.send(TransportEvent::Connected).unwrap();
        Self {
            endpoint,
            transport,
            inbound,
        }
    }

    fn deliver(&self, raw: &str) {
        self.inbound
            .send(TransportEvent::Message(raw.to_string()))
            .unwrap();
    }

    async fn wait_state(
        &self,
        client_id: &str,
        wanted: SessionState,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.endpoint.session_state(client_id).await == Some(wanted) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn connection_yields_success_then_offer() {
    let room = TestRoom::new("camera_1");
    room.deliver(r#"{"type":"connection","client_id":"C1"}"#);

    let ack = room
        .transport
        .wait_matching(WAIT, |e| e.message_type == MessageType::Connection)
        .await
        .expect("ack");
    assert_eq!(ack.ret, Some(RetCode::Success));
    assert_eq!(ack.client_id.as_deref(), Some("C1"));
    assert_eq!(ack.camera.as_deref(), Some("camera_1"));

    let offer = room
        .transport
        .wait_matching(WAIT, |e| e.message_type == MessageType::Offer)
        .await
        .expect("offer");
    assert_eq!(offer.client_id.as_deref(), Some("C1"));
    let sdp = offer.sdp.expect("offer carries sdp");
    assert!(!sdp.is_empty());
    assert!(sdp.contains("H264"), "offer advertises H264: {}", sdp);
    assert!(sdp.contains("sendonly"), "camera is send-only: {}", sdp);

    assert!(room.wait_state("C1", SessionState::Negotiating, WAIT).await);
    assert_eq!(room.endpoint.session_count().await, 1);
}

#[tokio::test]
async fn duplicate_connection_faults_and_leaves_original() {
    let room = TestRoom::new("camera_1");
    room.deliver(r#"{"type":"connection","client_id":"C1"}"#);
    assert!(room.wait_state("C1", SessionState::Negotiating, WAIT).await);

    room.deliver(r#"{"type":"connection","client_id":"C1"}"#);
    let fault = room
        .transport
        .wait_matching(WAIT, |e| {
            e.message_type == MessageType::Connection && e.ret == Some(RetCode::Fault)
        })
        .await
        .expect("fault reply");
    assert!(fault.description.unwrap().contains("already started"));

    // the original session is untouched
    assert_eq!(room.endpoint.session_count().await, 1);
    assert_eq!(
        room.endpoint.session_state("C1").await,
        Some(SessionState::Negotiating)
    );
}

#[tokio::test]
async fn malformed_and_anonymous_messages_are_dropped() {
    let room = TestRoom::new("camera_1");
    room.deliver("{not json");
    room.deliver(r#"{"type":"connection"}"#);
    room.deliver(r#"{"type":"offer","sdp":"v=0"}"#);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(room.transport.sent_count(), 0);
    assert_eq!(room.endpoint.session_count().await, 0);
}

#[tokio::test]
async fn mdns_candidate_is_discarded() {
    let room = TestRoom::new("camera_1");
    room.deliver(r#"{"type":"connection","client_id":"C1"}"#);
    assert!(room.wait_state("C1", SessionState::Negotiating, WAIT).await);

    room.deliver(
        r#"{"type":"ice","client_id":"C1","candidate":"candidate:1 1 UDP 2122260223 abcd.local 54321 typ host","sdpMLineIndex":0}"#,
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    // no reply, no state change; the only connection message on the
    // wire is still the original acknowledgement
    assert_eq!(
        room.endpoint.session_state("C1").await,
        Some(SessionState::Negotiating)
    );
    assert_eq!(room.transport.sent_of_type(MessageType::Connection).len(), 1);
}

#[tokio::test]
async fn disabled_camera_refuses_connections() {
    let room = TestRoom::new("camera_1");
    room.endpoint.set_enabled(false).await;

    room.deliver(r#"{"type":"connection","client_id":"C1"}"#);
    let fault = room
        .transport
        .wait_matching(WAIT, |e| e.message_type == MessageType::Connection)
        .await
        .expect("fault");
    assert_eq!(fault.ret, Some(RetCode::Fault));
    assert_eq!(room.endpoint.session_count().await, 0);
}

#[tokio::test]
async fn transport_drop_closes_sessions() {
    let room = TestRoom::new("camera_1");
    room.deliver(r#"{"type":"connection","client_id":"C1"}"#);
    room.deliver(r#"{"type":"connection","client_id":"C2"}"#);
    assert!(room.wait_state("C1", SessionState::Negotiating, WAIT).await);
    assert!(room.wait_state("C2", SessionState::Negotiating, WAIT).await);

    room.inbound.send(TransportEvent::Disconnected).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(room.endpoint.session_count().await, 0);

    // after reconnect the viewer opens a fresh session
    room.inbound.send(TransportEvent::Connected).unwrap();
    room.deliver(r#"{"type":"connection","client_id":"C1"}"#);
    assert!(room.wait_state("C1", SessionState::Negotiating, WAIT).await);
}

#[tokio::test]
async fn explicit_close_removes_session() {
    let room = TestRoom::new("camera_1");
    room.deliver(r#"{"type":"connection","client_id":"C1"}"#);
    assert!(room.wait_state("C1", SessionState::Negotiating, WAIT).await);

    room.deliver(r#"{"type":"close","client_id":"C1"}"#);
    let deadline = tokio::time::Instant::now() + WAIT;
    while room.endpoint.session_count().await != 0 {
        assert!(tokio::time::Instant::now() < deadline, "session not removed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// The round-trip law: a local offer through an ideal echo peer (a
/// second in-process peer connection answering honestly) reaches
/// CONNECTED.
#[tokio::test]
async fn echo_peer_reaches_connected() {
    use webrtc::api::interceptor_registry::register_default_interceptors;
    use webrtc::api::media_engine::MediaEngine;
    use webrtc::api::APIBuilder;
    use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
    use webrtc::interceptor::registry::Registry;
    use webrtc::peer_connection::configuration::RTCConfiguration;
    use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

    let room = TestRoom::new("camera_1");
    room.deliver(r#"{"type":"connection","client_id":"C1"}"#);
    let offer = room
        .transport
        .wait_matching(WAIT, |e| e.message_type == MessageType::Offer)
        .await
        .expect("offer");
    let offer_sdp = offer.sdp.unwrap();

    // ideal echo peer
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().unwrap();
    let registry = register_default_interceptors(Registry::new(), &mut media_engine).unwrap();
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();
    let viewer = Arc::new(
        api.new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap(),
    );

    // viewer candidates flow back as inbound ice messages
    let inbound = room.inbound.clone();
    viewer.on_ice_candidate(Box::new(move |candidate| {
        let inbound = inbound.clone();
        Box::pin(async move {
            if let Some(candidate) = candidate {
                if let Ok(init) = candidate.to_json() {
                    let msg = serde_json::json!({
                        "type": "ice",
                        "client_id": "C1",
                        "candidate": init.candidate,
                        "sdpMLineIndex": init.sdp_mline_index.unwrap_or(0),
                        "sdpMid": init.sdp_mid,
                    });
                    let _ = inbound.send(TransportEvent::Message(msg.to_string()));
                }
            }
        })
    }));

    viewer
        .set_remote_description(RTCSessionDescription::offer(offer_sdp).unwrap())
        .await
        .unwrap();
    let answer = viewer.create_answer(None).await.unwrap();
    viewer
        .set_local_description(answer.clone())
        .await
        .unwrap();

    let msg = serde_json::json!({
        "type": "answer",
        "client_id": "C1",
        "sdp": answer.sdp,
    });
    room.deliver(&msg.to_string());

    // camera-side candidates are applied to the viewer as they appear
    let transport = room.transport.clone();
    let viewer_for_ice = viewer.clone();
    tokio::spawn(async move {
        let mut applied = 0usize;
        loop {
            let candidates = transport.sent_of_type(MessageType::Ice);
            for envelope in candidates.iter().skip(applied) {
                let init = RTCIceCandidateInit {
                    candidate: envelope.candidate.clone().unwrap_or_default(),
                    sdp_mid: envelope.sdp_mid.clone(),
                    sdp_mline_index: envelope.sdp_mline_index,
                    username_fragment: None,
                };
                let _ = viewer_for_ice.add_ice_candidate(init).await;
                applied += 1;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });

    assert!(
        room.wait_state("C1", SessionState::Connected, Duration::from_secs(10))
            .await,
        "session never reached connected"
    );
}
