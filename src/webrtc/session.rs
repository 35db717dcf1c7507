//! Per-viewer session controller.
//!
//! Negotiation is an explicit, table-driven machine rather than a web
//! of callbacks: every signaling message and every peer-connection
//! event becomes a [`SessionEvent`] on one queue per viewer, so all
//! transitions for a (camera, client_id) pair are serialized in
//! arrival order and the machine itself is testable without any
//! network or media stack.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::signaling::endpoint::SignalingSender;
use crate::signaling::envelope::Envelope;
use crate::webrtc::branch::PeerBranch;

/// Lifecycle of one viewer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating,
    Connected,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Negotiating => write!(f, "negotiating"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// An ICE candidate as carried in signaling messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidateMsg {
    pub candidate: String,
    pub sdp_mline_index: u16,
    pub sdp_mid: Option<String>,
}

impl IceCandidateMsg {
    /// mDNS obfuscated candidates cannot be resolved here.
    pub fn is_mdns(&self) -> bool {
        self.candidate.contains(".local")
    }
}

/// Everything that can drive a session forward.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The branch is spliced into the graph; negotiation is needed.
    Attached,
    /// Inbound `offer` from the viewer.
    RemoteOffer(String),
    /// Inbound `answer` from the viewer.
    RemoteAnswer(String),
    /// Inbound `ice` from the viewer.
    RemoteIce(IceCandidateMsg),
    /// A local candidate gathered by the peer connection.
    LocalIce(IceCandidateMsg),
    /// The ICE connection reached connected.
    IceConnected,
    /// Transport drop or explicit close.
    Shutdown,
}

/// Side effects the executor performs on behalf of the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    CreateAndSendOffer,
    ApplyRemoteOffer(String),
    ApplyRemoteAnswer(String),
    ApplyIce(IceCandidateMsg),
    EmitIce(IceCandidateMsg),
    DiscardMdns(IceCandidateMsg),
    Teardown,
}

/// The pure transition function plus the candidate buffer that closes
/// the early-ICE race.
pub struct SessionMachine {
    state: SessionState,
    has_remote_description: bool,
    pending_ice: Vec<IceCandidateMsg>,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            has_remote_description: false,
            pending_ice: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pending_ice_len(&self) -> usize {
        self.pending_ice.len()
    }

    pub fn handle(&mut self, event: SessionEvent) -> Vec<SessionAction> {
        if self.state == SessionState::Closed {
            return Vec::new();
        }
        match event {
            SessionEvent::Attached => {
                if self.state == SessionState::Idle {
                    self.state = SessionState::Negotiating;
                    vec![SessionAction::CreateAndSendOffer]
                } else {
                    Vec::new()
                }
            }
            SessionEvent::RemoteOffer(sdp) => {
                if self.state != SessionState::Negotiating {
                    return Vec::new();
                }
                self.has_remote_description = true;
                let mut actions = vec![SessionAction::ApplyRemoteOffer(sdp)];
                actions.extend(self.drain_pending());
                actions
            }
            SessionEvent::RemoteAnswer(sdp) => {
                if self.state != SessionState::Negotiating {
                    return Vec::new();
                }
                self.has_remote_description = true;
                let mut actions = vec![SessionAction::ApplyRemoteAnswer(sdp)];
                actions.extend(self.drain_pending());
                actions
            }
            SessionEvent::RemoteIce(candidate) => {
                if candidate.is_mdns() {
                    return vec![SessionAction::DiscardMdns(candidate)];
                }
                if !self.has_remote_description {
                    // applied on the transition into a state with a
                    // remote description
                    self.pending_ice.push(candidate);
                    return Vec::new();
                }
                vec![SessionAction::ApplyIce(candidate)]
            }
            SessionEvent::LocalIce(candidate) => match self.state {
                SessionState::Negotiating | SessionState::Connected => {
                    vec![SessionAction::EmitIce(candidate)]
                }
                _ => Vec::new(),
            },
            SessionEvent::IceConnected => {
                if self.state == SessionState::Negotiating {
                    self.state = SessionState::Connected;
                }
                Vec::new()
            }
            SessionEvent::Shutdown => {
                self.state = SessionState::Closed;
                vec![SessionAction::Teardown]
            }
        }
    }

    fn drain_pending(&mut self) -> Vec<SessionAction> {
        std::mem::take(&mut self.pending_ice)
            .into_iter()
            .map(SessionAction::ApplyIce)
            .collect()
    }
}

/// Address of a live session: its event queue plus a state watch.
#[derive(Clone)]
pub struct SessionHandle {
    events: mpsc::UnboundedSender<SessionEvent>,
    state_rx: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub fn send(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed || self.events.is_closed()
    }

    /// Watch for state changes, used by tests and the endpoint.
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }
}

/// The executor half: owns the branch, interprets machine actions.
pub struct SessionController;

impl SessionController {
    /// Wire a freshly attached branch to its event queue and start the
    /// executor. The `Attached` event is already queued on return.
    pub fn spawn(
        camera: String,
        client_id: String,
        branch: Arc<PeerBranch>,
        sender: SignalingSender,
    ) -> SessionHandle {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);

        branch.wire_events(event_tx.clone());
        let _ = event_tx.send(SessionEvent::Attached);

        tokio::spawn(run_session(
            camera,
            client_id,
            branch,
            sender,
            event_rx,
            state_tx,
        ));

        SessionHandle {
            events: event_tx,
            state_rx,
        }
    }
}

async fn run_session(
    camera: String,
    client_id: String,
    branch: Arc<PeerBranch>,
    sender: SignalingSender,
    mut event_rx: mpsc::UnboundedReceiver<SessionEvent>,
    state_tx: watch::Sender<SessionState>,
) {
    let mut machine = SessionMachine::new();
    let mut last_state = machine.state();

    'events: while let Some(event) = event_rx.recv().await {
        let actions = machine.handle(event);
        let _ = state_tx.send(machine.state());

        for action in actions {
            if let Err(e) = apply_action(&camera, &client_id, &branch, &sender, action).await {
                warn!("[{}/{}] session action failed: {}", camera, client_id, e);
                machine.handle(SessionEvent::Shutdown);
                let _ = state_tx.send(machine.state());
                break 'events;
            }
        }

        if machine.state() != last_state {
            debug!(
                "[{}/{}] session {} -> {}",
                camera,
                client_id,
                last_state,
                machine.state()
            );
            last_state = machine.state();
        }
        if machine.state() == SessionState::Closed {
            break;
        }
    }

    branch.close().await;
    let _ = state_tx.send(SessionState::Closed);
    info!("[{}/{}] session closed", camera, client_id);
}

async fn apply_action(
    camera: &str,
    client_id: &str,
    branch: &PeerBranch,
    sender: &SignalingSender,
    action: SessionAction,
) -> Result<()> {
    match action {
        SessionAction::CreateAndSendOffer => {
            let sdp = branch.create_offer().await?;
            sender.send(Envelope::offer(camera, client_id, &sdp)?)?;
            debug!("[{}/{}] offer sent", camera, client_id);
        }
        SessionAction::ApplyRemoteOffer(sdp) => {
            let answer = branch.accept_remote_offer(sdp).await?;
            sender.send(Envelope::answer(camera, client_id, &answer)?)?;
            debug!("[{}/{}] answer sent", camera, client_id);
        }
        SessionAction::ApplyRemoteAnswer(sdp) => {
            branch.set_remote_answer(sdp).await?;
        }
        SessionAction::ApplyIce(candidate) => {
            branch.add_ice_candidate(candidate).await?;
        }
        SessionAction::EmitIce(candidate) => {
            sender.send(Envelope::ice(
                camera,
                client_id,
                &candidate.candidate,
                candidate.sdp_mline_index,
                candidate.sdp_mid,
            ))?;
        }
        SessionAction::DiscardMdns(candidate) => {
            warn!(
                "[{}/{}] mDNS candidate discarded: {}",
                camera, client_id, candidate.candidate
            );
        }
        SessionAction::Teardown => {
            branch.close().await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(s: &str) -> IceCandidateMsg {
        IceCandidateMsg {
            candidate: s.to_string(),
            sdp_mline_index: 0,
            sdp_mid: None,
        }
    }

    #[test]
    fn happy_path_reaches_connected() {
        let mut m = SessionMachine::new();
        assert_eq!(m.state(), SessionState::Idle);

        let actions = m.handle(SessionEvent::Attached);
        assert_eq!(actions, vec![SessionAction::CreateAndSendOffer]);
        assert_eq!(m.state(), SessionState::Negotiating);

        let actions = m.handle(SessionEvent::RemoteAnswer("v=0".into()));
        assert_eq!(actions, vec![SessionAction::ApplyRemoteAnswer("v=0".into())]);

        let actions = m.handle(SessionEvent::RemoteIce(candidate(
            "candidate:1 1 UDP 2122260223 10.0.0.2 54321 typ host",
        )));
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], SessionAction::ApplyIce(_)));

        m.handle(SessionEvent::IceConnected);
        assert_eq!(m.state(), SessionState::Connected);
    }

    #[test]
    fn early_ice_is_buffered_and_drained() {
        let mut m = SessionMachine::new();
        m.handle(SessionEvent::Attached);

        // candidates before any remote description
        assert!(m
            .handle(SessionEvent::RemoteIce(candidate("candidate:1 host")))
            .is_empty());
        assert!(m
            .handle(SessionEvent::RemoteIce(candidate("candidate:2 host")))
            .is_empty());
        assert_eq!(m.pending_ice_len(), 2);

        let actions = m.handle(SessionEvent::RemoteAnswer("v=0".into()));
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0], SessionAction::ApplyRemoteAnswer("v=0".into()));
        assert_eq!(
            actions[1],
            SessionAction::ApplyIce(candidate("candidate:1 host"))
        );
        assert_eq!(
            actions[2],
            SessionAction::ApplyIce(candidate("candidate:2 host"))
        );
        assert_eq!(m.pending_ice_len(), 0);
    }

    #[test]
    fn mdns_candidates_discarded_without_state_change() {
        let mut m = SessionMachine::new();
        m.handle(SessionEvent::Attached);

        let mdns = candidate("candidate:1 1 UDP 2122260223 abcd.local 54321 typ host");
        let actions = m.handle(SessionEvent::RemoteIce(mdns.clone()));
        assert_eq!(actions, vec![SessionAction::DiscardMdns(mdns)]);
        assert_eq!(m.pending_ice_len(), 0);
        assert_eq!(m.state(), SessionState::Negotiating);
    }

    #[test]
    fn viewer_offer_is_answered() {
        let mut m = SessionMachine::new();
        m.handle(SessionEvent::Attached);
        let actions = m.handle(SessionEvent::RemoteOffer("v=0 viewer".into()));
        assert_eq!(
            actions,
            vec![SessionAction::ApplyRemoteOffer("v=0 viewer".into())]
        );
        assert_eq!(m.state(), SessionState::Negotiating);
    }

    #[test]
    fn local_ice_forwarded_while_negotiating_and_connected() {
        let mut m = SessionMachine::new();
        m.handle(SessionEvent::Attached);
        let c = candidate("candidate:1 host");
        assert_eq!(
            m.handle(SessionEvent::LocalIce(c.clone())),
            vec![SessionAction::EmitIce(c.clone())]
        );
        m.handle(SessionEvent::RemoteAnswer("v=0".into()));
        m.handle(SessionEvent::IceConnected);
        assert_eq!(
            m.handle(SessionEvent::LocalIce(c.clone())),
            vec![SessionAction::EmitIce(c)]
        );
    }

    #[test]
    fn shutdown_tears_down_from_any_state() {
        for prior in [
            Vec::new(),
            vec![SessionEvent::Attached],
            vec![
                SessionEvent::Attached,
                SessionEvent::RemoteAnswer("v=0".into()),
                SessionEvent::IceConnected,
            ],
        ] {
            let mut m = SessionMachine::new();
            for event in prior {
                m.handle(event);
            }
            let actions = m.handle(SessionEvent::Shutdown);
            assert_eq!(actions, vec![SessionAction::Teardown]);
            assert_eq!(m.state(), SessionState::Closed);
        }
    }

    #[test]
    fn closed_ignores_everything() {
        let mut m = SessionMachine::new();
        m.handle(SessionEvent::Shutdown);
        assert!(m.handle(SessionEvent::Attached).is_empty());
        assert!(m
            .handle(SessionEvent::RemoteAnswer("v=0".into()))
            .is_empty());
        assert!(m
            .handle(SessionEvent::RemoteIce(candidate("candidate:1")))
            .is_empty());
        assert_eq!(m.state(), SessionState::Closed);
    }

    #[test]
    fn events_processed_in_arrival_order() {
        // answer before ice: the ice applies directly; reversed, it
        // buffers. The order of the queue decides, nothing else.
        let mut forward = SessionMachine::new();
        forward.handle(SessionEvent::Attached);
        forward.handle(SessionEvent::RemoteAnswer("v=0".into()));
        let direct = forward.handle(SessionEvent::RemoteIce(candidate("candidate:1 host")));
        assert!(matches!(direct[0], SessionAction::ApplyIce(_)));

        let mut reversed = SessionMachine::new();
        reversed.handle(SessionEvent::Attached);
        let buffered = reversed.handle(SessionEvent::RemoteIce(candidate("candidate:1 host")));
        assert!(buffered.is_empty());
        assert_eq!(reversed.pending_ice_len(), 1);
    }
}
