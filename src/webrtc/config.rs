//! WebRTC configuration.
//!
//! The default is a LAN deployment: no STUN, no TURN, host candidates
//! only. Servers can be added for routed networks.

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

/// Queue depth of a viewer branch (leaky towards slow receivers).
pub const BRANCH_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs; empty on LAN.
    pub stun_servers: Vec<String>,
    /// TURN server configuration; unused in the default deployment.
    pub turn_servers: Vec<TurnServer>,
}

impl WebRtcConfig {
    pub fn to_rtc_configuration(&self) -> RTCConfiguration {
        let mut ice_servers = Vec::new();
        for stun in &self.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun.clone()],
                ..Default::default()
            });
        }
        for turn in &self.turn_servers {
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}
