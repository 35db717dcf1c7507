//! The signaling message envelope: one JSON object per text frame.
//!
//! Field names are the wire contract shared with the room server and
//! the viewers; they never change casing or spelling.

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Connection,
    Offer,
    Answer,
    Ice,
    Open,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Client,
    Camera,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetCode {
    Success,
    Fault,
}

/// The full envelope. Type-specific fields stay `None` when absent so
/// serialization round-trips exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<Sender>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ret: Option<RetCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

impl Envelope {
    fn outbound(message_type: MessageType, camera: &str, client_id: &str) -> Self {
        Self {
            message_type,
            client_id: Some(client_id.to_string()),
            camera: Some(camera.to_string()),
            sender: Some(Sender::Camera),
            ret: None,
            description: None,
            sdp: None,
            candidate: None,
            sdp_mline_index: None,
            sdp_mid: None,
        }
    }

    /// `connection` acknowledgement.
    pub fn connection_reply(
        camera: &str,
        client_id: &str,
        ret: RetCode,
        description: impl Into<String>,
    ) -> Self {
        let mut env = Self::outbound(MessageType::Connection, camera, client_id);
        env.ret = Some(ret);
        env.description = Some(description.into());
        env
    }

    /// Outbound SDP offer. An empty SDP is a bug upstream; refuse to
    /// build the message.
    pub fn offer(camera: &str, client_id: &str, sdp: &str) -> Result<Self> {
        if sdp.is_empty() {
            return Err(AppError::WebRtc("refusing to send an empty offer".into()));
        }
        let mut env = Self::outbound(MessageType::Offer, camera, client_id);
        env.sdp = Some(sdp.to_string());
        Ok(env)
    }

    /// Outbound SDP answer (viewer-initiated offers).
    pub fn answer(camera: &str, client_id: &str, sdp: &str) -> Result<Self> {
        if sdp.is_empty() {
            return Err(AppError::WebRtc("refusing to send an empty answer".into()));
        }
        let mut env = Self::outbound(MessageType::Answer, camera, client_id);
        env.sdp = Some(sdp.to_string());
        Ok(env)
    }

    /// Outbound trickle ICE candidate.
    pub fn ice(
        camera: &str,
        client_id: &str,
        candidate: &str,
        sdp_mline_index: u16,
        sdp_mid: Option<String>,
    ) -> Self {
        let mut env = Self::outbound(MessageType::Ice, camera, client_id);
        env.candidate = Some(candidate.to_string());
        env.sdp_mline_index = Some(sdp_mline_index);
        env.sdp_mid = sdp_mid;
        env
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| AppError::SignalingParse(e.to_string()))
    }
}

/// Map a connection URL path to its room id. An empty path (or bare
/// slash) lands in the `default` room.
pub fn room_from_path(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        "default".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_variant() {
        let messages = vec![
            Envelope::connection_reply("camera_1", "C1", RetCode::Success, "opened"),
            Envelope::connection_reply("camera_1", "C1", RetCode::Fault, "already started"),
            Envelope::offer("camera_1", "C1", "v=0\r\no=-").unwrap(),
            Envelope::answer("camera_1", "C1", "v=0\r\no=-").unwrap(),
            Envelope::ice(
                "camera_1",
                "C1",
                "candidate:1 1 UDP 2122260223 10.0.0.2 54321 typ host",
                0,
                Some("video0".into()),
            ),
        ];
        for msg in messages {
            let json = msg.to_json().unwrap();
            let parsed = Envelope::from_json(&json).unwrap();
            assert_eq!(parsed, msg);
        }
    }

    #[test]
    fn wire_field_names() {
        let env = Envelope::ice("cam", "C1", "candidate:1", 2, Some("video0".into()));
        let json = env.to_json().unwrap();
        assert!(json.contains("\"sdpMLineIndex\":2"));
        assert!(json.contains("\"sdpMid\":\"video0\""));
        assert!(json.contains("\"type\":\"ice\""));
        assert!(json.contains("\"sender\":\"camera\""));
    }

    #[test]
    fn absent_fields_stay_off_the_wire() {
        let env = Envelope::connection_reply("cam", "C1", RetCode::Success, "ok");
        let json = env.to_json().unwrap();
        assert!(!json.contains("sdp\""));
        assert!(!json.contains("candidate"));
    }

    #[test]
    fn inbound_parse_tolerates_extra_fields() {
        let raw = r#"{"type":"connection","client_id":"C1","ignored":true}"#;
        let env = Envelope::from_json(raw).unwrap();
        assert_eq!(env.message_type, MessageType::Connection);
        assert_eq!(env.client_id.as_deref(), Some("C1"));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            Envelope::from_json("{nope"),
            Err(AppError::SignalingParse(_))
        ));
        assert!(matches!(
            Envelope::from_json(r#"{"type":"teleport","client_id":"C1"}"#),
            Err(AppError::SignalingParse(_))
        ));
    }

    #[test]
    fn empty_sdp_refused() {
        assert!(Envelope::offer("cam", "C1", "").is_err());
        assert!(Envelope::answer("cam", "C1", "").is_err());
    }

    #[test]
    fn room_path_mapping() {
        assert_eq!(room_from_path(""), "default");
        assert_eq!(room_from_path("/"), "default");
        assert_eq!(room_from_path("/camera_1"), "camera_1");
        assert_eq!(room_from_path("camera_1"), "camera_1");
    }
}
