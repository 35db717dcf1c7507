use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Probe timed out before the stream was fully described")]
    ProbeTimeout,

    #[error("Source unreachable: all probe attempts exhausted ({attempts})")]
    SourceUnreachable { attempts: u32 },

    #[error("Unsupported codec: {codec}")]
    UnsupportedCodec { codec: String },

    #[error("Branch attach failed: {0}")]
    BranchAttachFailed(String),

    #[error("Signaling parse error: {0}")]
    SignalingParse(String),

    #[error("Signaling transport error: {0}")]
    SignalingTransport(String),

    #[error("RTSP error: {0}")]
    Rtsp(String),

    #[error("Video error: {0}")]
    Video(String),

    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Camera not found: {0}")]
    CameraNotFound(String),

    #[error("Camera already exists: {0}")]
    CameraExists(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;

impl From<webrtc::Error> for AppError {
    fn from(e: webrtc::Error) -> Self {
        AppError::WebRtc(e.to_string())
    }
}
