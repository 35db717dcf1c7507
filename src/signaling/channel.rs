//! The long-lived full-duplex channel a camera keeps to its room.
//!
//! Modeled as a small trait so the endpoint can run against an
//! in-process fake in tests. The real implementation is a WebSocket
//! client with a 10-second reconnect backoff; outbound messages go
//! through one queue per channel, so at most one write is in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};

/// Backoff between reconnect attempts after any transport error.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// What the channel reports up to the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Message(String),
    Disconnected,
}

/// Outbound half of a signaling channel.
pub trait SignalingTransport: Send + Sync {
    /// Queue one text frame for delivery. Fails only when the channel
    /// is shut down for good.
    fn send(&self, text: String) -> Result<()>;
    /// Graceful shutdown: flush, close frame, stop reconnecting.
    fn shutdown(&self);
}

/// WebSocket client channel bound to `ws://host:port/<camera>`.
pub struct WsSignalingChannel {
    out_tx: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

impl WsSignalingChannel {
    /// Spawn the channel task. Inbound traffic and connection state
    /// changes arrive on the returned receiver.
    pub fn spawn(url: String) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let channel = Arc::new(Self {
            out_tx,
            closed: closed.clone(),
        });

        tokio::spawn(run_channel(url, event_tx, out_rx, closed));
        (channel, event_rx)
    }
}

impl SignalingTransport for WsSignalingChannel {
    fn send(&self, text: String) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AppError::SignalingTransport("channel is shut down".into()));
        }
        self.out_tx
            .send(text)
            .map_err(|_| AppError::SignalingTransport("channel task gone".into()))
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Connect-read-write loop with reconnect. Lives until shutdown.
async fn run_channel(
    url: String,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
) {
    loop {
        if closed.load(Ordering::Acquire) {
            break;
        }

        let stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((stream, response)) => {
                info!("signaling channel up: {} ({})", url, response.status());
                stream
            }
            Err(e) => {
                warn!("signaling connect to {} failed: {}", url, e);
                let _ = event_tx.send(TransportEvent::Disconnected);
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        let _ = event_tx.send(TransportEvent::Connected);

        let (mut writer, mut reader) = stream.split();
        let mut channel_down = false;

        while !channel_down {
            tokio::select! {
                outbound = out_rx.recv() => {
                    match outbound {
                        Some(text) => {
                            // sends are serialized here: the next frame
                            // is not taken until this one is flushed
                            if let Err(e) = writer.send(Message::Text(text.into())).await {
                                warn!("signaling write failed: {}", e);
                                channel_down = true;
                            }
                        }
                        None => {
                            closed.store(true, Ordering::Release);
                            channel_down = true;
                        }
                    }
                }
                inbound = reader.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            let _ = event_tx.send(TransportEvent::Message(text.to_string()));
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("signaling channel closed by peer");
                            channel_down = true;
                        }
                        Some(Ok(_)) => {
                            // binary and raw frames are not part of the
                            // protocol
                        }
                        Some(Err(e)) => {
                            warn!("signaling read failed: {}", e);
                            channel_down = true;
                        }
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(250)), if closed.load(Ordering::Acquire) => {
                    channel_down = true;
                }
            }
        }

        if closed.load(Ordering::Acquire) {
            let _ = writer
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "shutting down".into(),
                })))
                .await;
            let _ = event_tx.send(TransportEvent::Disconnected);
            break;
        }

        let _ = event_tx.send(TransportEvent::Disconnected);
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
    debug!("signaling channel task for {} done", url);
}
