//! WebSocket Client für den Signaling-Relay
//!
//! Verwaltet die WebSocket-Verbindung zum Relay:
//! - Getrennte Read/Write-Tasks
//! - Heartbeat per Ping
//! - Event-basierte Weitergabe eingehender Envelopes

use super::adapter::SignalingChannel;
use super::messages::SignalingEnvelope;
use crate::call_engine::ParticipantId;
use futures::{Sink, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling relay")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Verbunden mit dem Relay
    Connected,

    /// Verbindung getrennt
    Disconnected,

    /// Eingehendes Envelope
    Envelope(SignalingEnvelope),
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für den Relay
pub struct SignalingClient {
    url: Url,
    participant: ParticipantId,
    state: Arc<RwLock<ClientState>>,
    tx: mpsc::Sender<Message>,
    event_tx: broadcast::Sender<SignalingEvent>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Verbindet mit dem Relay und startet die Hintergrund-Tasks
    pub async fn connect(
        relay_url: &str,
        participant: ParticipantId,
        heartbeat: Duration,
    ) -> Result<Self, SignalingError> {
        let url = relay_ws_url(relay_url, &participant)?;
        tracing::info!("Connecting to signaling relay: {}", url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (write, mut read) = ws_stream.split();
        let (tx, rx) = mpsc::channel::<Message>(100);
        let (event_tx, _) = broadcast::channel(100);
        let state = Arc::new(RwLock::new(ClientState { is_connected: true }));

        // Read-Task
        let read_state = Arc::clone(&state);
        let read_events = event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match SignalingEnvelope::from_json(&text) {
                        Ok(envelope) => {
                            tracing::debug!("Received {} envelope", envelope.kind);
                            let _ = read_events.send(SignalingEvent::Envelope(envelope));
                        }
                        Err(e) => tracing::warn!("Ignoring relay frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            read_state.write().is_connected = false;
            let _ = read_events.send(SignalingEvent::Disconnected);
        });

        // Write-Task
        let writer = tokio::spawn(write_loop(write, rx));

        let client = Self {
            url,
            participant,
            state,
            tx,
            event_tx,
            writer: Mutex::new(Some(writer)),
        };
        client.start_heartbeat(heartbeat);

        let _ = client.event_tx.send(SignalingEvent::Connected);
        Ok(client)
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    /// Schließt die Verbindung, nachdem alle wartenden Nachrichten raus sind
    ///
    /// Wartet höchstens `timeout` auf den Write-Task.
    pub async fn close(&self, timeout: Duration) {
        self.state.write().is_connected = false;
        let Some(writer) = self.writer.lock().take() else {
            return;
        };

        if self.tx.send(Message::Close(None)).await.is_err() {
            tracing::debug!("Write task already stopped");
        }
        match tokio::time::timeout(timeout, writer).await {
            Ok(_) => tracing::info!("Signaling connection closed"),
            Err(_) => tracing::warn!("Timed out flushing signaling messages"),
        }
    }

    /// Startet den Heartbeat-Task
    fn start_heartbeat(&self, period: Duration) {
        if period.is_zero() {
            return;
        }

        let tx = self.tx.clone();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if !state.read().is_connected {
                    break;
                }
                if let Err(e) = tx.try_send(Message::Ping(Vec::new())) {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
        });
    }
}

impl SignalingChannel for SignalingClient {
    fn send(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let text = envelope
            .to_json()
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        // try_send ist non-blocking
        self.tx
            .try_send(Message::Text(text))
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("url", &self.url.as_str())
            .field("participant", &self.participant)
            .field("state", &*self.state.read())
            .finish()
    }
}

/// Schreibt die Queue in den Socket; endet nach einem Close-Frame
async fn write_loop<S>(mut write: S, mut rx: mpsc::Receiver<Message>)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = write.send(msg).await {
            tracing::error!("Failed to send WebSocket message: {}", e);
            break;
        }
        if closing {
            let _ = write.close().await;
            break;
        }
    }
}

/// Baut die WebSocket-URL für einen Teilnehmer
///
/// `http(s)` wird zu `ws(s)`, ein leerer Pfad zu `/ws`.
pub fn relay_ws_url(relay_url: &str, participant: &ParticipantId) -> Result<Url, SignalingError> {
    let mut url = Url::parse(relay_url).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SignalingError::InvalidUrl(format!(
                "unsupported scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::InvalidUrl(relay_url.to_string()))?;

    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }
    url.query_pairs_mut()
        .append_pair("userId", participant.as_str());

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_url_from_http() {
        let url = relay_ws_url("http://localhost:5000", &ParticipantId::new("U1")).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:5000/ws?userId=U1");
    }

    #[test]
    fn test_relay_url_keeps_custom_path() {
        let url = relay_ws_url("wss://relay.example.org/signal", &ParticipantId::new("a b")).unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.org/signal?userId=a+b");
    }

    #[tokio::test]
    async fn test_write_loop_flushes_queue_before_close() {
        let (sink, mut socket) = futures::channel::mpsc::unbounded::<Message>();
        let (tx, rx) = mpsc::channel(8);

        tx.send(Message::Text("call-end".to_string())).await.unwrap();
        tx.send(Message::Close(None)).await.unwrap();
        tx.send(Message::Text("late".to_string())).await.unwrap();
        write_loop(sink, rx).await;

        assert_eq!(
            socket.next().await,
            Some(Message::Text("call-end".to_string()))
        );
        assert_eq!(socket.next().await, Some(Message::Close(None)));
        assert_eq!(socket.next().await, None);
    }

    #[test]
    fn test_relay_url_rejects_other_schemes() {
        assert!(matches!(
            relay_ws_url("ftp://relay", &ParticipantId::new("U1")),
            Err(SignalingError::InvalidUrl(_))
        ));
        assert!(relay_ws_url("not a url", &ParticipantId::new("U1")).is_err());
    }
}
