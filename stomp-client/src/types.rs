//! Public types for the stomp-client crate.

use std::sync::Arc;
use std::time::Duration;

use tokio_tungstenite::tungstenite;

/// Callback invoked with every message delivered to a subscription's topic.
pub type MessageHandler = Arc<dyn Fn(Payload) + Send + Sync>;

/// Callback invoked each time the connection is established, including
/// automatic reconnects.
pub type ConnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Callback invoked for connection-level failures.
pub type ErrorCallback = Arc<dyn Fn(ClientError) + Send + Sync>;

/// Payload delivered to a message handler.
///
/// Message bodies are expected to be JSON. A body that fails to parse is
/// delivered as the raw text rather than dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Text(String),
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected.
    Idle,
    /// Transport connect and handshake in progress (initial or retry).
    Connecting,
    Connected,
    /// Transient; a reconnect attempt is scheduled.
    Disconnected,
    /// Terminal: reconnect attempts exhausted. Callers should fall back to a
    /// non-realtime data path.
    Failed,
    /// Terminal: caller-initiated disconnect.
    Closed,
}

impl ConnectionState {
    /// Terminal states issue no further connection attempts.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

/// Configuration for [`RealtimeClient`](crate::RealtimeClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://localhost:8080/ws`.
    pub endpoint: String,
    pub timing: TimingConfig,
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timing: TimingConfig::default(),
        }
    }
}

/// Tunable intervals and limits. The defaults match the deployed broker
/// contract; tests shrink them to keep wall-clock time out of assertions.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Base reconnect delay; attempt `n` waits `base × multiplier^n`.
    pub base_reconnect_delay: Duration,
    pub backoff_multiplier: u32,
    /// Consecutive failures tolerated before entering
    /// [`ConnectionState::Failed`].
    pub max_reconnect_attempts: u32,
    /// Heart-beat interval offered in CONNECT, both directions. Zero
    /// disables heartbeats.
    pub heartbeat_interval: Duration,
    /// Slack added to the negotiated incoming interval before the connection
    /// is declared dead.
    pub heartbeat_grace: Duration,
    /// Ceiling on transport connect plus handshake.
    pub connect_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            base_reconnect_delay: Duration::from_millis(1000),
            backoff_multiplier: 2,
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_millis(4000),
            heartbeat_grace: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Errors reported by this crate.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The broker rejected the CONNECT handshake (bad or expired credential,
    /// protocol error before CONNECTED).
    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    /// Connection loss detected by the client itself (stream ended,
    /// heartbeat timeout, session task gone).
    #[error("transport error: {0}")]
    Transport(String),

    #[error("cannot subscribe: not connected")]
    SubscribeWhileDisconnected,

    #[error("cannot publish: not connected")]
    PublishWhileDisconnected,

    #[error("payload encode error: {0}")]
    PayloadEncode(#[from] serde_json::Error),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Terminal; accompanies the [`ConnectionState::Failed`] state.
    #[error("reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },

    #[error("invalid endpoint URL: {0}")]
    InvalidEndpoint(String),
}

impl From<tungstenite::Error> for ClientError {
    fn from(e: tungstenite::Error) -> Self {
        ClientError::WebSocket(Box::new(e))
    }
}
