//! Connection management: session task, handshake, heartbeats, reconnection.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite;

use crate::dispatch::dispatch_message;
use crate::frame::{self, Frame, command};
use crate::registry::SubscriptionRegistry;
use crate::types::{ClientError, ConnectCallback, ConnectionState, ErrorCallback, TimingConfig};

// ---------------------------------------------------------------------------
// Type aliases for WebSocket split halves
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub(crate) type WsRead = futures_util::stream::SplitStream<WsStream>;
pub(crate) type WsWrite = futures_util::stream::SplitSink<WsStream, tungstenite::Message>;

// ---------------------------------------------------------------------------
// State shared between the client handle and the session task
// ---------------------------------------------------------------------------

pub(crate) struct Shared {
    state: Mutex<ConnectionState>,
    pub registry: Mutex<SubscriptionRegistry>,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Idle),
            registry: Mutex::new(SubscriptionRegistry::new()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        *self.lock_state()
    }

    /// Session-driven transition. Refused once a terminal state is reached,
    /// so a reconnect step racing `disconnect()` becomes a no-op.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut guard = self.lock_state();
        if guard.is_terminal() {
            return false;
        }
        *guard = next;
        true
    }

    /// Caller-initiated connect. Only `Idle` may begin a session; every
    /// other state means a session already ran or is still running.
    pub fn begin_session(&self) -> Result<(), ConnectionState> {
        let mut guard = self.lock_state();
        match *guard {
            ConnectionState::Idle => {
                *guard = ConnectionState::Connecting;
                Ok(())
            }
            other => Err(other),
        }
    }

    /// Caller-initiated disconnect: mark terminal. Returns true if this call
    /// performed the transition (idempotent otherwise).
    pub fn close(&self) -> bool {
        let mut guard = self.lock_state();
        if guard.is_terminal() {
            return false;
        }
        *guard = ConnectionState::Closed;
        true
    }

    pub fn registry(&self) -> MutexGuard<'_, SubscriptionRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Commands from the client handle
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) enum Command {
    Subscribe { id: String, topic: String },
    Unsubscribe { id: String },
    Publish { destination: String, body: String },
    Disconnect,
}

// ---------------------------------------------------------------------------
// Reconnect policy
// ---------------------------------------------------------------------------

/// Delay before reconnect attempt `attempt` (1-indexed):
/// `base × multiplier^attempt`, saturating.
pub(crate) fn reconnect_delay(timing: &TimingConfig, attempt: u32) -> Duration {
    let factor = timing.backoff_multiplier.saturating_pow(attempt);
    timing.base_reconnect_delay.saturating_mul(factor)
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

pub(crate) struct SessionState {
    pub shared: Arc<Shared>,
    pub endpoint: String,
    /// Virtual host sent in the CONNECT `host` header.
    pub host: String,
    pub token: String,
    pub timing: TimingConfig,
    pub on_connect: ConnectCallback,
    pub on_error: ErrorCallback,
}

/// Negotiated heart-beat intervals, client's perspective.
struct Heartbeat {
    send: Option<Duration>,
    recv: Option<Duration>,
}

enum SessionEnd {
    CloseRequested,
    ConnectionLost(ClientError),
}

/// Drive one logical connection: connect, run, reconnect with backoff until
/// terminal. The callbacks supplied at connect time persist across automatic
/// reconnects.
pub(crate) async fn run_session(p: SessionState, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
    let mut attempts: u32 = 0;
    loop {
        if !p.shared.transition(ConnectionState::Connecting) {
            return;
        }
        tracing::info!(endpoint = %p.endpoint, "connecting");

        match tokio::time::timeout(p.timing.connect_timeout, establish(&p)).await {
            Ok(Ok((mut write, read, heartbeat))) => {
                if !drain_stale_commands(&mut cmd_rx) {
                    // disconnect() raced the handshake
                    p.shared.close();
                    let _ = write_frame(&mut write, &frame::disconnect_frame()).await;
                    return;
                }
                match replay_subscriptions(&mut write, &p.shared).await {
                    Ok(()) => {
                        if !p.shared.transition(ConnectionState::Connected) {
                            return;
                        }
                        attempts = 0;
                        tracing::info!("connected");
                        (p.on_connect)();
                        match run_connected(&p, write, read, heartbeat, &mut cmd_rx).await {
                            SessionEnd::CloseRequested => {
                                p.shared.close();
                                tracing::info!("session closed");
                                return;
                            }
                            SessionEnd::ConnectionLost(e) => {
                                tracing::warn!("connection lost: {e}");
                                (p.on_error)(e);
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("failed to replay subscriptions: {e}");
                        (p.on_error)(e);
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::warn!("connect failed: {e}");
                (p.on_error)(e);
            }
            Err(_) => {
                let e = ClientError::Transport("connect timed out".to_string());
                tracing::warn!("{e}");
                (p.on_error)(e);
            }
        }

        // --- Reconnect scheduling ---
        if !p.shared.transition(ConnectionState::Disconnected) {
            return;
        }
        if attempts >= p.timing.max_reconnect_attempts {
            if p.shared.transition(ConnectionState::Failed) {
                tracing::error!(attempts, "reconnect attempts exhausted, giving up");
                (p.on_error)(ClientError::ReconnectExhausted { attempts });
            }
            return;
        }
        attempts += 1;
        let delay = reconnect_delay(&p.timing, attempts);
        tracing::info!(attempt = attempts, ?delay, "scheduling reconnect");
        if !wait_for_retry(delay, &mut cmd_rx).await {
            p.shared.close();
            tracing::info!("pending reconnect cancelled");
            return;
        }
    }
}

/// Open the transport and perform the STOMP handshake.
async fn establish(p: &SessionState) -> Result<(WsWrite, WsRead, Heartbeat), ClientError> {
    let (ws, _response) = tokio_tungstenite::connect_async(p.endpoint.as_str()).await?;
    let (mut write, mut read) = ws.split();

    let connect = frame::connect_frame(&p.token, &p.host, p.timing.heartbeat_interval);
    write_frame(&mut write, &connect).await?;
    let connected = wait_for_connected(&mut read).await?;

    let (send, recv) = frame::negotiate_heartbeat(
        p.timing.heartbeat_interval,
        connected.header_value("heart-beat"),
    )?;
    Ok((write, read, Heartbeat { send, recv }))
}

async fn wait_for_connected(read: &mut WsRead) -> Result<Frame, ClientError> {
    while let Some(msg) = read.next().await {
        let msg = msg?;
        let tungstenite::Message::Text(raw) = msg else {
            continue;
        };
        if frame::is_heartbeat(&raw) {
            continue;
        }
        let f = frame::parse_frame(&raw)?;
        match f.command.as_str() {
            command::CONNECTED => return Ok(f),
            command::ERROR => return Err(ClientError::Handshake(f.error_reason())),
            other => {
                tracing::debug!(command = other, "ignoring frame before CONNECTED");
            }
        }
    }
    Err(ClientError::Transport(
        "connection closed before CONNECTED".to_string(),
    ))
}

/// Reissue SUBSCRIBE frames for every live registry entry, preserving the
/// original identifiers and topics. The caller is not involved.
async fn replay_subscriptions(write: &mut WsWrite, shared: &Shared) -> Result<(), ClientError> {
    let entries = shared.registry().replay_set();
    if entries.is_empty() {
        return Ok(());
    }
    tracing::info!(count = entries.len(), "replaying subscriptions");
    for (id, topic) in entries {
        write_frame(write, &frame::subscribe_frame(&id, &topic)).await?;
    }
    Ok(())
}

/// Pump the established connection until it is lost or closed.
async fn run_connected(
    p: &SessionState,
    mut write: WsWrite,
    mut read: WsRead,
    heartbeat: Heartbeat,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
) -> SessionEnd {
    let mut last_inbound = Instant::now();
    let mut send_ticker = heartbeat
        .send
        .map(|d| tokio::time::interval_at(Instant::now() + d, d));

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(tungstenite::Message::Text(raw))) => {
                    last_inbound = Instant::now();
                    if frame::is_heartbeat(&raw) {
                        tracing::trace!("heartbeat received");
                        continue;
                    }
                    match frame::parse_frame(&raw) {
                        Ok(f) => {
                            if let Some(end) = handle_frame(p, &f) {
                                return end;
                            }
                        }
                        Err(e) => tracing::warn!("failed to decode frame: {e}"),
                    }
                }
                Some(Ok(tungstenite::Message::Close(_))) => {
                    return SessionEnd::ConnectionLost(ClientError::Transport(
                        "server closed the connection".to_string(),
                    ));
                }
                Some(Ok(_)) => {
                    // Ping, pong, and binary frames count as liveness.
                    last_inbound = Instant::now();
                }
                Some(Err(e)) => return SessionEnd::ConnectionLost(e.into()),
                None => {
                    return SessionEnd::ConnectionLost(ClientError::Transport(
                        "websocket stream ended".to_string(),
                    ));
                }
            },

            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Subscribe { id, topic }) => {
                    if let Err(e) = write_frame(&mut write, &frame::subscribe_frame(&id, &topic)).await {
                        return SessionEnd::ConnectionLost(e);
                    }
                }
                Some(Command::Unsubscribe { id }) => {
                    if let Err(e) = write_frame(&mut write, &frame::unsubscribe_frame(&id)).await {
                        return SessionEnd::ConnectionLost(e);
                    }
                }
                Some(Command::Publish { destination, body }) => {
                    if let Err(e) = write_frame(&mut write, &frame::send_frame(&destination, &body)).await {
                        return SessionEnd::ConnectionLost(e);
                    }
                }
                Some(Command::Disconnect) | None => {
                    // A dropped handle counts as a disconnect.
                    let _ = write_frame(&mut write, &frame::disconnect_frame()).await;
                    let _ = write.close().await;
                    return SessionEnd::CloseRequested;
                }
            },

            _ = maybe_tick(send_ticker.as_mut()) => {
                tracing::trace!("heartbeat sent");
                if let Err(e) = write
                    .send(tungstenite::Message::Text(frame::HEARTBEAT_FRAME.into()))
                    .await
                {
                    return SessionEnd::ConnectionLost(e.into());
                }
            }

            _ = idle_wait(heartbeat.recv, last_inbound, p.timing.heartbeat_grace) => {
                return SessionEnd::ConnectionLost(ClientError::Transport(
                    "heartbeat timeout".to_string(),
                ));
            }
        }
    }
}

/// React to one inbound frame. Returns `Some` to end the connected phase.
fn handle_frame(p: &SessionState, f: &Frame) -> Option<SessionEnd> {
    match f.command.as_str() {
        command::MESSAGE => {
            if p.shared.state() != ConnectionState::Connected {
                tracing::debug!("dropping frame received while shutting down");
                return None;
            }
            dispatch_message(&p.shared.registry, f);
            None
        }
        command::ERROR => {
            // Brokers close the socket after ERROR; treat it as loss.
            Some(SessionEnd::ConnectionLost(ClientError::Transport(format!(
                "broker error: {}",
                f.error_reason()
            ))))
        }
        command::RECEIPT => {
            tracing::debug!(receipt = ?f.header_value("receipt-id"), "receipt");
            None
        }
        other => {
            tracing::debug!(command = other, "ignoring unexpected frame");
            None
        }
    }
}

async fn write_frame(write: &mut WsWrite, frame: &Frame) -> Result<(), ClientError> {
    write
        .send(tungstenite::Message::Text(frame.serialize().into()))
        .await?;
    Ok(())
}

async fn maybe_tick(ticker: Option<&mut tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn idle_wait(interval: Option<Duration>, last_inbound: Instant, grace: Duration) {
    match interval {
        Some(d) => tokio::time::sleep_until(last_inbound + d + grace).await,
        None => std::future::pending::<()>().await,
    }
}

/// Drop commands queued while the connection was down. Subscribe intents are
/// preserved in the registry and restored by replay; publishes from the dead
/// connection are not retried. Returns false if a disconnect was queued.
fn drain_stale_commands(cmd_rx: &mut mpsc::UnboundedReceiver<Command>) -> bool {
    loop {
        match cmd_rx.try_recv() {
            Ok(Command::Disconnect) => return false,
            Ok(cmd) => tracing::debug!(?cmd, "dropping command queued while disconnected"),
            Err(mpsc::error::TryRecvError::Empty) => return true,
            Err(mpsc::error::TryRecvError::Disconnected) => return false,
        }
    }
}

/// Sleep for the backoff delay, remaining responsive to disconnect. Returns
/// false if the session must terminate instead of retrying.
async fn wait_for_retry(delay: Duration, cmd_rx: &mut mpsc::UnboundedReceiver<Command>) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return true,
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Disconnect) | None => return false,
                Some(cmd) => tracing::debug!(?cmd, "dropping command queued while disconnected"),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
