//! Public client handle: one instance per logical session.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::connection::{Command, SessionState, Shared, run_session};
use crate::types::{ClientConfig, ClientError, ConnectionState, Payload};

/// A reconnecting STOMP-over-WebSocket pub/sub client.
///
/// All methods are non-blocking: network I/O and reconnection delays run on
/// a background session task and report back through the callbacks supplied
/// to [`connect`](RealtimeClient::connect). One instance drives one logical
/// session; once the connection ends terminally ([`ConnectionState::Failed`]
/// or [`ConnectionState::Closed`]) a new session needs a new instance.
///
/// Dropping the client ends the session the same way
/// [`disconnect`](RealtimeClient::disconnect) does.
pub struct RealtimeClient {
    shared: Arc<Shared>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    config: ClientConfig,
}

impl RealtimeClient {
    pub fn new(config: ClientConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared::new()),
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            config,
        }
    }

    /// Open the connection, authenticating with `token` as a bearer
    /// credential.
    ///
    /// Returns immediately; the outcome arrives via the callbacks.
    /// `on_connect` fires on every successful (re)connect, `on_error` on
    /// every connection-level failure — both persist across automatic
    /// reconnects. Calling `connect` while a session is active, or after the
    /// connection ended terminally, is a no-op.
    pub fn connect<C, E>(&self, token: impl Into<String>, on_connect: C, on_error: E)
    where
        C: Fn() + Send + Sync + 'static,
        E: Fn(ClientError) + Send + Sync + 'static,
    {
        let url = match url::Url::parse(&self.config.endpoint) {
            Ok(url) => url,
            Err(e) => {
                on_error(ClientError::InvalidEndpoint(e.to_string()));
                return;
            }
        };
        if !matches!(url.scheme(), "ws" | "wss") {
            on_error(ClientError::InvalidEndpoint(format!(
                "unsupported scheme: {}",
                url.scheme()
            )));
            return;
        }

        if let Err(state) = self.shared.begin_session() {
            match state {
                ConnectionState::Failed | ConnectionState::Closed => {
                    tracing::warn!(
                        ?state,
                        "connect ignored: connection is terminal, create a new client"
                    );
                }
                _ => tracing::debug!(?state, "connect ignored: session already active"),
            }
            return;
        }

        let Some(cmd_rx) = self
            .cmd_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            tracing::error!("command channel already consumed, refusing to connect");
            return;
        };

        let session = SessionState {
            shared: self.shared.clone(),
            endpoint: self.config.endpoint.clone(),
            host: url.host_str().unwrap_or("localhost").to_string(),
            token: token.into(),
            timing: self.config.timing.clone(),
            on_connect: Arc::new(on_connect),
            on_error: Arc::new(on_error),
        };
        tokio::spawn(run_session(session, cmd_rx));
    }

    /// True only while the connection is established.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current connection state. [`ConnectionState::Failed`] means reconnect
    /// attempts are exhausted and the caller should fall back to polling.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Register `handler` for messages on `topic` and return the
    /// subscription identifier.
    ///
    /// Requires an established connection; fails with
    /// [`ClientError::SubscribeWhileDisconnected`] otherwise. The
    /// subscription survives transient reconnects without caller action.
    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        handler: impl Fn(Payload) + Send + Sync + 'static,
    ) -> Result<String, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::SubscribeWhileDisconnected);
        }
        let topic = topic.into();
        let id = self
            .shared
            .registry()
            .register(topic.clone(), Arc::new(handler));
        tracing::debug!(%id, %topic, "subscribed");
        if self
            .cmd_tx
            .send(Command::Subscribe {
                id: id.clone(),
                topic,
            })
            .is_err()
        {
            // The session task is gone; undo the registration.
            self.shared.registry().remove(&id);
            return Err(ClientError::SubscribeWhileDisconnected);
        }
        Ok(id)
    }

    /// Remove the subscription with identifier `id`. Unknown identifiers are
    /// ignored; unsubscribing twice is safe.
    pub fn unsubscribe(&self, id: &str) {
        if !self.shared.registry().remove(id) {
            tracing::debug!(id, "unsubscribe ignored: unknown id");
            return;
        }
        tracing::debug!(id, "unsubscribed");
        if self.is_connected() {
            let _ = self.cmd_tx.send(Command::Unsubscribe { id: id.to_string() });
        }
    }

    /// Serialize `payload` as JSON and send it to `destination`.
    ///
    /// Fails fast with [`ClientError::PublishWhileDisconnected`] when not
    /// connected — nothing is queued. Transport failures after hand-off
    /// surface through the `on_error` callback.
    pub fn publish<T: Serialize + ?Sized>(
        &self,
        destination: &str,
        payload: &T,
    ) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::PublishWhileDisconnected);
        }
        let body = serde_json::to_string(payload)?;
        self.cmd_tx
            .send(Command::Publish {
                destination: destination.to_string(),
                body,
            })
            .map_err(|_| ClientError::PublishWhileDisconnected)?;
        Ok(())
    }

    /// Close the connection and clear all subscriptions. Terminal for this
    /// instance: any pending reconnect becomes a no-op, and later `connect`
    /// calls are ignored. Idempotent.
    pub fn disconnect(&self) {
        if !self.shared.close() {
            tracing::debug!("disconnect ignored: already terminal");
            return;
        }
        self.shared.registry().clear();
        let _ = self.cmd_tx.send(Command::Disconnect);
        tracing::info!("disconnect requested");
    }
}
