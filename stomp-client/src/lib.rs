//! Realtime messaging client for the mentorship platform.
//!
//! A reconnecting publish/subscribe client speaking a STOMP 1.2 subset over
//! WebSocket. Delivers conversation updates, chat messages, and read
//! receipts to the app without polling.
//!
//! # Features
//! - Bearer-token authentication in the CONNECT handshake
//! - Multiplexed topic subscriptions, replayed automatically after reconnect
//! - Exponential-backoff reconnection with a capped number of attempts
//! - Heart-beat negotiation and silent-connection detection
//! - JSON payload decoding with raw-text fallback
//!
//! When reconnection gives up the client enters
//! [`ConnectionState::Failed`]; falling back to a polling data path is the
//! caller's responsibility.
//!
//! # Example
//! ```no_run
//! use std::sync::{Arc, Once};
//! use stomp_client::{ClientConfig, Payload, RealtimeClient};
//!
//! let client = Arc::new(RealtimeClient::new(ClientConfig::new(
//!     "ws://localhost:8080/ws",
//! )));
//! let subscriber = Arc::clone(&client);
//! // `on_connect` also fires after automatic reconnects; subscriptions are
//! // replayed for us, so subscribe only once.
//! let subscribe_once = Once::new();
//! client.connect(
//!     "jwt-token",
//!     move || {
//!         subscribe_once.call_once(|| {
//!             let result = subscriber.subscribe("/topic/users.42.conversations", |payload| {
//!                 if let Payload::Json(update) = payload {
//!                     println!("conversation update: {update}");
//!                 }
//!             });
//!             if let Err(err) = result {
//!                 eprintln!("subscribe failed: {err}");
//!             }
//!         });
//!     },
//!     |err| eprintln!("connection error: {err}"),
//! );
//! ```

mod client;
mod connection;
mod dispatch;
pub mod frame;
mod registry;
mod types;

pub use client::RealtimeClient;
pub use types::{ClientConfig, ClientError, ConnectionState, Payload, TimingConfig};
