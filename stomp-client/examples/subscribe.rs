//! Subscribe to a topic on a STOMP-over-WebSocket broker.
//!
//! ```sh
//! cargo run -p stomp-client --example subscribe -- <ENDPOINT> <TOKEN> <TOPIC>
//! ```
//!
//! e.g.
//! ```sh
//! cargo run -p stomp-client --example subscribe -- \
//!     ws://localhost:8080/ws "$JWT" /topic/users.42.conversations
//! ```
//!
//! Message payloads are printed to stdout (pipe to `jq` for formatting);
//! status lines go to stderr.

use std::sync::{Arc, Once};

use stomp_client::{ClientConfig, ConnectionState, Payload, RealtimeClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let usage = "usage: subscribe <ENDPOINT> <TOKEN> <TOPIC>";
    let endpoint = args.first().ok_or(usage)?.clone();
    let token = args.get(1).ok_or(usage)?.clone();
    let topic = args.get(2).ok_or(usage)?.clone();

    let client = Arc::new(RealtimeClient::new(ClientConfig::new(endpoint)));

    let subscriber = Arc::clone(&client);
    // Subscriptions are replayed automatically after reconnects, so only the
    // first on_connect needs to subscribe.
    let subscribe_once = Once::new();
    client.connect(
        token,
        move || {
            eprintln!("[connected]");
            subscribe_once.call_once(|| {
                let result = subscriber.subscribe(topic.as_str(), |payload| match payload {
                    Payload::Json(value) => println!("{value}"),
                    Payload::Text(text) => println!("{text}"),
                });
                match result {
                    Ok(id) => eprintln!("[subscribed] {id}"),
                    Err(e) => eprintln!("[subscribe failed] {e}"),
                }
            });
        },
        |err| eprintln!("[error] {err}"),
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            client.disconnect();
        }
        _ = async {
            // Exit once the client gives up so the process doesn't hang
            // in a dead state.
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                if client.state() == ConnectionState::Failed {
                    break;
                }
            }
        } => {
            eprintln!("[failed] realtime connection gave up; fall back to polling");
        }
    }

    Ok(())
}
