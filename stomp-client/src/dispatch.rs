//! Inbound MESSAGE routing: topic lookup, payload decode, handler isolation.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, PoisonError};

use crate::frame::Frame;
use crate::registry::SubscriptionRegistry;
use crate::types::{MessageHandler, Payload};

/// Decode a message body: JSON when it parses, otherwise the raw text.
///
/// A decode failure downgrades the payload rather than dropping the frame;
/// the handler runs exactly once either way.
pub(crate) fn decode_payload(body: &str) -> Payload {
    match serde_json::from_str(body) {
        Ok(value) => Payload::Json(value),
        Err(e) => {
            tracing::warn!("message body is not valid JSON ({e}), delivering raw text");
            Payload::Text(body.to_string())
        }
    }
}

/// Route one MESSAGE frame to the handlers subscribed to its destination
/// topic. Frames arrive addressed by topic, not subscription id.
pub(crate) fn dispatch_message(registry: &Mutex<SubscriptionRegistry>, frame: &Frame) {
    let Some(topic) = frame.header_value("destination") else {
        tracing::warn!("MESSAGE frame without destination header, discarding");
        return;
    };
    // Snapshot the matching handlers so they run without the registry lock
    // held; a handler may unsubscribe (itself included) mid-dispatch.
    let handlers = registry
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .handlers_for(topic);
    if handlers.is_empty() {
        // Expected when an unsubscribe raced an in-flight message.
        tracing::debug!(topic, "no handler registered, discarding frame");
        return;
    }
    let payload = decode_payload(&frame.body);
    for handler in &handlers {
        invoke_handler(handler, payload.clone());
    }
}

/// Run one handler, containing panics so a misbehaving callback cannot take
/// down the session task or starve other topics.
fn invoke_handler(handler: &MessageHandler, payload: Payload) {
    if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
        tracing::error!("subscription handler panicked");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::frame::command;

    fn message_frame(topic: &str, body: &str) -> Frame {
        Frame::new(command::MESSAGE)
            .header("destination", topic)
            .header("message-id", "m-1")
            .body(body)
    }

    fn registry_with_recorder(topic: &str) -> (Mutex<SubscriptionRegistry>, Arc<Mutex<Vec<Payload>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let mut reg = SubscriptionRegistry::new();
        reg.register(
            topic.to_string(),
            Arc::new(move |p| {
                seen_clone.lock().unwrap().push(p);
            }),
        );
        (Mutex::new(reg), seen)
    }

    #[test]
    fn json_body_is_parsed() {
        let (reg, seen) = registry_with_recorder("/topic/t");
        dispatch_message(&reg, &message_frame("/topic/t", r#"{"type":"update"}"#));
        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![Payload::Json(serde_json::json!({"type": "update"}))]
        );
    }

    #[test]
    fn unparseable_body_is_delivered_as_raw_text() {
        let (reg, seen) = registry_with_recorder("/topic/t");
        dispatch_message(&reg, &message_frame("/topic/t", "plain text payload"));
        let seen = seen.lock().unwrap();
        // Delivered exactly once, unchanged.
        assert_eq!(*seen, vec![Payload::Text("plain text payload".to_string())]);
    }

    #[test]
    fn frame_for_unknown_topic_is_discarded() {
        let (reg, seen) = registry_with_recorder("/topic/t");
        dispatch_message(&reg, &message_frame("/topic/other", "{}"));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn panicking_handler_does_not_affect_other_handlers() {
        let mut reg = SubscriptionRegistry::new();
        reg.register(
            "/topic/t".to_string(),
            Arc::new(|_| panic!("handler bug")),
        );
        let delivered = Arc::new(AtomicU32::new(0));
        let delivered_clone = delivered.clone();
        reg.register(
            "/topic/t".to_string(),
            Arc::new(move |_| {
                delivered_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let reg = Mutex::new(reg);

        dispatch_message(&reg, &message_frame("/topic/t", "{}"));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);

        // The dispatcher survives and keeps delivering.
        dispatch_message(&reg, &message_frame("/topic/t", "{}"));
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn handler_may_unsubscribe_itself_mid_dispatch() {
        let reg = Arc::new(Mutex::new(SubscriptionRegistry::new()));
        let calls = Arc::new(AtomicU32::new(0));

        let reg_clone = reg.clone();
        let calls_clone = calls.clone();
        let id = reg.lock().unwrap().register(
            "/topic/t".to_string(),
            Arc::new(move |_| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                // Reentrant mutation must not corrupt dispatch.
                reg_clone.lock().unwrap().remove("sub-0");
            }),
        );
        assert_eq!(id, "sub-0");

        dispatch_message(&reg, &message_frame("/topic/t", "{}"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The entry is gone; later frames are discarded.
        dispatch_message(&reg, &message_frame("/topic/t", "{}"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
