//! STOMP 1.2 wire protocol: frame model, serializer/parser, heartbeats.
//!
//! ## Frame format
//!
//! ```text
//! COMMAND
//! header-name:header-value
//! ...
//!
//! body^@
//! ```
//!
//! One STOMP frame per WebSocket text message, NUL-terminated. A lone EOL is
//! a heartbeat frame. Header octets `\` CR LF `:` are escaped as `\\` `\r`
//! `\n` `\c` in every frame except CONNECT/CONNECTED.

use std::time::Duration;

use crate::types::ClientError;

// ---------------------------------------------------------------------------
// Protocol command constants
// ---------------------------------------------------------------------------

pub mod command {
    pub const CONNECT: &str = "CONNECT";
    pub const CONNECTED: &str = "CONNECTED";
    pub const SUBSCRIBE: &str = "SUBSCRIBE";
    pub const UNSUBSCRIBE: &str = "UNSUBSCRIBE";
    pub const SEND: &str = "SEND";
    pub const MESSAGE: &str = "MESSAGE";
    pub const ERROR: &str = "ERROR";
    pub const RECEIPT: &str = "RECEIPT";
    pub const DISCONNECT: &str = "DISCONNECT";
}

/// Protocol version offered and accepted.
pub const STOMP_VERSION: &str = "1.2";

/// Wire representation of an outgoing heartbeat.
pub const HEARTBEAT_FRAME: &str = "\n";

/// True for the heartbeat frames either peer may send between real frames.
pub fn is_heartbeat(raw: &str) -> bool {
    matches!(raw, "\n" | "\r\n")
}

// ---------------------------------------------------------------------------
// Frame model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: &str) -> Self {
        Frame {
            command: command.to_string(),
            ..Default::default()
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value recorded for `name`, per the STOMP repeated-header rule.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Human-readable reason from an ERROR frame: the `message` header if
    /// present, otherwise the body.
    pub fn error_reason(&self) -> String {
        if let Some(msg) = self.header_value("message") {
            return msg.to_string();
        }
        let body = self.body.trim();
        if body.is_empty() {
            "no error details from broker".to_string()
        } else {
            body.to_string()
        }
    }

    pub fn serialize(&self) -> String {
        let escape = !matches!(
            self.command.as_str(),
            command::CONNECT | command::CONNECTED
        );
        let mut out = String::with_capacity(self.body.len() + 64);
        out.push_str(&self.command);
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

pub fn parse_frame(raw: &str) -> Result<Frame, ClientError> {
    let data = raw.strip_suffix('\0').unwrap_or(raw);
    let (head, body) = if let Some(split) = data.split_once("\r\n\r\n") {
        split
    } else if let Some(split) = data.split_once("\n\n") {
        split
    } else {
        return Err(ClientError::MalformedFrame(
            "missing header terminator".to_string(),
        ));
    };

    let mut lines = head.lines();
    let command = lines
        .next()
        .map(str::trim_end)
        .unwrap_or_default()
        .to_string();
    if command.is_empty() {
        return Err(ClientError::MalformedFrame("empty command".to_string()));
    }
    let escaped = !matches!(command.as_str(), command::CONNECT | command::CONNECTED);

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line.split_once(':').ok_or_else(|| {
            ClientError::MalformedFrame(format!("header without colon: {line}"))
        })?;
        if escaped {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    Ok(Frame {
        command,
        headers,
        body: body.to_string(),
    })
}

fn escape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(s: &str) -> Result<String, ClientError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            Some(other) => {
                return Err(ClientError::MalformedFrame(format!(
                    "invalid header escape \\{other}"
                )));
            }
            None => {
                return Err(ClientError::MalformedFrame(
                    "truncated header escape".to_string(),
                ));
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Heart-beat negotiation
// ---------------------------------------------------------------------------

/// Parse a `heart-beat` header value: `"sx,sy"` in milliseconds.
pub fn parse_heart_beat(value: &str) -> Result<(u64, u64), ClientError> {
    let malformed = || ClientError::MalformedFrame(format!("invalid heart-beat header: {value}"));
    let (sx, sy) = value.split_once(',').ok_or_else(malformed)?;
    let sx = sx.trim().parse::<u64>().map_err(|_| malformed())?;
    let sy = sy.trim().parse::<u64>().map_err(|_| malformed())?;
    Ok((sx, sy))
}

/// Negotiate effective heart-beat intervals per STOMP 1.2: each direction
/// runs at the larger of what one side can do and the other wants, and is
/// disabled when either side says 0. A missing server header means no
/// heartbeats.
///
/// Returns `(outgoing, incoming)` from the client's perspective.
#[allow(clippy::type_complexity)]
pub fn negotiate_heartbeat(
    local: Duration,
    server: Option<&str>,
) -> Result<(Option<Duration>, Option<Duration>), ClientError> {
    let local_ms = local.as_millis() as u64;
    let (server_send, server_want) = match server {
        Some(value) => parse_heart_beat(value)?,
        None => (0, 0),
    };
    let direction = |ours: u64, theirs: u64| {
        if ours == 0 || theirs == 0 {
            None
        } else {
            Some(Duration::from_millis(ours.max(theirs)))
        }
    };
    Ok((
        direction(local_ms, server_want),
        direction(local_ms, server_send),
    ))
}

// ---------------------------------------------------------------------------
// Frame builders
// ---------------------------------------------------------------------------

pub fn connect_frame(token: &str, host: &str, heartbeat: Duration) -> Frame {
    let ms = heartbeat.as_millis();
    Frame::new(command::CONNECT)
        .header("accept-version", STOMP_VERSION)
        .header("host", host)
        .header("heart-beat", &format!("{ms},{ms}"))
        .header("Authorization", &format!("Bearer {token}"))
}

pub fn subscribe_frame(id: &str, destination: &str) -> Frame {
    Frame::new(command::SUBSCRIBE)
        .header("id", id)
        .header("destination", destination)
}

pub fn unsubscribe_frame(id: &str) -> Frame {
    Frame::new(command::UNSUBSCRIBE).header("id", id)
}

pub fn send_frame(destination: &str, body: &str) -> Frame {
    Frame::new(command::SEND)
        .header("destination", destination)
        .header("content-type", "application/json")
        .header("content-length", &body.len().to_string())
        .body(body)
}

pub fn disconnect_frame() -> Frame {
    Frame::new(command::DISCONNECT)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
