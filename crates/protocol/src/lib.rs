//! Wire framing for the pulse socket endpoint.
//!
//! The gateway speaks the Engine.IO v4 transport grammar (long-polling and
//! WebSocket, with probe-based upgrade) and carries Socket.IO v5 packets in
//! transport messages, so stock browser client libraries connect unmodified.
//!
//! Layers, outermost first:
//! - `EnginePacket` — transport-level packets (`open`, `ping`, `message`, …),
//!   one ASCII digit plus data. Polling batches join packets with `0x1e`.
//! - `SocketPacket` — session-level packets inside `message` data
//!   (`connect`, `event`, `connect_error`, …).

use serde::{Deserialize, Serialize};

// ── Constants ────────────────────────────────────────────────────────────────

/// Engine.IO protocol revision expected in the `EIO` query parameter.
pub const ENGINE_VERSION: u32 = 4;

/// HTTP path the socket endpoint is mounted on.
pub const SOCKET_PATH: &str = "/socket.io/";

/// Separator between packets in a polling payload.
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Largest accepted inbound frame.
pub const MAX_PAYLOAD_BYTES: usize = 1_000_000;

/// Hard deadline for the whole handshake (transport open through `connected`).
pub const HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

/// Default server keepalive interval advertised in the open packet.
pub const DEFAULT_PING_INTERVAL_MS: u64 = 15_000;

/// Default inbound-silence window before a socket is considered dead.
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 30_000;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty packet")]
    Empty,
    #[error("unknown engine packet type '{0}'")]
    UnknownEnginePacket(char),
    #[error("unknown socket packet type '{0}'")]
    UnknownSocketPacket(char),
    #[error("malformed packet payload: {0}")]
    MalformedPayload(String),
    #[error("event packet is not an array or has no name")]
    MalformedEvent,
}

// ── Engine packets ───────────────────────────────────────────────────────────

/// Handshake parameters sent in the `open` packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPayload {
    pub sid: String,
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    pub max_payload: u64,
}

/// Transport-level packet. Encoded as a single ASCII type digit followed by
/// the packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnginePacket {
    /// `0{json}` — handshake response.
    Open(String),
    /// `1` — transport close.
    Close,
    /// `2` / `2probe` — server keepalive (client echoes `probe` during upgrade).
    Ping(Option<String>),
    /// `3` / `3probe` — keepalive reply.
    Pong(Option<String>),
    /// `4<data>` — carries a session-level packet.
    Message(String),
    /// `5` — client commits the transport upgrade.
    Upgrade,
    /// `6` — filler that terminates a pending poll.
    Noop,
}

impl EnginePacket {
    #[must_use]
    pub fn open(payload: &OpenPayload) -> Self {
        // OpenPayload has no map keys that can fail to serialize.
        Self::Open(serde_json::to_string(payload).unwrap_or_default())
    }

    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Open(json) => format!("0{json}"),
            Self::Close => "1".into(),
            Self::Ping(None) => "2".into(),
            Self::Ping(Some(data)) => format!("2{data}"),
            Self::Pong(None) => "3".into(),
            Self::Pong(Some(data)) => format!("3{data}"),
            Self::Message(data) => format!("4{data}"),
            Self::Upgrade => "5".into(),
            Self::Noop => "6".into(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let mut chars = raw.chars();
        let kind = chars.next().ok_or(ProtocolError::Empty)?;
        let rest = &raw[kind.len_utf8()..];
        match kind {
            '0' => Ok(Self::Open(rest.to_string())),
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping((!rest.is_empty()).then(|| rest.to_string()))),
            '3' => Ok(Self::Pong((!rest.is_empty()).then(|| rest.to_string()))),
            '4' => Ok(Self::Message(rest.to_string())),
            '5' => Ok(Self::Upgrade),
            '6' => Ok(Self::Noop),
            other => Err(ProtocolError::UnknownEnginePacket(other)),
        }
    }
}

/// Join encoded packets into a polling response body.
#[must_use]
pub fn encode_polling_payload(packets: &[String]) -> String {
    packets.join(&RECORD_SEPARATOR.to_string())
}

/// Split a polling request body into raw packet strings.
#[must_use]
pub fn split_polling_payload(body: &str) -> Vec<&str> {
    body.split(RECORD_SEPARATOR)
        .filter(|part| !part.is_empty())
        .collect()
}

// ── Socket packets ───────────────────────────────────────────────────────────

/// Session-level packet carried inside [`EnginePacket::Message`].
///
/// Only the default namespace is served; namespace prefixes are not parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    /// `0` / `0{json}` — namespace connect. Carries the auth payload on the
    /// request and `{"sid":…}` on the server reply.
    Connect(Option<serde_json::Value>),
    /// `1` — namespace disconnect.
    Disconnect,
    /// `2["name",payload]` — event. An ack id between the type digit and the
    /// array is accepted and preserved.
    Event {
        name: String,
        data: serde_json::Value,
        ack_id: Option<u64>,
    },
    /// `4{json}` — connect refused.
    ConnectError(serde_json::Value),
}

impl SocketPacket {
    /// Build an event packet with a single payload argument.
    #[must_use]
    pub fn event(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self::Event {
            name: name.into(),
            data,
            ack_id: None,
        }
    }

    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Connect(None) => "0".into(),
            Self::Connect(Some(value)) => format!("0{value}"),
            Self::Disconnect => "1".into(),
            Self::Event { name, data, ack_id } => {
                let args = if data.is_null() {
                    serde_json::json!([name])
                } else {
                    serde_json::json!([name, data])
                };
                match ack_id {
                    Some(id) => format!("2{id}{args}"),
                    None => format!("2{args}"),
                }
            },
            Self::ConnectError(value) => format!("4{value}"),
        }
    }

    /// Encode this packet ready for the transport layer.
    #[must_use]
    pub fn to_engine(&self) -> String {
        EnginePacket::Message(self.encode()).encode()
    }

    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let mut chars = raw.chars();
        let kind = chars.next().ok_or(ProtocolError::Empty)?;
        let rest = &raw[kind.len_utf8()..];
        match kind {
            '0' => {
                if rest.is_empty() {
                    return Ok(Self::Connect(None));
                }
                let value = serde_json::from_str(rest)
                    .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;
                Ok(Self::Connect(Some(value)))
            },
            '1' => Ok(Self::Disconnect),
            '2' => {
                // Optional ack id precedes the argument array.
                let array_start = rest.find('[').ok_or(ProtocolError::MalformedEvent)?;
                let ack_id = if array_start > 0 {
                    Some(
                        rest[..array_start]
                            .parse::<u64>()
                            .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?,
                    )
                } else {
                    None
                };
                let args: Vec<serde_json::Value> = serde_json::from_str(&rest[array_start..])
                    .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;
                let mut args = args.into_iter();
                let name = match args.next() {
                    Some(serde_json::Value::String(name)) => name,
                    _ => return Err(ProtocolError::MalformedEvent),
                };
                let data = args.next().unwrap_or(serde_json::Value::Null);
                Ok(Self::Event { name, data, ack_id })
            },
            '4' => {
                let value = if rest.is_empty() {
                    serde_json::Value::Null
                } else {
                    serde_json::from_str(rest)
                        .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?
                };
                Ok(Self::ConnectError(value))
            },
            other => Err(ProtocolError::UnknownSocketPacket(other)),
        }
    }
}

// ── Event names ──────────────────────────────────────────────────────────────

/// Events the gateway emits to clients.
pub mod server_events {
    pub const CONNECTED: &str = "connected";
    pub const CONNECTION_REJECTED: &str = "connection_rejected";
    pub const SUBSCRIBED: &str = "subscribed";
    pub const UNSUBSCRIBED: &str = "unsubscribed";
    pub const SUBSCRIPTION_ERROR: &str = "subscription_error";
    pub const PONG: &str = "pong";
    pub const FORCE_DISCONNECT: &str = "force_disconnect";
}

/// Events clients send to the gateway.
pub mod client_events {
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const PING: &str = "ping";
    pub const USER_ACTIVITY: &str = "user_activity";
    pub const NOTIFICATION_READ: &str = "notification_read";
}

/// Rejection and close reasons surfaced in `connection_rejected`,
/// `subscription_error`, and `force_disconnect` payloads.
pub mod reject_reasons {
    pub const AUTH_FAILED: &str = "auth_failed";
    pub const DUPLICATE_CONNECTION: &str = "duplicate_connection";
    pub const THROTTLED: &str = "throttled";
    pub const FORBIDDEN: &str = "forbidden";
    pub const IDLE_TIMEOUT: &str = "idle_timeout";
    pub const BACKPRESSURE: &str = "backpressure";
    pub const SHUTDOWN: &str = "shutdown";
    pub const ADMIN: &str = "admin";
    pub const SERVER_LIMIT: &str = "server_limit";
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_packet_round_trip() {
        let packets = [
            EnginePacket::Close,
            EnginePacket::Ping(None),
            EnginePacket::Ping(Some("probe".into())),
            EnginePacket::Pong(Some("probe".into())),
            EnginePacket::Message("2[\"ping\"]".into()),
            EnginePacket::Upgrade,
            EnginePacket::Noop,
        ];
        for packet in packets {
            assert_eq!(EnginePacket::parse(&packet.encode()).unwrap(), packet);
        }
    }

    #[test]
    fn open_packet_advertises_handshake() {
        let open = EnginePacket::open(&OpenPayload {
            sid: "abc".into(),
            upgrades: vec!["websocket".into()],
            ping_interval: 15_000,
            ping_timeout: 30_000,
            max_payload: MAX_PAYLOAD_BYTES as u64,
        });
        let encoded = open.encode();
        assert!(encoded.starts_with("0{"));
        assert!(encoded.contains("\"sid\":\"abc\""));
        assert!(encoded.contains("\"pingInterval\":15000"));
        assert!(encoded.contains("\"upgrades\":[\"websocket\"]"));
    }

    #[test]
    fn engine_packet_rejects_garbage() {
        assert!(matches!(
            EnginePacket::parse(""),
            Err(ProtocolError::Empty)
        ));
        assert!(matches!(
            EnginePacket::parse("9"),
            Err(ProtocolError::UnknownEnginePacket('9'))
        ));
    }

    #[test]
    fn polling_payload_round_trip() {
        let packets = vec!["2".to_string(), "42[\"pong\",{}]".to_string()];
        let body = encode_polling_payload(&packets);
        assert_eq!(body, "2\u{1e}42[\"pong\",{}]");
        assert_eq!(split_polling_payload(&body), vec!["2", "42[\"pong\",{}]"]);
    }

    #[test]
    fn split_ignores_empty_records() {
        assert!(split_polling_payload("").is_empty());
        assert_eq!(split_polling_payload("2\u{1e}").len(), 1);
    }

    #[test]
    fn socket_connect_with_auth() {
        let packet = SocketPacket::parse(r#"0{"token":"abc123"}"#).unwrap();
        match packet {
            SocketPacket::Connect(Some(value)) => {
                assert_eq!(value["token"], "abc123");
            },
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn socket_event_round_trip() {
        let packet = SocketPacket::event("subscribe", serde_json::json!({"channel": "public.news"}));
        let encoded = packet.encode();
        assert_eq!(encoded, r#"2["subscribe",{"channel":"public.news"}]"#);
        assert_eq!(SocketPacket::parse(&encoded).unwrap(), packet);
    }

    #[test]
    fn socket_event_without_payload() {
        let packet = SocketPacket::event("ping", serde_json::Value::Null);
        assert_eq!(packet.encode(), r#"2["ping"]"#);
        let parsed = SocketPacket::parse(r#"2["ping"]"#).unwrap();
        match parsed {
            SocketPacket::Event { name, data, .. } => {
                assert_eq!(name, "ping");
                assert!(data.is_null());
            },
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn socket_event_with_ack_id() {
        let parsed = SocketPacket::parse(r#"213["subscribe",{"channel":"forum.7"}]"#).unwrap();
        match parsed {
            SocketPacket::Event { name, ack_id, .. } => {
                assert_eq!(name, "subscribe");
                assert_eq!(ack_id, Some(13));
            },
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn socket_event_malformed() {
        assert!(SocketPacket::parse("2").is_err());
        assert!(SocketPacket::parse("2{}").is_err());
        assert!(SocketPacket::parse("2[42]").is_err());
        assert!(SocketPacket::parse(r#"2xx["ping"]"#).is_err());
    }

    #[test]
    fn message_nesting() {
        let event = SocketPacket::event("connected", serde_json::json!({"user_id": 42}));
        let wire = event.to_engine();
        assert!(wire.starts_with("42[\"connected\""));
        let engine = EnginePacket::parse(&wire).unwrap();
        match engine {
            EnginePacket::Message(inner) => {
                assert_eq!(SocketPacket::parse(&inner).unwrap(), event);
            },
            other => panic!("unexpected packet: {other:?}"),
        }
    }
}
