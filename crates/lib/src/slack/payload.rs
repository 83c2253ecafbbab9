//! Slack inbound payload shapes, decoded into closed enums before normalization.
//!
//! Webhook bodies and Socket Mode `events_api` payloads share the Events API envelope:
//! `{ "type": "event_callback", "event": {...}, "event_id", "team_id" }`.

use serde::Deserialize;
use serde_json::Value;

/// The `event` object of a message event. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MessageEvent {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub channel_type: Option<String>,
}

/// A message event together with its envelope identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub event: MessageEvent,
    pub event_id: Option<String>,
    pub team_id: Option<String>,
}

/// Every inbound payload is one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    IncomingMessage(MessageEnvelope),
    /// Endpoint ownership check; the challenge must be echoed back.
    VerificationChallenge { challenge: String },
    Unrecognized,
}

impl InboundEvent {
    /// Decode a webhook body or `events_api` payload. Never fails; unknown shapes are `Unrecognized`.
    pub fn decode(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return InboundEvent::Unrecognized;
        };
        let str_field = |name: &str| obj.get(name).and_then(|v| v.as_str()).map(String::from);

        if str_field("type").as_deref() == Some("url_verification") {
            return match str_field("challenge") {
                Some(challenge) => InboundEvent::VerificationChallenge { challenge },
                None => InboundEvent::Unrecognized,
            };
        }

        let Some(event) = obj.get("event") else {
            return InboundEvent::Unrecognized;
        };
        if event.get("type").and_then(|v| v.as_str()) != Some("message") {
            return InboundEvent::Unrecognized;
        }
        match serde_json::from_value::<MessageEvent>(event.clone()) {
            Ok(event) => InboundEvent::IncomingMessage(MessageEnvelope {
                event,
                event_id: str_field("event_id"),
                team_id: str_field("team_id"),
            }),
            Err(e) => {
                log::debug!("slack payload: message event did not decode: {}", e);
                InboundEvent::Unrecognized
            }
        }
    }

    /// Decode raw bytes. Invalid JSON is an error (the webhook answers 400); valid JSON never is.
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_slice(body)?;
        Ok(Self::decode(&value))
    }
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    typ: String,
    #[serde(default)]
    envelope_id: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    reason: Option<String>,
}

/// A Socket Mode frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketFrame {
    Hello,
    /// Slack is about to close this connection (e.g. `refresh_requested`); reconnect.
    Disconnect { reason: Option<String> },
    EventsApi { envelope_id: String, payload: Value },
    /// Slash commands, interactivity, etc. Acknowledged but not recorded.
    Other {
        envelope_id: Option<String>,
        kind: String,
    },
}

impl SocketFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let raw: RawFrame = serde_json::from_str(text)?;
        Ok(match (raw.typ.as_str(), raw.envelope_id) {
            ("hello", _) => SocketFrame::Hello,
            ("disconnect", _) => SocketFrame::Disconnect { reason: raw.reason },
            ("events_api", Some(envelope_id)) => SocketFrame::EventsApi {
                envelope_id,
                payload: raw.payload.unwrap_or(Value::Null),
            },
            (_, envelope_id) => SocketFrame::Other {
                envelope_id,
                kind: raw.typ,
            },
        })
    }

    pub fn envelope_id(&self) -> Option<&str> {
        match self {
            SocketFrame::EventsApi { envelope_id, .. } => Some(envelope_id),
            SocketFrame::Other { envelope_id, .. } => envelope_id.as_deref(),
            SocketFrame::Hello | SocketFrame::Disconnect { .. } => None,
        }
    }
}

/// The acknowledgment frame for an envelope.
pub fn ack_frame(envelope_id: &str) -> String {
    serde_json::json!({ "envelope_id": envelope_id }).to_string()
}
