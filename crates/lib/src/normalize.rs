//! Turns decoded inbound events into records for the message log.
//!
//! The normalizer filters non-message and bot-originated events and refuses to hand out the
//! same upstream event twice while it is still in the recently-seen window.

use crate::slack::{InboundEvent, MessageEnvelope};
use crate::store::{Direction, NewMessage};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

/// How many recent dedup keys are remembered.
const DEFAULT_SEEN_CAPACITY: usize = 4096;

/// Which ingress path delivered an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Webhook,
    Socket,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Webhook => "webhook",
            Transport::Socket => "socket",
        }
    }
}

/// Why an event produced no record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotAMessage,
    BotOriginated,
    MissingFields,
    Duplicate,
}

impl SkipReason {
    pub fn describe(&self) -> &'static str {
        match self {
            SkipReason::NotAMessage => "Ignored non-message event",
            SkipReason::BotOriginated => "Skipped bot message",
            SkipReason::MissingFields => "Skipped message without channel, user, or text",
            SkipReason::Duplicate => "Skipped duplicate event",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Message(NewMessage),
    Challenge(String),
    Skipped(SkipReason),
}

/// Bounded insertion-ordered set; the oldest key is evicted first.
struct SeenKeys {
    order: VecDeque<String>,
    keys: HashSet<String>,
    capacity: usize,
}

impl SeenKeys {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            keys: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns false if the key was already present.
    fn insert(&mut self, key: &str) -> bool {
        if self.keys.contains(key) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        self.order.push_back(key.to_string());
        self.keys.insert(key.to_string());
        true
    }

    fn remove(&mut self, key: &str) {
        if self.keys.remove(key) {
            self.order.retain(|k| k != key);
        }
    }
}

pub struct Normalizer {
    seen: Mutex<SeenKeys>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SEEN_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            seen: Mutex::new(SeenKeys::new(capacity)),
        }
    }

    pub fn normalize(&self, event: InboundEvent, transport: Transport) -> Normalized {
        match event {
            InboundEvent::VerificationChallenge { challenge } => Normalized::Challenge(challenge),
            InboundEvent::Unrecognized => Normalized::Skipped(SkipReason::NotAMessage),
            InboundEvent::IncomingMessage(envelope) => self.normalize_message(envelope, transport),
        }
    }

    /// Release a key so a redelivery of the same event is accepted again (used after a failed write).
    pub fn forget(&self, dedup_key: &str) {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(dedup_key);
    }

    fn normalize_message(&self, envelope: MessageEnvelope, transport: Transport) -> Normalized {
        let MessageEnvelope {
            event,
            event_id,
            team_id,
        } = envelope;

        if event.bot_id.is_some() || event.subtype.as_deref() == Some("bot_message") {
            return Normalized::Skipped(SkipReason::BotOriginated);
        }
        let channel = event.channel.filter(|c| !c.trim().is_empty());
        let user = event.user.filter(|u| !u.trim().is_empty());
        let (Some(channel_id), Some(user_id), Some(text)) = (channel, user, event.text) else {
            return Normalized::Skipped(SkipReason::MissingFields);
        };

        let dedup_key = dedup_key(event_id.as_deref(), event.ts.as_deref(), &channel_id);
        if let Some(ref key) = dedup_key {
            let fresh = self
                .seen
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(key);
            if !fresh {
                return Normalized::Skipped(SkipReason::Duplicate);
            }
        }

        let is_direct =
            event.channel_type.as_deref() == Some("im") || channel_id.starts_with('D');
        let mut metadata = Map::new();
        metadata.insert("direction".to_string(), Value::from(Direction::Incoming.as_str()));
        metadata.insert("transport".to_string(), Value::from(transport.as_str()));
        metadata.insert("isDirect".to_string(), Value::Bool(is_direct));
        metadata.insert("transportTimestamp".to_string(), opt_value(event.ts.clone()));
        metadata.insert("eventId".to_string(), opt_value(event_id));
        metadata.insert("teamId".to_string(), opt_value(team_id));
        if let Some(channel_type) = event.channel_type {
            metadata.insert("channelType".to_string(), Value::String(channel_type));
        }
        if let Some(subtype) = event.subtype {
            metadata.insert("subtype".to_string(), Value::String(subtype));
        }

        Normalized::Message(NewMessage {
            user_id,
            channel_id,
            text,
            timestamp: event.ts.as_deref().and_then(parse_slack_ts),
            direction: Direction::Incoming,
            dedup_key,
            metadata,
        })
    }
}

fn opt_value(v: Option<String>) -> Value {
    v.map(Value::String).unwrap_or(Value::Null)
}

/// `eventId:ts`; without an event id, `channel:ts` (Slack ts values are unique per channel).
fn dedup_key(event_id: Option<&str>, ts: Option<&str>, channel_id: &str) -> Option<String> {
    match (event_id, ts) {
        (Some(id), Some(ts)) => Some(format!("{}:{}", id, ts)),
        (Some(id), None) => Some(id.to_string()),
        (None, Some(ts)) => Some(format!("{}:{}", channel_id, ts)),
        (None, None) => None,
    }
}

/// Parse a Slack `ts` ("1700000000.000100": seconds and microseconds) into a UTC instant.
pub fn parse_slack_ts(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = ts.trim().split_once('.').unwrap_or((ts.trim(), ""));
    let secs: i64 = secs.parse().ok()?;
    let micros: u32 = if frac.is_empty() {
        0
    } else {
        if frac.len() > 6 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        format!("{:0<6}", frac).parse().ok()?
    };
    DateTime::from_timestamp(secs, micros * 1_000)
}
