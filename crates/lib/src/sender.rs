//! Outbound sends: post through the chat API, then record what was sent.

use crate::slack::ChatApi;
use crate::store::{Direction, MessageStore, NewMessage, StorageError, StoredMessage};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Body of `POST /api/send-message`. Fields are optional so validation can name what is missing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("{0}")]
    Validation(String),
    #[error("could not open a direct channel with {user_id}: {reason}")]
    DestinationResolutionFailed { user_id: String, reason: String },
    #[error("slack rejected the message: {code}")]
    TransportRejected { code: String },
    /// The platform accepted the message; only the local record is missing.
    #[error("message was sent to {channel_id} (ts {ts}) but could not be recorded: {source}")]
    RecordedSendButStorageFailed {
        channel_id: String,
        ts: String,
        source: StorageError,
    },
}

pub struct Sender {
    api: Arc<dyn ChatApi>,
    store: MessageStore,
}

impl Sender {
    pub fn new(api: Arc<dyn ChatApi>, store: MessageStore) -> Self {
        Self { api, store }
    }

    /// Send `text` to `channel_id`, or to the user's direct channel when no channel is given.
    pub async fn send(&self, req: SendRequest) -> Result<StoredMessage, SendError> {
        let user_id = req
            .user_id
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .ok_or_else(|| SendError::Validation("user_id is required".to_string()))?;
        let text = req
            .text
            .ok_or_else(|| SendError::Validation("text is required".to_string()))?;
        let explicit_channel = req
            .channel_id
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());

        let is_direct = explicit_channel.is_none();
        let channel_id = match explicit_channel {
            Some(c) => c,
            None => self
                .api
                .open_direct_channel(&user_id)
                .await
                .map_err(|e| SendError::DestinationResolutionFailed {
                    user_id: user_id.clone(),
                    reason: e.code(),
                })?,
        };

        let posted = self
            .api
            .post_message(&channel_id, &text)
            .await
            .map_err(|e| {
                log::warn!("send to {} rejected: {}", channel_id, e);
                SendError::TransportRejected { code: e.code() }
            })?;

        // Slack's answer names the canonical channel id.
        let channel_id = posted.channel.clone();
        let mut metadata = Map::new();
        metadata.insert("direction".to_string(), Value::from(Direction::Outgoing.as_str()));
        metadata.insert("transportTimestamp".to_string(), Value::String(posted.ts.clone()));
        metadata.insert("isDirect".to_string(), Value::Bool(is_direct));

        let record = NewMessage {
            user_id,
            channel_id: channel_id.clone(),
            text,
            timestamp: None,
            direction: Direction::Outgoing,
            dedup_key: None,
            metadata,
        };
        match self.store.append(record).await {
            Ok(stored) => {
                log::info!("message sent to {}", channel_id);
                Ok(stored)
            }
            Err(source) => {
                log::error!(
                    "message sent to {} (ts {}) but recording failed: {}",
                    channel_id,
                    posted.ts,
                    source
                );
                Err(SendError::RecordedSendButStorageFailed {
                    channel_id,
                    ts: posted.ts,
                    source,
                })
            }
        }
    }
}
