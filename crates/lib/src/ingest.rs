//! Inbound pipeline shared by both transports: normalize, then persist.

use crate::normalize::{Normalized, Normalizer, SkipReason, Transport};
use crate::slack::InboundEvent;
use crate::store::{MessageStore, StoredMessage};

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Stored(StoredMessage),
    /// Verification handshake; the caller must echo this token.
    Challenge(String),
    Skipped(SkipReason),
    /// The write failed; already logged. The event is dropped (upstream may redeliver).
    Dropped(String),
}

pub struct Ingestor {
    normalizer: Normalizer,
    store: MessageStore,
}

impl Ingestor {
    pub fn new(normalizer: Normalizer, store: MessageStore) -> Self {
        Self { normalizer, store }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Never fails: storage errors are logged and reported as `Dropped`.
    pub async fn ingest(&self, event: InboundEvent, transport: Transport) -> IngestOutcome {
        let message = match self.normalizer.normalize(event, transport) {
            Normalized::Message(m) => m,
            Normalized::Challenge(c) => return IngestOutcome::Challenge(c),
            Normalized::Skipped(reason) => {
                log::debug!("{} event skipped: {:?}", transport.as_str(), reason);
                return IngestOutcome::Skipped(reason);
            }
        };

        let dedup_key = message.dedup_key.clone();
        let (user_id, channel_id) = (message.user_id.clone(), message.channel_id.clone());
        match self.store.append(message).await {
            Ok(stored) => {
                log::info!(
                    "stored incoming message from {} in channel {} (via {})",
                    user_id,
                    channel_id,
                    transport.as_str()
                );
                IngestOutcome::Stored(stored)
            }
            Err(e) => {
                log::error!(
                    "dropping {} message from {} in {}: {}",
                    transport.as_str(),
                    user_id,
                    channel_id,
                    e
                );
                if let Some(key) = dedup_key {
                    self.normalizer.forget(&key);
                }
                IngestOutcome::Dropped(e.to_string())
            }
        }
    }
}
