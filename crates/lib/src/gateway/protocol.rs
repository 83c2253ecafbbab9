//! HTTP API wire types.

use crate::store::{Direction, MessageFilter, StoredMessage};
use serde::{Deserialize, Serialize};

/// Query string of `GET /api/messages`. Empty values are treated as absent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessagesQuery {
    pub user_id: Option<String>,
    pub channel_id: Option<String>,
    pub direction: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_count(name: &str, value: Option<String>) -> Result<Option<u32>, String> {
    non_empty(value)
        .map(|v| {
            v.parse::<u32>()
                .map_err(|_| format!("{} must be a non-negative integer", name))
        })
        .transpose()
}

impl MessagesQuery {
    /// Build a store filter; fails on an unknown direction or a non-numeric limit/offset.
    pub fn into_filter(self) -> Result<MessageFilter, String> {
        let direction = match non_empty(self.direction) {
            Some(d) => Some(d.parse::<Direction>()?),
            None => None,
        };
        Ok(MessageFilter {
            user_id: non_empty(self.user_id),
            channel_id: non_empty(self.channel_id),
            direction,
            limit: parse_count("limit", self.limit)?,
            offset: parse_count("offset", self.offset)?,
        })
    }
}

/// Body of `GET /api/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub count: usize,
    pub messages: Vec<StoredMessage>,
}
