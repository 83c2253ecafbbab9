//! Slack Web API client (chat.postMessage, conversations.open, apps.connections.open).

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_API_BASE: &str = "https://slack.com/api";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ChatApiError {
    #[error("slack request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// Slack answered `ok: false`; holds the error code (e.g. `channel_not_found`).
    #[error("slack api error: {0}")]
    Api(String),
    #[error("slack {0} not configured")]
    MissingToken(&'static str),
}

impl ChatApiError {
    /// Short code for callers: Slack's own error code when there is one.
    pub fn code(&self) -> String {
        match self {
            ChatApiError::Api(code) => code.clone(),
            ChatApiError::Request(e) => e.to_string(),
            ChatApiError::MissingToken(which) => format!("{}_not_configured", which.replace(' ', "_")),
        }
    }
}

/// Result of a successful chat.postMessage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedMessage {
    pub channel: String,
    pub ts: String,
}

/// The chat platform operations the relay depends on. Injected so tests can substitute it.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn post_message(&self, channel: &str, text: &str) -> Result<PostedMessage, ChatApiError>;

    /// Open (or look up) the direct-message channel with a user; returns the channel id.
    async fn open_direct_channel(&self, user_id: &str) -> Result<String, ChatApiError>;
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConversationsOpenResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    channel: Option<ChannelRef>,
}

#[derive(Debug, Deserialize)]
struct ChannelRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ConnectionsOpenResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

/// Slack Web API client. Constructed once from config and shared.
#[derive(Clone)]
pub struct SlackClient {
    api_base: String,
    bot_token: Option<String>,
    app_token: Option<String>,
    client: reqwest::Client,
}

impl SlackClient {
    pub fn new(api_base: Option<String>, bot_token: Option<String>, app_token: Option<String>) -> Self {
        let api_base = api_base
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Self {
            api_base,
            bot_token,
            app_token,
            client: reqwest::Client::new(),
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        token: &str,
        body: serde_json::Value,
    ) -> Result<T, ChatApiError> {
        let url = format!("{}/{}", self.api_base, method);
        let res = self
            .client
            .post(&url)
            .bearer_auth(token)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ChatApiError::Api(format!("{} failed: {} {}", method, status, body)));
        }
        Ok(res.json().await?)
    }

    /// POST apps.connections.open with the app-level token; returns the wss:// URL for Socket Mode.
    pub async fn open_socket_url(&self) -> Result<String, ChatApiError> {
        let token = self
            .app_token
            .as_deref()
            .ok_or(ChatApiError::MissingToken("app token"))?;
        let data: ConnectionsOpenResponse = self
            .call("apps.connections.open", token, serde_json::json!({}))
            .await?;
        match (data.ok, data.url) {
            (true, Some(url)) => Ok(url),
            (_, _) => Err(ChatApiError::Api(
                data.error.unwrap_or_else(|| "no socket url returned".to_string()),
            )),
        }
    }
}

#[async_trait]
impl ChatApi for SlackClient {
    async fn post_message(&self, channel: &str, text: &str) -> Result<PostedMessage, ChatApiError> {
        let token = self
            .bot_token
            .as_deref()
            .ok_or(ChatApiError::MissingToken("bot token"))?;
        let data: PostMessageResponse = self
            .call(
                "chat.postMessage",
                token,
                serde_json::json!({ "channel": channel, "text": text }),
            )
            .await?;
        if !data.ok {
            return Err(ChatApiError::Api(
                data.error.unwrap_or_else(|| "unknown_error".to_string()),
            ));
        }
        let ts = data
            .ts
            .ok_or_else(|| ChatApiError::Api("missing ts in response".to_string()))?;
        Ok(PostedMessage {
            channel: data.channel.unwrap_or_else(|| channel.to_string()),
            ts,
        })
    }

    async fn open_direct_channel(&self, user_id: &str) -> Result<String, ChatApiError> {
        let token = self
            .bot_token
            .as_deref()
            .ok_or(ChatApiError::MissingToken("bot token"))?;
        let data: ConversationsOpenResponse = self
            .call(
                "conversations.open",
                token,
                serde_json::json!({ "users": user_id }),
            )
            .await?;
        match (data.ok, data.channel) {
            (true, Some(channel)) => Ok(channel.id),
            (_, _) => Err(ChatApiError::Api(
                data.error.unwrap_or_else(|| "unknown_error".to_string()),
            )),
        }
    }
}
