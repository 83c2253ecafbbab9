//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.relay/config.json`) and environment.
//! Slack credentials are usually supplied through the environment; the file can hold them too.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Message log database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Slack credentials and transport options.
    #[serde(default)]
    pub slack: SlackConfig,
}

/// Gateway bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for the HTTP API and the Slack webhook (default 5000). Overridden by PORT env.
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

fn default_gateway_port() -> u16 {
    5000
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
        }
    }
}

/// Database location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// SQLite file. Relative paths are resolved against the config file's parent.
    /// Defaults to `messages.db` next to the config file. Overridden by RELAY_DATABASE_PATH env.
    pub path: Option<PathBuf>,
}

/// Slack app settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlackConfig {
    /// Bot token (xoxb-...) for chat.postMessage and conversations.open. Overridden by SLACK_BOT_TOKEN env.
    pub bot_token: Option<String>,
    /// App-level token (xapp-...) for Socket Mode. Overridden by SLACK_APP_TOKEN env.
    pub app_token: Option<String>,
    /// Signing secret for verifying Events API webhook requests. Overridden by SLACK_SIGNING_SECRET env.
    pub signing_secret: Option<String>,
    /// Set to false to keep Socket Mode off even when an app token is available.
    pub socket_mode: Option<bool>,
    /// Web API base URL (default https://slack.com/api). Overridden by SLACK_API_BASE env.
    pub api_base: Option<String>,
}

/// Prefer a non-empty env value, then a non-empty config value.
fn env_or(env_value: Option<String>, config_value: Option<&String>) -> Option<String> {
    env_value
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config_value
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve the Slack bot token: env SLACK_BOT_TOKEN overrides config.
pub fn resolve_bot_token(config: &Config) -> Option<String> {
    env_or(
        std::env::var("SLACK_BOT_TOKEN").ok(),
        config.slack.bot_token.as_ref(),
    )
}

/// Resolve the Slack app-level token: env SLACK_APP_TOKEN overrides config.
pub fn resolve_app_token(config: &Config) -> Option<String> {
    env_or(
        std::env::var("SLACK_APP_TOKEN").ok(),
        config.slack.app_token.as_ref(),
    )
}

/// Resolve the webhook signing secret: env SLACK_SIGNING_SECRET overrides config.
pub fn resolve_signing_secret(config: &Config) -> Option<String> {
    env_or(
        std::env::var("SLACK_SIGNING_SECRET").ok(),
        config.slack.signing_secret.as_ref(),
    )
}

/// Resolve the Slack Web API base: env SLACK_API_BASE, then config, then None (client default).
pub fn resolve_api_base(config: &Config) -> Option<String> {
    env_or(
        std::env::var("SLACK_API_BASE").ok(),
        config.slack.api_base.as_ref(),
    )
}

/// Socket Mode runs when it is not disabled and both the app and bot tokens resolve.
pub fn socket_mode_enabled(config: &Config) -> bool {
    config.slack.socket_mode.unwrap_or(true)
        && resolve_app_token(config).is_some()
        && resolve_bot_token(config).is_some()
}

/// Apply the PORT env override, if it parses.
pub fn apply_port_override(config: &mut Config) {
    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|p| p.trim().parse::<u16>().ok())
    {
        config.gateway.port = port;
    }
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("RELAY_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".relay").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path (or the default path). Missing file => default config.
/// Returns the config and the path that was used (for resolving the database location).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

/// Resolve the database file: RELAY_DATABASE_PATH env, then `database.path`, then `messages.db` beside the config.
pub fn resolve_database_path(config: &Config, config_path: &Path) -> PathBuf {
    if let Some(p) = std::env::var("RELAY_DATABASE_PATH")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        return PathBuf::from(p);
    }
    database_path_from_config(config, config_path)
}

fn database_path_from_config(config: &Config, config_path: &Path) -> PathBuf {
    let config_parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match &config.database.path {
        Some(d) if !d.as_os_str().is_empty() => {
            if d.is_absolute() {
                d.clone()
            } else {
                config_parent.join(d)
            }
        }
        _ => config_parent.join("messages.db"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gateway_port_and_bind() {
        let g = GatewayConfig::default();
        assert_eq!(g.port, 5000);
        assert_eq!(g.bind, "127.0.0.1");
    }

    #[test]
    fn parses_camel_case_slack_section() {
        let config: Config = serde_json::from_str(
            r#"{"slack":{"botToken":"xoxb-1","socketMode":false},"gateway":{"port":8080}}"#,
        )
        .unwrap();
        assert_eq!(config.slack.bot_token.as_deref(), Some("xoxb-1"));
        assert_eq!(config.slack.socket_mode, Some(false));
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.gateway.bind, "127.0.0.1");
    }

    #[test]
    fn env_value_wins_and_blank_values_are_ignored() {
        let cfg = Some("from-config".to_string());
        assert_eq!(
            env_or(Some(" from-env ".to_string()), cfg.as_ref()).as_deref(),
            Some("from-env")
        );
        assert_eq!(
            env_or(Some("   ".to_string()), cfg.as_ref()).as_deref(),
            Some("from-config")
        );
        let blank = Some("  ".to_string());
        assert_eq!(env_or(None, blank.as_ref()), None);
    }

    #[test]
    fn database_path_default_sits_next_to_config() {
        let config = Config::default();
        let path = Path::new("/home/user/.relay/config.json");
        assert_eq!(
            database_path_from_config(&config, path),
            PathBuf::from("/home/user/.relay/messages.db")
        );
    }

    #[test]
    fn database_path_override_relative_and_absolute() {
        let mut config = Config::default();
        let path = Path::new("/home/user/.relay/config.json");
        config.database.path = Some(PathBuf::from("data/log.db"));
        assert_eq!(
            database_path_from_config(&config, path),
            PathBuf::from("/home/user/.relay/data/log.db")
        );
        config.database.path = Some(PathBuf::from("/var/lib/relay.db"));
        assert_eq!(
            database_path_from_config(&config, path),
            PathBuf::from("/var/lib/relay.db")
        );
    }
}
