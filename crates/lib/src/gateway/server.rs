//! Gateway HTTP server (single port).

use crate::config::{self, Config};
use crate::gateway::protocol::{MessagesQuery, MessagesResponse};
use crate::ingest::IngestOutcome;
use crate::normalize::Transport;
use crate::relay::Relay;
use crate::sender::{SendError, SendRequest};
use crate::slack::signature::{self, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::slack::{InboundEvent, SlackClient, SocketModeListener};
use crate::store::MessageStore;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

/// Shared state for request handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub relay: Arc<Relay>,
    /// When Some, `/slack/events` requests must carry a valid Slack signature.
    pub signing_secret: Option<String>,
}

/// Build the router: health, send/query API, and the Slack events webhook.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/api/send-message", post(send_message))
        .route("/api/messages", get(list_messages))
        .route("/slack/events", post(slack_events))
        .with_state(state)
}

/// Run the gateway; binds to config.gateway.bind:config.gateway.port and blocks until shutdown (Ctrl+C or SIGTERM).
/// `config_path` locates the default database file.
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        log::warn!(
            "gateway bound to {}: /api routes are unauthenticated, keep this behind a trusted proxy",
            bind
        );
    }

    let bot_token = config::resolve_bot_token(&config);
    let app_token = config::resolve_app_token(&config);
    let signing_secret = config::resolve_signing_secret(&config);
    if bot_token.is_none() {
        log::warn!("SLACK_BOT_TOKEN not configured; outbound sends will fail");
    }
    if signing_secret.is_none() {
        log::warn!("SLACK_SIGNING_SECRET not configured; /slack/events requests are not verified");
    }

    let db_path = config::resolve_database_path(&config, &config_path);
    let store = MessageStore::open(&db_path).await?;
    log::info!("message log at {}", db_path.display());

    let slack = Arc::new(SlackClient::new(
        config::resolve_api_base(&config),
        bot_token,
        app_token,
    ));
    let socket = if config::socket_mode_enabled(&config) {
        Some(Arc::new(SocketModeListener::new(slack.clone())))
    } else {
        None
    };
    let relay = Arc::new(Relay::new(store, slack, socket));
    relay.initialize().await;

    let state = GatewayState {
        config: Arc::new(config.clone()),
        relay: relay.clone(),
        signing_secret,
    };
    let app = router(state);

    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server exited");
    // In-flight requests have finished; stop the socket listener and drain its queue.
    relay.shutdown().await;
    served?;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, draining connections");
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// POST /slack/events: Events API webhook. Verifies the signature, answers url_verification,
/// and only responds once the message has been written (or dropped).
async fn slack_events(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if let Some(ref secret) = state.signing_secret {
        let now = chrono::Utc::now().timestamp();
        if let Err(e) = signature::verify(
            secret,
            header_str(&headers, TIMESTAMP_HEADER),
            header_str(&headers, SIGNATURE_HEADER),
            &body,
            now,
        ) {
            log::warn!("rejecting slack event: {}", e);
            return (StatusCode::UNAUTHORIZED, Json(json!({ "error": e.to_string() })));
        }
    }

    let event = match InboundEvent::from_slice(&body) {
        Ok(e) => e,
        Err(e) => {
            log::debug!("slack event body is not JSON: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "invalid JSON body" })),
            );
        }
    };

    match state.relay.ingestor().ingest(event, Transport::Webhook).await {
        IngestOutcome::Challenge(challenge) => {
            (StatusCode::OK, Json(json!({ "challenge": challenge })))
        }
        IngestOutcome::Skipped(reason) => (
            StatusCode::OK,
            Json(json!({ "success": true, "info": reason.describe() })),
        ),
        // A failed write is already logged; Slack gets 200 so it does not retry into the same failure.
        IngestOutcome::Stored(_) | IngestOutcome::Dropped(_) => {
            (StatusCode::OK, Json(json!({ "success": true })))
        }
    }
}

/// POST /api/send-message with `{ user_id, text, channel_id? }`.
async fn send_message(State(state): State<GatewayState>, body: Bytes) -> (StatusCode, Json<Value>) {
    let req: SendRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "No data provided" })),
            )
        }
    };
    match state.relay.sender().send(req).await {
        Ok(message) => (
            StatusCode::OK,
            Json(json!({ "success": true, "message": message })),
        ),
        Err(SendError::Validation(msg)) => (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))),
        Err(SendError::RecordedSendButStorageFailed {
            channel_id,
            ts,
            source,
        }) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "success": false,
                "sent": true,
                "channel_id": channel_id,
                "ts": ts,
                "error": format!("message sent but not recorded: {}", source),
            })),
        ),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "success": false, "error": e.to_string() })),
        ),
    }
}

/// GET /api/messages: filtered, newest-first page of the message log.
async fn list_messages(
    State(state): State<GatewayState>,
    query: Result<Query<MessagesQuery>, QueryRejection>,
) -> Result<Json<MessagesResponse>, (StatusCode, Json<Value>)> {
    let Query(query) = query.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.body_text() })),
        )
    })?;
    let filter = query
        .into_filter()
        .map_err(|e| (StatusCode::BAD_REQUEST, Json(json!({ "error": e }))))?;
    let messages = state.relay.store().query(&filter).await.map_err(|e| {
        log::error!("querying messages failed: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to query messages" })),
        )
    })?;
    Ok(Json(MessagesResponse {
        count: messages.len(),
        messages,
    }))
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<Value> {
    let socket_mode = state
        .relay
        .socket_state()
        .map(|s| s.as_str())
        .unwrap_or("disabled");
    let database = if state.relay.store().is_healthy().await {
        "ok"
    } else {
        "unavailable"
    };
    Json(json!({
        "runtime": "running",
        "port": state.config.gateway.port,
        "socketMode": socket_mode,
        "database": database,
    }))
}
