//! Slack Socket Mode listener: a long-lived WebSocket delivering events as envelopes.
//!
//! Every envelope is acknowledged as soon as it is read, before any processing. Events are then
//! queued for the ingest task, so a slow database never delays an ack. On disconnect the
//! listener opens a fresh connection and keeps feeding the same queue.

use crate::slack::client::{ChatApiError, SlackClient};
use crate::slack::payload::{ack_frame, InboundEvent, SocketFrame};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
enum SocketModeError {
    #[error("opening connection: {0}")]
    Api(#[from] ChatApiError),
    #[error("websocket: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("websocket handshake timed out")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connected => "connected",
        }
    }
}

/// What to do with one text frame.
#[derive(Debug, PartialEq)]
struct FrameAction {
    ack: Option<String>,
    event: Option<InboundEvent>,
    reconnect: bool,
}

fn handle_frame(text: &str) -> FrameAction {
    let frame = match SocketFrame::parse(text) {
        Ok(f) => f,
        Err(e) => {
            log::debug!("socket mode: unparseable frame: {}", e);
            return FrameAction {
                ack: None,
                event: None,
                reconnect: false,
            };
        }
    };
    let ack = frame.envelope_id().map(ack_frame);
    match frame {
        SocketFrame::Hello => {
            log::debug!("socket mode: hello received");
            FrameAction {
                ack,
                event: None,
                reconnect: false,
            }
        }
        SocketFrame::Disconnect { reason } => {
            log::info!(
                "socket mode: server requested disconnect ({})",
                reason.as_deref().unwrap_or("no reason")
            );
            FrameAction {
                ack,
                event: None,
                reconnect: true,
            }
        }
        SocketFrame::EventsApi { payload, .. } => FrameAction {
            ack,
            event: Some(InboundEvent::decode(&payload)),
            reconnect: false,
        },
        SocketFrame::Other { kind, .. } => {
            log::debug!("socket mode: ignoring {} envelope", kind);
            FrameAction {
                ack,
                event: None,
                reconnect: false,
            }
        }
    }
}

pub struct SocketModeListener {
    slack: Arc<SlackClient>,
    running: AtomicBool,
    connected: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl SocketModeListener {
    pub fn new(slack: Arc<SlackClient>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            slack,
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            stop_tx,
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Start the connection loop; decoded events go to `events_tx`. The task ends after `stop`.
    pub fn start(self: Arc<Self>, events_tx: mpsc::Sender<InboundEvent>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        self.stop_tx.send_replace(false);
        log::info!("socket mode: starting listener");
        tokio::spawn(async move {
            run_socket_loop(self, events_tx).await;
        })
    }

    /// Stop reading frames and close the connection. Events already queued are still processed.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop_tx.send_replace(true);
    }

    async fn connect_and_serve(
        &self,
        events_tx: &mpsc::Sender<InboundEvent>,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), SocketModeError> {
        let connect = async {
            let url = self.slack.open_socket_url().await?;
            let (ws, _) =
                tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url.as_str()))
                    .await
                    .map_err(|_| SocketModeError::Timeout)??;
            Ok::<_, SocketModeError>(ws)
        };
        // Stop must win over a stalled connection attempt.
        let ws = tokio::select! {
            _ = stopped(stop_rx) => return Ok(()),
            ws = connect => ws?,
        };
        self.connected.store(true, Ordering::SeqCst);
        log::info!("socket mode: connected");

        let (mut sink, mut stream) = ws.split();
        loop {
            let next = tokio::select! {
                _ = stopped(stop_rx) => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                next = stream.next() => next,
            };
            let Some(msg) = next else {
                return Ok(());
            };
            match msg? {
                Message::Text(text) => {
                    let action = handle_frame(&text);
                    if let Some(ack) = action.ack {
                        sink.send(Message::Text(ack)).await?;
                    }
                    if let Some(event) = action.event {
                        if let Err(e) = events_tx.try_send(event) {
                            log::warn!("socket mode: dropping event, ingest queue unavailable: {}", e);
                        }
                    }
                    if action.reconnect {
                        return Ok(());
                    }
                }
                Message::Close(frame) => {
                    log::debug!("socket mode: server closed connection: {:?}", frame);
                    return Ok(());
                }
                _ => {}
            }
        }
    }
}

/// Resolves once `stop` has been called.
async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

async fn run_socket_loop(listener: Arc<SocketModeListener>, events_tx: mpsc::Sender<InboundEvent>) {
    let mut stop_rx = listener.stop_tx.subscribe();
    while listener.running() {
        match listener.connect_and_serve(&events_tx, &mut stop_rx).await {
            Ok(()) => log::info!("socket mode: connection closed"),
            Err(e) => log::warn!("socket mode: {}", e),
        }
        listener.connected.store(false, Ordering::SeqCst);
        if !listener.running() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            _ = stopped(&mut stop_rx) => {}
        }
    }
    listener.connected.store(false, Ordering::SeqCst);
    log::info!("socket mode: listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use serde_json::{json, Value};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn events_are_acked_and_forwarded() {
        let frame = json!({
            "type": "events_api",
            "envelope_id": "env-1",
            "payload": {
                "type": "event_callback", "event_id": "Ev1",
                "event": { "type": "message", "channel": "C1", "user": "U1", "text": "hi", "ts": "1.2" }
            }
        });
        let action = handle_frame(&frame.to_string());
        assert_eq!(action.ack, Some(ack_frame("env-1")));
        assert!(matches!(action.event, Some(InboundEvent::IncomingMessage(_))));
        assert!(!action.reconnect);
    }

    #[test]
    fn non_message_envelopes_are_still_acked() {
        let frame = json!({
            "type": "events_api",
            "envelope_id": "env-2",
            "payload": { "event": { "type": "reaction_added" } }
        });
        let action = handle_frame(&frame.to_string());
        assert_eq!(action.ack, Some(ack_frame("env-2")));
        assert_eq!(action.event, Some(InboundEvent::Unrecognized));

        let slash = handle_frame(r#"{"type":"slash_commands","envelope_id":"env-3"}"#);
        assert_eq!(slash.ack, Some(ack_frame("env-3")));
        assert_eq!(slash.event, None);
    }

    #[test]
    fn disconnect_requests_reconnect_and_garbage_is_ignored() {
        let action = handle_frame(r#"{"type":"disconnect","reason":"refresh_requested"}"#);
        assert!(action.reconnect);
        assert_eq!(action.ack, None);

        let garbage = handle_frame("not json");
        assert_eq!(
            garbage,
            FrameAction {
                ack: None,
                event: None,
                reconnect: false
            }
        );
    }

    #[tokio::test]
    async fn acknowledges_then_forwards_over_a_live_connection() {
        let ws_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_url = format!("ws://{}/", ws_listener.local_addr().unwrap());
        let (ack_tx, mut ack_rx) = mpsc::channel::<String>(4);
        tokio::spawn(async move {
            let (tcp, _) = ws_listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _ = ws
                .send(Message::Text(r#"{"type":"hello","num_connections":1}"#.to_string()))
                .await;
            let frame = json!({
                "type": "events_api",
                "envelope_id": "env-42",
                "payload": {
                    "type": "event_callback", "event_id": "Ev42", "team_id": "T1",
                    "event": { "type": "message", "channel": "C1", "user": "U1", "text": "hey", "ts": "1.5" }
                }
            });
            let _ = ws.send(Message::Text(frame.to_string())).await;
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(t) = msg {
                    let _ = ack_tx.send(t).await;
                }
            }
        });

        let api_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let api_base = format!("http://{}", api_listener.local_addr().unwrap());
        let app = Router::new().route(
            "/apps.connections.open",
            post(move || {
                let url = ws_url.clone();
                async move { Json(json!({ "ok": true, "url": url })) }
            }),
        );
        tokio::spawn(async move {
            let _ = axum::serve(api_listener, app).await;
        });

        let slack = Arc::new(SlackClient::new(
            Some(api_base),
            Some("xoxb-test".to_string()),
            Some("xapp-test".to_string()),
        ));
        let listener = Arc::new(SocketModeListener::new(slack));
        assert_eq!(listener.state(), ConnectionState::Disconnected);
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let handle = listener.clone().start(events_tx);

        let ack = timeout(WAIT, ack_rx.recv()).await.unwrap().unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&ack).unwrap(),
            json!({ "envelope_id": "env-42" })
        );
        let event = timeout(WAIT, events_rx.recv()).await.unwrap().unwrap();
        let InboundEvent::IncomingMessage(env) = event else {
            panic!("expected a message event");
        };
        assert_eq!(env.event_id.as_deref(), Some("Ev42"));
        assert_eq!(listener.state(), ConnectionState::Connected);

        listener.stop();
        timeout(WAIT, handle).await.unwrap().unwrap();
        assert_eq!(listener.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn stop_interrupts_a_stalled_connection_attempt() {
        // Accepts TCP connections but never answers apps.connections.open.
        let api_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let api_base = format!("http://{}", api_listener.local_addr().unwrap());
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((tcp, _)) = api_listener.accept().await {
                held.push(tcp);
            }
        });

        let slack = Arc::new(SlackClient::new(
            Some(api_base),
            Some("xoxb-test".to_string()),
            Some("xapp-test".to_string()),
        ));
        let listener = Arc::new(SocketModeListener::new(slack));
        let (events_tx, _events_rx) = mpsc::channel(8);
        let handle = listener.clone().start(events_tx);

        tokio::time::sleep(Duration::from_millis(200)).await;
        listener.stop();
        timeout(WAIT, handle)
            .await
            .expect("listener task did not exit after stop()")
            .unwrap();
        assert_eq!(listener.state(), ConnectionState::Disconnected);
    }
}
