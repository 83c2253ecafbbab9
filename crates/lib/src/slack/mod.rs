//! Slack integration: Web API client, inbound payload decoding, request signing, and Socket Mode.
//!
//! The gateway's `/slack/events` route and the Socket Mode listener are the two ingress paths;
//! both hand decoded [`InboundEvent`]s to the ingest pipeline.

mod client;
mod payload;
pub mod signature;
mod socket_mode;

pub use client::{ChatApi, ChatApiError, PostedMessage, SlackClient};
pub use payload::{ack_frame, InboundEvent, MessageEnvelope, MessageEvent, SocketFrame};
pub use socket_mode::{ConnectionState, SocketModeListener};
