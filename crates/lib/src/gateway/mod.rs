//! Gateway: the HTTP surface of the relay.
//!
//! One port serves the send/query API and the Slack Events API webhook. The gateway also owns
//! process lifecycle: it initializes the relay at startup and shuts it down on SIGINT/SIGTERM.

mod protocol;
mod server;

pub use protocol::{MessagesQuery, MessagesResponse};
pub use server::{router, run_gateway, GatewayState};
