//! Relay core library: Slack event ingestion (webhook and Socket Mode), the SQLite message log,
//! outbound sends, and the HTTP gateway the CLI runs.

pub mod config;
pub mod gateway;
pub mod ingest;
pub mod normalize;
pub mod relay;
pub mod sender;
pub mod slack;
pub mod store;
