#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! relay-console library: the client side of the agent/relay/extension
//! protocol.
//!
//! - `protocol` — envelope types and JSON wire format
//! - `connection` — reconnecting WebSocket client, heartbeat, backoff, probe
//! - `observer` — ordered fan-out used for client events
//! - `registry` — paired browser clients, driven by STATUS envelopes
//! - `execution` — pending request tracking and per-client conversations
//! - `traffic` — ring buffer of envelopes sent and received
//! - `store` — durable storage collaborator (memory and JSON file)
//! - `notify` — host notifications
//! - `console` — ties the above together behind one handle
//! - `config` — TOML + env-var configuration

pub mod config;
pub mod connection;
pub mod console;
pub mod error;
pub mod execution;
pub mod notify;
pub mod observer;
pub mod protocol;
pub mod registry;
pub mod store;
pub mod traffic;
pub mod util;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use connection::{ConnectionClient, ConnectionState};
pub use console::Console;
pub use protocol::Envelope;
