//! Control API server
//!
//! Exposes [`MessageRouter`](crate::router::MessageRouter) over TCP as JSON
//! lines, plus a matching client.

pub mod client;
pub mod config;
pub mod connection;
pub mod listener;
pub mod protocol;

pub use client::ControlClient;
pub use config::ServerConfig;
pub use listener::ControlServer;
pub use protocol::{ControlRequest, ControlResponse, ErrorBody};
