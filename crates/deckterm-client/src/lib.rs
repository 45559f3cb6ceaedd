//! Reconnecting client for the deckterm streaming channel
//!
//! The backoff policy, reconnect state machine and heartbeat are plain
//! values driven with explicit timestamps; [`connect`] wires them to a
//! websocket.

pub mod backoff;
mod connection;
pub mod heartbeat;
pub mod state;

pub use backoff::BackoffPolicy;
pub use connection::{connect, ClientConfig, ClientEvent, ClientHandle};
pub use heartbeat::{Heartbeat, HeartbeatAction};
pub use state::{ConnectionState, Disconnect, NextStep, ReconnectMachine};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid header '{0}'")]
    InvalidHeader(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connection task has stopped")]
    Stopped,
}
