//! Core types shared by the deckterm crates
//!
//! This crate provides the session and owner identifiers, the tunable defaults,
//! the error taxonomy and the streaming-channel wire protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub mod error;
pub mod protocol;

pub use error::{QuotaKind, TerminalError};
pub use protocol::{ClientFrame, ServerFrame};

// ============================================================================
// Constants
// ============================================================================

/// Default terminal width when a request omits it
pub const DEFAULT_COLS: u16 = 120;

/// Default terminal height when a request omits it
pub const DEFAULT_ROWS: u16 = 30;

/// Maximum number of concurrently live sessions across all owners
pub const DEFAULT_MAX_SESSIONS: usize = 10;

/// Maximum number of concurrently live sessions per owner
pub const DEFAULT_MAX_SESSIONS_PER_OWNER: usize = 10;

/// Trailing window of the creation rate limiter
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Creations allowed within one rate limit window
pub const DEFAULT_RATE_LIMIT_MAX: usize = 20;

/// Sessions without input for this long are reaped
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

/// How often the idle reaper sweeps the registry
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Naming prefix of persisted multiplexer sessions
pub const DEFAULT_PERSISTENCE_PREFIX: &str = "deckterm";

/// Upper bound for a single persistence backend subprocess
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Client heartbeat cadence
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// How long the client waits for a pong before dropping the connection
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

/// First reconnect delay
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(1000);

/// Largest reconnect delay
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_millis(30_000);

/// Reconnect attempts before the client gives up
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Consecutive upstream failures that open the circuit
pub const DEFAULT_BREAKER_THRESHOLD: u32 = 5;

/// Cooldown before an open circuit lets a probe through
pub const DEFAULT_BREAKER_RESET: Duration = Duration::from_secs(30);

/// Messages queued for one subscriber before it is dropped as stalled
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 1024;

// ============================================================================
// Identifiers
// ============================================================================

/// Opaque session identifier
///
/// Fresh sessions get a v4 UUID; recovered sessions reuse the id embedded in
/// their persisted name.
pub type SessionId = String;

/// Generate a new session id
pub fn new_session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string()
}

/// Identity of the caller as reported by the external identity check
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    pub id: String,
    pub email: String,
}

impl Owner {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
        }
    }

    /// Owner reconstructed from a persisted session name; the email is not recoverable
    pub fn recovered(id: impl Into<String>) -> Self {
        Self::new(id, "recovered")
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.id, self.email)
    }
}
