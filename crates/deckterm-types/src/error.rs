use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::SessionId;

/// Which admission limit rejected a creation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    /// Too many creations within the trailing window
    RateLimited,
    /// The owner already holds the maximum number of sessions
    OwnerSessionLimit,
    /// The server already holds the maximum number of sessions
    GlobalSessionLimit,
}

impl QuotaKind {
    pub fn reason(&self) -> &'static str {
        match self {
            QuotaKind::RateLimited => "rate_limited",
            QuotaKind::OwnerSessionLimit => "owner_session_limit",
            QuotaKind::GlobalSessionLimit => "global_session_limit",
        }
    }
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaKind::RateLimited => write!(f, "Rate limit exceeded. Try again later."),
            QuotaKind::OwnerSessionLimit => write!(f, "Maximum terminals per user reached."),
            QuotaKind::GlobalSessionLimit => write!(f, "Maximum terminals reached."),
        }
    }
}

/// Errors surfaced by the terminal session manager
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("failed to start terminal: {0}")]
    SpawnFailure(String),

    #[error("terminal '{0}' not found")]
    NotFound(SessionId),

    #[error("terminal '{0}' belongs to another user")]
    Forbidden(SessionId),

    #[error("{0}")]
    QuotaExceeded(QuotaKind),

    #[error("upstream temporarily unavailable, retry after {}s", .retry_after.as_secs())]
    UpstreamUnavailable { retry_after: Duration },

    #[error("transport closed")]
    TransportClosed,
}

impl TerminalError {
    /// Stable machine-checkable reason code
    pub fn reason(&self) -> &'static str {
        match self {
            TerminalError::SpawnFailure(_) => "spawn_failure",
            TerminalError::NotFound(_) => "not_found",
            TerminalError::Forbidden(_) => "forbidden",
            TerminalError::QuotaExceeded(kind) => kind.reason(),
            TerminalError::UpstreamUnavailable { .. } => "upstream_unavailable",
            TerminalError::TransportClosed => "transport_closed",
        }
    }

    pub fn spawn(err: impl fmt::Display) -> Self {
        TerminalError::SpawnFailure(err.to_string())
    }
}
