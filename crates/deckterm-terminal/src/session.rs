use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use deckterm_types::{Owner, ServerFrame, SessionId};

use super::backend::PtyControl;
use super::transport::Subscribers;

/// Lifecycle of a session as the server observes it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Creating,
    Active,
    Exited(Option<i32>),
    IdleClosed,
    ExplicitClosed,
    /// Released by a server shutdown; persistent shells live on
    Detached,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionState::Creating | SessionState::Active)
    }
}

/// Why a session is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Exited(Option<i32>),
    IdleTimeout,
    Explicit,
    Shutdown,
}

impl CloseReason {
    /// Final state a session lands in for this reason
    pub fn state(&self) -> SessionState {
        match self {
            CloseReason::Exited(code) => SessionState::Exited(*code),
            CloseReason::IdleTimeout => SessionState::IdleClosed,
            CloseReason::Explicit => SessionState::ExplicitClosed,
            CloseReason::Shutdown => SessionState::Detached,
        }
    }

    /// Notification broadcast to subscribers before their channels close
    pub fn frame(&self) -> Option<ServerFrame> {
        match self {
            CloseReason::Exited(code) => Some(ServerFrame::Exit { code: *code }),
            CloseReason::IdleTimeout => Some(ServerFrame::IdleTimeout),
            CloseReason::Explicit => Some(ServerFrame::Closed),
            CloseReason::Shutdown => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Exited(_) => "exited",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Explicit => "explicit",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

struct MutableState {
    cols: u16,
    rows: u16,
    last_activity: Instant,
    state: SessionState,
}

/// One logical shell instance
///
/// The record owns the PTY handle; it is released exactly once by the
/// manager when the session reaches a terminal state.
pub struct Session {
    pub id: SessionId,
    pub owner: Owner,
    pub cwd: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Name in the persistence backend, if the shell outlives the server
    pub persistent_name: Option<String>,
    pty: Arc<dyn PtyControl>,
    inner: Mutex<MutableState>,
    subscribers: Subscribers,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("owner", &self.owner.id)
            .field("cwd", &self.cwd)
            .field("persistent_name", &self.persistent_name)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub fn new(
        id: SessionId,
        owner: Owner,
        cwd: PathBuf,
        cols: u16,
        rows: u16,
        persistent_name: Option<String>,
        pty: Arc<dyn PtyControl>,
    ) -> Self {
        Self::new_at(id, owner, cwd, cols, rows, persistent_name, pty, Instant::now())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_at(
        id: SessionId,
        owner: Owner,
        cwd: PathBuf,
        cols: u16,
        rows: u16,
        persistent_name: Option<String>,
        pty: Arc<dyn PtyControl>,
        now: Instant,
    ) -> Self {
        Self {
            id,
            owner,
            cwd,
            created_at: Utc::now(),
            persistent_name,
            pty,
            inner: Mutex::new(MutableState {
                cols: cols.max(1),
                rows: rows.max(1),
                last_activity: now,
                state: SessionState::Creating,
            }),
            subscribers: Subscribers::new(),
        }
    }

    pub fn pty(&self) -> &Arc<dyn PtyControl> {
        &self.pty
    }

    pub fn subscribers(&self) -> &Subscribers {
        &self.subscribers
    }

    pub fn is_owned_by(&self, owner_id: &str) -> bool {
        self.owner.id == owner_id
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent_name.is_some()
    }

    pub fn state(&self) -> SessionState {
        self.inner
            .lock()
            .map(|s| s.state)
            .unwrap_or(SessionState::Detached)
    }

    /// `Creating -> Active`; no effect on any other state
    pub fn activate(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.state == SessionState::Creating {
                inner.state = SessionState::Active;
            }
        }
    }

    /// Move to the terminal state for `reason`; false if already terminal
    pub fn begin_close(&self, reason: CloseReason) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = reason.state();
        true
    }

    pub fn size(&self) -> (u16, u16) {
        self.inner
            .lock()
            .map(|s| (s.cols, s.rows))
            .unwrap_or((1, 1))
    }

    /// Record new dimensions, clamped to at least 1x1
    pub fn set_size(&self, cols: u16, rows: u16) -> (u16, u16) {
        let size = (cols.max(1), rows.max(1));
        if let Ok(mut inner) = self.inner.lock() {
            inner.cols = size.0;
            inner.rows = size.1;
        }
        size
    }

    pub fn last_activity(&self) -> Instant {
        self.inner
            .lock()
            .map(|s| s.last_activity)
            .unwrap_or_else(|_| Instant::now())
    }

    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    /// Never moves the activity clock backwards
    pub fn touch_at(&self, now: Instant) {
        if let Ok(mut inner) = self.inner.lock() {
            if now > inner.last_activity {
                inner.last_activity = now;
            }
        }
    }

    pub fn is_idle_at(&self, now: Instant, idle_timeout: std::time::Duration) -> bool {
        now.saturating_duration_since(self.last_activity()) > idle_timeout
    }

    pub fn summary(&self) -> SessionSummary {
        let (cols, rows) = self.size();
        SessionSummary {
            id: self.id.clone(),
            cwd: self.cwd.to_string_lossy().into_owned(),
            created_at: self.created_at.timestamp_millis(),
            cols,
            rows,
            persistent: self.is_persistent(),
        }
    }
}

/// What `GET /terminals` reports for one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub cwd: String,
    /// Milliseconds since the Unix epoch
    pub created_at: i64,
    pub cols: u16,
    pub rows: u16,
    pub persistent: bool,
}
