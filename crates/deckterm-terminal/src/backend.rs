/// Capability traits for the PTY adapter and the persistence backend
use anyhow::Result;
use async_trait::async_trait;
use deckterm_types::{SessionId, TerminalError};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// Everything needed to start one process on a fresh pseudo-terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub env: Vec<(String, String)>,
}

impl SpawnRequest {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>, cols: u16, rows: u16) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            cols,
            rows,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Add the terminal variables every interactive shell expects
    pub fn with_terminal_env(self) -> Self {
        let (cols, rows) = (self.cols.to_string(), self.rows.to_string());
        self.env("TERM", "xterm-256color")
            .env("COLORTERM", "truecolor")
            .env("COLUMNS", cols)
            .env("LINES", rows)
    }
}

/// Events produced by a running PTY, in the order the process produced them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Output(Vec<u8>),
    Exit { code: Option<i32> },
}

/// Control side of a live PTY
///
/// Writes and resizes against a closed handle report `false` instead of failing.
pub trait PtyControl: Send + Sync {
    fn write(&self, data: &[u8]) -> bool;

    /// Resize the terminal; the child receives SIGWINCH
    fn resize(&self, cols: u16, rows: u16) -> bool;

    /// Kill the child and release the handle; idempotent
    fn close(&self);

    fn is_closed(&self) -> bool;

    fn process_id(&self) -> Option<u32>;
}

/// A freshly spawned PTY plus the stream of its output and exit events
pub struct SpawnedPty {
    pub control: std::sync::Arc<dyn PtyControl>,
    pub events: mpsc::UnboundedReceiver<PtyEvent>,
}

impl std::fmt::Debug for SpawnedPty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedPty")
            .field("pid", &self.control.process_id())
            .finish()
    }
}

/// Starts processes on pseudo-terminals
pub trait PtySpawner: Send + Sync {
    /// Spawn a process; blocking, call from a blocking-friendly context
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedPty, TerminalError>;
}

/// A session found in the persistence backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedSession {
    pub name: String,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
}

/// Detachable multiplexer that keeps shells alive across manager restarts
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Create a detached session running `shell` in `cwd`
    async fn create_detached(
        &self,
        name: &str,
        shell: &[String],
        cwd: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<()>;

    /// The process that attaches to `name`; spawning it on a PTY yields the live stream
    fn attach(&self, name: &str, cwd: &Path, cols: u16, rows: u16) -> SpawnRequest;

    async fn resize_pane(&self, name: &str, cols: u16, rows: u16) -> Result<()>;

    async fn kill(&self, name: &str) -> Result<()>;

    /// Sessions whose names carry this backend's prefix
    async fn list_existing(&self) -> Result<Vec<PersistedSession>>;

    fn prefix(&self) -> &str;

    /// Get backend name for debugging
    fn backend_name(&self) -> &str;
}

/// Name of a persisted session: `prefix_ownerId_sessionId`
///
/// Characters the multiplexer rejects in names (`.`, `:`) are escaped in the
/// owner part as `%XX`, so ownership survives the round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionName {
    pub owner_id: String,
    pub session_id: SessionId,
}

impl SessionName {
    pub fn new(owner_id: impl Into<String>, session_id: impl Into<SessionId>) -> Self {
        Self {
            owner_id: owner_id.into(),
            session_id: session_id.into(),
        }
    }

    pub fn render(&self, prefix: &str) -> String {
        format!("{}_{}_{}", prefix, escape_owner(&self.owner_id), self.session_id)
    }

    /// Recover owner and session id from a name; `None` if it is not ours
    pub fn parse(prefix: &str, name: &str) -> Option<Self> {
        let rest = name.strip_prefix(prefix)?.strip_prefix('_')?;
        let (owner, session_id) = rest.rsplit_once('_')?;
        if owner.is_empty() || session_id.is_empty() {
            return None;
        }
        Some(Self {
            owner_id: unescape_owner(owner)?,
            session_id: session_id.to_string(),
        })
    }
}

fn escape_owner(owner: &str) -> String {
    let mut out = String::with_capacity(owner.len());
    for ch in owner.chars() {
        match ch {
            '.' | ':' | '%' | ' ' | '\t' | '\n' => {
                let mut buf = [0u8; 4];
                for byte in ch.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("%{:02X}", byte));
                }
            }
            _ => out.push(ch),
        }
    }
    out
}

fn unescape_owner(escaped: &str) -> Option<String> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = escaped.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Configuration for which persistence backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistenceBackendType {
    /// Plain PTY sessions that die with the server (default)
    #[default]
    None,
    /// Tmux-backed sessions that survive restarts
    Tmux,
}

impl std::str::FromStr for PersistenceBackendType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" | "pty" | "off" => Ok(Self::None),
            "tmux" => Ok(Self::Tmux),
            _ => Err(anyhow::anyhow!(
                "Invalid persistence backend: '{}'. Valid options: 'none', 'tmux'",
                s
            )),
        }
    }
}

impl std::fmt::Display for PersistenceBackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Tmux => write!(f, "tmux"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_name_round_trip() {
        let name = SessionName::new("alice", "4f0c-11");
        assert_eq!(name.render("deckterm"), "deckterm_alice_4f0c-11");
        assert_eq!(SessionName::parse("deckterm", "deckterm_alice_4f0c-11"), Some(name));
    }

    #[test]
    fn test_owner_with_underscores_and_dots() {
        let name = SessionName::new("first_last@example.com", "abc");
        let rendered = name.render("deckterm");
        assert!(!rendered.contains('.'));
        assert_eq!(SessionName::parse("deckterm", &rendered), Some(name));
    }

    #[test]
    fn test_foreign_names_are_rejected() {
        assert_eq!(SessionName::parse("deckterm", "main"), None);
        assert_eq!(SessionName::parse("deckterm", "decktermx_alice_1"), None);
        assert_eq!(SessionName::parse("deckterm", "deckterm_alice"), None);
        assert_eq!(SessionName::parse("deckterm", "deckterm__1"), None);
        assert_eq!(SessionName::parse("deckterm", "deckterm_bad%zz_1"), None);
    }

    #[test]
    fn test_backend_type_parsing() {
        assert_eq!("tmux".parse::<PersistenceBackendType>().unwrap(), PersistenceBackendType::Tmux);
        assert_eq!("PTY".parse::<PersistenceBackendType>().unwrap(), PersistenceBackendType::None);
        assert!("screen".parse::<PersistenceBackendType>().is_err());
    }

    #[test]
    fn test_terminal_env() {
        let request = SpawnRequest::new("/bin/sh", "/tmp", 100, 40).with_terminal_env();
        assert!(request.env.contains(&("COLUMNS".to_string(), "100".to_string())));
        assert!(request.env.contains(&("TERM".to_string(), "xterm-256color".to_string())));
    }
}
