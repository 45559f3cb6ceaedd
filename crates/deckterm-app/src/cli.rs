use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

use deckterm_terminal::PersistenceBackendType;

/// CLI arguments for deckterm
#[derive(Parser, Debug)]
#[command(name = "deckterm")]
#[command(about = "Browser-attachable shell sessions backed by pseudo-terminals")]
#[command(version)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to a TOML config file
    #[arg(long, global = true, value_name = "PATH", env = "DECKTERM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose debug output (same as --log-level debug)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Log filter when RUST_LOG is not set (e.g. info, deckterm_terminal=debug)
    #[arg(long, global = true, value_name = "FILTER", env = "DECKTERM_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum, env = "DECKTERM_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    /// Server options when no subcommand is given
    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the terminal server (default)
    Serve(ServeArgs),
    /// Attach this terminal to a running session
    Attach(AttachArgs),
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityMode {
    /// Trust identity headers set by a reverse proxy
    Headers,
    /// Single local user; for development only
    None,
}

/// Server options; unset values fall back to the config file, then defaults
#[derive(Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// Bind address
    #[arg(long, value_name = "HOST", env = "DECKTERM_HOST")]
    pub host: Option<String>,

    /// Listen port
    #[arg(long, short = 'p', value_name = "PORT", env = "DECKTERM_PORT")]
    pub port: Option<u16>,

    /// Shell command line for new sessions (default: $SHELL -il)
    #[arg(long, value_name = "COMMAND", env = "DECKTERM_SHELL")]
    pub shell: Option<String>,

    /// Default terminal width
    #[arg(long, value_name = "COLS", env = "DECKTERM_COLS")]
    pub cols: Option<u16>,

    /// Default terminal height
    #[arg(long, value_name = "ROWS", env = "DECKTERM_ROWS")]
    pub rows: Option<u16>,

    /// Maximum live sessions across all users
    #[arg(long, value_name = "N", env = "DECKTERM_MAX_TERMINALS")]
    pub max_terminals: Option<usize>,

    /// Maximum live sessions per user
    #[arg(long, value_name = "N", env = "DECKTERM_MAX_TERMINALS_PER_USER")]
    pub max_terminals_per_user: Option<usize>,

    /// Creation rate limit window in seconds
    #[arg(long, value_name = "SECS", env = "DECKTERM_RATE_LIMIT_WINDOW")]
    pub rate_limit_window: Option<u64>,

    /// Creations allowed per rate limit window
    #[arg(long, value_name = "N", env = "DECKTERM_RATE_LIMIT_MAX")]
    pub rate_limit_max: Option<usize>,

    /// Close sessions without input for this many seconds (0 disables)
    #[arg(long, value_name = "SECS", env = "DECKTERM_IDLE_TIMEOUT")]
    pub idle_timeout: Option<u64>,

    /// Seconds between idle sweeps
    #[arg(long, value_name = "SECS", env = "DECKTERM_REAP_INTERVAL")]
    pub reap_interval: Option<u64>,

    /// Persistence backend (none, tmux)
    #[arg(long, value_name = "BACKEND", env = "DECKTERM_PERSISTENCE")]
    pub persistence: Option<PersistenceBackendType>,

    /// Name prefix of persisted sessions
    #[arg(long, value_name = "PREFIX", env = "DECKTERM_PERSISTENCE_PREFIX")]
    pub persistence_prefix: Option<String>,

    /// Timeout in seconds for each persistence backend command
    #[arg(long, value_name = "SECS", env = "DECKTERM_PERSISTENCE_TIMEOUT")]
    pub persistence_timeout: Option<u64>,

    /// How callers are identified
    #[arg(long, value_enum, env = "DECKTERM_IDENTITY")]
    pub identity: Option<IdentityMode>,

    /// Header carrying the user id in `headers` identity mode
    #[arg(long, value_name = "NAME", env = "DECKTERM_USER_ID_HEADER")]
    pub user_id_header: Option<String>,

    /// Header carrying the user email in `headers` identity mode
    #[arg(long, value_name = "NAME", env = "DECKTERM_USER_EMAIL_HEADER")]
    pub user_email_header: Option<String>,

    /// Companion service proxied under /upstream
    #[arg(long, value_name = "URL", env = "DECKTERM_UPSTREAM_URL")]
    pub upstream_url: Option<String>,

    /// Consecutive upstream failures that open the circuit
    #[arg(long, value_name = "N", env = "DECKTERM_BREAKER_THRESHOLD")]
    pub breaker_threshold: Option<u32>,

    /// Seconds the circuit stays open before a probe
    #[arg(long, value_name = "SECS", env = "DECKTERM_BREAKER_RESET")]
    pub breaker_reset: Option<u64>,

    /// Directory of static web assets served at /
    #[arg(long, value_name = "DIR", env = "DECKTERM_WEB_DIR")]
    pub web_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct AttachArgs {
    /// Session id to attach to
    pub id: String,

    /// Server base URL
    #[arg(long, value_name = "URL", env = "DECKTERM_SERVER", default_value = "http://127.0.0.1:4173")]
    pub server: String,

    /// User id sent in the identity header
    #[arg(long, value_name = "ID", env = "DECKTERM_USER")]
    pub user: Option<String>,

    /// User email sent in the identity header
    #[arg(long, value_name = "EMAIL", env = "DECKTERM_EMAIL")]
    pub email: Option<String>,

    /// Seconds between heartbeats
    #[arg(long, value_name = "SECS", env = "DECKTERM_HEARTBEAT_INTERVAL")]
    pub heartbeat_interval: Option<u64>,

    /// Seconds to wait for a heartbeat reply
    #[arg(long, value_name = "SECS", env = "DECKTERM_HEARTBEAT_TIMEOUT")]
    pub heartbeat_timeout: Option<u64>,

    /// First reconnect delay in milliseconds
    #[arg(long, value_name = "MS", env = "DECKTERM_BACKOFF_BASE")]
    pub backoff_base: Option<u64>,

    /// Largest reconnect delay in milliseconds
    #[arg(long, value_name = "MS", env = "DECKTERM_BACKOFF_CAP")]
    pub backoff_cap: Option<u64>,

    /// Reconnect attempts before giving up
    #[arg(long, value_name = "N", env = "DECKTERM_MAX_RETRIES")]
    pub max_retries: Option<u32>,
}
