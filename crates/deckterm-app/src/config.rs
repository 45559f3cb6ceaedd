//! Configuration layering: CLI flag > environment > TOML file > built-in default
//!
//! Flags and their `DECKTERM_*` environment fallbacks are handled by clap, so
//! this module only has to merge the parsed arguments over the file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use deckterm_terminal::{default_shell, AdmissionLimits, ManagerConfig, PersistenceBackendType};
use deckterm_types::{
    DEFAULT_BREAKER_RESET, DEFAULT_BREAKER_THRESHOLD, DEFAULT_COLS, DEFAULT_COMMAND_TIMEOUT,
    DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_SESSIONS, DEFAULT_MAX_SESSIONS_PER_OWNER,
    DEFAULT_PERSISTENCE_PREFIX, DEFAULT_RATE_LIMIT_MAX, DEFAULT_RATE_LIMIT_WINDOW,
    DEFAULT_REAP_INTERVAL, DEFAULT_ROWS,
};

use crate::cli::{Cli, IdentityMode, LogFormat, ServeArgs};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 4173;
pub const DEFAULT_USER_ID_HEADER: &str = "x-deckterm-user-id";
pub const DEFAULT_USER_EMAIL_HEADER: &str = "x-deckterm-user-email";

/// Contents of the optional TOML config file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub server: ServerSection,
    pub terminal: TerminalSection,
    pub persistence: PersistenceSection,
    pub identity: IdentitySection,
    pub upstream: UpstreamSection,
    pub logging: LoggingSection,
    pub client: ClientSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub web_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TerminalSection {
    /// Either a command line string or a list of words
    pub shell: Option<ShellSetting>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub max_terminals: Option<usize>,
    pub max_terminals_per_user: Option<usize>,
    pub rate_limit_window_secs: Option<u64>,
    pub rate_limit_max: Option<usize>,
    pub idle_timeout_secs: Option<u64>,
    pub reap_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ShellSetting {
    Line(String),
    Words(Vec<String>),
}

impl ShellSetting {
    fn into_words(self) -> Vec<String> {
        match self {
            ShellSetting::Line(line) => split_command_line(&line),
            ShellSetting::Words(words) => words,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PersistenceSection {
    pub backend: Option<String>,
    pub prefix: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdentitySection {
    pub mode: Option<IdentityMode>,
    pub user_id_header: Option<String>,
    pub user_email_header: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamSection {
    pub url: Option<String>,
    pub breaker_threshold: Option<u32>,
    pub breaker_reset_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSection {
    pub server: Option<String>,
    pub user: Option<String>,
    pub email: Option<String>,
    pub heartbeat_interval_secs: Option<u64>,
    pub heartbeat_timeout_secs: Option<u64>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_cap_ms: Option<u64>,
    pub max_retries: Option<u32>,
}

impl FileConfig {
    /// Read the file at `path`, or return an empty config when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                Self::parse(&text)
                    .with_context(|| format!("Invalid config file: {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// How callers are identified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityConfig {
    pub mode: IdentityMode,
    pub user_id_header: String,
    pub user_email_header: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            mode: IdentityMode::Headers,
            user_id_header: DEFAULT_USER_ID_HEADER.to_string(),
            user_email_header: DEFAULT_USER_EMAIL_HEADER.to_string(),
        }
    }
}

/// Companion service reached through `/upstream`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub url: String,
    pub breaker_threshold: u32,
    pub breaker_reset: Duration,
}

/// Fully resolved settings for `deckterm serve`
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub web_dir: Option<PathBuf>,
    pub manager: ManagerConfig,
    pub reap_interval: Duration,
    pub persistence: PersistenceBackendType,
    pub persistence_prefix: String,
    pub persistence_timeout: Duration,
    pub identity: IdentityConfig,
    pub upstream: Option<UpstreamConfig>,
}

impl ServerConfig {
    pub fn resolve(args: &ServeArgs, file: &FileConfig) -> Result<Self> {
        let host = args
            .host
            .clone()
            .or_else(|| file.server.host.clone())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = args.port.or(file.server.port).unwrap_or(DEFAULT_PORT);
        let bind_addr = format!("{}:{}", host, port)
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid bind address {}:{}", host, port))?;

        let term = &file.terminal;
        let shell = match (&args.shell, &term.shell) {
            (Some(line), _) => split_command_line(line),
            (None, Some(setting)) => setting.clone().into_words(),
            (None, None) => default_shell(),
        };
        if shell.is_empty() {
            anyhow::bail!("Shell command must not be empty");
        }

        let limits = AdmissionLimits {
            max_sessions: args
                .max_terminals
                .or(term.max_terminals)
                .unwrap_or(DEFAULT_MAX_SESSIONS),
            max_sessions_per_owner: args
                .max_terminals_per_user
                .or(term.max_terminals_per_user)
                .unwrap_or(DEFAULT_MAX_SESSIONS_PER_OWNER),
            rate_window: args
                .rate_limit_window
                .or(term.rate_limit_window_secs)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW),
            rate_max: args
                .rate_limit_max
                .or(term.rate_limit_max)
                .unwrap_or(DEFAULT_RATE_LIMIT_MAX),
        };

        let idle_timeout = match args.idle_timeout.or(term.idle_timeout_secs) {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(DEFAULT_IDLE_TIMEOUT),
        };

        let persistence = match (args.persistence, &file.persistence.backend) {
            (Some(kind), _) => kind,
            (None, Some(name)) => name.parse()?,
            (None, None) => PersistenceBackendType::None,
        };

        let manager = ManagerConfig {
            shell,
            default_cols: args.cols.or(term.cols).unwrap_or(DEFAULT_COLS),
            default_rows: args.rows.or(term.rows).unwrap_or(DEFAULT_ROWS),
            limits,
            idle_timeout,
            persist_by_default: true,
        };

        let identity = IdentityConfig {
            mode: args
                .identity
                .or(file.identity.mode)
                .unwrap_or(IdentityMode::Headers),
            user_id_header: args
                .user_id_header
                .clone()
                .or_else(|| file.identity.user_id_header.clone())
                .unwrap_or_else(|| DEFAULT_USER_ID_HEADER.to_string())
                .to_lowercase(),
            user_email_header: args
                .user_email_header
                .clone()
                .or_else(|| file.identity.user_email_header.clone())
                .unwrap_or_else(|| DEFAULT_USER_EMAIL_HEADER.to_string())
                .to_lowercase(),
        };

        let upstream = args
            .upstream_url
            .clone()
            .or_else(|| file.upstream.url.clone())
            .filter(|url| !url.trim().is_empty())
            .map(|url| UpstreamConfig {
                url: url.trim_end_matches('/').to_string(),
                breaker_threshold: args
                    .breaker_threshold
                    .or(file.upstream.breaker_threshold)
                    .unwrap_or(DEFAULT_BREAKER_THRESHOLD)
                    .max(1),
                breaker_reset: args
                    .breaker_reset
                    .or(file.upstream.breaker_reset_secs)
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_BREAKER_RESET),
            });

        Ok(Self {
            bind_addr,
            web_dir: args.web_dir.clone().or_else(|| file.server.web_dir.clone()),
            manager,
            reap_interval: args
                .reap_interval
                .or(term.reap_interval_secs)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REAP_INTERVAL),
            persistence,
            persistence_prefix: args
                .persistence_prefix
                .clone()
                .or_else(|| file.persistence.prefix.clone())
                .unwrap_or_else(|| DEFAULT_PERSISTENCE_PREFIX.to_string()),
            persistence_timeout: args
                .persistence_timeout
                .or(file.persistence.timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_COMMAND_TIMEOUT),
            identity,
            upstream,
        })
    }
}

/// Log filter and format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl LoggingConfig {
    pub fn resolve(cli: &Cli, file: &FileConfig) -> Self {
        let level = if cli.verbose {
            "debug".to_string()
        } else {
            cli.log_level
                .clone()
                .or_else(|| file.logging.level.clone())
                .unwrap_or_else(|| "info".to_string())
        };
        Self {
            level,
            format: cli
                .log_format
                .or(file.logging.format)
                .unwrap_or(LogFormat::Pretty),
        }
    }
}

/// Split a shell command line on whitespace, honouring single and double quotes
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}
