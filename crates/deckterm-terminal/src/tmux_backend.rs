/// Tmux-based persistence backend
use super::backend::{PersistedSession, PersistenceBackend, SpawnRequest};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Persistence backend using the external tmux multiplexer
pub struct TmuxBackend {
    /// Naming prefix for sessions owned by this server
    prefix: String,
    /// Upper bound for each tmux invocation
    command_timeout: Duration,
    /// tmux executable
    program: String,
}

impl TmuxBackend {
    /// Create a new tmux backend, verifying tmux is available
    pub async fn new(prefix: impl Into<String>, command_timeout: Duration) -> Result<Self> {
        let backend = Self {
            prefix: prefix.into(),
            command_timeout,
            program: "tmux".to_string(),
        };
        backend
            .run_tmux_command(&["-V"])
            .await
            .context("tmux is not available - ensure tmux is installed and working")?;
        Ok(backend)
    }

    /// Run a tmux command and return stdout
    ///
    /// The child is killed if it outlives the command timeout.
    async fn run_tmux_command(&self, args: &[&str]) -> Result<String> {
        debug!(args = ?args, "tmux");
        let child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to run {}", self.program))?;

        let output = match tokio::time::timeout(self.command_timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => bail!(
                "tmux {} timed out after {}s",
                args.first().copied().unwrap_or_default(),
                self.command_timeout.as_secs()
            ),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("tmux command failed: {}", stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Render a shell invocation as a single tmux shell-command argument
fn shell_command_line(shell: &[String]) -> String {
    shell
        .iter()
        .map(|part| {
            if !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "/-_.=+,".contains(c))
            {
                part.clone()
            } else {
                format!("'{}'", part.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse `list-sessions` output in the `name\tpath\twidth\theight` format
fn parse_session_list(output: &str, prefix: &str) -> Vec<PersistedSession> {
    let owned_prefix = format!("{}_", prefix);
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let name = parts.next()?.trim();
            if !name.starts_with(&owned_prefix) {
                return None;
            }
            let cwd = parts.next().unwrap_or_default();
            let cols = parts.next().and_then(|v| v.trim().parse().ok()).unwrap_or(80);
            let rows = parts.next().and_then(|v| v.trim().parse().ok()).unwrap_or(24);
            Some(PersistedSession {
                name: name.to_string(),
                cwd: if cwd.is_empty() { PathBuf::from("/") } else { PathBuf::from(cwd) },
                cols,
                rows,
            })
        })
        .collect()
}

#[async_trait]
impl PersistenceBackend for TmuxBackend {
    async fn create_detached(
        &self,
        name: &str,
        shell: &[String],
        cwd: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<()> {
        let cols = cols.to_string();
        let rows = rows.to_string();
        let cwd = cwd.to_string_lossy();
        let command_line = shell_command_line(shell);

        let mut args = vec![
            "new-session", "-d", "-s", name, "-x", &cols, "-y", &rows, "-c", &cwd,
            "-e", "TERM=xterm-256color", "-e", "COLORTERM=truecolor",
        ];
        if !command_line.is_empty() {
            args.push(&command_line);
        }

        self.run_tmux_command(&args)
            .await
            .with_context(|| format!("Failed to create tmux session {}", name))?;

        // The browser renders its own chrome
        if let Err(e) = self
            .run_tmux_command(&["set-option", "-t", name, "status", "off"])
            .await
        {
            warn!(session = name, error = %e, "failed to hide tmux status line");
        }

        Ok(())
    }

    fn attach(&self, name: &str, cwd: &Path, cols: u16, rows: u16) -> SpawnRequest {
        SpawnRequest::new(&self.program, cwd, cols, rows)
            .arg("attach-session")
            .arg("-t")
            .arg(name)
            .with_terminal_env()
    }

    async fn resize_pane(&self, name: &str, cols: u16, rows: u16) -> Result<()> {
        self.run_tmux_command(&[
            "resize-window",
            "-t",
            name,
            "-x",
            &cols.to_string(),
            "-y",
            &rows.to_string(),
        ])
        .await
        .with_context(|| format!("Failed to resize tmux session {}", name))?;
        Ok(())
    }

    async fn kill(&self, name: &str) -> Result<()> {
        self.run_tmux_command(&["kill-session", "-t", name])
            .await
            .with_context(|| format!("Failed to kill tmux session {}", name))?;
        Ok(())
    }

    async fn list_existing(&self) -> Result<Vec<PersistedSession>> {
        let output = match self
            .run_tmux_command(&[
                "list-sessions",
                "-F",
                "#{session_name}\t#{pane_current_path}\t#{window_width}\t#{window_height}",
            ])
            .await
        {
            Ok(output) => output,
            // No server running simply means nothing to recover
            Err(e) if e.to_string().contains("no server running") => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(parse_session_list(&output, &self.prefix))
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn backend_name(&self) -> &str {
        "tmux"
    }
}
