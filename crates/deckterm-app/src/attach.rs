//! `deckterm attach`: a line-mode terminal client on top of the reconnecting channel

use anyhow::{bail, Result};
use colored::Colorize;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use deckterm_client::{connect, BackoffPolicy, ClientConfig, ClientEvent, ConnectionState};
use deckterm_types::{ServerFrame, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HEARTBEAT_TIMEOUT};

use crate::cli::AttachArgs;
use crate::config::{FileConfig, DEFAULT_USER_EMAIL_HEADER, DEFAULT_USER_ID_HEADER};

/// Turn an http(s) or ws(s) base URL into the session's streaming URL
pub fn stream_url(server: &str, id: &str) -> Result<String> {
    if id.is_empty() || id.contains('/') {
        bail!("Invalid session id: '{}'", id);
    }
    let server = server.trim().trim_end_matches('/');
    let base = if let Some(rest) = server.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if let Some(rest) = server.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if server.starts_with("ws://") || server.starts_with("wss://") {
        server.to_string()
    } else if server.contains("://") {
        bail!("Unsupported server URL scheme: {}", server);
    } else {
        format!("ws://{}", server)
    };
    Ok(format!("{}/stream/terminals/{}", base, id))
}

/// Merge flags and the `[client]` config section into a connection config
pub fn client_config(args: &AttachArgs, file: &FileConfig) -> Result<ClientConfig> {
    let client = &file.client;
    let mut config = ClientConfig::new(stream_url(&args.server, &args.id)?);

    let user = args.user.clone().or_else(|| client.user.clone());
    if let Some(user) = user {
        let id_header = file
            .identity
            .user_id_header
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_ID_HEADER.to_string());
        config = config.header(id_header, user);
    }
    if let Some(email) = args.email.clone().or_else(|| client.email.clone()) {
        let email_header = file
            .identity
            .user_email_header
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_EMAIL_HEADER.to_string());
        config = config.header(email_header, email);
    }

    let defaults = BackoffPolicy::default();
    config.backoff = BackoffPolicy {
        base: args
            .backoff_base
            .or(client.backoff_base_ms)
            .map(Duration::from_millis)
            .unwrap_or(defaults.base),
        cap: args
            .backoff_cap
            .or(client.backoff_cap_ms)
            .map(Duration::from_millis)
            .unwrap_or(defaults.cap),
        max_retries: args
            .max_retries
            .or(client.max_retries)
            .unwrap_or(defaults.max_retries),
    };
    config.heartbeat_interval = args
        .heartbeat_interval
        .or(client.heartbeat_interval_secs)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
    config.heartbeat_timeout = args
        .heartbeat_timeout
        .or(client.heartbeat_timeout_secs)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT);
    Ok(config)
}

fn report_state(state: &ConnectionState) {
    match state {
        ConnectionState::Connecting => eprintln!("{}", "Connecting...".dimmed()),
        ConnectionState::Connected => eprintln!("{}", "Connected".green()),
        ConnectionState::Reconnecting { attempt, delay } => eprintln!(
            "{}",
            format!("Connection lost, retry {} in {}ms", attempt, delay.as_millis()).yellow()
        ),
        ConnectionState::Failed => eprintln!(
            "{}",
            "Could not reach the server. Press Enter to retry, Ctrl-D to quit.".red()
        ),
        ConnectionState::Error => eprintln!("{}", "Connection error".red()),
        ConnectionState::Closed => eprintln!("{}", "Disconnected".dimmed()),
    }
}

fn report_frame(frame: &ServerFrame) {
    match frame {
        ServerFrame::Exit { code: Some(code) } => {
            eprintln!("{}", format!("Shell exited with code {}", code).yellow())
        }
        ServerFrame::Exit { code: None } => eprintln!("{}", "Shell exited".yellow()),
        ServerFrame::IdleTimeout => eprintln!("{}", "Session closed after inactivity".yellow()),
        ServerFrame::Closed => eprintln!("{}", "Session closed".yellow()),
        ServerFrame::Error { reason, message } => {
            eprintln!("{} {} ({})", "Error:".red().bold(), message, reason)
        }
        ServerFrame::Ping | ServerFrame::Pong => {}
    }
}

/// Attach to a session and relay stdin lines until the session ends
pub async fn run_attach(args: &AttachArgs, file: &FileConfig) -> Result<()> {
    let config = client_config(args, file)?;
    tracing::debug!(url = %config.url, "attaching");
    let mut handle = connect(config);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut stdin_open = true;
    let mut failed = false;

    loop {
        tokio::select! {
            event = handle.events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ClientEvent::Output(text) => {
                        stdout.write_all(text.as_bytes()).await?;
                        stdout.flush().await?;
                    }
                    ClientEvent::State(state) => {
                        failed = state == ConnectionState::Failed;
                        report_state(&state);
                    }
                    ClientEvent::Control(frame) => report_frame(&frame),
                }
            }
            line = stdin.next_line(), if stdin_open => {
                match line? {
                    Some(_) if failed => {
                        if handle.retry().is_err() {
                            break;
                        }
                    }
                    Some(line) => {
                        // Dropped while reconnecting; the prompt is redrawn on reconnect
                        let _ = handle.send_input(format!("{}\r", line));
                    }
                    None => {
                        stdin_open = false;
                        handle.close();
                    }
                }
            }
        }
    }
    Ok(())
}
