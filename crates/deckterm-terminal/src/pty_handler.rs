use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Result};
use portable_pty::{
    native_pty_system, ChildKiller, CommandBuilder, ExitStatus, MasterPty, PtySize,
};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::backend::{PtyControl, PtyEvent, SpawnRequest, SpawnedPty};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Exit code of a finished child, `None` when a signal ended it
///
/// portable-pty keeps the signal private and reports such a child as code 1;
/// its `Display` form is the only place the signal shows.
fn exit_code(status: &ExitStatus) -> Option<i32> {
    if status.to_string().starts_with("Terminated by") {
        None
    } else {
        Some(status.exit_code() as i32)
    }
}

/// Handles one PTY and the child process attached to it
pub struct PtyHandler {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
    closed: Arc<AtomicBool>,
}

impl PtyHandler {
    /// Open a PTY, spawn the requested process on it and start the reader thread
    pub fn spawn(request: &SpawnRequest) -> Result<SpawnedPty> {
        let pty_system = native_pty_system();

        let pty_pair = pty_system
            .openpty(pty_size(request.cols, request.rows))
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(&request.program);
        cmd.args(&request.args);
        cmd.cwd(&request.cwd);
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let mut child = pty_pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn '{}' in PTY", request.program))?;
        // The slave must go away so the reader sees EOF once the child exits
        drop(pty_pair.slave);

        let master = pty_pair.master;
        let reader = master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;
        let writer = master.take_writer().context("Failed to take PTY writer")?;
        let killer = child.clone_killer();
        let pid = child.process_id();

        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let reader_closed = Arc::clone(&closed);
        thread::Builder::new()
            .name(format!("deckterm-pty-{}", pid.unwrap_or_default()))
            .spawn(move || {
                read_until_eof(reader, &tx);
                let code = match child.wait() {
                    Ok(status) => exit_code(&status),
                    Err(e) => {
                        warn!(error = %e, "failed to collect PTY child status");
                        None
                    }
                };
                reader_closed.store(true, Ordering::SeqCst);
                let _ = tx.send(PtyEvent::Exit { code });
            })
            .context("Failed to start PTY reader thread")?;

        let handler = Arc::new(Self {
            master: Mutex::new(master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            pid,
            closed,
        });

        debug!(pid = ?pid, program = %request.program, "PTY spawned");

        Ok(SpawnedPty {
            control: handler,
            events: rx,
        })
    }
}

fn read_until_eof(mut reader: Box<dyn Read + Send>, tx: &mpsc::UnboundedSender<PtyEvent>) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                trace!(bytes = n, "PTY output");
                if tx.send(PtyEvent::Output(buffer[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // EIO is how Linux reports a hung-up PTY
            Err(_) => break,
        }
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows: rows.max(1),
        cols: cols.max(1),
        pixel_width: 0,
        pixel_height: 0,
    }
}

impl PtyControl for PtyHandler {
    fn write(&self, data: &[u8]) -> bool {
        if self.is_closed() {
            return false;
        }
        let Ok(mut writer) = self.writer.lock() else {
            return false;
        };
        writer.write_all(data).and_then(|_| writer.flush()).is_ok()
    }

    fn resize(&self, cols: u16, rows: u16) -> bool {
        if self.is_closed() {
            return false;
        }
        let Ok(master) = self.master.lock() else {
            return false;
        };
        match master.resize(pty_size(cols, rows)) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "PTY resize failed");
                false
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut killer) = self.killer.lock() {
            // The child may already be gone
            let _ = killer.kill();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn process_id(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for PtyHandler {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_of_signal_death_is_none() {
        assert_eq!(exit_code(&ExitStatus::with_exit_code(0)), Some(0));
        assert_eq!(exit_code(&ExitStatus::with_exit_code(1)), Some(1));
        assert_eq!(exit_code(&ExitStatus::with_signal("Killed")), None);
    }
}
