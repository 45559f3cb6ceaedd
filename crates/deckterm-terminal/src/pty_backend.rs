/// Native PTY spawner (internal implementation)
use super::backend::{PtySpawner, SpawnRequest, SpawnedPty};
use super::pty_handler::PtyHandler;
use deckterm_types::TerminalError;

/// Spawns processes on the host's native pseudo-terminal system
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtySpawner;

impl PtySpawner for NativePtySpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedPty, TerminalError> {
        if !request.cwd.is_dir() {
            return Err(TerminalError::SpawnFailure(format!(
                "working directory '{}' does not exist",
                request.cwd.display()
            )));
        }
        PtyHandler::spawn(request).map_err(|e| TerminalError::spawn(format!("{:#}", e)))
    }
}
