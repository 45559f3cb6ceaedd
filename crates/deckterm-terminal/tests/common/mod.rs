#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use deckterm_terminal::{
    AdmissionLimits, ManagerConfig, Outbound, PersistedSession, PersistenceBackend, PtyControl,
    PtyEvent, PtySpawner, SpawnRequest, SpawnedPty, TerminalManager,
};
use deckterm_types::TerminalError;
use tokio::sync::mpsc;

/// In-memory PTY that records what the manager does to it
pub struct FakePty {
    pub written: Mutex<Vec<u8>>,
    pub resizes: Mutex<Vec<(u16, u16)>>,
    closed: AtomicBool,
    events: mpsc::UnboundedSender<PtyEvent>,
}

impl FakePty {
    /// Simulate the process printing `text`
    pub fn emit(&self, text: &str) {
        let _ = self.events.send(PtyEvent::Output(text.as_bytes().to_vec()));
    }

    /// Simulate the process exiting
    pub fn exit(&self, code: Option<i32>) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.events.send(PtyEvent::Exit { code });
    }

    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.written.lock().unwrap()).into_owned()
    }
}

impl PtyControl for FakePty {
    fn write(&self, data: &[u8]) -> bool {
        if self.is_closed() {
            return false;
        }
        self.written.lock().unwrap().extend_from_slice(data);
        true
    }

    fn resize(&self, cols: u16, rows: u16) -> bool {
        if self.is_closed() {
            return false;
        }
        self.resizes.lock().unwrap().push((cols, rows));
        true
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(PtyEvent::Exit { code: None });
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn process_id(&self) -> Option<u32> {
        None
    }
}

/// Spawner handing out [`FakePty`]s; can be told to fail
#[derive(Default)]
pub struct FakeSpawner {
    pub spawned: Mutex<Vec<(SpawnRequest, Arc<FakePty>)>>,
    fail_remaining: AtomicUsize,
}

impl FakeSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `count` spawns fail
    pub fn fail_next(&self, count: usize) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    pub fn pty(&self, index: usize) -> Arc<FakePty> {
        Arc::clone(&self.spawned.lock().unwrap()[index].1)
    }

    pub fn request(&self, index: usize) -> SpawnRequest {
        self.spawned.lock().unwrap()[index].0.clone()
    }

    pub fn count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }
}

impl PtySpawner for FakeSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedPty, TerminalError> {
        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TerminalError::SpawnFailure("fake spawn failure".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let pty = Arc::new(FakePty {
            written: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            events: tx,
        });
        self.spawned
            .lock()
            .unwrap()
            .push((request.clone(), Arc::clone(&pty)));
        Ok(SpawnedPty {
            control: pty,
            events: rx,
        })
    }
}

/// Persistence backend keeping its "multiplexer sessions" in memory
#[derive(Default)]
pub struct FakePersistence {
    pub existing: Mutex<Vec<PersistedSession>>,
    pub created: Mutex<Vec<String>>,
    pub killed: Mutex<Vec<String>>,
    pub resized: Mutex<Vec<(String, u16, u16)>>,
    pub fail_listing: AtomicBool,
}

impl FakePersistence {
    pub fn with_sessions(names: &[&str]) -> Arc<Self> {
        let backend = Self::default();
        *backend.existing.lock().unwrap() = names
            .iter()
            .map(|name| PersistedSession {
                name: name.to_string(),
                cwd: std::env::temp_dir(),
                cols: 100,
                rows: 40,
            })
            .collect();
        Arc::new(backend)
    }
}

#[async_trait]
impl PersistenceBackend for FakePersistence {
    async fn create_detached(
        &self,
        name: &str,
        _shell: &[String],
        cwd: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<()> {
        self.created.lock().unwrap().push(name.to_string());
        self.existing.lock().unwrap().push(PersistedSession {
            name: name.to_string(),
            cwd: cwd.to_path_buf(),
            cols,
            rows,
        });
        Ok(())
    }

    fn attach(&self, name: &str, cwd: &Path, cols: u16, rows: u16) -> SpawnRequest {
        SpawnRequest::new("fake-attach", cwd, cols, rows).arg(name)
    }

    async fn resize_pane(&self, name: &str, cols: u16, rows: u16) -> Result<()> {
        self.resized.lock().unwrap().push((name.to_string(), cols, rows));
        Ok(())
    }

    async fn kill(&self, name: &str) -> Result<()> {
        self.killed.lock().unwrap().push(name.to_string());
        let mut existing = self.existing.lock().unwrap();
        let before = existing.len();
        existing.retain(|s| s.name != name);
        if existing.len() == before {
            bail!("can't find session: {}", name);
        }
        Ok(())
    }

    async fn list_existing(&self) -> Result<Vec<PersistedSession>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            bail!("no multiplexer");
        }
        Ok(self.existing.lock().unwrap().clone())
    }

    fn prefix(&self) -> &str {
        "deckterm"
    }

    fn backend_name(&self) -> &str {
        "fake"
    }
}

pub fn config(max_sessions: usize, per_owner: usize, rate_max: usize) -> ManagerConfig {
    ManagerConfig {
        shell: vec!["/bin/sh".to_string(), "-il".to_string()],
        limits: AdmissionLimits {
            max_sessions,
            max_sessions_per_owner: per_owner,
            rate_window: Duration::from_secs(60),
            rate_max,
        },
        idle_timeout: Some(Duration::from_secs(60)),
        ..ManagerConfig::default()
    }
}

pub fn manager(config: ManagerConfig, spawner: &Arc<FakeSpawner>) -> Arc<TerminalManager> {
    TerminalManager::new(config, Arc::clone(spawner) as Arc<dyn PtySpawner>, None)
}

pub fn persistent_manager(
    config: ManagerConfig,
    spawner: &Arc<FakeSpawner>,
    backend: &Arc<FakePersistence>,
) -> Arc<TerminalManager> {
    TerminalManager::new(
        config,
        Arc::clone(spawner) as Arc<dyn PtySpawner>,
        Some(Arc::clone(backend) as Arc<dyn PersistenceBackend>),
    )
}

/// Next message for a subscriber, failing the test after two seconds
pub async fn next_outbound(receiver: &mut mpsc::Receiver<Outbound>) -> Outbound {
    tokio::time::timeout(Duration::from_secs(2), receiver.recv())
        .await
        .expect("timed out waiting for subscriber message")
        .expect("subscriber channel closed")
}

/// Poll until `check` holds, failing the test after two seconds
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
