use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use deckterm_types::{
    new_session_id, ClientFrame, Owner, ServerFrame, TerminalError, DEFAULT_COLS,
    DEFAULT_IDLE_TIMEOUT, DEFAULT_ROWS,
};

use super::admission::{AdmissionController, AdmissionLimits};
use super::backend::{
    PersistedSession, PersistenceBackend, PtyEvent, PtySpawner, SessionName, SpawnRequest,
    SpawnedPty,
};
use super::registry::SessionRegistry;
use super::session::{CloseReason, Session, SessionSummary};
use super::transport::{Outbound, SubscriberId, Subscription, Utf8Carry};

/// Settings for a [`TerminalManager`]
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Shell program followed by its arguments
    pub shell: Vec<String>,
    pub default_cols: u16,
    pub default_rows: u16,
    pub limits: AdmissionLimits,
    /// `None` disables idle reaping
    pub idle_timeout: Option<Duration>,
    /// Whether sessions are persistent when the request does not say
    pub persist_by_default: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            default_cols: DEFAULT_COLS,
            default_rows: DEFAULT_ROWS,
            limits: AdmissionLimits::default(),
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            persist_by_default: true,
        }
    }
}

/// `$SHELL` (or bash) as a login interactive shell
pub fn default_shell() -> Vec<String> {
    let program = std::env::var("SHELL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "/bin/bash".to_string());
    vec![program, "-il".to_string()]
}

/// Pick the working directory for a new shell
///
/// Falls back to `$HOME`, then `/`, when the requested path is not a directory.
pub fn resolve_cwd(requested: Option<&Path>) -> PathBuf {
    if let Some(path) = requested {
        if path.is_dir() {
            return path.to_path_buf();
        }
        debug!(cwd = %path.display(), "requested cwd is not a directory");
    }
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .filter(|home| home.is_dir())
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Parameters of a create request; missing or zero dimensions use the defaults
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub cwd: Option<PathBuf>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub persistent: Option<bool>,
}

/// Counters for the health endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerStats {
    pub terminals: usize,
    pub max_terminals: usize,
    pub uptime: Duration,
}

/// Creates, multiplexes, persists and tears down PTY-backed sessions
pub struct TerminalManager {
    config: ManagerConfig,
    registry: SessionRegistry,
    admission: AdmissionController,
    spawner: Arc<dyn PtySpawner>,
    persistence: Option<Arc<dyn PersistenceBackend>>,
    started_at: Instant,
}

impl std::fmt::Debug for TerminalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalManager")
            .field(
                "persistence",
                &self.persistence.as_ref().map(|b| b.backend_name().to_string()),
            )
            .field("limits", &self.config.limits)
            .finish()
    }
}

fn or_default(value: Option<u16>, default: u16) -> u16 {
    match value {
        Some(v) if v > 0 => v,
        _ => default.max(1),
    }
}

impl TerminalManager {
    pub fn new(
        config: ManagerConfig,
        spawner: Arc<dyn PtySpawner>,
        persistence: Option<Arc<dyn PersistenceBackend>>,
    ) -> Arc<Self> {
        let admission = AdmissionController::new(config.limits);
        if let Some(backend) = &persistence {
            info!(backend = backend.backend_name(), prefix = backend.prefix(), "session persistence enabled");
        }
        Arc::new(Self {
            config,
            registry: SessionRegistry::new(),
            admission,
            spawner,
            persistence,
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn persistence(&self) -> Option<&Arc<dyn PersistenceBackend>> {
        self.persistence.as_ref()
    }

    pub async fn stats(&self) -> ManagerStats {
        ManagerStats {
            terminals: self.registry.len().await,
            max_terminals: self.config.limits.max_sessions,
            uptime: self.started_at.elapsed(),
        }
    }

    /// Start a new shell for `owner`
    pub async fn create(
        self: &Arc<Self>,
        owner: &Owner,
        request: CreateRequest,
    ) -> Result<Arc<Session>, TerminalError> {
        let reservation = self
            .admission
            .try_admit(&owner.id)
            .map_err(TerminalError::QuotaExceeded)?;

        let id = new_session_id();
        let _guard = self.registry.lock_id(&id).await;

        let cwd = resolve_cwd(request.cwd.as_deref());
        let cols = or_default(request.cols, self.config.default_cols);
        let rows = or_default(request.rows, self.config.default_rows);
        let persistent = request.persistent.unwrap_or(self.config.persist_by_default);

        let (spawned, persistent_name) = match (&self.persistence, persistent) {
            (Some(backend), true) => {
                let name = SessionName::new(&owner.id, &id).render(backend.prefix());
                let spawned = self
                    .spawn_persistent(backend.as_ref(), &name, &cwd, cols, rows)
                    .await?;
                (spawned, Some(name))
            }
            _ => (self.spawn_pty(self.shell_request(&cwd, cols, rows)?).await?, None),
        };

        let session = Arc::new(Session::new(
            id.clone(),
            owner.clone(),
            cwd,
            cols,
            rows,
            persistent_name,
            Arc::clone(&spawned.control),
        ));

        if !self.registry.insert(Arc::clone(&session)).await {
            spawned.control.close();
            return Err(TerminalError::spawn(format!("session id {} already in use", id)));
        }
        reservation.commit();
        session.activate();
        self.spawn_pump(Arc::clone(&session), spawned.events);

        info!(
            session_id = %session.id,
            owner = %owner.id,
            cwd = %session.cwd.display(),
            cols,
            rows,
            persistent = session.is_persistent(),
            "terminal created"
        );
        Ok(session)
    }

    fn shell_request(&self, cwd: &Path, cols: u16, rows: u16) -> Result<SpawnRequest, TerminalError> {
        let (program, args) = self
            .config
            .shell
            .split_first()
            .ok_or_else(|| TerminalError::spawn("no shell configured"))?;
        let request = args
            .iter()
            .fold(SpawnRequest::new(program, cwd, cols, rows), |req, arg| req.arg(arg));
        Ok(request.with_terminal_env())
    }

    async fn spawn_persistent(
        &self,
        backend: &dyn PersistenceBackend,
        name: &str,
        cwd: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<SpawnedPty, TerminalError> {
        backend
            .create_detached(name, &self.config.shell, cwd, cols, rows)
            .await
            .map_err(|e| TerminalError::spawn(format!("{:#}", e)))?;

        match self.spawn_pty(backend.attach(name, cwd, cols, rows)).await {
            Ok(spawned) => Ok(spawned),
            Err(e) => {
                // Don't leave a detached shell nobody can reach
                if let Err(kill_err) = backend.kill(name).await {
                    warn!(name, error = %kill_err, "failed to remove unattached session");
                }
                Err(e)
            }
        }
    }

    async fn spawn_pty(&self, request: SpawnRequest) -> Result<SpawnedPty, TerminalError> {
        let spawner = Arc::clone(&self.spawner);
        tokio::task::spawn_blocking(move || spawner.spawn(&request))
            .await
            .map_err(|e| TerminalError::spawn(format!("spawn task failed: {}", e)))?
    }

    /// Forward PTY events to subscribers until the process exits
    fn spawn_pump(self: &Arc<Self>, session: Arc<Session>, mut events: mpsc::UnboundedReceiver<PtyEvent>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut decoder = Utf8Carry::new();
            let mut code = None;
            while let Some(event) = events.recv().await {
                match event {
                    PtyEvent::Output(bytes) => {
                        let text = decoder.push(&bytes);
                        if !text.is_empty() {
                            session.subscribers().broadcast(&Outbound::Output(text));
                        }
                    }
                    PtyEvent::Exit { code: exit_code } => {
                        code = exit_code;
                        break;
                    }
                }
            }
            let tail = decoder.finish();
            if !tail.is_empty() {
                session.subscribers().broadcast(&Outbound::Output(tail));
            }
            if let Some(manager) = manager.upgrade() {
                manager.finish(&session, CloseReason::Exited(code)).await;
            }
        });
    }

    pub async fn get(&self, id: &str) -> Result<Arc<Session>, TerminalError> {
        self.registry.get(id).await
    }

    /// Look up `id` and check that `owner_id` owns it
    pub async fn authorize(&self, id: &str, owner_id: &str) -> Result<Arc<Session>, TerminalError> {
        let session = self.registry.get(id).await?;
        if !session.is_owned_by(owner_id) {
            warn!(session_id = id, owner = owner_id, "access to foreign terminal denied");
            return Err(TerminalError::Forbidden(id.to_string()));
        }
        Ok(session)
    }

    pub async fn list_by_owner(&self, owner_id: &str) -> Vec<SessionSummary> {
        self.registry.list_by_owner(owner_id).await
    }

    pub async fn len(&self) -> usize {
        self.registry.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.registry.is_empty().await
    }

    /// Close a session on its owner's request
    pub async fn close(&self, id: &str, owner_id: &str) -> Result<(), TerminalError> {
        let session = self.authorize(id, owner_id).await?;
        if !self.finish(&session, CloseReason::Explicit).await {
            // Lost a race with exit or the reaper
            return Err(TerminalError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Change the size of a session's terminal; zero dimensions use the defaults
    pub async fn resize(
        &self,
        id: &str,
        owner_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(u16, u16), TerminalError> {
        let session = self.authorize(id, owner_id).await?;
        Ok(self.resize_session(&session, cols, rows).await)
    }

    async fn resize_session(&self, session: &Session, cols: u16, rows: u16) -> (u16, u16) {
        let cols = or_default(Some(cols), self.config.default_cols);
        let rows = or_default(Some(rows), self.config.default_rows);
        let (cols, rows) = session.set_size(cols, rows);
        if !session.pty().resize(cols, rows) {
            debug!(session_id = %session.id, "resize on closed PTY ignored");
        }
        if let (Some(name), Some(backend)) = (&session.persistent_name, &self.persistence) {
            if let Err(e) = backend.resize_pane(name, cols, rows).await {
                warn!(session_id = %session.id, error = %e, "failed to resize persistent pane");
            }
        }
        session.touch();
        (cols, rows)
    }

    /// Attach a new channel to a session owned by `owner_id`
    pub async fn attach(
        &self,
        id: &str,
        owner_id: &str,
    ) -> Result<(Arc<Session>, Subscription), TerminalError> {
        let session = self.authorize(id, owner_id).await?;
        let subscription = session
            .subscribers()
            .attach()
            .ok_or_else(|| TerminalError::NotFound(id.to_string()))?;
        debug!(session_id = id, subscriber = subscription.id, "subscriber attached");
        Ok((session, subscription))
    }

    pub fn detach(&self, session: &Session, subscriber: SubscriberId) {
        if session.subscribers().detach(subscriber) {
            debug!(session_id = %session.id, subscriber, "subscriber detached");
        }
    }

    /// Write input to a session's PTY and count it as activity
    ///
    /// Returns false when the PTY is already closed.
    pub async fn route_input(&self, id: &str, data: &[u8]) -> Result<bool, TerminalError> {
        let session = self.registry.get(id).await?;
        Ok(write_input(&session, data))
    }

    /// Send output to every channel attached to `id`
    pub async fn broadcast_output(&self, id: &str, output: &str) -> Result<usize, TerminalError> {
        let session = self.registry.get(id).await?;
        Ok(session.subscribers().broadcast(&Outbound::Output(output.to_string())))
    }

    /// Apply one decoded frame from a subscriber
    ///
    /// `reply` reaches only the sending subscriber.
    pub async fn handle_frame(
        &self,
        session: &Session,
        reply: &mpsc::Sender<Outbound>,
        frame: ClientFrame,
    ) {
        match frame {
            ClientFrame::Input { data } | ClientFrame::Raw(data) => {
                write_input(session, data.as_bytes());
            }
            ClientFrame::Resize { cols, rows } => {
                self.resize_session(session, cols, rows).await;
            }
            ClientFrame::Ping => {
                if let Err(e) = reply.try_send(Outbound::Control(ServerFrame::Pong)) {
                    debug!(session_id = %session.id, error = %e, "pong dropped");
                }
            }
            ClientFrame::Pong => trace!(session_id = %session.id, "pong"),
            ClientFrame::Unrecognized(kind) => {
                debug!(session_id = %session.id, kind = %kind, "ignoring unknown frame type");
            }
        }
    }

    /// Tear a session down: notify and close its channels, release its
    /// handles and drop it from the registry
    ///
    /// Returns false if it had already reached a terminal state.
    async fn finish(&self, session: &Arc<Session>, reason: CloseReason) -> bool {
        let _guard = self.registry.lock_id(&session.id).await;
        if !session.begin_close(reason) {
            return false;
        }

        let notified = session.subscribers().close_all(reason.frame());
        session.pty().close();

        if reason != CloseReason::Shutdown {
            if let (Some(name), Some(backend)) = (&session.persistent_name, &self.persistence) {
                if let Err(e) = backend.kill(name).await {
                    warn!(session_id = %session.id, error = %e, "failed to kill persistent session");
                }
            }
        }

        if self.registry.remove_session(session).await {
            self.admission.release(&session.owner.id);
        }

        info!(
            session_id = %session.id,
            owner = %session.owner.id,
            reason = reason.as_str(),
            subscribers = notified,
            "terminal closed"
        );
        true
    }

    pub async fn reap_idle(&self) -> usize {
        self.reap_idle_at(Instant::now()).await
    }

    /// Close every session idle for longer than the idle timeout
    pub async fn reap_idle_at(&self, now: Instant) -> usize {
        let Some(timeout) = self.config.idle_timeout else {
            return 0;
        };
        let mut reaped = 0;
        for session in self.registry.all().await {
            if session.is_idle_at(now, timeout) && self.finish(&session, CloseReason::IdleTimeout).await {
                reaped += 1;
            }
        }
        if reaped > 0 {
            info!(reaped, "idle terminals reaped");
        }
        reaped
    }

    /// Re-attach every session left in the persistence backend
    ///
    /// Call before serving traffic. Broken entries are logged and skipped.
    pub async fn recover(self: &Arc<Self>) -> usize {
        let Some(backend) = self.persistence.clone() else {
            return 0;
        };
        let existing = match backend.list_existing().await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(error = %e, "could not enumerate persisted sessions");
                return 0;
            }
        };

        let mut recovered = 0;
        for persisted in existing {
            let Some(name) = SessionName::parse(backend.prefix(), &persisted.name) else {
                warn!(name = %persisted.name, "skipping persisted session with malformed name");
                continue;
            };
            match self.recover_one(backend.as_ref(), &persisted, name).await {
                Ok(()) => recovered += 1,
                Err(e) => warn!(name = %persisted.name, error = %e, "failed to recover session"),
            }
        }
        info!(recovered, "persisted sessions recovered");
        recovered
    }

    async fn recover_one(
        self: &Arc<Self>,
        backend: &dyn PersistenceBackend,
        persisted: &PersistedSession,
        name: SessionName,
    ) -> Result<(), TerminalError> {
        let _guard = self.registry.lock_id(&name.session_id).await;
        if self.registry.contains(&name.session_id).await {
            debug!(session_id = %name.session_id, "session already registered");
            return Ok(());
        }

        let cwd = resolve_cwd(Some(&persisted.cwd));
        let cols = persisted.cols.max(1);
        let rows = persisted.rows.max(1);
        let spawned = self
            .spawn_pty(backend.attach(&persisted.name, &cwd, cols, rows))
            .await?;

        let session = Arc::new(Session::new(
            name.session_id.clone(),
            Owner::recovered(&name.owner_id),
            cwd,
            cols,
            rows,
            Some(persisted.name.clone()),
            Arc::clone(&spawned.control),
        ));
        if !self.registry.insert(Arc::clone(&session)).await {
            spawned.control.close();
            return Err(TerminalError::spawn("session id already registered"));
        }
        self.admission.register_existing(&name.owner_id);
        session.activate();
        self.spawn_pump(Arc::clone(&session), spawned.events);

        info!(session_id = %session.id, owner = %name.owner_id, "session recovered");
        Ok(())
    }

    /// Release every session for server shutdown
    ///
    /// Ephemeral shells are killed. Persistent sessions are only detached so
    /// the next startup can recover them.
    pub async fn shutdown(&self) -> usize {
        let sessions = self.registry.drain().await;
        let count = sessions.len();
        for session in sessions {
            let _guard = self.registry.lock_id(&session.id).await;
            if session.begin_close(CloseReason::Shutdown) {
                session.subscribers().close_all(None);
                session.pty().close();
                self.admission.release(&session.owner.id);
            }
        }
        info!(sessions = count, "terminal manager shut down");
        count
    }
}

fn write_input(session: &Session, data: &[u8]) -> bool {
    let written = session.pty().write(data);
    if written {
        session.touch();
    } else {
        debug!(session_id = %session.id, "input to closed PTY dropped");
    }
    written
}
