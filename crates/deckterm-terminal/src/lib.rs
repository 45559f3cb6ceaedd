// Terminal session manager
//
// Spawns shells on pseudo-terminals, fans their output out to any number of
// attached channels, throttles creation, reaps idle sessions and, with a
// persistence backend, keeps shells alive across server restarts.

pub mod admission;
pub mod backend;
mod manager;
mod pty_backend;
mod pty_handler;
mod reaper;
pub mod registry;
pub mod session;
mod tmux_backend;
pub mod transport;

// Re-export public API
pub use admission::{AdmissionController, AdmissionLimits, RateLimiter, Reservation};
pub use backend::{
    PersistedSession, PersistenceBackend, PersistenceBackendType, PtyControl, PtyEvent,
    PtySpawner, SessionName, SpawnRequest, SpawnedPty,
};
pub use manager::{
    default_shell, resolve_cwd, CreateRequest, ManagerConfig, ManagerStats, TerminalManager,
};
pub use pty_backend::NativePtySpawner;
pub use reaper::spawn_idle_reaper;
pub use registry::SessionRegistry;
pub use session::{CloseReason, Session, SessionState, SessionSummary};
pub use tmux_backend::TmuxBackend;
pub use transport::{Outbound, SubscriberId, Subscribers, Subscription, Utf8Carry};
