use std::fmt;
use std::time::Duration;

use super::backoff::BackoffPolicy;

/// Availability of the streaming channel as the client sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Closed cleanly, or on purpose
    Closed,
    Error,
    Reconnecting { attempt: u32, delay: Duration },
    /// Gave up after too many attempts; only [`ReconnectMachine::retry`] leaves it
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Closed => write!(f, "closed"),
            ConnectionState::Error => write!(f, "error"),
            ConnectionState::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {} in {}ms)", attempt, delay.as_millis())
            }
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// How a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    Clean,
    Error,
    /// No pong within the heartbeat timeout
    HeartbeatTimeout,
}

/// What the driver should do after a disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Reconnect { attempt: u32, delay: Duration },
    GiveUp,
    Stop,
}

/// Reconnect bookkeeping, free of any I/O
#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    policy: BackoffPolicy,
    state: ConnectionState,
    attempt: u32,
    intentionally_closed: bool,
}

impl ReconnectMachine {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Connecting,
            attempt: 0,
            intentionally_closed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// A connection attempt is starting
    pub fn connecting(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// The channel opened; the attempt counter starts over
    pub fn on_open(&mut self) {
        self.attempt = 0;
        self.state = ConnectionState::Connected;
    }

    /// The channel closed or failed to open
    pub fn on_disconnect(&mut self, how: Disconnect) -> NextStep {
        if self.intentionally_closed {
            self.state = ConnectionState::Closed;
            return NextStep::Stop;
        }
        self.state = match how {
            Disconnect::Clean => ConnectionState::Closed,
            Disconnect::Error | Disconnect::HeartbeatTimeout => ConnectionState::Error,
        };
        if self.attempt >= self.policy.max_retries {
            self.state = ConnectionState::Failed;
            return NextStep::GiveUp;
        }
        let delay = self.policy.delay(self.attempt);
        self.attempt += 1;
        self.state = ConnectionState::Reconnecting {
            attempt: self.attempt,
            delay,
        };
        NextStep::Reconnect {
            attempt: self.attempt,
            delay,
        }
    }

    /// Local close; no reconnect follows
    pub fn close(&mut self) {
        self.intentionally_closed = true;
        self.state = ConnectionState::Closed;
    }

    pub fn is_intentionally_closed(&self) -> bool {
        self.intentionally_closed
    }

    /// Start over after `Failed`; false in any other state
    pub fn retry(&mut self) -> bool {
        if self.state != ConnectionState::Failed {
            return false;
        }
        self.attempt = 0;
        self.intentionally_closed = false;
        self.state = ConnectionState::Connecting;
        true
    }
}
