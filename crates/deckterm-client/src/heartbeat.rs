use std::time::{Duration, Instant};

use deckterm_types::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HEARTBEAT_TIMEOUT};

/// What the heartbeat wants done right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Idle,
    SendPing,
    /// The last ping went unanswered
    TimedOut,
}

/// Keep-alive timer for one open connection
#[derive(Debug, Clone)]
pub struct Heartbeat {
    interval: Duration,
    timeout: Duration,
    next_ping: Instant,
    pong_deadline: Option<Instant>,
}

impl Heartbeat {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self::new_at(interval, timeout, Instant::now())
    }

    pub fn new_at(interval: Duration, timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            timeout,
            next_ping: now + interval,
            pong_deadline: None,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HEARTBEAT_TIMEOUT)
    }

    pub fn poll_at(&mut self, now: Instant) -> HeartbeatAction {
        if let Some(deadline) = self.pong_deadline {
            if now >= deadline {
                return HeartbeatAction::TimedOut;
            }
        }
        if now >= self.next_ping {
            self.next_ping = now + self.interval;
            if self.pong_deadline.is_none() {
                self.pong_deadline = Some(now + self.timeout);
            }
            return HeartbeatAction::SendPing;
        }
        HeartbeatAction::Idle
    }

    pub fn on_pong(&mut self) {
        self.pong_deadline = None;
    }

    pub fn awaiting_pong(&self) -> bool {
        self.pong_deadline.is_some()
    }

    /// When [`Heartbeat::poll_at`] next has something to do
    pub fn next_wake(&self) -> Instant {
        match self.pong_deadline {
            Some(deadline) => deadline.min(self.next_ping),
            None => self.next_ping,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_then_pong() {
        let start = Instant::now();
        let mut heartbeat = Heartbeat::new_at(Duration::from_secs(25), Duration::from_secs(5), start);
        assert_eq!(heartbeat.poll_at(start + Duration::from_secs(24)), HeartbeatAction::Idle);
        assert_eq!(heartbeat.poll_at(start + Duration::from_secs(25)), HeartbeatAction::SendPing);
        assert!(heartbeat.awaiting_pong());
        assert_eq!(heartbeat.next_wake(), start + Duration::from_secs(30));
        heartbeat.on_pong();
        assert_eq!(heartbeat.poll_at(start + Duration::from_secs(31)), HeartbeatAction::Idle);
        assert_eq!(heartbeat.next_wake(), start + Duration::from_secs(50));
    }

    #[test]
    fn test_missing_pong_times_out() {
        let start = Instant::now();
        let mut heartbeat = Heartbeat::new_at(Duration::from_secs(25), Duration::from_secs(5), start);
        heartbeat.poll_at(start + Duration::from_secs(25));
        assert_eq!(heartbeat.poll_at(start + Duration::from_secs(29)), HeartbeatAction::Idle);
        assert_eq!(heartbeat.poll_at(start + Duration::from_secs(30)), HeartbeatAction::TimedOut);
    }
}
