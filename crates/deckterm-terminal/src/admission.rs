/// Creation throttling and session caps
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use deckterm_types::QuotaKind;
use tracing::{debug, warn};

/// Sliding-window counter of creation timestamps
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max: usize,
    timestamps: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(window: Duration, max: usize) -> Self {
        Self {
            window,
            max,
            timestamps: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.timestamps.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether another creation fits in the window ending at `now`
    pub fn check_at(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.timestamps.len() < self.max
    }

    pub fn record_at(&mut self, now: Instant) {
        self.timestamps.push_back(now);
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Limits for [`AdmissionController`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    pub max_sessions: usize,
    pub max_sessions_per_owner: usize,
    pub rate_window: Duration,
    pub rate_max: usize,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            max_sessions: deckterm_types::DEFAULT_MAX_SESSIONS,
            max_sessions_per_owner: deckterm_types::DEFAULT_MAX_SESSIONS_PER_OWNER,
            rate_window: deckterm_types::DEFAULT_RATE_LIMIT_WINDOW,
            rate_max: deckterm_types::DEFAULT_RATE_LIMIT_MAX,
        }
    }
}

#[derive(Debug)]
struct AdmissionState {
    rate: RateLimiter,
    per_owner: HashMap<String, usize>,
    total: usize,
}

impl AdmissionState {
    fn release(&mut self, owner_id: &str) {
        self.total = self.total.saturating_sub(1);
        if let Some(count) = self.per_owner.get_mut(owner_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_owner.remove(owner_id);
            }
        }
    }
}

/// Decides whether a new session may be created
///
/// An admitted request holds a slot through its [`Reservation`] while the
/// shell starts, so concurrent creates cannot overshoot the caps.
#[derive(Debug)]
pub struct AdmissionController {
    limits: AdmissionLimits,
    state: Mutex<AdmissionState>,
}

impl AdmissionController {
    pub fn new(limits: AdmissionLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(AdmissionState {
                rate: RateLimiter::new(limits.rate_window, limits.rate_max),
                per_owner: HashMap::new(),
                total: 0,
            }),
        }
    }

    /// Poisoning is ignored; no update leaves the counters half-written
    fn lock(&self) -> MutexGuard<'_, AdmissionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn limits(&self) -> AdmissionLimits {
        self.limits
    }

    pub fn try_admit(&self, owner_id: &str) -> Result<Reservation<'_>, QuotaKind> {
        self.try_admit_at(owner_id, Instant::now())
    }

    /// Rate limit first, then the owner's cap, then the global cap
    ///
    /// The attempt counts against the rate window as soon as it is admitted,
    /// whether or not the spawn that follows succeeds.
    pub fn try_admit_at(&self, owner_id: &str, now: Instant) -> Result<Reservation<'_>, QuotaKind> {
        let mut state = self.lock();

        if !state.rate.check_at(now) {
            warn!(owner = owner_id, "creation rate limit reached");
            return Err(QuotaKind::RateLimited);
        }
        let owned = state.per_owner.get(owner_id).copied().unwrap_or(0);
        if owned >= self.limits.max_sessions_per_owner {
            warn!(owner = owner_id, owned, "per-owner session cap reached");
            return Err(QuotaKind::OwnerSessionLimit);
        }
        if state.total >= self.limits.max_sessions {
            warn!(owner = owner_id, total = state.total, "global session cap reached");
            return Err(QuotaKind::GlobalSessionLimit);
        }

        state.rate.record_at(now);
        *state.per_owner.entry(owner_id.to_string()).or_insert(0) += 1;
        state.total += 1;
        debug!(owner = owner_id, total = state.total, "creation admitted");

        Ok(Reservation {
            controller: self,
            owner_id: owner_id.to_string(),
            committed: false,
        })
    }

    /// Count a session that already exists, e.g. one found during recovery
    ///
    /// Bypasses the rate limit and the caps.
    pub fn register_existing(&self, owner_id: &str) {
        let mut state = self.lock();
        *state.per_owner.entry(owner_id.to_string()).or_insert(0) += 1;
        state.total += 1;
    }

    /// Free the slot held by a session that has ended
    pub fn release(&self, owner_id: &str) {
        self.lock().release(owner_id);
    }

    pub fn total(&self) -> usize {
        self.lock().total
    }

    pub fn owned_by(&self, owner_id: &str) -> usize {
        self.lock().per_owner.get(owner_id).copied().unwrap_or(0)
    }
}

/// A slot held for a creation in progress
///
/// Dropping an uncommitted reservation gives the slot back; the rate-limit
/// timestamp stays.
#[derive(Debug)]
pub struct Reservation<'a> {
    controller: &'a AdmissionController,
    owner_id: String,
    committed: bool,
}

impl Reservation<'_> {
    /// Keep the slot for the lifetime of the new session
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.controller.release(&self.owner_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max: usize, per_owner: usize, rate_max: usize) -> AdmissionLimits {
        AdmissionLimits {
            max_sessions: max,
            max_sessions_per_owner: per_owner,
            rate_window: Duration::from_secs(60),
            rate_max,
        }
    }

    #[test]
    fn test_rate_limiter_window() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(Duration::from_secs(60), 2);
        assert!(limiter.check_at(start));
        limiter.record_at(start);
        limiter.record_at(start + Duration::from_secs(1));
        assert!(!limiter.check_at(start + Duration::from_secs(59)));
        assert!(limiter.check_at(start + Duration::from_secs(60)));
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn test_owner_cap_then_global_cap() {
        let controller = AdmissionController::new(limits(3, 2, 100));
        let now = Instant::now();
        controller.try_admit_at("alice", now).unwrap().commit();
        controller.try_admit_at("alice", now).unwrap().commit();
        assert_eq!(
            controller.try_admit_at("alice", now).unwrap_err(),
            QuotaKind::OwnerSessionLimit
        );
        controller.try_admit_at("bob", now).unwrap().commit();
        assert_eq!(
            controller.try_admit_at("carol", now).unwrap_err(),
            QuotaKind::GlobalSessionLimit
        );
    }

    #[test]
    fn test_rate_limit_checked_first() {
        let controller = AdmissionController::new(limits(10, 10, 2));
        let now = Instant::now();
        // Failed spawns still consume rate budget
        drop(controller.try_admit_at("alice", now).unwrap());
        drop(controller.try_admit_at("alice", now).unwrap());
        assert_eq!(controller.total(), 0);
        assert_eq!(
            controller.try_admit_at("alice", now).unwrap_err(),
            QuotaKind::RateLimited
        );
    }

    #[test]
    fn test_release_frees_owner_slot() {
        let controller = AdmissionController::new(limits(10, 1, 100));
        let now = Instant::now();
        controller.try_admit_at("alice", now).unwrap().commit();
        assert!(controller.try_admit_at("alice", now).is_err());
        controller.release("alice");
        assert_eq!(controller.owned_by("alice"), 0);
        assert!(controller.try_admit_at("alice", now).is_ok());
    }

    #[test]
    fn test_poisoned_lock_still_admits() {
        let controller = AdmissionController::new(limits(10, 10, 100));
        let poisoned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = controller.state.lock().unwrap();
            panic!("poison the admission lock");
        }));
        assert!(poisoned.is_err());
        assert!(controller.state.is_poisoned());

        controller.try_admit("alice").unwrap().commit();
        assert_eq!(controller.total(), 1);
        assert_eq!(controller.owned_by("alice"), 1);
    }

    #[test]
    fn test_register_existing_counts_toward_caps() {
        let controller = AdmissionController::new(limits(1, 10, 100));
        controller.register_existing("alice");
        assert_eq!(
            controller.try_admit("bob").unwrap_err(),
            QuotaKind::GlobalSessionLimit
        );
    }
}
