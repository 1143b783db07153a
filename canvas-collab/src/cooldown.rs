//! Per-identity write cooldown.
//!
//! An attempt is admitted when `now - last(identity) >= window`. Admission
//! records `now` immediately, before the grid sees the write, so an attempt
//! that is later rejected for bounds or color still spends the cooldown.
//! Rejections leave the record untouched.
//!
//! The limiter is a plain `&mut self` structure: `Canvas` keeps it under the
//! same lock as the grid, which makes check-and-update atomic per identity.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::session::UserIdentity;

/// Outcome of `CooldownLimiter::try_admit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected { remaining: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }

    /// Remaining wait in whole milliseconds, rounded up.
    pub fn remaining_millis(&self) -> Option<u64> {
        match self {
            Admission::Admitted => None,
            Admission::Rejected { remaining } => Some(ceil_millis(*remaining)),
        }
    }
}

/// Round a duration up to whole milliseconds so a rejection never reports 0.
pub fn ceil_millis(d: Duration) -> u64 {
    let millis = d.as_millis() as u64;
    if d.subsec_nanos() % 1_000_000 != 0 {
        millis + 1
    } else {
        millis
    }
}

/// Counters for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CooldownStats {
    pub admitted: u64,
    pub rejected: u64,
    pub tracked_identities: usize,
}

/// Tracks last-admitted attempt per identity.
#[derive(Debug, Clone)]
pub struct CooldownLimiter {
    window: Duration,
    last_write: HashMap<UserIdentity, Instant>,
    admitted: u64,
    rejected: u64,
}

impl CooldownLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_write: HashMap::new(),
            admitted: 0,
            rejected: 0,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admit or reject an attempt by `identity` at `now`.
    pub fn try_admit(&mut self, identity: &UserIdentity, now: Instant) -> Admission {
        if let Some(remaining) = self.remaining(identity, now) {
            self.rejected += 1;
            return Admission::Rejected { remaining };
        }
        self.last_write.insert(identity.clone(), now);
        self.admitted += 1;
        Admission::Admitted
    }

    /// Time left before `identity` may write again, without recording anything.
    pub fn remaining(&self, identity: &UserIdentity, now: Instant) -> Option<Duration> {
        let last = self.last_write.get(identity)?;
        let elapsed = now.saturating_duration_since(*last);
        if elapsed < self.window {
            Some(self.window - elapsed)
        } else {
            None
        }
    }

    /// Drop records whose window has passed. They would admit anyway.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.last_write.len();
        let window = self.window;
        self.last_write
            .retain(|_, last| now.saturating_duration_since(*last) < window);
        before - self.last_write.len()
    }

    pub fn len(&self) -> usize {
        self.last_write.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_write.is_empty()
    }

    pub fn stats(&self) -> CooldownStats {
        CooldownStats {
            admitted: self.admitted,
            rejected: self.rejected,
            tracked_identities: self.last_write.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(5000);

    fn alice() -> UserIdentity {
        UserIdentity::new("alice")
    }

    #[test]
    fn test_first_attempt_admitted() {
        let mut limiter = CooldownLimiter::new(WINDOW);
        assert_eq!(limiter.try_admit(&alice(), Instant::now()), Admission::Admitted);
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn test_inside_window_rejected_with_remaining() {
        let mut limiter = CooldownLimiter::new(WINDOW);
        let t = Instant::now();
        limiter.try_admit(&alice(), t);

        let result = limiter.try_admit(&alice(), t + Duration::from_millis(1200));
        assert_eq!(
            result,
            Admission::Rejected { remaining: Duration::from_millis(3800) }
        );
        assert_eq!(result.remaining_millis(), Some(3800));
    }

    #[test]
    fn test_just_inside_window_boundary() {
        let mut limiter = CooldownLimiter::new(WINDOW);
        let t = Instant::now();
        limiter.try_admit(&alice(), t);

        let result = limiter.try_admit(&alice(), t + WINDOW - Duration::from_millis(1));
        assert_eq!(result.remaining_millis(), Some(1));

        // Sub-millisecond remainder rounds up instead of reporting 0
        let result = limiter.try_admit(&alice(), t + WINDOW - Duration::from_micros(10));
        assert_eq!(result.remaining_millis(), Some(1));
    }

    #[test]
    fn test_exactly_at_window_admitted() {
        let mut limiter = CooldownLimiter::new(WINDOW);
        let t = Instant::now();
        limiter.try_admit(&alice(), t);
        assert!(limiter.try_admit(&alice(), t + WINDOW).is_admitted());
    }

    #[test]
    fn test_just_outside_window_admitted() {
        let mut limiter = CooldownLimiter::new(WINDOW);
        let t = Instant::now();
        limiter.try_admit(&alice(), t);
        assert!(limiter
            .try_admit(&alice(), t + WINDOW + Duration::from_millis(1))
            .is_admitted());
    }

    #[test]
    fn test_rejection_does_not_extend_window() {
        let mut limiter = CooldownLimiter::new(WINDOW);
        let t = Instant::now();
        limiter.try_admit(&alice(), t);
        limiter.try_admit(&alice(), t + Duration::from_millis(4000));
        // Still measured from t, not from the rejected attempt
        assert!(limiter.try_admit(&alice(), t + WINDOW).is_admitted());
    }

    #[test]
    fn test_admission_restarts_window() {
        let mut limiter = CooldownLimiter::new(WINDOW);
        let t = Instant::now();
        limiter.try_admit(&alice(), t);
        let t2 = t + WINDOW;
        limiter.try_admit(&alice(), t2);
        let result = limiter.try_admit(&alice(), t2 + Duration::from_millis(10));
        assert_eq!(result.remaining_millis(), Some(4990));
    }

    #[test]
    fn test_identities_are_independent() {
        let mut limiter = CooldownLimiter::new(WINDOW);
        let t = Instant::now();
        assert!(limiter.try_admit(&alice(), t).is_admitted());
        assert!(limiter.try_admit(&UserIdentity::new("bob"), t).is_admitted());
        assert!(!limiter.try_admit(&alice(), t).is_admitted());
    }

    #[test]
    fn test_zero_window_admits_everything() {
        let mut limiter = CooldownLimiter::new(Duration::ZERO);
        let t = Instant::now();
        for _ in 0..10 {
            assert!(limiter.try_admit(&alice(), t).is_admitted());
        }
    }

    #[test]
    fn test_remaining_does_not_record() {
        let limiter = CooldownLimiter::new(WINDOW);
        assert_eq!(limiter.remaining(&alice(), Instant::now()), None);
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_prune_expired_records() {
        let mut limiter = CooldownLimiter::new(WINDOW);
        let t = Instant::now();
        limiter.try_admit(&alice(), t);
        limiter.try_admit(&UserIdentity::new("bob"), t + Duration::from_millis(3000));

        assert_eq!(limiter.prune(t + Duration::from_millis(6000)), 1);
        assert_eq!(limiter.len(), 1);
        assert!(limiter.remaining(&UserIdentity::new("bob"), t + Duration::from_millis(6000)).is_some());
    }

    #[test]
    fn test_stats() {
        let mut limiter = CooldownLimiter::new(WINDOW);
        let t = Instant::now();
        limiter.try_admit(&alice(), t);
        limiter.try_admit(&alice(), t);
        limiter.try_admit(&alice(), t);
        let stats = limiter.stats();
        assert_eq!(stats.admitted, 1);
        assert_eq!(stats.rejected, 2);
        assert_eq!(stats.tracked_identities, 1);
    }

    #[test]
    fn test_ceil_millis() {
        assert_eq!(ceil_millis(Duration::from_millis(5)), 5);
        assert_eq!(ceil_millis(Duration::from_micros(5001)), 6);
        assert_eq!(ceil_millis(Duration::ZERO), 0);
    }
}
