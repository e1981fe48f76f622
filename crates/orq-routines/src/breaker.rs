//! Circuit breaker state machine.
//!
//! # Invariants
//!
//! - Closed → Open after `threshold` consecutive failures; `last_failure_at`
//!   is stamped on the transition.
//! - Open refuses every call until `now − last_failure_at > reset_timeout`,
//!   then the next `allow` admits exactly one test probe (HalfOpen).
//! - HalfOpen admits no second call while the probe is in flight; the probe's
//!   outcome decides Closed (success) or Open (failure).
//!
//! All logic is pure deterministic: no IO and no clock reads. The caller
//! passes `now`, which keeps every transition unit-testable without sleeping.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct Breaker {
    state: BreakerState,
    failure_count: u32,
    threshold: u32,
    reset_timeout: Duration,
    last_failure_at: Option<Instant>,
    in_test: bool,
}

impl Breaker {
    /// A pristine Closed breaker. `threshold` is clamped to at least 1.
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            threshold: threshold.max(1),
            reset_timeout,
            last_failure_at: None,
            in_test: false,
        }
    }

    /// Whether a call may proceed at `now`.
    ///
    /// Open → HalfOpen happens here: once the reset window has elapsed the
    /// call is admitted as the single test probe and `in_test` is set.
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed_ok = match self.last_failure_at {
                    Some(t) => now.saturating_duration_since(t) > self.reset_timeout,
                    None => true,
                };
                if elapsed_ok {
                    self.state = BreakerState::HalfOpen;
                    self.in_test = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if self.in_test {
                    false
                } else {
                    self.in_test = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            BreakerState::Closed => self.failure_count = 0,
            BreakerState::HalfOpen => {
                self.state = BreakerState::Closed;
                self.failure_count = 0;
                self.in_test = false;
                self.last_failure_at = None;
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        match self.state {
            BreakerState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.threshold {
                    self.state = BreakerState::Open;
                    self.last_failure_at = Some(now);
                }
            }
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.last_failure_at = Some(now);
                self.in_test = false;
            }
            BreakerState::Open => {
                self.last_failure_at = Some(now);
            }
        }
    }

    /// Back to pristine Closed, keeping threshold and timeout.
    pub fn reset(&mut self) {
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.last_failure_at = None;
        self.in_test = false;
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }

    pub fn in_test(&self) -> bool {
        self.in_test
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> Instant {
        Instant::now()
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let now = t0();
        let mut b = Breaker::new(2, Duration::from_millis(200));

        assert!(b.allow(now));
        b.record_failure(now);
        assert_eq!(b.state(), BreakerState::Closed);

        assert!(b.allow(now));
        b.record_failure(now);
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow(now), "open breaker must fail fast");
    }

    #[test]
    fn success_in_closed_resets_failure_count() {
        let now = t0();
        let mut b = Breaker::new(3, Duration::from_millis(200));

        b.record_failure(now);
        b.record_failure(now);
        b.record_success();
        assert_eq!(b.failure_count(), 0);

        // Two more failures do not reach the threshold of 3 from zero.
        b.record_failure(now);
        b.record_failure(now);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let now = t0();
        let mut b = Breaker::new(1, Duration::from_millis(200));

        b.record_failure(now);
        assert_eq!(b.state(), BreakerState::Open);

        // Before the window: refused.
        assert!(!b.allow(now + Duration::from_millis(100)));

        // After the window: one probe admitted, the next refused.
        let later = now + Duration::from_millis(201);
        assert!(b.allow(later));
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.in_test());
        assert!(!b.allow(later), "second concurrent probe must be refused");
    }

    #[test]
    fn probe_outcome_decides_closed_or_open() {
        let now = t0();
        let mut b = Breaker::new(1, Duration::from_millis(100));

        b.record_failure(now);
        let later = now + Duration::from_millis(101);
        assert!(b.allow(later));
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.allow(later));

        b.record_failure(later);
        let again = later + Duration::from_millis(101);
        assert!(b.allow(again));
        b.record_failure(again);
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn reset_returns_to_pristine_closed() {
        let now = t0();
        let mut b = Breaker::new(1, Duration::from_millis(100));
        b.record_failure(now);
        assert_eq!(b.state(), BreakerState::Open);

        b.reset();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.failure_count(), 0);
        assert!(b.allow(now));
    }
}
