//! Per-operation-class circuit breaker.
//!
//! A deterministic function of (record, event, now). Transitions:
//!
//! ```text
//! CLOSED ──failures ≥ threshold──▶ OPEN
//! OPEN ──cooldown elapsed──▶ HALF_OPEN (one trial at a time)
//! HALF_OPEN ──quota successes──▶ CLOSED
//! HALF_OPEN ──any failure──▶ OPEN (cooldown timer reset)
//! ```
//!
//! The clock is injectable so transitions are testable without real delays.

use chrono::{DateTime, Duration, Utc};

use crate::config::EngineConfig;
use crate::types::{BreakerRecord, BreakerState};

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Injectable time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock. The production implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ---------------------------------------------------------------------------
// Policy + breaker
// ---------------------------------------------------------------------------

/// Thresholds governing breaker transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    /// Failures in CLOSED before opening.
    pub failure_threshold: u32,
    /// How long OPEN rejects attempts before permitting a HALF_OPEN trial.
    pub cooldown: Duration,
    /// Consecutive HALF_OPEN successes required to close.
    pub success_quota: u32,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::minutes(5),
            success_quota: 2,
        }
    }
}

impl From<&EngineConfig> for BreakerPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            failure_threshold: config.breaker_failure_threshold,
            cooldown: Duration::seconds(config.breaker_cooldown_secs as i64),
            success_quota: config.breaker_success_quota,
        }
    }
}

/// Breaker state machine over a [`BreakerRecord`]. Holds no record itself;
/// callers own the record (typically inside the unified state) and pass it
/// to each transition.
pub struct Breaker<C: Clock = SystemClock> {
    policy: BreakerPolicy,
    clock: C,
}

impl Breaker<SystemClock> {
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            policy,
            clock: SystemClock,
        }
    }
}

impl<C: Clock> Breaker<C> {
    pub fn with_clock(policy: BreakerPolicy, clock: C) -> Self {
        Self { policy, clock }
    }

    pub fn policy(&self) -> &BreakerPolicy {
        &self.policy
    }

    /// Whether an attempt may proceed right now.
    ///
    /// CLOSED always permits. OPEN rejects until the cooldown elapses, then
    /// transitions to HALF_OPEN. HALF_OPEN permits exactly one in-flight
    /// trial; the permitted attempt must be resolved with
    /// [`Self::record_success`] or [`Self::record_failure`]. A trial that is
    /// never resolved (a crash mid-attempt) expires after a further cooldown
    /// from its admission, so the breaker cannot wedge shut.
    pub fn can_attempt(&self, record: &mut BreakerRecord) -> bool {
        match record.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if self.cooldown_elapsed(record) {
                    record.state = BreakerState::HalfOpen;
                    record.consecutive_successes = 0;
                    self.admit_trial(record);
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if !record.trial_in_flight || self.cooldown_elapsed(record) {
                    self.admit_trial(record);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful attempt.
    pub fn record_success(&self, record: &mut BreakerRecord) {
        match record.state {
            BreakerState::Closed => {
                record.failures = record.failures.saturating_sub(1);
            }
            BreakerState::HalfOpen => {
                record.trial_in_flight = false;
                record.consecutive_successes += 1;
                if record.consecutive_successes >= self.policy.success_quota {
                    self.clear(record);
                }
            }
            // Success reported against OPEN means the caller raced a
            // transition; the breaker stays open until its cooldown.
            BreakerState::Open => {}
        }
    }

    /// Record a failed attempt (including timeouts).
    pub fn record_failure(&self, record: &mut BreakerRecord) {
        let now = self.clock.now();
        record.last_failure = Some(now);
        match record.state {
            BreakerState::Closed => {
                record.failures += 1;
                if record.failures >= self.policy.failure_threshold {
                    record.state = BreakerState::Open;
                    record.opened_at = Some(now);
                }
            }
            BreakerState::HalfOpen => {
                // One failed trial reopens with the cooldown timer reset.
                record.state = BreakerState::Open;
                record.opened_at = Some(now);
                record.trial_in_flight = false;
                record.consecutive_successes = 0;
                record.failures = self.policy.failure_threshold;
            }
            BreakerState::Open => {}
        }
    }

    /// Explicit reset to a pristine CLOSED record.
    pub fn clear(&self, record: &mut BreakerRecord) {
        *record = BreakerRecord::default();
    }

    /// Start a HALF_OPEN trial. `opened_at` is restamped so an abandoned
    /// trial can be detected by its age.
    fn admit_trial(&self, record: &mut BreakerRecord) {
        record.trial_in_flight = true;
        record.opened_at = Some(self.clock.now());
    }

    fn cooldown_elapsed(&self, record: &BreakerRecord) -> bool {
        match record.opened_at {
            Some(opened_at) => self.clock.now() - opened_at >= self.policy.cooldown,
            // OPEN without a timestamp cannot prove its cooldown has run;
            // treat it as just opened.
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
