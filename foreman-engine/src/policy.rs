//! Dispatch admission: circuit breaker plus a bounded per-task retry count.
//!
//! The orchestrator consults the policy before every dispatch and retry, and
//! reports each generation outcome back so the breaker record (held in the
//! unified state) stays current.

use foreman_core::breaker::{Breaker, Clock, SystemClock};
use foreman_core::types::{BreakerName, BreakerRecord};

/// Why a task was (not) admitted for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    /// The generation breaker rejects attempts right now.
    BreakerOpen,
    /// The task exhausted its retry budget and is abandoned.
    RetriesExhausted,
}

/// Admission policy for one operation class (generation, by default).
pub struct RetryPolicy<C: Clock = SystemClock> {
    breaker: Breaker<C>,
    name: BreakerName,
    max_retries: u32,
}

impl RetryPolicy<SystemClock> {
    pub fn new(breaker: Breaker<SystemClock>, max_retries: u32) -> Self {
        Self {
            breaker,
            name: BreakerName::from("generation"),
            max_retries,
        }
    }
}

impl<C: Clock> RetryPolicy<C> {
    pub fn with_clock(breaker: Breaker<C>, max_retries: u32) -> Self {
        Self {
            breaker,
            name: BreakerName::from("generation"),
            max_retries,
        }
    }

    pub fn breaker_name(&self) -> &BreakerName {
        &self.name
    }

    /// Decide admission. `attempts` counts prior dispatches of this task;
    /// the first dispatch has `attempts == 0`.
    pub fn admit(&self, record: &mut BreakerRecord, attempts: u32) -> Admission {
        if attempts > self.max_retries {
            return Admission::RetriesExhausted;
        }
        if self.breaker.can_attempt(record) {
            Admission::Admit
        } else {
            Admission::BreakerOpen
        }
    }

    pub fn record_success(&self, record: &mut BreakerRecord) {
        self.breaker.record_success(record);
    }

    pub fn record_failure(&self, record: &mut BreakerRecord) {
        self.breaker.record_failure(record);
    }
}
