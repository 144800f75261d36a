//! Circuit breaker for completion backends
//!
//! Each backend in the gateway's fallback chain gets its own breaker so one
//! misbehaving backend cannot poison the others.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation - calls allowed
    Closed,
    /// Too many hard failures - skip this backend
    Open,
    /// Cooldown elapsed - allow one probe call
    HalfOpen,
}

/// Per-backend circuit breaker
pub struct CircuitBreaker {
    failure_count: AtomicU32,
    last_failure: AtomicU64, // Unix timestamp millis
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    /// `threshold` consecutive hard failures open the circuit;
    /// `cooldown_secs` later a single probe is allowed through.
    pub fn new(threshold: u32, cooldown_secs: u64) -> Self {
        Self {
            failure_count: AtomicU32::new(0),
            last_failure: AtomicU64::new(0),
            threshold,
            cooldown: Duration::from_secs(cooldown_secs),
        }
    }

    pub fn state(&self) -> BreakerState {
        let failures = self.failure_count.load(Ordering::Relaxed);
        if failures < self.threshold {
            return BreakerState::Closed;
        }

        let elapsed = now_millis().saturating_sub(self.last_failure.load(Ordering::Relaxed));
        if elapsed >= self.cooldown.as_millis() as u64 {
            BreakerState::HalfOpen
        } else {
            BreakerState::Open
        }
    }

    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.last_failure.store(now_millis(), Ordering::Relaxed);
    }

    /// Whether the gateway should attempt this backend at all
    pub fn allows_call(&self) -> bool {
        !matches!(self.state(), BreakerState::Open)
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, 60)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
