//! Reconnection backoff and circuit breaker.
//!
//! Delay for attempt `n` is `min(max, base * 2^n)` plus up to 25% jitter so
//! that many clients dropped by the same outage do not retry in lockstep.
//!
//! ```text
//!          failure × max_attempts            reset timeout elapsed,
//!  Closed ───────────────────────► Open ─────────────────────────► HalfOpen
//!    ▲                              ▲        next connect()           │
//!    │            success           │         failure                 │
//!    └──────────────────────────────┼─────────────────────────────────┤
//!                                   └─────────────────────────────────┘
//! ```

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::ConnectionConfig;

/// Maximum jitter as a fraction of the computed delay.
pub const MAX_JITTER: f64 = 0.25;

/// Exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base_ms: base.as_millis() as u64,
            max_ms: max.as_millis() as u64,
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            base_ms: config.base_delay_ms,
            max_ms: config.max_delay_ms,
        }
    }

    /// `min(max, base * 2^attempt)` without jitter.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_ms.saturating_mul(factor).min(self.max_ms))
    }

    /// Delay with `fraction` of jitter applied; `fraction` is clamped to [0, MAX_JITTER].
    pub fn delay_with_jitter(&self, attempt: u32, fraction: f64) -> Duration {
        let capped = self.capped_delay(attempt);
        capped + capped.mul_f64(fraction.clamp(0.0, MAX_JITTER))
    }

    /// Delay for `attempt` with random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let fraction = rand::rng().random_range(0.0..=MAX_JITTER);
        self.delay_with_jitter(attempt, fraction)
    }
}

/// Circuit breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Stops automatic retries after repeated failure and allows one trial
/// once the reset timeout has passed.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    opened_at: Option<Instant>,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(reset_timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            opened_at: None,
            reset_timeout,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    /// Gate a connection attempt.
    ///
    /// An open breaker admits the attempt as a half-open trial when the reset
    /// timeout has elapsed or `force` is set; otherwise returns the time left.
    pub fn admit(&mut self, now: Instant, force: bool) -> Result<(), Duration> {
        if self.state != CircuitState::Open {
            return Ok(());
        }
        let elapsed = self
            .opened_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(self.reset_timeout);
        if force || elapsed >= self.reset_timeout {
            log::info!("Circuit breaker half-open, allowing trial connection");
            self.state = CircuitState::HalfOpen;
            Ok(())
        } else {
            Err(self.reset_timeout - elapsed)
        }
    }

    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            log::info!("Circuit breaker closed");
        }
        self.state = CircuitState::Closed;
        self.opened_at = None;
    }

    pub fn trip(&mut self, now: Instant) {
        log::warn!("Circuit breaker opened");
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
    }

    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
    }
}
