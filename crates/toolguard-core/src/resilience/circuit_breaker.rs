//! Closed / Open / HalfOpen circuit breaker per (agent, tool).

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::domain::CircuitBreakerConfig;
use crate::metrics::METRICS;
use crate::obs;

use super::store::{CallKey, KeyedStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// How an admitted call ended, from the breaker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
    /// Admitted but never reached the tool body (e.g. a guard rejected it).
    Released,
}

/// Ticket for one admitted call, handed back to
/// [`CircuitBreaker::after_call`].
///
/// The generation changes on every state transition and every half-open
/// trial, so an outcome reported against an older generation is stale and
/// ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Admission {
    generation: u64,
}

impl Admission {
    pub const fn new(generation: u64) -> Self {
        Self { generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// The breaker refused a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitRejection {
    /// Remaining cooldown; `None` while a half-open trial is in flight.
    pub retry_after: Option<Duration>,
}

#[async_trait]
pub trait CircuitBreaker: Send + Sync {
    /// Admit or reject a call. Every admission should be settled with
    /// exactly one [`CircuitBreaker::after_call`].
    async fn before_call(
        &self,
        key: &CallKey,
        config: &CircuitBreakerConfig,
    ) -> Result<Admission, CircuitRejection>;

    async fn after_call(
        &self,
        key: &CallKey,
        config: &CircuitBreakerConfig,
        admission: Admission,
        outcome: CallOutcome,
    );

    async fn state(&self, key: &CallKey) -> CircuitState;
}

#[derive(Debug, Default)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Start of the half-open trial currently in flight.
    trial_started_at: Option<Instant>,
    generation: u64,
}

impl Breaker {
    fn admission(&self) -> Admission {
        Admission::new(self.generation)
    }

    fn enter(&mut self, state: CircuitState, now: Instant) {
        self.state = state;
        self.generation = self.generation.wrapping_add(1);
        self.trial_started_at = None;
        match state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                self.opened_at = None;
            }
            CircuitState::Open => self.opened_at = Some(now),
            CircuitState::HalfOpen => {}
        }
    }

    fn grant_trial(&mut self, now: Instant) -> Admission {
        self.generation = self.generation.wrapping_add(1);
        self.trial_started_at = Some(now);
        self.admission()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCircuitBreaker {
    breakers: KeyedStore<Breaker>,
}

impl InMemoryCircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consecutive_failures(&self, key: &CallKey) -> u32 {
        self.breakers
            .peek(key, |b| b.consecutive_failures)
            .unwrap_or(0)
    }

    /// Forget the breaker for `key`; it comes back closed.
    pub fn evict(&self, key: &CallKey) -> bool {
        self.breakers.evict(key)
    }
}

fn record_transition(key: &CallKey, from: CircuitState, to: CircuitState) {
    if from == to {
        return;
    }
    if to == CircuitState::Open {
        METRICS.inc_breaker_trips();
    }
    obs::emit_breaker_transition(key, from, to);
}

#[async_trait]
impl CircuitBreaker for InMemoryCircuitBreaker {
    async fn before_call(
        &self,
        key: &CallKey,
        config: &CircuitBreakerConfig,
    ) -> Result<Admission, CircuitRejection> {
        let now = Instant::now();
        let cooldown = Duration::from_secs(config.cooldown_seconds);

        let ((from, to), verdict) = self.breakers.with(key, Breaker::default, |b| {
            let from = b.state;
            let verdict = match b.state {
                CircuitState::Closed => Ok(b.admission()),
                CircuitState::Open => {
                    let elapsed = now.saturating_duration_since(b.opened_at.unwrap_or(now));
                    if elapsed < cooldown {
                        Err(CircuitRejection {
                            retry_after: Some(cooldown - elapsed),
                        })
                    } else {
                        b.enter(CircuitState::HalfOpen, now);
                        Ok(b.grant_trial(now))
                    }
                }
                CircuitState::HalfOpen => match b.trial_started_at {
                    // A trial that never reported back within a cooldown is
                    // treated as lost; its late outcome becomes stale.
                    Some(started) if now.saturating_duration_since(started) < cooldown => {
                        Err(CircuitRejection { retry_after: None })
                    }
                    _ => Ok(b.grant_trial(now)),
                },
            };
            ((from, b.state), verdict)
        });

        record_transition(key, from, to);
        verdict
    }

    async fn after_call(
        &self,
        key: &CallKey,
        config: &CircuitBreakerConfig,
        admission: Admission,
        outcome: CallOutcome,
    ) {
        let now = Instant::now();
        let threshold = config.failure_threshold.max(1);

        let (from, to) = self.breakers.with(key, Breaker::default, |b| {
            let from = b.state;
            if admission.generation != b.generation {
                return (from, from);
            }
            match (b.state, outcome) {
                (CircuitState::Open, _) | (CircuitState::Closed, CallOutcome::Released) => {}
                (CircuitState::HalfOpen, CallOutcome::Released) => b.trial_started_at = None,
                (CircuitState::Closed, CallOutcome::Success) => b.consecutive_failures = 0,
                (CircuitState::HalfOpen, CallOutcome::Success) => b.enter(CircuitState::Closed, now),
                (CircuitState::HalfOpen, CallOutcome::Failure) => {
                    b.consecutive_failures = b.consecutive_failures.saturating_add(1);
                    b.enter(CircuitState::Open, now);
                }
                (CircuitState::Closed, CallOutcome::Failure) => {
                    b.consecutive_failures = b.consecutive_failures.saturating_add(1);
                    if b.consecutive_failures >= threshold {
                        b.enter(CircuitState::Open, now);
                    }
                }
            }
            (from, b.state)
        });

        record_transition(key, from, to);
    }

    async fn state(&self, key: &CallKey) -> CircuitState {
        self.breakers.peek(key, |b| b.state).unwrap_or_default()
    }
}
