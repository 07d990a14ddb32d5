//! Circuit breakers for failing destinations.
//!
//! One breaker exists per (provider, destination) pair. Consecutive terminal
//! failures inside a rolling window open the circuit; after a cool-down a
//! single trial is let through. A successful trial closes the circuit, a
//! failed one reopens it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Key for circuit breaker isolation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestinationKey {
    /// Provider name of the delivery adapter.
    pub provider: String,
    /// Destination (channel) id.
    pub destination: String,
}

impl DestinationKey {
    pub fn new(provider: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            destination: destination.into(),
        }
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.destination)
    }
}

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing, rejecting requests.
    Open,
    /// Cool-down elapsed, one trial request allowed.
    HalfOpen,
}

/// Breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Consecutive terminal failures that open the circuit.
    pub failure_threshold: u32,
    /// The threshold must be reached by failures no older than this.
    pub window: Duration,
    /// How long the circuit stays open.
    pub cooldown: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// Timestamps of the current run of failures, oldest first.
    recent_failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

/// Decision returned by [`CircuitBreaker::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The call may proceed.
    Allowed,
    /// The circuit is open; retry after the given duration.
    Rejected { retry_after: Duration },
}

/// Circuit breaker for a single destination.
///
/// All transitions happen under one mutex, so every outcome is a single
/// atomic mutation.
#[derive(Debug)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                recent_failures: VecDeque::new(),
                opened_at: None,
                last_failure_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Current state, accounting for an elapsed cool-down.
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open if self.cooldown_elapsed(&inner) => CircuitState::HalfOpen,
            state => state,
        }
    }

    /// Ask to make a call through this breaker.
    ///
    /// In the half-open state only one trial is admitted until its outcome
    /// is recorded.
    pub fn try_acquire(&self) -> Admission {
        match self.admit() {
            Ok(_) => Admission::Allowed,
            Err(retry_after) => Admission::Rejected { retry_after },
        }
    }

    /// Like [`CircuitBreaker::try_acquire`], returning a permit that gives
    /// back a half-open trial slot when dropped without an outcome.
    pub fn acquire(self: &Arc<Self>) -> std::result::Result<BreakerPermit, Duration> {
        let trial = self.admit()?;
        Ok(BreakerPermit {
            breaker: Arc::clone(self),
            trial,
            settled: false,
        })
    }

    /// Admit a call. `Ok(true)` means the call is the half-open trial.
    fn admit(&self) -> std::result::Result<bool, Duration> {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open && self.cooldown_elapsed(&inner) {
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
            debug!("Circuit breaker transitioned to half-open state");
        }

        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Ok(true)
            }
            CircuitState::HalfOpen => Err(self.settings.cooldown),
            CircuitState::Open => Err(self.remaining_cooldown(&inner)),
        }
    }

    /// Release a half-open trial slot without recording an outcome.
    pub fn release(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    /// Record a successful delivery.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!("Circuit breaker closed after successful delivery");
        }
        Self::close(&mut inner);
    }

    /// Record a terminal delivery failure.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                let window = self.settings.window;
                inner.recent_failures.push_back(now);
                while inner
                    .recent_failures
                    .front()
                    .is_some_and(|first| now.duration_since(*first) > window)
                {
                    inner.recent_failures.pop_front();
                }
                let threshold = self.settings.failure_threshold.max(1) as usize;
                while inner.recent_failures.len() > threshold {
                    inner.recent_failures.pop_front();
                }

                if inner.recent_failures.len() >= threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    warn!(
                        "Circuit breaker opened after {} consecutive failures within {:?}",
                        threshold, window
                    );
                }
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                // Any failure while open or probing restarts the cool-down.
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.trial_in_flight = false;
                warn!("Circuit breaker reopened after failed trial");
            }
        }
    }

    /// Force the breaker back to closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        Self::close(&mut inner);
        debug!("Circuit breaker reset to closed state");
    }

    /// Consecutive failures still inside the window.
    pub fn failures(&self) -> u32 {
        Self::failure_count(&self.inner.lock())
    }

    fn failure_count(inner: &BreakerState) -> u32 {
        u32::try_from(inner.recent_failures.len()).unwrap_or(u32::MAX)
    }

    fn snapshot(&self, key: &DestinationKey) -> BreakerSnapshot {
        let state = self.state();
        let inner = self.inner.lock();
        BreakerSnapshot {
            destination: key.to_string(),
            state,
            consecutive_failures: Self::failure_count(&inner),
            last_failure_at: inner.last_failure_at,
        }
    }

    fn close(inner: &mut BreakerState) {
        inner.state = CircuitState::Closed;
        inner.recent_failures.clear();
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    fn cooldown_elapsed(&self, inner: &BreakerState) -> bool {
        inner
            .opened_at
            .is_some_and(|opened| opened.elapsed() >= self.settings.cooldown)
    }

    fn remaining_cooldown(&self, inner: &BreakerState) -> Duration {
        inner
            .opened_at
            .map(|opened| self.settings.cooldown.saturating_sub(opened.elapsed()))
            .unwrap_or(self.settings.cooldown)
    }
}

/// Admission to call through a [`CircuitBreaker`].
///
/// Dropping the permit without [`BreakerPermit::success`] or
/// [`BreakerPermit::failure`] records nothing, and frees the half-open trial
/// slot if this permit held it.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    settled: bool,
}

impl BreakerPermit {
    /// Whether this permit is the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.release();
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub destination: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Manager for circuit breakers per destination key.
pub struct CircuitBreakerManager {
    breakers: DashMap<DestinationKey, Arc<CircuitBreaker>>,
    settings: BreakerSettings,
}

impl CircuitBreakerManager {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            breakers: DashMap::new(),
            settings,
        }
    }

    /// Get or create the breaker for `key`.
    pub fn get(&self, key: &DestinationKey) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(key) {
            return breaker.clone();
        }
        self.breakers
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.settings)))
            .clone()
    }

    /// Current state for `key`; unknown keys are closed.
    pub fn state(&self, key: &DestinationKey) -> CircuitState {
        self.breakers
            .get(key)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Reset every breaker belonging to `provider`.
    pub fn reset_provider(&self, provider: &str) {
        for entry in self.breakers.iter() {
            if entry.key().provider == provider {
                entry.value().reset();
            }
        }
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|e| e.value().snapshot(e.key()))
            .collect();
        snapshots.sort_by(|a, b| a.destination.cmp(&b.destination));
        snapshots
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}
