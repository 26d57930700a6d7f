//! Circuit breaker guarding the remote scorer.
//!
//! ```text
//!            N consecutive failures / slow window
//!   CLOSED ─────────────────────────────────────────▶ OPEN
//!     ▲                                               │  ▲
//!     │ probe succeeds            cool-down elapsed   │  │ probe fails
//!     │                                               ▼  │
//!     └────────────────────────────────────────── HALF_OPEN
//! ```
//!
//! In `HalfOpen` exactly one probe call is admitted at a time; every other
//! caller is routed to the local scorer until the probe reports back.
//! Each transition is logged and broadcast to subscribers.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::metrics::MetricsCollector;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Remote calls flow normally.
    Closed,
    /// Remote calls are rejected until the cool-down elapses.
    Open,
    /// A single probe call decides whether to close or re-open.
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding used for the state gauge.
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Why a transition happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransitionReason {
    ConsecutiveFailures { count: u32 },
    SlowProcessing { secs_per_record: f64 },
    CooldownElapsed,
    ProbeSucceeded,
    ProbeFailed,
    Reset,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionReason::ConsecutiveFailures { count } => {
                write!(f, "{} consecutive remote failures", count)
            }
            TransitionReason::SlowProcessing { secs_per_record } => {
                write!(f, "remote latency {:.2}s per record", secs_per_record)
            }
            TransitionReason::CooldownElapsed => write!(f, "cool-down elapsed"),
            TransitionReason::ProbeSucceeded => write!(f, "probe call succeeded"),
            TransitionReason::ProbeFailed => write!(f, "probe call failed"),
            TransitionReason::Reset => write!(f, "manual reset"),
        }
    }
}

/// A state change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: TransitionReason,
    pub at: DateTime<Utc>,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// A call starting further than this after the previous failure restarts
    /// the count.
    pub failure_window: Duration,
    /// How long the circuit stays open after the last failure.
    pub cooldown: Duration,
    /// Average remote latency per record above which the circuit opens.
    pub slow_threshold: Duration,
    /// Number of recent successful calls averaged for the latency check.
    pub latency_window: usize,
    /// Samples required before the latency check applies.
    pub min_latency_samples: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(300),
            slow_threshold: Duration::from_secs(5),
            latency_window: 10,
            min_latency_samples: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Sets the failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the cool-down duration.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Sets the slow-processing threshold.
    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    /// Sets the failure window.
    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub probe_in_flight: bool,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
    /// (elapsed, records) for recent successful calls.
    latencies: VecDeque<(Duration, usize)>,
    total_failures: u64,
    total_successes: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            probe_in_flight: false,
            latencies: VecDeque::new(),
            total_failures: 0,
            total_successes: 0,
        }
    }

    fn secs_per_record(&self) -> f64 {
        let (elapsed, records) = self
            .latencies
            .iter()
            .fold((0.0, 0usize), |(secs, n), (d, r)| (secs + d.as_secs_f64(), n + r));
        if records == 0 {
            0.0
        } else {
            elapsed / records as f64
        }
    }
}

/// Process-wide health tracker for the remote scorer.
///
/// Construct one per scorer and share it through an `Arc`; all methods take
/// `&self` and synchronize internally.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    transitions: broadcast::Sender<CircuitTransition>,
    metrics: MetricsCollector,
}

impl CircuitBreaker {
    /// Creates a closed circuit breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let (transitions, _) = broadcast::channel(64);
        Self {
            config,
            inner: Mutex::new(BreakerInner::new()),
            transitions,
            metrics: MetricsCollector::new(),
        }
    }

    /// Returns the breaker configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Subscribes to state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitTransition> {
        self.transitions.subscribe()
    }

    /// Current state, applying a pending cool-down transition first.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Whether the next call may go to the remote scorer.
    ///
    /// In `HalfOpen` this grants a single probe; callers that receive `true`
    /// must report the outcome through [`record_success`](Self::record_success)
    /// or [`record_failure`](Self::record_failure).
    pub fn allow_remote(&self) -> bool {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    debug!("Admitting half-open probe call");
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Records a successful remote call covering `records` records.
    pub fn record_success(&self, elapsed: Duration, records: usize) {
        let mut inner = self.inner.lock();
        inner.total_successes += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.consecutive_failures = 0;
                inner.latencies.clear();
                self.transition(
                    &mut inner,
                    CircuitState::Closed,
                    TransitionReason::ProbeSucceeded,
                );
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.latencies.push_back((elapsed, records));
                while inner.latencies.len() > self.config.latency_window {
                    inner.latencies.pop_front();
                }

                if inner.latencies.len() >= self.config.min_latency_samples {
                    let secs_per_record = inner.secs_per_record();
                    if secs_per_record > self.config.slow_threshold.as_secs_f64() {
                        inner.last_failure = Some(Instant::now());
                        inner.latencies.clear();
                        self.transition(
                            &mut inner,
                            CircuitState::Open,
                            TransitionReason::SlowProcessing { secs_per_record },
                        );
                    }
                }
            }
            // a call admitted before the circuit opened; it changes nothing
            CircuitState::Open => {}
        }
    }

    /// Records a failed remote call that ends now.
    pub fn record_failure(&self) {
        self.record_failure_since(Instant::now());
    }

    /// Records a failed remote call that started at `call_started`.
    ///
    /// The failure window is measured from the previous failure to the start
    /// of this call, so slow calls cannot push consecutive failures apart.
    pub fn record_failure_since(&self, call_started: Instant) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.total_failures += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.last_failure = Some(now);
                self.transition(&mut inner, CircuitState::Open, TransitionReason::ProbeFailed);
            }
            CircuitState::Closed => {
                let within_window = inner
                    .last_failure
                    .map(|last| {
                        call_started.saturating_duration_since(last) <= self.config.failure_window
                    })
                    .unwrap_or(false);
                inner.consecutive_failures = if within_window {
                    inner.consecutive_failures + 1
                } else {
                    1
                };
                inner.last_failure = Some(now);

                if inner.consecutive_failures >= self.config.failure_threshold {
                    let count = inner.consecutive_failures;
                    self.transition(
                        &mut inner,
                        CircuitState::Open,
                        TransitionReason::ConsecutiveFailures { count },
                    );
                }
            }
            CircuitState::Open => {
                inner.last_failure = Some(now);
            }
        }
    }

    /// Returns current counters.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        CircuitBreakerMetrics {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            probe_in_flight: inner.probe_in_flight,
        }
    }

    /// Forces the breaker back to `Closed` and clears its history.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.last_failure = None;
        inner.probe_in_flight = false;
        inner.latencies.clear();
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed, TransitionReason::Reset);
        }
    }

    /// Moves `Open` to `HalfOpen` once the cool-down has elapsed.
    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let cooled = inner
            .last_failure
            .map(|last| last.elapsed() >= self.config.cooldown)
            .unwrap_or(true);
        if cooled {
            inner.probe_in_flight = false;
            self.transition(inner, CircuitState::HalfOpen, TransitionReason::CooldownElapsed);
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, reason: TransitionReason) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;

        match to {
            CircuitState::Open => warn!(from = %from, to = %to, reason = %reason, "Circuit breaker opened"),
            _ => info!(from = %from, to = %to, reason = %reason, "Circuit breaker state changed"),
        }
        self.metrics.record_circuit_state(to);

        // no subscribers is fine
        let _ = self.transitions.send(CircuitTransition {
            from,
            to,
            reason,
            at: Utc::now(),
        });
    }
}
