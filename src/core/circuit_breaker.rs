//! Per-route circuit breaking and call timeouts.
//!
//! # States
//! - Closed: calls pass through; consecutive failures are counted
//! - Open: calls are rejected without reaching the transport
//! - Half-Open: the break has elapsed and exactly one trial call is admitted
//!
//! ```text
//! Closed -> Open:      consecutive failures reach the threshold
//! Open -> Half-Open:   break duration elapsed, on the next admission attempt
//! Half-Open -> Closed: trial call succeeds
//! Half-Open -> Open:   trial call fails (break timer restarts)
//! ```
//!
//! Only transport faults count as failures: a downstream answer is a success
//! whatever its status code. A timeout is a failure; a call abandoned by its
//! caller records nothing and, if it was the half-open trial, frees the slot.
use std::{
    collections::HashMap as StdHashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use hyper::{Request, Response};
use scc::{HashMap, hash_map::Entry};
use tokio::time::Instant;

use crate::{
    config::QosOptions,
    metrics::record_circuit_state_change,
    ports::{
        http_client::{Body, HttpClientError, HttpClientResult},
        interceptor::{Interceptor, Next},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Breaker guarding one route.
#[derive(Debug)]
pub struct CircuitBreaker {
    route: String,
    threshold: u32,
    break_duration: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(route: impl Into<String>, threshold: u32, break_duration: Duration) -> Self {
        Self {
            route: route.into(),
            threshold: threshold.max(1),
            break_duration,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn break_duration(&self) -> Duration {
        self.break_duration
    }

    fn has_settings(&self, threshold: u32, break_duration: Duration) -> bool {
        self.threshold == threshold.max(1) && self.break_duration == break_duration
    }

    /// Current state as last recorded. An open breaker whose break has
    /// elapsed still reports `Open` until the next admission attempt.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Ask to send one call. `None` means the circuit rejects it.
    pub fn try_acquire(self: &Arc<Self>) -> Option<CallPermit> {
        let (trial, transition) = {
            let mut inner = self.lock();
            match inner.state {
                CircuitState::Closed => (false, None),
                CircuitState::Open => {
                    let elapsed = inner
                        .opened_at
                        .is_none_or(|opened_at| opened_at.elapsed() >= self.break_duration);
                    if !elapsed {
                        return None;
                    }
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    (true, Some(CircuitState::HalfOpen))
                }
                CircuitState::HalfOpen => {
                    if inner.trial_in_flight {
                        return None;
                    }
                    inner.trial_in_flight = true;
                    (true, None)
                }
            }
        };
        self.report(transition);

        Some(CallPermit {
            breaker: self.clone(),
            trial,
            settled: false,
        })
    }

    fn on_success(&self, trial: bool) {
        let transition = {
            let mut inner = self.lock();
            if trial {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
                Some(CircuitState::Closed)
            } else {
                if inner.state == CircuitState::Closed {
                    inner.consecutive_failures = 0;
                }
                None
            }
        };
        self.report(transition);
    }

    fn on_failure(&self, trial: bool) {
        let transition = {
            let mut inner = self.lock();
            if trial {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
                Some(CircuitState::Open)
            } else if inner.state == CircuitState::Closed {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    Some(CircuitState::Open)
                } else {
                    None
                }
            } else {
                // a call admitted before the circuit opened; the break is already running
                None
            }
        };
        self.report(transition);
    }

    fn on_abandon(&self, trial: bool) {
        if trial {
            self.lock().trial_in_flight = false;
        }
    }

    fn report(&self, transition: Option<CircuitState>) {
        let Some(state) = transition else {
            return;
        };
        match state {
            CircuitState::Open => tracing::warn!(
                route = %self.route,
                break_ms = self.break_duration.as_millis() as u64,
                "Circuit opened"
            ),
            _ => tracing::info!(
                route = %self.route,
                state = state.as_str(),
                "Circuit state changed"
            ),
        }
        record_circuit_state_change(&self.route, state.as_str());
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission to send one call through a breaker.
///
/// Settle it with [`CallPermit::success`] or [`CallPermit::failure`]; dropping
/// it unsettled counts as an abandoned call.
#[derive(Debug)]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    settled: bool,
}

impl CallPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandon(self.trial);
        }
    }
}

/// One breaker per route key, created on first use.
pub struct CircuitBreakerRegistry {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: HashMap::new(),
        }
    }

    /// The route's breaker. A breaker built with other settings is replaced
    /// by a fresh, closed one.
    pub async fn get_or_create(
        &self,
        route: &str,
        threshold: u32,
        break_duration: Duration,
    ) -> Arc<CircuitBreaker> {
        match self.breakers.entry_async(route.to_string()).await {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().has_settings(threshold, break_duration) {
                    tracing::debug!(
                        route,
                        threshold,
                        break_ms = break_duration.as_millis() as u64,
                        "Circuit breaker settings changed, recreating breaker"
                    );
                    *occupied.get_mut() =
                        Arc::new(CircuitBreaker::new(route, threshold, break_duration));
                }
                occupied.get().clone()
            }
            Entry::Vacant(vacant) => {
                let breaker = Arc::new(CircuitBreaker::new(route, threshold, break_duration));
                vacant.insert_entry(breaker.clone());
                breaker
            }
        }
    }

    pub async fn get(&self, route: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read_async(route, |_, breaker| breaker.clone())
            .await
    }

    pub async fn remove(&self, route: &str) -> bool {
        self.breakers.remove_async(route).await.is_some()
    }

    /// Current state of every breaker, keyed by route.
    pub async fn states(&self) -> StdHashMap<String, CircuitState> {
        let mut states = StdHashMap::new();
        // visits every entry and keeps all of them
        self.breakers
            .retain_async(|route, breaker| {
                states.insert(route.clone(), breaker.state());
                true
            })
            .await;
        states
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

/// Innermost interceptor applying a route's QoS options: circuit breaking
/// and the per-call timeout.
pub struct QosInterceptor {
    route: String,
    timeout: Option<Duration>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl QosInterceptor {
    pub const NAME: &'static str = "qos";

    pub async fn for_route(
        route: &str,
        options: &QosOptions,
        registry: &CircuitBreakerRegistry,
    ) -> Self {
        let breaker = if options.use_circuit_breaker() {
            Some(
                registry
                    .get_or_create(
                        route,
                        options.exceptions_allowed_before_breaking,
                        options.break_duration(),
                    )
                    .await,
            )
        } else {
            None
        };
        Self {
            route: route.to_string(),
            timeout: options.timeout(),
            breaker,
        }
    }

    pub fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    async fn call(&self, req: Request<Body>, next: Next<'_>) -> HttpClientResult<Response<Body>> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, next.run(req))
                .await
                .unwrap_or(Err(HttpClientError::Timeout(limit))),
            None => next.run(req).await,
        }
    }
}

#[async_trait]
impl Interceptor for QosInterceptor {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn intercept(
        &self,
        req: Request<Body>,
        next: Next<'_>,
    ) -> HttpClientResult<Response<Body>> {
        let permit = match &self.breaker {
            Some(breaker) => match breaker.try_acquire() {
                Some(permit) => Some(permit),
                None => {
                    tracing::debug!(route = %self.route, "Circuit open, rejecting call");
                    return Err(HttpClientError::CircuitOpen {
                        route: self.route.clone(),
                    });
                }
            },
            None => None,
        };

        let result = self.call(req, next).await;

        if let Some(permit) = permit {
            match &result {
                Ok(_) => permit.success(),
                Err(e) if e.is_canceled() => drop(permit),
                Err(e) => {
                    tracing::debug!(
                        route = %self.route,
                        error = %e,
                        "Call failed under circuit breaker"
                    );
                    permit.failure();
                }
            }
        }
        result
    }
}
