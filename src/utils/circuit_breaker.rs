use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::clock::Clock;

// ============================================================================
// Circuit Breaker Pattern Implementation
// ============================================================================
//
// Prevents cascading failures by tracking errors per route and temporarily
// blocking calls when a destination keeps failing.
//
// States:
// - Closed: Normal operation, calls pass through, consecutive failures counted
// - Open: Threshold reached, calls rejected until the cool-down elapses
// - HalfOpen: Cool-down elapsed, exactly one probe call admitted
//
// Breakers are keyed by (source, destination, operation), created lazily by
// the manager and never removed.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,     // Normal operation
    Open,       // Blocking calls
    HalfOpen,   // Testing recovery
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time to wait in Open before admitting a probe
    pub cool_down: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteKey {
    pub source: String,
    pub destination: String,
    pub operation: String,
}

impl RouteKey {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            operation: operation.into(),
        }
    }
}

impl std::fmt::Display for RouteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}:{}", self.source, self.destination, self.operation)
    }
}

#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// Rejected without running the operation
    CircuitOpen { route: String },
    OperationFailed(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, CircuitBreakerError::CircuitOpen { .. })
    }
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::CircuitOpen { route } => {
                write!(f, "Circuit breaker is open for {}", route)
            }
            CircuitBreakerError::OperationFailed(e) => write!(f, "Operation failed: {}", e),
        }
    }
}

impl<E: std::error::Error> std::error::Error for CircuitBreakerError<E> {}

struct CircuitBreakerState {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<DateTime<Utc>>,
    last_transition: DateTime<Utc>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    route: RouteKey,
    state: Mutex<CircuitBreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

/// Clears the half-open probe slot if the probe future is dropped unresolved.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(route: RouteKey, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            route,
            state: Mutex::new(CircuitBreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                last_transition: now,
                probe_in_flight: false,
            }),
            config,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitBreakerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn route(&self) -> &RouteKey {
        &self.route
    }

    /// Execute an operation with circuit breaker protection.
    ///
    /// While the circuit is open the closure is never called.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let is_probe = self.admit()?;
        let mut guard = ProbeGuard {
            breaker: self,
            armed: is_probe,
        };

        let outcome = operation().await;
        guard.armed = false;

        match outcome {
            Ok(result) => {
                self.record_success();
                Ok(result)
            }
            Err(err) => {
                self.record_failure();
                Err(CircuitBreakerError::OperationFailed(err))
            }
        }
    }

    /// Returns whether the admitted call is the half-open probe.
    fn admit<E>(&self) -> Result<bool, CircuitBreakerError<E>> {
        let now = self.clock.now();
        let mut state = self.lock();

        match state.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let opened_at = state.opened_at.unwrap_or(state.last_transition);
                let cool_down = chrono::Duration::from_std(self.config.cool_down)
                    .unwrap_or(chrono::Duration::MAX);
                if now - opened_at >= cool_down {
                    tracing::info!(route = %self.route, "Circuit breaker transitioning to HalfOpen");
                    state.state = CircuitState::HalfOpen;
                    state.last_transition = now;
                    state.probe_in_flight = true;
                    Ok(true)
                } else {
                    Err(CircuitBreakerError::CircuitOpen {
                        route: self.route.to_string(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    Err(CircuitBreakerError::CircuitOpen {
                        route: self.route.to_string(),
                    })
                } else {
                    state.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn record_success(&self) {
        let now = self.clock.now();
        let mut state = self.lock();
        state.probe_in_flight = false;

        match state.state {
            CircuitState::HalfOpen => {
                tracing::info!(route = %self.route, "Circuit breaker closing after successful probe");
                state.state = CircuitState::Closed;
                state.failure_count = 0;
                state.opened_at = None;
                state.last_transition = now;
            }
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::Open => {
                // a call admitted before another caller tripped the circuit
                tracing::debug!(route = %self.route, "Success recorded while circuit is open");
            }
        }
    }

    fn record_failure(&self) {
        let now = self.clock.now();
        let mut state = self.lock();
        state.probe_in_flight = false;
        state.failure_count = state.failure_count.saturating_add(1);

        match state.state {
            CircuitState::Closed => {
                if state.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        route = %self.route,
                        failures = state.failure_count,
                        "Circuit breaker opening"
                    );
                    state.state = CircuitState::Open;
                    state.opened_at = Some(now);
                    state.last_transition = now;
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(route = %self.route, "Probe failed during half-open, reopening circuit");
                state.state = CircuitState::Open;
                state.opened_at = Some(now);
                state.last_transition = now;
            }
            CircuitState::Open => {
                // Already open, just count
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.lock();
        CircuitSnapshot {
            route: self.route.clone(),
            state: state.state,
            failure_count: state.failure_count,
            last_transition: state.last_transition,
        }
    }

    /// Manually reset the circuit breaker
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut state = self.lock();
        tracing::info!(route = %self.route, "Circuit breaker manually reset");
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.opened_at = None;
        state.last_transition = now;
        state.probe_in_flight = false;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub route: RouteKey,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_transition: DateTime<Utc>,
}

// ============================================================================
// Circuit Breaker Manager
// ============================================================================

/// Lazily creates and caches one breaker per route.
pub struct CircuitBreakerManager {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: DashMap<RouteKey, Arc<CircuitBreaker>>,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            breakers: DashMap::new(),
        }
    }

    pub fn get_circuit_breaker(
        &self,
        source: &str,
        destination: &str,
        operation: &str,
    ) -> Arc<CircuitBreaker> {
        let key = RouteKey::new(source, destination, operation);
        if let Some(existing) = self.breakers.get(&key) {
            return existing.clone();
        }

        self.breakers
            .entry(key.clone())
            .or_insert_with(|| {
                tracing::debug!(route = %key, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(
                    key.clone(),
                    self.config.clone(),
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    pub fn states(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<CircuitSnapshot> =
            self.breakers.iter().map(|entry| entry.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.route.to_string().cmp(&b.route.to_string()));
        snapshots
    }

    /// Circuits currently not closed
    pub fn open_circuits(&self) -> usize {
        self.breakers
            .iter()
            .filter(|entry| entry.value().state() != CircuitState::Closed)
            .count()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn manager(threshold: u32, cool_down: Duration) -> (Arc<ManualClock>, CircuitBreakerManager) {
        let clock = Arc::new(ManualClock::default());
        let config = CircuitBreakerConfig {
            failure_threshold: threshold,
            cool_down,
        };
        (clock.clone(), CircuitBreakerManager::new(config, clock))
    }

    #[tokio::test]
    async fn test_sixth_call_fails_fast_without_invoking_operation() {
        let (_clock, manager) = manager(5, Duration::from_secs(30));
        let breaker = manager.get_circuit_breaker("campaign", "content", "entity_created");
        let invocations = AtomicU32::new(0);
        let counter = &invocations;

        for _ in 0..5 {
            let result = breaker
                .call(move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("connection refused")
                })
                .await;
            assert!(matches!(result, Err(CircuitBreakerError::OperationFailed(_))));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        for _ in 0..3 {
            let result = breaker
                .call(move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("connection refused")
                })
                .await;
            assert!(result.as_ref().unwrap_err().is_circuit_open());
        }

        assert_eq!(invocations.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let (_clock, manager) = manager(3, Duration::from_secs(30));
        let breaker = manager.get_circuit_breaker("a", "b", "query");

        for _ in 0..2 {
            let _ = breaker.call(|| async { Err::<(), _>("boom") }).await;
        }
        assert_eq!(breaker.failure_count(), 2);

        breaker.call(|| async { Ok::<_, &str>(()) }).await.unwrap();
        assert_eq!(breaker.failure_count(), 0);

        for _ in 0..2 {
            let _ = breaker.call(|| async { Err::<(), _>("boom") }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_trial_closes_circuit() {
        let (clock, manager) = manager(2, Duration::from_secs(10));
        let breaker = manager.get_circuit_breaker("a", "b", "query");

        for _ in 0..2 {
            let _ = breaker.call(|| async { Err::<(), _>("boom") }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(chrono::Duration::seconds(5));
        let early = breaker.call(|| async { Ok::<_, &str>(()) }).await;
        assert!(early.unwrap_err().is_circuit_open());

        clock.advance(chrono::Duration::seconds(5));
        breaker.call(|| async { Ok::<_, &str>(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_half_open_trial_failure_reopens() {
        let (clock, manager) = manager(1, Duration::from_secs(10));
        let breaker = manager.get_circuit_breaker("a", "b", "query");

        let _ = breaker.call(|| async { Err::<(), _>("boom") }).await;
        clock.advance(chrono::Duration::seconds(11));

        let probe = breaker.call(|| async { Err::<(), _>("still down") }).await;
        assert!(matches!(probe, Err(CircuitBreakerError::OperationFailed(_))));
        assert_eq!(breaker.state(), CircuitState::Open);

        let next = breaker.call(|| async { Ok::<_, &str>(()) }).await;
        assert!(next.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn test_half_open_admits_single_trial() {
        let (clock, manager) = manager(1, Duration::from_secs(1));
        let breaker = manager.get_circuit_breaker("a", "b", "query");
        let _ = breaker.call(|| async { Err::<(), _>("boom") }).await;
        clock.advance(chrono::Duration::seconds(2));

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe_breaker = breaker.clone();
        let probe = tokio::spawn(async move {
            probe_breaker
                .call(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, &str>(())
                })
                .await
        });

        // let the probe claim the slot
        while breaker.state() != CircuitState::HalfOpen {
            tokio::task::yield_now().await;
        }
        let concurrent = breaker.call(|| async { Ok::<_, &str>(()) }).await;
        assert!(concurrent.unwrap_err().is_circuit_open());

        release_tx.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_manager_caches_per_route() {
        let (_clock, manager) = manager(5, Duration::from_secs(30));
        let first = manager.get_circuit_breaker("a", "b", "query");
        let again = manager.get_circuit_breaker("a", "b", "query");
        let other = manager.get_circuit_breaker("a", "b", "notification");

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.open_circuits(), 0);
    }
}
