//! Retry policy and circuit breaker
//!
//! Operations run through an explicit attempt loop with exponential
//! backoff and jitter. A circuit breaker keyed by (host, handler kind)
//! short-circuits endpoints that keep failing so a dead service does not
//! consume the whole retry budget of every source that touches it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RetrySettings;
use crate::transport::TransportError;

/// Key identifying one logical endpoint in the breaker table
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BreakerKey {
    pub host: String,
    pub handler: &'static str,
}

impl BreakerKey {
    pub fn new(host: impl Into<String>, handler: &'static str) -> Self {
        Self {
            host: host.into(),
            handler,
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_until: Option<Instant>,
}

/// Circuit breaker table shared across all workers
///
/// Trips after `threshold` consecutive classified failures and stays open
/// for `cooldown`; a single success closes the breaker again.
pub struct BreakerTable {
    states: Mutex<HashMap<BreakerKey, BreakerState>>,
    threshold: u32,
    cooldown: Duration,
}

impl BreakerTable {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            threshold,
            cooldown,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            settings.circuit_breaker_threshold,
            Duration::from_secs_f64(settings.circuit_breaker_timeout),
        )
    }

    /// True when calls for this key must short-circuit
    pub fn is_open(&self, key: &BreakerKey) -> bool {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        match states.get_mut(key) {
            Some(state) => match state.opened_until {
                Some(until) if Instant::now() < until => true,
                Some(_) => {
                    // Cooldown elapsed; allow a probe attempt through.
                    state.opened_until = None;
                    false
                },
                None => false,
            },
            None => false,
        }
    }

    pub fn record_success(&self, key: &BreakerKey) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = states.get_mut(key) {
            if state.consecutive_failures >= self.threshold {
                info!(host = %key.host, handler = key.handler, "Circuit breaker closed");
            }
            state.consecutive_failures = 0;
            state.opened_until = None;
        }
    }

    pub fn record_failure(&self, key: &BreakerKey) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let state = states.entry(key.clone()).or_default();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold {
            state.opened_until = Some(Instant::now() + self.cooldown);
            warn!(
                host = %key.host,
                handler = key.handler,
                failures = state.consecutive_failures,
                "Circuit breaker open"
            );
        }
    }
}

/// Exponential backoff retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: Duration::from_secs_f64(settings.base_delay),
            backoff_factor: settings.backoff_factor,
            max_delay: Duration::from_secs_f64(settings.max_delay),
        }
    }

    /// Deterministic delay before retrying after `attempt` (1-based),
    /// before jitter is applied
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        let delay = self.base_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        // Multiplicative jitter in [0.5, 1.5) to avoid thundering herds.
        let factor = 0.5 + rand::random::<f64>();
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }

    /// Run `op` with retries, breaker bookkeeping and cancellation.
    ///
    /// `op` receives the 1-based attempt number. A fatal error or an
    /// exhausted attempt budget returns the last error; a server-supplied
    /// Retry-After replaces the computed delay.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        breakers: &BreakerTable,
        key: &BreakerKey,
        op: F,
    ) -> Result<T, TransportError>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut last_error = TransportError::Cancelled;

        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }

            let result = if breakers.is_open(key) {
                Err(TransportError::BreakerOpen {
                    host: key.host.clone(),
                })
            } else {
                let outcome = op(attempt).await;
                match &outcome {
                    Ok(_) => breakers.record_success(key),
                    Err(TransportError::Cancelled) => {},
                    Err(e) if e.is_retriable() => breakers.record_failure(key),
                    Err(_) => {},
                }
                outcome
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                },
                Err(TransportError::Cancelled) => return Err(TransportError::Cancelled),
                Err(e) if !e.is_retriable() => {
                    debug!(error = %e, "Fatal error, not retrying");
                    return Err(e);
                },
                Err(e) => {
                    if attempt == self.max_attempts {
                        warn!(attempt, error = %e, "Retries exhausted");
                        return Err(e);
                    }
                    let delay = e
                        .server_delay()
                        .unwrap_or_else(|| self.jittered(self.delay_for(attempt)));
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    last_error = e;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                        _ = tokio::time::sleep(delay) => {},
                    }
                },
            }
        }

        Err(last_error)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(50),
        }
    }

    fn status_error(status: u16) -> TransportError {
        TransportError::Status {
            url: "http://test/".into(),
            status,
            retry_after: None,
        }
    }

    #[test]
    fn test_delay_growth_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(5),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        // Capped at max_delay.
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
    }

    #[test]
    fn test_sleep_sum_bound() {
        // Worst-case jitter multiplies every delay by 1.5; the geometric
        // sum bound must hold for all attempt counts.
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(3600),
        };
        let n = 5u32;
        let sum: f64 = (1..=n).map(|a| policy.delay_for(a).as_secs_f64() * 1.5).sum();
        let bound = 1.0 * (2.0f64.powi(n as i32) - 1.0) / (2.0 - 1.0) * 1.5;
        assert!(sum <= bound + 1e-9);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let policy = quick_policy(3);
        let breakers = BreakerTable::new(5, Duration::from_secs(60));
        let key = BreakerKey::new("host", "rest_api");
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = policy
            .run(&cancel, &breakers, &key, |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(status_error(503))
                    } else {
                        Ok("data")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "data");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_attempts_on_persistent_503() {
        let policy = quick_policy(3);
        let breakers = BreakerTable::new(10, Duration::from_secs(60));
        let key = BreakerKey::new("host", "rest_api");
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .run(&cancel, &breakers, &key, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(status_error(503)) }
            })
            .await;

        assert!(result.is_err());
        // max_attempts=3 means exactly three attempts: two retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_immediately() {
        let policy = quick_policy(5);
        let breakers = BreakerTable::new(5, Duration::from_secs(60));
        let key = BreakerKey::new("host", "file");
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .run(&cancel, &breakers, &key, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(status_error(404)) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_sleep() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
        };
        let breakers = BreakerTable::new(5, Duration::from_secs(60));
        let key = BreakerKey::new("host", "rest_api");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = Instant::now();
        let result: Result<(), _> = policy
            .run(&cancel, &breakers, &key, |_| async { Err(status_error(503)) })
            .await;

        assert!(matches!(result, Err(TransportError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_breaker_short_circuits_without_calls() {
        let breakers = BreakerTable::new(2, Duration::from_secs(60));
        let key = BreakerKey::new("dead-host", "ogc_api");
        breakers.record_failure(&key);
        breakers.record_failure(&key);
        assert!(breakers.is_open(&key));

        let policy = quick_policy(2);
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .run(&cancel, &breakers, &key, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        // Both attempts short-circuit; the operation never runs.
        assert!(matches!(result, Err(TransportError::BreakerOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_breaker_closes_after_cooldown_success() {
        let breakers = BreakerTable::new(2, Duration::from_millis(5));
        let key = BreakerKey::new("flaky-host", "ogc_api");
        breakers.record_failure(&key);
        breakers.record_failure(&key);
        assert!(breakers.is_open(&key));

        tokio::time::sleep(Duration::from_millis(10)).await;
        // Cooldown elapsed: probe allowed.
        assert!(!breakers.is_open(&key));
        breakers.record_success(&key);
        assert!(!breakers.is_open(&key));
    }
}
