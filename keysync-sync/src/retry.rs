//! Retry engine with configurable backoff and an overall deadline.
//!
//! [`RetryEngine::execute`] runs one fallible remote operation up to
//! `max_attempts` times. Errors rejected by the classifier stop the loop
//! immediately; retriable errors wait for a backoff delay first.
//!
//! Backoff, for 1-based `attempt`:
//! - exponential: `initial * multiplier^(attempt-1)`
//! - linear:      `initial * attempt`
//! - constant:    `initial`
//!
//! always capped at `max_delay`, plus up to 20% additive jitter when enabled.
//!
//! An in-flight attempt is never interrupted. Cancellation and the deadline
//! are observed between attempts and during backoff waits; the operation
//! receives a child token it may poll cooperatively.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use keysync_core::{RetrySettings, RetryStrategyKind};

use crate::error::{RemoteError, RetryError};

/// Largest share of the computed delay that jitter may add, in percent.
const JITTER_PERCENT: u64 = 20;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Immutable retry configuration, shareable across concurrent operations.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
    strategy: RetryStrategyKind,
    timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        RetryPolicy {
            max_attempts: settings.max_attempts.max(1),
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            multiplier: settings.multiplier,
            jitter: settings.jitter,
            strategy: settings.strategy,
            timeout: settings.timeout_ms.map(Duration::from_millis),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff; `max_delay` defaults to 10s and jitter is off.
    pub fn exponential(initial_delay: Duration, multiplier: f64) -> Self {
        Self::base(RetryStrategyKind::Exponential, initial_delay).with_multiplier(multiplier)
    }

    pub fn linear(initial_delay: Duration) -> Self {
        Self::base(RetryStrategyKind::Linear, initial_delay)
    }

    pub fn constant(delay: Duration) -> Self {
        Self::base(RetryStrategyKind::Constant, delay)
    }

    fn base(strategy: RetryStrategyKind, initial_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_delay,
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: false,
            strategy,
            timeout: None,
        }
    }

    /// Clamped to at least one attempt.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn jitter(&self) -> bool {
        self.jitter
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn strategy(&self) -> RetryStrategyKind {
        self.strategy
    }

    /// Delay before the retry that follows failed `attempt` (1-based),
    /// without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.strategy {
            RetryStrategyKind::Constant => self.initial_delay,
            RetryStrategyKind::Linear => self.initial_delay.saturating_mul(attempt),
            RetryStrategyKind::Exponential => {
                let nanos = self.initial_delay.as_nanos() as f64
                    * self.multiplier.powi(attempt as i32 - 1);
                if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
                    self.max_delay
                } else {
                    Duration::from_nanos(nanos.max(0.0) as u64)
                }
            }
        };
        delay.min(self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// RetryEngine
// ---------------------------------------------------------------------------

type Classifier = dyn Fn(&RemoteError) -> bool + Send + Sync;

/// Executes operations under a [`RetryPolicy`].
///
/// `execute` takes `&self`; one engine is shared by every worker of a batch.
/// The only mutable state is the jitter RNG behind a mutex.
pub struct RetryEngine {
    policy: Arc<RetryPolicy>,
    classifier: Arc<Classifier>,
    rng: Mutex<StdRng>,
}

impl std::fmt::Debug for RetryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryEngine")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RetryEngine {
    /// Engine with the default classifier: only rate limiting and timeouts
    /// are retried.
    pub fn new(policy: RetryPolicy) -> Self {
        RetryEngine {
            policy: Arc::new(policy),
            classifier: Arc::new(|err: &RemoteError| err.kind.is_retriable()),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Replace the retriable-error predicate.
    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&RemoteError) -> bool + Send + Sync + 'static,
    {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Seed the jitter source for reproducible delays.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Backoff after failed `attempt`, including jitter when enabled.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.policy.delay_for_attempt(attempt);
        if !self.policy.jitter {
            return base;
        }
        let ceiling = (base.as_nanos() as u64).saturating_mul(JITTER_PERCENT) / 100;
        if ceiling == 0 {
            return base;
        }
        let extra = match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(0..=ceiling),
            Err(poisoned) => poisoned.into_inner().gen_range(0..=ceiling),
        };
        base.saturating_add(Duration::from_nanos(extra))
    }

    /// Run `operation` until it succeeds, fails permanently, runs out of
    /// attempts, hits the policy timeout, or `cancel` fires.
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let started = Instant::now();
        let deadline = self.policy.timeout.map(|timeout| started + timeout);
        let scope = cancel.child_token();
        let _deadline_timer = deadline.map(|at| DeadlineTimer::arm(at, scope.clone()));

        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            if deadline.is_some_and(|at| Instant::now() >= at) {
                return Err(RetryError::Timeout {
                    attempts: attempt,
                    elapsed: started.elapsed(),
                });
            }

            attempt += 1;
            let err = match operation(scope.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !(self.classifier)(&err) {
                tracing::debug!(attempt, kind = %err.kind, "non-retriable remote error");
                return Err(RetryError::Permanent {
                    attempts: attempt,
                    error: err,
                });
            }
            if attempt >= self.policy.max_attempts {
                tracing::debug!(attempt, kind = %err.kind, "retry attempts exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.backoff_delay(attempt);
            tracing::debug!(
                attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                kind = %err.kind,
                "retrying remote operation",
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
                _ = sleep_until_deadline(deadline) => {
                    return Err(RetryError::Timeout {
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Cancels the operation scope when the deadline passes; disarmed on drop.
struct DeadlineTimer(JoinHandle<()>);

impl DeadlineTimer {
    fn arm(at: Instant, scope: CancellationToken) -> Self {
        DeadlineTimer(tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            scope.cancel();
        }))
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use rstest::rstest;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[rstest]
    #[case(1, 100)]
    #[case(2, 200)]
    #[case(3, 400)]
    #[case(4, 800)]
    fn exponential_delay_doubles(#[case] attempt: u32, #[case] expected_ms: u64) {
        let policy = RetryPolicy::exponential(ms(100), 2.0);
        assert_eq!(policy.delay_for_attempt(attempt), ms(expected_ms));
    }

    #[test]
    fn linear_and_constant_delays() {
        let linear = RetryPolicy::linear(ms(150));
        assert_eq!(linear.delay_for_attempt(1), ms(150));
        assert_eq!(linear.delay_for_attempt(3), ms(450));

        let constant = RetryPolicy::constant(ms(250));
        assert_eq!(constant.delay_for_attempt(1), ms(250));
        assert_eq!(constant.delay_for_attempt(7), ms(250));
    }

    #[test]
    fn delays_are_capped_at_max_delay() {
        let exp = RetryPolicy::exponential(ms(100), 2.0).with_max_delay(ms(500));
        assert_eq!(exp.delay_for_attempt(3), ms(400));
        assert_eq!(exp.delay_for_attempt(4), ms(500));
        assert_eq!(exp.delay_for_attempt(60), ms(500));

        let linear = RetryPolicy::linear(ms(300)).with_max_delay(ms(700));
        assert_eq!(linear.delay_for_attempt(3), ms(700));
    }

    #[test]
    fn jitter_only_adds_up_to_twenty_percent() {
        let engine = RetryEngine::new(RetryPolicy::constant(ms(1000)).with_jitter(true)).with_seed(7);
        for _ in 0..200 {
            let delay = engine.backoff_delay(1);
            assert!(delay >= ms(1000), "jitter must never shrink the delay");
            assert!(delay <= ms(1200), "jitter exceeded 20%: {delay:?}");
        }
    }

    #[test]
    fn zero_max_attempts_is_clamped() {
        assert_eq!(RetryPolicy::constant(ms(1)).with_max_attempts(0).max_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn always_retriable_runs_exactly_max_attempts() {
        let engine = RetryEngine::new(RetryPolicy::exponential(ms(10), 2.0).with_max_attempts(4));
        let calls = AtomicU32::new(0);

        let err = engine
            .execute(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(RemoteError::rate_limited("throttled")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(err, RetryError::Exhausted { attempts: 4, .. }));
        assert!(err.to_string().contains("4 attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retriable_error_returns_after_one_attempt() {
        let engine = RetryEngine::new(RetryPolicy::constant(ms(10)).with_max_attempts(5));
        let calls = AtomicU32::new(0);

        let err = engine
            .execute(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(RemoteError::new(ErrorKind::AccessDenied, "denied")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            err,
            RetryError::Permanent { attempts: 1, ref error } if error.kind == ErrorKind::AccessDenied
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures_with_expected_waits() {
        let engine = RetryEngine::new(RetryPolicy::exponential(ms(100), 2.0).with_max_attempts(5));
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let value = engine
            .execute(&CancellationToken::new(), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(RemoteError::new(ErrorKind::Timeout, "slow"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .expect("third attempt succeeds");

        assert_eq!(value, 3);
        // 100ms after attempt 1, 200ms after attempt 2.
        assert_eq!(started.elapsed(), ms(300));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_during_backoff_reports_timeout() {
        let policy = RetryPolicy::constant(ms(1000))
            .with_max_attempts(10)
            .with_timeout(Some(ms(2500)));
        let engine = RetryEngine::new(policy);
        let calls = AtomicU32::new(0);

        let err = engine
            .execute(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(RemoteError::rate_limited("throttled")) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::Timeout { attempts: 3, .. }), "got {err:?}");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_further_attempts() {
        let engine = RetryEngine::new(RetryPolicy::constant(ms(500)).with_max_attempts(10));
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ms(750)).await;
                cancel.cancel();
            })
        };

        let err = engine
            .execute(&cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(RemoteError::rate_limited("throttled")) }
            })
            .await
            .unwrap_err();
        canceller.await.expect("canceller");

        assert!(matches!(err, RetryError::Cancelled { attempts: 2 }), "got {err:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_counts_earlier_retriable_attempts() {
        let engine = RetryEngine::new(RetryPolicy::constant(ms(5)).with_max_attempts(5));
        let calls = AtomicU32::new(0);

        let err = engine
            .execute(&CancellationToken::new(), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err::<(), _>(RemoteError::rate_limited("slow down"))
                    } else {
                        Err(RemoteError::already_exists("taken"))
                    }
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err.attempts(), 3);
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(err.to_string(), RemoteError::already_exists("taken").to_string());
    }

    #[tokio::test(start_paused = true)]
    async fn custom_classifier_overrides_default() {
        let engine = RetryEngine::new(RetryPolicy::constant(ms(1)).with_max_attempts(3))
            .with_classifier(|err| err.kind == ErrorKind::Generic);
        let calls = AtomicU32::new(0);

        let err = engine
            .execute(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(RemoteError::generic("flaky")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, RetryError::Exhausted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn operation_scope_is_cancelled_at_deadline() {
        let engine = RetryEngine::new(
            RetryPolicy::constant(ms(10)).with_timeout(Some(ms(100))),
        );

        let observed = engine
            .execute(&CancellationToken::new(), |scope| async move {
                scope.cancelled().await;
                Ok::<_, RemoteError>(true)
            })
            .await
            .expect("operation completes once the scope is cancelled");

        assert!(observed);
    }
}
