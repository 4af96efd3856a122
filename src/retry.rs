//! Retrying failed steps.
//!
//! A [`Retry`] re-runs its step while every configured [`RetryPredicate`] approves. Backoff
//! predicates do their waiting inside [`RetryPredicate::should_retry`], racing the timer
//! against context cancellation. Cancellation wins ties.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use flowstep::{step, Context, ExponentialBackoff, Step, StepExt, UpTo};
//!
//! let flaky = step(|_ctx, _: ()| async move { Ok(()) })
//!     .retry()
//!     .when(UpTo(5))
//!     .when(ExponentialBackoff::new(Duration::from_millis(10)).with_full_jitter());
//!
//! tokio_test::block_on(flaky.run(&Context::new(), ())).unwrap();
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::debug;

use crate::step::{State, Step};
use crate::{Context, Error, Result};

/// Upper bound for exponential delays computed with a non-default multiplier.
pub const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Decides whether a failed step should run again.
#[async_trait]
pub trait RetryPredicate: Send + Sync {
    /// `attempts` counts failures so far and is 1 after the first one.
    ///
    /// May wait before returning `true`.
    async fn should_retry(&self, ctx: &Context, attempts: u32, error: &Error) -> bool;
}

/// A type-erased, shareable [`RetryPredicate`].
pub type BoxRetryPredicate = Arc<dyn RetryPredicate>;

#[async_trait]
impl<P: RetryPredicate + ?Sized> RetryPredicate for Arc<P> {
    async fn should_retry(&self, ctx: &Context, attempts: u32, error: &Error) -> bool {
        (**self).should_retry(ctx, attempts, error).await
    }
}

/// A step re-run on failure. See [`retry`].
pub struct Retry<X> {
    inner: X,
    predicates: Vec<BoxRetryPredicate>,
}

impl<X> Retry<X> {
    /// Wrap `inner` with no predicates yet.
    pub fn new(inner: X) -> Self {
        Self {
            inner,
            predicates: Vec::new(),
        }
    }

    /// Add a predicate. All predicates must approve for another attempt.
    pub fn when(mut self, predicate: impl RetryPredicate + 'static) -> Self {
        self.predicates.push(Arc::new(predicate));
        self
    }
}

/// Re-run `step` after a failure while every predicate approves, in order.
///
/// The first predicate to refuse ends retrying and the step's last error is returned as it
/// was produced. With no predicates, retries up to 3 attempts with exponential backoff from
/// 100ms and full jitter.
pub fn retry<X>(step: X, predicates: Vec<BoxRetryPredicate>) -> Retry<X> {
    Retry {
        inner: step,
        predicates,
    }
}

fn default_predicates() -> Vec<BoxRetryPredicate> {
    let up_to: BoxRetryPredicate = Arc::new(UpTo(3));
    let backoff: BoxRetryPredicate =
        Arc::new(ExponentialBackoff::new(Duration::from_millis(100)).with_full_jitter());
    vec![up_to, backoff]
}

#[async_trait]
impl<S: State, X: Step<S>> Step<S> for Retry<X> {
    async fn run(&self, ctx: &Context, state: S) -> Result<()> {
        let defaults;
        let predicates = if self.predicates.is_empty() {
            defaults = default_predicates();
            &defaults
        } else {
            &self.predicates
        };

        let mut attempts: u32 = 0;
        loop {
            let err = match self.inner.run(ctx, state.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            attempts = attempts.saturating_add(1);
            for predicate in predicates {
                if !predicate.should_retry(ctx, attempts, &err).await {
                    return Err(err);
                }
            }
            debug!(attempts, error = %err, "retrying step");
        }
    }
}

/// Approves while fewer than `n` attempts have failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpTo(pub u32);

#[async_trait]
impl RetryPredicate for UpTo {
    async fn should_retry(&self, _ctx: &Context, attempts: u32, _error: &Error) -> bool {
        attempts < self.0
    }
}

/// Approves only errors accepted by a check. See [`OnlyIf::new`].
pub struct OnlyIf<F>(F);

impl<F> OnlyIf<F>
where
    F: Fn(&Error) -> bool + Send + Sync,
{
    /// Retry only when `check` accepts the error, e.g. to tell transient failures apart
    /// from permanent ones.
    pub fn new(check: F) -> Self {
        Self(check)
    }
}

#[async_trait]
impl<F> RetryPredicate for OnlyIf<F>
where
    F: Fn(&Error) -> bool + Send + Sync,
{
    async fn should_retry(&self, _ctx: &Context, _attempts: u32, error: &Error) -> bool {
        (self.0)(error)
    }
}

/// Randomization applied to a backoff delay.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum Jitter {
    /// Use the delay as computed.
    #[default]
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// Uniform in `delay ± delay * pct`, never below zero. Non-positive `pct` disables it.
    Percentage(f64),
}

impl Jitter {
    /// Randomize `delay`.
    pub fn apply(self, delay: Duration) -> Duration {
        let nanos = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
        match self {
            Jitter::None => delay,
            Jitter::Full => Duration::from_nanos(rand::thread_rng().gen_range(0..=nanos)),
            Jitter::Percentage(pct) if pct > 0.0 && nanos > 0 => {
                let range = nanos as f64 * pct;
                let offset = rand::thread_rng().gen::<f64>() * 2.0 * range - range;
                let jittered = nanos as f64 + offset;
                if jittered <= 0.0 {
                    Duration::ZERO
                } else {
                    Duration::from_nanos(jittered as u64)
                }
            }
            Jitter::Percentage(_) => delay,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Shaping {
    jitter: Jitter,
    max_delay: Option<Duration>,
}

impl Shaping {
    fn shape(&self, delay: Duration) -> Duration {
        let delay = self.jitter.apply(delay);
        match self.max_delay {
            Some(max) if delay > max => max,
            _ => delay,
        }
    }
}

/// Sleeps for `delay` unless the context ends first. `true` means the wait completed.
async fn wait(ctx: &Context, delay: Duration) -> bool {
    if ctx.is_cancelled() {
        return false;
    }
    tokio::select! {
        biased;
        _ = ctx.cancelled() => false,
        _ = tokio::time::sleep(delay) => !ctx.is_cancelled(),
    }
}

/// Waits a constant delay before each retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedBackoff {
    delay: Duration,
    shaping: Shaping,
}

impl FixedBackoff {
    /// Wait `delay` before every retry.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            shaping: Shaping::default(),
        }
    }

    /// Draw each wait uniformly from `[0, delay]`.
    pub fn with_full_jitter(mut self) -> Self {
        self.shaping.jitter = Jitter::Full;
        self
    }

    /// Vary each wait by up to `pct` of the delay in either direction.
    pub fn with_percentage_jitter(mut self, pct: f64) -> Self {
        self.shaping.jitter = Jitter::Percentage(pct);
        self
    }

    /// Never wait longer than `max`, applied after jitter. Zero disables the cap.
    pub fn with_max_delay(mut self, max: Duration) -> Self {
        self.shaping.max_delay = (!max.is_zero()).then_some(max);
        self
    }
}

#[async_trait]
impl RetryPredicate for FixedBackoff {
    async fn should_retry(&self, ctx: &Context, _attempts: u32, _error: &Error) -> bool {
        wait(ctx, self.shaping.shape(self.delay)).await
    }
}

/// Waits a growing delay before each retry: `base * multiplier^(attempts - 1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    base: Duration,
    multiplier: f64,
    shaping: Shaping,
}

impl ExponentialBackoff {
    /// Start at `base` and double on every attempt.
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            multiplier: 2.0,
            shaping: Shaping::default(),
        }
    }

    /// Grow by `multiplier` instead of 2.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Draw each wait uniformly from `[0, delay]`.
    pub fn with_full_jitter(mut self) -> Self {
        self.shaping.jitter = Jitter::Full;
        self
    }

    /// Vary each wait by up to `pct` of the delay in either direction.
    pub fn with_percentage_jitter(mut self, pct: f64) -> Self {
        self.shaping.jitter = Jitter::Percentage(pct);
        self
    }

    /// Never wait longer than `max`, applied after jitter. Zero disables the cap.
    pub fn with_max_delay(mut self, max: Duration) -> Self {
        self.shaping.max_delay = (!max.is_zero()).then_some(max);
        self
    }

    /// The delay before jitter and capping. `attempts` below 1 count as 1.
    pub fn nominal_delay(&self, attempts: u32) -> Duration {
        let attempts = attempts.max(1);
        if self.multiplier == 2.0 {
            let shift = (attempts - 1).min(62);
            let nanos = self
                .base
                .as_nanos()
                .checked_mul(1_u128 << shift)
                .and_then(|n| u64::try_from(n).ok());
            return match nanos {
                Some(n) if n > 0 => Duration::from_nanos(n),
                _ => self.base,
            };
        }

        let ceiling = MAX_BACKOFF_DELAY.as_nanos() as f64;
        let mut nanos = self.base.as_nanos() as f64;
        for _ in 1..attempts {
            nanos *= self.multiplier;
            if !nanos.is_finite() || nanos >= ceiling {
                return MAX_BACKOFF_DELAY;
            }
            if nanos <= 0.0 {
                return self.base;
            }
        }
        Duration::from_nanos(nanos as u64)
    }
}

#[async_trait]
impl RetryPredicate for ExponentialBackoff {
    async fn should_retry(&self, ctx: &Context, attempts: u32, _error: &Error) -> bool {
        wait(ctx, self.shaping.shape(self.nominal_delay(attempts))).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::step::StepExt;
    use crate::testing::{fail_until_count, increment_and_fail, Counter, Sentinel};

    #[tokio::test]
    async fn test_retry_until_success() {
        let counter = Counter::default();
        fail_until_count(3)
            .retry()
            .when(UpTo(5))
            .run(&Context::new(), counter.clone())
            .await
            .unwrap();
        assert_eq!(counter.get(), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_limit() {
        let counter = Counter::default();
        let err = retry(fail_until_count(10), vec![Arc::new(UpTo(3)) as BoxRetryPredicate])
            .run(&Context::new(), counter.clone())
            .await
            .unwrap_err();
        assert_eq!(counter.get(), 3);
        assert_eq!(err.to_string(), "not yet");
    }

    #[tokio::test]
    async fn test_only_if_refusal_returns_original_error() {
        let counter = Counter::default();
        let err = increment_and_fail(Sentinel::NonRetryable)
            .retry()
            .when(OnlyIf::new(|err: &Error| err.is(&Sentinel::Retryable)))
            .when(UpTo(3))
            .run(&Context::new(), counter.clone())
            .await
            .unwrap_err();
        assert_eq!(counter.get(), 1);
        assert!(err.is(&Sentinel::NonRetryable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_policy_makes_three_attempts() {
        let counter = Counter::default();
        let err = increment_and_fail(Sentinel::Retryable)
            .retry()
            .run(&Context::new(), counter.clone())
            .await
            .unwrap_err();
        assert_eq!(counter.get(), 3);
        assert!(err.is(&Sentinel::Retryable));
    }

    #[test]
    fn test_exponential_nominal_delays() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100));
        assert_eq!(backoff.nominal_delay(0), Duration::from_millis(100));
        assert_eq!(backoff.nominal_delay(1), Duration::from_millis(100));
        assert_eq!(backoff.nominal_delay(2), Duration::from_millis(200));
        assert_eq!(backoff.nominal_delay(3), Duration::from_millis(400));
        // 100ms << 62 does not fit in u64 nanoseconds.
        assert_eq!(backoff.nominal_delay(100), Duration::from_millis(100));

        let triple = backoff.with_multiplier(3.0);
        assert_eq!(triple.nominal_delay(3), Duration::from_millis(900));
        assert_eq!(triple.nominal_delay(200), MAX_BACKOFF_DELAY);

        let negative = backoff.with_multiplier(-1.0);
        assert_eq!(negative.nominal_delay(2), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_bounds() {
        let delay = Duration::from_millis(100);
        for _ in 0..100 {
            assert!(Jitter::Full.apply(delay) <= delay);
            let d = Jitter::Percentage(0.1).apply(delay);
            assert!(d >= Duration::from_millis(90) && d <= Duration::from_millis(110));
            assert!(Jitter::Percentage(5.0).apply(delay) <= Duration::from_millis(600));
        }
        assert_eq!(Jitter::None.apply(delay), delay);
        assert_eq!(Jitter::Full.apply(Duration::ZERO), Duration::ZERO);
        assert_eq!(Jitter::Percentage(-1.0).apply(delay), delay);
    }

    #[test]
    fn test_max_delay_applies_after_jitter_and_last_jitter_wins() {
        let backoff = FixedBackoff::new(Duration::from_secs(10))
            .with_full_jitter()
            .with_percentage_jitter(0.5)
            .with_max_delay(Duration::from_secs(1));
        assert_eq!(backoff.shaping.jitter, Jitter::Percentage(0.5));
        for _ in 0..20 {
            assert_eq!(backoff.shaping.shape(backoff.delay), Duration::from_secs(1));
        }
    }

    #[tokio::test]
    async fn test_exponential_backoff_waits() {
        let counter = Counter::default();
        let started = Instant::now();
        fail_until_count(3)
            .retry()
            .when(UpTo(5))
            .when(ExponentialBackoff::new(Duration::from_millis(50)))
            .run(&Context::new(), counter.clone())
            .await
            .unwrap();
        assert_eq!(counter.get(), 3);
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_cancellation_during_wait_stops_retrying() {
        let counter = Counter::default();
        let (ctx, handle) = Context::new().with_cancel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        });

        let started = Instant::now();
        let err = increment_and_fail(Sentinel::Retryable)
            .retry()
            .when(FixedBackoff::new(Duration::from_secs(30)))
            .run(&ctx, counter.clone())
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(counter.get(), 1);
        assert!(err.is(&Sentinel::Retryable));
    }

    #[tokio::test]
    async fn test_wait_refuses_on_cancelled_context() {
        let (ctx, handle) = Context::new().with_cancel();
        handle.cancel();
        let backoff = FixedBackoff::new(Duration::ZERO);
        assert!(!backoff.should_retry(&ctx, 1, &Error::from("x")).await);
    }
}
