//! Error recovery: ignoring, panic trapping, and fallbacks.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::warn;

use super::{BoxStep, State, Step, Transform};
use crate::error::RecoveredPanic;
use crate::{Context, Error, Result};

/// Swallows the wrapped step's error. See [`ignore_error`].
pub struct IgnoreError<X> {
    inner: X,
}

impl<X> IgnoreError<X> {
    /// Wrap `inner`.
    pub fn new(inner: X) -> Self {
        Self { inner }
    }
}

/// Run `step` and report success whatever happens. For best-effort side effects.
pub fn ignore_error<X>(step: X) -> IgnoreError<X> {
    IgnoreError::new(step)
}

#[async_trait]
impl<S: State, X: Step<S>> Step<S> for IgnoreError<X> {
    async fn run(&self, ctx: &Context, state: S) -> Result<()> {
        let _ = self.inner.run(ctx, state).await;
        Ok(())
    }
}

/// Converts panics into errors. See [`recover_panics`].
pub struct RecoverPanics<X> {
    inner: X,
}

impl<X> RecoverPanics<X> {
    /// Wrap `inner`.
    pub fn new(inner: X) -> Self {
        Self { inner }
    }
}

/// Run `step`, turning a panic during the call into [`Error::Panic`].
///
/// Ordinary errors pass through unchanged.
pub fn recover_panics<X>(step: X) -> RecoverPanics<X> {
    RecoverPanics::new(step)
}

#[async_trait]
impl<S: State, X: Step<S>> Step<S> for RecoverPanics<X> {
    async fn run(&self, ctx: &Context, state: S) -> Result<()> {
        match AssertUnwindSafe(self.inner.run(ctx, state)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let panic = RecoveredPanic::from_payload(payload);
                warn!(value = %panic.value, "recovered panic in step");
                Err(Error::Panic(panic))
            }
        }
    }
}

/// Runs a handler on failure. See [`on_error`].
pub struct OnError<X, H> {
    inner: X,
    handler: H,
}

/// On failure, ask `handler` what to do with the error.
///
/// The handler is a [`Transform`] from the error to an optional fallback step:
///
/// - a handler error becomes the final error and no fallback runs
/// - `None` swallows the original error and reports success
/// - `Some(step)` runs that step, whose outcome becomes the final result
pub fn on_error<X, H>(step: X, handler: H) -> OnError<X, H> {
    OnError {
        inner: step,
        handler,
    }
}

#[async_trait]
impl<S, X, H> Step<S> for OnError<X, H>
where
    S: State,
    X: Step<S>,
    H: Transform<S, Error, Output = Option<BoxStep<S>>>,
{
    async fn run(&self, ctx: &Context, state: S) -> Result<()> {
        let err = match self.inner.run(ctx, state.clone()).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        match self.handler.transform(ctx, state.clone(), err).await? {
            Some(fallback) => fallback.run(ctx, state).await,
            None => Ok(()),
        }
    }
}

/// A handler that always proposes the same fallback. See [`fallback_to`].
pub struct FallbackTo<S>(BoxStep<S>);

/// A handler for [`on_error`] that runs `step` whatever the error was.
pub fn fallback_to<S, X>(step: X) -> FallbackTo<S>
where
    S: State,
    X: Step<S> + 'static,
{
    FallbackTo(Arc::new(step))
}

#[async_trait]
impl<S: State> Transform<S, Error> for FallbackTo<S> {
    type Output = Option<BoxStep<S>>;

    async fn transform(&self, _ctx: &Context, _state: S, _error: Error) -> Result<Option<BoxStep<S>>> {
        Ok(Some(Arc::clone(&self.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{transform, StepExt};
    use crate::testing::{fail_with, increment, increment_and_fail, panic_with, Counter, Sentinel};
    use crate::{in_parallel, steps};

    #[tokio::test]
    async fn test_ignore_error() {
        let counter = Counter::default();
        increment_and_fail(Sentinel::One)
            .ignore_error()
            .run(&Context::new(), counter.clone())
            .await
            .unwrap();
        assert_eq!(counter.get(), 1);
    }

    #[tokio::test]
    async fn test_recover_panics_converts_panic() {
        let err = recover_panics(panic_with("kaboom"))
            .run(&Context::new(), Counter::default())
            .await
            .unwrap_err();
        match err {
            Error::Panic(p) => assert_eq!(p.value, "kaboom"),
            other => panic!("expected panic error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recover_panics_passes_errors_through() {
        let err = fail_with(Sentinel::Two)
            .recover_panics()
            .run(&Context::new(), Counter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Other(_)));
        assert!(err.is(&Sentinel::Two));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_recover_panics_inside_parallel() {
        let counter = Counter::default();
        let p = in_parallel(vec![steps![increment(1), panic_with("in a task").recover_panics()]]);
        let err = p.run(&Context::new(), counter.clone()).await.unwrap_err();
        assert!(err.find::<RecoveredPanic>().is_some());
    }

    #[tokio::test]
    async fn test_on_error_fallback_runs() {
        let counter = Counter::default();
        on_error(fail_with(Sentinel::One), fallback_to(increment(5)))
            .run(&Context::new(), counter.clone())
            .await
            .unwrap();
        assert_eq!(counter.get(), 5);
    }

    #[tokio::test]
    async fn test_on_error_handler_outcomes() {
        let ctx = Context::new();

        let swallow = transform(|_ctx, _c: Counter, _err: Error| async move {
            Ok::<Option<BoxStep<Counter>>, Error>(None)
        });
        assert!(on_error(fail_with(Sentinel::One), swallow)
            .run(&ctx, Counter::default())
            .await
            .is_ok());

        let counter = Counter::default();
        let refuse = transform(|_ctx, _c: Counter, err: Error| async move {
            assert!(err.is(&Sentinel::One));
            Err::<Option<BoxStep<Counter>>, _>(Error::other(Sentinel::Two))
        });
        let err = on_error(fail_with(Sentinel::One), refuse)
            .run(&ctx, counter.clone())
            .await
            .unwrap_err();
        assert!(err.is(&Sentinel::Two));
        assert!(!err.is(&Sentinel::One));

        let err = on_error(fail_with(Sentinel::One), fallback_to(fail_with(Sentinel::Three)))
            .run(&ctx, counter)
            .await
            .unwrap_err();
        assert!(err.is(&Sentinel::Three));
    }

    #[tokio::test]
    async fn test_on_error_skips_handler_on_success() {
        let counter = Counter::default();
        on_error(increment(1), fallback_to(increment(100)))
            .run(&Context::new(), counter.clone())
            .await
            .unwrap();
        assert_eq!(counter.get(), 1);
    }
}
