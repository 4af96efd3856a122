//! Concurrent execution of step lists.

use std::mem;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use super::{BoxStep, State, Step, StepsProvider};
use crate::context::CancelHandle;
use crate::{Context, Error, Result};

/// Concurrency and error policy for parallel execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelOptions {
    /// Maximum number of steps running at once. `0` means unbounded.
    pub limit: usize,
    /// Let every step finish and report all errors together.
    ///
    /// When `false` (the default) the first failure cancels the siblings' shared context
    /// and is returned on its own.
    pub join_errors: bool,
}

/// Expands providers and runs every resulting step concurrently. See [`in_parallel`].
pub struct InParallel<S> {
    options: ParallelOptions,
    providers: Vec<StepsProvider<S>>,
}

/// Expand every provider, then run all of the steps concurrently.
///
/// Providers are expanded one after another before anything starts; an expansion error is
/// returned immediately. Each step runs in its own task and receives a clone of the state.
/// The call returns only after every launched task has finished.
///
/// Panics inside a step are not caught here. They resume on the caller once observed;
/// wrap steps with [`recover_panics`](crate::recover_panics) to turn them into errors.
pub fn in_parallel<S: State>(providers: Vec<StepsProvider<S>>) -> InParallel<S> {
    in_parallel_with(ParallelOptions::default(), providers)
}

/// Like [`in_parallel`] with an explicit concurrency limit and error policy.
pub fn in_parallel_with<S: State>(
    options: ParallelOptions,
    providers: Vec<StepsProvider<S>>,
) -> InParallel<S> {
    InParallel { options, providers }
}

#[derive(Default)]
struct Outcome {
    first: Option<Error>,
    errors: Vec<Error>,
}

fn record_failure(outcome: &Mutex<Outcome>, cancel: &CancelHandle, join_errors: bool, err: Error) {
    let mut outcome = outcome.lock().unwrap_or_else(PoisonError::into_inner);
    if join_errors {
        outcome.errors.push(err);
    } else if outcome.first.is_none() {
        outcome.first = Some(err);
        cancel.cancel();
    }
}

#[async_trait]
impl<S: State> Step<S> for InParallel<S> {
    async fn run(&self, ctx: &Context, state: S) -> Result<()> {
        let mut units: Vec<BoxStep<S>> = Vec::new();
        for provider in &self.providers {
            units.extend(provider.extract(ctx, state.clone()).await?);
        }
        if units.is_empty() {
            return Ok(());
        }

        let ParallelOptions { limit, join_errors } = self.options;
        debug!(units = units.len(), limit, join_errors, "starting parallel steps");

        let (group, cancel) = ctx.with_cancel();
        let semaphore = (limit > 0).then(|| Arc::new(Semaphore::new(limit)));
        let outcome = Arc::new(Mutex::new(Outcome::default()));
        let mut tasks = JoinSet::new();

        for unit in units {
            let permit = match &semaphore {
                Some(semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
                None => None,
            };
            let group = group.clone();
            let cancel = cancel.clone();
            let outcome = Arc::clone(&outcome);
            let state = state.clone();
            tasks.spawn(async move {
                let _permit = permit;
                if let Err(err) = unit.run(&group, state).await {
                    record_failure(&outcome, &cancel, join_errors, err);
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                if err.is_panic() {
                    cancel.cancel();
                    std::panic::resume_unwind(err.into_panic());
                }
            }
        }
        cancel.cancel();

        let mut outcome = outcome.lock().unwrap_or_else(PoisonError::into_inner);
        let result = if join_errors {
            Error::join(mem::take(&mut outcome.errors))
        } else {
            outcome.first.take()
        };
        debug!(failed = result.is_some(), "parallel steps finished");
        result.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::context::sleep;
    use crate::step::{extract, step, StepExt};
    use crate::steps;
    use crate::testing::{decrement, fail_with, increment, increment_and_fail, panic_with, Counter, Sentinel};

    #[tokio::test(flavor = "multi_thread")]
    async fn test_parallel_sums_regardless_of_order() {
        let counter = Counter::default();
        let p = in_parallel(vec![steps![
            increment(15),
            decrement(5),
            increment(21),
            decrement(10),
            decrement(11),
        ]]);
        p.run(&Context::new(), counter.clone()).await.unwrap();
        assert_eq!(counter.get(), 10);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_limit_bounds_concurrency() {
        let active = Arc::new(AtomicI64::new(0));
        let peak = Arc::new(AtomicI64::new(0));

        let unit = {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            step(move |_ctx, _c: Counter| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        }
        .boxed();

        let units = vec![unit; 10];
        let p = in_parallel_with(
            ParallelOptions {
                limit: 2,
                join_errors: false,
            },
            vec![crate::steps(units)],
        );
        p.run(&Context::new(), Counter::default()).await.unwrap();

        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "peak concurrency was {peak}");
        assert!(peak >= 1);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fail_fast_cancels_siblings() {
        let cancelled = Counter::default();
        let observer = {
            let cancelled = cancelled.clone();
            step(move |ctx: Context, c: Counter| {
                let cancelled = cancelled.clone();
                async move {
                    let result = Step::<Counter>::run(&sleep(Duration::from_millis(200)), &ctx, c).await;
                    if let Err(err) = &result {
                        if err.is_cancellation() {
                            cancelled.add(1);
                        }
                    }
                    result
                }
            })
        };

        let p = in_parallel(vec![steps![
            observer.clone(),
            observer.clone(),
            fail_with(Sentinel::One),
            observer.clone(),
            observer,
        ]]);
        let err = p.run(&Context::new(), Counter::default()).await.unwrap_err();

        assert!(err.is(&Sentinel::One));
        assert_eq!(cancelled.get(), 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_join_runs_every_unit() {
        let counter = Counter::default();
        let p = in_parallel_with(
            ParallelOptions {
                limit: 0,
                join_errors: true,
            },
            vec![steps![
                increment_and_fail(Sentinel::One),
                increment(10),
                increment_and_fail(Sentinel::Two),
            ]],
        );
        let err = p.run(&Context::new(), counter.clone()).await.unwrap_err();

        assert_eq!(counter.get(), 12);
        assert!(err.is(&Sentinel::One));
        assert!(err.is(&Sentinel::Two));
        assert!(!err.is_cancellation());
    }

    #[tokio::test]
    async fn test_provider_error_starts_nothing() {
        let counter = Counter::default();
        let broken: StepsProvider<Counter> = Arc::new(extract(|_ctx, _c: Counter| async move {
            Err::<Vec<BoxStep<Counter>>, _>(Error::other(Sentinel::Three))
        }));
        let p = in_parallel(vec![steps![increment(1)], broken]);

        let err = p.run(&Context::new(), counter.clone()).await.unwrap_err();
        assert!(err.is(&Sentinel::Three));
        assert_eq!(counter.get(), 0);
    }

    #[tokio::test]
    async fn test_empty_is_ok() {
        let p = in_parallel::<Counter>(vec![steps![]]);
        assert!(p.run(&Context::new(), Counter::default()).await.is_ok());
    }

    #[tokio::test]
    #[should_panic(expected = "unit exploded")]
    async fn test_panics_are_not_recovered() {
        let p = in_parallel(vec![steps![increment(1), panic_with("unit exploded")]]);
        let _ = p.run(&Context::new(), Counter::default()).await;
    }
}
