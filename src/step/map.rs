//! Collection operators.
//!
//! Element-wise operators run serially, check for cancellation before each element and
//! stop at the first failure, tagging it with the element's index via [`Error::Indexed`].
//! Cancellation errors are returned as-is.

use std::sync::Arc;

use async_trait::async_trait;

use super::chain::from;
use super::{BoxStep, Consume, Extract, State, Step, StepsProvider, Transform};
use crate::{Context, Error, Result};

/// Repeated extraction until exhaustion. See [`collect`].
pub struct Collect<E>(E);

/// Call `extract` until it fails with [`Error::Exhausted`], accumulating each value.
///
/// Exhaustion ends collection successfully. Any other failure is reported as
/// [`Error::Indexed`] carrying the zero-based attempt at which it occurred.
///
/// # Example
///
/// ```rust
/// use std::sync::{Arc, Mutex};
/// use flowstep::{collect, extract, Context, Error, Extract};
///
/// let next = extract(|_ctx, queue: Arc<Mutex<Vec<u32>>>| async move {
///     queue.lock().unwrap().pop().ok_or(Error::Exhausted)
/// });
///
/// let queue = Arc::new(Mutex::new(vec![1, 2, 3]));
/// let items = tokio_test::block_on(collect(next).extract(&Context::new(), queue)).unwrap();
/// assert_eq!(items, vec![3, 2, 1]);
/// ```
pub fn collect<E>(extract: E) -> Collect<E> {
    Collect(extract)
}

#[async_trait]
impl<S, E> Extract<S> for Collect<E>
where
    S: State,
    E: Extract<S>,
{
    type Output = Vec<E::Output>;

    async fn extract(&self, ctx: &Context, state: S) -> Result<Vec<E::Output>> {
        let mut collected = Vec::new();
        for attempt in 0.. {
            ctx.check()?;
            match self.0.extract(ctx, state.clone()).await {
                Ok(item) => collected.push(item),
                Err(err) if err.is_exhausted() => break,
                Err(err) => return Err(Error::indexed(attempt, err)),
            }
        }
        Ok(collected)
    }
}

/// Element-wise transform. See [`render`].
pub struct Render<T>(T);

/// Apply `transform` to every element in order, producing an output of equal length.
pub fn render<T>(transform: T) -> Render<T> {
    Render(transform)
}

#[async_trait]
impl<S, I, T> Transform<S, Vec<I>> for Render<T>
where
    S: State,
    I: Send + 'static,
    T: Transform<S, I>,
{
    type Output = Vec<T::Output>;

    async fn transform(&self, ctx: &Context, state: S, input: Vec<I>) -> Result<Vec<T::Output>> {
        let mut results = Vec::with_capacity(input.len());
        for (index, item) in input.into_iter().enumerate() {
            ctx.check()?;
            let out = self
                .0
                .transform(ctx, state.clone(), item)
                .await
                .map_err(|err| Error::indexed(index, err))?;
            results.push(out);
        }
        Ok(results)
    }
}

/// Element-wise consume. See [`apply`].
pub struct Apply<C>(C);

/// Hand every element to `consume` in order.
pub fn apply<C>(consume: C) -> Apply<C> {
    Apply(consume)
}

#[async_trait]
impl<S, I, C> Consume<S, Vec<I>> for Apply<C>
where
    S: State,
    I: Send + 'static,
    C: Consume<S, I>,
{
    async fn consume(&self, ctx: &Context, state: S, input: Vec<I>) -> Result<()> {
        for (index, item) in input.into_iter().enumerate() {
            ctx.check()?;
            self.0
                .consume(ctx, state.clone(), item)
                .await
                .map_err(|err| Error::indexed(index, err))?;
        }
        Ok(())
    }
}

/// Element-to-step lifting. See [`map`].
pub struct Map<F>(F);

/// Turn a list of things into a list of steps, one per element.
///
/// Usually combined with [`from`] into a [`StepsProvider`]; see [`for_each`].
pub fn map<F>(f: F) -> Map<F> {
    Map(f)
}

#[async_trait]
impl<S, A, F, X> Transform<S, Vec<A>> for Map<F>
where
    S: State,
    A: Send + 'static,
    F: Fn(A) -> X + Send + Sync,
    X: Step<S> + 'static,
{
    type Output = Vec<BoxStep<S>>;

    async fn transform(&self, _ctx: &Context, _state: S, input: Vec<A>) -> Result<Vec<BoxStep<S>>> {
        Ok(input
            .into_iter()
            .map(|a| Arc::new((self.0)(a)) as BoxStep<S>)
            .collect())
    }
}

/// Extract a list and map each element to a step.
///
/// The result plugs into either [`in_serial`](crate::in_serial) or
/// [`in_parallel`](crate::in_parallel), so the execution strategy is chosen where the
/// provider is used rather than where it is defined.
pub fn for_each<S, A, E, F, X>(extract: E, f: F) -> StepsProvider<S>
where
    S: State,
    A: Send + 'static,
    E: Extract<S, Output = Vec<A>> + 'static,
    F: Fn(A) -> X + Send + Sync + 'static,
    X: Step<S> + 'static,
{
    Arc::new(from(extract, map(f)))
}

/// Concatenates nested lists. See [`flatten`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Flatten;

/// A transform that collapses a list of lists into one list, preserving order.
pub fn flatten() -> Flatten {
    Flatten
}

#[async_trait]
impl<S, U> Transform<S, Vec<Vec<U>>> for Flatten
where
    S: State,
    U: Send + 'static,
{
    type Output = Vec<U>;

    async fn transform(&self, _ctx: &Context, _state: S, input: Vec<Vec<U>>) -> Result<Vec<U>> {
        Ok(input.into_iter().flatten().collect())
    }
}
