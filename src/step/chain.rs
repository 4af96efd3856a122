//! Gluing the four shapes together.
//!
//! Every combinator here runs its stages in order and returns the first error exactly as
//! the failing stage produced it. Later stages never run after a failure, and effects of
//! earlier stages are not rolled back.

use async_trait::async_trait;

use super::{Consume, Extract, State, Step, Transform};
use crate::{Context, Result};

/// Extract, transform and consume in one step. See [`pipeline`].
pub struct Pipeline<E, T, C> {
    extract: E,
    transform: T,
    consume: C,
}

/// Run `extract`, pass its value through `transform`, and hand the result to `consume`.
pub fn pipeline<E, T, C>(extract: E, transform: T, consume: C) -> Pipeline<E, T, C> {
    Pipeline {
        extract,
        transform,
        consume,
    }
}

#[async_trait]
impl<S, E, T, C> Step<S> for Pipeline<E, T, C>
where
    S: State,
    E: Extract<S>,
    T: Transform<S, E::Output>,
    C: Consume<S, T::Output>,
{
    async fn run(&self, ctx: &Context, state: S) -> Result<()> {
        let value = self.extract.extract(ctx, state.clone()).await?;
        let value = self.transform.transform(ctx, state.clone(), value).await?;
        self.consume.consume(ctx, state, value).await
    }
}

/// Extract then consume. See [`with`].
pub struct With<E, C> {
    extract: E,
    consume: C,
}

/// Feed the value produced by `extract` straight into `consume`.
pub fn with<E, C>(extract: E, consume: C) -> With<E, C> {
    With { extract, consume }
}

#[async_trait]
impl<S, E, C> Step<S> for With<E, C>
where
    S: State,
    E: Extract<S>,
    C: Consume<S, E::Output>,
{
    async fn run(&self, ctx: &Context, state: S) -> Result<()> {
        let value = self.extract.extract(ctx, state.clone()).await?;
        self.consume.consume(ctx, state, value).await
    }
}

/// An extraction post-processed by a transform. See [`from`].
pub struct FromExtract<E, T> {
    extract: E,
    transform: T,
}

/// Build an [`Extract`] that runs `extract` and then `transform` on its value.
pub fn from<E, T>(extract: E, transform: T) -> FromExtract<E, T> {
    FromExtract { extract, transform }
}

#[async_trait]
impl<S, E, T> Extract<S> for FromExtract<E, T>
where
    S: State,
    E: Extract<S>,
    T: Transform<S, E::Output>,
{
    type Output = T::Output;

    async fn extract(&self, ctx: &Context, state: S) -> Result<T::Output> {
        let value = self.extract.extract(ctx, state.clone()).await?;
        self.transform.transform(ctx, state, value).await
    }
}

/// A consumer that pre-processes its input. See [`feed`].
pub struct Feed<T, C> {
    transform: T,
    consume: C,
}

/// Build a [`Consume`] that transforms its input before handing it to `consume`.
pub fn feed<T, C>(transform: T, consume: C) -> Feed<T, C> {
    Feed { transform, consume }
}

#[async_trait]
impl<S, I, T, C> Consume<S, I> for Feed<T, C>
where
    S: State,
    I: Send + 'static,
    T: Transform<S, I>,
    C: Consume<S, T::Output>,
{
    async fn consume(&self, ctx: &Context, state: S, input: I) -> Result<()> {
        let value = self.transform.transform(ctx, state.clone(), input).await?;
        self.consume.consume(ctx, state, value).await
    }
}

/// Two transforms composed left to right. See [`chain`].
pub struct Chain<A, B> {
    first: A,
    second: B,
}

/// Compose two transforms: the output of `first` is the input of `second`.
pub fn chain<A, B>(first: A, second: B) -> Chain<A, B> {
    Chain { first, second }
}

/// Compose three transforms left to right.
pub fn chain3<A, B, C>(a: A, b: B, c: C) -> Chain<Chain<A, B>, C> {
    chain(chain(a, b), c)
}

/// Compose four transforms left to right.
pub fn chain4<A, B, C, D>(a: A, b: B, c: C, d: D) -> Chain<Chain<Chain<A, B>, C>, D> {
    chain(chain3(a, b, c), d)
}

#[async_trait]
impl<S, I, A, B> Transform<S, I> for Chain<A, B>
where
    S: State,
    I: Send + 'static,
    A: Transform<S, I>,
    B: Transform<S, A::Output>,
{
    type Output = B::Output;

    async fn transform(&self, ctx: &Context, state: S, input: I) -> Result<B::Output> {
        let value = self.first.transform(ctx, state.clone(), input).await?;
        self.second.transform(ctx, state, value).await
    }
}

/// A constant. See [`value`].
#[derive(Debug, Clone)]
pub struct Value<U>(U);

/// An [`Extract`] that always yields a clone of `value`, ignoring context and state.
pub fn value<U>(value: U) -> Value<U> {
    Value(value)
}

#[async_trait]
impl<S, U> Extract<S> for Value<U>
where
    S: State,
    U: Clone + Send + Sync + 'static,
{
    type Output = U;

    async fn extract(&self, _ctx: &Context, _state: S) -> Result<U> {
        Ok(self.0.clone())
    }
}

/// Run a step against a derived child state. See [`spawn`].
pub struct Spawn<D, X> {
    derive: D,
    child: X,
}

/// Derive a child state with `derive` and run `child` against it.
///
/// The child state is discarded afterwards; nothing is written back to the parent.
pub fn spawn<D, X>(derive: D, child: X) -> Spawn<D, X> {
    Spawn { derive, child }
}

#[async_trait]
impl<S, D, X> Step<S> for Spawn<D, X>
where
    S: State,
    D: Extract<S>,
    D::Output: State,
    X: Step<D::Output>,
{
    async fn run(&self, ctx: &Context, state: S) -> Result<()> {
        let child_state = self.derive.extract(ctx, state).await?;
        self.child.run(ctx, child_state).await
    }
}
