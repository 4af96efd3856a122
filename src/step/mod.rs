//! Core step traits and closure adapters.
//!
//! Four callable shapes make up the algebra:
//!
//! - [`Step`]: `(context, state) -> Result<()>`, the universal unit everything composes into
//! - [`Extract`]: `(context, state) -> Result<Output>`, reads a value out of state
//! - [`Transform`]: `(context, state, input) -> Result<Output>`
//! - [`Consume`]: `(context, state, input) -> Result<()>`, a side-effecting sink
//!
//! State is passed by value. Parallel branches receive clones, so a state type that is
//! mutated concurrently must be a shared handle such as an `Arc` around atomics or a lock.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::{with_timeout, WithTimeout};
use crate::names::Named;
use crate::retry::Retry;
use crate::{Context, Result};

pub mod branch;
pub mod chain;
pub mod map;
pub mod parallel;
pub mod recover;
pub mod serial;

use recover::{IgnoreError, RecoverPanics};

/// Bound satisfied by every state type a step graph can run against.
pub trait State: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> State for T {}

/// The fundamental unit of work.
#[async_trait]
pub trait Step<S>: Send + Sync {
    /// Execute against `state`.
    async fn run(&self, ctx: &Context, state: S) -> Result<()>;
}

/// Produces a value from state.
#[async_trait]
pub trait Extract<S>: Send + Sync {
    /// The produced value.
    type Output: Send + 'static;

    /// Produce a value.
    async fn extract(&self, ctx: &Context, state: S) -> Result<Self::Output>;
}

/// Maps an input to an output, with access to state.
#[async_trait]
pub trait Transform<S, I>: Send + Sync {
    /// The produced value.
    type Output: Send + 'static;

    /// Transform `input`.
    async fn transform(&self, ctx: &Context, state: S, input: I) -> Result<Self::Output>;
}

/// Consumes an input for its side effects.
#[async_trait]
pub trait Consume<S, I>: Send + Sync {
    /// Consume `input`.
    async fn consume(&self, ctx: &Context, state: S, input: I) -> Result<()>;
}

/// A type-erased, shareable [`Step`].
pub type BoxStep<S> = Arc<dyn Step<S>>;

/// A type-erased, shareable [`Extract`].
pub type BoxExtract<S, O> = Arc<dyn Extract<S, Output = O>>;

/// A type-erased, shareable [`Transform`].
pub type BoxTransform<S, I, O> = Arc<dyn Transform<S, I, Output = O>>;

/// A type-erased, shareable [`Consume`].
pub type BoxConsume<S, I> = Arc<dyn Consume<S, I>>;

/// An extraction that yields the steps to run, for dynamically sized execution.
pub type StepsProvider<S> = BoxExtract<S, Vec<BoxStep<S>>>;

macro_rules! forward_pointer_impls {
    ($($ptr:ident),*) => {$(
        #[async_trait]
        impl<S: State, T: Step<S> + ?Sized> Step<S> for $ptr<T> {
            async fn run(&self, ctx: &Context, state: S) -> Result<()> {
                (**self).run(ctx, state).await
            }
        }

        #[async_trait]
        impl<S: State, T: Extract<S> + ?Sized> Extract<S> for $ptr<T> {
            type Output = T::Output;

            async fn extract(&self, ctx: &Context, state: S) -> Result<T::Output> {
                (**self).extract(ctx, state).await
            }
        }

        #[async_trait]
        impl<S, I, T> Transform<S, I> for $ptr<T>
        where
            S: State,
            I: Send + 'static,
            T: Transform<S, I> + ?Sized,
        {
            type Output = T::Output;

            async fn transform(&self, ctx: &Context, state: S, input: I) -> Result<T::Output> {
                (**self).transform(ctx, state, input).await
            }
        }

        #[async_trait]
        impl<S, I, T> Consume<S, I> for $ptr<T>
        where
            S: State,
            I: Send + 'static,
            T: Consume<S, I> + ?Sized,
        {
            async fn consume(&self, ctx: &Context, state: S, input: I) -> Result<()> {
                (**self).consume(ctx, state, input).await
            }
        }
    )*};
}

forward_pointer_impls!(Arc, Box);

/// A [`Step`] built from a closure. See [`step`].
#[derive(Clone)]
pub struct FnStep<F>(F);

/// Lift an async closure into a [`Step`].
///
/// # Example
///
/// ```rust
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use std::sync::Arc;
/// use flowstep::{step, Context, Step};
///
/// let bump = step(|_ctx, n: Arc<AtomicU32>| async move {
///     n.fetch_add(1, Ordering::SeqCst);
///     Ok(())
/// });
///
/// let n = Arc::new(AtomicU32::new(0));
/// tokio_test::block_on(bump.run(&Context::new(), n.clone())).unwrap();
/// assert_eq!(n.load(Ordering::SeqCst), 1);
/// ```
pub fn step<S, F, Fut>(f: F) -> FnStep<F>
where
    F: Fn(Context, S) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    FnStep(f)
}

#[async_trait]
impl<S, F, Fut> Step<S> for FnStep<F>
where
    S: State,
    F: Fn(Context, S) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn run(&self, ctx: &Context, state: S) -> Result<()> {
        (self.0)(ctx.clone(), state).await
    }
}

/// An [`Extract`] built from a closure. See [`extract`].
#[derive(Clone)]
pub struct FnExtract<F>(F);

/// Lift an async closure into an [`Extract`].
pub fn extract<S, O, F, Fut>(f: F) -> FnExtract<F>
where
    F: Fn(Context, S) -> Fut,
    Fut: Future<Output = Result<O>>,
{
    FnExtract(f)
}

#[async_trait]
impl<S, O, F, Fut> Extract<S> for FnExtract<F>
where
    S: State,
    O: Send + 'static,
    F: Fn(Context, S) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O>> + Send,
{
    type Output = O;

    async fn extract(&self, ctx: &Context, state: S) -> Result<O> {
        (self.0)(ctx.clone(), state).await
    }
}

/// A [`Transform`] built from a closure. See [`transform`].
#[derive(Clone)]
pub struct FnTransform<F>(F);

/// Lift an async closure into a [`Transform`].
pub fn transform<S, I, O, F, Fut>(f: F) -> FnTransform<F>
where
    F: Fn(Context, S, I) -> Fut,
    Fut: Future<Output = Result<O>>,
{
    FnTransform(f)
}

#[async_trait]
impl<S, I, O, F, Fut> Transform<S, I> for FnTransform<F>
where
    S: State,
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(Context, S, I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O>> + Send,
{
    type Output = O;

    async fn transform(&self, ctx: &Context, state: S, input: I) -> Result<O> {
        (self.0)(ctx.clone(), state, input).await
    }
}

/// A [`Consume`] built from a closure. See [`consume`].
#[derive(Clone)]
pub struct FnConsume<F>(F);

/// Lift an async closure into a [`Consume`].
pub fn consume<S, I, F, Fut>(f: F) -> FnConsume<F>
where
    F: Fn(Context, S, I) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    FnConsume(f)
}

#[async_trait]
impl<S, I, F, Fut> Consume<S, I> for FnConsume<F>
where
    S: State,
    I: Send + 'static,
    F: Fn(Context, S, I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn consume(&self, ctx: &Context, state: S, input: I) -> Result<()> {
        (self.0)(ctx.clone(), state, input).await
    }
}

/// Fluent composition methods, implemented for every [`Step`].
pub trait StepExt<S: State>: Step<S> + Sized + 'static {
    /// Erase the concrete type.
    fn boxed(self) -> BoxStep<S> {
        Arc::new(self)
    }

    /// Wrap in a named scope. See [`named`](crate::named).
    fn named(self, name: impl Into<String>) -> Named<Self> {
        Named::new(name, self)
    }

    /// Retry on failure. Add predicates with [`Retry::when`]; with none the default
    /// policy applies.
    fn retry(self) -> Retry<Self> {
        Retry::new(self)
    }

    /// Report success whatever the outcome.
    fn ignore_error(self) -> IgnoreError<Self> {
        IgnoreError::new(self)
    }

    /// Convert panics into [`Error::Panic`](crate::Error::Panic).
    fn recover_panics(self) -> RecoverPanics<Self> {
        RecoverPanics::new(self)
    }

    /// Run under a context that ends after `timeout`.
    fn with_timeout(self, timeout: Duration) -> WithTimeout<Self> {
        with_timeout(timeout, self)
    }
}

impl<S: State, T: Step<S> + Sized + 'static> StepExt<S> for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{increment, Counter, Sentinel};
    use crate::Error;

    #[tokio::test]
    async fn test_closure_shapes() {
        let ctx = Context::new();
        let counter = Counter::default();

        let read = extract(|_ctx, c: Counter| async move { Ok(c.get()) });
        let double = transform(|_ctx, _c: Counter, n: i64| async move { Ok(n * 2) });
        let store = consume(|_ctx, c: Counter, n: i64| async move {
            c.add(n);
            Ok(())
        });

        counter.add(4);
        let n = read.extract(&ctx, counter.clone()).await.unwrap();
        let n = double.transform(&ctx, counter.clone(), n).await.unwrap();
        store.consume(&ctx, counter.clone(), n).await.unwrap();
        assert_eq!(counter.get(), 12);
    }

    #[tokio::test]
    async fn test_boxed_and_pointer_forwarding() {
        let counter = Counter::default();
        let boxed: BoxStep<Counter> = increment(2).boxed();
        let owned: Box<dyn Step<Counter>> = Box::new(increment(3));

        boxed.run(&Context::new(), counter.clone()).await.unwrap();
        owned.run(&Context::new(), counter.clone()).await.unwrap();
        assert_eq!(counter.get(), 5);
    }

    #[tokio::test]
    async fn test_closure_sees_context() {
        let probe = step(|ctx: Context, _c: Counter| async move {
            assert_eq!(ctx.names(), vec!["outer"]);
            Err(Error::other(Sentinel::One))
        });

        let err = probe
            .named("outer")
            .run(&Context::new(), Counter::default())
            .await
            .unwrap_err();
        assert!(err.is(&Sentinel::One));
    }
}
