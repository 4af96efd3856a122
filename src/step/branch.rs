//! Conditional routing.
//!
//! A predicate is any [`Extract`] with a `bool` output, so a failing check propagates its
//! error instead of being treated as `false`.

use async_trait::async_trait;

use super::{BoxExtract, Extract, State, Step};
use crate::{Context, Result};

/// Runs a step only when a predicate holds. See [`when`] and [`unless`].
pub struct When<P, X> {
    predicate: P,
    step: X,
    expect: bool,
}

/// Run `step` only if `predicate` yields `true`.
pub fn when<P, X>(predicate: P, step: X) -> When<P, X> {
    When {
        predicate,
        step,
        expect: true,
    }
}

/// Run `step` only if `predicate` yields `false`.
pub fn unless<P, X>(predicate: P, step: X) -> When<P, X> {
    When {
        predicate,
        step,
        expect: false,
    }
}

#[async_trait]
impl<S, P, X> Step<S> for When<P, X>
where
    S: State,
    P: Extract<S, Output = bool>,
    X: Step<S>,
{
    async fn run(&self, ctx: &Context, state: S) -> Result<()> {
        if self.predicate.extract(ctx, state.clone()).await? == self.expect {
            self.step.run(ctx, state).await
        } else {
            Ok(())
        }
    }
}

/// Repeats a step while a predicate holds. See [`repeat_while`].
pub struct RepeatWhile<P, X> {
    predicate: P,
    step: X,
}

/// Evaluate `predicate` before every iteration and run `step` while it yields `true`.
///
/// Stops at the first error from either. Nothing here bounds the loop; combine with
/// [`with_timeout`](crate::with_timeout) when the predicate may never turn false.
pub fn repeat_while<P, X>(predicate: P, step: X) -> RepeatWhile<P, X> {
    RepeatWhile { predicate, step }
}

#[async_trait]
impl<S, P, X> Step<S> for RepeatWhile<P, X>
where
    S: State,
    P: Extract<S, Output = bool>,
    X: Step<S>,
{
    async fn run(&self, ctx: &Context, state: S) -> Result<()> {
        while self.predicate.extract(ctx, state.clone()).await? {
            self.step.run(ctx, state.clone()).await?;
        }
        Ok(())
    }
}

/// Two-way routing on a predicate. See [`branch`].
pub struct Branch<P, L, R> {
    predicate: P,
    then: L,
    otherwise: R,
}

/// Run `then` when `predicate` yields `true`, otherwise run `otherwise`.
pub fn branch<P, L, R>(predicate: P, then: L, otherwise: R) -> Branch<P, L, R> {
    Branch {
        predicate,
        then,
        otherwise,
    }
}

#[async_trait]
impl<S, P, L, R> Step<S> for Branch<P, L, R>
where
    S: State,
    P: Extract<S, Output = bool>,
    L: Step<S>,
    R: Step<S>,
{
    async fn run(&self, ctx: &Context, state: S) -> Result<()> {
        if self.predicate.extract(ctx, state.clone()).await? {
            self.then.run(ctx, state).await
        } else {
            self.otherwise.run(ctx, state).await
        }
    }
}

/// A negated predicate. See [`not`].
pub struct Not<P>(P);

/// Negate `predicate`. Errors pass through.
pub fn not<P>(predicate: P) -> Not<P> {
    Not(predicate)
}

#[async_trait]
impl<S, P> Extract<S> for Not<P>
where
    S: State,
    P: Extract<S, Output = bool>,
{
    type Output = bool;

    async fn extract(&self, ctx: &Context, state: S) -> Result<bool> {
        Ok(!self.0.extract(ctx, state).await?)
    }
}

/// Several predicates combined with a short-circuiting operator. See [`and`] and [`or`].
pub struct Combined<S> {
    predicates: Vec<BoxExtract<S, bool>>,
    stop_on: bool,
}

/// `true` when every predicate is. Stops at the first `false` or error.
///
/// An empty list yields `true`.
pub fn and<S>(predicates: Vec<BoxExtract<S, bool>>) -> Combined<S> {
    Combined {
        predicates,
        stop_on: false,
    }
}

/// `true` when any predicate is. Stops at the first `true` or error.
///
/// An empty list yields `false`.
pub fn or<S>(predicates: Vec<BoxExtract<S, bool>>) -> Combined<S> {
    Combined {
        predicates,
        stop_on: true,
    }
}

#[async_trait]
impl<S: State> Extract<S> for Combined<S> {
    type Output = bool;

    async fn extract(&self, ctx: &Context, state: S) -> Result<bool> {
        for predicate in &self.predicates {
            if predicate.extract(ctx, state.clone()).await? == self.stop_on {
                return Ok(self.stop_on);
            }
        }
        Ok(!self.stop_on)
    }
}
