//! Sequential execution of step lists.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{BoxStep, Extract, State, Step, StepsProvider};
use crate::{Context, Error, Result};

/// Error policy for serial execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Run every step regardless of failures and report all errors together.
    ///
    /// When `false` (the default) execution stops at the first error.
    pub join_errors: bool,
}

/// A fixed list of steps exposed as a [`StepsProvider`].
pub struct StaticSteps<S>(Vec<BoxStep<S>>);

#[async_trait]
impl<S: State> Extract<S> for StaticSteps<S> {
    type Output = Vec<BoxStep<S>>;

    async fn extract(&self, _ctx: &Context, _state: S) -> Result<Vec<BoxStep<S>>> {
        Ok(self.0.clone())
    }
}

/// Lift a fixed list of steps into a [`StepsProvider`]. See also [`steps!`](crate::steps!).
pub fn steps<S: State>(steps: Vec<BoxStep<S>>) -> StepsProvider<S> {
    std::sync::Arc::new(StaticSteps(steps))
}

/// Runs a fixed list of steps in order. See [`serial`].
pub struct Serial<S> {
    options: Options,
    steps: Vec<BoxStep<S>>,
}

/// Run `steps` one at a time in the order given, stopping at the first error.
pub fn serial<S: State>(steps: Vec<BoxStep<S>>) -> Serial<S> {
    serial_with(Options::default(), steps)
}

/// Run `steps` one at a time with an explicit error policy.
pub fn serial_with<S: State>(options: Options, steps: Vec<BoxStep<S>>) -> Serial<S> {
    Serial { options, steps }
}

#[async_trait]
impl<S: State> Step<S> for Serial<S> {
    async fn run(&self, ctx: &Context, state: S) -> Result<()> {
        let mut errors = Vec::new();
        run_all(ctx, &state, &self.steps, self.options, &mut errors).await?;
        Error::join(errors).map_or(Ok(()), Err)
    }
}

async fn run_all<S: State>(
    ctx: &Context,
    state: &S,
    steps: &[BoxStep<S>],
    options: Options,
    errors: &mut Vec<Error>,
) -> Result<()> {
    for step in steps {
        if let Err(err) = step.run(ctx, state.clone()).await {
            if !options.join_errors {
                return Err(err);
            }
            errors.push(err);
        }
    }
    Ok(())
}

/// Expands providers and runs the resulting steps in order. See [`in_serial`].
pub struct InSerial<S> {
    options: Options,
    providers: Vec<StepsProvider<S>>,
}

/// Expand each provider in turn and run its steps one at a time.
pub fn in_serial<S: State>(providers: Vec<StepsProvider<S>>) -> InSerial<S> {
    in_serial_with(Options::default(), providers)
}

/// Like [`in_serial`] with an explicit error policy.
///
/// Under the join policy a provider that fails to expand contributes its error to the
/// aggregate and its steps are skipped.
pub fn in_serial_with<S: State>(options: Options, providers: Vec<StepsProvider<S>>) -> InSerial<S> {
    InSerial { options, providers }
}

#[async_trait]
impl<S: State> Step<S> for InSerial<S> {
    async fn run(&self, ctx: &Context, state: S) -> Result<()> {
        let mut errors = Vec::new();
        for provider in &self.providers {
            let steps = match provider.extract(ctx, state.clone()).await {
                Ok(steps) => steps,
                Err(err) if self.options.join_errors => {
                    errors.push(err);
                    continue;
                }
                Err(err) => return Err(err),
            };
            run_all(ctx, &state, &steps, self.options, &mut errors).await?;
        }
        Error::join(errors).map_or(Ok(()), Err)
    }
}
