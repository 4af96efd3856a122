//! # flowstep
//!
//! Composable async steps for in-process workflows.
//!
//! Small units of work are assembled into larger control flow by nesting combinators:
//! sequencing, bounded parallel fan-out, conditionals, retries with backoff, and
//! hierarchical naming with optional execution tracing. A built graph is an ordinary value
//! and can be run any number of times.
//!
//! ## Core Concepts
//!
//! - **Step**: `(context, state) -> Result<()>`, the unit everything composes into
//! - **Extract / Transform / Consume**: producer, mapping and sink shapes glued by
//!   [`pipeline`], [`with`], [`from`], [`feed`] and [`chain`]
//! - **Context**: cancellation, deadlines, the name path, the active trace and loggers
//! - **serial / in_serial / in_parallel**: run step lists fail-fast or joining errors
//! - **Retry**: re-run on failure while predicates such as [`UpTo`] and
//!   [`ExponentialBackoff`] approve
//! - **Named / traced**: attribute errors to scopes and record a [`Trace`] of a run
//!
//! ## Example
//!
//! ```rust
//! use std::sync::atomic::{AtomicI64, Ordering};
//! use std::sync::Arc;
//! use flowstep::{in_parallel, named, step, steps, traced, Context, StepExt, UpTo};
//!
//! fn add(n: i64) -> impl flowstep::Step<Arc<AtomicI64>> {
//!     step(move |_ctx, total: Arc<AtomicI64>| async move {
//!         total.fetch_add(n, Ordering::SeqCst);
//!         Ok(())
//!     })
//! }
//!
//! # tokio_test::block_on(async {
//! let graph = named(
//!     "sum",
//!     in_parallel(vec![steps![
//!         add(15).named("a"),
//!         add(-5).named("b"),
//!         add(21).retry().when(UpTo(3)).named("c"),
//!     ]]),
//! );
//!
//! let total = Arc::new(AtomicI64::new(0));
//! let (trace, result) = traced(graph).run_traced(&Context::new(), total.clone()).await;
//!
//! result.unwrap();
//! assert_eq!(total.load(Ordering::SeqCst), 31);
//! assert_eq!(trace.total_steps, 4);
//! # });
//! ```

pub mod context;
pub mod error;
pub mod logging;
pub mod names;
pub mod retry;
pub mod step;
pub mod trace;

#[cfg(test)]
mod testing;

pub use context::{sleep, with_deadline, with_timeout, CancelHandle, Context};
pub use error::{Error, RecoveredPanic, Result};
pub use logging::{with_dispatch, with_logger, with_logging, with_structured_logging, TextLogger};
pub use names::{named, Named};
pub use retry::{
    retry, BoxRetryPredicate, ExponentialBackoff, FixedBackoff, Jitter, OnlyIf, Retry,
    RetryPredicate, UpTo,
};
pub use trace::filter::TraceFilter;
pub use trace::output::{write_flat_text_to, write_json_to, write_text_to};
pub use trace::{traced, Trace, TraceEvent, TraceRecorder, Traced};

// Re-export step types
pub use step::branch::{and, branch, not, or, repeat_while, unless, when};
pub use step::chain::{chain, chain3, chain4, feed, from, pipeline, spawn, value, with};
pub use step::map::{apply, collect, flatten, for_each, map, render};
pub use step::parallel::{in_parallel, in_parallel_with, ParallelOptions};
pub use step::recover::{fallback_to, ignore_error, on_error, recover_panics};
pub use step::serial::{in_serial, in_serial_with, serial, serial_with, steps, Options};
pub use step::{
    consume, extract, step, transform, BoxConsume, BoxExtract, BoxStep, BoxTransform, Consume,
    Extract, State, Step, StepExt, StepsProvider, Transform,
};

/// Build a [`StepsProvider`] from a fixed list of steps of any types.
///
/// ```rust
/// use flowstep::{in_serial, step, steps, Context, Step};
///
/// let noop = || step(|_ctx, _: ()| async move { Ok(()) });
/// let run = in_serial(vec![steps![noop(), noop()]]);
/// tokio_test::block_on(run.run(&Context::new(), ())).unwrap();
/// ```
#[macro_export]
macro_rules! steps {
    ($($step:expr),* $(,)?) => {
        $crate::steps(vec![$($crate::StepExt::boxed($step)),*])
    };
}
