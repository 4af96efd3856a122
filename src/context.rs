//! Request-scoped context threaded through every step.
//!
//! A [`Context`] is two cheap handles: a cancellation scope and a carrier holding the
//! name stack, the active trace recorder and the logging sinks. Each combinator that adds
//! information builds a new carrier copied from the nearest one and overrides a single
//! field, so ancestors never observe the change and every lookup is one indirection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::logging::TextLogger;
use crate::step::{State, Step};
use crate::trace::TraceRecorder;
use crate::{Error, Result};

/// Cancellation state for one context layer.
///
/// Explicit cancellation travels through the token tree. Deadlines are never turned into
/// token cancellation; they are compared against the clock whenever the scope is queried.
#[derive(Debug)]
struct Scope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Scope {
    fn root() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    fn child(parent: &Scope, deadline: Option<Instant>) -> Self {
        let deadline = match (parent.deadline, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            token: parent.token.child_token(),
            deadline,
        }
    }

    fn cancel(&self) {
        self.token.cancel();
    }

    fn err(&self) -> Option<Error> {
        if self.token.is_cancelled() {
            return Some(Error::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Error::DeadlineExceeded),
            _ => None,
        }
    }
}

/// The consolidated per-layer state: trace, names and logging sinks.
#[derive(Debug, Clone)]
pub(crate) struct Carrier {
    pub(crate) trace: Option<Arc<TraceRecorder>>,
    pub(crate) names: Arc<[String]>,
    pub(crate) logger: Option<TextLogger>,
    pub(crate) dispatch: Option<tracing::Dispatch>,
}

impl Default for Carrier {
    fn default() -> Self {
        Self {
            trace: None,
            names: Arc::from(Vec::new()),
            logger: None,
            dispatch: None,
        }
    }
}

/// Context passed to every step.
///
/// Cloning is cheap and clones share cancellation. The context is immutable: methods such
/// as [`Context::with_timeout`] return a derived child and leave `self` untouched.
///
/// # Example
///
/// ```rust
/// use flowstep::Context;
///
/// let root = Context::new();
/// let (child, handle) = root.with_cancel();
/// handle.cancel();
///
/// assert!(child.is_cancelled());
/// assert!(!root.is_cancelled());
/// assert!(root.names().is_empty());
/// ```
#[derive(Clone)]
pub struct Context {
    scope: Arc<Scope>,
    carrier: Arc<Carrier>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("names", &self.carrier.names)
            .field("traced", &self.carrier.trace.is_some())
            .field("deadline", &self.scope.deadline)
            .field("cancelled", &self.scope.token.is_cancelled())
            .finish()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Create a root context: never cancelled, no names, no trace, default loggers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            scope: Arc::new(Scope::root()),
            carrier: Arc::new(Carrier::default()),
        }
    }

    fn with_scope(&self, scope: Scope) -> Self {
        Self {
            scope: Arc::new(scope),
            carrier: Arc::clone(&self.carrier),
        }
    }

    fn with_carrier(&self, carrier: Carrier) -> Self {
        Self {
            scope: Arc::clone(&self.scope),
            carrier: Arc::new(carrier),
        }
    }

    /// Derive a child that can be cancelled through the returned handle.
    ///
    /// Cancelling the parent also cancels the child; not the other way around.
    #[must_use]
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let scope = Arc::new(Scope::child(&self.scope, None));
        let handle = CancelHandle {
            scope: Arc::clone(&scope),
        };
        let ctx = Self {
            scope,
            carrier: Arc::clone(&self.carrier),
        };
        (ctx, handle)
    }

    /// Derive a child that ends automatically after `timeout`.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Context {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child that ends automatically at `deadline`.
    ///
    /// The effective deadline is the earlier of this one and any inherited deadline.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Context {
        self.with_scope(Scope::child(&self.scope, Some(deadline)))
    }

    /// The effective deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.scope.deadline
    }

    /// The reason this context ended, or `None` while it is still live.
    pub fn err(&self) -> Option<Error> {
        self.scope.err()
    }

    /// `Err` with the cancellation reason once the context has ended.
    pub fn check(&self) -> Result<()> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Returns `true` once the context was cancelled or its deadline passed.
    pub fn is_cancelled(&self) -> bool {
        self.scope.err().is_some()
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        match self.scope.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.scope.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.scope.token.cancelled().await,
        }
    }

    /// A copy of the current name path, outermost first. Empty when no names are set.
    pub fn names(&self) -> Vec<String> {
        self.carrier.names.to_vec()
    }

    pub(crate) fn dotted_name(&self) -> String {
        if self.carrier.names.is_empty() {
            "<unknown>".to_string()
        } else {
            self.carrier.names.join(".")
        }
    }

    /// The plain-text logger installed for this subtree, or the process default.
    pub fn logger(&self) -> TextLogger {
        match &self.carrier.logger {
            Some(logger) => logger.clone(),
            None => TextLogger::global(),
        }
    }

    /// The structured logging dispatcher installed for this subtree, or the current default.
    pub fn dispatch(&self) -> tracing::Dispatch {
        match &self.carrier.dispatch {
            Some(dispatch) => dispatch.clone(),
            None => tracing::dispatcher::get_default(|dispatch| dispatch.clone()),
        }
    }

    pub(crate) fn trace(&self) -> Option<&Arc<TraceRecorder>> {
        self.carrier.trace.as_ref()
    }

    pub(crate) fn with_name(&self, name: &str) -> Context {
        let mut names = Vec::with_capacity(self.carrier.names.len() + 1);
        names.extend(self.carrier.names.iter().cloned());
        names.push(name.to_string());
        self.with_carrier(Carrier {
            names: names.into(),
            ..(*self.carrier).clone()
        })
    }

    pub(crate) fn with_trace(&self, trace: Arc<TraceRecorder>) -> Context {
        self.with_carrier(Carrier {
            trace: Some(trace),
            ..(*self.carrier).clone()
        })
    }

    pub(crate) fn with_logger(&self, logger: TextLogger) -> Context {
        self.with_carrier(Carrier {
            logger: Some(logger),
            ..(*self.carrier).clone()
        })
    }

    pub(crate) fn with_dispatch(&self, dispatch: tracing::Dispatch) -> Context {
        self.with_carrier(Carrier {
            dispatch: Some(dispatch),
            ..(*self.carrier).clone()
        })
    }
}

/// Cancels the context returned alongside it by [`Context::with_cancel`].
#[derive(Debug, Clone)]
pub struct CancelHandle {
    scope: Arc<Scope>,
}

impl CancelHandle {
    /// Cancel the associated context and everything derived from it.
    pub fn cancel(&self) {
        self.scope.cancel();
    }
}

/// Runs a step under a derived context with a timeout. See [`with_timeout`].
pub struct WithTimeout<X> {
    timeout: Duration,
    inner: X,
}

/// Run `inner` with a context that ends after `timeout`.
///
/// A step that observes the context will return [`Error::DeadlineExceeded`].
pub fn with_timeout<X>(timeout: Duration, inner: X) -> WithTimeout<X> {
    WithTimeout { timeout, inner }
}

#[async_trait]
impl<S, X> Step<S> for WithTimeout<X>
where
    S: State,
    X: Step<S>,
{
    async fn run(&self, ctx: &Context, state: S) -> Result<()> {
        let ctx = ctx.with_timeout(self.timeout);
        self.inner.run(&ctx, state).await
    }
}

/// Runs a step under a derived context with an absolute deadline. See [`with_deadline`].
pub struct WithDeadline<X> {
    deadline: Instant,
    inner: X,
}

/// Run `inner` with a context that ends at `deadline`.
pub fn with_deadline<X>(deadline: Instant, inner: X) -> WithDeadline<X> {
    WithDeadline { deadline, inner }
}

#[async_trait]
impl<S, X> Step<S> for WithDeadline<X>
where
    S: State,
    X: Step<S>,
{
    async fn run(&self, ctx: &Context, state: S) -> Result<()> {
        let ctx = ctx.with_deadline(self.deadline);
        self.inner.run(&ctx, state).await
    }
}

/// A step that pauses. See [`sleep`].
#[derive(Debug, Clone, Copy)]
pub struct Sleep {
    duration: Duration,
}

/// A step that waits for `duration`, or fails with the cancellation error if the
/// context ends first.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep { duration }
}

#[async_trait]
impl<S: State> Step<S> for Sleep {
    async fn run(&self, ctx: &Context, _state: S) -> Result<()> {
        ctx.check()?;
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(ctx.err().unwrap_or(Error::Cancelled)),
            _ = tokio::time::sleep(self.duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Counter;

    #[test]
    fn test_carrier_extension_does_not_leak_to_parent() {
        let root = Context::new();
        let a = root.with_name("a");
        let ab = a.with_name("b");

        assert!(root.names().is_empty());
        assert_eq!(a.names(), vec!["a"]);
        assert_eq!(ab.names(), vec!["a", "b"]);
        assert_eq!(ab.dotted_name(), "a.b");
        assert_eq!(root.dotted_name(), "<unknown>");
    }

    #[test]
    fn test_carrier_inherits_unset_fields() {
        let logger = TextLogger::new(Vec::new()).with_prefix("x: ");
        let ctx = Context::new().with_logger(logger).with_name("a");
        let child = ctx.with_cancel().0.with_name("b");

        assert_eq!(child.logger().prefix(), "x: ");
        assert_eq!(child.names(), vec!["a", "b"]);
    }

    #[test]
    fn test_names_returns_independent_copy() {
        let ctx = Context::new().with_name("a");
        let mut names = ctx.names();
        names.push("mutated".into());
        assert_eq!(ctx.names(), vec!["a"]);
    }

    #[test]
    fn test_cancel_propagates_downward_only() {
        let root = Context::new();
        let (parent, parent_handle) = root.with_cancel();
        let (child, child_handle) = parent.with_cancel();

        child_handle.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let (child2, _h) = parent.with_cancel();
        parent_handle.cancel();
        assert!(matches!(child2.err(), Some(Error::Cancelled)));
        assert!(!root.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_deadline_exceeded() {
        let ctx = Context::new().with_timeout(Duration::from_millis(50));
        assert!(ctx.check().is_ok());
        ctx.cancelled().await;
        assert!(matches!(ctx.err(), Some(Error::DeadlineExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_deadline_causes() {
        let expired = Context::new().with_timeout(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (child, handle) = expired.with_cancel();
        assert!(matches!(child.err(), Some(Error::DeadlineExceeded)));
        handle.cancel();
        assert!(matches!(child.err(), Some(Error::Cancelled)));
        assert!(matches!(expired.err(), Some(Error::DeadlineExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_inherits_earlier_deadline() {
        let parent = Context::new().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_step_respects_timeout() {
        let step = with_timeout(Duration::from_millis(20), sleep(Duration::from_secs(10)));
        let err = step.run(&Context::new(), Counter::default()).await.unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_step_completes() {
        let step = sleep(Duration::from_millis(5));
        assert!(step.run(&Context::new(), Counter::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_sleep_on_cancelled_context_fails_immediately() {
        let (ctx, handle) = Context::new().with_cancel();
        handle.cancel();
        let err = Step::<Counter>::run(&sleep(Duration::from_secs(10)), &ctx, Counter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
