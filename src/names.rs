//! Named scopes.
//!
//! Wrapping any of the four shapes in [`Named`] pushes a name onto the context's name path
//! for the duration of the call. Failures are attributed with [`Error::Named`], and when a
//! trace is being recorded each call becomes one [`TraceEvent`](crate::TraceEvent) keyed by
//! the full path. Unnamed steps never show up in a trace.

use std::sync::Arc;

use async_trait::async_trait;

use crate::step::{Consume, Extract, State, Step, Transform};
use crate::trace::{EventId, TraceRecorder};
use crate::{Context, Error, Result};

/// A callable running inside a named scope. See [`named`].
pub struct Named<X> {
    name: String,
    inner: X,
}

/// Run `inner` inside a scope called `name`.
///
/// # Example
///
/// ```rust
/// use flowstep::{named, step, Context, Step};
///
/// let probe = step(|ctx: Context, _: ()| async move {
///     assert_eq!(ctx.names(), vec!["outer", "inner"]);
///     Ok(())
/// });
/// let nested = named("outer", named("inner", probe));
///
/// tokio_test::block_on(nested.run(&Context::new(), ())).unwrap();
/// ```
pub fn named<X>(name: impl Into<String>, inner: X) -> Named<X> {
    Named::new(name, inner)
}

struct Entered {
    ctx: Context,
    event: Option<(Arc<TraceRecorder>, EventId)>,
}

impl<X> Named<X> {
    /// Wrap `inner` in a scope called `name`.
    pub fn new(name: impl Into<String>, inner: X) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }

    /// The unqualified name of this scope.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn enter(&self, ctx: &Context) -> Entered {
        let ctx = ctx.with_name(&self.name);
        let event = ctx
            .trace()
            .map(|trace| (Arc::clone(trace), trace.start_event(ctx.names())));
        Entered { ctx, event }
    }

    fn exit<T>(&self, entered: Entered, result: Result<T>) -> Result<T> {
        if let Some((trace, id)) = entered.event {
            trace.finish_event(id, result.as_ref().err());
        }
        result.map_err(|err| Error::named(self.name.clone(), err))
    }
}

#[async_trait]
impl<S: State, X: Step<S>> Step<S> for Named<X> {
    async fn run(&self, ctx: &Context, state: S) -> Result<()> {
        let entered = self.enter(ctx);
        let result = self.inner.run(&entered.ctx, state).await;
        self.exit(entered, result)
    }
}

#[async_trait]
impl<S: State, X: Extract<S>> Extract<S> for Named<X> {
    type Output = X::Output;

    async fn extract(&self, ctx: &Context, state: S) -> Result<X::Output> {
        let entered = self.enter(ctx);
        let result = self.inner.extract(&entered.ctx, state).await;
        self.exit(entered, result)
    }
}

#[async_trait]
impl<S, I, X> Transform<S, I> for Named<X>
where
    S: State,
    I: Send + 'static,
    X: Transform<S, I>,
{
    type Output = X::Output;

    async fn transform(&self, ctx: &Context, state: S, input: I) -> Result<X::Output> {
        let entered = self.enter(ctx);
        let result = self.inner.transform(&entered.ctx, state, input).await;
        self.exit(entered, result)
    }
}

#[async_trait]
impl<S, I, X> Consume<S, I> for Named<X>
where
    S: State,
    I: Send + 'static,
    X: Consume<S, I>,
{
    async fn consume(&self, ctx: &Context, state: S, input: I) -> Result<()> {
        let entered = self.enter(ctx);
        let result = self.inner.consume(&entered.ctx, state, input).await;
        self.exit(entered, result)
    }
}

/// Reduce a `type_name` path produced by [`function_name!`](crate::function_name) to the bare
/// function or method name.
///
/// Closure segments are skipped, so a name taken inside a closure reports the function that
/// defines it.
#[doc(hidden)]
pub fn short_function_name(path: &'static str) -> &'static str {
    let path = path.strip_suffix("::__here").unwrap_or(path);
    path.rsplit("::")
        .find(|segment| !segment.starts_with("{{"))
        .unwrap_or(path)
}

/// The bare name of the enclosing function, as a `&'static str`.
///
/// Methods report only the method name, without the type.
#[macro_export]
macro_rules! function_name {
    () => {{
        fn __here() {}
        fn type_name_of<T>(_: T) -> &'static str {
            ::std::any::type_name::<T>()
        }
        $crate::names::short_function_name(type_name_of(__here))
    }};
}

/// Wrap a callable in a [`Named`] scope called after the enclosing function.
///
/// A helper that builds and returns a step gets its own name:
///
/// ```rust
/// use flowstep::{auto_named, step, Context, Named, Step};
///
/// fn deploy_service() -> Named<impl Step<()>> {
///     auto_named!(step(|_ctx, _: ()| async move { Err("boom".into()) }))
/// }
///
/// let service = deploy_service();
/// assert_eq!(service.name(), "deploy_service");
///
/// let err = tokio_test::block_on(service.run(&Context::new(), ())).unwrap_err();
/// assert_eq!(err.name(), Some("deploy_service"));
/// ```
///
/// Since this is a macro, a wrapper that should report *its* caller's name instead of its
/// own can be written as a macro too, and the expansion lands in the caller.
#[macro_export]
macro_rules! auto_named {
    ($inner:expr) => {
        $crate::Named::new($crate::function_name!(), $inner)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{extract, step, StepExt};
    use crate::testing::{fail_with, increment, Counter, Sentinel};
    use crate::{in_parallel, steps, traced};

    fn probe(seen: Arc<std::sync::Mutex<Vec<String>>>) -> impl Step<Counter> {
        step(move |ctx: Context, _c: Counter| {
            let seen = Arc::clone(&seen);
            async move {
                let mut names = ctx.names();
                *seen.lock().unwrap() = names.clone();
                names.push("mutated".to_string());
                assert_eq!(ctx.names().len(), names.len() - 1);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_name_path_round_trip() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let nested = named("outer", named("middle", named("inner", probe(Arc::clone(&seen)))));
        nested.run(&Context::new(), Counter::default()).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["outer", "middle", "inner"]);
    }

    #[tokio::test]
    async fn test_errors_nest_names_outermost_last() {
        let err = named("outer", named("inner", fail_with(Sentinel::One)))
            .run(&Context::new(), Counter::default())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "outer: inner: error 1");
        assert_eq!(err.name(), Some("outer"));
        assert!(err.is(&Sentinel::One));
    }

    #[tokio::test]
    async fn test_named_extract_attributes_errors() {
        let failing = extract(|_ctx, _c: Counter| async move { Err::<u8, _>(Error::other(Sentinel::Two)) });
        let err = named("reader", failing)
            .extract(&Context::new(), Counter::default())
            .await
            .unwrap_err();
        assert_eq!(err.name(), Some("reader"));
    }

    #[tokio::test]
    async fn test_siblings_do_not_see_each_other() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let graph = named(
            "root",
            in_parallel(vec![steps![
                increment(1).named("a"),
                named("b", probe(Arc::clone(&seen))),
            ]]),
        );
        graph.run(&Context::new(), Counter::default()).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["root", "b"]);
    }

    #[tokio::test]
    async fn test_unnamed_steps_are_not_traced() {
        let graph = named("only", crate::serial(vec![increment(1).boxed(), increment(2).boxed()]));
        let (trace, result) = traced(graph).run_traced(&Context::new(), Counter::default()).await;
        result.unwrap();
        assert_eq!(trace.total_steps, 1);
        assert_eq!(trace.events[0].names, vec!["only"]);
    }

    #[test]
    fn test_short_function_name() {
        assert_eq!(short_function_name("my_crate::deploy::run_service::__here"), "run_service");
        assert_eq!(short_function_name("my_crate::Deployer::start::{{closure}}::__here"), "start");
        assert_eq!(short_function_name("plain"), "plain");
    }

    fn build_named_step() -> Named<impl Step<Counter>> {
        crate::auto_named!(increment(1))
    }

    #[test]
    fn test_auto_named_uses_enclosing_function() {
        assert_eq!(build_named_step().name(), "build_named_step");
        let inline = crate::auto_named!(increment(1));
        assert_eq!(inline.name(), "test_auto_named_uses_enclosing_function");
    }

    #[tokio::test]
    async fn test_auto_named_in_nested_helper() {
        fn deploy_service() -> Named<impl Step<Counter>> {
            crate::auto_named!(fail_with(Sentinel::Three))
        }

        let err = deploy_service()
            .run(&Context::new(), Counter::default())
            .await
            .unwrap_err();
        assert_eq!(err.name(), Some("deploy_service"));
        assert!(err.is(&Sentinel::Three));
    }
}
