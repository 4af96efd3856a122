//! Logging sinks carried in the context, and decorators that log step boundaries.
//!
//! Two sinks travel with every [`Context`]: a plain-text [`TextLogger`] and a structured
//! [`tracing::Dispatch`]. Both default to process-wide values and can be replaced for a
//! subtree with [`with_logger`] and [`with_dispatch`].

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, Level};

use crate::step::{State, Step};
use crate::trace::SharedWriter;
use crate::{Context, Result};

/// A line-oriented text logger writing to a shared sink.
///
/// Each line is `<prefix><timestamp><message>`; the timestamp is local time in
/// `YYYY/MM/DD HH:MM:SS` form and can be turned off.
#[derive(Clone)]
pub struct TextLogger {
    sink: SharedWriter,
    prefix: Arc<str>,
    timestamps: bool,
}

impl fmt::Debug for TextLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextLogger")
            .field("prefix", &self.prefix)
            .field("timestamps", &self.timestamps)
            .finish()
    }
}

impl TextLogger {
    /// Log to `writer`.
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self::shared(Arc::new(Mutex::new(writer)))
    }

    /// Log to a sink that is also used elsewhere.
    pub fn shared<W: Write + Send + 'static>(sink: Arc<Mutex<W>>) -> Self {
        Self {
            sink,
            prefix: Arc::from(""),
            timestamps: true,
        }
    }

    /// Log to standard error.
    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }

    /// The process-wide default logger, writing to standard error.
    pub fn global() -> Self {
        static GLOBAL: OnceLock<TextLogger> = OnceLock::new();
        GLOBAL.get_or_init(TextLogger::stderr).clone()
    }

    /// Start every line with `prefix`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Arc::from(prefix.into());
        self
    }

    /// Omit timestamps.
    pub fn without_timestamps(mut self) -> Self {
        self.timestamps = false;
        self
    }

    /// The line prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Write one line. Write failures are reported through `tracing` and otherwise ignored.
    pub fn log(&self, message: impl fmt::Display) {
        let mut line = String::from(&*self.prefix);
        if self.timestamps {
            line.push_str(&chrono::Local::now().format("%Y/%m/%d %H:%M:%S ").to_string());
        }
        line.push_str(&message.to_string());
        line.push('\n');

        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = sink.write_all(line.as_bytes()) {
            tracing::warn!(error = %err, "failed to write log line");
        }
    }
}

/// Runs a step with a replacement text logger. See [`with_logger`].
pub struct WithLogger<X> {
    logger: TextLogger,
    inner: X,
}

/// Install `logger` for `step` and everything nested beneath it.
pub fn with_logger<X>(logger: TextLogger, step: X) -> WithLogger<X> {
    WithLogger { logger, inner: step }
}

#[async_trait]
impl<S: State, X: Step<S>> Step<S> for WithLogger<X> {
    async fn run(&self, ctx: &Context, state: S) -> Result<()> {
        let ctx = ctx.with_logger(self.logger.clone());
        self.inner.run(&ctx, state).await
    }
}

/// Runs a step with a replacement structured dispatcher. See [`with_dispatch`].
pub struct WithDispatch<X> {
    dispatch: Dispatch,
    inner: X,
}

/// Install `dispatch` for `step` and everything nested beneath it.
///
/// Besides being returned by [`Context::dispatch`], the dispatcher becomes the default
/// while the step runs, so plain `tracing` macros inside it are routed there too.
pub fn with_dispatch<X>(dispatch: impl Into<Dispatch>, step: X) -> WithDispatch<X> {
    WithDispatch {
        dispatch: dispatch.into(),
        inner: step,
    }
}

#[async_trait]
impl<S: State, X: Step<S>> Step<S> for WithDispatch<X> {
    async fn run(&self, ctx: &Context, state: S) -> Result<()> {
        let ctx = ctx.with_dispatch(self.dispatch.clone());
        self.inner
            .run(&ctx, state)
            .with_subscriber(self.dispatch.clone())
            .await
    }
}

/// Logs step start and finish to the text logger. See [`with_logging`].
pub struct WithLogging<X> {
    inner: X,
}

/// Log `[a.b.c] starting step` and `[a.b.c] finished step (took <duration>)` around
/// `step`, using the current name path and [`Context::logger`].
pub fn with_logging<X>(step: X) -> WithLogging<X> {
    WithLogging { inner: step }
}

#[async_trait]
impl<S: State, X: Step<S>> Step<S> for WithLogging<X> {
    async fn run(&self, ctx: &Context, state: S) -> Result<()> {
        let name = ctx.dotted_name();
        let logger = ctx.logger();

        logger.log(format_args!("[{name}] starting step"));
        let started = Instant::now();
        let result = self.inner.run(ctx, state).await;
        logger.log(format_args!("[{name}] finished step (took {:?})", started.elapsed()));
        result
    }
}

/// Logs step start and finish as structured events. See [`with_structured_logging`].
pub struct WithStructuredLogging<X> {
    level: Level,
    inner: X,
}

/// Emit `starting step` and `finished step` events at `level` around `step`, through
/// [`Context::dispatch`]. Both carry a `name` field; the second adds `duration_ms`.
pub fn with_structured_logging<X>(level: Level, step: X) -> WithStructuredLogging<X> {
    WithStructuredLogging { level, inner: step }
}

macro_rules! event_at {
    ($level:expr, $($args:tt)+) => {
        match $level {
            Level::ERROR => tracing::error!($($args)+),
            Level::WARN => tracing::warn!($($args)+),
            Level::INFO => tracing::info!($($args)+),
            Level::DEBUG => tracing::debug!($($args)+),
            _ => tracing::trace!($($args)+),
        }
    };
}

#[async_trait]
impl<S: State, X: Step<S>> Step<S> for WithStructuredLogging<X> {
    async fn run(&self, ctx: &Context, state: S) -> Result<()> {
        let name = ctx.dotted_name();
        let dispatch = ctx.dispatch();

        tracing::dispatcher::with_default(&dispatch, || {
            event_at!(self.level, name = %name, "starting step")
        });
        let started = Instant::now();
        let result = self.inner.run(ctx, state).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::dispatcher::with_default(&dispatch, || {
            event_at!(self.level, name = %name, duration_ms, "finished step")
        });
        result
    }
}
