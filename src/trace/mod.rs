//! Execution tracing.
//!
//! [`traced`] installs a [`TraceRecorder`] for one run. Every [`Named`](crate::Named) scope
//! entered during that run appends a [`TraceEvent`] when it starts and fills in the duration
//! and error when it finishes. Parallel branches share the recorder; each event's slot is
//! fixed when it is created, so concurrent finishers never touch each other's entries.
//!
//! Events are kept in creation order, which only approximates start order under
//! contention. Sort by [`TraceEvent::start`] when exact ordering matters.

use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::step::{Extract, State, Step};
use crate::{Context, Error, Result};

pub mod filter;
pub mod output;

/// A shared destination for trace output.
pub type SharedWriter = Arc<Mutex<dyn Write + Send>>;

/// One named scope entered during a traced run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// The full name path at the time the scope was entered, outermost first.
    #[serde(rename = "step_names")]
    pub names: Vec<String>,
    /// Wall-clock start time.
    pub start: DateTime<Utc>,
    /// Time spent inside the scope.
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    /// The error message, with name attributions removed, if the scope failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TraceEvent {
    /// The innermost name, if the path is not empty.
    pub fn leaf_name(&self) -> Option<&str> {
        self.names.last().map(String::as_str)
    }

    /// Nesting depth: the length of the name path.
    pub fn depth(&self) -> usize {
        self.names.len()
    }
}

/// The result of a traced run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    /// Recorded events in creation order.
    pub events: Vec<TraceEvent>,
    /// When recording started.
    pub start: DateTime<Utc>,
    /// Total wall-clock duration of the traced run.
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    /// Number of events.
    pub total_steps: usize,
    /// Number of events with an error.
    pub total_errors: usize,
}

impl Trace {
    /// An empty trace starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start: Utc::now(),
            duration: Duration::ZERO,
            total_steps: 0,
            total_errors: 0,
        }
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

/// Index of an event inside its recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventId(usize);

struct Recording {
    trace: Trace,
    started: Vec<Instant>,
}

/// Thread-safe event sink for one traced run.
pub struct TraceRecorder {
    recording: Mutex<Recording>,
    stream: Option<SharedWriter>,
}

impl fmt::Debug for TraceRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let recording = self.recording.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("TraceRecorder")
            .field("total_steps", &recording.trace.total_steps)
            .field("streaming", &self.stream.is_some())
            .finish()
    }
}

impl TraceRecorder {
    /// Create a recorder. With a stream, each finished event is also written there as one
    /// line of JSON.
    pub fn new(stream: Option<SharedWriter>) -> Self {
        Self {
            recording: Mutex::new(Recording {
                trace: Trace::new(),
                started: Vec::new(),
            }),
            stream,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recording> {
        self.recording.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an event for a scope entered now and return its slot.
    pub fn start_event(&self, names: Vec<String>) -> EventId {
        let mut recording = self.lock();
        let id = EventId(recording.trace.events.len());
        recording.trace.events.push(TraceEvent {
            names,
            start: Utc::now(),
            duration: Duration::ZERO,
            error: None,
        });
        recording.started.push(Instant::now());
        recording.trace.total_steps += 1;
        id
    }

    /// Fill in the duration and error for the event in slot `id`.
    pub fn finish_event(&self, id: EventId, error: Option<&Error>) {
        let finished = {
            let mut recording = self.lock();
            let Recording { trace, started } = &mut *recording;
            let (Some(event), Some(started)) = (trace.events.get_mut(id.0), started.get(id.0)) else {
                return;
            };
            event.duration = started.elapsed();
            if let Some(err) = error {
                event.error = Some(err.strip_names().to_string());
                trace.total_errors += 1;
            }
            event.clone()
        };
        if let Some(stream) = &self.stream {
            if let Err(err) = stream_event(stream, &finished) {
                warn!(error = %err, "failed to stream trace event");
            }
        }
    }

    /// A copy of everything recorded so far.
    pub fn snapshot(&self) -> Trace {
        self.lock().trace.clone()
    }

    fn finish(&self, duration: Duration) -> Trace {
        let mut trace = self.snapshot();
        trace.duration = duration;
        if let Some(stream) = &self.stream {
            let mut writer = stream.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(err) = writer.flush() {
                warn!(error = %err, "failed to flush trace stream");
            }
        }
        trace
    }
}

fn stream_event(stream: &SharedWriter, event: &TraceEvent) -> Result<()> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    let mut writer = stream.lock().unwrap_or_else(PoisonError::into_inner);
    writer.write_all(&line)?;
    Ok(())
}

/// A step run with a fresh trace recorder. See [`traced`].
pub struct Traced<X> {
    inner: X,
    stream: Option<SharedWriter>,
}

/// Record a trace of every named scope entered while `step` runs.
///
/// # Example
///
/// ```rust
/// use flowstep::{named, step, traced, Context};
///
/// let graph = named("build", named("compile", step(|_ctx, _: ()| async move { Ok(()) })));
///
/// let (trace, result) = tokio_test::block_on(traced(graph).run_traced(&Context::new(), ()));
/// result.unwrap();
/// assert_eq!(trace.total_steps, 2);
/// assert_eq!(trace.events[1].names, vec!["build", "compile"]);
/// ```
pub fn traced<X>(step: X) -> Traced<X> {
    Traced {
        inner: step,
        stream: None,
    }
}

impl<X> Traced<X> {
    /// Also write each event as one line of JSON to `sink` the moment it finishes.
    ///
    /// Write failures are logged and otherwise ignored.
    pub fn stream_to<W: Write + Send + 'static>(mut self, sink: Arc<Mutex<W>>) -> Self {
        let sink: SharedWriter = sink;
        self.stream = Some(sink);
        self
    }

    /// Run the step and return the trace together with the step's result.
    ///
    /// The trace is returned even when the step fails.
    pub async fn run_traced<S>(&self, ctx: &Context, state: S) -> (Trace, Result<()>)
    where
        S: State,
        X: Step<S>,
    {
        let recorder = Arc::new(TraceRecorder::new(self.stream.clone()));
        let ctx = ctx.with_trace(Arc::clone(&recorder));
        let started = Instant::now();
        let result = self.inner.run(&ctx, state).await;
        (recorder.finish(started.elapsed()), result)
    }
}

#[async_trait]
impl<S: State, X: Step<S>> Extract<S> for Traced<X> {
    type Output = Trace;

    /// Yields the trace on success. Use [`Traced::run_traced`] to keep it on failure.
    async fn extract(&self, ctx: &Context, state: S) -> Result<Trace> {
        let (trace, result) = self.run_traced(ctx, state).await;
        result.map(|()| trace)
    }
}

mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        serializer.serialize_u64(nanos)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_nanos)
    }
}
