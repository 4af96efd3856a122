//! Rendering traces as JSON or text.

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use super::{SharedWriter, Trace, TraceEvent};
use crate::step::{Consume, State, Step};
use crate::{Context, Result};

const UNKNOWN: &str = "<unknown>";

fn error_suffix(event: &TraceEvent) -> String {
    match &event.error {
        Some(error) => format!(" [ERROR: {error}]"),
        None => String::new(),
    }
}

impl Trace {
    /// Write the events as a pretty-printed JSON array followed by a newline.
    ///
    /// Returns the number of bytes written.
    pub fn write_json<W: Write + ?Sized>(&self, w: &mut W) -> Result<u64> {
        let mut data = serde_json::to_vec_pretty(&self.events)?;
        data.push(b'\n');
        w.write_all(&data)?;
        Ok(data.len() as u64)
    }

    /// Write one line per event, indented two spaces per level below the root:
    ///
    /// ```text
    /// deploy (1.2s) [ERROR: service down]
    ///   build (300ms)
    /// ```
    pub fn write_text<W: Write + ?Sized>(&self, w: &mut W) -> Result<u64> {
        let mut written = 0;
        for event in &self.events {
            let indent = "  ".repeat(event.depth().saturating_sub(1));
            let name = event.leaf_name().unwrap_or(UNKNOWN);
            let line = format!("{indent}{name} ({:?}){}\n", event.duration, error_suffix(event));
            w.write_all(line.as_bytes())?;
            written += line.len() as u64;
        }
        Ok(written)
    }

    /// Write one line per event with the full path joined by `" > "`.
    pub fn write_flat_text<W: Write + ?Sized>(&self, w: &mut W) -> Result<u64> {
        let mut written = 0;
        for event in &self.events {
            let path = if event.names.is_empty() {
                UNKNOWN.to_string()
            } else {
                event.names.join(" > ")
            };
            let line = format!("{path} ({:?}){}\n", event.duration, error_suffix(event));
            w.write_all(line.as_bytes())?;
            written += line.len() as u64;
        }
        Ok(written)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Text,
    FlatText,
}

/// Writes a trace to a shared sink.
///
/// Runs either as a [`Step`] whose state is the [`Trace`], or as a [`Consume`] of a trace
/// at the end of a pipeline such as `with(traced(graph), write_text_to(sink))`.
#[derive(Clone)]
pub struct WriteTrace {
    format: Format,
    sink: SharedWriter,
}

/// Write the trace as a JSON array. See [`Trace::write_json`].
pub fn write_json_to<W: Write + Send + 'static>(sink: Arc<Mutex<W>>) -> WriteTrace {
    WriteTrace {
        format: Format::Json,
        sink,
    }
}

/// Write the trace as an indented tree. See [`Trace::write_text`].
pub fn write_text_to<W: Write + Send + 'static>(sink: Arc<Mutex<W>>) -> WriteTrace {
    WriteTrace {
        format: Format::Text,
        sink,
    }
}

/// Write the trace with one full path per line. See [`Trace::write_flat_text`].
pub fn write_flat_text_to<W: Write + Send + 'static>(sink: Arc<Mutex<W>>) -> WriteTrace {
    WriteTrace {
        format: Format::FlatText,
        sink,
    }
}

impl WriteTrace {
    fn write(&self, trace: &Trace) -> Result<()> {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        match self.format {
            Format::Json => trace.write_json(&mut *sink),
            Format::Text => trace.write_text(&mut *sink),
            Format::FlatText => trace.write_flat_text(&mut *sink),
        }?;
        Ok(())
    }
}

#[async_trait]
impl Step<Trace> for WriteTrace {
    async fn run(&self, _ctx: &Context, trace: Trace) -> Result<()> {
        self.write(&trace)
    }
}

#[async_trait]
impl<S: State> Consume<S, Trace> for WriteTrace {
    async fn consume(&self, _ctx: &Context, _state: S, trace: Trace) -> Result<()> {
        self.write(&trace)
    }
}
