//! Querying recorded traces.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use glob::{MatchOptions, Pattern};

use super::{Trace, TraceEvent};

/// A predicate over trace events. Filters passed together are AND-combined.
#[derive(Clone)]
pub struct TraceFilter(Arc<dyn Fn(&TraceEvent) -> bool + Send + Sync>);

impl fmt::Debug for TraceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TraceFilter")
    }
}

impl TraceFilter {
    /// Build a filter from any predicate.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&TraceEvent) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Test one event.
    pub fn matches(&self, event: &TraceEvent) -> bool {
        (self.0)(event)
    }
}

fn matches_all(filters: &[TraceFilter], event: &TraceEvent) -> bool {
    filters.iter().all(|filter| filter.matches(event))
}

impl Trace {
    /// A new, independent trace holding only the events that match every filter.
    ///
    /// Totals and duration are recomputed from the kept events; the duration is their sum.
    /// The start is the earliest kept start, or this trace's start if nothing matched.
    pub fn filter(&self, filters: &[TraceFilter]) -> Trace {
        let events: Vec<TraceEvent> = self
            .events
            .iter()
            .filter(|event| matches_all(filters, event))
            .cloned()
            .collect();

        Trace {
            start: events.iter().map(|e| e.start).min().unwrap_or(self.start),
            duration: events.iter().map(|e| e.duration).sum(),
            total_steps: events.len(),
            total_errors: events.iter().filter(|e| e.error.is_some()).count(),
            events,
        }
    }

    /// The first recorded event matching every filter.
    pub fn find_event(&self, filters: &[TraceFilter]) -> Option<&TraceEvent> {
        self.events.iter().find(|event| matches_all(filters, event))
    }
}

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Merge runs of `*` into one. A single `*` already spans any run of non-separators, and
/// `glob` only accepts `**` as a whole path component.
fn collapse_stars(pattern: &str) -> String {
    let mut collapsed = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if c != '*' || !collapsed.ends_with('*') {
            collapsed.push(c);
        }
    }
    collapsed
}

/// A glob test that never matches when the pattern is malformed.
fn glob(pattern: &str) -> impl Fn(&str) -> bool + Send + Sync + 'static {
    let pattern = Pattern::new(&collapse_stars(pattern)).ok();
    move |text| {
        pattern
            .as_ref()
            .is_some_and(|p| p.matches_with(text, GLOB_OPTIONS))
    }
}

/// Events that took at least `d`.
pub fn min_duration(d: Duration) -> TraceFilter {
    TraceFilter::new(move |e| e.duration >= d)
}

/// Events that took at most `d`.
pub fn max_duration(d: Duration) -> TraceFilter {
    TraceFilter::new(move |e| e.duration <= d)
}

/// Events that failed.
pub fn has_error() -> TraceFilter {
    TraceFilter::new(|e| e.error.is_some())
}

/// Events that succeeded.
pub fn no_error() -> TraceFilter {
    TraceFilter::new(|e| e.error.is_none())
}

/// Events whose leaf name matches a glob pattern.
pub fn name_matches(pattern: &str) -> TraceFilter {
    let matches = glob(pattern);
    TraceFilter::new(move |e| e.leaf_name().is_some_and(&matches))
}

/// Events whose leaf name starts with `prefix`.
pub fn name_prefix(prefix: impl Into<String>) -> TraceFilter {
    let prefix = prefix.into();
    TraceFilter::new(move |e| e.leaf_name().is_some_and(|name| name.starts_with(&prefix)))
}

/// Events whose dot-joined path matches a glob pattern.
pub fn path_matches(pattern: &str) -> TraceFilter {
    let matches = glob(pattern);
    TraceFilter::new(move |e| !e.names.is_empty() && matches(e.names.join(".").as_str()))
}

/// Events whose path begins with the segments in `prefix`.
pub fn has_path_prefix<I, T>(prefix: I) -> TraceFilter
where
    I: IntoIterator<Item = T>,
    T: Into<String>,
{
    let prefix: Vec<String> = prefix.into_iter().map(Into::into).collect();
    TraceFilter::new(move |e| e.names.starts_with(&prefix))
}

/// Events nested exactly `depth` names deep. Zero matches nothing.
pub fn depth_equals(depth: usize) -> TraceFilter {
    TraceFilter::new(move |e| depth > 0 && e.depth() == depth)
}

/// Events nested at most `depth` names deep. Zero matches nothing.
pub fn depth_at_most(depth: usize) -> TraceFilter {
    TraceFilter::new(move |e| depth > 0 && e.depth() <= depth)
}

/// Events that started within `[start, end]`.
pub fn time_range(start: DateTime<Utc>, end: DateTime<Utc>) -> TraceFilter {
    TraceFilter::new(move |e| e.start >= start && e.start <= end)
}

/// Failed events whose error message matches a glob pattern.
pub fn error_matches(pattern: &str) -> TraceFilter {
    let matches = glob(pattern);
    TraceFilter::new(move |e| e.error.as_deref().is_some_and(&matches))
}
