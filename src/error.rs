//! Error types for step execution.
//!
//! Combinators forward the error produced by the failing stage unchanged. Only the
//! attribution wrappers ([`Error::Named`], [`Error::Indexed`]), the panic wrapper
//! ([`Error::Panic`]) and the aggregate ([`Error::Joined`]) add structure, and all of
//! them can be searched through with [`Error::any`], [`Error::find`] and [`Error::is`].

use std::any::Any;
use std::error::Error as StdError;

use thiserror::Error;

/// A panic captured by [`recover_panics`](crate::recover_panics) and turned into an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("panic recovered: {value}")]
pub struct RecoveredPanic {
    /// The panic payload rendered as text.
    pub value: String,
}

impl RecoveredPanic {
    /// Build from a payload returned by `catch_unwind` or a panicked task.
    pub fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let value = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        Self { value }
    }
}

/// The main error type for step execution.
#[derive(Error, Debug)]
pub enum Error {
    /// A named scope failed. Nested names produce nested wrappers, outermost last.
    #[error("{name}: {source}")]
    Named {
        /// The unqualified name of the scope that failed.
        name: String,
        /// The error produced inside the scope.
        #[source]
        source: Box<Error>,
    },

    /// A collection operator failed on one element.
    #[error("element {index}: {source}")]
    Indexed {
        /// Zero-based index of the failing element (or attempt, for `collect`).
        index: usize,
        /// The error produced for that element.
        #[source]
        source: Box<Error>,
    },

    /// A panic converted into an error.
    #[error(transparent)]
    Panic(#[from] RecoveredPanic),

    /// Several independent failures reported together.
    #[error("{}", display_joined(.0))]
    Joined(Vec<Error>),

    /// The context was cancelled.
    #[error("context canceled")]
    Cancelled,

    /// The context deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// An iterative extraction has no more items. Ends [`collect`](crate::collect).
    #[error("extraction exhausted")]
    Exhausted,

    /// A JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An I/O error, typically from a trace or log sink.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A generic error with a message.
    #[error("{0}")]
    Message(String),

    /// Any other error produced by user step logic.
    #[error("{0}")]
    Other(Box<dyn StdError + Send + Sync + 'static>),
}

fn display_joined(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

impl Error {
    /// Wrap an arbitrary error type produced by step logic.
    pub fn other<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Error::Other(Box::new(error))
    }

    /// Attribute `source` to the scope called `name`.
    pub fn named(name: impl Into<String>, source: Error) -> Self {
        Error::Named {
            name: name.into(),
            source: Box::new(source),
        }
    }

    /// Attribute `source` to the element at `index`.
    pub fn indexed(index: usize, source: Error) -> Self {
        Error::Indexed {
            index,
            source: Box::new(source),
        }
    }

    /// Join errors into one aggregate.
    ///
    /// Nested aggregates are flattened in order. Returns `None` when there is nothing to join.
    pub fn join(errors: impl IntoIterator<Item = Error>) -> Option<Error> {
        let mut flat = Vec::new();
        for error in errors {
            match error {
                Error::Joined(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.is_empty() {
            None
        } else {
            Some(Error::Joined(flat))
        }
    }

    fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a Error) -> bool) -> bool {
        if f(self) {
            return true;
        }
        match self {
            Error::Named { source, .. } | Error::Indexed { source, .. } => source.visit(f),
            Error::Joined(errors) => {
                for error in errors {
                    if error.visit(f) {
                        return true;
                    }
                }
                false
            }
            _ => false,
        }
    }

    /// Returns `true` if this error, any wrapped cause, or any aggregate member satisfies `pred`.
    pub fn any(&self, mut pred: impl FnMut(&Error) -> bool) -> bool {
        self.visit(&mut |e| pred(e))
    }

    /// Find the first error of type `E` anywhere in the tree.
    ///
    /// Descends through names, indices and aggregates, then through the standard
    /// `source()` chain of wrapped foreign errors.
    pub fn find<'a, E>(&'a self) -> Option<&'a E>
    where
        E: StdError + 'static,
    {
        let mut found = None;
        self.visit(&mut |e: &'a Error| {
            found = e.downcast_leaf::<E>();
            found.is_some()
        });
        found
    }

    /// Returns `true` if some error of type `E` in the tree equals `target`.
    pub fn is<E>(&self, target: &E) -> bool
    where
        E: StdError + PartialEq + 'static,
    {
        self.any(|e| e.downcast_leaf::<E>().is_some_and(|found| found == target))
    }

    fn downcast_leaf<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        let mut current: Option<&(dyn StdError + 'static)> = match self {
            Error::Other(inner) => Some(inner.as_ref()),
            Error::Panic(panic) => Some(panic),
            Error::Io(e) => Some(e),
            Error::Json(e) => Some(e),
            _ => None,
        };
        while let Some(error) = current {
            if let Some(found) = error.downcast_ref::<E>() {
                return Some(found);
            }
            current = error.source();
        }
        None
    }

    /// Strip every [`Error::Named`] and [`Error::Indexed`] layer.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Named { source, .. } | Error::Indexed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Strip only [`Error::Named`] layers, keeping any other wrapper's context.
    pub fn strip_names(&self) -> &Error {
        match self {
            Error::Named { source, .. } => source.strip_names(),
            other => other,
        }
    }

    /// Returns `true` if a cancellation or deadline error is anywhere in the tree.
    pub fn is_cancellation(&self) -> bool {
        self.any(|e| matches!(e, Error::Cancelled | Error::DeadlineExceeded))
    }

    /// Returns `true` if the exhaustion sentinel is anywhere in the tree.
    pub fn is_exhausted(&self) -> bool {
        self.any(|e| matches!(e, Error::Exhausted))
    }

    /// The name carried by the outermost [`Error::Named`] layer, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            Error::Named { name, .. } => Some(name),
            _ => None,
        }
    }

    /// The index carried by the outermost [`Error::Indexed`] layer, if any.
    pub fn index(&self) -> Option<usize> {
        match self {
            Error::Indexed { index, .. } => Some(*index),
            _ => None,
        }
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Message(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Message(msg.to_string())
    }
}

/// A specialized `Result` type for step execution.
pub type Result<T> = std::result::Result<T, Error>;
