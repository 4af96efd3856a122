//! Shared fixtures for unit tests.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::{step, Error, Step};

/// Shared counter state. Clones observe the same value.
#[derive(Debug, Clone, Default)]
pub(crate) struct Counter(Arc<AtomicI64>);

impl Counter {
    pub(crate) fn get(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Add `n` and return the new value.
    pub(crate) fn add(&self, n: i64) -> i64 {
        self.0.fetch_add(n, Ordering::SeqCst) + n
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub(crate) enum Sentinel {
    #[error("error 1")]
    One,
    #[error("error 2")]
    Two,
    #[error("error 3")]
    Three,
    #[error("retryable error")]
    Retryable,
    #[error("non-retryable error")]
    NonRetryable,
}

pub(crate) fn increment(n: i64) -> impl Step<Counter> + Clone {
    step(move |_ctx, c: Counter| async move {
        c.add(n);
        Ok(())
    })
}

pub(crate) fn decrement(n: i64) -> impl Step<Counter> + Clone {
    increment(-n)
}

/// Counts every call and fails until the count reaches `n`.
pub(crate) fn fail_until_count(n: i64) -> impl Step<Counter> + Clone {
    step(move |_ctx, c: Counter| async move {
        if c.add(1) < n {
            Err(Error::from("not yet"))
        } else {
            Ok(())
        }
    })
}

pub(crate) fn increment_and_fail(err: Sentinel) -> impl Step<Counter> + Clone {
    step(move |_ctx, c: Counter| async move {
        c.add(1);
        Err(Error::other(err))
    })
}

pub(crate) fn fail_with(err: Sentinel) -> impl Step<Counter> + Clone {
    step(move |_ctx, _c: Counter| async move { Err(Error::other(err)) })
}

pub(crate) fn panic_with(msg: &'static str) -> impl Step<Counter> + Clone {
    step(move |_ctx, _c: Counter| async move {
        if !msg.is_empty() {
            panic!("{}", msg);
        }
        Ok(())
    })
}
