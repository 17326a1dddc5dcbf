//! Cooperative shutdown for one pipestance driver.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Cancellation plus a count of in-flight critical sections.
///
/// Metadata mutations that must not be torn (writing `_args` then enqueueing,
/// resetting a fork) run inside a [`CriticalSection`]. Once shutdown starts no
/// new section can be entered, and [`ShutdownContext::shutdown`] returns only
/// after the open ones have dropped.
#[derive(Clone, Debug, Default)]
pub struct ShutdownContext {
    token: CancellationToken,
    inner: Arc<SectionCounter>,
}

#[derive(Debug, Default)]
struct SectionCounter {
    open: AtomicUsize,
    drained: Notify,
}

#[must_use = "the section closes when the guard drops"]
#[derive(Debug)]
pub struct CriticalSection {
    inner: Arc<SectionCounter>,
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        if self.inner.open.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

impl ShutdownContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `None` once shutdown has begun.
    pub fn enter(&self) -> Option<CriticalSection> {
        if self.token.is_cancelled() {
            return None;
        }
        self.inner.open.fetch_add(1, Ordering::AcqRel);
        if self.token.is_cancelled() {
            // Lost the race with shutdown; the guard's drop undoes the count.
            drop(CriticalSection {
                inner: Arc::clone(&self.inner),
            });
            return None;
        }
        Some(CriticalSection {
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn open_sections(&self) -> usize {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Cancels the token and waits for every open section to close.
    pub async fn shutdown(&self) {
        self.token.cancel();
        loop {
            let drained = self.inner.drained.notified();
            if self.open_sections() == 0 {
                return;
            }
            drained.await;
        }
    }
}
