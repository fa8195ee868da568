//! Cancellation primitives
//!
//! `Cancel` is a one-shot broadcaster: any number of tasks wait on it, firing
//! wakes them all. Children made with `child()` fire when the parent fires;
//! a child fired alone leaves the parent untouched. `WatchDog` arms a
//! deadline that fires a `Cancel` when it lapses, and may be extended or
//! shortened while running.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// One-shot cancellation broadcaster.
///
/// Cloning yields another handle to the same signal; `child()` yields a new
/// signal linked to this one.
#[derive(Debug, Clone, Default)]
pub struct Cancel {
    token: CancellationToken,
}

impl Cancel {
    pub fn new() -> Self {
        Self { token: CancellationToken::new() }
    }

    /// A child signal: fires when `self` fires, but firing the child does
    /// not disturb `self`.
    pub fn child(&self) -> Cancel {
        Cancel { token: self.token.child_token() }
    }

    /// Fire the signal, waking every waiter with `Error::Cancelled`.
    pub fn fire(&self) {
        self.token.cancel();
    }

    pub fn fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Suspend until the signal fires.
    pub async fn fired_wait(&self) {
        self.token.cancelled().await;
    }

    /// Run `fut` until it completes or this signal fires, whichever is first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Cancelled),
            out = fut => Ok(out),
        }
    }

    /// Sleep, interruptible by this signal.
    pub async fn sleep(&self, d: Duration) -> Result<()> {
        self.run(tokio::time::sleep(d)).await
    }
}

/// A deadline that fires a `Cancel` when it lapses.
///
/// The watched signal is a child of `parent`, so firing the parent also tears
/// down whatever the watchdog guards. Dropping the watchdog disarms it.
pub struct WatchDog {
    cancel: Cancel,
    deadline: watch::Sender<Instant>,
    timer: tokio::task::JoinHandle<()>,
}

impl WatchDog {
    pub fn new(parent: &Cancel, timeout: Duration) -> Self {
        let cancel = parent.child();
        let (tx, mut rx) = watch::channel(Instant::now() + timeout);
        let fire = cancel.clone();
        let timer = tokio::spawn(async move {
            loop {
                let deadline = *rx.borrow_and_update();
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        // A later extend() may have moved the deadline while
                        // we slept; only fire if it is still in the past.
                        if *rx.borrow() <= Instant::now() {
                            fire.fire();
                            return;
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        Self { cancel, deadline: tx, timer }
    }

    /// Move the deadline to `timeout` from now. Works for both extending
    /// and shortening.
    pub fn rearm(&self, timeout: Duration) {
        let _ = self.deadline.send(Instant::now() + timeout);
    }

    pub fn expired(&self) -> bool {
        self.cancel.fired()
    }

    /// The signal that fires on expiry; hand it to the guarded operation.
    pub fn watched(&self) -> &Cancel {
        &self.cancel
    }
}

impl Drop for WatchDog {
    fn drop(&mut self) {
        self.timer.abort();
    }
}
