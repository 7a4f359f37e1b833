//! Cooperative cancellation.
//!
//! A [`CancelToken`] is shared by the engine, every repository pipeline, and
//! every worker thread. Cancellation is signalled two ways at once: an atomic
//! flag for cheap polling in loops, and a channel whose sender is dropped on
//! cancel so blocked threads can `select!` on it and wake immediately. Tokens
//! may also carry a deadline, which makes the whole run bounded by a timeout
//! without any extra watchdog thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, select};

/// Error returned from any operation interrupted by cancellation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation cancelled")
    }
}

impl std::error::Error for Cancelled {}

struct Inner {
    flag: AtomicBool,
    deadline: Option<Instant>,
    // Dropped on cancel so the receiver unblocks. The Mutex only guards the
    // one-time take; it is never held across a wait.
    notify_tx: Mutex<Option<Sender<()>>>,
    notify_rx: Receiver<()>,
}

/// Shared cancellation handle.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Create a token that only cancels when [`CancelToken::cancel`] is called.
    pub fn new() -> Self {
        Self::with_deadline(None)
    }

    /// Create a token that additionally cancels itself once `timeout` elapses.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Some(Instant::now() + timeout))
    }

    fn with_deadline(deadline: Option<Instant>) -> Self {
        let (tx, rx) = bounded::<()>(0);
        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                deadline,
                notify_tx: Mutex::new(Some(tx)),
                notify_rx: rx,
            }),
        }
    }

    /// Signal cancellation. Idempotent and safe to call from signal handlers
    /// running on their own thread.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::Release);
        if let Ok(mut guard) = self.inner.notify_tx.lock() {
            guard.take();
        }
    }

    /// True once cancelled or past the deadline.
    pub fn is_cancelled(&self) -> bool {
        if self.inner.flag.load(Ordering::Acquire) {
            return true;
        }
        if let Some(deadline) = self.inner.deadline
            && Instant::now() >= deadline
        {
            // Latch the deadline so the notify channel closes too.
            self.cancel();
            return true;
        }
        false
    }

    /// Return `Err(Cancelled)` once cancelled; cheap enough for inner loops.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() { Err(Cancelled) } else { Ok(()) }
    }

    /// Channel that becomes ready when the token is cancelled. Intended for
    /// `select!` arms in worker loops; a `recv` on it always yields `Err`
    /// (disconnected) once cancel fires.
    pub fn cancelled_channel(&self) -> &Receiver<()> {
        &self.inner.notify_rx
    }

    /// Sleep for `duration`, waking early on cancellation.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        self.check()?;
        let duration = match self.inner.deadline {
            Some(deadline) => duration.min(deadline.saturating_duration_since(Instant::now())),
            None => duration,
        };
        select! {
            recv(self.inner.notify_rx) -> _ => Err(Cancelled),
            default(duration) => self.check(),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
