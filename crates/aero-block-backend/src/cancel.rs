//! Cancellation support.
//!
//! Cancelling a request that a worker is executing cannot happen under the
//! scheduler lock: the worker needs that same lock to complete, and its
//! syscall may block indefinitely. Each cancellation instead gets its own
//! [`CancelWaiter`], registered with the target slot under the scheduler
//! lock, and the owning worker is knocked out of the syscall with a
//! directed signal (see [`ThreadRef::interrupt`]). The worker's normal
//! completion path then retires the slot and wakes the waiter, so the
//! completion callback fires exactly once, always from the worker.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Outcome of [`BlockBackend::cancel`](crate::BlockBackend::cancel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStatus {
    /// The request was still queued; it has been completed with
    /// [`BlockIoError::Cancelled`](crate::BlockIoError) and its callback has
    /// already run.
    Removed,
    /// The request was executing. Its worker has been interrupted and has
    /// reached (or will momentarily reach) its completion path; the callback
    /// fires from the worker and may or may not have run yet. Callers must
    /// not touch the request's memory until it does.
    InProgress,
}

/// Interval at which a blocked cancellation re-sends the interrupt. A signal
/// delivered between the worker's dequeue and its entry into the syscall is
/// consumed without effect, so one send is not enough.
pub(crate) const RESEND_INTERVAL: Duration = Duration::from_millis(10);

/// One cancellation's private rendezvous with the completing worker.
pub(crate) struct CancelWaiter {
    done: Mutex<bool>,
    cond: Condvar,
}

impl CancelWaiter {
    pub(crate) fn new() -> CancelWaiter {
        CancelWaiter {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Mark the awaited slot retired and wake the canceller. Called by the
    /// worker (or whoever runs `complete`) after the scheduler lock work is
    /// done.
    pub(crate) fn finish(&self) {
        let mut done = self.done.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *done = true;
        self.cond.notify_all();
    }

    /// Wait up to `timeout` for [`finish`](Self::finish); returns whether it
    /// has happened. Callers loop, re-sending the interrupt between waits.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let done = self.done.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *done {
            return true;
        }
        let (done, _timed_out) = self
            .cond
            .wait_timeout(done, timeout)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *done
    }
}

#[cfg(unix)]
mod imp {
    use std::sync::Once;

    use nix::sys::pthread::{pthread_kill, pthread_self, Pthread};
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

    /// Signal used to interrupt a worker's blocking syscall. SIGCONT's
    /// default disposition is harmless to a running process, so a delivery
    /// racing handler installation cannot take the process down.
    const INTERRUPT_SIGNAL: Signal = Signal::SIGCONT;

    static INSTALL: Once = Once::new();

    extern "C" fn interrupt_handler(_signo: libc::c_int) {}

    /// Install the empty `SIGCONT` handler, once per process, without
    /// `SA_RESTART`: the whole point is that interrupted syscalls return
    /// `EINTR` instead of transparently resuming.
    pub(crate) fn install_interrupt_handler() {
        INSTALL.call_once(|| {
            let action = SigAction::new(
                SigHandler::Handler(interrupt_handler),
                SaFlags::empty(),
                SigSet::empty(),
            );
            if let Err(err) = unsafe { signal::sigaction(INTERRUPT_SIGNAL, &action) } {
                // Cancellation still works, it just degrades to waiting out
                // the blocked syscall.
                tracing::warn!(%err, "failed to install cancellation signal handler");
            }
        });
    }

    /// Handle to a live worker thread, good for directed signals.
    #[derive(Clone, Copy)]
    pub(crate) struct ThreadRef(Pthread);

    // pthread_t is an opaque process-wide handle, safe to move and share;
    // the hazard is pthread_kill after the thread has ended. Every ThreadRef
    // lives in the backend's worker registry: the owning worker clears its
    // entry under the registry lock before returning, and interrupts are
    // sent while holding that same lock, so a signalled thread is still
    // running.
    unsafe impl Send for ThreadRef {}
    unsafe impl Sync for ThreadRef {}

    impl ThreadRef {
        pub(crate) fn current() -> ThreadRef {
            ThreadRef(pthread_self())
        }

        /// Deliver the interrupt signal. Failure (the thread is gone) is
        /// ignored; the caller's wait loop terminates via the slot state.
        pub(crate) fn interrupt(&self) {
            let _ = pthread_kill(self.0, INTERRUPT_SIGNAL);
        }
    }
}

#[cfg(not(unix))]
mod imp {
    /// Without directed signals there is no way to break a worker out of a
    /// blocking syscall; cancellation of a busy request degrades to waiting
    /// for the syscall to finish on its own.
    pub(crate) fn install_interrupt_handler() {}

    #[derive(Clone, Copy)]
    pub(crate) struct ThreadRef;

    impl ThreadRef {
        pub(crate) fn current() -> ThreadRef {
            ThreadRef
        }

        pub(crate) fn interrupt(&self) {}
    }
}

pub(crate) use imp::{install_interrupt_handler, ThreadRef};
