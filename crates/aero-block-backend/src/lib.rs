//! Asynchronous block-I/O backend: a bounded request queue executed by a
//! fixed pool of worker threads over one
//! [`BackingStore`](aero_block_store::BackingStore).
//!
//! A [`BlockBackend`] admits requests without blocking (a full queue is an
//! immediate [`SubmitError::QueueFull`]) and reports each completion through
//! the request's callback, exactly once, from a worker thread. Requests that
//! share a starting offset are serialized in submission order; flushes
//! serialize against other flushes. Everything else runs concurrently.
//!
//! Beyond submission the backend offers:
//!
//! - [`cancel`](BlockBackend::cancel): queued requests are completed with
//!   [`BlockIoError::Cancelled`] on the spot; executing requests have their
//!   syscall interrupted with a directed signal and the call waits for the
//!   worker to retire them.
//! - [`pause`](BlockBackend::pause) / [`resume`](BlockBackend::resume):
//!   quiesce the workers (for snapshotting) and pick the queue back up.
//! - [`refresh_size`](BlockBackend::refresh_size) with a registered resize
//!   callback, for disk images that grow underneath a running guest.
//!
//! The expected embedding wraps the backend in an `Arc` shared by the
//! virtio-blk (or AHCI/NVMe) queue handlers of one virtual disk.

mod backend;
mod cancel;
mod error;
mod queue;
mod request;
mod worker;

pub use backend::{BackendConfig, BlockBackend};
pub use cancel::CancelStatus;
pub use error::{
    BlockIoError, BlockResult, CancelError, OpenError, ResizeCallbackError, SubmitError,
};
pub use request::{BlockRequest, CompletionFn, RequestId, MAX_SEGMENTS};
