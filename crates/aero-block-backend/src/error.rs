use thiserror::Error;

use crate::request::BlockRequest;

/// Outcome delivered to a request's completion callback.
pub type BlockResult = std::result::Result<(), BlockIoError>;

/// Per-request failure, reported only through the completion callback.
///
/// Worker threads never propagate these; a failed request completes with the
/// error and the worker moves on to the next one.
#[derive(Debug, Error)]
pub enum BlockIoError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Write or discard submitted against a read-only store.
    #[error("store is read-only")]
    ReadOnly,

    /// The store cannot perform this operation (e.g. discard on a
    /// filesystem without hole punching).
    #[error("operation not supported by store")]
    Unsupported,

    /// The request was cancelled before or during execution.
    #[error("request cancelled")]
    Cancelled,
}

/// Synchronous submission failure. The rejected request is handed back so
/// the caller can retry it or surface a device-level error.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Every slot is occupied. Retryable: resubmit after a completion.
    #[error("request queue is full")]
    QueueFull(BlockRequest),

    /// The scatter/gather list exceeds [`MAX_SEGMENTS`](crate::MAX_SEGMENTS).
    /// Not retryable; the request itself is malformed.
    #[error("too many segments in request")]
    TooManySegments(BlockRequest),

    /// The backend is shutting down and no longer accepts requests.
    #[error("backend is closed")]
    Closed(BlockRequest),
}

impl SubmitError {
    /// Recover the rejected request.
    pub fn into_request(self) -> BlockRequest {
        match self {
            SubmitError::QueueFull(req)
            | SubmitError::TooManySegments(req)
            | SubmitError::Closed(req) => req,
        }
    }
}

/// Failure to open a [`BlockBackend`](crate::BlockBackend).
#[derive(Debug, Error)]
pub enum OpenError {
    #[error(transparent)]
    Store(#[from] aero_block_store::StoreError),

    #[error("invalid backend configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Failure to register a resize callback.
#[derive(Debug, Error)]
pub enum ResizeCallbackError {
    #[error("a resize callback is already registered")]
    AlreadyRegistered,
}

/// Failure to cancel a request.
#[derive(Debug, Error)]
pub enum CancelError {
    /// No queued or executing request carries this id; it either completed
    /// already or never existed.
    #[error("no such request")]
    NotFound,
}
