use std::fmt;

use crate::error::BlockResult;

/// Upper bound on the scatter/gather segments of a single request.
///
/// Matches what the guest-facing controllers advertise as their segment limit
/// and stays comfortably under the kernel's `IOV_MAX`, so an admitted
/// transfer always fits in one `preadv`/`pwritev`.
pub const MAX_SEGMENTS: usize = 128;

/// Identity of an admitted request, used to [`cancel`](crate::BlockBackend::cancel) it.
///
/// Ids are unique for the lifetime of a backend and never reused, so a stale
/// id held after completion can only produce
/// [`CancelError::NotFound`](crate::CancelError), never target a recycled
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub(crate) u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The operation a request performs against the store. Selected by the
/// submit method, not carried in the public request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockOp {
    Read,
    Write,
    Flush,
    Discard,
}

/// Completion callback: receives the request back (with its buffers and
/// final [`residual`](BlockRequest::residual)) and the outcome.
pub type CompletionFn = Box<dyn FnOnce(BlockRequest, BlockResult) + Send + 'static>;

/// One block-I/O request.
///
/// Built by a storage controller, handed to the backend by value, and
/// returned by value to the completion callback when processing finishes.
/// The operation kind is not part of the request; it is chosen by which
/// submit entry point ([`read`](crate::BlockBackend::read),
/// [`write`](crate::BlockBackend::write), ...) admits it.
pub struct BlockRequest {
    /// Byte offset into the store. Ignored for flushes.
    pub offset: u64,
    /// Scatter/gather segments, in transfer order. Reads fill them, writes
    /// drain them. Empty for flushes and discards.
    pub segments: Vec<Vec<u8>>,
    /// Bytes not yet transferred. Initialized to the total transfer size
    /// (for discards, the discard length) and decremented as I/O completes;
    /// a nonzero value after a successful completion means a short transfer.
    pub residual: u64,
    on_complete: Option<CompletionFn>,
}

impl BlockRequest {
    /// A read or write of `segments` at `offset`.
    pub fn transfer(
        offset: u64,
        segments: Vec<Vec<u8>>,
        on_complete: impl FnOnce(BlockRequest, BlockResult) + Send + 'static,
    ) -> BlockRequest {
        let residual = segments.iter().map(|s| s.len() as u64).sum();
        BlockRequest {
            offset,
            segments,
            residual,
            on_complete: Some(Box::new(on_complete)),
        }
    }

    /// A flush. Carries no payload.
    pub fn flush(on_complete: impl FnOnce(BlockRequest, BlockResult) + Send + 'static) -> BlockRequest {
        BlockRequest {
            offset: 0,
            segments: Vec::new(),
            residual: 0,
            on_complete: Some(Box::new(on_complete)),
        }
    }

    /// A discard of `len` bytes at `offset`.
    pub fn discard(
        offset: u64,
        len: u64,
        on_complete: impl FnOnce(BlockRequest, BlockResult) + Send + 'static,
    ) -> BlockRequest {
        BlockRequest {
            offset,
            segments: Vec::new(),
            residual: len,
            on_complete: Some(Box::new(on_complete)),
        }
    }

    /// Total bytes this request transfers.
    pub fn transfer_len(&self) -> u64 {
        self.segments.iter().map(|s| s.len() as u64).sum()
    }

    /// Invoke the completion callback, consuming the request.
    ///
    /// Safe against double invocation by construction: the callback is taken
    /// out first, so a request that somehow finishes twice invokes it once.
    pub(crate) fn finish(mut self, result: BlockResult) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(self, result);
        }
    }
}

impl fmt::Debug for BlockRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockRequest")
            .field("offset", &self.offset)
            .field("segments", &self.segments.len())
            .field("transfer_len", &self.transfer_len())
            .field("residual", &self.residual)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_initializes_residual_to_total_length() {
        let req = BlockRequest::transfer(0, vec![vec![0; 512], vec![0; 1024]], |_, _| {});
        assert_eq!(req.residual, 1536);
        assert_eq!(req.transfer_len(), 1536);
    }

    #[test]
    fn discard_carries_length_in_residual() {
        let req = BlockRequest::discard(4096, 65536, |_, _| {});
        assert_eq!(req.residual, 65536);
        assert!(req.segments.is_empty());
    }

    #[test]
    fn finish_hands_back_request_and_result() {
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let observer = fired.clone();
        let req = BlockRequest::transfer(7, vec![vec![0; 8]], move |req, result| {
            assert_eq!(req.offset, 7);
            assert!(result.is_ok());
            observer.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        req.finish(Ok(()));
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
