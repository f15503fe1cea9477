//! Worker threads.
//!
//! Each worker loops: claim a dispatchable slot under the scheduler lock,
//! drop the lock, run the blocking store call, then mark the slot done,
//! deliver the completion callback (lock released) and retire the slot.
//! The callback therefore always runs before any same-key request can be
//! dispatched, which is what gives dependent requests their ordering.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::io::{self, IoSlice, IoSliceMut};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;

use crate::backend::Shared;
use crate::cancel::ThreadRef;
use crate::error::{BlockIoError, BlockResult};
use crate::queue::SlotId;
use crate::request::{BlockOp, BlockRequest};

/// Upper bound on a single staged syscall. A multiple of every supported
/// sector size, so staged chunks stay aligned for direct I/O.
const STAGING_CHUNK: usize = 128 * 1024;

pub(crate) fn run(shared: Arc<Shared>, index: usize) {
    // Register for directed interrupts before any slot can name this worker
    // as owner.
    {
        let mut threads = shared
            .worker_threads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        threads[index] = Some(ThreadRef::current());
    }

    // Stores that require aligned transfers get a per-worker staging buffer
    // for the lifetime of the thread.
    let mut staging = shared.store.io_alignment().map(StagingBuf::new);
    tracing::debug!(worker = index, staged = staging.is_some(), "block worker started");

    let mut sched = shared.lock_sched();
    loop {
        sched.active_workers += 1;

        while !sched.paused && !sched.closing {
            let Some((slot, op, mut request)) = sched.dequeue(index) else {
                break;
            };
            drop(sched);

            let result = execute(&shared, slot, op, &mut request, staging.as_mut());

            // The slot leaves Busy before the callback runs, so a racing
            // cancel stops interrupting this thread.
            sched = shared.lock_sched();
            sched.mark_done(slot);
            drop(sched);

            // The callback is embedder code; contain its panics so the slot
            // retirement below always runs. An escaped panic would leave the
            // slot holding its conflict key and the worker count off by one.
            if panic::catch_unwind(AssertUnwindSafe(|| request.finish(result))).is_err() {
                tracing::error!(worker = index, "completion callback panicked");
            }

            sched = shared.lock_sched();
            let completion = sched.complete(slot);
            if completion.unblocked {
                shared.work_avail.notify_one();
            }
            for waiter in completion.waiters {
                waiter.finish();
            }
        }

        sched.active_workers -= 1;
        if sched.active_workers == 0 {
            shared.drained.notify_all();
        }

        if sched.closing {
            break;
        }
        if sched.paused {
            while sched.paused && !sched.closing {
                sched = shared
                    .unpaused
                    .wait(sched)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            // Work may have queued up while paused; rescan instead of
            // waiting for a fresh signal.
            continue;
        }
        sched = shared
            .work_avail
            .wait(sched)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
    }
    drop(sched);

    // Deregister under the registry lock. Interrupts are sent while holding
    // the same lock, so once the entry is cleared no signal can be aimed at
    // this thread again, and a sender that already found the entry keeps the
    // thread here until its signal is delivered.
    {
        let mut threads = shared
            .worker_threads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        threads[index] = None;
    }
    tracing::debug!(worker = index, "block worker stopped");
}

/// Run one request against the store. I/O errors become the request's
/// result; they are never propagated out of the worker.
fn execute(
    shared: &Shared,
    slot: SlotId,
    op: BlockOp,
    request: &mut BlockRequest,
    staging: Option<&mut StagingBuf>,
) -> BlockResult {
    let store = &*shared.store;
    match op {
        BlockOp::Read => transfer(shared, slot, request, staging, false),
        BlockOp::Write => {
            if store.read_only() {
                return Err(BlockIoError::ReadOnly);
            }
            transfer(shared, slot, request, staging, true)
        }
        BlockOp::Flush => loop {
            match store.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    if cancel_requested(shared, slot) {
                        return Err(BlockIoError::Cancelled);
                    }
                }
                Err(err) => return Err(BlockIoError::Io(err)),
            }
        },
        BlockOp::Discard => {
            if store.read_only() {
                return Err(BlockIoError::ReadOnly);
            }
            if !store.supports_discard() {
                return Err(BlockIoError::Unsupported);
            }
            let len = request.residual;
            loop {
                match store.discard(request.offset, len) {
                    Ok(()) => {
                        request.residual = 0;
                        return Ok(());
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                        if cancel_requested(shared, slot) {
                            return Err(BlockIoError::Cancelled);
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Unsupported => {
                        return Err(BlockIoError::Unsupported);
                    }
                    Err(err) => return Err(BlockIoError::Io(err)),
                }
            }
        }
    }
}

/// Read or write `request`, retrying interrupted syscalls unless the
/// interruption was a cancellation.
///
/// Progress lives in `request.residual`, so a retry after a partially
/// completed staged transfer resumes where it stopped rather than starting
/// over.
fn transfer(
    shared: &Shared,
    slot: SlotId,
    request: &mut BlockRequest,
    mut staging: Option<&mut StagingBuf>,
    write: bool,
) -> BlockResult {
    loop {
        let attempt = match &mut staging {
            Some(staging) => staged_transfer(shared, staging, request, write),
            None => direct_transfer(shared, request, write),
        };
        match attempt {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                if cancel_requested(shared, slot) {
                    return Err(BlockIoError::Cancelled);
                }
            }
            Err(err) => return Err(BlockIoError::Io(err)),
        }
    }
}

/// Pass the request's scatter list to the store in one positional call.
/// Short transfers are reported through `residual`, not retried.
fn direct_transfer(shared: &Shared, request: &mut BlockRequest, write: bool) -> io::Result<()> {
    let moved = if write {
        let slices: Vec<IoSlice<'_>> = request.segments.iter().map(|s| IoSlice::new(s)).collect();
        shared.store.write_vectored_at(request.offset, &slices)?
    } else {
        let mut slices: Vec<IoSliceMut<'_>> = request
            .segments
            .iter_mut()
            .map(|s| IoSliceMut::new(s))
            .collect();
        shared.store.read_vectored_at(request.offset, &mut slices)?
    };
    request.residual = request.residual.saturating_sub(moved as u64);
    Ok(())
}

/// Stage the transfer through the worker's aligned buffer in
/// [`STAGING_CHUNK`]-sized pieces. Used when the store cannot take the
/// caller's scatter list directly.
fn staged_transfer(
    shared: &Shared,
    staging: &mut StagingBuf,
    request: &mut BlockRequest,
    write: bool,
) -> io::Result<()> {
    let total = request.transfer_len();
    while request.residual > 0 {
        let done = total - request.residual;
        let chunk = staging.capacity().min(request.residual as usize);
        let offset = request.offset + done;

        let moved = if write {
            gather(request, done, &mut staging.as_mut_slice()[..chunk]);
            shared
                .store
                .write_vectored_at(offset, &[IoSlice::new(&staging.as_slice()[..chunk])])?
        } else {
            let n = shared
                .store
                .read_vectored_at(offset, &mut [IoSliceMut::new(&mut staging.as_mut_slice()[..chunk])])?;
            scatter(request, done, &staging.as_slice()[..n]);
            n
        };
        request.residual -= moved as u64;
        if moved < chunk {
            // End of store or a short device transfer; residual reports it.
            break;
        }
    }
    Ok(())
}

/// Copy `data.len()` bytes out of the request's segments, starting `skip`
/// bytes into the overall transfer, into `data`.
fn gather(request: &BlockRequest, mut skip: u64, data: &mut [u8]) {
    let mut copied = 0;
    for seg in &request.segments {
        let seg_len = seg.len() as u64;
        if skip >= seg_len {
            skip -= seg_len;
            continue;
        }
        let start = skip as usize;
        let n = (seg.len() - start).min(data.len() - copied);
        data[copied..copied + n].copy_from_slice(&seg[start..start + n]);
        copied += n;
        skip = 0;
        if copied == data.len() {
            break;
        }
    }
    debug_assert_eq!(copied, data.len(), "gather past end of segments");
}

/// Copy `data` into the request's segments, starting `skip` bytes into the
/// overall transfer.
fn scatter(request: &mut BlockRequest, mut skip: u64, data: &[u8]) {
    let mut copied = 0;
    for seg in &mut request.segments {
        let seg_len = seg.len() as u64;
        if skip >= seg_len {
            skip -= seg_len;
            continue;
        }
        let start = skip as usize;
        let n = (seg.len() - start).min(data.len() - copied);
        seg[start..start + n].copy_from_slice(&data[copied..copied + n]);
        copied += n;
        skip = 0;
        if copied == data.len() {
            break;
        }
    }
    debug_assert_eq!(copied, data.len(), "scatter past end of segments");
}

fn cancel_requested(shared: &Shared, slot: SlotId) -> bool {
    shared.lock_sched().slot(slot).cancel_requested
}

/// Page-aligned staging buffer, allocated once per worker that needs one.
struct StagingBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl StagingBuf {
    fn new(alignment: u32) -> StagingBuf {
        // Page alignment satisfies direct I/O on every mainstream kernel;
        // coarser sector sizes only raise it further.
        let align = (alignment as usize).next_power_of_two().max(4096);
        let layout = Layout::from_size_align(STAGING_CHUNK, align)
            .expect("staging buffer layout is statically valid");
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };
        StagingBuf { ptr, layout }
    }

    fn capacity(&self) -> usize {
        self.layout.size()
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for StagingBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}
