//! The backend facade: open/submit/cancel/pause/resume/close.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use aero_block_store::{BackingStore, SectorGeometry, StoreError};

use crate::cancel::{self, CancelStatus, CancelWaiter, ThreadRef};
use crate::error::{BlockIoError, CancelError, OpenError, ResizeCallbackError, SubmitError};
use crate::queue::{Sched, SlotState};
use crate::request::{BlockOp, BlockRequest, RequestId, MAX_SEGMENTS};
use crate::worker;

/// Sizing of a backend's queue and worker pool.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Request slots available to callers beyond the ones reserved for the
    /// workers themselves; the backend holds `queue_depth + workers` slots
    /// in total.
    pub queue_depth: usize,
    /// Worker threads, i.e. the maximum number of concurrently executing
    /// store calls.
    pub workers: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            queue_depth: 128,
            workers: 8,
        }
    }
}

/// State shared between the backend handle and its worker threads.
pub(crate) struct Shared {
    pub(crate) store: Box<dyn BackingStore>,
    pub(crate) sched: Mutex<Sched>,
    /// Signalled on enqueue and when a completion unblocks a queued request.
    pub(crate) work_avail: Condvar,
    /// Signalled when the active-worker count drops to zero.
    pub(crate) drained: Condvar,
    /// Signalled by resume (and close) to release paused workers.
    pub(crate) unpaused: Condvar,
    pub(crate) size: AtomicU64,
    /// Interrupt handles, indexed by worker; each worker registers itself
    /// before it can own a slot.
    pub(crate) worker_threads: Mutex<Vec<Option<ThreadRef>>>,
}

impl Shared {
    pub(crate) fn lock_sched(&self) -> MutexGuard<'_, Sched> {
        self.sched.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

type ResizeCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Asynchronous block-I/O backend over one [`BackingStore`].
///
/// Requests are admitted into a bounded slot pool and executed by a fixed
/// pool of worker threads; completion is reported through each request's
/// callback. Requests with the same starting offset execute in submission
/// order; everything else runs concurrently in whatever order the workers
/// get to it.
///
/// All methods take `&self`; the backend is meant to be shared behind an
/// `Arc` by several controller queues.
pub struct BlockBackend {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    resize_callback: Mutex<Option<ResizeCallback>>,
    geometry: SectorGeometry,
    read_only: bool,
    can_discard: bool,
    slot_count: usize,
}

impl BlockBackend {
    /// Open a backend over `store`: probe size and geometry, allocate the
    /// slot pool and spawn the workers.
    pub fn open(store: Box<dyn BackingStore>, config: BackendConfig) -> Result<BlockBackend, OpenError> {
        if config.queue_depth == 0 {
            return Err(OpenError::InvalidConfig("queue_depth must be nonzero"));
        }
        if config.workers == 0 {
            return Err(OpenError::InvalidConfig("workers must be nonzero"));
        }

        cancel::install_interrupt_handler();

        let size = store
            .capacity_bytes()
            .map_err(|err| OpenError::Store(StoreError::Probe(err)))?;
        let geometry = store.geometry();
        let read_only = store.read_only();
        let can_discard = store.supports_discard();
        let slot_count = config.queue_depth + config.workers;

        let shared = Arc::new(Shared {
            store,
            sched: Mutex::new(Sched::new(slot_count)),
            work_avail: Condvar::new(),
            drained: Condvar::new(),
            unpaused: Condvar::new(),
            size: AtomicU64::new(size),
            worker_threads: Mutex::new(vec![None; config.workers]),
        });

        let mut handles = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let worker_shared = Arc::clone(&shared);
            let spawned = std::thread::Builder::new()
                .name(format!("blk-worker-{index}"))
                .spawn(move || worker::run(worker_shared, index));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    shutdown_workers(&shared, &mut handles);
                    return Err(OpenError::Spawn(err));
                }
            }
        }

        tracing::info!(
            size,
            sector_size = geometry.logical,
            physical_sector_size = geometry.physical,
            workers = config.workers,
            slots = slot_count,
            read_only,
            "block backend opened"
        );

        Ok(BlockBackend {
            shared,
            handles: Mutex::new(handles),
            resize_callback: Mutex::new(None),
            geometry,
            read_only,
            can_discard,
            slot_count,
        })
    }

    /// Open a [`FileStore`](aero_block_store::FileStore) at `path` and build
    /// a backend over it.
    #[cfg(unix)]
    pub fn open_path(
        path: impl AsRef<std::path::Path>,
        options: &aero_block_store::OpenOptions,
        config: BackendConfig,
    ) -> Result<BlockBackend, OpenError> {
        let store = aero_block_store::FileStore::open(path, options)?;
        BlockBackend::open(Box::new(store), config)
    }

    /// Submit a read. The segments are filled and handed back through the
    /// completion callback.
    pub fn read(&self, request: BlockRequest) -> Result<RequestId, SubmitError> {
        self.submit(BlockOp::Read, request)
    }

    /// Submit a write of the request's segments.
    pub fn write(&self, request: BlockRequest) -> Result<RequestId, SubmitError> {
        self.submit(BlockOp::Write, request)
    }

    /// Submit a flush-to-stable-storage. Flushes serialize against other
    /// flushes but not against reads or writes.
    pub fn flush(&self, request: BlockRequest) -> Result<RequestId, SubmitError> {
        self.submit(BlockOp::Flush, request)
    }

    /// Submit a discard of `request.residual` bytes at `request.offset`
    /// (see [`BlockRequest::discard`]).
    pub fn discard(&self, request: BlockRequest) -> Result<RequestId, SubmitError> {
        self.submit(BlockOp::Discard, request)
    }

    /// Admission: never blocks. A full queue or a closing backend hands the
    /// request back inside the error.
    fn submit(&self, op: BlockOp, request: BlockRequest) -> Result<RequestId, SubmitError> {
        if request.segments.len() > MAX_SEGMENTS {
            return Err(SubmitError::TooManySegments(request));
        }
        let mut sched = self.shared.lock_sched();
        if sched.closing {
            return Err(SubmitError::Closed(request));
        }
        match sched.enqueue(op, request) {
            Ok((_slot, id)) => {
                drop(sched);
                self.shared.work_avail.notify_one();
                Ok(id)
            }
            Err(request) => Err(SubmitError::QueueFull(request)),
        }
    }

    /// Cancel an admitted request.
    ///
    /// A request still queued is completed right here with
    /// [`BlockIoError::Cancelled`] (callback runs before this returns) and
    /// reported as [`CancelStatus::Removed`]. A request already on a worker
    /// has its syscall interrupted; this call then blocks until the worker
    /// retires the request and returns [`CancelStatus::InProgress`] — the
    /// callback fires from the worker, exactly once, possibly with a
    /// non-cancelled result if the I/O won the race.
    pub fn cancel(&self, id: RequestId) -> Result<CancelStatus, CancelError> {
        let mut sched = self.shared.lock_sched();
        let Some(slot) = sched.find(id) else {
            return Err(CancelError::NotFound);
        };

        match sched.slot(slot).state {
            SlotState::Pending { .. } => {
                let request = sched.slot_mut(slot).request.take();
                let completion = sched.complete(slot);
                drop(sched);

                // Unlike the worker path this thread does not rescan the
                // queue afterwards, so an unblocked slot needs an explicit
                // wakeup.
                if completion.unblocked {
                    self.shared.work_avail.notify_one();
                }
                if let Some(request) = request {
                    request.finish(Err(BlockIoError::Cancelled));
                }
                for waiter in completion.waiters {
                    waiter.finish();
                }
                Ok(CancelStatus::Removed)
            }
            SlotState::Busy | SlotState::Done => {
                let waiter = Arc::new(CancelWaiter::new());
                let owner = sched.slot(slot).owner;
                let executing = sched.slot(slot).state == SlotState::Busy;
                {
                    let slot = sched.slot_mut(slot);
                    slot.cancel_requested = true;
                    slot.cancel_waiters.push(Arc::clone(&waiter));
                }
                drop(sched);

                if executing {
                    self.interrupt_worker(owner);
                }
                loop {
                    if waiter.wait(cancel::RESEND_INTERVAL) {
                        break;
                    }
                    // The interrupt may have landed before the worker
                    // entered the syscall; keep sending while the slot is
                    // still executing.
                    let sched = self.shared.lock_sched();
                    let still_executing = sched.find(id) == Some(slot)
                        && sched.slot(slot).state == SlotState::Busy;
                    drop(sched);
                    if still_executing {
                        self.interrupt_worker(owner);
                    }
                }
                Ok(CancelStatus::InProgress)
            }
            // find() only returns slots in the pending or busy sets.
            SlotState::Free => Err(CancelError::NotFound),
        }
    }

    fn interrupt_worker(&self, owner: Option<usize>) {
        let Some(owner) = owner else { return };
        let threads = self
            .shared
            .worker_threads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(Some(thread)) = threads.get(owner) {
            thread.interrupt();
        }
    }

    /// Stop dispatching and wait until no worker is mid-syscall, then flush
    /// the store. Queued requests stay queued; submissions remain possible
    /// and are served after [`resume`](Self::resume).
    ///
    /// A flush failure is returned but the backend stays paused.
    pub fn pause(&self) -> io::Result<()> {
        let mut sched = self.shared.lock_sched();
        sched.paused = true;
        while sched.active_workers > 0 {
            sched = self
                .shared
                .drained
                .wait(sched)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        drop(sched);

        if !self.read_only {
            if let Err(err) = self.shared.store.flush() {
                tracing::warn!(error = %err, "flush during pause failed");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Resume dispatch after [`pause`](Self::pause).
    pub fn resume(&self) {
        let mut sched = self.shared.lock_sched();
        sched.paused = false;
        drop(sched);
        self.shared.unpaused.notify_all();
        // Idle workers may be parked on work-available with a backlog that
        // queued up while paused.
        self.shared.work_avail.notify_all();
    }

    /// Shut the backend down: reject new submissions, wake every worker,
    /// join them, and drop still-queued requests without invoking their
    /// callbacks. In-flight requests complete normally first. Idempotent;
    /// also runs on drop.
    pub fn close(&self) {
        let dropped;
        {
            let mut sched = self.shared.lock_sched();
            if sched.closing {
                return;
            }
            sched.closing = true;
            dropped = sched.drain_pending();
        }
        self.shared.work_avail.notify_all();
        self.shared.unpaused.notify_all();

        let handles = {
            let mut handles = self
                .handles
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *handles)
        };
        for handle in handles {
            let _ = handle.join();
        }

        tracing::info!(dropped_pending = dropped, "block backend closed");
    }

    /// Install the callback invoked by [`refresh_size`](Self::refresh_size)
    /// when the store's size has changed. At most one may ever be
    /// registered.
    pub fn register_resize_callback(
        &self,
        callback: impl Fn(u64) + Send + Sync + 'static,
    ) -> Result<(), ResizeCallbackError> {
        let mut slot = self
            .resize_callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return Err(ResizeCallbackError::AlreadyRegistered);
        }
        *slot = Some(Arc::new(callback));
        Ok(())
    }

    /// Re-probe the store's size. On a change, [`size`](Self::size) is
    /// updated, the resize callback (if any) is invoked with the new value,
    /// and the new size is returned. The embedder decides when to poll;
    /// growable disk images change size underneath a running backend.
    pub fn refresh_size(&self) -> io::Result<Option<u64>> {
        let new_size = self.shared.store.capacity_bytes()?;
        let old = self.shared.size.swap(new_size, Ordering::SeqCst);
        if old == new_size {
            return Ok(None);
        }
        tracing::info!(old, new = new_size, "backing store size changed");

        let callback = {
            let slot = self
                .resize_callback
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slot.clone()
        };
        if let Some(callback) = callback {
            callback(new_size);
        }
        Ok(Some(new_size))
    }

    /// Total size of the backing store in bytes, as of open or the last
    /// [`refresh_size`](Self::refresh_size).
    pub fn size(&self) -> u64 {
        self.shared.size.load(Ordering::SeqCst)
    }

    /// Logical sector size in bytes.
    pub fn sector_size(&self) -> u32 {
        self.geometry.logical
    }

    /// Physical sector size in bytes.
    pub fn physical_sector_size(&self) -> u32 {
        self.geometry.physical
    }

    /// Byte offset of the first physical-sector boundary.
    pub fn physical_sector_offset(&self) -> u32 {
        self.geometry.physical_offset
    }

    /// Total request slots: the number of requests that can be admitted
    /// without a completion in between. Controllers size their queues by
    /// this.
    pub fn queue_depth(&self) -> usize {
        self.slot_count
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether discards can reach the store. Actual device support may only
    /// be discovered when the first discard fails with
    /// [`BlockIoError::Unsupported`].
    pub fn can_discard(&self) -> bool {
        self.can_discard
    }
}

impl fmt::Debug for BlockBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockBackend")
            .field("geometry", &self.geometry)
            .field("read_only", &self.read_only)
            .field("can_discard", &self.can_discard)
            .field("slot_count", &self.slot_count)
            .finish_non_exhaustive()
    }
}

impl Drop for BlockBackend {
    fn drop(&mut self) {
        self.close();
    }
}

fn shutdown_workers(shared: &Arc<Shared>, handles: &mut Vec<JoinHandle<()>>) {
    shared.lock_sched().closing = true;
    shared.work_avail.notify_all();
    shared.unpaused.notify_all();
    for handle in handles.drain(..) {
        let _ = handle.join();
    }
}
