//! Shared doubles for the backend integration tests.

#![allow(dead_code)]

use std::io::{self, IoSlice, IoSliceMut};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use aero_block_backend::{BlockRequest, BlockResult};
use aero_block_store::{BackingStore, MemStore, SectorGeometry, StoreKind};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Gate that worker threads park on inside the store, so a test controls
/// exactly when an I/O call makes progress.
pub struct Gate {
    state: Mutex<GateState>,
    cond: Condvar,
}

struct GateState {
    open: bool,
    waiting: usize,
}

impl Gate {
    pub fn new() -> Arc<Gate> {
        Arc::new(Gate {
            state: Mutex::new(GateState {
                open: false,
                waiting: 0,
            }),
            cond: Condvar::new(),
        })
    }

    /// Block the calling thread until the gate opens.
    pub fn hold(&self) {
        let mut state = self.state.lock().unwrap();
        state.waiting += 1;
        self.cond.notify_all();
        while !state.open {
            state = self.cond.wait(state).unwrap();
        }
        state.waiting -= 1;
    }

    /// Release every holder, current and future.
    pub fn open(&self) {
        self.state.lock().unwrap().open = true;
        self.cond.notify_all();
    }

    /// Wait until at least `n` threads are parked on the gate.
    pub fn wait_for_holders(&self, n: usize) {
        let deadline = Instant::now() + WAIT_LIMIT;
        let mut state = self.state.lock().unwrap();
        while state.waiting < n {
            let left = deadline
                .checked_duration_since(Instant::now())
                .unwrap_or_else(|| panic!("gate never reached {n} holders"));
            let (next, _) = self.cond.wait_timeout(state, left).unwrap();
            state = next;
        }
    }
}

/// A [`MemStore`] whose reads and writes park on a [`Gate`] before touching
/// memory. Flushes are counted and never gated, so pause can always finish.
pub struct GateStore {
    inner: MemStore,
    gate: Arc<Gate>,
    flushes: Arc<AtomicU32>,
}

impl GateStore {
    pub fn new(capacity: usize, gate: Arc<Gate>) -> GateStore {
        GateStore {
            inner: MemStore::new(capacity),
            gate,
            flushes: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn flush_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.flushes)
    }
}

impl BackingStore for GateStore {
    fn read_vectored_at(&self, offset: u64, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        self.gate.hold();
        self.inner.read_vectored_at(offset, bufs)
    }

    fn write_vectored_at(&self, offset: u64, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.gate.hold();
        self.inner.write_vectored_at(offset, bufs)
    }

    fn flush(&self) -> io::Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.inner.flush()
    }

    fn discard(&self, offset: u64, len: u64) -> io::Result<()> {
        self.inner.discard(offset, len)
    }

    fn capacity_bytes(&self) -> io::Result<u64> {
        self.inner.capacity_bytes()
    }

    fn geometry(&self) -> SectorGeometry {
        self.inner.geometry()
    }

    fn kind(&self) -> StoreKind {
        self.inner.kind()
    }

    fn supports_discard(&self) -> bool {
        self.inner.supports_discard()
    }

    fn read_only(&self) -> bool {
        BackingStore::read_only(&self.inner)
    }
}

pub type Completion = (BlockRequest, BlockResult);

/// A completion callback that forwards the finished request over a channel.
pub fn capture() -> (
    impl FnOnce(BlockRequest, BlockResult) + Send + 'static,
    Receiver<Completion>,
) {
    let (tx, rx) = mpsc::channel();
    let callback = move |request, result| {
        let _ = tx.send((request, result));
    };
    (callback, rx)
}

pub fn recv_completion(rx: &Receiver<Completion>) -> Completion {
    rx.recv_timeout(WAIT_LIMIT).expect("request never completed")
}
