//! Slot arena and scheduling state machine.
//!
//! Everything in here is mutated only while holding the backend's scheduler
//! mutex; [`Sched`] itself is a plain state machine with no locking of its
//! own, which keeps the transitions testable without threads.
//!
//! Slots live in a fixed arena and are addressed by index. Three collections
//! partition the arena at all times: `free` (unused), `pending` (admitted,
//! in submission order) and `busy` (claimed by a worker, including the short
//! window after the syscall returns while the completion callback runs).

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use crate::cancel::CancelWaiter;
use crate::request::{BlockOp, BlockRequest, RequestId};

pub(crate) type SlotId = usize;

/// Scheduling key. Requests with equal keys are executed one at a time, in
/// submission order.
///
/// The key is the request's *starting offset*, not its full byte range: two
/// transfers whose ranges overlap but start at different offsets are not
/// serialized against each other. Controllers do not issue overlapping
/// split requests, and keying on the start keeps the conflict scan a cheap
/// equality test. Flushes serialize only against other flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConflictKey {
    Offset(u64),
    Flush,
}

impl ConflictKey {
    pub(crate) fn for_op(op: BlockOp, offset: u64) -> ConflictKey {
        match op {
            BlockOp::Flush => ConflictKey::Flush,
            BlockOp::Read | BlockOp::Write | BlockOp::Discard => ConflictKey::Offset(offset),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    Free,
    /// Admitted and waiting. `dispatchable: false` means blocked behind an
    /// in-flight slot with the same key.
    Pending { dispatchable: bool },
    /// Claimed by a worker, syscall possibly in progress.
    Busy,
    /// Syscall returned; the worker is delivering the callback and has not
    /// yet run completion bookkeeping. Cancellation no longer interrupts the
    /// owner in this state.
    Done,
}

pub(crate) struct Slot {
    pub(crate) state: SlotState,
    pub(crate) op: BlockOp,
    pub(crate) key: ConflictKey,
    /// Identity of the admitted request; 0 while free.
    pub(crate) req_id: u64,
    /// Index of the worker executing this slot. Valid in Busy and Done.
    pub(crate) owner: Option<usize>,
    /// Present while Pending; moves out to the worker on dequeue.
    pub(crate) request: Option<BlockRequest>,
    /// Set by `cancel` on a Busy slot; the worker checks it when a syscall
    /// comes back interrupted.
    pub(crate) cancel_requested: bool,
    /// Cancellers waiting for this slot's completion.
    pub(crate) cancel_waiters: Vec<Arc<CancelWaiter>>,
}

impl Slot {
    fn free() -> Slot {
        Slot {
            state: SlotState::Free,
            op: BlockOp::Read,
            key: ConflictKey::Offset(0),
            req_id: 0,
            owner: None,
            request: None,
            cancel_requested: false,
            cancel_waiters: Vec::new(),
        }
    }
}

/// Result of [`Sched::complete`], to be acted on after the lock is dropped.
pub(crate) struct Completion {
    /// A blocked slot with the completed slot's key became dispatchable;
    /// the caller signals work-available.
    pub(crate) unblocked: bool,
    /// Cancellers to wake.
    pub(crate) waiters: Vec<Arc<CancelWaiter>>,
}

/// Scheduler state: the slot arena, the three sets, and the lifecycle flags
/// the worker loop consults. One instance lives inside the backend's mutex.
pub(crate) struct Sched {
    slots: Box<[Slot]>,
    free: Vec<SlotId>,
    pending: VecDeque<SlotId>,
    busy: Vec<SlotId>,
    pub(crate) active_workers: usize,
    pub(crate) paused: bool,
    pub(crate) closing: bool,
    next_req_id: u64,
}

impl Sched {
    pub(crate) fn new(capacity: usize) -> Sched {
        Sched {
            slots: (0..capacity).map(|_| Slot::free()).collect(),
            free: (0..capacity).collect(),
            pending: VecDeque::with_capacity(capacity),
            busy: Vec::with_capacity(capacity),
            active_workers: 0,
            paused: false,
            closing: false,
            next_req_id: 1,
        }
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slot(&self, id: SlotId) -> &Slot {
        &self.slots[id]
    }

    pub(crate) fn slot_mut(&mut self, id: SlotId) -> &mut Slot {
        &mut self.slots[id]
    }

    /// Admit a request, or hand it back if no free slot exists.
    ///
    /// The new slot is dispatchable unless some pending or busy slot already
    /// carries the same key, in which case it queues behind it (state machine
    /// "Blocked").
    pub(crate) fn enqueue(
        &mut self,
        op: BlockOp,
        request: BlockRequest,
    ) -> Result<(SlotId, RequestId), BlockRequest> {
        let Some(id) = self.free.pop() else {
            return Err(request);
        };

        let key = ConflictKey::for_op(op, request.offset);
        let conflict = self
            .pending
            .iter()
            .chain(self.busy.iter())
            .any(|&other| self.slots[other].key == key);

        let req_id = self.next_req_id;
        self.next_req_id += 1;

        let slot = &mut self.slots[id];
        debug_assert_eq!(slot.state, SlotState::Free);
        slot.state = SlotState::Pending {
            dispatchable: !conflict,
        };
        slot.op = op;
        slot.key = key;
        slot.req_id = req_id;
        slot.owner = None;
        slot.request = Some(request);
        slot.cancel_requested = false;

        self.pending.push_back(id);
        Ok((id, RequestId(req_id)))
    }

    /// Claim the oldest dispatchable pending slot for `worker`, taking its
    /// request payload out.
    pub(crate) fn dequeue(&mut self, worker: usize) -> Option<(SlotId, BlockOp, BlockRequest)> {
        let pos = self.pending.iter().position(|&id| {
            matches!(self.slots[id].state, SlotState::Pending { dispatchable: true })
        })?;
        let id = self.pending.remove(pos)?;
        self.busy.push(id);

        let slot = &mut self.slots[id];
        slot.state = SlotState::Busy;
        slot.owner = Some(worker);
        let request = slot.request.take();
        debug_assert!(request.is_some(), "pending slot without request");
        Some((id, slot.op, request?))
    }

    /// Record that `id`'s syscall has returned; the owner is about to run
    /// the completion callback.
    pub(crate) fn mark_done(&mut self, id: SlotId) {
        let slot = &mut self.slots[id];
        debug_assert_eq!(slot.state, SlotState::Busy);
        slot.state = SlotState::Done;
    }

    /// Retire `id`: remove it from its set, promote the first blocked slot
    /// with the same key if `id` held that key, and recycle it to the free
    /// list.
    pub(crate) fn complete(&mut self, id: SlotId) -> Completion {
        let state = self.slots[id].state;
        let key = self.slots[id].key;

        // Only the key holder gates same-key slots. A blocked slot being
        // retired here (pending cancellation) must leave the chain alone or
        // two same-key requests could end up in flight at once.
        let was_holder = matches!(
            state,
            SlotState::Busy | SlotState::Done | SlotState::Pending { dispatchable: true }
        );

        match state {
            SlotState::Pending { .. } => {
                let pos = self.pending.iter().position(|&p| p == id);
                debug_assert!(pos.is_some(), "slot not in pending set");
                if let Some(pos) = pos {
                    self.pending.remove(pos);
                }
            }
            SlotState::Busy | SlotState::Done => {
                let pos = self.busy.iter().position(|&p| p == id);
                debug_assert!(pos.is_some(), "slot not in busy set");
                if let Some(pos) = pos {
                    self.busy.swap_remove(pos);
                }
            }
            SlotState::Free => {
                debug_assert!(false, "completing a free slot");
            }
        }

        let mut unblocked = false;
        if was_holder {
            for &pending_id in &self.pending {
                let slot = &mut self.slots[pending_id];
                if slot.key == key {
                    debug_assert_eq!(slot.state, SlotState::Pending { dispatchable: false });
                    slot.state = SlotState::Pending { dispatchable: true };
                    unblocked = true;
                    break;
                }
            }
        }

        let slot = &mut self.slots[id];
        debug_assert!(slot.request.is_none(), "retiring a slot that still owns its request");
        slot.state = SlotState::Free;
        slot.req_id = 0;
        slot.owner = None;
        slot.cancel_requested = false;
        let waiters = mem::take(&mut slot.cancel_waiters);
        self.free.push(id);

        Completion { unblocked, waiters }
    }

    /// Find the slot an admitted request currently occupies.
    pub(crate) fn find(&self, id: RequestId) -> Option<SlotId> {
        self.pending
            .iter()
            .chain(self.busy.iter())
            .copied()
            .find(|&s| self.slots[s].req_id == id.0)
    }

    /// Drop every pending request without invoking callbacks. Busy slots are
    /// left alone; their workers complete them before exiting.
    pub(crate) fn drain_pending(&mut self) -> usize {
        let mut dropped = 0;
        while let Some(id) = self.pending.pop_front() {
            let slot = &mut self.slots[id];
            debug_assert!(matches!(slot.state, SlotState::Pending { .. }));
            debug_assert!(slot.cancel_waiters.is_empty());
            drop(slot.request.take());
            slot.state = SlotState::Free;
            slot.req_id = 0;
            slot.owner = None;
            slot.cancel_requested = false;
            self.free.push(id);
            dropped += 1;
        }
        dropped
    }

    #[cfg(test)]
    pub(crate) fn set_sizes(&self) -> (usize, usize, usize) {
        (self.free.len(), self.pending.len(), self.busy.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(offset: u64, len: usize) -> BlockRequest {
        BlockRequest::transfer(offset, vec![vec![0u8; len]], |_, _| {})
    }

    fn dispatchable(sched: &Sched, id: SlotId) -> bool {
        matches!(sched.slot(id).state, SlotState::Pending { dispatchable: true })
    }

    #[test]
    fn enqueue_fails_fast_when_full() {
        let mut sched = Sched::new(2);
        sched.enqueue(BlockOp::Read, req(0, 512)).unwrap();
        sched.enqueue(BlockOp::Read, req(512, 512)).unwrap();
        let rejected = sched.enqueue(BlockOp::Read, req(1024, 512)).unwrap_err();
        assert_eq!(rejected.offset, 1024);

        // Completing one request frees a slot again.
        let (id, _, r) = sched.dequeue(0).unwrap();
        drop(r);
        sched.mark_done(id);
        sched.complete(id);
        sched.enqueue(BlockOp::Read, req(1024, 512)).unwrap();
    }

    #[test]
    fn same_offset_requests_queue_behind_each_other() {
        let mut sched = Sched::new(4);
        let (a, _) = sched.enqueue(BlockOp::Write, req(100, 16)).unwrap();
        let (b, _) = sched.enqueue(BlockOp::Write, req(100, 16)).unwrap();
        let (c, _) = sched.enqueue(BlockOp::Write, req(200, 16)).unwrap();

        assert!(dispatchable(&sched, a));
        assert!(!dispatchable(&sched, b));
        assert!(dispatchable(&sched, c));

        // Dequeue order: a (oldest dispatchable), then c; b stays blocked
        // behind a.
        let (first, _, r1) = sched.dequeue(0).unwrap();
        assert_eq!(first, a);
        let (second, _, r2) = sched.dequeue(1).unwrap();
        assert_eq!(second, c);
        assert!(sched.dequeue(2).is_none());

        // a completes; b becomes dispatchable.
        drop(r1);
        sched.mark_done(a);
        let done = sched.complete(a);
        assert!(done.unblocked);
        assert!(dispatchable(&sched, b));

        drop(r2);
        sched.mark_done(c);
        assert!(!sched.complete(c).unblocked);
    }

    #[test]
    fn conflicts_are_detected_against_busy_slots() {
        let mut sched = Sched::new(4);
        let (a, _) = sched.enqueue(BlockOp::Write, req(4096, 16)).unwrap();
        let (got, _, r) = sched.dequeue(0).unwrap();
        assert_eq!(got, a);

        // a is now busy with no pending twin; a new request to the same
        // offset must still block behind it.
        let (b, _) = sched.enqueue(BlockOp::Read, req(4096, 16)).unwrap();
        assert!(!dispatchable(&sched, b));
        assert!(sched.dequeue(1).is_none());

        drop(r);
        sched.mark_done(a);
        assert!(sched.complete(a).unblocked);
        assert!(dispatchable(&sched, b));
    }

    #[test]
    fn flushes_serialize_only_against_flushes() {
        let mut sched = Sched::new(4);
        let (_w, _) = sched.enqueue(BlockOp::Write, req(0, 16)).unwrap();
        let (f1, _) = sched
            .enqueue(BlockOp::Flush, BlockRequest::flush(|_, _| {}))
            .unwrap();
        let (f2, _) = sched
            .enqueue(BlockOp::Flush, BlockRequest::flush(|_, _| {}))
            .unwrap();

        // The write at offset 0 does not block the first flush, despite the
        // flush request also carrying offset 0.
        assert!(dispatchable(&sched, f1));
        assert!(!dispatchable(&sched, f2));
    }

    #[test]
    fn cancelling_a_blocked_slot_leaves_the_chain_intact() {
        let mut sched = Sched::new(4);
        let (a, _) = sched.enqueue(BlockOp::Write, req(100, 16)).unwrap();
        let (b, _) = sched.enqueue(BlockOp::Write, req(100, 16)).unwrap();
        let (c, _) = sched.enqueue(BlockOp::Write, req(100, 16)).unwrap();

        let (got, _, r) = sched.dequeue(0).unwrap();
        assert_eq!(got, a);

        // Cancel b (blocked, not the holder): c must NOT become
        // dispatchable, a is still in flight.
        drop(sched.slot_mut(b).request.take());
        let done = sched.complete(b);
        assert!(!done.unblocked);
        assert!(!dispatchable(&sched, c));

        drop(r);
        sched.mark_done(a);
        assert!(sched.complete(a).unblocked);
        assert!(dispatchable(&sched, c));
    }

    #[test]
    fn cancelling_an_undispatched_holder_promotes_the_next_in_line() {
        let mut sched = Sched::new(4);
        let (a, _) = sched.enqueue(BlockOp::Write, req(100, 16)).unwrap();
        let (b, _) = sched.enqueue(BlockOp::Write, req(100, 16)).unwrap();

        // a is dispatchable but no worker has claimed it; cancelling it must
        // hand the key to b.
        drop(sched.slot_mut(a).request.take());
        assert!(sched.complete(a).unblocked);
        assert!(dispatchable(&sched, b));
    }

    #[test]
    fn find_locates_requests_until_completion() {
        let mut sched = Sched::new(2);
        let (slot, id) = sched.enqueue(BlockOp::Read, req(0, 16)).unwrap();
        assert_eq!(sched.find(id), Some(slot));

        let (_, _, r) = sched.dequeue(0).unwrap();
        assert_eq!(sched.find(id), Some(slot));

        drop(r);
        sched.mark_done(slot);
        sched.complete(slot);
        assert_eq!(sched.find(id), None);

        // Ids are not reused: a new request gets a fresh id and the old one
        // stays unresolvable.
        let (_, id2) = sched.enqueue(BlockOp::Read, req(0, 16)).unwrap();
        assert_ne!(id, id2);
        assert_eq!(sched.find(id), None);
    }

    #[test]
    fn drain_pending_recycles_without_touching_busy() {
        let mut sched = Sched::new(4);
        sched.enqueue(BlockOp::Read, req(0, 16)).unwrap();
        sched.enqueue(BlockOp::Read, req(512, 16)).unwrap();
        let (busy_id, _, r) = sched.dequeue(0).unwrap();

        assert_eq!(sched.drain_pending(), 1);
        let (free, pending, busy) = sched.set_sizes();
        assert_eq!((free, pending, busy), (3, 0, 1));

        drop(r);
        sched.mark_done(busy_id);
        sched.complete(busy_id);
        assert_eq!(sched.set_sizes(), (4, 0, 0));
    }

    // Model-based randomized exercise of the scheduling rules. A tiny
    // deterministic RNG drives enqueue/dequeue/complete/cancel against a
    // reference model tracking per-key submission order; the invariants
    // checked are slot conservation, the admission bound, per-key mutual
    // exclusion, and per-key FIFO dispatch.
    struct Rng(u64);

    impl Rng {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }

        fn below(&mut self, n: u64) -> u64 {
            self.next() % n
        }
    }

    #[test]
    fn randomized_scheduling_respects_ordering_and_capacity() {
        use std::collections::HashMap;

        const CAPACITY: usize = 8;
        const KEYS: [u64; 3] = [0, 512, 4096];

        let mut rng = Rng(0x1234_5678_9abc_def0);
        let mut sched = Sched::new(CAPACITY);

        // Reference model: per key, submission order of live request ids and
        // whether one of them is executing.
        #[derive(Default)]
        struct KeyModel {
            fifo: VecDeque<u64>,
            executing: Option<u64>,
        }
        let mut model: HashMap<u64, KeyModel> = HashMap::new();
        let mut in_flight: Vec<(SlotId, u64, u64)> = Vec::new(); // slot, key, req_id
        let mut live = 0usize;

        for _ in 0..50_000 {
            match rng.below(4) {
                // Enqueue.
                0 => {
                    let key = KEYS[rng.below(KEYS.len() as u64) as usize];
                    match sched.enqueue(BlockOp::Write, req(key, 8)) {
                        Ok((_slot, id)) => {
                            assert!(live < CAPACITY, "admitted past capacity");
                            live += 1;
                            model.entry(key).or_default().fifo.push_back(id.0);
                        }
                        Err(_) => assert_eq!(live, CAPACITY, "rejected below capacity"),
                    }
                }
                // Dequeue.
                1 => {
                    let worker = rng.below(4) as usize;
                    if let Some((slot, _, request)) = sched.dequeue(worker) {
                        let key = request.offset;
                        let entry = model.get_mut(&key).unwrap();
                        assert!(
                            entry.executing.is_none(),
                            "two requests in flight for key {key}"
                        );
                        let req_id = sched.slot(slot).req_id;
                        assert_eq!(
                            entry.fifo.front().copied(),
                            Some(req_id),
                            "dispatched out of submission order for key {key}"
                        );
                        entry.fifo.pop_front();
                        entry.executing = Some(req_id);
                        in_flight.push((slot, key, req_id));
                        drop(request);
                    }
                }
                // Complete a random in-flight request.
                2 => {
                    if !in_flight.is_empty() {
                        let pick = rng.below(in_flight.len() as u64) as usize;
                        let (slot, key, req_id) = in_flight.swap_remove(pick);
                        sched.mark_done(slot);
                        sched.complete(slot);
                        let entry = model.get_mut(&key).unwrap();
                        assert_eq!(entry.executing, Some(req_id));
                        entry.executing = None;
                        live -= 1;
                    }
                }
                // Cancel a random pending request (holder or blocked).
                _ => {
                    let pending: Vec<SlotId> = (0..sched.capacity())
                        .filter(|&id| matches!(sched.slot(id).state, SlotState::Pending { .. }))
                        .collect();
                    if !pending.is_empty() {
                        let slot = pending[rng.below(pending.len() as u64) as usize];
                        let key = match sched.slot(slot).key {
                            ConflictKey::Offset(key) => key,
                            ConflictKey::Flush => unreachable!(),
                        };
                        let req_id = sched.slot(slot).req_id;
                        drop(sched.slot_mut(slot).request.take());
                        sched.complete(slot);
                        let entry = model.get_mut(&key).unwrap();
                        let pos = entry.fifo.iter().position(|&r| r == req_id).unwrap();
                        entry.fifo.remove(pos);
                        live -= 1;
                    }
                }
            }

            // Conservation: the three sets always partition the arena.
            let (free, pending, busy) = sched.set_sizes();
            assert_eq!(free + pending + busy, CAPACITY);
            assert_eq!(pending + busy, live);
            assert_eq!(busy, in_flight.len());
        }
    }
}
