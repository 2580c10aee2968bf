//! The Inverter (§4.1): a bounded slot table that turns the kernel
//! block layer's push-style callback into a pull queue a single
//! attached consumer drains through `begin_get`/`commit_get` and
//! `begin_complete`/`commit_complete`.
//!
//! The whole slot table, the free-list, the ready list, and the
//! pseudo-item flags are guarded by one `parking_lot::Mutex` — the
//! "per-device spinlock" of §5 — so that the hot submit/timeout path
//! never has to touch the process-wide control-coordinator mutex. A
//! `Condvar` on the same lock stands in for the "counting completion
//! with unit semantics" of §3: `submit` and the pseudo-event producers
//! notify it, `begin_get` waits on it.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use crate::error::Error;
use crate::item::{Handle, Item, RequestKind};
use crate::slot::{Slot, SlotState};
use crate::KernelRequest;

/// Which request kinds a device's Inverter will accept through
/// `submit`. Derived once from [`crate::DeviceConfig`] at construction
/// time; unsupported kinds are rejected with `EOPNOTSUPP`/`ENOTTY`
/// rather than ever reaching the slot table.
#[derive(Debug, Copy, Clone, Default)]
pub struct SupportedOps {
    pub read: bool,
    pub write: bool,
    pub write_same: bool,
    pub write_zeros: bool,
    pub fua_write: bool,
    pub flush: bool,
    pub discard: bool,
    pub secure_erase: bool,
    pub ioctl: bool,
}

impl SupportedOps {
    fn supports(&self, kind: &RequestKind) -> bool {
        match kind {
            RequestKind::Read { .. } => self.read,
            RequestKind::Write { .. } => self.write,
            RequestKind::WriteSame { .. } => self.write_same,
            RequestKind::WriteZerosNoUnmap { .. } => self.write_zeros,
            RequestKind::WriteZerosMayUnmap { .. } => self.write_zeros,
            RequestKind::FuaWrite { .. } => self.fua_write,
            RequestKind::Flush => self.flush,
            RequestKind::Discard { .. } => self.discard,
            RequestKind::SecureErase { .. } => self.secure_erase,
            RequestKind::Ioctl { .. } => self.ioctl,
        }
    }
}

/// Outcome of [`Inverter::timeout`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// The request was cancelled and completed with `ETIMEDOUT` (or it
    /// had already completed under a stale handle — either way, the
    /// caller's request is done).
    Done,
    /// The slot is mid-handoff (`BEING_GOTTEN`/`BEING_COMPLETED`);
    /// timing out here would race a reply. The block layer should
    /// reset its timer and try again later.
    ResetTimer,
}

/// Outcome of [`Inverter::begin_complete`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BeginCompleteOutcome {
    /// Reserved for completion; the caller must follow up with
    /// `commit_complete` or `abort_complete`.
    Ready(Item),
    /// The handle's seqnum is stale: some other path (timeout,
    /// terminate) already completed this slot. The reply is silently
    /// dropped — this *is* "ok", not an error (§7, §9).
    Dropped,
    /// The handle's index is in range but the slot isn't
    /// `AWAITING_COMPLETION` — a logic error on the caller's part.
    Invalid,
}

/// Sanitises a raw status per the exact allow-lists of §4.1/§7. These
/// are part of the external contract: they shape the errnos user
/// programs observe on their `read`/`write`/`ioctl` syscalls, so they
/// must not drift without updating §6.4's taxonomy and §8's property.
pub fn sanitize_status(kind: &RequestKind, status: i32) -> i32 {
    if kind.is_ioctl() {
        if status == 0 {
            0
        } else if (1..=133).contains(&status) && status != libc::ENOSYS {
            status
        } else {
            libc::EIO
        }
    } else if status == 0 || status == libc::ENOLINK || status == libc::ENOSPC || status == libc::ETIMEDOUT {
        status
    } else {
        libc::EIO
    }
}

/// The status a request gets when it loses a race against termination,
/// per kind (§4.1: "On termination-race, completes with EIO/ENODEV
/// instead").
fn termination_status(kind: &RequestKind) -> i32 {
    if kind.is_ioctl() {
        libc::ENODEV
    } else {
        libc::EIO
    }
}

fn unsupported_status(kind: &RequestKind) -> i32 {
    if kind.is_ioctl() {
        libc::ENOTTY
    } else {
        libc::EOPNOTSUPP
    }
}

struct State<R: KernelRequest> {
    slots: Vec<Slot<R>>,
    free_list: VecDeque<u16>,
    awaiting_get: VecDeque<u16>,

    terminated: bool,
    deactivated: bool,
    flush_and_terminate_pending: bool,
    device_available_pending: bool,
}

/// Per-device request registry and state machine (§4.1).
pub struct Inverter<R: KernelRequest> {
    state: Mutex<State<R>>,
    item_available: Condvar,
    supported: SupportedOps,
    max_outstanding_reqs: u32,
}

impl<R: KernelRequest> Inverter<R> {
    pub fn new(max_outstanding_reqs: u32, supported: SupportedOps) -> Self {
        let slots = (0..max_outstanding_reqs).map(|_| Slot::new()).collect();
        let free_list = (1..=max_outstanding_reqs as u16).collect();

        Inverter {
            state: Mutex::new(State {
                slots,
                free_list,
                awaiting_get: VecDeque::new(),
                terminated: false,
                deactivated: false,
                flush_and_terminate_pending: false,
                device_available_pending: false,
            }),
            item_available: Condvar::new(),
            supported,
            max_outstanding_reqs,
        }
    }

    pub fn max_outstanding_reqs(&self) -> u32 {
        self.max_outstanding_reqs
    }

    // === Producer path (never sleeps, callable from any context) === //

    /// Submits a kernel block request, returning the handle the
    /// caller should stash in its own request's private data (for use
    /// with [`Inverter::timeout`] later).
    pub fn submit(&self, kind: RequestKind, req: R) -> Result<Handle, Error> {
        let mut state = self.state.lock();

        if state.terminated {
            warn!(?kind, "submit rejected: device is terminated");
            req.complete(termination_status(&kind));
            return Err(Error::Terminated);
        }

        if !self.supported.supports(&kind) {
            warn!(?kind, "submit rejected: request type not supported by this device");
            req.complete(unsupported_status(&kind));
            return Err(Error::Unsupported);
        }

        let Some(index) = state.free_list.pop_front() else {
            debug_assert!(
                false,
                "free-list exhausted: kernel tag set is sized to max_outstanding_reqs"
            );
            error!(?kind, "free-list exhausted despite bounded tag set; rejecting submit");
            drop(state);
            req.complete(libc::EIO);
            return Err(Error::Corrupted);
        };

        {
            let slot = &mut state.slots[index as usize - 1];
            debug_assert_eq!(slot.state, SlotState::Free);
            slot.state = SlotState::AwaitingGet;
            slot.kind = Some(kind);
            slot.req = Some(req);
        }
        state.awaiting_get.push_back(index);

        let handle = Handle {
            index,
            seqnum: state.slots[index as usize - 1].seqnum,
        };

        drop(state);
        self.item_available.notify_one();

        trace!(index, seqnum = handle.seqnum, ?kind, "submitted request");
        Ok(handle)
    }

    /// Delivered by the block layer's timeout callback.
    pub fn timeout(&self, handle: Handle) -> TimeoutOutcome {
        let mut state = self.state.lock();

        let slot = match state.slots.get_mut(handle.index as usize - 1) {
            Some(slot) => slot,
            None => return TimeoutOutcome::Done,
        };

        if slot.seqnum != handle.seqnum {
            // Already completed (and possibly reused) under our feet.
            return TimeoutOutcome::Done;
        }

        match slot.state {
            SlotState::BeingGotten | SlotState::BeingCompleted => TimeoutOutcome::ResetTimer,
            SlotState::Free => TimeoutOutcome::Done,
            SlotState::AwaitingGet | SlotState::AwaitingCompletion => {
                let was_ready = slot.state == SlotState::AwaitingGet;
                debug_assert!(slot.req.is_some(), "non-free slot always has a request");
                let req = slot.req.take();
                slot.state = SlotState::Free;
                slot.seqnum = slot.seqnum.wrapping_add(1);
                slot.kind = None;

                if was_ready {
                    state
                        .awaiting_get
                        .retain(|&i| i != handle.index);
                }
                state.free_list.push_back(handle.index);

                drop(state);
                match req {
                    Some(req) => {
                        warn!(index = handle.index, "request timed out");
                        req.complete(libc::ETIMEDOUT);
                    }
                    None => error!(index = handle.index, "timed-out slot had no request attached"),
                }
                TimeoutOutcome::Done
            }
        }
    }

    /// Arms the one-shot `DEVICE_AVAILABLE` pseudo-item.
    pub fn submit_device_available(&self) {
        let mut state = self.state.lock();
        state.device_available_pending = true;
        drop(state);
        self.item_available.notify_all();
    }

    /// Arms the client-detach signal (and, if `flush` is requested and
    /// supported, the one-shot `FLUSH_AND_TERMINATE` pseudo-item that
    /// precedes it).
    pub fn deactivate(&self, flush: bool) {
        let mut state = self.state.lock();
        state.deactivated = true;
        if flush && self.supported.flush {
            state.flush_and_terminate_pending = true;
        }
        drop(state);
        self.item_available.notify_all();
    }

    /// Clears the client-detach signal, re-arms `DEVICE_AVAILABLE`, and
    /// re-queues every `AWAITING_COMPLETION` slot onto the ready list
    /// so the newly-attached consumer re-handles in-flight requests.
    pub fn activate(&self) {
        let mut state = self.state.lock();
        state.deactivated = false;
        state.flush_and_terminate_pending = false;
        state.device_available_pending = true;

        // Re-queue in-flight requests ahead of anything already
        // waiting, so a resumed worker drains its old backlog first.
        let mut requeued = Vec::new();
        for (i, slot) in state.slots.iter_mut().enumerate() {
            if slot.state == SlotState::AwaitingCompletion {
                slot.state = SlotState::AwaitingGet;
                requeued.push((i + 1) as u16);
            }
        }
        for index in requeued.into_iter().rev() {
            state.awaiting_get.push_front(index);
        }

        drop(state);
        self.item_available.notify_all();
    }

    /// Permanently terminates the device. Idempotent. Cancels every
    /// slot in `AWAITING_GET`/`AWAITING_COMPLETION` with `EIO`.
    pub fn terminate(&self) {
        let mut state = self.state.lock();
        if state.terminated {
            return;
        }
        state.terminated = true;

        let ready: Vec<u16> = state.awaiting_get.drain(..).collect();
        let mut cancelled: Vec<(u16, R)> = Vec::new();

        for index in ready {
            let slot = &mut state.slots[index as usize - 1];
            if let Some(req) = slot.req.take() {
                cancelled.push((index, req));
            }
            slot.state = SlotState::Free;
            slot.seqnum = slot.seqnum.wrapping_add(1);
            slot.kind = None;
            state.free_list.push_back(index);
        }

        for (index, slot) in state.slots.iter_mut().enumerate() {
            if slot.state == SlotState::AwaitingCompletion {
                let index = (index + 1) as u16;
                if let Some(req) = slot.req.take() {
                    cancelled.push((index, req));
                }
                slot.state = SlotState::Free;
                slot.seqnum = slot.seqnum.wrapping_add(1);
                slot.kind = None;
                state.free_list.push_back(index);
            }
        }

        drop(state);
        for (index, req) in cancelled {
            debug!(index, "cancelling in-flight request on terminate");
            req.complete(libc::EIO);
        }
        self.item_available.notify_all();
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    // === Consumer path (single attached worker, signal-interruptible) === //

    /// Blocks until an item is available: a pseudo-item, or a real
    /// slot in `AWAITING_GET`. On success for a real slot, the slot
    /// moves to `BEING_GOTTEN`.
    ///
    /// Signal-interruptibility is the caller's concern (the real
    /// control device wires this into an interruptible wait); this
    /// method takes a `should_wake` hook the caller can use to bail out
    /// of a spurious-wake-safe wait loop on a delivered signal.
    pub fn begin_get(&self, mut should_abort: impl FnMut() -> bool) -> Option<Item> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = Self::try_take_item(&mut state) {
                return Some(item);
            }
            if should_abort() {
                return None;
            }
            self.item_available.wait(&mut state);
        }
    }

    fn try_take_item(state: &mut State<R>) -> Option<Item> {
        if state.terminated {
            return Some(Item::Terminate);
        }
        if state.flush_and_terminate_pending {
            state.flush_and_terminate_pending = false;
            return Some(Item::FlushAndTerminate);
        }
        if state.deactivated {
            return Some(Item::Terminate);
        }
        if state.device_available_pending {
            state.device_available_pending = false;
            return Some(Item::DeviceAvailable);
        }
        if let Some(index) = state.awaiting_get.pop_front() {
            let slot = &mut state.slots[index as usize - 1];
            debug_assert_eq!(slot.state, SlotState::AwaitingGet);
            slot.state = SlotState::BeingGotten;
            let handle = Handle {
                index,
                seqnum: slot.seqnum,
            };
            debug_assert!(slot.kind.is_some(), "non-free slot always has a kind");
            let kind = slot.kind.unwrap_or_else(|| {
                error!(index, "awaiting-get slot had no kind attached");
                RequestKind::Flush
            });
            return Some(Item::Request { handle, kind });
        }
        None
    }

    /// Reserves the slot for completion. For pseudo-items this is a
    /// no-op.
    pub fn commit_get(&self, item: Item) {
        let Some(handle) = item.handle() else {
            return;
        };
        let mut state = self.state.lock();
        let terminated = state.terminated;
        let slot = &mut state.slots[handle.index as usize - 1];
        debug_assert_eq!(slot.state, SlotState::BeingGotten);

        if terminated {
            let req = slot.req.take();
            slot.state = SlotState::Free;
            slot.seqnum = slot.seqnum.wrapping_add(1);
            let kind = slot.kind.take();
            drop(state);
            if let (Some(req), Some(kind)) = (req, kind) {
                req.complete(termination_status(&kind));
            }
            return;
        }

        slot.state = SlotState::AwaitingCompletion;
    }

    /// Undoes a failed transport of the item to user space.
    pub fn abort_get(&self, item: Item) {
        let mut state = self.state.lock();
        match item {
            Item::Request { handle, .. } => {
                let slot = &mut state.slots[handle.index as usize - 1];
                if slot.seqnum == handle.seqnum && slot.state == SlotState::BeingGotten {
                    slot.state = SlotState::AwaitingGet;
                    state.awaiting_get.push_front(handle.index);
                }
            }
            Item::DeviceAvailable => state.device_available_pending = true,
            Item::FlushAndTerminate => state.flush_and_terminate_pending = true,
            Item::Terminate => {}
        }
        drop(state);
        self.item_available.notify_one();
    }

    /// Looks up a slot by handle for completion.
    pub fn begin_complete(&self, handle: Handle) -> BeginCompleteOutcome {
        let mut state = self.state.lock();
        let Some(slot) = state.slots.get_mut(handle.index as usize - 1) else {
            return BeginCompleteOutcome::Invalid;
        };

        if slot.seqnum != handle.seqnum {
            warn!(index = handle.index, seqnum = handle.seqnum, "dropping reply with stale handle");
            return BeginCompleteOutcome::Dropped;
        }

        match slot.state {
            SlotState::AwaitingCompletion => {
                slot.state = SlotState::BeingCompleted;
                debug_assert!(slot.kind.is_some(), "non-free slot always has a kind");
                let Some(kind) = slot.kind else {
                    error!(index = handle.index, "awaiting-completion slot had no kind attached");
                    slot.state = SlotState::AwaitingCompletion;
                    return BeginCompleteOutcome::Invalid;
                };
                BeginCompleteOutcome::Ready(Item::Request { handle, kind })
            }
            _ => BeginCompleteOutcome::Invalid,
        }
    }

    /// Completes the slot's kernel request with a sanitised status and
    /// frees the slot. Returns the status actually applied, after
    /// sanitisation and any termination-race override.
    pub fn commit_complete(&self, item: Item, status: i32) -> i32 {
        debug_assert!(
            matches!(item, Item::Request { .. }),
            "commit_complete called with a pseudo-item"
        );
        let Item::Request { handle, kind } = item else {
            error!("commit_complete called with a pseudo-item; returning EIO");
            return libc::EIO;
        };

        let mut state = self.state.lock();
        let terminated = state.terminated;
        let slot = &mut state.slots[handle.index as usize - 1];
        debug_assert_eq!(slot.state, SlotState::BeingCompleted);

        let applied = if terminated {
            termination_status(&kind)
        } else {
            sanitize_status(&kind, status)
        };

        let req = slot.req.take();
        slot.state = SlotState::Free;
        slot.seqnum = slot.seqnum.wrapping_add(1);
        slot.kind = None;
        state.free_list.push_back(handle.index);

        drop(state);
        trace!(index = handle.index, seqnum = handle.seqnum, ?kind, status = applied, "completed request");
        if let Some(req) = req {
            req.complete(applied);
        }
        applied
    }

    /// Puts a reserved-for-completion slot back, e.g. because
    /// delivering the reply to the completion path failed transiently.
    pub fn abort_complete(&self, item: Item) {
        let Item::Request { handle, .. } = item else {
            return;
        };
        let mut state = self.state.lock();
        let slot = &mut state.slots[handle.index as usize - 1];
        if slot.seqnum == handle.seqnum && slot.state == SlotState::BeingCompleted {
            slot.state = SlotState::AwaitingCompletion;
        }
    }

    #[cfg(test)]
    pub(crate) fn slot_counts(&self) -> (usize, usize, usize, usize, usize) {
        let state = self.state.lock();
        let mut counts = (0, 0, 0, 0, 0);
        for slot in &state.slots {
            match slot.state {
                SlotState::Free => counts.0 += 1,
                SlotState::AwaitingGet => counts.1 += 1,
                SlotState::BeingGotten => counts.2 += 1,
                SlotState::AwaitingCompletion => counts.3 += 1,
                SlotState::BeingCompleted => counts.4 += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;

    struct TestRequest {
        tx: mpsc::Sender<i32>,
    }

    impl KernelRequest for TestRequest {
        fn complete(self, status: i32) {
            let _ = self.tx.send(status);
        }
    }

    fn req() -> (TestRequest, mpsc::Receiver<i32>) {
        let (tx, rx) = mpsc::channel();
        (TestRequest { tx }, rx)
    }

    fn full_ops() -> SupportedOps {
        SupportedOps {
            read: true,
            write: true,
            write_same: true,
            write_zeros: true,
            fua_write: true,
            flush: true,
            discard: true,
            secure_erase: true,
            ioctl: true,
        }
    }

    #[test]
    fn slot_counts_conserved() {
        let inv: Inverter<TestRequest> = Inverter::new(4, full_ops());
        assert_eq!(inv.slot_counts(), (4, 0, 0, 0, 0));

        let (r, _rx) = req();
        inv.submit(RequestKind::Flush, r).unwrap();
        assert_eq!(inv.slot_counts(), (3, 1, 0, 0, 0));
    }

    #[test]
    fn unsupported_type_rejected_with_eopnotsupp() {
        let inv: Inverter<TestRequest> = Inverter::new(
            4,
            SupportedOps {
                read: true,
                ..Default::default()
            },
        );
        let (r, rx) = req();
        let err = inv.submit(RequestKind::Write { offset: 0, size: 4096 }, r).unwrap_err();
        assert_eq!(err, Error::Unsupported);
        assert_eq!(rx.recv().unwrap(), libc::EOPNOTSUPP);
    }

    #[test]
    fn unsupported_ioctl_maps_to_enotty() {
        let inv: Inverter<TestRequest> = Inverter::new(4, SupportedOps::default());
        let (r, rx) = req();
        inv.submit(RequestKind::Ioctl { command: 1 }, r).unwrap_err();
        assert_eq!(rx.recv().unwrap(), libc::ENOTTY);
    }

    #[test]
    fn full_round_trip_completes_successfully() {
        let inv: Inverter<TestRequest> = Inverter::new(4, full_ops());
        let (r, rx) = req();
        inv.submit(RequestKind::Read { offset: 0, size: 4096 }, r).unwrap();

        let item = inv.begin_get(|| false).unwrap();
        let handle = item.handle().unwrap();
        inv.commit_get(item);

        let item2 = match inv.begin_complete(handle) {
            BeginCompleteOutcome::Ready(item) => item,
            other => panic!("unexpected outcome: {other:?}"),
        };
        let status = inv.commit_complete(item2, 0);
        assert_eq!(status, 0);
        assert_eq!(rx.recv().unwrap(), 0);
        assert_eq!(inv.slot_counts(), (4, 0, 0, 0, 0));
    }

    #[test]
    fn submit_begin_get_abort_get_begin_get_returns_same_slot() {
        let inv: Inverter<TestRequest> = Inverter::new(4, full_ops());
        let (r, _rx) = req();
        inv.submit(RequestKind::Flush, r).unwrap();

        let item1 = inv.begin_get(|| false).unwrap();
        let handle1 = item1.handle().unwrap();
        inv.abort_get(item1);

        let item2 = inv.begin_get(|| false).unwrap();
        let handle2 = item2.handle().unwrap();
        assert_eq!(handle1, handle2);
    }

    #[test]
    fn timeout_on_awaiting_get_completes_with_etimedout_and_bumps_seqnum() {
        let inv: Inverter<TestRequest> = Inverter::new(4, full_ops());
        let (r, rx) = req();
        let handle = inv.submit(RequestKind::Read { offset: 0, size: 512 }, r).unwrap();

        assert_eq!(inv.timeout(handle), TimeoutOutcome::Done);
        assert_eq!(rx.recv().unwrap(), libc::ETIMEDOUT);

        // Stale handle is now silently ignored.
        assert_eq!(inv.timeout(handle), TimeoutOutcome::Done);
    }

    #[test]
    fn timeout_during_handoff_resets_timer_instead_of_cancelling() {
        let inv: Inverter<TestRequest> = Inverter::new(4, full_ops());
        let (r, _rx) = req();
        let handle = inv.submit(RequestKind::Flush, r).unwrap();
        let item = inv.begin_get(|| false).unwrap();
        assert_eq!(item.handle().unwrap(), handle);

        assert_eq!(inv.timeout(handle), TimeoutOutcome::ResetTimer);
    }

    #[test]
    fn stale_reply_is_silently_dropped() {
        let inv: Inverter<TestRequest> = Inverter::new(4, full_ops());
        let (r, rx) = req();
        let handle = inv.submit(RequestKind::Flush, r).unwrap();
        inv.timeout(handle); // completes with ETIMEDOUT, bumps seqnum
        assert_eq!(rx.recv().unwrap(), libc::ETIMEDOUT);

        assert_eq!(inv.begin_complete(handle), BeginCompleteOutcome::Dropped);
    }

    #[test]
    fn begin_complete_state_mismatch_is_invalid() {
        let inv: Inverter<TestRequest> = Inverter::new(4, full_ops());
        let (r, _rx) = req();
        let handle = inv.submit(RequestKind::Flush, r).unwrap();
        // Slot is AWAITING_GET, not AWAITING_COMPLETION yet.
        assert_eq!(inv.begin_complete(handle), BeginCompleteOutcome::Invalid);
    }

    #[test]
    fn terminate_cancels_ready_and_awaiting_completion_with_eio() {
        let inv: Inverter<TestRequest> = Inverter::new(4, full_ops());

        let (r1, rx1) = req();
        inv.submit(RequestKind::Flush, r1).unwrap();

        let (r2, rx2) = req();
        let h2 = inv.submit(RequestKind::Flush, r2).unwrap();
        let item2 = inv.begin_get(|| false).unwrap();
        assert_eq!(item2.handle().unwrap(), h2);
        inv.commit_get(item2); // -> AWAITING_COMPLETION

        inv.terminate();

        assert_eq!(rx1.recv().unwrap(), libc::EIO);
        assert_eq!(rx2.recv().unwrap(), libc::EIO);
        assert_eq!(inv.slot_counts(), (4, 0, 0, 0, 0));
    }

    #[test]
    fn terminate_is_idempotent() {
        let inv: Inverter<TestRequest> = Inverter::new(4, full_ops());
        inv.terminate();
        inv.terminate();
        assert!(inv.is_terminated());
        assert_eq!(inv.begin_get(|| false).unwrap(), Item::Terminate);
    }

    #[test]
    fn begin_get_returns_terminate_forever_after_terminate() {
        let inv: Inverter<TestRequest> = Inverter::new(4, full_ops());
        inv.terminate();
        for _ in 0..3 {
            assert_eq!(inv.begin_get(|| false).unwrap(), Item::Terminate);
        }
    }

    #[test]
    fn deactivate_with_flush_yields_exactly_one_flush_and_terminate_then_terminate() {
        let inv: Inverter<TestRequest> = Inverter::new(4, full_ops());
        inv.deactivate(true);

        assert_eq!(inv.begin_get(|| false).unwrap(), Item::FlushAndTerminate);
        assert_eq!(inv.begin_get(|| false).unwrap(), Item::Terminate);
        assert_eq!(inv.begin_get(|| false).unwrap(), Item::Terminate);
    }

    #[test]
    fn deactivate_without_flush_yields_only_terminate() {
        let inv: Inverter<TestRequest> = Inverter::new(4, full_ops());
        inv.deactivate(false);
        assert_eq!(inv.begin_get(|| false).unwrap(), Item::Terminate);
    }

    #[test]
    fn device_available_precedes_real_items() {
        let inv: Inverter<TestRequest> = Inverter::new(4, full_ops());
        let (r, _rx) = req();
        inv.submit(RequestKind::Flush, r).unwrap();
        inv.submit_device_available();

        assert_eq!(inv.begin_get(|| false).unwrap(), Item::DeviceAvailable);
        let item = inv.begin_get(|| false).unwrap();
        assert!(matches!(item, Item::Request { .. }));
    }

    #[test]
    fn activate_requeues_awaiting_completion_slots() {
        let inv: Inverter<TestRequest> = Inverter::new(4, full_ops());
        let (r, _rx) = req();
        let handle = inv.submit(RequestKind::Flush, r).unwrap();
        let item = inv.begin_get(|| false).unwrap();
        inv.commit_get(item); // now AWAITING_COMPLETION

        inv.deactivate(false);
        assert_eq!(inv.begin_get(|| false).unwrap(), Item::Terminate);

        inv.activate();
        assert_eq!(inv.begin_get(|| false).unwrap(), Item::DeviceAvailable);
        let reissued = inv.begin_get(|| false).unwrap();
        assert_eq!(reissued.handle().unwrap(), handle);
    }

    #[test]
    fn begin_get_can_be_aborted_without_an_item() {
        let inv: Inverter<TestRequest> = Inverter::new(4, full_ops());
        assert_eq!(inv.begin_get(|| true), None);
    }

    #[test]
    fn sanitizes_non_ioctl_status_allow_list() {
        let kind = RequestKind::Read { offset: 0, size: 1 };
        assert_eq!(sanitize_status(&kind, 0), 0);
        assert_eq!(sanitize_status(&kind, libc::ENOLINK), libc::ENOLINK);
        assert_eq!(sanitize_status(&kind, libc::ENOSPC), libc::ENOSPC);
        assert_eq!(sanitize_status(&kind, libc::ETIMEDOUT), libc::ETIMEDOUT);
        assert_eq!(sanitize_status(&kind, libc::EPERM), libc::EIO);
    }

    #[test]
    fn sanitizes_ioctl_status_allow_list() {
        let kind = RequestKind::Ioctl { command: 1 };
        assert_eq!(sanitize_status(&kind, 0), 0);
        assert_eq!(sanitize_status(&kind, 133), 133);
        assert_eq!(sanitize_status(&kind, 134), libc::EIO);
        assert_eq!(sanitize_status(&kind, libc::ENOSYS), libc::EIO);
    }

    #[test]
    fn arc_across_threads() {
        let inv = Arc::new(Inverter::<TestRequest>::new(4, full_ops()));
        let inv2 = inv.clone();
        let handle = std::thread::spawn(move || {
            let (r, rx) = req();
            let h = inv2.submit(RequestKind::Flush, r).unwrap();
            (h, rx)
        })
        .join()
        .unwrap();

        let item = inv.begin_get(|| false).unwrap();
        assert_eq!(item.handle().unwrap(), handle.0);
    }
}
