use crate::item::RequestKind;
use crate::KernelRequest;

/// A request slot's position in the state machine of §4.1. Only `Free`
/// (on the free-list) and `AwaitingGet` (on the ready list) are list
/// membership; the other three states mean "detached, held exclusively
/// by whichever consumer operation reserved it", looked up directly by
/// handle rather than iterated.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SlotState {
    Free,
    AwaitingGet,
    BeingGotten,
    AwaitingCompletion,
    BeingCompleted,
}

pub(crate) struct Slot<R: KernelRequest> {
    pub state: SlotState,
    /// Incremented on every transition back to `Free`. Forms the
    /// externally-visible handle together with the slot's index.
    pub seqnum: u64,
    /// `Some` whenever `state != Free`.
    pub kind: Option<RequestKind>,
    pub req: Option<R>,
}

impl<R: KernelRequest> Slot<R> {
    pub fn new() -> Self {
        Slot {
            state: SlotState::Free,
            seqnum: 0,
            kind: None,
            req: None,
        }
    }
}
