//! A client session (§3, §5): one attached (or once-attached) user
//! process, tracked for the lifetime of its `create`/`attach` →
//! `release` interval.

use std::sync::atomic::{AtomicBool, Ordering};

/// Opaque marker for the external payload/shared-memory mapper (the
/// "transceiver" of §3). This crate never reads or writes through it;
/// it only tracks its lifetime against the client session, matching
/// that payload buffers are owned by the session and live strictly
/// within one `create`/`attach` → `release` interval (§5).
pub trait Transceiver: Send + Sync + 'static {}

/// A transceiver that holds no resources, for devices or tests that
/// never touch the shared-memory path directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransceiver;

impl Transceiver for NullTransceiver {}

/// Process-unique identifier for an attached client. Coordinator-
/// assigned; never reused while the coordinator lives.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub(crate) u64);

/// One client's attachment record: its transceiver and the
/// `MARK_AS_SUCCESSFUL` latch consulted at release (§4.3).
pub struct Client<T: Transceiver> {
    pub(crate) id: ClientId,
    pub(crate) transceiver: T,
    marked_successful: AtomicBool,
}

impl<T: Transceiver> Client<T> {
    pub(crate) fn new(id: ClientId, transceiver: T) -> Self {
        Client {
            id,
            transceiver,
            marked_successful: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn transceiver(&self) -> &T {
        &self.transceiver
    }

    /// Latches the per-client success flag (`MARK_AS_SUCCESSFUL`,
    /// §4.3). Idempotent.
    pub fn mark_successful(&self) {
        self.marked_successful.store(true, Ordering::Relaxed);
    }

    pub fn is_marked_successful(&self) -> bool {
        self.marked_successful.load(Ordering::Relaxed)
    }
}
