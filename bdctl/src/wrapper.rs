//! The per-slot bundle the coordinator's index table holds: a device,
//! its attached client (if any), and the per-device handover
//! completion described in §4.3/§5.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use bdcore::{BlockLayer, Device, KernelRequest};

use crate::client::{Client, ClientId, Transceiver};

struct HandoverState {
    client: Option<ClientId>,
    /// Set while `attach` is waiting for the previously attached
    /// client to detach; a second concurrent `attach` sees this and
    /// fails `EINPROGRESS` instead of queuing behind it.
    in_progress: bool,
}

/// A device slot: the device state machine, its current client (if
/// any), and the handover completion other clients block on.
pub struct DeviceWrapper<R: KernelRequest, B: BlockLayer, T: Transceiver> {
    pub id: u64,
    pub device: Arc<Device<R, B>>,
    client: Mutex<Option<Client<T>>>,
    handover: Mutex<HandoverState>,
    detached: Condvar,
}

impl<R: KernelRequest, B: BlockLayer, T: Transceiver> DeviceWrapper<R, B, T> {
    pub fn new(id: u64, device: Arc<Device<R, B>>) -> Self {
        DeviceWrapper {
            id,
            device,
            client: Mutex::new(None),
            handover: Mutex::new(HandoverState {
                client: None,
                in_progress: false,
            }),
            detached: Condvar::new(),
        }
    }

    pub fn recoverable(&self) -> bool {
        self.device.config().recoverable
    }

    pub fn is_read_only(&self) -> bool {
        self.device.is_read_only()
    }

    pub fn has_client(&self) -> bool {
        self.client.lock().is_some()
    }

    pub fn with_client<F, A>(&self, f: F) -> Option<A>
    where
        F: FnOnce(&Client<T>) -> A,
    {
        self.client.lock().as_ref().map(f)
    }

    /// Attaches `client` unconditionally; the caller is responsible
    /// for having already ensured no client is attached (or for having
    /// just detached the old one).
    pub fn attach_client(&self, client: Client<T>) {
        let id = client.id();
        *self.client.lock() = Some(client);
        self.handover.lock().client = Some(id);
    }

    /// Detaches whichever client is attached, if any, and wakes
    /// anyone blocked in [`DeviceWrapper::wait_for_detach`].
    pub fn detach_client(&self) -> Option<Client<T>> {
        let old = self.client.lock().take();
        self.handover.lock().client = None;
        self.detached.notify_all();
        old
    }

    /// Whether some other thread is currently blocked in `attach`
    /// waiting for this device's client to detach.
    pub fn has_waiter(&self) -> bool {
        self.handover.lock().in_progress
    }

    pub fn begin_handover(&self) -> bool {
        let mut h = self.handover.lock();
        if h.in_progress {
            false
        } else {
            h.in_progress = true;
            true
        }
    }

    pub fn end_handover(&self) {
        self.handover.lock().in_progress = false;
    }

    /// Blocks interruptibly until the attached client detaches.
    /// `should_abort` is polled on every wake (spurious or real) so a
    /// delivered signal can unwind this as `EINTR`, per §4.3.
    pub fn wait_for_detach(&self, mut should_abort: impl FnMut() -> bool) -> bool {
        let mut h = self.handover.lock();
        loop {
            if h.client.is_none() {
                return true;
            }
            if should_abort() {
                return false;
            }
            self.detached.wait(&mut h);
        }
    }
}
