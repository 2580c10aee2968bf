//! The Device state machine (§4.2): owns an [`Inverter`] and a
//! block-disk handle, and translates lifecycle calls from the control
//! coordinator into inverter operations.

use std::sync::atomic::{AtomicU8, Ordering};

use tracing::{info, trace};

use crate::config::DeviceConfig;
use crate::error::Error;
use crate::inverter::{Inverter, SupportedOps, TimeoutOutcome};
use crate::item::{Handle, Item, RequestKind};
use crate::KernelRequest;

/// `UNAVAILABLE → ACTIVE ↔ INACTIVE → TERMINATED` (§4.2). Stored as an
/// `AtomicU8` so lifecycle readers (e.g. a status ioctl) don't need to
/// take the inverter's lock just to observe the coarse state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceState {
    Unavailable = 0,
    Active = 1,
    Inactive = 2,
    Terminated = 3,
}

impl DeviceState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => DeviceState::Unavailable,
            1 => DeviceState::Active,
            2 => DeviceState::Inactive,
            _ => DeviceState::Terminated,
        }
    }
}

/// The block layer collaborator a [`Device`] registers/unregisters
/// itself with. Modeled as a trait because the real kernel block-disk
/// shim (the `gendisk` registration, the request queue, the timeout
/// callback) lives outside this crate (§1's "external collaborators").
pub trait BlockLayer: Send + Sync + 'static {
    /// Kicks off asynchronous disk registration. `on_ready` must be
    /// invoked exactly once, whenever the disk becomes visible; the
    /// caller uses it to drive `UNAVAILABLE → ACTIVE` (§4.2).
    fn register_disk(&self, on_ready: Box<dyn FnOnce() + Send>) {
        on_ready();
    }

    /// Unregisters the disk. Called once, when the device is
    /// destroyed.
    fn unregister_disk(&self) {}

    /// Flushes any block-layer-side buffering. Called synchronously by
    /// `FLUSH_DEVICE` and before a flush-bearing terminate. `EOPNOTSUPP`
    /// is treated as success by callers (§4.3).
    fn flush(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// A no-op block layer: registration completes synchronously and
/// flush is a no-op. Useful for devices with no real disk binding
/// (e.g. in tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBlockLayer;

impl BlockLayer for NullBlockLayer {}

fn supported_ops(cfg: &DeviceConfig) -> SupportedOps {
    SupportedOps {
        read: cfg.supports_read,
        write: cfg.supports_write,
        write_same: cfg.supports_write_same,
        write_zeros: cfg.supports_write_zeros,
        fua_write: cfg.supports_fua_write,
        flush: cfg.supports_flush,
        discard: cfg.supports_discard,
        secure_erase: cfg.supports_secure_erase,
        ioctl: cfg.supports_ioctl,
    }
}

/// A single block device's request-mediation state: the inverter, its
/// adjusted configuration, the coarse lifecycle state, and the
/// block-layer handle it is registered with.
pub struct Device<R: KernelRequest, B: BlockLayer = NullBlockLayer> {
    config: DeviceConfig,
    state: AtomicU8,
    inverter: Inverter<R>,
    block: B,
}

impl<R: KernelRequest, B: BlockLayer> Device<R, B> {
    /// Constructs a device in `UNAVAILABLE` state. Callers move it to
    /// `ACTIVE` via [`Device::mark_available`] once the asynchronous
    /// block-disk registration referenced in §4.2 completes.
    pub fn new(config: DeviceConfig, block: B) -> Self {
        let inverter = Inverter::new(config.max_outstanding_reqs, supported_ops(&config));
        Device {
            config,
            state: AtomicU8::new(DeviceState::Unavailable as u8),
            inverter,
            block,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn inverter(&self) -> &Inverter<R> {
        &self.inverter
    }

    pub fn block_layer(&self) -> &B {
        &self.block
    }

    pub fn is_read_only(&self) -> bool {
        self.config.is_read_only()
    }

    fn set_state(&self, state: DeviceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Kicks off the asynchronous disk-add described by §4.2, wiring
    /// its completion to [`Device::mark_available`].
    pub fn start_registration(self: &std::sync::Arc<Self>) {
        let this = self.clone();
        self.block
            .register_disk(Box::new(move || this.mark_available()));
    }

    /// `UNAVAILABLE → ACTIVE`: invoked by the asynchronous disk-adder
    /// once the block disk becomes visible. Submits one
    /// `DEVICE_AVAILABLE` pseudo-event.
    pub fn mark_available(&self) {
        debug_assert_eq!(self.state(), DeviceState::Unavailable);
        self.set_state(DeviceState::Active);
        self.inverter.submit_device_available();
        info!("device became available");
    }

    /// `ACTIVE → INACTIVE`: worker detaches but the request queue is
    /// preserved. If `flush` is requested and flush is supported, the
    /// next item the detaching client sees is `FLUSH_AND_TERMINATE`
    /// rather than `TERMINATE` directly.
    pub fn deactivate(&self, flush: bool) {
        if self.state() != DeviceState::Active {
            return;
        }
        self.set_state(DeviceState::Inactive);
        self.inverter.deactivate(flush);
        trace!(flush, "device deactivated");
    }

    /// `INACTIVE → ACTIVE`: a new worker has attached. Every
    /// `AWAITING_COMPLETION` slot is moved back to `AWAITING_GET` so
    /// the new worker re-handles in-flight requests, and
    /// `DEVICE_AVAILABLE` is re-armed.
    pub fn activate(&self) {
        debug_assert_eq!(self.state(), DeviceState::Inactive);
        self.set_state(DeviceState::Active);
        self.inverter.activate();
        info!("device reactivated");
    }

    /// `UNAVAILABLE|ACTIVE|INACTIVE → TERMINATED`: terminal. New and
    /// pending requests fail immediately with the termination status.
    pub fn terminate(&self) {
        if self.state() == DeviceState::Terminated {
            return;
        }
        self.set_state(DeviceState::Terminated);
        self.inverter.terminate();
        info!("device terminated");
    }

    /// Accepts a kernel block request, deriving its item kind from the
    /// caller-provided `kind`. Fails immediately (without reaching the
    /// inverter's slot table) if the device was never activated.
    pub fn submit(&self, kind: RequestKind, req: R) -> Result<Handle, Error> {
        if self.state() == DeviceState::Unavailable {
            let status = if kind.is_ioctl() { libc::ENODEV } else { libc::EIO };
            req.complete(status);
            return Err(Error::Terminated);
        }
        self.inverter.submit(kind, req)
    }

    pub fn timeout(&self, handle: Handle) -> TimeoutOutcome {
        self.inverter.timeout(handle)
    }

    pub fn begin_get(&self, should_abort: impl FnMut() -> bool) -> Option<Item> {
        self.inverter.begin_get(should_abort)
    }

    pub fn commit_get(&self, item: Item) {
        self.inverter.commit_get(item)
    }

    pub fn abort_get(&self, item: Item) {
        self.inverter.abort_get(item)
    }

    /// Synchronous flush, as issued by `FLUSH_DEVICE` (§6.2). Delegates
    /// to the block layer directly; this is independent of the
    /// `FLUSH_AND_TERMINATE` pseudo-item, which instead asks the
    /// *attached worker* to flush before detaching.
    pub fn flush(&self) -> Result<(), Error> {
        self.block.flush()
    }
}
