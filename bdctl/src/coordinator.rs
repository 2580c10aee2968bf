//! The control coordinator (§4.3): the sole serialisation point for
//! device creation, client attachment, handover, and destruction.
//!
//! Process-wide state (the index table, the id allocator) is guarded
//! by one mutex; per-device request traffic never touches it, since
//! that's the inverter's per-device spinlock's job (`bdcore::Inverter`).
//! A real control-device front end is expected to construct exactly
//! one `Coordinator` at startup and hold it for the process's
//! lifetime, but nothing here enforces that as global mutable state —
//! keeping it an ordinary value makes the handover and destruction
//! logic unit-testable in isolation.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use bdcore::{BlockLayer, Device, DeviceConfig, DeviceState, KernelRequest};

use crate::client::{Client, ClientId, Transceiver};
use crate::error::Error;
use crate::protocol::MINOR_WINDOW;
use crate::wrapper::DeviceWrapper;

/// Upper bound on live devices, matching the minor-number window
/// scheme of §6.5 (20 bits of minor space / 256 minors per device).
pub const MAX_DEVICES: u32 = 4096;

fn dev_major(rdev: u64) -> u32 {
    (((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff)) as u32
}

fn dev_minor(rdev: u64) -> u32 {
    ((rdev & 0xff) | ((rdev >> 12) & !0xff)) as u32
}

struct Inner<R: KernelRequest, B: BlockLayer, T: Transceiver> {
    slots: Vec<Option<Arc<DeviceWrapper<R, B, T>>>>,
    free_indices: VecDeque<u32>,
    id_to_index: HashMap<u64, u32>,
    next_id: u64,
}

/// The per-process device table and lifecycle serialisation point.
pub struct Coordinator<R, B, T, BF>
where
    R: KernelRequest,
    B: BlockLayer,
    T: Transceiver,
    BF: Fn(u64) -> B,
{
    inner: Mutex<Inner<R, B, T>>,
    destroyed: Condvar,
    next_client_id: AtomicU64,
    disk_major: u32,
    make_block_layer: BF,
}

impl<R, B, T, BF> Coordinator<R, B, T, BF>
where
    R: KernelRequest,
    B: BlockLayer,
    T: Transceiver,
    BF: Fn(u64) -> B,
{
    /// `disk_major` is the block-device major reserved at core
    /// startup (§6.5); `make_block_layer` constructs the block-layer
    /// collaborator for a freshly allocated device id.
    pub fn new(disk_major: u32, make_block_layer: BF) -> Self {
        Coordinator {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                free_indices: VecDeque::new(),
                id_to_index: HashMap::new(),
                next_id: 1,
            }),
            destroyed: Condvar::new(),
            next_client_id: AtomicU64::new(1),
            disk_major,
            make_block_layer,
        }
    }

    fn alloc_client_id(&self) -> ClientId {
        ClientId(self.next_client_id.fetch_add(1, Ordering::Relaxed))
    }

    /// `create_device(config) → {ok, ENOSPC, EINVAL, …}` (§4.3):
    /// allocates an index cyclically, validates and adjusts `config`,
    /// assigns the next id, creates the inverter/disk/transceiver, and
    /// attaches the caller as the first client.
    pub fn create_device(&self, config: DeviceConfig, transceiver: T) -> Result<(u64, ClientId), Error> {
        let config = config.validate()?;

        let mut inner = self.inner.lock();

        let index = match inner.free_indices.pop_front() {
            Some(index) => index,
            None => {
                if inner.slots.len() as u32 >= MAX_DEVICES {
                    return Err(Error::NoSpace);
                }
                inner.slots.push(None);
                (inner.slots.len() - 1) as u32
            }
        };

        let id = inner.next_id;
        inner.next_id += 1;

        let block = (self.make_block_layer)(id);
        let device = Arc::new(Device::new(config, block));
        let wrapper = Arc::new(DeviceWrapper::new(id, device.clone()));

        let client_id = self.alloc_client_id();
        wrapper.attach_client(Client::new(client_id, transceiver));

        inner.slots[index as usize] = Some(wrapper);
        inner.id_to_index.insert(id, index);
        drop(inner);

        device.start_registration();
        info!(id, index, "device created");
        Ok((id, client_id))
    }

    fn lookup(&self, id: u64) -> Result<Arc<DeviceWrapper<R, B, T>>, Error> {
        let inner = self.inner.lock();
        let index = *inner.id_to_index.get(&id).ok_or(Error::NoSuchDevice)?;
        inner.slots[index as usize].clone().ok_or(Error::NoSuchDevice)
    }

    /// `attach(id) → {ok, EINVAL, ENODEV, EBUSY, EINPROGRESS, EINTR}`
    /// (§4.3). `should_abort` is polled while blocked on the previous
    /// client's detach, to surface a delivered signal as `EINTR`.
    pub fn attach(
        &self,
        id: u64,
        transceiver: T,
        should_abort: impl FnMut() -> bool,
    ) -> Result<ClientId, Error> {
        let wrapper = self.lookup(id)?;

        if wrapper.device.state() == DeviceState::Unavailable {
            debug!(id, "attach rejected: device not yet available");
            return Err(Error::Busy);
        }
        if !wrapper.begin_handover() {
            debug!(id, "attach rejected: handover already in progress");
            return Err(Error::HandoverInProgress);
        }

        info!(id, "attach starting");
        let result = self.attach_locked(&wrapper, transceiver, should_abort);
        wrapper.end_handover();
        match &result {
            Ok(client_id) => info!(id, client = client_id.0, "attach completed"),
            Err(err) => warn!(id, ?err, "attach failed"),
        }
        result
    }

    fn attach_locked(
        &self,
        wrapper: &Arc<DeviceWrapper<R, B, T>>,
        transceiver: T,
        should_abort: impl FnMut() -> bool,
    ) -> Result<ClientId, Error> {
        if wrapper.has_client() {
            let flush = wrapper.device.config().supports_flush;
            info!(id = wrapper.id, flush, "attach: deactivating previous client");
            wrapper.device.deactivate(flush);
            if !wrapper.wait_for_detach(should_abort) {
                warn!(id = wrapper.id, "attach interrupted while waiting for previous client to detach");
                return Err(Error::Interrupted);
            }
        }

        if wrapper.device.state() == DeviceState::Terminated {
            self.destroy(wrapper.id);
            return Err(Error::NoSuchDevice);
        }

        debug_assert_eq!(wrapper.device.state(), DeviceState::Inactive);
        let client_id = self.alloc_client_id();
        wrapper.attach_client(Client::new(client_id, transceiver));
        wrapper.device.activate();
        Ok(client_id)
    }

    /// `release(client)` (§4.3): consults device state and the
    /// recoverable/marked_successful flags, applying the action table.
    pub fn release(&self, id: u64) {
        let Ok(wrapper) = self.lookup(id) else {
            return;
        };

        let marked_successful = wrapper
            .with_client(|c| c.is_marked_successful())
            .unwrap_or(false);
        let recoverable = wrapper.recoverable();
        let state = wrapper.device.state();

        let has_waiter = wrapper.has_waiter();
        wrapper.detach_client();

        match (state, recoverable, marked_successful) {
            (DeviceState::Unavailable, _, _) => {
                self.destroy(id);
            }
            (DeviceState::Active, false, false) => {
                wrapper.device.terminate();
                if !has_waiter {
                    self.destroy(id);
                }
            }
            (DeviceState::Active, true, _) => {
                wrapper.device.deactivate(false);
            }
            (DeviceState::Active, false, true) => {
                wrapper.device.deactivate(false);
            }
            (DeviceState::Inactive, false, false) => {
                wrapper.device.terminate();
                if !has_waiter {
                    self.destroy(id);
                }
            }
            (DeviceState::Inactive, true, _) => {}
            (DeviceState::Terminated, _, _) => {
                if !has_waiter {
                    self.destroy(id);
                }
            }
        }

        debug!(id, ?state, recoverable, marked_successful, has_waiter, "client released");
    }

    /// `terminate(client)` (§4.3): signals the inverter to send
    /// perpetual `TERMINATE` pseudo-items.
    pub fn terminate(&self, id: u64) -> Result<(), Error> {
        let wrapper = self.lookup(id)?;
        wrapper.device.terminate();
        Ok(())
    }

    pub fn mark_successful(&self, id: u64) -> Result<(), Error> {
        let wrapper = self.lookup(id)?;
        wrapper
            .with_client(|c| c.mark_successful())
            .ok_or(Error::NoSuchDevice)
    }

    /// `path_to_id(path)` (§4.3): resolves a block special file to
    /// the whole-device id it belongs to.
    pub fn path_to_id(&self, path: &Path) -> Result<u64, Error> {
        let stat = nix::sys::stat::stat(path).map_err(|_| Error::NoSuchDevice)?;
        if stat.st_mode & libc::S_IFMT != libc::S_IFBLK {
            return Err(Error::NotBlockDevice);
        }
        self.id_for_rdev(stat.st_rdev)
    }

    /// The `rdev`-decoding half of `path_to_id`, split out so the
    /// major/minor-window arithmetic is testable without a real block
    /// special file on disk.
    fn id_for_rdev(&self, rdev: u64) -> Result<u64, Error> {
        let major = dev_major(rdev);
        let minor = dev_minor(rdev);

        if major != self.disk_major {
            return Err(Error::InvalidArgument);
        }
        if minor % MINOR_WINDOW != 0 {
            return Err(Error::IsPartition);
        }

        let index = minor / MINOR_WINDOW;
        let inner = self.inner.lock();
        inner
            .slots
            .get(index as usize)
            .and_then(|s| s.as_ref())
            .map(|w| w.id)
            .ok_or(Error::NoSuchDevice)
    }

    /// `flush_device(id)` (§4.3): skipped when the device is read-only.
    pub fn flush_device(&self, id: u64) -> Result<(), Error> {
        let wrapper = self.lookup(id)?;
        if wrapper.is_read_only() {
            return Ok(());
        }
        wrapper.device.flush()?;
        Ok(())
    }

    /// `trigger_destruction(id)` (§4.3): terminates if a client is
    /// attached (who will then observe perpetual `TERMINATE` and
    /// close its handle); destroys immediately if clientless.
    pub fn trigger_destruction(&self, id: u64) -> Result<(), Error> {
        let wrapper = self.lookup(id)?;
        if wrapper.has_client() {
            wrapper.device.terminate();
        } else {
            self.destroy(id);
        }
        Ok(())
    }

    /// `wait_until_destroyed(id)` (§4.3): returns immediately iff `id`
    /// was never issued (`id >= next_id`, ids being assigned strictly
    /// in order starting at 1) or the device has already left the
    /// table.
    pub fn wait_until_destroyed(&self, id: u64, mut should_abort: impl FnMut() -> bool) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if id == 0 || id >= inner.next_id {
            return Err(Error::InvalidArgument);
        }
        loop {
            if !inner.id_to_index.contains_key(&id) {
                return Ok(());
            }
            if should_abort() {
                return Err(Error::Interrupted);
            }
            self.destroyed.wait(&mut inner);
        }
    }

    fn destroy(&self, id: u64) {
        let mut inner = self.inner.lock();
        let Some(index) = inner.id_to_index.remove(&id) else {
            return;
        };
        let wrapper = inner.slots[index as usize].take();
        inner.free_indices.push_back(index);
        drop(inner);

        if let Some(wrapper) = wrapper {
            wrapper.device.block_layer().unregister_disk();
        }
        self.destroyed.notify_all();
        warn!(id, "device destroyed");
    }

    #[cfg(test)]
    pub(crate) fn device(&self, id: u64) -> Option<Arc<Device<R, B>>> {
        self.lookup(id).ok().map(|w| w.device.clone())
    }

    #[cfg(test)]
    pub(crate) fn is_live(&self, id: u64) -> bool {
        self.lookup(id).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bdcore::{DeviceConfig, KernelRequest, NullBlockLayer};

    use crate::client::NullTransceiver;

    struct NoopRequest;
    impl KernelRequest for NoopRequest {
        fn complete(self, _status: i32) {}
    }

    fn test_coordinator() -> Coordinator<NoopRequest, NullBlockLayer, NullTransceiver, impl Fn(u64) -> NullBlockLayer> {
        Coordinator::new(240, |_id| NullBlockLayer)
    }

    fn test_config() -> DeviceConfig {
        DeviceConfig {
            size: 1 << 20,
            logical_block_size: 512,
            physical_block_size: 512,
            max_read_write_size: 0,
            max_write_same_size: 0,
            max_write_zeros_size: 0,
            max_discard_erase_size: 0,
            max_outstanding_reqs: 8,
            supports_read: true,
            supports_write: true,
            supports_write_same: false,
            supports_write_zeros: false,
            supports_fua_write: false,
            supports_flush: false,
            supports_discard: false,
            supports_secure_erase: false,
            supports_ioctl: false,
            recoverable: true,
        }
    }

    /// Inverse of `dev_major`/`dev_minor`, per glibc's `gnu_dev_makedev`.
    fn makedev(major: u32, minor: u32) -> u64 {
        (minor as u64 & 0xff)
            | ((major as u64 & 0xfff) << 8)
            | ((minor as u64 & !0xff) << 12)
            | ((major as u64 & !0xfff) << 32)
    }

    #[test]
    fn major_minor_round_trip() {
        let rdev = makedev(240, 513);
        assert_eq!(dev_major(rdev), 240);
        assert_eq!(dev_minor(rdev), 513);
    }

    #[test]
    fn id_for_rdev_rejects_foreign_major() {
        let coord = test_coordinator();
        let rdev = makedev(99, 0);
        assert_eq!(coord.id_for_rdev(rdev), Err(Error::InvalidArgument));
    }

    #[test]
    fn id_for_rdev_rejects_partition_minor() {
        let coord = test_coordinator();
        coord.create_device(test_config(), NullTransceiver).unwrap();
        // Minor 5 is within the first device's window but not its
        // whole-device minor (a multiple of MINOR_WINDOW) — this is
        // the partition-minor boundary behaviour of §8.
        let rdev = makedev(240, 5);
        assert_eq!(coord.id_for_rdev(rdev), Err(Error::IsPartition));
    }

    #[test]
    fn id_for_rdev_resolves_whole_device_minor() {
        let coord = test_coordinator();
        let (id, _client) = coord.create_device(test_config(), NullTransceiver).unwrap();
        let rdev = makedev(240, 0);
        assert_eq!(coord.id_for_rdev(rdev), Ok(id));
    }

    #[test]
    fn id_for_rdev_rejects_unassigned_whole_device_minor() {
        let coord = test_coordinator();
        let rdev = makedev(240, MINOR_WINDOW * 3);
        assert_eq!(coord.id_for_rdev(rdev), Err(Error::NoSuchDevice));
    }

    #[test]
    fn path_to_id_rejects_nonexistent_path() {
        let coord = test_coordinator();
        let err = coord
            .path_to_id(Path::new("/nonexistent/path/for/bdctl/tests"))
            .unwrap_err();
        assert_eq!(err, Error::NoSuchDevice);
    }

    #[test]
    fn path_to_id_rejects_non_block_special_file() {
        let coord = test_coordinator();
        // Any regular file works here: the check runs before any
        // major/minor decoding, so this doesn't need a real disk.
        let err = coord.path_to_id(Path::new("/proc/self/status")).unwrap_err();
        assert_eq!(err, Error::NotBlockDevice);
    }
}
