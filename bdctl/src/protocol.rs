//! The control device's wire contract (§6.1-§6.4): the command
//! encoding, the ABI version, and the fixed-layout structs that back
//! the client/kernel shared-memory region. This crate never opens a
//! character device or issues an ioctl itself — those live in whatever
//! front end embeds it — but the layouts are bit-stable so that front
//! end can `bytemuck::cast` straight into them.

use bytemuck::{Pod, Zeroable};

/// The core's ABI version, returned by `GET_VERSION` (§6.2).
pub const ABI_VERSION: (u16, u16, u16) = (1, 0, 0);

/// Minor numbers are allocated in windows of this size per device
/// (§6.5), leaving room for partitions.
pub const MINOR_WINDOW: u32 = 256;

/// A shared-memory cell, as described in §6.3: exactly 64 bytes,
/// tagged union of item and reply, sharing a common header.
pub const CELL_SIZE: usize = 64;

/// The small integer command encoding of §6.2.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    GetVersion = 0,
    CreateDevice = 1,
    AttachToDevice = 2,
    Terminate = 3,
    MarkAsSuccessful = 4,
    DevicePathToId = 5,
    GetDeviceConfig = 6,
    FlushDevice = 7,
    TriggerDeviceDestruction = 8,
    WaitUntilDeviceIsDestroyed = 9,
    ReceiveItem = 10,
    SendReply = 11,
    SendReplyAndReceiveItem = 12,
}

/// Wire form of [`bdcore::DeviceConfig`] (§3, §6.2's `CREATE_DEVICE`/
/// `GET_DEVICE_CONFIG` payload). Bit-stable: booleans are encoded as
/// `u8` since `bool` is not guaranteed `Pod`-safe across all bit
/// patterns.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct FfiDeviceConfig {
    pub size: u64,
    pub logical_block_size: u32,
    pub physical_block_size: u32,
    pub max_read_write_size: u32,
    pub max_write_same_size: u32,
    pub max_write_zeros_size: u32,
    pub max_discard_erase_size: u32,
    pub max_outstanding_reqs: u32,
    pub flags: u32,
    pub _pad: u32,
}

pub mod config_flags {
    pub const SUPPORTS_READ: u32 = 1 << 0;
    pub const SUPPORTS_WRITE: u32 = 1 << 1;
    pub const SUPPORTS_WRITE_SAME: u32 = 1 << 2;
    pub const SUPPORTS_WRITE_ZEROS: u32 = 1 << 3;
    pub const SUPPORTS_FUA_WRITE: u32 = 1 << 4;
    pub const SUPPORTS_FLUSH: u32 = 1 << 5;
    pub const SUPPORTS_DISCARD: u32 = 1 << 6;
    pub const SUPPORTS_SECURE_ERASE: u32 = 1 << 7;
    pub const SUPPORTS_IOCTL: u32 = 1 << 8;
    pub const RECOVERABLE: u32 = 1 << 9;
}

impl From<bdcore::DeviceConfig> for FfiDeviceConfig {
    fn from(cfg: bdcore::DeviceConfig) -> Self {
        use config_flags::*;
        let mut flags = 0;
        for (set, flag) in [
            (cfg.supports_read, SUPPORTS_READ),
            (cfg.supports_write, SUPPORTS_WRITE),
            (cfg.supports_write_same, SUPPORTS_WRITE_SAME),
            (cfg.supports_write_zeros, SUPPORTS_WRITE_ZEROS),
            (cfg.supports_fua_write, SUPPORTS_FUA_WRITE),
            (cfg.supports_flush, SUPPORTS_FLUSH),
            (cfg.supports_discard, SUPPORTS_DISCARD),
            (cfg.supports_secure_erase, SUPPORTS_SECURE_ERASE),
            (cfg.supports_ioctl, SUPPORTS_IOCTL),
            (cfg.recoverable, RECOVERABLE),
        ] {
            if set {
                flags |= flag;
            }
        }

        FfiDeviceConfig {
            size: cfg.size,
            logical_block_size: cfg.logical_block_size,
            physical_block_size: cfg.physical_block_size,
            max_read_write_size: cfg.max_read_write_size,
            max_write_same_size: cfg.max_write_same_size,
            max_write_zeros_size: cfg.max_write_zeros_size,
            max_discard_erase_size: cfg.max_discard_erase_size,
            max_outstanding_reqs: cfg.max_outstanding_reqs,
            flags,
            _pad: 0,
        }
    }
}

impl FfiDeviceConfig {
    pub fn into_config(self) -> bdcore::DeviceConfig {
        use config_flags::*;
        bdcore::DeviceConfig {
            size: self.size,
            logical_block_size: self.logical_block_size,
            physical_block_size: self.physical_block_size,
            max_read_write_size: self.max_read_write_size,
            max_write_same_size: self.max_write_same_size,
            max_write_zeros_size: self.max_write_zeros_size,
            max_discard_erase_size: self.max_discard_erase_size,
            max_outstanding_reqs: self.max_outstanding_reqs,
            supports_read: self.flags & SUPPORTS_READ != 0,
            supports_write: self.flags & SUPPORTS_WRITE != 0,
            supports_write_same: self.flags & SUPPORTS_WRITE_SAME != 0,
            supports_write_zeros: self.flags & SUPPORTS_WRITE_ZEROS != 0,
            supports_fua_write: self.flags & SUPPORTS_FUA_WRITE != 0,
            supports_flush: self.flags & SUPPORTS_FLUSH != 0,
            supports_discard: self.flags & SUPPORTS_DISCARD != 0,
            supports_secure_erase: self.flags & SUPPORTS_SECURE_ERASE != 0,
            supports_ioctl: self.flags & SUPPORTS_IOCTL != 0,
            recoverable: self.flags & RECOVERABLE != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_config_round_trips_through_wire_form() {
        let cfg = bdcore::DeviceConfig {
            size: 1 << 20,
            logical_block_size: 512,
            physical_block_size: 512,
            max_read_write_size: 0,
            max_write_same_size: 0,
            max_write_zeros_size: 0,
            max_discard_erase_size: 0,
            max_outstanding_reqs: 32,
            supports_read: true,
            supports_write: true,
            supports_write_same: false,
            supports_write_zeros: false,
            supports_fua_write: true,
            supports_flush: true,
            supports_discard: false,
            supports_secure_erase: false,
            supports_ioctl: false,
            recoverable: true,
        }
        .validate()
        .unwrap();

        let wire: FfiDeviceConfig = cfg.into();
        assert_eq!(wire.into_config(), cfg);
    }

    #[test]
    fn cell_size_matches_contract() {
        assert_eq!(CELL_SIZE, 64);
    }
}
