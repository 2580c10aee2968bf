use crate::error::Error;

/// Implementation ceiling on `max_outstanding_reqs` (§3: "capped at an
/// implementation constant (e.g. 256)").
pub const MAX_OUTSTANDING_REQS: u32 = 256;

pub fn page_size() -> u64 {
    let v = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if v > 0 {
        v as u64
    } else {
        4096
    }
}

fn is_power_of_two(v: u64) -> bool {
    v != 0 && (v & (v - 1)) == 0
}

fn round_down(v: u64, multiple: u64) -> u64 {
    if multiple == 0 {
        v
    } else {
        v - (v % multiple)
    }
}

/// The per-device configuration record of §3, after the validation and
/// adjustment `DeviceConfig::validate` performs. `GET_DEVICE_CONFIG`
/// always returns this adjusted form, not whatever the caller
/// originally supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    pub size: u64,
    pub logical_block_size: u32,
    pub physical_block_size: u32,
    pub max_read_write_size: u32,
    pub max_write_same_size: u32,
    pub max_write_zeros_size: u32,
    pub max_discard_erase_size: u32,
    pub max_outstanding_reqs: u32,

    pub supports_read: bool,
    pub supports_write: bool,
    pub supports_write_same: bool,
    pub supports_write_zeros: bool,
    pub supports_fua_write: bool,
    pub supports_flush: bool,
    pub supports_discard: bool,
    pub supports_secure_erase: bool,
    pub supports_ioctl: bool,

    pub recoverable: bool,
}

impl DeviceConfig {
    /// Validates and adjusts a caller-supplied configuration in place,
    /// per the table in §3. Every failure is `EINVAL` before any
    /// allocation happens, matching §7's validation error kind.
    pub fn validate(mut self) -> Result<Self, Error> {
        let page = page_size();

        if self.logical_block_size < 512
            || self.logical_block_size as u64 > page
            || !is_power_of_two(self.logical_block_size as u64)
        {
            return Err(Error::InvalidConfig {
                field: "logical_block_size",
                reason: "must be a power of two in [512, page size]",
            });
        }

        if self.physical_block_size == 0 {
            self.physical_block_size = self.logical_block_size;
        } else if (self.physical_block_size as u64) < self.logical_block_size as u64
            || self.physical_block_size as u64 > page
            || !is_power_of_two(self.physical_block_size as u64)
        {
            return Err(Error::InvalidConfig {
                field: "physical_block_size",
                reason: "must be 0 or a power of two in [logical_block_size, page size]",
            });
        }

        let block_size = std::cmp::max(self.physical_block_size, self.logical_block_size) as u64;
        if self.size == 0 || self.size % block_size != 0 {
            return Err(Error::InvalidConfig {
                field: "size",
                reason: "must be a positive multiple of max(physical_block_size, logical_block_size)",
            });
        }

        if self.max_read_write_size != 0 && (self.max_read_write_size as u64) < page {
            return Err(Error::InvalidConfig {
                field: "max_read_write_size",
                reason: "must be 0 or at least the page size",
            });
        }
        self.max_read_write_size =
            round_down(self.max_read_write_size as u64, self.logical_block_size as u64) as u32;

        for (value, name) in [
            (&mut self.max_write_same_size, "max_write_same_size"),
            (&mut self.max_write_zeros_size, "max_write_zeros_size"),
            (&mut self.max_discard_erase_size, "max_discard_erase_size"),
        ] {
            if *value != 0 && (*value as u64) < self.logical_block_size as u64 {
                return Err(Error::InvalidConfig {
                    field: name,
                    reason: "must be 0 or at least logical_block_size",
                });
            }
            *value = round_down(*value as u64, self.logical_block_size as u64) as u32;
        }

        if self.max_outstanding_reqs == 0 || self.max_outstanding_reqs > MAX_OUTSTANDING_REQS {
            return Err(Error::InvalidConfig {
                field: "max_outstanding_reqs",
                reason: "must be positive and at most the implementation ceiling",
            });
        }

        if self.supports_fua_write && !self.supports_flush {
            return Err(Error::InvalidConfig {
                field: "supports_fua_write",
                reason: "requires supports_flush",
            });
        }

        // A size-bearing feature whose callback isn't installed by the
        // worker is disabled regardless of what the caller asked for.
        if !self.supports_write_same {
            self.max_write_same_size = 0;
        }
        if !self.supports_write_zeros {
            self.max_write_zeros_size = 0;
        }
        if !(self.supports_discard || self.supports_secure_erase) {
            self.max_discard_erase_size = 0;
        }
        if !(self.supports_read || self.supports_write) {
            self.max_read_write_size = 0;
        }

        Ok(self)
    }

    /// A device is read-only at the block-layer level iff no
    /// write-family operation is supported (§4.2).
    pub fn is_read_only(&self) -> bool {
        !(self.supports_write
            || self.supports_write_same
            || self.supports_write_zeros
            || self.supports_fua_write
            || self.supports_discard
            || self.supports_secure_erase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> DeviceConfig {
        DeviceConfig {
            size: 1 << 30,
            logical_block_size: 512,
            physical_block_size: 0,
            max_read_write_size: 0,
            max_write_same_size: 0,
            max_write_zeros_size: 0,
            max_discard_erase_size: 0,
            max_outstanding_reqs: 64,
            supports_read: true,
            supports_write: true,
            supports_write_same: false,
            supports_write_zeros: false,
            supports_fua_write: false,
            supports_flush: true,
            supports_discard: false,
            supports_secure_erase: false,
            supports_ioctl: false,
            recoverable: true,
        }
    }

    #[test]
    fn accepts_sane_config() {
        let cfg = base().validate().unwrap();
        assert_eq!(cfg.physical_block_size, 512);
        assert!(!cfg.is_read_only());
    }

    #[test]
    fn rejects_fua_without_flush() {
        let mut cfg = base();
        cfg.supports_fua_write = true;
        cfg.supports_flush = false;
        assert_eq!(
            cfg.validate().unwrap_err(),
            Error::InvalidConfig {
                field: "supports_fua_write",
                reason: "requires supports_flush"
            }
        );
    }

    #[test]
    fn rejects_non_power_of_two_logical_block_size() {
        let mut cfg = base();
        cfg.logical_block_size = 513;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_size_not_multiple_of_block_size() {
        let mut cfg = base();
        cfg.size = 1000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_max_outstanding_reqs_over_ceiling() {
        let mut cfg = base();
        cfg.max_outstanding_reqs = MAX_OUTSTANDING_REQS + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn read_only_when_no_write_family_supported() {
        let mut cfg = base();
        cfg.supports_write = false;
        let cfg = cfg.validate().unwrap();
        assert!(cfg.is_read_only());
    }

    #[test]
    fn zeroes_size_when_feature_unsupported() {
        let mut cfg = base();
        cfg.max_write_same_size = 4096;
        cfg.supports_write_same = false;
        let cfg = cfg.validate().unwrap();
        assert_eq!(cfg.max_write_same_size, 0);
    }
}
