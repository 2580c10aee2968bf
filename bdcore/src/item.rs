/// A `(slot_index, seqnum)` pair identifying a request uniquely across
/// its lifetime in a device's slot table (§3, §6.3). `index` is the
/// 1-based slot ordinal; `0` is reserved for pseudo-items and never
/// appears here. `seqnum` increments every time the slot returns to
/// `FREE`, which makes a handle ABA-safe: a reply carrying a stale
/// handle is detectable by comparing `seqnum` against the slot's
/// current generation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    pub index: u16,
    pub seqnum: u64,
}

/// The request-type taxonomy of §6.4, restricted to the types that
/// occupy a slot (the three pseudo-items are not `RequestKind`s — they
/// never have a backing kernel request and are represented directly as
/// [`Item`] variants).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Read { offset: u64, size: u32 },
    Write { offset: u64, size: u32 },
    WriteSame { offset: u64, size: u32 },
    WriteZerosNoUnmap { offset: u64, size: u32 },
    WriteZerosMayUnmap { offset: u64, size: u32 },
    FuaWrite { offset: u64, size: u32 },
    Flush,
    Discard { offset: u64, size: u32 },
    SecureErase { offset: u64, size: u32 },
    Ioctl { command: u32 },
}

impl RequestKind {
    /// Whether this is the `IOCTL` item type, which gets its own
    /// status-sanitisation allow-list (§4.1, §7) and its own
    /// unsupported/termination errno variants (`ENOTTY`/`ENODEV`
    /// instead of `EOPNOTSUPP`/`EIO`).
    pub fn is_ioctl(&self) -> bool {
        matches!(self, RequestKind::Ioctl { .. })
    }
}

/// What `begin_get` hands the consumer: either one of the three
/// pseudo-events multiplexed onto the same stream as real requests, or
/// a real request identified by its handle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Item {
    DeviceAvailable,
    Terminate,
    FlushAndTerminate,
    Request { handle: Handle, kind: RequestKind },
}

impl Item {
    pub fn handle(&self) -> Option<Handle> {
        match self {
            Item::Request { handle, .. } => Some(*handle),
            _ => None,
        }
    }
}
