use nix::errno::Errno;

/// Errors raised by the control coordinator (§4.3, §7). Every variant
/// maps to exactly the errno the control device's ioctls are
/// contracted to return; the coordinator itself never panics in
/// response to caller-supplied input or races.
#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no such device")]
    NoSuchDevice,
    #[error("device table is full")]
    NoSpace,
    #[error("device is not yet available")]
    Busy,
    #[error("a handover is already in progress on this device")]
    HandoverInProgress,
    #[error("operation interrupted")]
    Interrupted,
    #[error("path addresses a partition, not the whole device")]
    IsPartition,
    #[error("path does not refer to a block special file")]
    NotBlockDevice,

    #[error(transparent)]
    Core(#[from] bdcore::Error),
}

impl Error {
    pub fn errno(&self) -> Errno {
        match self {
            Error::InvalidArgument => Errno::EINVAL,
            Error::NoSuchDevice => Errno::ENODEV,
            Error::NoSpace => Errno::ENOSPC,
            Error::Busy => Errno::EBUSY,
            Error::HandoverInProgress => Errno::EINPROGRESS,
            Error::Interrupted => Errno::EINTR,
            Error::IsPartition => Errno::ECHILD,
            Error::NotBlockDevice => Errno::ENOTBLK,
            Error::Core(e) => e.errno(),
        }
    }
}
