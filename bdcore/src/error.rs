use nix::errno::Errno;

/// Errors raised by the Inverter and the device state machine.
///
/// These are plain data: nothing in this crate panics in response to
/// caller-supplied configuration or to a racing terminate/timeout. Each
/// variant maps to exactly the errno the control-device ioctl boundary
/// is contracted to report (§7 of the design).
#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("field {field} is invalid: {reason}")]
    InvalidConfig {
        field: &'static str,
        reason: &'static str,
    },

    #[error("device is terminated")]
    Terminated,

    #[error("request type is not supported by this device")]
    Unsupported,

    #[error("internal slot-table invariant was violated")]
    Corrupted,
}

impl Error {
    pub fn errno(&self) -> Errno {
        match self {
            Error::InvalidConfig { .. } => Errno::EINVAL,
            Error::Terminated => Errno::ENODEV,
            Error::Unsupported => Errno::EOPNOTSUPP,
            Error::Corrupted => Errno::EIO,
        }
    }
}
