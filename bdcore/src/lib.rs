//! The per-device request-mediation engine: the Inverter and the device
//! lifecycle state machine described in the design's §4.1/§4.2.
//!
//! This crate has no notion of a `/dev` node, a character device, or an
//! ioctl number — those are the control coordinator's and the real
//! kernel block layer's concern (see `bdctl` and the `BlockLayer`/
//! `KernelRequest` traits below). What lives here is the part that is
//! the same no matter which of those front ends is driving it: a
//! bounded table of request slots, a small state machine per slot, and
//! the device-level `UNAVAILABLE/ACTIVE/INACTIVE/TERMINATED` machine
//! that sits on top of it.

mod config;
mod device;
mod error;
mod item;
mod slot;

pub mod inverter;

pub use config::{page_size, DeviceConfig, MAX_OUTSTANDING_REQS};
pub use device::{BlockLayer, Device, DeviceState, NullBlockLayer};
pub use error::Error;
pub use inverter::{sanitize_status, BeginCompleteOutcome, Inverter, SupportedOps, TimeoutOutcome};
pub use item::{Handle, Item, RequestKind};
pub use slot::SlotState;

/// An in-flight kernel block request, owned by whatever block-layer
/// integration is sitting above this crate.
///
/// A real integration stores the request's handle in its private data
/// and completes it through the block layer's request-completion
/// function; here that's reduced to a single method so the engine
/// never has to know what kind of request it is carrying. Completion
/// happens exactly once, and always through this method — never
/// through a panic, an exception, or an implicit `Drop`.
pub trait KernelRequest: Send + 'static {
    /// Completes the request with a sanitised status: `0` for success,
    /// or a positive `errno` value (e.g. `libc::EIO`) for failure.
    /// Callers of this crate never see a raw, un-sanitised status —
    /// see [`inverter::sanitize_status`]. Takes `self` by value since
    /// the engine already holds requests as bare `R`s (in `Slot`'s
    /// `Option<R>`), not behind a `Box`; an integration whose request
    /// type is itself a `Box<T>` pays no extra indirection for it.
    fn complete(self, status: i32);
}
