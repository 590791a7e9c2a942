//! Platform backends translating interest masks to kernel registrations.
//!
//! A [`Backend`] owns one native poll context (an epoll instance or a
//! kqueue) and converts between the common model and that mechanism:
//! interest-mask mutations become native registration calls, and native
//! readiness records come back as [`NativeEvent`]s with independent,
//! loss-free flag decoding.
//!
//! # Contract
//!
//! Identical across implementations:
//!
//! - `register`/`reregister` establish the kernel subscription for exactly
//!   the bits in the mask, always also subscribing to error/hangup
//!   notification. They are told the complete desired state each time, never
//!   a delta. Registration is atomic from the caller's view: where the
//!   native mechanism needs two sub-registrations, failure of the second
//!   rolls back the first so no residual subscription remains.
//! - `deregister` tolerates the kernel having already forgotten the
//!   descriptor (peer teardown races a close): that is
//!   [`Deregistered::AlreadyGone`], not a fault.
//! - `wait` blocks up to the timeout (indefinitely for `None`), produces an
//!   independent batch per call, and reports timeout expiry as an empty
//!   batch. The presented semantics are level-triggered: a descriptor that
//!   stays ready is reported again on the next call.
//! - `wake` unblocks a thread parked in `wait`, for orderly shutdown.
//!
//! # Selection
//!
//! One implementation per build target ([`EpollBackend`] on Linux,
//! [`KqueueBackend`] on BSD/macOS), plus the always-available [`LabBackend`]
//! for deterministic tests.

pub mod lab;

#[cfg(target_os = "linux")]
pub mod epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub mod kqueue;

pub use lab::LabBackend;

#[cfg(target_os = "linux")]
pub use epoll::EpollBackend;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub use kqueue::KqueueBackend;

use crate::event::NativeEvent;
use crate::interest::Interest;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Token value reserved for the backend's internal wake channel.
///
/// Never minted for a handler: handler tokens pack a `u32` index and a
/// `u32` generation, and the all-ones index is the slab's free-list
/// sentinel.
pub(crate) const WAKE_TOKEN: u64 = u64::MAX;

/// Outcome of a deregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deregistered {
    /// The kernel subscription was removed by this call.
    Removed,
    /// The kernel no longer tracked the descriptor (peer or a prior close
    /// already tore it down). Treated identically to success.
    AlreadyGone,
}

/// Platform-specific strategy over one native poll context.
pub trait Backend: Send + Sync {
    /// Short mechanism name for logs, e.g. `"epoll"`.
    fn name(&self) -> &'static str;

    /// Establishes a new kernel subscription for exactly `mask`, plus
    /// unconditional error/hangup notification. `token` is stored in the
    /// kernel record and stamped on every event for this descriptor.
    fn register(&self, fd: RawFd, mask: Interest, token: u64) -> io::Result<()>;

    /// Replaces an existing subscription with the complete desired state.
    fn reregister(&self, fd: RawFd, mask: Interest, token: u64) -> io::Result<()>;

    /// Removes the subscription for the given bits.
    fn deregister(&self, fd: RawFd, mask: Interest) -> io::Result<Deregistered>;

    /// Blocks up to `timeout` for readiness, appending at most `max_events`
    /// decoded records to `sink` (cleared first). Returns the record count;
    /// timeout expiry returns `Ok(0)`.
    fn wait(
        &self,
        sink: &mut Vec<NativeEvent>,
        max_events: usize,
        timeout: Option<Duration>,
    ) -> io::Result<usize>;

    /// Unblocks a concurrent `wait` call.
    fn wake(&self) -> io::Result<()>;
}

/// Creates the native backend for the build target.
#[cfg(target_os = "linux")]
pub fn native_backend() -> io::Result<Arc<dyn Backend>> {
    Ok(Arc::new(EpollBackend::new()?))
}

/// Creates the native backend for the build target.
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub fn native_backend() -> io::Result<Arc<dyn Backend>> {
    Ok(Arc::new(KqueueBackend::new()?))
}
