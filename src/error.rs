//! Error taxonomy for the multiplexer core.
//!
//! Every fault is returned to the immediate caller as a value; nothing here
//! aborts the process. The taxonomy separates three severities:
//!
//! - [`MuxError::RegistrationFailed`] is fatal to one handler's subscription.
//!   The caller treats the associated connection as broken and closes it; the
//!   registration table is left in its prior, consistent state.
//! - [`MuxError::WaitFailed`] is fatal to one reactor. The reactor stops
//!   serving its handlers and the fault surfaces to the pool owner, which
//!   fails over or closes the affected connections.
//! - Kernel "no such registration" during deregistration is not an error at
//!   all; it is reported as [`Deregistered::AlreadyGone`](crate::backend::Deregistered).

use crate::interest::Interest;
use std::io;
use std::os::unix::io::RawFd;
use thiserror::Error;

/// Faults produced by registration, deregistration, and wait operations.
#[derive(Debug, Error)]
pub enum MuxError {
    /// Kernel registration for a handler failed; the subscription is dead
    /// and the connection should be closed.
    #[error("registration failed for fd {fd} (requested {requested}): {source}")]
    RegistrationFailed {
        /// Descriptor the registration was for.
        fd: RawFd,
        /// Full mask that was being established.
        requested: Interest,
        /// Underlying kernel error.
        #[source]
        source: io::Error,
    },

    /// The token does not resolve to a live registration (already
    /// deregistered, or minted for a previous occupant of the slot).
    #[error("handler is no longer registered")]
    HandlerGone,

    /// The blocking wait itself failed; fatal to the owning reactor.
    #[error("reactor wait failed: {source}")]
    WaitFailed {
        /// Underlying kernel error.
        #[source]
        source: io::Error,
    },

    /// The pool refused the operation because shutdown has begun.
    #[error("multiplexer pool is shutting down")]
    ShuttingDown,

    /// Pool construction failed before any handler was registered (native
    /// poll context creation or wait-thread spawn).
    #[error("failed to initialize reactor pool: {source}")]
    PoolInit {
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Invalid pool configuration.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

impl MuxError {
    /// Returns true if the fault retires the whole reactor rather than a
    /// single handler.
    #[must_use]
    pub fn is_reactor_fatal(&self) -> bool {
        matches!(self, Self::WaitFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_failed_names_fd_and_mask() {
        let err = MuxError::RegistrationFailed {
            fd: 12,
            requested: Interest::both(),
            source: io::Error::from_raw_os_error(libc::EBADF),
        };
        let text = err.to_string();
        assert!(text.contains("fd 12"));
        assert!(text.contains("READABLE | WRITABLE"));
        assert!(!err.is_reactor_fatal());
    }

    #[test]
    fn wait_failed_is_reactor_fatal() {
        let err = MuxError::WaitFailed {
            source: io::Error::from_raw_os_error(libc::EBADF),
        };
        assert!(err.is_reactor_fatal());
        assert!(!MuxError::HandlerGone.is_reactor_fatal());
    }
}
