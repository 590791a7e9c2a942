//! Socket readiness multiplexing for an asynchronous point-to-point comm
//! layer.
//!
//! One abstraction is presented over the two kernel mechanisms this crate
//! targets: interest masks, registered per socket, with readiness delivered
//! to per-handler callbacks from a fixed pool of reactor threads. On Linux
//! the backend is epoll; on the BSDs and macOS it is kqueue. Both are driven
//! level-triggered, through the same [`backend::Backend`] contract, so
//! everything above the backend layer is platform-independent.
//!
//! # Layers
//!
//! - [`interest`]: the two-bit interest mask and its set algebra.
//! - [`backend`]: per-platform registration and wait primitives, plus a
//!   deterministic lab backend for tests.
//! - [`handler`]: registration records and generation-validated tokens.
//! - [`reactor`]: one poll context, its registration table, and the wait
//!   loop body.
//! - [`pool`]: the fixed reactor pool and its wait threads.
//! - [`diagnostics`]: loss-free rendering of native flag words for logs.
//!
//! # Quick start
//!
//! ```no_run
//! use evmux::{Interest, MuxPool, PoolConfig};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), evmux::MuxError> {
//! let pool = MuxPool::new(&PoolConfig::default())?;
//! # let socket_fd = 0;
//! let id = pool.register_handler(
//!     socket_fd,
//!     Interest::READABLE,
//!     Arc::new(|readiness: Interest, error: bool, hangup: bool| {
//!         // Drive the connection's read path.
//!         let _ = (readiness, error, hangup);
//!     }),
//! )?;
//! pool.add_interest(id, Interest::WRITABLE)?;
//! pool.remove_interest(id, Interest::both())?; // mask empties: deregistered
//! pool.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! # Ownership
//!
//! The multiplexer never owns sockets. Callers open, register, deregister,
//! and close; the registration table holds descriptors and callbacks only.
//! Faults are returned as [`MuxError`] values, never process aborts: a
//! registration failure retires one handler, a failed wait retires one
//! reactor (surfaced via [`pool::MuxPool::take_faults`]), and the rest of
//! the pool keeps running.

pub mod backend;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod event;
pub mod handler;
pub mod interest;
pub mod pool;
pub mod reactor;

pub use crate::config::{AssignmentPolicy, ConfigError, PoolConfig};
pub use crate::error::MuxError;
pub use crate::event::{Event, Events};
pub use crate::handler::{EventCallback, HandlerToken};
pub use crate::interest::Interest;
pub use crate::pool::{HandlerId, MuxPool, ReactorFault};
pub use crate::reactor::{InterestChange, Reactor};
