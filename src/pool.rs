//! Fixed pool of reactors, each with a dedicated wait-loop thread.
//!
//! The pool is the application-facing surface: callers register sockets and
//! get back a [`HandlerId`] naming the reactor and table slot; readiness is
//! delivered on that reactor's thread for the socket's whole lifetime. The
//! pool size is fixed at construction, and a socket is never migrated
//! between reactors; no atomic cross-context kernel operation exists that
//! would make migration safe.
//!
//! A reactor whose wait call fails is retired: its thread stops, the fault
//! is recorded for [`MuxPool::take_faults`], and the remaining reactors keep
//! serving their own handlers. [`MuxPool::shutdown`] stops every wait loop,
//! deregisters all handlers, and joins the threads; it is idempotent, and
//! dropping the pool performs it implicitly.

use crate::backend::{Backend, Deregistered};
use crate::config::{AssignmentPolicy, PoolConfig};
use crate::handler::{EventCallback, HandlerToken};
use crate::interest::Interest;
use crate::reactor::{InterestChange, Reactor};
use crate::MuxError;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Identifies a handler registered through a pool: which reactor holds it,
/// and its validated token there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId {
    reactor: usize,
    token: HandlerToken,
}

impl HandlerId {
    /// Index of the reactor serving this handler.
    #[must_use]
    pub fn reactor(&self) -> usize {
        self.reactor
    }

    /// The handler's token on that reactor.
    #[must_use]
    pub fn token(&self) -> HandlerToken {
        self.token
    }
}

/// A wait-loop fault recorded by a retired reactor.
#[derive(Debug)]
pub struct ReactorFault {
    /// Index of the reactor that stopped.
    pub reactor: usize,
    /// The fatal error its wait call returned.
    pub error: MuxError,
}

struct PoolShared {
    reactors: Vec<Arc<Reactor>>,
    assignment: AssignmentPolicy,
    next: AtomicUsize,
    shutting_down: AtomicBool,
    faults: Mutex<Vec<ReactorFault>>,
    /// Descriptors registered anywhere in the pool. A descriptor lives in
    /// at most one reactor's table at a time; this set is the pool-wide
    /// gate enforcing that.
    fds: Mutex<HashSet<RawFd>>,
}

/// Fixed-size reactor pool with one wait-loop thread per reactor.
pub struct MuxPool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl MuxPool {
    /// Builds a pool of native reactors per `config` and starts their wait
    /// threads.
    pub fn new(config: &PoolConfig) -> Result<Self, MuxError> {
        config.validate()?;
        let mut backends: Vec<Arc<dyn Backend>> = Vec::with_capacity(config.reactors);
        for _ in 0..config.reactors {
            backends.push(
                crate::backend::native_backend()
                    .map_err(|source| MuxError::PoolInit { source })?,
            );
        }
        Self::with_backends(backends, config)
    }

    /// Builds a pool over caller-supplied backends, one reactor per backend.
    /// The backend count overrides `config.reactors`.
    pub fn with_backends(
        backends: Vec<Arc<dyn Backend>>,
        config: &PoolConfig,
    ) -> Result<Self, MuxError> {
        config.validate()?;
        if backends.is_empty() {
            return Err(crate::config::ConfigError::NoReactors.into());
        }

        let reactors: Vec<Arc<Reactor>> = backends
            .into_iter()
            .map(|backend| Arc::new(Reactor::new(backend, config.events_capacity)))
            .collect();
        info!(
            reactors = reactors.len(),
            backend = reactors[0].backend_name(),
            "starting multiplexer pool"
        );

        let shared = Arc::new(PoolShared {
            reactors,
            assignment: config.assignment,
            next: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            faults: Mutex::new(Vec::new()),
            fds: Mutex::new(HashSet::new()),
        });

        let mut threads = Vec::with_capacity(shared.reactors.len());
        for index in 0..shared.reactors.len() {
            let worker = Arc::clone(&shared);
            match std::thread::Builder::new()
                .name(format!("evmux-reactor-{index}"))
                .spawn(move || wait_loop(&worker, index))
            {
                Ok(handle) => threads.push(handle),
                Err(source) => {
                    // Tear the partial set down; already-spawned threads
                    // must not stay parked in their waits forever.
                    shared.shutting_down.store(true, Ordering::Release);
                    stop_threads(&shared, threads);
                    return Err(MuxError::PoolInit { source });
                }
            }
        }

        Ok(Self {
            shared,
            threads: Mutex::new(threads),
        })
    }

    /// Number of reactors in the pool.
    #[must_use]
    pub fn reactor_count(&self) -> usize {
        self.shared.reactors.len()
    }

    /// Total live registrations across all reactors.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.shared
            .reactors
            .iter()
            .map(|reactor| reactor.handler_count())
            .sum()
    }

    /// Registers a socket on a reactor chosen by the assignment policy. The
    /// socket stays on that reactor until deregistered. A descriptor that is
    /// already registered anywhere in the pool is rejected; one socket never
    /// spans two kernel poll contexts.
    pub fn register_handler(
        &self,
        fd: RawFd,
        mask: Interest,
        callback: Arc<dyn EventCallback>,
    ) -> Result<HandlerId, MuxError> {
        if self.shared.shutting_down.load(Ordering::Acquire) {
            return Err(MuxError::ShuttingDown);
        }
        if !self.shared.fds.lock().insert(fd) {
            return Err(MuxError::RegistrationFailed {
                fd,
                requested: mask,
                source: io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "descriptor already registered with this pool",
                ),
            });
        }
        let reactor = self.assign(fd);
        match self.shared.reactors[reactor].register(fd, mask, callback) {
            Ok(token) => Ok(HandlerId { reactor, token }),
            Err(err) => {
                self.shared.fds.lock().remove(&fd);
                Err(err)
            }
        }
    }

    /// Adds interest bits on the handler's reactor.
    pub fn add_interest(&self, id: HandlerId, mode: Interest) -> Result<(), MuxError> {
        self.reactor_for(id)?.add_interest(id.token, mode)
    }

    /// Removes interest bits on the handler's reactor; an emptied mask
    /// deregisters the socket and frees its descriptor for re-registration.
    pub fn remove_interest(
        &self,
        id: HandlerId,
        mode: Interest,
    ) -> Result<InterestChange, MuxError> {
        let reactor = self.reactor_for(id)?;
        let fd = reactor.descriptor(id.token);
        let change = reactor.remove_interest(id.token, mode)?;
        if matches!(
            change,
            InterestChange::Deregistered | InterestChange::AlreadyGone
        ) {
            if let Some(fd) = fd {
                self.shared.fds.lock().remove(&fd);
            }
        }
        Ok(change)
    }

    /// Deregisters a handler outright, regardless of its current mask.
    pub fn deregister_handler(&self, id: HandlerId) -> Result<Deregistered, MuxError> {
        let reactor = self.reactor_for(id)?;
        let fd = reactor.descriptor(id.token);
        let outcome = reactor.deregister(id.token)?;
        if let Some(fd) = fd {
            self.shared.fds.lock().remove(&fd);
        }
        Ok(outcome)
    }

    /// Current interest mask for a handler, if still registered.
    #[must_use]
    pub fn mask(&self, id: HandlerId) -> Option<Interest> {
        self.shared
            .reactors
            .get(id.reactor)
            .and_then(|reactor| reactor.mask(id.token))
    }

    /// Drains the faults recorded by retired reactors.
    pub fn take_faults(&self) -> Vec<ReactorFault> {
        std::mem::take(&mut *self.shared.faults.lock())
    }

    /// Stops every wait loop, deregisters all handlers, and joins the
    /// threads. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("shutting down multiplexer pool");
        for reactor in &self.shared.reactors {
            reactor.deregister_all();
        }
        self.shared.fds.lock().clear();
        let threads = std::mem::take(&mut *self.threads.lock());
        stop_threads(&self.shared, threads);
        info!("multiplexer pool stopped");
    }

    fn assign(&self, fd: RawFd) -> usize {
        let count = self.shared.reactors.len();
        match self.shared.assignment {
            AssignmentPolicy::RoundRobin => {
                self.shared.next.fetch_add(1, Ordering::Relaxed) % count
            }
            AssignmentPolicy::FdHash => {
                let mut hasher = DefaultHasher::new();
                fd.hash(&mut hasher);
                usize::try_from(hasher.finish() % count as u64).unwrap_or(0)
            }
        }
    }

    fn reactor_for(&self, id: HandlerId) -> Result<&Arc<Reactor>, MuxError> {
        self.shared
            .reactors
            .get(id.reactor)
            .ok_or(MuxError::HandlerGone)
    }
}

impl Drop for MuxPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for MuxPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxPool")
            .field("reactors", &self.shared.reactors.len())
            .field("shutting_down", &self.shared.shutting_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Wakes every reactor and joins the given wait threads. Used by both
/// normal shutdown and the construction error path; callers set the
/// shutting-down flag first.
fn stop_threads(shared: &PoolShared, threads: Vec<JoinHandle<()>>) {
    for reactor in &shared.reactors {
        if let Err(err) = reactor.wake() {
            warn!(error = %err, "failed to wake reactor for shutdown");
        }
    }
    for handle in threads {
        if handle.join().is_err() {
            warn!("reactor wait thread panicked");
        }
    }
}

/// Body of one reactor's wait thread.
fn wait_loop(shared: &PoolShared, index: usize) {
    let reactor = &shared.reactors[index];
    debug!(reactor = index, backend = reactor.backend_name(), "wait loop started");
    loop {
        if shared.shutting_down.load(Ordering::Acquire) {
            break;
        }
        match reactor.wait_and_dispatch(None) {
            Ok(_) => {}
            Err(fault) => {
                // A failed wait retires this reactor; the rest of the pool
                // keeps serving its own handlers.
                error!(reactor = index, error = %fault, "wait loop fault, retiring reactor");
                shared
                    .faults
                    .lock()
                    .push(ReactorFault { reactor: index, error: fault });
                break;
            }
        }
    }
    debug!(reactor = index, "wait loop stopped");
}
