//! Reactor: one native poll context, its registration table, and the wait
//! loop body.
//!
//! Each table entry moves through `unregistered → registered(mask) →
//! [mask mutated any number of times] → deregistered`; there are no other
//! states, and a deregistered handler can only come back by constructing a
//! new registration. The kernel and the table are kept in lock-step: every
//! mutation tells the backend the complete desired mask, and the table is
//! updated only after the kernel call succeeds, so a failed mutation leaves
//! the prior, consistent state.
//!
//! # Locking discipline
//!
//! One mutex serializes the registration table and all backend
//! register/deregister calls for this reactor; mutating one native poll
//! context from several threads without serialization is undefined in both
//! mechanisms. The blocking `wait` itself runs outside the lock, so interest
//! mutations from other threads never stall behind it; callbacks are
//! dispatched after the lock is released.

use crate::backend::{Backend, Deregistered};
use crate::event::{Event, Events, NativeEvent};
use crate::handler::{EventCallback, HandlerEntry, HandlerTable, HandlerToken};
use crate::interest::Interest;
use crate::MuxError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Outcome of a successful `remove_interest` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterestChange {
    /// The kernel subscription now reflects the reduced mask.
    Updated,
    /// The mask emptied; the descriptor was deregistered and its entry
    /// removed.
    Deregistered,
    /// The mask emptied; the kernel had already forgotten the descriptor
    /// (peer teardown). The entry is removed, same as `Deregistered`.
    AlreadyGone,
}

struct TableState {
    handlers: HandlerTable,
    by_fd: HashMap<RawFd, HandlerToken>,
}

/// Owner of one native poll context and the handlers multiplexed on it.
pub struct Reactor {
    backend: Arc<dyn Backend>,
    table: Mutex<TableState>,
    events_capacity: usize,
}

impl Reactor {
    /// Creates a reactor over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, events_capacity: usize) -> Self {
        Self {
            backend,
            table: Mutex::new(TableState {
                handlers: HandlerTable::new(),
                by_fd: HashMap::new(),
            }),
            events_capacity,
        }
    }

    /// Creates a reactor over the build target's native backend.
    pub fn native(events_capacity: usize) -> io::Result<Self> {
        Ok(Self::new(crate::backend::native_backend()?, events_capacity))
    }

    /// Backend mechanism name, for logs.
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Number of live registrations.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.table.lock().handlers.len()
    }

    /// Current interest mask for a handler, if it is still registered.
    #[must_use]
    pub fn mask(&self, token: HandlerToken) -> Option<Interest> {
        self.table.lock().handlers.get(token).map(|entry| entry.mask)
    }

    /// Descriptor for a handler, if it is still registered.
    #[must_use]
    pub fn descriptor(&self, token: HandlerToken) -> Option<RawFd> {
        self.table.lock().handlers.get(token).map(|entry| entry.fd)
    }

    /// Registers a descriptor with an initial mask and its notification
    /// callback. An empty initial mask is allowed; error/hangup are
    /// monitored regardless.
    pub fn register(
        &self,
        fd: RawFd,
        mask: Interest,
        callback: Arc<dyn EventCallback>,
    ) -> Result<HandlerToken, MuxError> {
        let mut table = self.table.lock();
        if table.by_fd.contains_key(&fd) {
            return Err(MuxError::RegistrationFailed {
                fd,
                requested: mask,
                source: io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "descriptor already registered with this reactor",
                ),
            });
        }

        let token = table.handlers.insert(HandlerEntry { fd, mask, callback });
        if let Err(source) = self.backend.register(fd, mask, token.to_u64()) {
            // Kernel refused: withdraw the entry so the table stays in
            // lock-step.
            table.handlers.remove(token);
            return Err(MuxError::RegistrationFailed {
                fd,
                requested: mask,
                source,
            });
        }
        table.by_fd.insert(fd, token);
        debug!(fd, mask = %mask, token = token.to_u64(), "handler registered");
        Ok(token)
    }

    /// Adds interest bits, re-registering with the full new mask. Adding an
    /// already-present bit still issues the (kernel-idempotent) call.
    pub fn add_interest(&self, token: HandlerToken, mode: Interest) -> Result<(), MuxError> {
        let mut table = self.table.lock();
        let entry = table.handlers.get_mut(token).ok_or(MuxError::HandlerGone)?;
        let new_mask = entry.mask.add(mode);
        let fd = entry.fd;

        self.backend
            .reregister(fd, new_mask, token.to_u64())
            .map_err(|source| MuxError::RegistrationFailed {
                fd,
                requested: new_mask,
                source,
            })?;
        entry.mask = new_mask;
        trace!(fd, mask = %new_mask, "interest added");
        Ok(())
    }

    /// Removes interest bits. When the mask empties, the whole descriptor is
    /// deregistered and its entry dropped; a kernel that already forgot the
    /// descriptor yields [`InterestChange::AlreadyGone`], treated the same
    /// as success. Removing an absent bit is a no-op that reports success.
    pub fn remove_interest(
        &self,
        token: HandlerToken,
        mode: Interest,
    ) -> Result<InterestChange, MuxError> {
        let mut table = self.table.lock();
        let entry = table.handlers.get_mut(token).ok_or(MuxError::HandlerGone)?;
        let fd = entry.fd;
        let old_mask = entry.mask;
        let new_mask = old_mask.remove(mode);

        if new_mask == old_mask {
            // Nothing to clear; mirror the idempotent-add path with one
            // kernel-idempotent call and leave the table untouched.
            self.backend
                .reregister(fd, new_mask, token.to_u64())
                .map_err(|source| MuxError::RegistrationFailed {
                    fd,
                    requested: new_mask,
                    source,
                })?;
            return Ok(InterestChange::Updated);
        }

        if new_mask.is_empty() {
            let outcome = self
                .backend
                .deregister(fd, old_mask)
                .map_err(|source| MuxError::RegistrationFailed {
                    fd,
                    requested: new_mask,
                    source,
                })?;
            table.handlers.remove(token);
            table.by_fd.remove(&fd);
            debug!(fd, ?outcome, "handler deregistered (mask emptied)");
            return Ok(match outcome {
                Deregistered::Removed => InterestChange::Deregistered,
                Deregistered::AlreadyGone => InterestChange::AlreadyGone,
            });
        }

        self.backend
            .reregister(fd, new_mask, token.to_u64())
            .map_err(|source| MuxError::RegistrationFailed {
                fd,
                requested: new_mask,
                source,
            })?;
        if let Some(entry) = table.handlers.get_mut(token) {
            entry.mask = new_mask;
        }
        trace!(fd, mask = %new_mask, "interest removed");
        Ok(InterestChange::Updated)
    }

    /// Deregisters a handler outright, regardless of its current mask.
    pub fn deregister(&self, token: HandlerToken) -> Result<Deregistered, MuxError> {
        let mut table = self.table.lock();
        let entry = table.handlers.get(token).ok_or(MuxError::HandlerGone)?;
        let fd = entry.fd;
        let mask = entry.mask;

        let outcome =
            self.backend
                .deregister(fd, mask)
                .map_err(|source| MuxError::RegistrationFailed {
                    fd,
                    requested: Interest::NONE,
                    source,
                })?;
        table.handlers.remove(token);
        table.by_fd.remove(&fd);
        debug!(fd, ?outcome, "handler deregistered");
        Ok(outcome)
    }

    /// Deregisters every handler, for shutdown. Kernel already-gone races
    /// are folded into success; genuine faults are logged and the teardown
    /// continues.
    pub fn deregister_all(&self) {
        let mut table = self.table.lock();
        for (token, entry) in table.handlers.drain() {
            table.by_fd.remove(&entry.fd);
            if let Err(err) = self.backend.deregister(entry.fd, entry.mask) {
                warn!(fd = entry.fd, token = token.to_u64(), error = %err,
                      "deregistration during shutdown failed");
            }
        }
    }

    /// Blocks for readiness and fills `events` with validated notifications.
    ///
    /// Records whose token no longer resolves (deregistered concurrently)
    /// are stale, not errors, and are dropped silently. Fired readiness is
    /// intersected with the registered mask; error/hangup pass through
    /// regardless.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> Result<usize, MuxError> {
        events.clear();
        let mut natives = Vec::new();
        self.backend
            .wait(&mut natives, events.capacity(), timeout)
            .map_err(|source| MuxError::WaitFailed { source })?;

        let table = self.table.lock();
        for native in &natives {
            if let Some((_, event)) = translate(&table, native) {
                events.push(event);
            }
        }
        Ok(events.len())
    }

    /// One wait-loop iteration: block for readiness, then deliver each
    /// notification to its handler's callback (outside the table lock).
    pub fn wait_and_dispatch(&self, timeout: Option<Duration>) -> Result<usize, MuxError> {
        let mut natives = Vec::new();
        self.backend
            .wait(&mut natives, self.events_capacity, timeout)
            .map_err(|source| MuxError::WaitFailed { source })?;

        let mut dispatch: Vec<(Arc<dyn EventCallback>, Event)> = Vec::with_capacity(natives.len());
        {
            let table = self.table.lock();
            for native in &natives {
                if let Some(pair) = translate(&table, native) {
                    dispatch.push(pair);
                }
            }
        }

        for (callback, event) in &dispatch {
            callback.on_event(event.readiness, event.error, event.hangup);
        }
        Ok(dispatch.len())
    }

    /// Unblocks a concurrent wait on this reactor.
    pub fn wake(&self) -> io::Result<()> {
        self.backend.wake()
    }
}

/// Validates one native record against the registration table.
fn translate(
    table: &TableState,
    native: &NativeEvent,
) -> Option<(Arc<dyn EventCallback>, Event)> {
    let token = HandlerToken::from_u64(native.token);
    let Some(entry) = table.handlers.get(token) else {
        // Deregistered between the kernel report and this lookup.
        trace!(token = native.token, "dropping stale readiness record");
        return None;
    };

    if native.residue != 0 {
        debug!(
            fd = entry.fd,
            residue = format_args!("{:#x}", native.residue),
            "native record carried unrecognized flag bits"
        );
    }

    let readiness = native.readiness().intersect(entry.mask);
    if readiness.is_empty() && !native.error && !native.hangup {
        return None;
    }
    Some((
        Arc::clone(&entry.callback),
        Event::new(token, readiness, native.error, native.hangup),
    ))
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("backend", &self.backend.name())
            .field("handler_count", &self.handler_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LabBackend;

    fn lab_reactor() -> (Arc<LabBackend>, Reactor) {
        let lab = Arc::new(LabBackend::new());
        let reactor = Reactor::new(Arc::clone(&lab) as Arc<dyn Backend>, 64);
        (lab, reactor)
    }

    fn noop_callback() -> Arc<dyn EventCallback> {
        Arc::new(|_: Interest, _: bool, _: bool| {})
    }

    #[test]
    fn register_keeps_kernel_in_lock_step() {
        let (lab, reactor) = lab_reactor();
        let token = reactor
            .register(3, Interest::READABLE, noop_callback())
            .expect("register");

        assert_eq!(lab.subscription(3), Some(Interest::READABLE));
        assert_eq!(reactor.mask(token), Some(Interest::READABLE));
        assert_eq!(reactor.handler_count(), 1);
    }

    #[test]
    fn duplicate_descriptor_rejected() {
        let (_lab, reactor) = lab_reactor();
        reactor
            .register(3, Interest::READABLE, noop_callback())
            .expect("first register");
        let err = reactor
            .register(3, Interest::WRITABLE, noop_callback())
            .expect_err("duplicate must fail");
        assert!(matches!(err, MuxError::RegistrationFailed { fd: 3, .. }));
        assert_eq!(reactor.handler_count(), 1);
    }

    #[test]
    fn failed_register_leaves_no_entry() {
        let (lab, reactor) = lab_reactor();
        lab.fail_next_register();
        let err = reactor
            .register(5, Interest::READABLE, noop_callback())
            .expect_err("scripted failure");
        assert!(matches!(err, MuxError::RegistrationFailed { .. }));
        assert_eq!(reactor.handler_count(), 0);
        assert_eq!(lab.subscription(5), None);
    }

    #[test]
    fn add_interest_reregisters_full_mask() {
        let (lab, reactor) = lab_reactor();
        let token = reactor
            .register(3, Interest::READABLE, noop_callback())
            .expect("register");

        reactor
            .add_interest(token, Interest::WRITABLE)
            .expect("add");
        assert_eq!(lab.subscription(3), Some(Interest::both()));
        assert_eq!(reactor.mask(token), Some(Interest::both()));
    }

    #[test]
    fn idempotent_add_still_calls_kernel() {
        let (lab, reactor) = lab_reactor();
        let token = reactor
            .register(3, Interest::READABLE, noop_callback())
            .expect("register");
        let calls_before = lab.register_calls();

        reactor
            .add_interest(token, Interest::READABLE)
            .expect("redundant add");
        assert_eq!(lab.subscription(3), Some(Interest::READABLE));
        assert_eq!(lab.register_calls(), calls_before + 1);
    }

    #[test]
    fn failed_mutation_preserves_prior_mask() {
        let (lab, reactor) = lab_reactor();
        let token = reactor
            .register(3, Interest::READABLE, noop_callback())
            .expect("register");

        lab.fail_next_register();
        let err = reactor
            .add_interest(token, Interest::WRITABLE)
            .expect_err("scripted failure");
        assert!(matches!(err, MuxError::RegistrationFailed { .. }));
        // Table and kernel both still show the prior mask.
        assert_eq!(reactor.mask(token), Some(Interest::READABLE));
        assert_eq!(lab.subscription(3), Some(Interest::READABLE));
    }

    #[test]
    fn remove_to_empty_deregisters_descriptor() {
        let (lab, reactor) = lab_reactor();
        let token = reactor
            .register(3, Interest::READABLE, noop_callback())
            .expect("register");

        let change = reactor
            .remove_interest(token, Interest::READABLE)
            .expect("remove");
        assert_eq!(change, InterestChange::Deregistered);
        assert_eq!(reactor.handler_count(), 0);
        assert_eq!(lab.subscription(3), None);
        // The token is now stale.
        assert!(matches!(
            reactor.add_interest(token, Interest::READABLE),
            Err(MuxError::HandlerGone)
        ));
    }

    #[test]
    fn remove_absent_bit_is_noop_success() {
        let (lab, reactor) = lab_reactor();
        let token = reactor
            .register(3, Interest::READABLE, noop_callback())
            .expect("register");

        let change = reactor
            .remove_interest(token, Interest::WRITABLE)
            .expect("no-op remove");
        assert_eq!(change, InterestChange::Updated);
        assert_eq!(reactor.mask(token), Some(Interest::READABLE));
        assert_eq!(lab.subscription(3), Some(Interest::READABLE));
        assert_eq!(reactor.handler_count(), 1);
    }

    #[test]
    fn deregistration_race_reports_already_gone() {
        let (lab, reactor) = lab_reactor();
        let token = reactor
            .register(3, Interest::READABLE, noop_callback())
            .expect("register");

        // Peer teardown: the kernel forgets the descriptor first.
        lab.forget(3);
        let change = reactor
            .remove_interest(token, Interest::READABLE)
            .expect("already-gone is success");
        assert_eq!(change, InterestChange::AlreadyGone);
        assert_eq!(reactor.handler_count(), 0);
    }

    #[test]
    fn stale_records_dropped_silently() {
        let (lab, reactor) = lab_reactor();
        let token = reactor
            .register(3, Interest::READABLE, noop_callback())
            .expect("register");
        lab.inject_readable(3);

        // Deregistered after the kernel queued the record: in the lab the
        // subscription's record stays pending, mimicking the race.
        let stale = reactor.deregister(token);
        assert!(stale.is_ok());

        let mut events = Events::with_capacity(8);
        let count = reactor.wait(&mut events, None).expect("wait");
        assert_eq!(count, 0);
    }

    #[test]
    fn wait_intersects_with_registered_mask() {
        let (lab, reactor) = lab_reactor();
        let token = reactor
            .register(3, Interest::both(), noop_callback())
            .expect("register");
        reactor
            .remove_interest(token, Interest::WRITABLE)
            .expect("remove write");

        // Kernel reports write-ready anyway (queued before the reduction).
        lab.inject(3, |event| event.writable = true);
        let mut events = Events::with_capacity(8);
        let count = reactor.wait(&mut events, None).expect("wait");
        assert_eq!(count, 0);
    }

    #[test]
    fn error_hangup_delivered_regardless_of_mask() {
        let (lab, reactor) = lab_reactor();
        let token = reactor
            .register(3, Interest::NONE, noop_callback())
            .expect("register");

        lab.inject(3, |event| {
            event.error = true;
            event.hangup = true;
        });
        let mut events = Events::with_capacity(8);
        let count = reactor.wait(&mut events, None).expect("wait");
        assert_eq!(count, 1);
        let event = events.iter().next().expect("event");
        assert_eq!(event.token, token);
        assert!(event.error);
        assert!(event.hangup);
        assert!(event.readiness.is_empty());
    }

    #[test]
    fn dispatch_invokes_callback_with_fired_mask() {
        use parking_lot::Mutex as PlMutex;

        let lab = Arc::new(LabBackend::new());
        let reactor = Reactor::new(Arc::clone(&lab) as Arc<dyn Backend>, 64);

        let seen: Arc<PlMutex<Vec<(Interest, bool, bool)>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: Arc<dyn EventCallback> =
            Arc::new(move |readiness: Interest, error: bool, hangup: bool| {
                sink.lock().push((readiness, error, hangup));
            });

        reactor
            .register(3, Interest::READABLE, callback)
            .expect("register");
        lab.inject_readable(3);

        let dispatched = reactor.wait_and_dispatch(None).expect("dispatch");
        assert_eq!(dispatched, 1);
        let seen = seen.lock();
        assert_eq!(seen.as_slice(), &[(Interest::READABLE, false, false)]);
    }

    #[test]
    fn deregister_all_empties_table_and_kernel() {
        let (lab, reactor) = lab_reactor();
        reactor
            .register(1, Interest::READABLE, noop_callback())
            .expect("register 1");
        reactor
            .register(2, Interest::WRITABLE, noop_callback())
            .expect("register 2");

        reactor.deregister_all();
        assert_eq!(reactor.handler_count(), 0);
        assert_eq!(lab.subscription_count(), 0);
    }
}
