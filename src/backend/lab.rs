//! Deterministic lab backend.
//!
//! A controllable in-memory stand-in for the kernel, used to test reactor
//! and pool behavior without OS facilities: readiness is injected, faults
//! are scripted, and the subscription table is inspectable so tests can
//! assert exactly what state the "kernel" holds.

use super::{Backend, Deregistered};
use crate::event::NativeEvent;
use crate::interest::Interest;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Longest one lab wait call parks on an empty queue. Keeps `wait(None)`
/// honoring the blocking contract (wait loops yield instead of spinning)
/// while every call still returns promptly for deterministic tests.
const MAX_PARK: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct LabState {
    subscriptions: HashMap<RawFd, Subscription>,
    pending: Vec<NativeEvent>,
    /// Fail the next whole registration attempt.
    fail_next_register: bool,
    /// Fail the write sub-registration of the next two-part registration,
    /// after the read part has been applied.
    fail_next_write_sub: bool,
    /// Fail the next wait call, retiring the reactor driving it.
    fail_next_wait: bool,
    /// A wake arrived with no waiter parked; the next wait consumes it
    /// without parking.
    woken: bool,
    register_calls: usize,
    wakes: usize,
}

#[derive(Debug, Clone, Copy)]
struct Subscription {
    mask: Interest,
    token: u64,
}

/// In-memory backend with injected readiness and scriptable faults.
#[derive(Debug, Default)]
pub struct LabBackend {
    state: Mutex<LabState>,
    wakeup: Condvar,
}

impl LabBackend {
    /// Creates an empty lab backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the mask the mock kernel currently holds for `fd`.
    #[must_use]
    pub fn subscription(&self, fd: RawFd) -> Option<Interest> {
        self.state.lock().subscriptions.get(&fd).map(|s| s.mask)
    }

    /// Number of descriptors the mock kernel tracks.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Total register/reregister calls observed.
    #[must_use]
    pub fn register_calls(&self) -> usize {
        self.state.lock().register_calls
    }

    /// Number of wake calls observed.
    #[must_use]
    pub fn wakes(&self) -> usize {
        self.state.lock().wakes
    }

    /// Scripts the next registration attempt to fail outright.
    pub fn fail_next_register(&self) {
        self.state.lock().fail_next_register = true;
    }

    /// Scripts the next two-part registration to fail its second (write)
    /// sub-registration after the first has been applied, exercising the
    /// rollback path.
    pub fn fail_next_write_sub_registration(&self) {
        self.state.lock().fail_next_write_sub = true;
    }

    /// Scripts the next wait call to fail, exercising reactor retirement.
    pub fn fail_next_wait(&self) {
        self.state.lock().fail_next_wait = true;
    }

    /// Makes the mock kernel forget `fd`, simulating the peer tearing the
    /// socket down before the application deregisters it.
    pub fn forget(&self, fd: RawFd) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.subscriptions.remove(&fd);
        let subscriptions = &state.subscriptions;
        state
            .pending
            .retain(|event| subscriptions.values().any(|sub| sub.token == event.token));
    }

    /// Injects read readiness for `fd`.
    pub fn inject_readable(&self, fd: RawFd) {
        self.inject(fd, |event| event.readable = true);
    }

    /// Injects write readiness for `fd`.
    pub fn inject_writable(&self, fd: RawFd) {
        self.inject(fd, |event| event.writable = true);
    }

    /// Injects a hangup for `fd`.
    pub fn inject_hangup(&self, fd: RawFd) {
        self.inject(fd, |event| event.hangup = true);
    }

    /// Injects an arbitrary native record for `fd` (composite error+hangup,
    /// residue bits, and so on).
    pub fn inject(&self, fd: RawFd, build: impl FnOnce(&mut NativeEvent)) {
        let mut state = self.state.lock();
        let Some(sub) = state.subscriptions.get(&fd).copied() else {
            // The kernel never reports descriptors it does not track.
            return;
        };
        let mut event = NativeEvent::for_token(sub.token);
        build(&mut event);
        if !matches(&event, sub.mask) {
            // Not subscribed for the fired readiness and no error/hangup:
            // the mechanism would not have queued a record at all.
            return;
        }
        state.pending.push(event);
        self.wakeup.notify_all();
    }
}

/// True if the mock kernel would queue this record for the subscription.
fn matches(event: &NativeEvent, mask: Interest) -> bool {
    if event.error || event.hangup || event.residue != 0 {
        return true;
    }
    !event.readiness().intersect(mask).is_empty()
}

impl Backend for LabBackend {
    fn name(&self) -> &'static str {
        "lab"
    }

    fn register(&self, fd: RawFd, mask: Interest, token: u64) -> io::Result<()> {
        let mut state = self.state.lock();
        state.register_calls += 1;

        if state.fail_next_register {
            state.fail_next_register = false;
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        if state.fail_next_write_sub && mask.is_writable() {
            state.fail_next_write_sub = false;
            // The read sub-registration succeeded, the write one failed;
            // roll back so the caller observes zero residual state.
            state.subscriptions.remove(&fd);
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }

        state.subscriptions.insert(fd, Subscription { mask, token });
        Ok(())
    }

    fn reregister(&self, fd: RawFd, mask: Interest, token: u64) -> io::Result<()> {
        let mut state = self.state.lock();
        state.register_calls += 1;

        if state.fail_next_register {
            state.fail_next_register = false;
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }

        state.subscriptions.insert(fd, Subscription { mask, token });
        Ok(())
    }

    fn deregister(&self, fd: RawFd, _mask: Interest) -> io::Result<Deregistered> {
        let mut state = self.state.lock();
        if state.subscriptions.remove(&fd).is_some() {
            Ok(Deregistered::Removed)
        } else {
            Ok(Deregistered::AlreadyGone)
        }
    }

    fn wait(
        &self,
        sink: &mut Vec<NativeEvent>,
        max_events: usize,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        sink.clear();
        let mut state = self.state.lock();
        if state.fail_next_wait {
            state.fail_next_wait = false;
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        if state.pending.is_empty() && !state.woken {
            // Bounded park; injections and wakes cut it short.
            let park = timeout.map_or(MAX_PARK, |limit| limit.min(MAX_PARK));
            let _ = self.wakeup.wait_for(&mut state, park);
        }
        state.woken = false;
        let take = state.pending.len().min(max_events);
        sink.extend(state.pending.drain(..take));
        Ok(sink.len())
    }

    fn wake(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.wakes += 1;
        state.woken = true;
        self.wakeup.notify_all();
        Ok(())
    }
}
