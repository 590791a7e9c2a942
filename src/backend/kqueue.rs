//! BSD/macOS kqueue backend.
//!
//! kqueue is a changelist mechanism: read and write interest are separate
//! filters, so one interest mask can require two sub-registrations. This
//! backend applies them one at a time and rolls back the first when the
//! second fails, keeping registration atomic from the caller's view — no
//! residual subscription survives a reported failure.
//!
//! Error and hangup conditions arrive through registered filters (`EV_EOF`
//! and `EV_ERROR` on the record), so the read filter is kept armed even for
//! an empty interest mask; the reactor intersects fired readiness with the
//! registered mask, which keeps unrequested readable notifications from
//! reaching callers. Filters are added without `EV_CLEAR`, so the kernel
//! reports a still-ready descriptor on every wait: level-triggered, matching
//! the epoll backend.
//!
//! `ENOENT` on filter deletion means the kernel already forgot the
//! descriptor (the peer tore the socket down first); that is the
//! already-gone case, not a fault.

use super::{Backend, Deregistered, WAKE_TOKEN};
use crate::diagnostics::describe_kevent;
use crate::event::NativeEvent;
use crate::interest::Interest;
use smallvec::SmallVec;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;
use tracing::{debug, trace};

/// Kqueue-based backend for macOS and the BSDs.
#[derive(Debug)]
pub struct KqueueBackend {
    kq: RawFd,
    wake_read: RawFd,
    wake_write: RawFd,
}

fn to_udata(token: u64) -> *mut libc::c_void {
    token as usize as *mut libc::c_void
}

fn from_udata(udata: *mut libc::c_void) -> u64 {
    udata as usize as u64
}

fn change(fd: RawFd, filter: i16, flags: u16, token: u64) -> libc::kevent {
    // Equivalent of EV_SET.
    let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
    ev.ident = fd as libc::uintptr_t;
    ev.filter = filter;
    ev.flags = flags;
    ev.udata = to_udata(token);
    ev
}

/// Decodes one kevent record with independent attribute tests.
///
/// The filter selects the readiness bit; `EV_EOF` and `EV_ERROR` map to the
/// hangup and error indicators and may both be present on the same record.
/// Flag bits outside that mapping are kept as residue rather than dropped.
pub(crate) fn decode(raw: &libc::kevent) -> NativeEvent {
    let mut native = NativeEvent::for_token(from_udata(raw.udata));
    match raw.filter {
        libc::EVFILT_READ => native.readable = true,
        libc::EVFILT_WRITE => native.writable = true,
        _ => {}
    }
    native.error = raw.flags & libc::EV_ERROR != 0;
    native.hangup = raw.flags & libc::EV_EOF != 0;
    native.residue = u32::from(raw.flags & !(libc::EV_ERROR | libc::EV_EOF));
    native
}

fn timeout_spec(timeout: Option<Duration>) -> Option<libc::timespec> {
    timeout.map(|duration| libc::timespec {
        tv_sec: libc::time_t::try_from(duration.as_secs()).unwrap_or(libc::time_t::MAX),
        tv_nsec: libc::c_long::try_from(duration.subsec_nanos()).unwrap_or(libc::c_long::MAX),
    })
}

impl KqueueBackend {
    /// Creates the kqueue and its self-pipe wake channel.
    pub fn new() -> io::Result<Self> {
        let kq = syscall(unsafe { libc::kqueue() })?;

        let mut pipe_fds = [0 as RawFd; 2];
        if let Err(err) = syscall(unsafe { libc::pipe(pipe_fds.as_mut_ptr()) }) {
            unsafe { libc::close(kq) };
            return Err(err);
        }
        let backend = Self {
            kq,
            wake_read: pipe_fds[0],
            wake_write: pipe_fds[1],
        };
        for fd in pipe_fds {
            unsafe {
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
                libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
            }
        }

        backend.apply(&[change(
            backend.wake_read,
            libc::EVFILT_READ,
            libc::EV_ADD | libc::EV_ENABLE,
            WAKE_TOKEN,
        )])?;
        debug!(kq, "kqueue backend created");
        Ok(backend)
    }

    /// Applies a changelist without collecting events.
    fn apply(&self, changes: &[libc::kevent]) -> io::Result<()> {
        let ret = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                libc::c_int::try_from(changes.len()).unwrap_or(libc::c_int::MAX),
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        syscall(ret).map(|_| ())
    }

    /// Deletes one filter, folding ENOENT into `AlreadyGone`.
    fn delete_filter(&self, fd: RawFd, filter: i16) -> io::Result<Deregistered> {
        match self.apply(&[change(fd, filter, libc::EV_DELETE, 0)]) {
            Ok(()) => Ok(Deregistered::Removed),
            Err(err)
                if err.raw_os_error() == Some(libc::ENOENT)
                    || err.raw_os_error() == Some(libc::EBADF) =>
            {
                Ok(Deregistered::AlreadyGone)
            }
            Err(err) => Err(err),
        }
    }

    fn drain_wake(&self) {
        let mut buf = [0u8; 16];
        // Nonblocking; EAGAIN just means the pipe is already drained.
        unsafe {
            libc::read(
                self.wake_read,
                buf.as_mut_ptr().cast::<libc::c_void>(),
                buf.len(),
            );
        }
    }
}

impl Backend for KqueueBackend {
    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn register(&self, fd: RawFd, mask: Interest, token: u64) -> io::Result<()> {
        // The read filter doubles as the error/hangup channel and is always
        // armed.
        self.apply(&[change(
            fd,
            libc::EVFILT_READ,
            libc::EV_ADD | libc::EV_ENABLE,
            token,
        )])?;

        if mask.is_writable() {
            if let Err(err) = self.apply(&[change(
                fd,
                libc::EVFILT_WRITE,
                libc::EV_ADD | libc::EV_ENABLE,
                token,
            )]) {
                // Second sub-registration failed: roll the first back so no
                // residual subscription is left behind.
                let _ = self.delete_filter(fd, libc::EVFILT_READ);
                return Err(err);
            }
        }
        trace!(fd, mask = %mask, "kqueue registered");
        Ok(())
    }

    fn reregister(&self, fd: RawFd, mask: Interest, token: u64) -> io::Result<()> {
        // Told the complete desired state: re-adding an active filter is
        // kernel-idempotent, deleting an absent one reports ENOENT which is
        // folded away.
        self.apply(&[change(
            fd,
            libc::EVFILT_READ,
            libc::EV_ADD | libc::EV_ENABLE,
            token,
        )])?;

        if mask.is_writable() {
            self.apply(&[change(
                fd,
                libc::EVFILT_WRITE,
                libc::EV_ADD | libc::EV_ENABLE,
                token,
            )])?;
        } else {
            self.delete_filter(fd, libc::EVFILT_WRITE)?;
        }
        trace!(fd, mask = %mask, "kqueue re-registered");
        Ok(())
    }

    fn deregister(&self, fd: RawFd, _mask: Interest) -> io::Result<Deregistered> {
        // Both filters are attempted before reporting; a failure on one must
        // not leave the other's deletion untried.
        let read = self.delete_filter(fd, libc::EVFILT_READ);
        let write = self.delete_filter(fd, libc::EVFILT_WRITE);
        let outcome = merge_deletes(read, write)?;
        if outcome == Deregistered::AlreadyGone {
            debug!(fd, "kqueue registration already gone");
        }
        trace!(fd, ?outcome, "kqueue deregistered");
        Ok(outcome)
    }

    fn wait(
        &self,
        sink: &mut Vec<NativeEvent>,
        max_events: usize,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        sink.clear();
        let max = max_events.max(1);
        let mut buf: Vec<libc::kevent> = Vec::with_capacity(max);

        let spec = timeout_spec(timeout);
        let count = unsafe {
            libc::kevent(
                self.kq,
                std::ptr::null(),
                0,
                buf.as_mut_ptr(),
                libc::c_int::try_from(max).unwrap_or(libc::c_int::MAX),
                spec.as_ref()
                    .map_or(std::ptr::null(), |spec| spec as *const libc::timespec),
            )
        };
        let count = match syscall(count) {
            Ok(n) => n as usize,
            // Interrupted waits surface as an empty batch; each call is
            // independent, so the loop simply waits again.
            Err(err) if err.kind() == io::ErrorKind::Interrupted => 0,
            Err(err) => return Err(err),
        };
        // SAFETY: kevent initialized the first `count` entries.
        unsafe { buf.set_len(count) };

        for raw in &buf {
            if from_udata(raw.udata) == WAKE_TOKEN {
                self.drain_wake();
                continue;
            }
            trace!(
                ident = raw.ident as u64,
                record = %describe_kevent(raw.filter, raw.flags),
                "kqueue event"
            );
            sink.push(decode(raw));
        }
        Ok(sink.len())
    }

    fn wake(&self) -> io::Result<()> {
        let byte = [1u8];
        let written = unsafe {
            libc::write(
                self.wake_write,
                byte.as_ptr().cast::<libc::c_void>(),
                byte.len(),
            )
        };
        if written < 0 {
            let err = io::Error::last_os_error();
            // A full pipe still wakes the waiter.
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }
}

impl Drop for KqueueBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_read);
            libc::close(self.wake_write);
            libc::close(self.kq);
        }
    }
}

/// Combines the per-filter deletion results for one descriptor: removed if
/// either filter was removed, already-gone only when both were, and any
/// genuine error wins.
fn merge_deletes(
    read: io::Result<Deregistered>,
    write: io::Result<Deregistered>,
) -> io::Result<Deregistered> {
    match (read, write) {
        (Ok(read), Ok(write)) => {
            if read == Deregistered::Removed || write == Deregistered::Removed {
                Ok(Deregistered::Removed)
            } else {
                Ok(Deregistered::AlreadyGone)
            }
        }
        (Err(err), _) | (_, Err(err)) => Err(err),
    }
}

fn syscall(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Builds the changelist a full registration would apply, for inspection in
/// tests and diagnostics.
#[allow(dead_code)]
pub(crate) fn changelist_for(fd: RawFd, mask: Interest, token: u64) -> SmallVec<[libc::kevent; 2]> {
    let mut changes = SmallVec::new();
    changes.push(change(
        fd,
        libc::EVFILT_READ,
        libc::EV_ADD | libc::EV_ENABLE,
        token,
    ));
    if mask.is_writable() {
        changes.push(change(
            fd,
            libc::EVFILT_WRITE,
            libc::EV_ADD | libc::EV_ENABLE,
            token,
        ));
    }
    changes
}
