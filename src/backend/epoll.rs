//! Linux epoll backend.
//!
//! One epoll instance per backend. Interest mutations are expressed as
//! `epoll_ctl` calls carrying the complete desired event set; error and
//! hangup notification (`EPOLLERR | EPOLLHUP`) is part of every
//! registration and is not caller-controlled. Events are used without
//! `EPOLLET`, so the kernel itself provides the level-triggered semantics
//! this core presents.
//!
//! Waking a parked `epoll_wait` uses an eventfd registered under a reserved
//! token; the backend drains and swallows its own wake events before
//! handing records upward.

use super::{Backend, Deregistered, WAKE_TOKEN};
use crate::diagnostics::describe_epoll;
use crate::event::NativeEvent;
use crate::interest::Interest;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;
use tracing::{debug, trace};

/// Epoll-based backend for Linux.
#[derive(Debug)]
pub struct EpollBackend {
    epfd: RawFd,
    wakefd: RawFd,
}

/// Flag bits the decoder recognizes; everything else is residue.
const DECODED: u32 = (libc::EPOLLIN
    | libc::EPOLLOUT
    | libc::EPOLLERR
    | libc::EPOLLHUP
    | libc::EPOLLRDHUP) as u32;

/// Decodes one epoll event word with independent bit tests.
///
/// Every set flag maps to an output attribute: read/write readiness, the
/// error/hangup indicators (which may fire together), or the numeric
/// residue for platform-reserved bits.
pub(crate) fn decode(token: u64, events: u32) -> NativeEvent {
    let mut native = NativeEvent::for_token(token);
    native.readable = events & libc::EPOLLIN as u32 != 0;
    native.writable = events & libc::EPOLLOUT as u32 != 0;
    native.error = events & libc::EPOLLERR as u32 != 0;
    native.hangup = events & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0;
    native.residue = events & !DECODED;
    native
}

/// Builds the native event set for an interest mask.
fn native_interest(mask: Interest) -> u32 {
    let mut events = (libc::EPOLLERR | libc::EPOLLHUP) as u32;
    if mask.is_readable() {
        events |= libc::EPOLLIN as u32;
    }
    if mask.is_writable() {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(duration) => {
            let millis = duration.as_millis();
            if millis == 0 && duration.as_nanos() > 0 {
                // Round sub-millisecond timeouts up so they still park.
                1
            } else {
                libc::c_int::try_from(millis).unwrap_or(libc::c_int::MAX)
            }
        }
    }
}

impl EpollBackend {
    /// Creates the epoll instance and its wake eventfd.
    pub fn new() -> io::Result<Self> {
        let epfd = syscall(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        let wakefd = match syscall(unsafe {
            libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK)
        }) {
            Ok(fd) => fd,
            Err(err) => {
                unsafe { libc::close(epfd) };
                return Err(err);
            }
        };

        let backend = Self { epfd, wakefd };
        if let Err(err) = backend.ctl(libc::EPOLL_CTL_ADD, wakefd, libc::EPOLLIN as u32, WAKE_TOKEN)
        {
            return Err(err);
        }
        debug!(epfd, wakefd, "epoll backend created");
        Ok(backend)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: token,
        };
        syscall(unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) })?;
        Ok(())
    }

    fn drain_wake(&self) {
        let mut buf = [0u8; 8];
        // Nonblocking read; EAGAIN just means the counter is already clear.
        unsafe {
            libc::read(self.wakefd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len());
        }
    }
}

impl Backend for EpollBackend {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn register(&self, fd: RawFd, mask: Interest, token: u64) -> io::Result<()> {
        let events = native_interest(mask);
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, token)?;
        trace!(fd, mask = %mask, "epoll registered");
        Ok(())
    }

    fn reregister(&self, fd: RawFd, mask: Interest, token: u64) -> io::Result<()> {
        let events = native_interest(mask);
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, token)?;
        trace!(fd, mask = %mask, "epoll re-registered");
        Ok(())
    }

    fn deregister(&self, fd: RawFd, _mask: Interest) -> io::Result<Deregistered> {
        match self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0) {
            Ok(()) => {
                trace!(fd, "epoll deregistered");
                Ok(Deregistered::Removed)
            }
            // The kernel already dropped the registration: the peer closed
            // the socket, or a prior close removed it implicitly.
            Err(err)
                if err.raw_os_error() == Some(libc::ENOENT)
                    || err.raw_os_error() == Some(libc::EBADF) =>
            {
                debug!(fd, "epoll registration already gone");
                Ok(Deregistered::AlreadyGone)
            }
            Err(err) => Err(err),
        }
    }

    fn wait(
        &self,
        sink: &mut Vec<NativeEvent>,
        max_events: usize,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        sink.clear();
        let max = max_events.max(1);
        let mut buf: Vec<libc::epoll_event> = Vec::with_capacity(max);

        let count = unsafe {
            libc::epoll_wait(
                self.epfd,
                buf.as_mut_ptr(),
                libc::c_int::try_from(max).unwrap_or(libc::c_int::MAX),
                timeout_millis(timeout),
            )
        };
        let count = match syscall(count) {
            Ok(n) => n as usize,
            // Interrupted waits surface as an empty batch; each call is
            // independent, so the loop simply waits again.
            Err(err) if err.kind() == io::ErrorKind::Interrupted => 0,
            Err(err) => return Err(err),
        };
        // SAFETY: epoll_wait initialized the first `count` entries.
        unsafe { buf.set_len(count) };

        for raw in &buf {
            // epoll_event is packed on some targets; copy the fields out
            // before anything takes a reference to them.
            let token = raw.u64;
            let events = raw.events;
            if token == WAKE_TOKEN {
                self.drain_wake();
                continue;
            }
            trace!(token, flags = %describe_epoll(events), "epoll event");
            sink.push(decode(token, events));
        }
        Ok(sink.len())
    }

    fn wake(&self) -> io::Result<()> {
        let one: u64 = 1;
        let written = unsafe {
            libc::write(
                self.wakefd,
                std::ptr::addr_of!(one).cast::<libc::c_void>(),
                std::mem::size_of::<u64>(),
            )
        };
        if written < 0 {
            let err = io::Error::last_os_error();
            // A full eventfd counter still wakes the waiter.
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wakefd);
            libc::close(self.epfd);
        }
    }
}

fn syscall(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}
