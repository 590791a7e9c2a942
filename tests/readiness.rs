//! End-to-end readiness multiplexing properties.
//!
//! Registration algebra, delivery filtering, and failure semantics are
//! exercised against the deterministic lab backend; a smoke section at the
//! bottom drives the real native backend over a socketpair.

mod common;

use evmux::backend::{Backend, Deregistered, LabBackend};
use evmux::{
    Event, EventCallback, Events, Interest, InterestChange, MuxError, Reactor,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn lab_reactor() -> (Arc<LabBackend>, Reactor) {
    common::init_tracing();
    let lab = Arc::new(LabBackend::new());
    let reactor = Reactor::new(Arc::clone(&lab) as Arc<dyn Backend>, 64);
    (lab, reactor)
}

fn noop() -> Arc<dyn EventCallback> {
    Arc::new(|_: Interest, _: bool, _: bool| {})
}

/// Collects dispatched notifications for assertion.
struct Recorder {
    seen: Mutex<Vec<(Interest, bool, bool)>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }

    fn take(&self) -> Vec<(Interest, bool, bool)> {
        std::mem::take(&mut *self.seen.lock())
    }
}

impl EventCallback for Recorder {
    fn on_event(&self, readiness: Interest, error: bool, hangup: bool) {
        self.seen.lock().push((readiness, error, hangup));
    }
}

#[derive(Clone, Copy)]
enum Step {
    Add(Interest),
    Remove(Interest),
}

/// The kernel-held mask always equals the bit-algebra replay of the call
/// sequence, however redundant the sequence is.
#[test]
fn mask_replay_equivalence() {
    let sequences: &[&[Step]] = &[
        &[Step::Add(Interest::READABLE), Step::Add(Interest::READABLE)],
        &[
            Step::Add(Interest::READABLE),
            Step::Add(Interest::WRITABLE),
            Step::Remove(Interest::READABLE),
            Step::Add(Interest::READABLE),
        ],
        &[
            Step::Add(Interest::both()),
            Step::Remove(Interest::WRITABLE),
            Step::Remove(Interest::WRITABLE),
        ],
        &[
            Step::Add(Interest::WRITABLE),
            Step::Remove(Interest::READABLE),
            Step::Add(Interest::READABLE),
            Step::Add(Interest::WRITABLE),
        ],
    ];

    for (n, steps) in sequences.iter().enumerate() {
        let (lab, reactor) = lab_reactor();
        let token = reactor
            .register(3, Interest::READABLE, noop())
            .expect("register");
        let mut expected = Interest::READABLE;

        for step in *steps {
            match *step {
                Step::Add(mode) => {
                    expected = expected.add(mode);
                    reactor.add_interest(token, mode).expect("add");
                }
                Step::Remove(mode) => {
                    expected = expected.remove(mode);
                    reactor.remove_interest(token, mode).expect("remove");
                }
            }
            if expected.is_empty() {
                break; // descriptor deregistered; sequence ends here
            }
            assert_eq!(lab.subscription(3), Some(expected), "sequence {n}");
            assert_eq!(reactor.mask(token), Some(expected), "sequence {n}");
        }
    }
}

#[test]
fn redundant_add_equals_single_add() {
    let (lab_a, reactor_a) = lab_reactor();
    let token_a = reactor_a.register(3, Interest::NONE, noop()).expect("register");
    reactor_a.add_interest(token_a, Interest::READABLE).expect("add");

    let (lab_b, reactor_b) = lab_reactor();
    let token_b = reactor_b.register(3, Interest::NONE, noop()).expect("register");
    reactor_b.add_interest(token_b, Interest::READABLE).expect("add");
    reactor_b.add_interest(token_b, Interest::READABLE).expect("redundant add");

    assert_eq!(lab_a.subscription(3), lab_b.subscription(3));
    assert_eq!(lab_a.subscription(3), Some(Interest::READABLE));
}

#[test]
fn noop_removal_leaves_everything_unchanged() {
    let (lab, reactor) = lab_reactor();
    let token = reactor
        .register(3, Interest::READABLE, noop())
        .expect("register");

    let change = reactor
        .remove_interest(token, Interest::WRITABLE)
        .expect("reports success");
    assert_eq!(change, InterestChange::Updated);
    assert_eq!(lab.subscription(3), Some(Interest::READABLE));
    assert_eq!(reactor.mask(token), Some(Interest::READABLE));
    assert_eq!(reactor.handler_count(), 1);
}

#[test]
fn already_gone_removal_is_success_and_entry_is_dropped() {
    let (lab, reactor) = lab_reactor();
    let token = reactor
        .register(3, Interest::READABLE, noop())
        .expect("register");

    lab.forget(3); // peer tore the socket down first
    let change = reactor
        .remove_interest(token, Interest::READABLE)
        .expect("already-gone is not a fault");
    assert_eq!(change, InterestChange::AlreadyGone);
    assert_eq!(reactor.handler_count(), 0);
    assert!(matches!(
        reactor.add_interest(token, Interest::READABLE),
        Err(MuxError::HandlerGone)
    ));
}

#[test]
fn partial_registration_failure_leaves_no_residual_subscription() {
    let (lab, reactor) = lab_reactor();
    lab.fail_next_write_sub_registration();

    let err = reactor
        .register(5, Interest::both(), noop())
        .expect_err("second sub-registration fails");
    assert!(matches!(err, MuxError::RegistrationFailed { fd: 5, .. }));
    assert_eq!(lab.subscription(5), None);
    assert_eq!(reactor.handler_count(), 0);

    // Nothing may ever be reported for the descriptor.
    lab.inject_readable(5);
    let mut events = Events::with_capacity(8);
    assert_eq!(reactor.wait(&mut events, None).expect("wait"), 0);
}

#[test]
fn registered_mask_round_trips_through_delivery() {
    for mask in [Interest::READABLE, Interest::WRITABLE, Interest::both()] {
        let (lab, reactor) = lab_reactor();
        let token = reactor.register(3, mask, noop()).expect("register");

        lab.inject(3, |event| {
            event.readable = true;
            event.writable = true;
        });
        let mut events = Events::with_capacity(8);
        reactor.wait(&mut events, None).expect("wait");
        let fired: Vec<&Event> = events.iter().collect();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].token, token);
        // Full readiness intersected with the registered mask gives the
        // mask back exactly.
        assert_eq!(fired[0].readiness, mask);
    }
}

#[test]
fn empty_mask_then_add_read_delivers_one_read_notification() {
    let (lab, reactor) = lab_reactor();
    let token = reactor.register(3, Interest::NONE, noop()).expect("register");
    reactor.add_interest(token, Interest::READABLE).expect("add");

    lab.inject_readable(3);
    let mut events = Events::with_capacity(8);
    let count = reactor.wait(&mut events, None).expect("wait");
    assert_eq!(count, 1);
    let event = events.iter().next().expect("one event");
    assert_eq!(event.readiness, Interest::READABLE);
    assert!(!event.error);
    assert!(!event.hangup);
}

#[test]
fn write_ready_after_write_interest_removed_is_not_delivered() {
    let (lab, reactor) = lab_reactor();
    let token = reactor.register(3, Interest::NONE, noop()).expect("register");
    reactor.add_interest(token, Interest::both()).expect("add");
    reactor
        .remove_interest(token, Interest::WRITABLE)
        .expect("remove");
    assert_eq!(reactor.mask(token), Some(Interest::READABLE));

    // A write-ready record queued before the reduction took effect.
    lab.inject(3, |event| event.writable = true);
    let mut events = Events::with_capacity(8);
    assert_eq!(reactor.wait(&mut events, None).expect("wait"), 0);
}

#[test]
fn composite_error_and_hangup_arrive_together() {
    let (lab, reactor) = lab_reactor();
    reactor.register(3, Interest::READABLE, noop()).expect("register");

    lab.inject(3, |event| {
        event.error = true;
        event.hangup = true;
    });
    let mut events = Events::with_capacity(8);
    assert_eq!(reactor.wait(&mut events, None).expect("wait"), 1);
    let event = events.iter().next().expect("one event");
    assert!(event.error, "error flag must survive alongside hangup");
    assert!(event.hangup, "hangup flag must survive alongside error");
}

#[test]
fn zero_timeout_on_empty_table_returns_immediately() {
    let (_lab, reactor) = lab_reactor();
    let mut events = Events::with_capacity(8);
    let count = reactor
        .wait(&mut events, Some(Duration::ZERO))
        .expect("wait");
    assert_eq!(count, 0);
    assert_eq!(events.len(), 0);
}

#[test]
fn dispatch_routes_each_notification_to_its_own_callback() {
    let lab = Arc::new(LabBackend::new());
    let reactor = Reactor::new(Arc::clone(&lab) as Arc<dyn Backend>, 64);

    let first = Recorder::new();
    let second = Recorder::new();
    reactor
        .register(3, Interest::READABLE, Arc::clone(&first) as Arc<dyn EventCallback>)
        .expect("register");
    reactor
        .register(4, Interest::WRITABLE, Arc::clone(&second) as Arc<dyn EventCallback>)
        .expect("register");

    lab.inject_readable(3);
    lab.inject_writable(4);
    let dispatched = reactor.wait_and_dispatch(None).expect("dispatch");
    assert_eq!(dispatched, 2);
    assert_eq!(first.take(), vec![(Interest::READABLE, false, false)]);
    assert_eq!(second.take(), vec![(Interest::WRITABLE, false, false)]);
}

#[test]
fn hangup_reaches_callback_even_with_empty_mask() {
    let lab = Arc::new(LabBackend::new());
    let reactor = Reactor::new(Arc::clone(&lab) as Arc<dyn Backend>, 64);
    let recorder = Recorder::new();
    reactor
        .register(3, Interest::NONE, Arc::clone(&recorder) as Arc<dyn EventCallback>)
        .expect("register");

    lab.inject_hangup(3);
    reactor.wait_and_dispatch(None).expect("dispatch");
    assert_eq!(recorder.take(), vec![(Interest::NONE, false, true)]);
}

#[test]
fn explicit_deregistration_tolerates_kernel_forgetting_first() {
    let (lab, reactor) = lab_reactor();
    let token = reactor
        .register(3, Interest::READABLE, noop())
        .expect("register");

    lab.forget(3);
    let outcome = reactor.deregister(token).expect("success");
    assert_eq!(outcome, Deregistered::AlreadyGone);
    assert_eq!(reactor.handler_count(), 0);
}

// --- native backend smoke --------------------------------------------------

#[cfg(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod native {
    use super::{noop, Recorder};
    use evmux::{EventCallback, Events, Interest, Reactor};
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn socketpair_read_readiness_end_to_end() {
        let (mut peer, local) = UnixStream::pair().expect("socketpair");
        let reactor = Reactor::native(64).expect("native reactor");
        let recorder = Recorder::new();
        let token = reactor
            .register(
                local.as_raw_fd(),
                Interest::READABLE,
                Arc::clone(&recorder) as Arc<dyn EventCallback>,
            )
            .expect("register");

        peer.write_all(b"ping").expect("write");
        let mut events = Events::with_capacity(8);
        let count = reactor
            .wait(&mut events, Some(Duration::from_secs(5)))
            .expect("wait");
        assert_eq!(count, 1);
        let event = events.iter().next().expect("one event");
        assert_eq!(event.token, token);
        assert!(event.is_readable());

        // Level-triggered: the unread payload is reported again.
        let again = reactor
            .wait(&mut events, Some(Duration::from_secs(5)))
            .expect("second wait");
        assert_eq!(again, 1);

        reactor.deregister(token).expect("deregister");
    }

    #[test]
    fn timeout_expiry_is_an_empty_batch() {
        let (_peer, local) = UnixStream::pair().expect("socketpair");
        let reactor = Reactor::native(64).expect("native reactor");
        reactor
            .register(local.as_raw_fd(), Interest::READABLE, noop())
            .expect("register");

        let start = Instant::now();
        let mut events = Events::with_capacity(8);
        let count = reactor
            .wait(&mut events, Some(Duration::from_millis(50)))
            .expect("wait");
        assert_eq!(count, 0);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn peer_drop_surfaces_hangup() {
        let (peer, local) = UnixStream::pair().expect("socketpair");
        let reactor = Reactor::native(64).expect("native reactor");
        let recorder = Recorder::new();
        reactor
            .register(
                local.as_raw_fd(),
                Interest::READABLE,
                Arc::clone(&recorder) as Arc<dyn EventCallback>,
            )
            .expect("register");

        drop(peer);
        let dispatched = reactor
            .wait_and_dispatch(Some(Duration::from_secs(5)))
            .expect("dispatch");
        assert_eq!(dispatched, 1);
        let seen = recorder.take();
        assert_eq!(seen.len(), 1);
        // Either a hangup flag or read readiness (EOF is readable); the
        // common case reports both.
        let (readiness, _error, hangup) = seen[0];
        assert!(hangup || readiness.is_readable());
    }
}
