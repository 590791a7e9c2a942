//! Readiness notifications and raw native records.
//!
//! Two shapes live here:
//!
//! - [`NativeEvent`] is what a backend produces straight from the kernel:
//!   independent readiness/error/hangup bits plus a numeric residue for any
//!   platform-reserved flag the decoder does not recognize. Decoding is total
//!   and lossless; nothing is silently dropped.
//! - [`Event`] is the caller-facing notification a reactor builds from a
//!   `NativeEvent` after validating the handler token and intersecting fired
//!   readiness with the registered interest mask.
//!
//! Both are ephemeral values produced inside a single wait call.

use crate::handler::HandlerToken;
use crate::interest::Interest;

/// One readiness notification for a registered handler.
///
/// Error and hangup are independent flags: a composite native record with
/// both bits set decodes to a notification with both set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Token identifying the registered handler.
    pub token: HandlerToken,
    /// Fired subset of the registered interest mask.
    pub readiness: Interest,
    /// True if the kernel reported an error condition.
    pub error: bool,
    /// True if the peer hung up.
    pub hangup: bool,
}

impl Event {
    /// Creates a new event.
    #[must_use]
    pub const fn new(token: HandlerToken, readiness: Interest, error: bool, hangup: bool) -> Self {
        Self {
            token,
            readiness,
            error,
            hangup,
        }
    }

    /// Returns true if read readiness fired.
    #[must_use]
    pub const fn is_readable(&self) -> bool {
        self.readiness.is_readable()
    }

    /// Returns true if write readiness fired.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.readiness.is_writable()
    }
}

/// Raw readiness record decoded from one native kernel event.
///
/// The backend stamps the registration token it handed to the kernel and
/// decodes every native flag with independent bit tests. Flags outside the
/// decoder's mapping table land in `residue` instead of being dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NativeEvent {
    /// Registration token as stored in the kernel record.
    pub token: u64,
    /// Read-ready bit fired.
    pub readable: bool,
    /// Write-ready bit fired.
    pub writable: bool,
    /// Error indicator fired.
    pub error: bool,
    /// Hangup indicator fired.
    pub hangup: bool,
    /// Unrecognized native flag bits, surfaced verbatim.
    pub residue: u32,
}

impl NativeEvent {
    /// Creates a record carrying only the token, with no flags set.
    #[must_use]
    pub const fn for_token(token: u64) -> Self {
        Self {
            token,
            readable: false,
            writable: false,
            error: false,
            hangup: false,
            residue: 0,
        }
    }

    /// Returns the fired readiness bits as an interest mask.
    #[must_use]
    pub fn readiness(&self) -> Interest {
        let mut fired = Interest::NONE;
        if self.readable {
            fired |= Interest::READABLE;
        }
        if self.writable {
            fired |= Interest::WRITABLE;
        }
        fired
    }
}

/// Reusable buffer for events returned by a wait call.
///
/// Capacity bounds the number of events one wait call can return; a
/// descriptor that stays ready is reported again on the next call, so capped
/// batches lose nothing.
#[derive(Debug)]
pub struct Events {
    inner: Vec<Event>,
    capacity: usize,
}

impl Events {
    /// Creates a buffer holding at most `capacity` events per wait call.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Clears the buffer, keeping capacity.
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Number of events currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if no events are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Maximum events per wait call.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterates over buffered events.
    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.inner.iter()
    }

    /// Pushes an event; events beyond capacity are dropped.
    pub(crate) fn push(&mut self, event: Event) {
        if self.inner.len() < self.capacity {
            self.inner.push(event);
        }
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl IntoIterator for Events {
    type Item = Event;
    type IntoIter = std::vec::IntoIter<Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(raw: u64) -> HandlerToken {
        HandlerToken::from_u64(raw)
    }

    #[test]
    fn event_flags() {
        let event = Event::new(token(1), Interest::both(), false, false);
        assert!(event.is_readable());
        assert!(event.is_writable());
        assert!(!event.error);
        assert!(!event.hangup);
    }

    #[test]
    fn error_and_hangup_coexist() {
        let event = Event::new(token(2), Interest::NONE, true, true);
        assert!(event.error);
        assert!(event.hangup);
    }

    #[test]
    fn native_readiness_mask() {
        let mut native = NativeEvent::for_token(7);
        assert!(native.readiness().is_empty());
        native.readable = true;
        assert_eq!(native.readiness(), Interest::READABLE);
        native.writable = true;
        assert_eq!(native.readiness(), Interest::both());
    }

    #[test]
    fn events_capacity_cap() {
        let mut events = Events::with_capacity(2);
        for i in 0..4 {
            events.push(Event::new(token(i), Interest::READABLE, false, false));
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events.capacity(), 2);
    }

    #[test]
    fn events_clear_keeps_capacity() {
        let mut events = Events::with_capacity(8);
        events.push(Event::new(token(0), Interest::READABLE, false, false));
        assert!(!events.is_empty());
        events.clear();
        assert!(events.is_empty());
        assert_eq!(events.capacity(), 8);
    }

    #[test]
    fn events_iteration() {
        let mut events = Events::with_capacity(4);
        events.push(Event::new(token(1), Interest::READABLE, false, false));
        events.push(Event::new(token(2), Interest::WRITABLE, false, false));

        let tokens: Vec<u64> = events.iter().map(|e| e.token.to_u64()).collect();
        assert_eq!(tokens, vec![1, 2]);

        let owned: Vec<Event> = events.into_iter().collect();
        assert_eq!(owned.len(), 2);
    }
}
