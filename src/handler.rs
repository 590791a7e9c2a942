//! Handler registration records and their validated tokens.
//!
//! A handler is one socket's subscription: descriptor, current interest
//! mask, and the caller-supplied callback that readiness notifications are
//! routed to. The reactor owns only the table entry, never the socket; the
//! collaborator that opened the socket owns its lifetime and must deregister
//! before closing.
//!
//! # Token design
//!
//! [`HandlerToken`] is a slab index plus a generation counter packed into a
//! `u64` (the width of `epoll_event.data.u64` and kqueue's `udata`). The
//! generation catches stale tokens: when a slot is freed and reused, tokens
//! minted for the old occupant no longer match and every operation carrying
//! one is rejected instead of touching the wrong handler. This replaces a
//! raw back-pointer association, which a handler outliving its reactor could
//! otherwise dereference after free.

use crate::interest::Interest;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Callback invoked for each readiness notification delivered to a handler.
///
/// Implementations are the RPC/transport layer's connection objects. They
/// receive the fired subset of the registered mask together with the
/// error/hangup flags and decide connection-level remediation themselves.
pub trait EventCallback: Send + Sync {
    /// Called once per readiness notification.
    fn on_event(&self, readiness: Interest, error: bool, hangup: bool);
}

impl<F> EventCallback for F
where
    F: Fn(Interest, bool, bool) + Send + Sync,
{
    fn on_event(&self, readiness: Interest, error: bool, hangup: bool) {
        self(readiness, error, hangup);
    }
}

/// Generation-validated identifier for a registered handler.
///
/// Tokens encode a slab index (low 32 bits) and a generation (high 32 bits).
/// A reactor only honors tokens whose generation matches the current slot
/// occupant.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct HandlerToken {
    index: u32,
    generation: u32,
}

impl HandlerToken {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Returns the slab index portion.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Returns the generation portion.
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Packs the token into a `u64` for kernel registration data.
    #[must_use]
    pub const fn to_u64(self) -> u64 {
        ((self.generation as u64) << 32) | (self.index as u64)
    }

    /// Unpacks a token from kernel registration data.
    #[must_use]
    pub const fn from_u64(val: u64) -> Self {
        Self {
            index: val as u32,
            generation: (val >> 32) as u32,
        }
    }
}

/// One registration table entry.
pub(crate) struct HandlerEntry {
    pub(crate) fd: RawFd,
    pub(crate) mask: Interest,
    pub(crate) callback: Arc<dyn EventCallback>,
}

enum Slot {
    Occupied {
        entry: HandlerEntry,
        generation: u32,
    },
    Vacant {
        next_free: u32,
        generation: u32,
    },
}

impl Slot {
    fn generation(&self) -> u32 {
        match self {
            Self::Occupied { generation, .. } | Self::Vacant { generation, .. } => *generation,
        }
    }
}

/// Sentinel marking the end of the free list.
const FREE_END: u32 = u32::MAX;

/// Slab of handler entries with free-list reuse and generation validation.
///
/// Lookup, insert, and remove are O(1). Freed slots bump their generation so
/// stale tokens never resolve.
pub(crate) struct HandlerTable {
    slots: Vec<Slot>,
    free_head: u32,
    len: usize,
}

impl HandlerTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: FREE_END,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn insert(&mut self, entry: HandlerEntry) -> HandlerToken {
        self.len += 1;
        if self.free_head == FREE_END {
            let index = u32::try_from(self.slots.len()).expect("handler table exceeds u32 slots");
            self.slots.push(Slot::Occupied {
                entry,
                generation: 0,
            });
            return HandlerToken::new(index, 0);
        }

        let index = self.free_head;
        let slot = &mut self.slots[index as usize];
        let generation = slot.generation();
        let Slot::Vacant { next_free, .. } = *slot else {
            unreachable!("free list head points at occupied slot");
        };
        self.free_head = next_free;
        *slot = Slot::Occupied { entry, generation };
        HandlerToken::new(index, generation)
    }

    pub(crate) fn get(&self, token: HandlerToken) -> Option<&HandlerEntry> {
        match self.slots.get(token.index() as usize) {
            Some(Slot::Occupied { entry, generation }) if *generation == token.generation() => {
                Some(entry)
            }
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, token: HandlerToken) -> Option<&mut HandlerEntry> {
        match self.slots.get_mut(token.index() as usize) {
            Some(Slot::Occupied { entry, generation }) if *generation == token.generation() => {
                Some(entry)
            }
            _ => None,
        }
    }

    /// Removes the entry for `token`. Stale or unknown tokens return `None`.
    pub(crate) fn remove(&mut self, token: HandlerToken) -> Option<HandlerEntry> {
        let index = token.index() as usize;
        match self.slots.get(index) {
            Some(Slot::Occupied { generation, .. }) if *generation == token.generation() => {}
            _ => return None,
        }

        // Bump the generation so outstanding tokens for this slot go stale.
        let next_generation = token.generation().wrapping_add(1);
        let replacement = Slot::Vacant {
            next_free: self.free_head,
            generation: next_generation,
        };
        let Slot::Occupied { entry, .. } = std::mem::replace(&mut self.slots[index], replacement)
        else {
            unreachable!("occupancy checked above");
        };
        self.free_head = token.index();
        self.len -= 1;
        Some(entry)
    }

    /// Drains every occupied entry, returning (token, entry) pairs.
    pub(crate) fn drain(&mut self) -> Vec<(HandlerToken, HandlerEntry)> {
        let mut drained = Vec::with_capacity(self.len);
        let tokens: Vec<HandlerToken> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, .. } => Some(HandlerToken::new(
                    u32::try_from(index).expect("indexed within u32 slots"),
                    *generation,
                )),
                Slot::Vacant { .. } => None,
            })
            .collect();
        for token in tokens {
            if let Some(entry) = self.remove(token) {
                drained.push((token, entry));
            }
        }
        drained
    }
}
