use core::fmt;

use crate::ShardId;

// EVENT
// ================================================================================================

/// An opaque handle naming an asynchronous completion in the underlying runtime.
///
/// Events are allocated by the runtime transport and merge associatively. The handle encodes the
/// shard whose transport instance created it in the upper bits; the sharded trace machinery uses
/// [`Event::creator_shard`] to route cross-shard event-name requests to the authoritative owner.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Event(u64);

impl Event {
    /// The event that has always triggered. Waiting on it is a no-op.
    pub const NO_EVENT: Self = Self(0);

    /// Number of low bits holding the creator-local event index.
    const INDEX_BITS: u32 = 48;
    const INDEX_MASK: u64 = (1 << Self::INDEX_BITS) - 1;

    /// Builds an event handle from its creator shard and a creator-local index.
    ///
    /// Index zero on shard zero is reserved for [`Event::NO_EVENT`]; transports must hand out
    /// indices starting at one.
    pub fn encode(creator: ShardId, index: u64) -> Self {
        debug_assert!(index <= Self::INDEX_MASK);
        Self(((creator.0 as u64) << Self::INDEX_BITS) | index)
    }

    /// Returns true for any handle other than [`Event::NO_EVENT`].
    pub fn exists(&self) -> bool {
        self.0 != 0
    }

    /// The shard whose transport created this event.
    pub fn creator_shard(&self) -> ShardId {
        ShardId((self.0 >> Self::INDEX_BITS) as u32)
    }

    /// The creator-local index of this event.
    pub fn index(&self) -> u64 {
        self.0 & Self::INDEX_MASK
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exists() {
            write!(f, "e{}:{}", self.creator_shard().0, self.index())
        } else {
            f.write_str("e-none")
        }
    }
}

// USER EVENT
// ================================================================================================

/// An event whose trigger is under the creator's control.
///
/// A user event is triggered exactly once, optionally gated on a precondition event supplied at
/// trigger time. The trace machinery wraps foreign or freshly produced events in user events it
/// owns so that every recorded slot has a local, renameable creator.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserEvent(Event);

impl UserEvent {
    pub const NO_USER_EVENT: Self = Self(Event::NO_EVENT);

    pub fn new(event: Event) -> Self {
        Self(event)
    }

    /// The plain event handle other operations can depend on.
    pub fn event(&self) -> Event {
        self.0
    }

    pub fn exists(&self) -> bool {
        self.0.exists()
    }
}

impl fmt::Display for UserEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.0)
    }
}

// BARRIER
// ================================================================================================

/// A generational, arrival-counted event.
///
/// Each generation triggers once its fixed arrival count is reached. Advancing yields the handle
/// of the next generation without disturbing earlier ones. A barrier supports only a bounded
/// number of generations (a transport property, see
/// [`crate::RuntimeTransport::max_barrier_generations`]); once the bound is reached the owner must
/// allocate a replacement and re-subscribe every observer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Barrier {
    event: Event,
    generation: u32,
    total_arrivals: u32,
}

impl Barrier {
    pub const NO_BARRIER: Self = Self {
        event: Event::NO_EVENT,
        generation: 0,
        total_arrivals: 0,
    };

    pub fn new(event: Event, total_arrivals: u32) -> Self {
        Self { event, generation: 0, total_arrivals }
    }

    /// The event handle of the current generation.
    pub fn event(&self) -> Event {
        self.event
    }

    /// The base handle identifying the barrier across generations.
    pub fn base(&self) -> Event {
        Event::encode(self.event.creator_shard(), self.event.index() - self.generation as u64)
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn total_arrivals(&self) -> u32 {
        self.total_arrivals
    }

    pub fn exists(&self) -> bool {
        self.event.exists()
    }

    /// Returns the handle of the next generation, or `None` when `limit` generations have been
    /// exhausted and the barrier must be refreshed.
    pub fn advanced(&self, limit: u32) -> Option<Self> {
        if self.generation + 1 >= limit {
            return None;
        }
        Some(Self {
            event: Event::encode(self.event.creator_shard(), self.event.index() + 1),
            generation: self.generation + 1,
            total_arrivals: self.total_arrivals,
        })
    }
}

impl fmt::Display for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exists() {
            write!(f, "b{}@{}", self.event, self.generation)
        } else {
            f.write_str("b-none")
        }
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_encoding_round_trips() {
        let e = Event::encode(ShardId(5), 42);
        assert!(e.exists());
        assert_eq!(e.creator_shard(), ShardId(5));
        assert_eq!(e.index(), 42);
    }

    #[test]
    fn no_event_does_not_exist() {
        assert!(!Event::NO_EVENT.exists());
        assert_eq!(Event::default(), Event::NO_EVENT);
    }

    #[test]
    fn barrier_advance_respects_generation_limit() {
        let bar = Barrier::new(Event::encode(ShardId(1), 10), 2);
        let next = bar.advanced(4).unwrap();
        assert_eq!(next.generation(), 1);
        assert_eq!(next.total_arrivals(), 2);
        assert_eq!(next.base(), bar.event());

        let mut current = bar;
        for _ in 0..3 {
            current = current.advanced(4).unwrap();
        }
        assert!(current.advanced(4).is_none());
    }
}
