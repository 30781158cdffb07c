//! Gate state transitions.

use std::sync::atomic::{AtomicUsize, Ordering};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    struct Flags: usize {
        /// New acquisitions are refused.
        const DRAINING  = 1<<0;
        /// The acquired count reached zero while draining. Implies `DRAINING`.
        const DESTROYED = 1<<1;
    }
}

const FLAG_BITS: u32 = 2;
const FLAG_MASK: usize = (1 << FLAG_BITS) - 1;
const MAX_ACQUIRED: usize = usize::MAX >> FLAG_BITS;

/// [`StateCell`] packs the gate flags and the acquired count into a single
/// atomic word so that every transition is one compare-exchange.
pub(crate) struct StateCell {
    state: AtomicUsize,
}

impl StateCell {
    /// Build a new [`StateCell`] in the active phase with nothing acquired.
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
        }
    }

    /// Update the state in this [`StateCell`].
    ///
    /// `f` is applied to a copy of the current state and the result is
    /// published with a compare-exchange. If another thread won the race, `f`
    /// runs again against the fresh value, so it must not have side effects
    /// outside of the [`State`] it is handed.
    #[inline]
    pub(crate) fn update<U>(&self, mut f: impl FnMut(&mut State) -> U) -> U {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let mut next = State::unpack(current);
            let res = f(&mut next);
            match self.state.compare_exchange_weak(
                current,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return res,
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns a snapshot of the state.
    #[inline]
    pub(crate) fn load(&self) -> State {
        State::unpack(self.state.load(Ordering::Acquire))
    }
}

/// The lifecycle phase of a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Acquisitions are admitted.
    Active,
    /// Acquisitions are refused; in-flight tickets are still outstanding.
    Draining,
    /// The last ticket was released after draining began.
    Destroyed,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct State {
    flags: Flags,
    acquired: usize,
}

impl State {
    fn unpack(word: usize) -> Self {
        Self {
            flags: Flags::from_bits_truncate(word & FLAG_MASK),
            acquired: word >> FLAG_BITS,
        }
    }

    fn pack(self) -> usize {
        debug_assert!(self.acquired <= MAX_ACQUIRED);
        (self.acquired << FLAG_BITS) | self.flags.bits()
    }

    pub(crate) fn phase(&self) -> Phase {
        if self.flags.contains(Flags::DESTROYED) {
            Phase::Destroyed
        } else if self.flags.contains(Flags::DRAINING) {
            Phase::Draining
        } else {
            Phase::Active
        }
    }

    pub(crate) fn acquired(&self) -> usize {
        self.acquired
    }

    /// Take one reference if the gate is still active.
    #[inline]
    pub(crate) fn acquire(&mut self) -> AcquireResult {
        if self.flags.contains(Flags::DRAINING) {
            return AcquireResult::Rejected;
        }
        assert!(self.acquired < MAX_ACQUIRED, "gate acquire count overflow");
        self.acquired += 1;
        AcquireResult::Acquired
    }

    /// Drop one reference.
    ///
    /// Returns whether this release finished the drain and must run the teardown.
    #[inline]
    pub(crate) fn release(&mut self) -> ReleaseResult {
        assert!(self.acquired > 0);
        assert!(!self.flags.contains(Flags::DESTROYED));
        self.acquired -= 1;
        if self.acquired == 0 && self.flags.contains(Flags::DRAINING) {
            self.flags.insert(Flags::DESTROYED);
            return ReleaseResult::Teardown;
        }
        ReleaseResult::Released
    }

    /// Stop admitting new acquisitions.
    ///
    /// If nothing is acquired the gate is destroyed immediately, since no
    /// later release would be around to do it.
    #[inline]
    pub(crate) fn begin_drain(&mut self) -> DrainResult {
        if self.flags.contains(Flags::DRAINING) {
            return DrainResult::AlreadyDraining;
        }
        self.flags.insert(Flags::DRAINING);
        if self.acquired == 0 {
            self.flags.insert(Flags::DESTROYED);
            return DrainResult::Teardown;
        }
        DrainResult::Draining
    }
}

#[must_use = "this `AcquireResult` must be handled"]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum AcquireResult {
    Acquired,
    Rejected,
}

#[must_use = "this `ReleaseResult` may be a `Teardown` variant, which must be handled"]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ReleaseResult {
    Released,
    Teardown,
}

#[must_use = "this `DrainResult` may be a `Teardown` variant, which must be handled"]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum DrainResult {
    AlreadyDraining,
    Draining,
    Teardown,
}
