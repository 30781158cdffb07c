//! A reference-counted admission gate with a one-way drain.
//!
//! Every operation that touches shared state first acquires a [`Ticket`]
//! from the [`LifecycleGate`]. Once [`LifecycleGate::begin_drain`] is called
//! no new tickets are handed out, and the teardown callback runs as soon as
//! the last outstanding ticket is dropped.
//!
//! ```rust
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::sync::Arc;
//!
//! let torn_down = Arc::new(AtomicBool::new(false));
//! let flag = torn_down.clone();
//! let gate = weir_gate::LifecycleGate::with_teardown(move || flag.store(true, Ordering::SeqCst));
//!
//! let ticket = gate.acquire(1).unwrap();
//! gate.begin_drain();
//! assert!(gate.acquire(2).is_err());
//! assert!(!torn_down.load(Ordering::SeqCst));
//!
//! drop(ticket);
//! assert!(torn_down.load(Ordering::SeqCst));
//! ```
#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    clippy::missing_safety_doc
)]
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use log::{debug, trace};
use parking_lot::Mutex;

mod state;

pub use state::Phase;
use state::{AcquireResult, DrainResult, ReleaseResult, State, StateCell};

const LOG: &str = "weir_gate";

/// Identifies the holder of a [`Ticket`] in diagnostics.
pub type Tag = u64;

type Teardown = Box<dyn FnOnce() + Send>;

/// Returned by [`LifecycleGate::acquire`] once draining has begun.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("resource is going away")]
pub struct Rejected {
    tag: Tag,
}

impl Rejected {
    /// The tag passed to the refused [`LifecycleGate::acquire`] call.
    pub fn tag(&self) -> Tag {
        self.tag
    }
}

/// [`LifecycleGate`] admits operations until it is told to drain.
///
/// The gate is `Send + Sync`; tickets can be acquired and released from any
/// thread.
pub struct LifecycleGate {
    inner: Arc<Inner>,
}

struct Inner {
    state: StateCell,
    teardown: Mutex<Option<Teardown>>,
    drained: Mutex<Drain>,
}

#[derive(Default)]
struct Drain {
    done: bool,
    waiters: Vec<Waker>,
}

impl std::fmt::Debug for LifecycleGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.load();
        f.debug_struct("LifecycleGate")
            .field("phase", &state.phase())
            .field("acquired", &state.acquired())
            .finish()
    }
}

impl Default for LifecycleGate {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleGate {
    /// Construct an active [`LifecycleGate`] with no teardown callback.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Construct an active [`LifecycleGate`] which runs `teardown` exactly
    /// once, when the gate is destroyed.
    ///
    /// The callback runs synchronously on the thread that drops the last
    /// [`Ticket`] (or calls [`LifecycleGate::begin_drain`] with nothing
    /// acquired). That thread must not hold locks the callback needs.
    pub fn with_teardown<F>(teardown: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(Some(Box::new(teardown)))
    }

    fn build(teardown: Option<Teardown>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: StateCell::new(),
                teardown: Mutex::new(teardown),
                drained: Mutex::new(Drain::default()),
            }),
        }
    }

    /// Acquire a [`Ticket`], failing with [`Rejected`] if the gate is no
    /// longer active.
    ///
    /// The ticket must be obtained before touching state guarded by this gate
    /// and is released when dropped.
    pub fn acquire(&self, tag: Tag) -> Result<Ticket, Rejected> {
        match self.inner.state.update(State::acquire) {
            AcquireResult::Acquired => {
                trace!(target: LOG, "acquire.ok tag={tag}");
                Ok(Ticket {
                    inner: Arc::clone(&self.inner),
                    tag,
                })
            }
            AcquireResult::Rejected => {
                trace!(target: LOG, "acquire.rejected tag={tag}");
                Err(Rejected { tag })
            }
        }
    }

    /// Release a [`Ticket`].
    ///
    /// Equivalent to dropping it; provided so call sites can spell out where
    /// the reference ends.
    pub fn release(&self, ticket: Ticket) {
        debug_assert!(Arc::ptr_eq(&self.inner, &ticket.inner));
        drop(ticket);
    }

    /// Stop admitting new tickets.
    ///
    /// Calling this more than once has no further effect. If no ticket is
    /// outstanding the gate is destroyed, and the teardown runs, before this
    /// returns.
    pub fn begin_drain(&self) {
        match self.inner.state.update(State::begin_drain) {
            DrainResult::AlreadyDraining => {}
            DrainResult::Draining => {
                debug!(
                    target: LOG,
                    "drain.begin acquired={}",
                    self.inner.state.load().acquired()
                );
            }
            DrainResult::Teardown => {
                debug!(target: LOG, "drain.begin acquired=0");
                self.inner.teardown();
            }
        }
    }

    /// Returns the current [`Phase`].
    ///
    /// This is a snapshot and may be stale by the time it is inspected.
    pub fn phase(&self) -> Phase {
        self.inner.state.load().phase()
    }

    /// Returns the number of outstanding tickets.
    pub fn acquired(&self) -> usize {
        self.inner.state.load().acquired()
    }

    /// Returns a future which resolves once the gate is destroyed and its
    /// teardown callback has returned.
    ///
    /// The future does not start the drain; pair it with
    /// [`LifecycleGate::begin_drain`].
    pub fn drained(&self) -> Drained {
        Drained {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Inner {
    fn release(&self, tag: Tag) {
        match self.state.update(State::release) {
            ReleaseResult::Released => trace!(target: LOG, "release.ok tag={tag}"),
            ReleaseResult::Teardown => {
                debug!(target: LOG, "release.last tag={tag}");
                self.teardown();
            }
        }
    }

    /// Run the teardown callback and wake everyone waiting on [`Drained`].
    ///
    /// Only the caller which observed the transition to destroyed gets here, so
    /// this runs once per gate.
    fn teardown(&self) {
        let teardown = self.teardown.lock().take();
        if let Some(teardown) = teardown {
            teardown();
        }
        debug!(target: LOG, "destroyed");

        let waiters = {
            let mut drained = self.drained.lock();
            drained.done = true;
            std::mem::take(&mut drained.waiters)
        };
        for waker in waiters {
            waker.wake();
        }
    }
}

/// An acquired reference on a [`LifecycleGate`].
///
/// Dropping the ticket releases the reference.
#[must_use = "dropping a ticket releases it immediately"]
pub struct Ticket {
    inner: Arc<Inner>,
    tag: Tag,
}

impl Ticket {
    /// The tag this ticket was acquired with.
    pub fn tag(&self) -> Tag {
        self.tag
    }
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket").field("tag", &self.tag).finish()
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.inner.release(self.tag);
    }
}

/// Future returned by [`LifecycleGate::drained`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Drained {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Drained {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Drained").finish()
    }
}

impl Future for Drained {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut drained = self.inner.drained.lock();
        if drained.done {
            return Poll::Ready(());
        }
        if !drained.waiters.iter().any(|w| w.will_wake(cx.waker())) {
            drained.waiters.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
