//! A FIFO queue of in-flight entries which a third party may cancel at any
//! time.
//!
//! The queue resolves the race between normal servicing and cancellation
//! with a single lock: an entry is handed out by exactly one of
//! [`CancelSafeQueue::remove_next`] (or one of its variants) and
//! [`CancelSafeQueue::cancel`], never both.
//!
//! # Components
//! - [`CancelSafeQueue`]: the queue itself.
//! - [`Entry`]: implemented by queued values; supplies the identity and the
//!   default cancellation behaviour.
#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    clippy::missing_safety_doc
)]
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;

use log::trace;
use parking_lot::Mutex;

const LOG: &str = "weir_queue";

/// A value which can be stored in a [`CancelSafeQueue`].
pub trait Entry {
    /// Stable identity used by [`CancelSafeQueue::cancel`].
    type Id: Copy + Eq + Hash + fmt::Debug;

    /// Returns the identity of this entry.
    fn id(&self) -> Self::Id;

    /// Returns true if cancellation was requested while the entry was not
    /// queued.
    ///
    /// Such entries are handed to the cancel hook by
    /// [`CancelSafeQueue::insert`] instead of being queued.
    fn cancel_requested(&self) -> bool {
        false
    }

    /// Default cancel hook, run when a queue without a custom hook gives up
    /// an entry to cancellation.
    fn cancelled(self);
}

/// Hook invoked with an entry removed by cancellation.
pub type CancelHook<T> = Box<dyn Fn(T) + Send + Sync>;

/// [`CancelSafeQueue`] is a thread-safe FIFO of entries.
///
/// Entries are held in an arena keyed by [`Entry::Id`]; the order list holds
/// identities only. Both are updated in the same critical section, so every
/// queued identity appears in the order list exactly once.
///
/// ```rust
/// use weir_queue::{CancelSafeQueue, Entry};
///
/// struct Job(u32);
///
/// impl Entry for Job {
///     type Id = u32;
///     fn id(&self) -> u32 { self.0 }
///     fn cancelled(self) {}
/// }
///
/// let queue = CancelSafeQueue::new();
/// queue.insert(Job(1));
/// queue.insert(Job(2));
/// assert!(queue.cancel(1));
/// assert!(!queue.cancel(1));
/// assert_eq!(queue.remove_next().map(|j| j.0), Some(2));
/// ```
pub struct CancelSafeQueue<T: Entry> {
    inner: Mutex<Inner<T>>,
    on_cancel: Option<CancelHook<T>>,
}

struct Inner<T: Entry> {
    entries: HashMap<T::Id, T>,
    order: VecDeque<T::Id>,
}

impl<T: Entry> fmt::Debug for CancelSafeQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSafeQueue")
            .field("len", &self.len())
            .field("custom_hook", &self.on_cancel.is_some())
            .finish()
    }
}

impl<T: Entry> Default for CancelSafeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entry> CancelSafeQueue<T> {
    /// Construct an empty [`CancelSafeQueue`] which cancels entries with
    /// [`Entry::cancelled`].
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            on_cancel: None,
        }
    }

    /// Construct an empty [`CancelSafeQueue`] which hands cancelled entries to
    /// `hook`.
    ///
    /// The hook runs without the queue lock held, so it may use the queue.
    pub fn with_cancel_hook<F>(hook: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            on_cancel: Some(Box::new(hook)),
            ..Self::new()
        }
    }

    /// Append an entry to the tail of the queue.
    ///
    /// If the entry reports [`Entry::cancel_requested`] it is cancelled
    /// instead of queued.
    pub fn insert(&self, entry: T) {
        self.insert0(entry, Position::Back)
    }

    /// Put an entry back at the head of the queue.
    ///
    /// Used to restore an entry that was removed for servicing but could not
    /// be serviced, keeping the queue's FIFO order.
    pub fn insert_front(&self, entry: T) {
        self.insert0(entry, Position::Front)
    }

    fn insert0(&self, entry: T, position: Position) {
        let refused = {
            let mut inner = self.inner.lock();
            // Checked under the lock: a concurrent `cancel` either already
            // flagged the entry, or will find it queued.
            if entry.cancel_requested() {
                Some(entry)
            } else {
                inner.push(entry, position);
                None
            }
        };
        if let Some(entry) = refused {
            trace!(target: LOG, "insert.cancelled id={:?}", entry.id());
            self.run_cancel_hook(entry);
        }
    }

    /// Remove and return the head of the queue.
    ///
    /// Returns `None` if the queue is empty.
    pub fn remove_next(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    /// Remove and return the first entry for which `filter` returns true.
    ///
    /// The scan and the removal happen in one critical section. `filter` runs
    /// with the queue lock held and must be cheap.
    pub fn remove_next_matching<F>(&self, filter: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        self.inner.lock().remove_matching(filter)
    }

    /// Cancel the entry with identity `id`.
    ///
    /// Returns true if the entry was still queued; it has been removed and
    /// handed to the cancel hook. Returns false if it was already removed, in
    /// which case whoever removed it owns its completion.
    pub fn cancel(&self, id: T::Id) -> bool {
        let entry = self.inner.lock().take(&id);
        match entry {
            Some(entry) => {
                trace!(target: LOG, "cancel.removed id={id:?}");
                self.run_cancel_hook(entry);
                true
            }
            None => {
                trace!(target: LOG, "cancel.missed id={id:?}");
                false
            }
        }
    }

    /// Remove every queued entry, in FIFO order, without cancelling it.
    pub fn drain_all(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        let mut drained = Vec::with_capacity(inner.entries.len());
        while let Some(entry) = inner.pop_front() {
            drained.push(entry);
        }
        drained
    }

    /// Returns true if an entry with identity `id` is queued.
    pub fn contains(&self, id: T::Id) -> bool {
        self.inner.lock().entries.contains_key(&id)
    }

    /// Returns the number of queued entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn run_cancel_hook(&self, entry: T) {
        match &self.on_cancel {
            Some(hook) => hook(entry),
            None => entry.cancelled(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Position {
    Front,
    Back,
}

impl<T: Entry> Inner<T> {
    fn push(&mut self, entry: T, position: Position) {
        let id = entry.id();
        let prev = self.entries.insert(id, entry);
        debug_assert!(prev.is_none(), "entry {id:?} queued twice");
        match position {
            Position::Front => self.order.push_front(id),
            Position::Back => self.order.push_back(id),
        }
    }

    fn pop_front(&mut self) -> Option<T> {
        let id = self.order.pop_front()?;
        self.entries.remove(&id)
    }

    fn remove_matching(&mut self, mut filter: impl FnMut(&T) -> bool) -> Option<T> {
        let entries = &self.entries;
        let idx = self.order.iter().position(|id| filter(&entries[id]))?;
        let id = self.order.remove(idx)?;
        self.entries.remove(&id)
    }

    fn take(&mut self, id: &T::Id) -> Option<T> {
        let entry = self.entries.remove(id)?;
        let idx = self.order.iter().position(|queued| queued == id);
        debug_assert!(idx.is_some(), "entry {id:?} missing from the order list");
        if let Some(idx) = idx {
            self.order.remove(idx);
        }
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::*;

    #[derive(Debug)]
    struct Item {
        id: u64,
        owner: u8,
        flagged: Arc<AtomicBool>,
        cancelled: Arc<AtomicUsize>,
    }

    impl Item {
        fn new(id: u64, owner: u8, cancelled: &Arc<AtomicUsize>) -> Self {
            Self {
                id,
                owner,
                flagged: Arc::new(AtomicBool::new(false)),
                cancelled: cancelled.clone(),
            }
        }
    }

    impl Entry for Item {
        type Id = u64;

        fn id(&self) -> u64 {
            self.id
        }

        fn cancel_requested(&self) -> bool {
            self.flagged.load(Ordering::SeqCst)
        }

        fn cancelled(self) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ids(queue: &CancelSafeQueue<Item>) -> Vec<u64> {
        queue.drain_all().into_iter().map(|i| i.id).collect()
    }

    #[test]
    fn fifo_order() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let queue = CancelSafeQueue::new();
        for id in 0..4 {
            queue.insert(Item::new(id, 0, &cancelled));
        }
        assert_eq!(queue.remove_next().map(|i| i.id), Some(0));
        assert_eq!(queue.remove_next().map(|i| i.id), Some(1));
        assert_eq!(queue.len(), 2);
        assert_eq!(ids(&queue), vec![2, 3]);
        assert!(queue.remove_next().is_none());
    }

    #[test]
    fn insert_front_restores_head() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let queue = CancelSafeQueue::new();
        queue.insert(Item::new(1, 0, &cancelled));
        queue.insert(Item::new(2, 0, &cancelled));
        let head = queue.remove_next().unwrap();
        queue.insert_front(head);
        assert_eq!(ids(&queue), vec![1, 2]);
    }

    #[test]
    fn remove_matching_skips_other_owners() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let queue = CancelSafeQueue::new();
        queue.insert(Item::new(1, 1, &cancelled));
        queue.insert(Item::new(2, 2, &cancelled));
        queue.insert(Item::new(3, 1, &cancelled));

        let mut removed = vec![];
        while let Some(item) = queue.remove_next_matching(|i| i.owner == 1) {
            removed.push(item.id);
        }
        assert_eq!(removed, vec![1, 3]);
        assert_eq!(ids(&queue), vec![2]);
    }

    #[test]
    fn cancel_runs_default_hook_once() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let queue = CancelSafeQueue::new();
        queue.insert(Item::new(1, 0, &cancelled));
        queue.insert(Item::new(2, 0, &cancelled));

        assert!(queue.cancel(1));
        assert!(!queue.cancel(1));
        assert!(!queue.contains(1));
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(queue.remove_next().map(|i| i.id), Some(2));
    }

    #[test]
    fn cancel_after_removal_misses() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let queue = CancelSafeQueue::new();
        queue.insert(Item::new(1, 0, &cancelled));
        let item = queue.remove_next().unwrap();
        assert!(!queue.cancel(item.id));
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn custom_hook_receives_entry() {
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let queue = CancelSafeQueue::with_cancel_hook(move |item: Item| {
            s.store(item.id as usize, Ordering::SeqCst);
        });
        let cancelled = Arc::new(AtomicUsize::new(0));
        queue.insert(Item::new(9, 0, &cancelled));
        assert!(queue.cancel(9));
        assert_eq!(seen.load(Ordering::SeqCst), 9);
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn flagged_entry_is_cancelled_on_insert() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let queue = CancelSafeQueue::new();
        let item = Item::new(1, 0, &cancelled);
        item.flagged.store(true, Ordering::SeqCst);
        queue.insert(item);
        assert!(queue.is_empty());
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_behind_stalled_head_keeps_order_bounded() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let queue = CancelSafeQueue::new();
        queue.insert(Item::new(0, 0, &cancelled));
        for id in 1..=1000 {
            queue.insert(Item::new(id, 0, &cancelled));
            assert!(queue.cancel(id));
            let head = queue.remove_next().unwrap();
            queue.insert_front(head);
        }
        let inner = queue.inner.lock();
        assert_eq!(inner.entries.len(), 1);
        assert_eq!(inner.order.len(), 1);
        drop(inner);
        assert_eq!(cancelled.load(Ordering::SeqCst), 1000);
    }

    #[test]
    fn reused_id_goes_to_the_back() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let queue = CancelSafeQueue::new();
        queue.insert(Item::new(1, 0, &cancelled));
        queue.insert(Item::new(2, 0, &cancelled));
        assert!(queue.cancel(1));
        queue.insert(Item::new(1, 0, &cancelled));
        assert_eq!(ids(&queue), vec![2, 1]);
    }

    #[test]
    fn cancelled_ids_are_not_handed_out() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let queue = CancelSafeQueue::new();
        for id in 0..3 {
            queue.insert(Item::new(id, 0, &cancelled));
        }
        assert!(queue.cancel(0));
        assert!(queue.cancel(1));
        assert_eq!(queue.remove_next_matching(|_| true).map(|i| i.id), Some(2));
        assert!(queue.remove_next().is_none());
    }

    #[test]
    fn remove_and_cancel_race_hands_out_once() {
        const ROUNDS: u64 = 500;
        for id in 0..ROUNDS {
            let cancelled = Arc::new(AtomicUsize::new(0));
            let queue = Arc::new(CancelSafeQueue::new());
            queue.insert(Item::new(id, 0, &cancelled));
            let barrier = Arc::new(Barrier::new(2));

            let remover = {
                let queue = queue.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    queue.remove_next().is_some()
                })
            };
            barrier.wait();
            let by_cancel = queue.cancel(id);
            let by_remove = remover.join().unwrap();

            assert!(by_cancel ^ by_remove, "round {id}");
            assert_eq!(cancelled.load(Ordering::SeqCst), by_cancel as usize);
        }
    }
}
