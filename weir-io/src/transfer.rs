//! Flow control between queued readers, queued writers and the buffer.
//!
//! Reads drain the buffer and writes fill it. A request that cannot be
//! serviced right away is parked in the queue for its direction, and every
//! change to the buffer gives the opposite queue a chance to make progress.
//!
//! Each queue is serviced strictly from its head. If the head cannot make
//! progress the pass stops, even if a later request could have been served.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use log::{trace, warn};
use parking_lot::Mutex;
use smallvec::SmallVec;
use weir_queue::CancelSafeQueue;

use crate::buffer::BoundedBuffer;
use crate::request::{ClientHandle, Direction, Outcome, Request, RequestId};

const LOG: &str = "weir_io::transfer";

type Queue = CancelSafeQueue<Request>;

/// The result of handing a request to the transfer path.
#[derive(Debug)]
#[must_use = "a pending dispatch carries the handle needed to cancel the request"]
pub enum Dispatch {
    /// The request has already been completed through its hook.
    Completed,
    /// The request was queued and will be completed later.
    Pending {
        /// Cancels the queued request.
        cancel: CancelHandle,
        /// Bytes moved before the request was queued.
        transferred: usize,
    },
}

impl Dispatch {
    /// Returns true if the request was queued.
    pub fn is_pending(&self) -> bool {
        matches!(self, Dispatch::Pending { .. })
    }

    /// Returns the [`CancelHandle`] of a pending request.
    pub fn cancel_handle(&self) -> Option<&CancelHandle> {
        match self {
            Dispatch::Pending { cancel, .. } => Some(cancel),
            Dispatch::Completed => None,
        }
    }
}

/// Identifies a queued request so that it can be cancelled.
///
/// The handle does not own the request. Cancelling through it flags the
/// request, so if a drain pass is holding the request at that moment and puts
/// it back, it is cancelled on the way back in.
#[derive(Clone)]
pub struct CancelHandle {
    id: RequestId,
    flag: Arc<AtomicBool>,
    queue: Weak<Queue>,
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle").field("id", &self.id).finish()
    }
}

impl CancelHandle {
    fn new(request: &Request, queue: &Arc<Queue>) -> Self {
        Self {
            id: request.id(),
            flag: request.cancel_flag(),
            queue: Arc::downgrade(queue),
        }
    }

    /// Returns the identity of the request.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Request cancellation.
    ///
    /// Returns true if the request was still queued and has been completed
    /// with [`Outcome::Cancelled`]. Returns false if it had already been
    /// taken for servicing; it is then completed by whoever holds it.
    pub fn cancel(&self) -> bool {
        self.flag.store(true, Ordering::Release);
        match self.queue.upgrade() {
            Some(queue) => queue.cancel(self.id),
            None => false,
        }
    }
}

/// Cancel flags of parked requests, by identity.
///
/// Entries die with their request; dead entries are pruned once the map has
/// doubled since the last prune.
struct CancelFlags {
    flags: HashMap<RequestId, Weak<AtomicBool>>,
    prune_at: usize,
}

const MIN_PRUNE_AT: usize = 64;

impl CancelFlags {
    fn new() -> Self {
        Self {
            flags: HashMap::new(),
            prune_at: MIN_PRUNE_AT,
        }
    }

    fn register(&mut self, id: RequestId, flag: &Arc<AtomicBool>) {
        self.flags.insert(id, Arc::downgrade(flag));
        if self.flags.len() >= self.prune_at {
            self.flags.retain(|_, flag| flag.strong_count() > 0);
            self.prune_at = std::cmp::max(MIN_PRUNE_AT, self.flags.len() * 2);
        }
    }

    fn get(&mut self, id: RequestId) -> Option<Arc<AtomicBool>> {
        let flag = self.flags.get(&id)?.upgrade();
        if flag.is_none() {
            self.flags.remove(&id);
        }
        flag
    }
}

/// [`TransferController`] owns the buffer and one queue per direction.
pub struct TransferController {
    buffer: BoundedBuffer,
    inbound: Arc<Queue>,
    outbound: Arc<Queue>,
    cancel_flags: Mutex<CancelFlags>,
    max_request_len: usize,
}

impl std::fmt::Debug for TransferController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferController")
            .field("buffer", &self.buffer)
            .field("inbound", &self.inbound.len())
            .field("outbound", &self.outbound.len())
            .field("max_request_len", &self.max_request_len)
            .finish()
    }
}

impl TransferController {
    /// Create a controller with a buffer of `capacity` bytes and no request
    /// length limit.
    ///
    /// ### Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        Self::with_limit(capacity, usize::MAX)
    }

    pub(crate) fn with_limit(capacity: usize, max_request_len: usize) -> Self {
        Self {
            buffer: BoundedBuffer::new(capacity),
            inbound: Arc::new(Queue::new()),
            outbound: Arc::new(Queue::new()),
            cancel_flags: Mutex::new(CancelFlags::new()),
            max_request_len,
        }
    }

    /// Returns the shared buffer.
    pub fn buffer(&self) -> &BoundedBuffer {
        &self.buffer
    }

    /// Returns the number of queued requests in `direction`.
    pub fn queued(&self, direction: Direction) -> usize {
        self.queue(direction).len()
    }

    /// Service a read.
    ///
    /// Completes synchronously with whatever is buffered, up to the request
    /// length, or queues the request if the buffer is empty.
    ///
    /// ### Panics
    /// Panics if `request` is not a read.
    pub fn handle_inbound(&self, request: Request) -> Dispatch {
        assert_eq!(request.direction(), Direction::Inbound);
        let Some(request) = self.admit(request) else {
            return Dispatch::Completed;
        };

        // Earlier readers are served first.
        let data = if self.inbound.is_empty() {
            self.buffer.consume(request.len())
        } else {
            Bytes::new()
        };
        let dispatch = if data.is_empty() {
            trace!(target: LOG, "inbound.queued id={}", request.id());
            self.park(request, &self.inbound)
        } else {
            let n = data.len();
            trace!(target: LOG, "inbound.sync id={} n={n}", request.id());
            request.complete(Outcome::Success(n), data);
            Dispatch::Completed
        };

        self.settle(Direction::Outbound);
        dispatch
    }

    /// Service a write.
    ///
    /// Completes synchronously if the whole span fits. Otherwise appends what
    /// fits, records the progress, and queues the remainder.
    ///
    /// ### Panics
    /// Panics if `request` is not a write.
    pub fn handle_outbound(&self, request: Request) -> Dispatch {
        assert_eq!(request.direction(), Direction::Outbound);
        let Some(mut request) = self.admit(request) else {
            return Dispatch::Completed;
        };

        // Earlier writers are served first, or the bytes would interleave.
        if self.outbound.is_empty() {
            let n = self.buffer.append(request.pending_data());
            request.advance(n);
        }
        let dispatch = if request.remaining() == 0 {
            let n = request.transferred();
            trace!(target: LOG, "outbound.sync id={} n={n}", request.id());
            request.complete(Outcome::Success(n), Bytes::new());
            Dispatch::Completed
        } else {
            trace!(
                target: LOG,
                "outbound.queued id={} transferred={} remaining={}",
                request.id(),
                request.transferred(),
                request.remaining()
            );
            self.park(request, &self.outbound)
        };

        self.settle(Direction::Inbound);
        dispatch
    }

    /// Service queued reads from the head of the inbound queue.
    ///
    /// Stops at the first read the buffer cannot satisfy. If any read
    /// completed, the outbound queue gets one follow-on pass, since the space
    /// freed may unblock a writer.
    ///
    /// Returns true if any read completed.
    pub fn drain_inbound(&self) -> bool {
        let completed = self.pass_inbound();
        if completed {
            self.pass_outbound();
        }
        completed
    }

    /// Service queued writes from the head of the outbound queue.
    ///
    /// Stops at the first write whose remainder does not fit. If any bytes
    /// were appended, the inbound queue gets one follow-on pass.
    ///
    /// Returns true if any bytes were appended.
    pub fn drain_outbound(&self) -> bool {
        let appended = self.pass_outbound();
        if appended {
            self.pass_inbound();
        }
        appended
    }

    /// Cancel every queued request belonging to `client`.
    ///
    /// Returns the number of requests cancelled.
    pub fn cancel_all(&self, client: ClientHandle) -> usize {
        let mut cancelled: SmallVec<[Request; 4]> = SmallVec::new();
        for queue in [&self.inbound, &self.outbound] {
            while let Some(request) = queue.remove_next_matching(|r| r.client() == client) {
                cancelled.push(request);
            }
        }

        let n = cancelled.len();
        trace!(target: LOG, "cancel_all client={client:?} n={n}");
        for request in cancelled {
            request.complete(Outcome::Cancelled, Bytes::new());
        }
        n
    }

    /// Cancel the queued request `id`, whichever queue holds it.
    ///
    /// Behaves like [`CancelHandle::cancel`]: returns true if the request was
    /// queued and has been completed with [`Outcome::Cancelled`]. Returns
    /// false if the request has completed, or is held by a drain pass; in the
    /// latter case it is cancelled if the pass puts it back.
    pub fn cancel(&self, id: RequestId) -> bool {
        let flag = self.cancel_flags.lock().get(id);
        match flag {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                self.inbound.cancel(id) || self.outbound.cancel(id)
            }
            None => {
                trace!(target: LOG, "cancel.unknown id={id}");
                false
            }
        }
    }

    /// Cancel everything still queued.
    ///
    /// Returns the number of requests cancelled.
    pub fn shutdown(&self) -> usize {
        let mut n = 0;
        for queue in [&self.inbound, &self.outbound] {
            for request in queue.drain_all() {
                request.complete(Outcome::Cancelled, Bytes::new());
                n += 1;
            }
        }
        if n > 0 {
            warn!(target: LOG, "shutdown cancelled {n} queued requests");
        }
        n
    }

    fn queue(&self, direction: Direction) -> &Arc<Queue> {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }

    /// Complete requests which never need the buffer.
    fn admit(&self, request: Request) -> Option<Request> {
        if request.is_empty() {
            trace!(target: LOG, "admit.empty id={}", request.id());
            request.complete(Outcome::Success(0), Bytes::new());
            return None;
        }
        if request.len() > self.max_request_len {
            trace!(
                target: LOG,
                "admit.too_long id={} len={}",
                request.id(),
                request.len()
            );
            request.complete(Outcome::InsufficientCapacity, Bytes::new());
            return None;
        }
        Some(request)
    }

    fn park(&self, mut request: Request, queue: &Arc<Queue>) -> Dispatch {
        request.mark_queued();
        let transferred = request.transferred();
        let cancel = CancelHandle::new(&request, queue);
        self.cancel_flags
            .lock()
            .register(request.id(), &cancel.flag);
        queue.insert(request);
        Dispatch::Pending {
            cancel,
            transferred,
        }
    }

    /// Repeat drain calls, alternating direction and starting with `first`,
    /// until neither direction makes progress.
    fn settle(&self, first: Direction) {
        let mut next = first;
        let mut idle = 0;
        while idle < 2 {
            let progressed = match next {
                Direction::Inbound => self.drain_inbound(),
                Direction::Outbound => self.drain_outbound(),
            };
            idle = if progressed { 0 } else { idle + 1 };
            next = next.opposite();
        }
    }

    fn pass_inbound(&self) -> bool {
        let mut completed = false;
        while let Some(request) = self.inbound.remove_next() {
            let data = self.buffer.consume(request.len());
            if data.is_empty() {
                self.inbound.insert_front(request);
                // A writer may have appended while the request was out of the
                // queue, and found nothing to serve.
                if self.buffer.is_empty() {
                    break;
                }
                continue;
            }
            let n = data.len();
            trace!(target: LOG, "inbound.async id={} n={n}", request.id());
            request.complete(Outcome::Success(n), data);
            completed = true;
        }
        completed
    }

    fn pass_outbound(&self) -> bool {
        let mut appended = false;
        while let Some(mut request) = self.outbound.remove_next() {
            let n = self.buffer.append(request.pending_data());
            if n > 0 {
                request.advance(n);
                appended = true;
            }
            if request.remaining() == 0 {
                let total = request.transferred();
                trace!(target: LOG, "outbound.async id={} n={total}", request.id());
                request.complete(Outcome::Success(total), Bytes::new());
                continue;
            }
            trace!(
                target: LOG,
                "outbound.partial id={} transferred={}",
                request.id(),
                request.transferred()
            );
            self.outbound.insert_front(request);
            // As above, a reader may have freed space meanwhile.
            if self.buffer.free_space() == 0 {
                break;
            }
        }
        appended
    }
}
