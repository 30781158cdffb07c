//! Requests and their completions.
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures::channel::oneshot;

use crate::error::{Error, ErrorKind};

type CompletionFn = Box<dyn FnOnce(Completion) + Send>;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_CLIENT: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique identity of a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub(crate) fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw identity.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Groups the requests of one client session.
///
/// All requests tagged with a handle can be cancelled together when the
/// session closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientHandle(u64);

impl ClientHandle {
    /// Wrap a handle issued by the dispatch layer.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Allocate a handle distinct from every other allocated handle.
    pub(crate) fn next() -> Self {
        // High bit keeps allocated handles clear of ones built with `new`.
        Self(NEXT_CLIENT.fetch_add(1, Ordering::Relaxed) | 1 << 63)
    }

    /// Returns the raw handle value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Which side of the buffer a request is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Read-like; drains the buffer.
    Inbound,
    /// Write-like; fills the buffer.
    Outbound,
}

impl Direction {
    pub(crate) fn opposite(self) -> Self {
        match self {
            Direction::Inbound => Direction::Outbound,
            Direction::Outbound => Direction::Inbound,
        }
    }
}

/// The lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// Not yet seen by the transfer path.
    Fresh,
    /// Parked in a queue waiting for buffer state to change.
    Queued,
    /// Completed on the dispatch call that submitted it.
    CompletedSync,
    /// Completed later, from a drain pass.
    CompletedAsync,
    /// Completed with [`Outcome::Cancelled`].
    Cancelled,
}

/// The final result delivered for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The request completed, moving the given number of bytes.
    Success(usize),
    /// The resource was going away.
    Rejected,
    /// The request was cancelled.
    Cancelled,
    /// The request could never be serviced.
    InsufficientCapacity,
}

enum Span {
    Inbound { len: usize },
    Outbound { data: Bytes },
}

/// One asynchronous read or write.
///
/// A request is consumed by its completion, so it completes at most once. A
/// request dropped without completing is completed with
/// [`Outcome::Cancelled`], so it completes at least once.
pub struct Request {
    id: RequestId,
    client: ClientHandle,
    span: Span,
    transferred: usize,
    state: RequestState,
    cancel: Arc<AtomicBool>,
    on_complete: Option<CompletionFn>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("direction", &self.direction())
            .field("len", &self.len())
            .field("transferred", &self.transferred)
            .field("state", &self.state)
            .finish()
    }
}

impl Request {
    /// Build a read of up to `len` bytes, returning it together with a future
    /// that resolves to its [`Completion`].
    pub fn read(client: ClientHandle, len: usize) -> (Self, CompletionFuture) {
        let (tx, rx) = oneshot::channel();
        let request = Self::read_with(client, len, move |completion| {
            let _ = tx.send(completion);
        });
        let fut = CompletionFuture::new(rx, &request);
        (request, fut)
    }

    /// Build a read of up to `len` bytes which calls `on_complete` when done.
    pub fn read_with<F>(client: ClientHandle, len: usize, on_complete: F) -> Self
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        Self::new(client, Span::Inbound { len }, Box::new(on_complete))
    }

    /// Build a write of `data`, returning it together with a future that
    /// resolves to its [`Completion`].
    pub fn write(client: ClientHandle, data: impl Into<Bytes>) -> (Self, CompletionFuture) {
        let (tx, rx) = oneshot::channel();
        let request = Self::write_with(client, data, move |completion| {
            let _ = tx.send(completion);
        });
        let fut = CompletionFuture::new(rx, &request);
        (request, fut)
    }

    /// Build a write of `data` which calls `on_complete` when done.
    pub fn write_with<F>(client: ClientHandle, data: impl Into<Bytes>, on_complete: F) -> Self
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        let data = data.into();
        Self::new(client, Span::Outbound { data }, Box::new(on_complete))
    }

    fn new(client: ClientHandle, span: Span, on_complete: CompletionFn) -> Self {
        Self {
            id: RequestId::next(),
            client,
            span,
            transferred: 0,
            state: RequestState::Fresh,
            cancel: Arc::new(AtomicBool::new(false)),
            on_complete: Some(on_complete),
        }
    }

    /// Returns the identity of this request.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Returns the client session this request belongs to.
    pub fn client(&self) -> ClientHandle {
        self.client
    }

    /// Returns the direction of this request.
    pub fn direction(&self) -> Direction {
        match self.span {
            Span::Inbound { .. } => Direction::Inbound,
            Span::Outbound { .. } => Direction::Outbound,
        }
    }

    /// Returns the requested span in bytes.
    pub fn len(&self) -> usize {
        match &self.span {
            Span::Inbound { len } => *len,
            Span::Outbound { data } => data.len(),
        }
    }

    /// Returns true if the requested span is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of bytes already moved.
    pub fn transferred(&self) -> usize {
        self.transferred
    }

    /// Returns the current state.
    pub fn state(&self) -> RequestState {
        self.state
    }

    pub(crate) fn remaining(&self) -> usize {
        self.len() - self.transferred
    }

    /// The part of an outbound span not yet appended to the buffer.
    pub(crate) fn pending_data(&self) -> &[u8] {
        match &self.span {
            Span::Outbound { data } => &data[self.transferred..],
            Span::Inbound { .. } => &[],
        }
    }

    pub(crate) fn advance(&mut self, n: usize) {
        assert!(n <= self.remaining());
        self.transferred += n;
    }

    pub(crate) fn mark_queued(&mut self) {
        assert_eq!(self.state, RequestState::Fresh, "request {} queued twice", self.id);
        self.state = RequestState::Queued;
    }

    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Complete the request, handing `outcome` and `data` to its hook.
    pub(crate) fn complete(mut self, outcome: Outcome, data: Bytes) {
        self.deliver(outcome, data);
    }

    fn deliver(&mut self, outcome: Outcome, data: Bytes) {
        let Some(on_complete) = self.on_complete.take() else {
            return;
        };
        if let Outcome::Success(n) = outcome {
            // Outbound progress is tracked on the request; inbound reads finish in one copy.
            self.transferred = n;
        }
        self.state = match (outcome, self.state) {
            (Outcome::Cancelled, _) => RequestState::Cancelled,
            (_, RequestState::Queued) => RequestState::CompletedAsync,
            (_, RequestState::Fresh) => RequestState::CompletedSync,
            (_, state) => unreachable!("request {} completed from {state:?}", self.id),
        };
        on_complete(Completion {
            id: self.id,
            client: self.client,
            direction: self.direction(),
            outcome,
            state: self.state,
            transferred: self.transferred,
            data,
        });
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        self.deliver(Outcome::Cancelled, Bytes::new());
    }
}

impl weir_queue::Entry for Request {
    type Id = RequestId;

    fn id(&self) -> RequestId {
        self.id
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn cancelled(self) {
        self.complete(Outcome::Cancelled, Bytes::new());
    }
}

/// The result of a request, handed to its completion hook.
#[derive(Debug, Clone)]
pub struct Completion {
    id: RequestId,
    client: ClientHandle,
    direction: Direction,
    outcome: Outcome,
    state: RequestState,
    transferred: usize,
    data: Bytes,
}

impl Completion {
    /// Returns the identity of the completed request.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Returns the client session of the completed request.
    pub fn client(&self) -> ClientHandle {
        self.client
    }

    /// Returns the direction of the completed request.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Returns the final [`Outcome`].
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// Returns the terminal [`RequestState`].
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Returns the bytes moved before completion.
    ///
    /// For a cancelled write this is the part already appended to the buffer.
    pub fn transferred(&self) -> usize {
        self.transferred
    }

    /// Returns the bytes read. Empty for writes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Consume the completion, returning the bytes read.
    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Returns the byte count on success, or the reason for failure.
    pub fn result(&self) -> Result<usize, Error> {
        match self.outcome {
            Outcome::Success(n) => Ok(n),
            Outcome::Rejected => Err(Error::new(ErrorKind::Rejected)),
            Outcome::Cancelled => Err(Error::new(ErrorKind::Cancelled)),
            Outcome::InsufficientCapacity => Err(Error::new(ErrorKind::InsufficientCapacity)),
        }
    }
}

pin_project_lite::pin_project! {
    /// Future returned by [`Request::read`] and [`Request::write`].
    ///
    /// Resolves once the request completes, whichever path completes it.
    #[must_use = "futures do nothing unless you `.await` or poll them"]
    pub struct CompletionFuture {
        #[pin]
        rx: oneshot::Receiver<Completion>,
        id: RequestId,
        client: ClientHandle,
        direction: Direction,
    }
}

impl fmt::Debug for CompletionFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionFuture")
            .field("id", &self.id)
            .finish()
    }
}

impl CompletionFuture {
    fn new(rx: oneshot::Receiver<Completion>, request: &Request) -> Self {
        Self {
            rx,
            id: request.id,
            client: request.client,
            direction: request.direction(),
        }
    }

    /// Returns the identity of the request this future waits on.
    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl Future for CompletionFuture {
    type Output = Completion;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match ready!(this.rx.poll(cx)) {
            Ok(completion) => Poll::Ready(completion),
            // The hook was lost without running, e.g. the request was leaked.
            Err(oneshot::Canceled) => Poll::Ready(Completion {
                id: *this.id,
                client: *this.client,
                direction: *this.direction,
                outcome: Outcome::Cancelled,
                state: RequestState::Cancelled,
                transferred: 0,
                data: Bytes::new(),
            }),
        }
    }
}
