use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, trace};
use weir_gate::{Drained, LifecycleGate, Phase};

use crate::config::{Builder, Teardown};
use crate::error::Error;
use crate::request::{ClientHandle, Direction, Outcome, Request, RequestId};
use crate::transfer::{Dispatch, TransferController};

const LOG: &str = "weir_io::resource";

/// [`Resource`] is the entry point for the dispatch layer.
///
/// Every entry point holds a gate ticket for the duration of the call. Once
/// [`Resource::remove`] has been called, new requests complete with
/// [`Outcome::Rejected`], and when the last call in flight returns every
/// request still queued completes with [`Outcome::Cancelled`].
pub struct Resource {
    gate: LifecycleGate,
    controller: Arc<TransferController>,
    sessions: AtomicUsize,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("phase", &self.gate.phase())
            .field("sessions", &self.open_sessions())
            .field("controller", &self.controller)
            .finish()
    }
}

impl Resource {
    /// Create a new [`Builder`] with default settings.
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn new(
        capacity: usize,
        max_request_len: usize,
        on_teardown: Option<Teardown>,
    ) -> Self {
        let controller = Arc::new(TransferController::with_limit(capacity, max_request_len));
        let gate = {
            let controller = Arc::clone(&controller);
            LifecycleGate::with_teardown(move || {
                controller.shutdown();
                if let Some(on_teardown) = on_teardown {
                    on_teardown();
                }
            })
        };
        Self {
            gate,
            controller,
            sessions: AtomicUsize::new(0),
        }
    }

    /// Open a client session.
    ///
    /// Fails with [`crate::ErrorKind::Rejected`] once the resource is draining.
    pub fn open(&self) -> Result<ClientHandle, Error> {
        let client = ClientHandle::next();
        let _ticket = self.gate.acquire(client.as_u64())?;
        let open = self.sessions.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(target: LOG, "open client={client:?} sessions={open}");
        Ok(client)
    }

    /// Close a client session.
    pub fn close(&self, client: ClientHandle) -> Result<(), Error> {
        let _ticket = self.gate.acquire(client.as_u64())?;
        let prev = self
            .sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        debug_assert!(prev > 0, "close without a matching open");
        debug!(
            target: LOG,
            "close client={client:?} sessions={}",
            prev.saturating_sub(1)
        );
        Ok(())
    }

    /// Cancel every queued request of a closing session.
    ///
    /// Returns the number of requests cancelled.
    pub fn cleanup(&self, client: ClientHandle) -> Result<usize, Error> {
        let _ticket = self.gate.acquire(client.as_u64())?;
        let n = self.controller.cancel_all(client);
        debug!(target: LOG, "cleanup client={client:?} cancelled={n}");
        Ok(n)
    }

    /// Submit a read.
    ///
    /// ### Panics
    /// Panics if `request` is not a read.
    pub fn read(&self, request: Request) -> Dispatch {
        assert_eq!(request.direction(), Direction::Inbound, "read of a write request");
        self.submit(request)
    }

    /// Submit a write.
    ///
    /// ### Panics
    /// Panics if `request` is not a write.
    pub fn write(&self, request: Request) -> Dispatch {
        assert_eq!(request.direction(), Direction::Outbound, "write of a read request");
        self.submit(request)
    }

    /// Submit a request in either direction.
    pub fn submit(&self, request: Request) -> Dispatch {
        let ticket = match self.gate.acquire(request.id().as_u64()) {
            Ok(ticket) => ticket,
            Err(_) => {
                trace!(target: LOG, "submit.rejected id={}", request.id());
                request.complete(Outcome::Rejected, Bytes::new());
                return Dispatch::Completed;
            }
        };
        let dispatch = match request.direction() {
            Direction::Inbound => self.controller.handle_inbound(request),
            Direction::Outbound => self.controller.handle_outbound(request),
        };
        self.gate.release(ticket);
        dispatch
    }

    /// Cancel the queued request `id`.
    ///
    /// Cancellation is accepted in every phase, so queued requests can still
    /// be pulled while the resource drains. See [`TransferController::cancel`]
    /// for the return value.
    pub fn cancel(&self, id: RequestId) -> bool {
        self.controller.cancel(id)
    }

    /// Begin removing the resource.
    ///
    /// Returns a future which resolves once every call in flight has returned,
    /// every queued request has been cancelled and the teardown callback has
    /// run. Calling this more than once is harmless.
    pub fn remove(&self) -> Drained {
        self.gate.begin_drain();
        self.gate.drained()
    }

    /// Returns the lifecycle [`Phase`].
    pub fn phase(&self) -> Phase {
        self.gate.phase()
    }

    /// Returns the number of open client sessions.
    pub fn open_sessions(&self) -> usize {
        self.sessions.load(Ordering::Acquire)
    }

    /// Returns the number of buffered bytes.
    pub fn buffered(&self) -> usize {
        self.controller.buffer().len()
    }

    /// Returns the [`TransferController`] backing this resource.
    pub fn controller(&self) -> &TransferController {
        &self.controller
    }
}
