//! A buffered byte pipe between asynchronous writers and readers.
//!
//! Writers fill a fixed-capacity [`BoundedBuffer`] and readers drain it.
//! Requests that cannot make progress are queued and completed later, from
//! whichever call changes the buffer enough to serve them. Queued requests can
//! be cancelled at any time, and the whole [`Resource`] can be removed while
//! calls are in flight.
//!
//! ```rust
//! use futures::executor::block_on;
//! use weir_io::{Request, Resource};
//!
//! let resource = Resource::builder().capacity(4).build().unwrap();
//! let client = resource.open().unwrap();
//!
//! let (write, written) = Request::write(client, &b"ABCDE"[..]);
//! assert!(resource.write(write).is_pending());
//!
//! let (read, data) = Request::read(client, 10);
//! let _ = resource.read(read);
//! assert_eq!(&block_on(data).data()[..], b"ABCD");
//! assert_eq!(block_on(written).result(), Ok(5));
//! assert_eq!(resource.buffered(), 1);
//! ```
//!
//! # Components
//! - [`Resource`]: entry points, lifecycle and client sessions.
//! - [`TransferController`]: the queues and the flow control between them.
//! - [`BoundedBuffer`]: the shared byte buffer.
//! - [`Request`] and [`Completion`]: one operation and its result.
#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    clippy::missing_safety_doc
)]

mod buffer;
mod config;
mod error;
mod request;
mod resource;
mod transfer;

pub use buffer::{BoundedBuffer, DEFAULT_CAPACITY};
pub use config::{Builder, DEFAULT_MAX_REQUEST_LEN};
pub use error::{BuildError, Error, ErrorKind};
pub use request::{
    ClientHandle, Completion, CompletionFuture, Direction, Outcome, Request, RequestId,
    RequestState,
};
pub use resource::Resource;
pub use transfer::{CancelHandle, Dispatch, TransferController};
pub use weir_gate::{Drained, Phase};
