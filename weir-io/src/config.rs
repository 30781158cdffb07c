use std::fmt;

use crate::buffer::DEFAULT_CAPACITY;
use crate::error::BuildError;
use crate::resource::Resource;

/// Default limit on the span of a single request, 16 MiB.
pub const DEFAULT_MAX_REQUEST_LEN: usize = 16 * 1024 * 1024;

pub(crate) type Teardown = Box<dyn FnOnce() + Send>;

/// Builder for a [`Resource`].
pub struct Builder {
    capacity: usize,
    max_request_len: usize,
    on_teardown: Option<Teardown>,
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("capacity", &self.capacity)
            .field("max_request_len", &self.max_request_len)
            .field("on_teardown", &self.on_teardown.is_some())
            .finish()
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Create a new Builder with the defaults: a 1 MiB buffer, a 16 MiB
    /// request limit and no teardown callback.
    pub fn new() -> Builder {
        Builder {
            capacity: DEFAULT_CAPACITY,
            max_request_len: DEFAULT_MAX_REQUEST_LEN,
            on_teardown: None,
        }
    }

    /// The capacity of the shared buffer in bytes.
    pub fn capacity(mut self, capacity: usize) -> Builder {
        self.capacity = capacity;
        self
    }

    /// The largest span a single request may have. Longer requests complete
    /// with [`crate::Outcome::InsufficientCapacity`].
    ///
    /// The limit may exceed the capacity; such requests are transferred in
    /// pieces.
    pub fn max_request_len(mut self, max_request_len: usize) -> Builder {
        self.max_request_len = max_request_len;
        self
    }

    /// Run `f` once the resource has been removed, after every queued request
    /// has been cancelled.
    pub fn on_teardown<F>(mut self, f: F) -> Builder
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_teardown = Some(Box::new(f));
        self
    }

    /// Return a [`Resource`].
    pub fn build(self) -> Result<Resource, BuildError> {
        if self.capacity == 0 {
            return Err(BuildError::ZeroCapacity);
        }
        if self.max_request_len == 0 {
            return Err(BuildError::ZeroMaxRequestLen);
        }
        Ok(Resource::new(
            self.capacity,
            self.max_request_len,
            self.on_teardown,
        ))
    }
}
