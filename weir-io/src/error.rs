/// Error returned for a request which did not complete successfully.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error(transparent)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind }
    }

    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if the request was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    /// Returns true if the resource refused the request because it is going away.
    pub fn is_rejected(&self) -> bool {
        self.kind == ErrorKind::Rejected
    }
}

impl From<weir_gate::Rejected> for Error {
    fn from(_: weir_gate::Rejected) -> Self {
        Self::new(ErrorKind::Rejected)
    }
}

/// The kind of request error.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The resource is draining and no longer admits work.
    #[error("resource is going away")]
    Rejected,
    /// The request was pulled from its queue before it could be serviced.
    #[error("request was cancelled")]
    Cancelled,
    /// The request is larger than the resource will ever transfer in one go.
    #[error("request exceeds the transfer limit")]
    InsufficientCapacity,
}

/// Error returned by [`crate::Builder::build`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildError {
    /// The buffer capacity was zero.
    #[error("buffer capacity must be at least one byte")]
    ZeroCapacity,
    /// The request length limit was zero.
    #[error("max request length must be at least one byte")]
    ZeroMaxRequestLen,
}
