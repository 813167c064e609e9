//! Domain-specific error types for container engine calls.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings.

/// Errors that can occur while talking to the container engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine socket is missing or the daemon is not answering.
    #[error("Container engine is not available: {message}")]
    Unavailable { message: String },

    /// The referenced container or exec instance does not exist.
    #[error("No such container: {id}")]
    NotFound { id: String },

    /// The engine answered with a non-2xx status.
    #[error("{operation} failed with status {status}: {body}")]
    Protocol {
        operation: &'static str,
        status: u16,
        body: String,
    },

    /// An archive stream broke while being transferred.
    #[error("Archive transfer failed: {message}")]
    Transfer { message: String },

    /// An exec could not be run, or it exited with a non-zero status.
    #[error("Exec failed: {message}")]
    Exec { message: String },
}

impl EngineError {
    /// Creates an `Unavailable` error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a `NotFound` error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates a `Protocol` error carrying the response body.
    pub fn protocol(operation: &'static str, status: u16, body: impl Into<String>) -> Self {
        Self::Protocol {
            operation,
            status,
            body: body.into(),
        }
    }

    /// Creates a `Transfer` error.
    pub fn transfer(message: impl Into<String>) -> Self {
        Self::Transfer {
            message: message.into(),
        }
    }

    /// Creates an `Exec` error.
    pub fn exec(message: impl Into<String>) -> Self {
        Self::Exec {
            message: message.into(),
        }
    }

    /// Maps a bollard error for `operation` on `id` into the engine taxonomy.
    ///
    /// 404 becomes `NotFound`, other server responses keep their status and
    /// body, and connection-level failures become `Unavailable`.
    pub fn from_bollard(operation: &'static str, id: &str, err: bollard::errors::Error) -> Self {
        use bollard::errors::Error;

        match err {
            Error::DockerResponseServerError {
                status_code: 404, ..
            } => Self::not_found(id),
            Error::DockerResponseServerError {
                status_code,
                message,
            } => Self::protocol(operation, status_code, message),
            Error::HyperResponseError { .. }
            | Error::IOError { .. }
            | Error::RequestTimeoutError
            | Error::SocketNotFoundError(_) => Self::unavailable(err.to_string()),
            other => Self::protocol(operation, 0, other.to_string()),
        }
    }

    /// Returns true if the engine reported the object as gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if the engine could not be reached at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Returns the HTTP status of a protocol error.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Protocol { status, .. } => Some(*status),
            Self::NotFound { .. } => Some(404),
            _ => None,
        }
    }
}
