use std::fmt;

use thiserror::Error;

/// Error types for listener container operations.
///
/// Errors raised while a container is running are contained at worker or
/// dispatch granularity and reported through the error channel; only
/// configuration and lifecycle calls return them to the caller.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Invalid container or queue configuration. Raised by `configure` and
    /// the builder, never silently ignored.
    #[error("invalid listener configuration: {0}")]
    Configuration(String),

    /// A logical queue name could not be mapped to a queue URL.
    #[error("failed to resolve destination '{queue}': {reason}")]
    DestinationResolution { queue: String, reason: String },

    /// A lifecycle operation was called in a state that does not allow it.
    #[error("illegal container state: {0}")]
    IllegalState(String),

    #[error(transparent)]
    Client(#[from] QueueClientError),

    #[error("failed to parse container descriptor: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ListenerError {
    pub fn configuration(message: impl Into<String>) -> Self {
        ListenerError::Configuration(message.into())
    }

    pub fn destination_resolution(queue: impl Into<String>, reason: impl fmt::Display) -> Self {
        ListenerError::DestinationResolution {
            queue: queue.into(),
            reason: reason.to_string(),
        }
    }
}

/// Category of a [`QueueClientError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueClientErrorKind {
    Network,
    Throttling,
    Auth,
    NotFound,
    InvalidReceiptHandle,
    /// The request was rejected as malformed or unsupported. Resending it
    /// unchanged cannot succeed.
    InvalidRequest,
    Other,
}

impl fmt::Display for QueueClientErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueClientErrorKind::Network => "network",
            QueueClientErrorKind::Throttling => "throttling",
            QueueClientErrorKind::Auth => "auth",
            QueueClientErrorKind::NotFound => "not found",
            QueueClientErrorKind::InvalidReceiptHandle => "invalid receipt handle",
            QueueClientErrorKind::InvalidRequest => "invalid request",
            QueueClientErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// Failure reported by a [`QueueClient`](crate::client::QueueClient) call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} error: {message}")]
pub struct QueueClientError {
    kind: QueueClientErrorKind,
    message: String,
}

impl QueueClientError {
    pub fn new(kind: QueueClientErrorKind, message: impl Into<String>) -> Self {
        QueueClientError {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(QueueClientErrorKind::Network, message)
    }

    pub fn throttling(message: impl Into<String>) -> Self {
        Self::new(QueueClientErrorKind::Throttling, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(QueueClientErrorKind::Auth, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(QueueClientErrorKind::NotFound, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(QueueClientErrorKind::InvalidRequest, message)
    }

    pub fn kind(&self) -> QueueClientErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Transient failures are retried with backoff by the polling workers.
    ///
    /// `Other` covers failures the service did not attribute to the caller,
    /// so it is retried as well.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            QueueClientErrorKind::Network
                | QueueClientErrorKind::Throttling
                | QueueClientErrorKind::Other
        )
    }
}

/// Failure returned by message handling logic.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    retryable: bool,
}

impl HandlerError {
    /// Creates a new `HandlerError` with the provided message.
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that redelivery will not fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        HandlerError {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        HandlerError::new(s)
    }
}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        HandlerError::new(s)
    }
}

impl From<ChannelSendError> for HandlerError {
    fn from(e: ChannelSendError) -> Self {
        match e {
            ChannelSendError::Timeout(_) => HandlerError::new(e.to_string()),
            ChannelSendError::Closed => HandlerError::permanent(e.to_string()),
        }
    }
}

/// Failure to hand a message to a [`MessageChannel`](crate::channel::MessageChannel).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelSendError {
    #[error("channel send timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("channel is closed")]
    Closed,
}
