use crate::broker::BrokerError;
use crate::pool::PoolError;
use std::fmt;

/// The error type returned by message handlers.
///
/// Any [`std::error::Error`] can be turned into a transient `HandlerError` with `?`.
/// Use [`HandlerError::transient`] for an [`anyhow::Error`], and [`HandlerError::fatal`] for
/// messages that will never be processed successfully.
#[derive(Debug)]
pub struct HandlerError {
    /// The underlying error returned by the message handler.
    pub inner_error: anyhow::Error,
    /// Check out [`ErrorType`]'s documentation for more details.
    pub error_type: ErrorType,
}

impl HandlerError {
    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        Self {
            inner_error: error.into(),
            error_type: ErrorType::Transient,
        }
    }

    pub fn fatal(error: impl Into<anyhow::Error>) -> Self {
        Self {
            inner_error: error.into(),
            error_type: ErrorType::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.error_type == ErrorType::Fatal
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::transient(error)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Handling of a message failed due to a {} issue: {}",
            self.error_type, self.inner_error
        )
    }
}

/// Types of failure when handling a message.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorType {
    /// Message processing might succeed if retried.
    ///
    /// The message is handed back to the broker for redelivery (client and transacted
    /// acknowledgement modes).
    Transient,
    /// Message processing will never succeed, no matter how many times you retry.
    ///
    /// E.g. the payload is malformed. The message is acknowledged and dropped.
    Fatal,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Error returned when starting a [`ConsumerPool`](super::ConsumerPool).
#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    #[error("The consumer pool is already running")]
    AlreadyStarted,
    #[error("Failed to open a session for a consumer worker")]
    Session(#[from] PoolError),
    #[error("Failed to start consuming from `{destination}`")]
    Subscribe {
        destination: String,
        #[source]
        source: BrokerError,
    },
    #[error("A pre-start hook failed for `{destination}`")]
    PreStartHook {
        destination: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Failed to listen for termination signals")]
    Signal(#[source] std::io::Error),
}
