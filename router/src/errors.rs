use std::{error::Error, fmt, fmt::Display};

use courier_helpers::envelope::EnvelopeError;
use redis::RedisError;

/// Provides a custom error type to be used for failures
/// in the recipient-key routing plane.
#[derive(Debug)]
pub enum RouterError {
    Redis(RedisError),
    Envelope(EnvelopeError),
    MissingEndpoint,
}

impl Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::Redis(redis_error) => write!(f, "router error: {redis_error}"),
            RouterError::Envelope(envelope_error) => write!(f, "router error: {envelope_error}"),
            RouterError::MissingEndpoint => {
                write!(f, "router error: no endpoint provided for outbound message")
            }
        }
    }
}

impl Error for RouterError {}

impl From<RedisError> for RouterError {
    fn from(err: RedisError) -> Self {
        RouterError::Redis(err)
    }
}

impl From<EnvelopeError> for RouterError {
    fn from(err: EnvelopeError) -> Self {
        RouterError::Envelope(err)
    }
}

#[derive(Debug)]
pub struct WorkerError {
    message: String,
}

impl WorkerError {
    pub fn new(message: String) -> Self {
        Self { message }
    }
}

impl Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Worker error: {}", self.message)
    }
}

impl From<RedisError> for WorkerError {
    fn from(err: RedisError) -> Self {
        Self {
            message: err.to_string(),
        }
    }
}

impl From<RouterError> for WorkerError {
    fn from(err: RouterError) -> Self {
        Self {
            message: err.to_string(),
        }
    }
}

// Provides a custom error type to be used for failures
// within message handlers.
#[derive(Debug)]
pub enum MessageHandlerError {
    MissingHandler,
    HandlerFailure(Box<dyn Error + Send + Sync + 'static>),
}

impl Display for MessageHandlerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MessageHandlerError::MissingHandler => write!(
                f,
                "message handler failed: a handler must be registered to process messages"
            ),
            MessageHandlerError::HandlerFailure(handler_error) => {
                write!(f, "message handler failed: {handler_error}")
            }
        }
    }
}

impl Error for MessageHandlerError {}
