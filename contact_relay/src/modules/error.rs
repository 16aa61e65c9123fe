use std::fmt;

// Errors shared by the queue, the endpoint and the dispatcher.
// Kept `Clone` so a failure can be both logged and recorded against a queued entry
#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    // Endpoint unreachable or the request could not be sent
    TransportError(String),
    // Endpoint answered with a non-2xx status
    RejectedError(u16),
    // Delivery did not finish within the bound, in milliseconds
    TimeoutError(u64),
    // Payload failed the contact schema
    ValidationError(String),
    // Local queue cannot be opened, read or written
    StorageUnavailable(String),
    // Error for JSON serialization
    JsonSerializationError(String),
    // Error for JSON deserialization
    JsonDeserializationError(String),
    // Notification surface missing or refused
    NotificationUnavailable(String),
}

impl RelayError {
    // Failures that the queue absorbs: the payload is kept for the next drain
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            RelayError::TransportError(_) | RelayError::RejectedError(_) | RelayError::TimeoutError(_)
        )
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::TransportError(err) => write!(f, "Transport error: {}", err),
            RelayError::RejectedError(status) => write!(f, "Endpoint rejected submission with status {}", status),
            RelayError::TimeoutError(ms) => write!(f, "Delivery timed out after {} ms", ms),
            RelayError::ValidationError(err) => write!(f, "Validation error: {}", err),
            RelayError::StorageUnavailable(err) => write!(f, "Storage unavailable: {}", err),
            RelayError::JsonSerializationError(err) => write!(f, "JSON serialization error: {}", err),
            RelayError::JsonDeserializationError(err) => write!(f, "JSON deserialization error: {}", err),
            RelayError::NotificationUnavailable(err) => write!(f, "Notification unavailable: {}", err),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<rusqlite::Error> for RelayError {
    fn from(err: rusqlite::Error) -> Self {
        RelayError::StorageUnavailable(err.to_string())
    }
}
