use snafu::Snafu;

/// Failures raised by a [`Store`](crate::store::Store) backend.
///
/// Backends never retry; whatever the transport reports is handed back to the
/// caller with the underlying cause attached.
#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("Error returned from redis"))]
    Redis {
        #[snafu(source)]
        source: redis::RedisError,
    },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    Migrate {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Invalid store address: {address}"))]
    InvalidAddress {
        address: String,
        #[snafu(source)]
        source: url::ParseError,
    },

    #[snafu(display("Timed out connecting to {address}"))]
    ConnectTimeout { address: String },
}

impl From<redis::RedisError> for StoreError {
    fn from(source: redis::RedisError) -> Self {
        Self::Redis { source }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::Migrate { source }
    }
}

/// Errors surfaced by the queue protocol.
#[derive(Debug, Snafu)]
pub enum Error {
    /// Pull found nothing available. Expected control flow, not a failure.
    #[snafu(display("queue is empty"))]
    QueueEmpty,

    #[snafu(display("message not found: {id}"))]
    MessageNotFound { id: String },

    #[snafu(display("invalid receipt for message {id}"))]
    InvalidReceipt { id: String },

    /// Only produced by the reaper when it dead-letters a message.
    #[snafu(display("max retries reached for message {id} after {retries} deliveries"))]
    MaxRetriesReached { id: String, retries: u32 },

    #[snafu(display("Corrupt record for message {id}: {reason}"))]
    CorruptRecord { id: String, reason: String },

    #[snafu(display("Invalid parameter: {message}"))]
    InvalidParameter { message: String },

    #[snafu(display("Store error"))]
    Store {
        #[snafu(source)]
        source: StoreError,
    },
}

impl From<StoreError> for Error {
    fn from(source: StoreError) -> Self {
        Self::Store { source }
    }
}

impl Error {
    pub fn is_queue_empty(&self) -> bool {
        matches!(self, Self::QueueEmpty)
    }

    pub fn message_not_found(id: impl Into<String>) -> Self {
        Self::MessageNotFound { id: id.into() }
    }

    pub fn invalid_receipt(id: impl Into<String>) -> Self {
        Self::InvalidReceipt { id: id.into() }
    }

    pub fn corrupt(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptRecord {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }
}
