//! Error taxonomy for the indexing worker.
//!
//! Decode and routing errors belong to a single message: they are reported and
//! the message is skipped. Index write errors are either retriable (network,
//! availability, version conflicts) or permanent (mapping/validation). Consume
//! errors come from the log itself.

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteErrorKind {
    Retriable,
    Permanent,
}

impl WriteErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteErrorKind::Retriable => "retriable",
            WriteErrorKind::Permanent => "permanent",
        }
    }
}

impl fmt::Display for WriteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum IndexerError {
    /// Envelope or payload failed to deserialize.
    #[error("decode error: {0}")]
    Decode(String),

    /// Envelope discriminator is not one this worker routes.
    #[error("routing error: unrecognized envelope type {0:?}")]
    Routing(String),

    #[error("{kind} index write error during {operation}: {message}")]
    IndexWrite {
        kind: WriteErrorKind,
        operation: &'static str,
        message: String,
    },

    /// The log failed to deliver, acknowledge or accept a message.
    #[error("consume error: {0}")]
    Consume(String),

    /// Another worker may own the partition now; the message in hand must not
    /// be written or acknowledged by this one.
    #[error("partition lease lost: {0}")]
    LeaseLost(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl IndexerError {
    pub fn retriable(operation: &'static str, message: impl Into<String>) -> Self {
        IndexerError::IndexWrite {
            kind: WriteErrorKind::Retriable,
            operation,
            message: message.into(),
        }
    }

    pub fn permanent(operation: &'static str, message: impl Into<String>) -> Self {
        IndexerError::IndexWrite {
            kind: WriteErrorKind::Permanent,
            operation,
            message: message.into(),
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            IndexerError::IndexWrite {
                kind: WriteErrorKind::Retriable,
                ..
            }
        )
    }

    /// True when the partition should be reopened after a pause rather than
    /// stopped for good.
    pub fn is_restartable(&self) -> bool {
        self.is_retriable() || matches!(self, IndexerError::LeaseLost(_))
    }

    /// True for errors scoped to one message; the loop reports them and moves on.
    pub fn is_message_local(&self) -> bool {
        matches!(self, IndexerError::Decode(_) | IndexerError::Routing(_))
    }

    /// Short label used in logs and metrics.
    pub fn class(&self) -> &'static str {
        match self {
            IndexerError::Decode(_) => "decode",
            IndexerError::Routing(_) => "routing",
            IndexerError::IndexWrite {
                kind: WriteErrorKind::Retriable,
                ..
            } => "index_write_retriable",
            IndexerError::IndexWrite {
                kind: WriteErrorKind::Permanent,
                ..
            } => "index_write_permanent",
            IndexerError::Consume(_) => "consume",
            IndexerError::LeaseLost(_) => "lease_lost",
            IndexerError::Config(_) => "config",
        }
    }
}

impl From<redis::RedisError> for IndexerError {
    fn from(e: redis::RedisError) -> Self {
        IndexerError::Consume(e.to_string())
    }
}
