// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! Error enums for the broker decorator chain, the retry executor, the
//! deduplication store and application listeners. Transient failures are
//! retried internally; only the conditions listed here cross a component
//! boundary.

use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant provides specific context about what operation failed. The
/// payloads are plain strings so the enum stays comparable in tests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Every member of a redundant connection failed the operation
    #[error("no broker member available for `{0}`")]
    NoMemberAvailable(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error fetching a message with basic.get
    #[error("failure to get a message from `{0}`")]
    GetMessageError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// A delivery tag that this channel never handed out
    #[error("unknown delivery tag `{0}`")]
    UnknownDeliveryTag(u64),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// A queue-declare argument that could not be converted
    #[error("invalid argument `{0}`: {1}")]
    InvalidArgument(String, String),

    /// Invalid broker configuration
    #[error("invalid configuration: {0}")]
    ConfigurationError(String),

    /// Error closing a channel
    #[error("failure to close channel")]
    CloseChannelError,

    /// One or more members failed to close
    #[error("failure to close {} member(s): {}", .0.len(), .0.join("; "))]
    TeardownError(Vec<String>),
}

/// The two terminal conditions of a bounded retry.
///
/// `Exhausted` means every attempt failed before the deadline; `TimedOut`
/// means the overall deadline elapsed first. Both carry the last failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    #[error("retry exhausted after {attempts} attempt(s)")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
    },

    #[error("request timed out after {elapsed:?}")]
    TimedOut {
        elapsed: Duration,
        #[source]
        last: E,
    },
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// The failure of the final attempt.
    pub fn last(&self) -> &E {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::TimedOut { last, .. } => last,
        }
    }

    pub fn into_last(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::TimedOut { last, .. } => last,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RetryError::TimedOut { .. })
    }
}

impl From<RetryError<AmqpError>> for AmqpError {
    fn from(err: RetryError<AmqpError>) -> Self {
        err.into_last()
    }
}

impl From<tokio::task::JoinError> for AmqpError {
    fn from(_: tokio::task::JoinError) -> Self {
        AmqpError::InternalError
    }
}

/// Errors surfaced by the deduplication store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DedupError {
    /// All attempts failed before the failover deadline; assume not applied
    #[error("Deduplication store request failed")]
    RequestFailed,

    /// The failover deadline elapsed; the request may still be in flight
    #[error("Deduplication store request timed out")]
    RequestTimedOut,

    #[error("Invalid redis address")]
    InvalidAddress,

    #[error("Cannot connect to redis at given address: {0}")]
    CannotConnect(String),

    /// A single failed store round trip, retried internally
    #[error("redis error: {0}")]
    Redis(String),
}

impl From<redis::RedisError> for DedupError {
    fn from(err: redis::RedisError) -> Self {
        DedupError::Redis(err.to_string())
    }
}

impl From<tokio::task::JoinError> for DedupError {
    fn from(err: tokio::task::JoinError) -> Self {
        DedupError::Redis(err.to_string())
    }
}

impl From<RetryError<DedupError>> for DedupError {
    fn from(err: RetryError<DedupError>) -> Self {
        match err {
            RetryError::Exhausted { .. } => DedupError::RequestFailed,
            RetryError::TimedOut { .. } => DedupError::RequestTimedOut,
        }
    }
}

/// Error returned by an application message listener.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("handler failure: {0}")]
    Failed(String),

    #[error(transparent)]
    Amqp(#[from] AmqpError),

    #[error(transparent)]
    Dedup(#[from] DedupError),

    /// A failed delivery kept its processing claim, so it was not settled
    #[error("failure to release processing claim: {0}")]
    ClaimNotReleased(DedupError),
}
