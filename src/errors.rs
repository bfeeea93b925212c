// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! `AmqpError` covers everything the messaging layer reports to its callers:
//! configuration problems, exhausted connection retries, unknown queue or
//! channel lookups and failures while declaring, publishing or acknowledging.
//! `TransportError` is what the underlying AMQP client reports; it is kept
//! separate so the lifecycle code never depends on a concrete client.

use std::{error::Error as StdError, time::Duration};
use thiserror::Error;

/// Represents errors that can occur while managing AMQP connections, channels,
/// queues and messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Missing or invalid settings. Fatal at startup.
    #[error("improperly configured: {0}")]
    Configuration(String),

    /// Every connection attempt failed; carries the last transport error.
    #[error("failure to connect `{name}` after {attempts} attempts")]
    ConnectionFailure {
        name: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// An operation needed a live connection but none was established.
    #[error("connection `{0}` not established, call connect first")]
    NotConnected(String),

    /// Error opening a channel from an established connection
    #[error("failure to create the channel `{0}`")]
    ChannelError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error consuming from a queue; the pump recovers from it
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish to `{0}`")]
    PublishingError(String),

    /// Error serializing an outbound payload
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// Error decoding an inbound payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Lookup of a queue that was never declared
    #[error("invalid queue name `{name}`, your choices are {choices:?}")]
    UnknownQueue { name: String, choices: Vec<String> },

    /// Lookup of a channel that was never created
    #[error("invalid channel name `{name}`, your choices are {choices:?}")]
    UnknownChannel { name: String, choices: Vec<String> },

    /// A handler was registered without a lookup prefix
    #[error("improperly configured: need to configure lookup_prefix")]
    MissingLookupPrefix,
}

/// Errors reported by the underlying AMQP transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection or channel is closed.
    #[error("transport closed")]
    Closed,

    /// The broker did not answer within the connection timeout.
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Any error raised by the broker or the client library.
    #[error("{0}")]
    Broker(String),
}

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidConnectionState(_) | lapin::Error::InvalidChannelState(_) => {
                TransportError::Closed
            }
            other => TransportError::Broker(other.to_string()),
        }
    }
}

/// Error returned by application handlers.
pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// Result of a handler invocation.
pub type HandlerResult = Result<(), HandlerError>;
