// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Transport Seam
//!
//! The lifecycle managers talk to the broker only through the traits in this
//! module. The production implementation lives in [`crate::amqp`] and is
//! backed by `lapin`; tests substitute their own.

use crate::{
    config::ConnectionParams,
    errors::{AmqpError, TransportError},
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, fmt, sync::Arc};
use tracing::error;

#[cfg(test)]
use mockall::automock;

/// Stream of deliveries for one consumer. Ends or yields an error when the
/// underlying channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

/// Opens transport sessions.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn Session>, TransportError>;
}

/// An established connection to the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Session: Send + Sync {
    fn is_open(&self) -> bool;

    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// A channel multiplexed over a session.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), TransportError>;

    /// Publishes on the default exchange with `routing_key` as the queue name.
    async fn publish(&self, routing_key: &str, message: OutboundMessage)
        -> Result<(), TransportError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Settles a single delivery on manual-ack queues.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), TransportError>;

    async fn nack(&self, requeue: bool) -> Result<(), TransportError>;
}

/// A message ready to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub action: String,
    pub message_id: String,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

/// A message delivered by the broker.
#[derive(Clone)]
pub struct Delivery {
    pub queue: String,
    pub action: Option<String>,
    pub data: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    acker: Option<Arc<dyn Acknowledger>>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("action", &self.action)
            .field("data", &String::from_utf8_lossy(&self.data))
            .field("headers", &self.headers)
            .field("manual_ack", &self.acker.is_some())
            .finish()
    }
}

impl Delivery {
    pub fn new(queue: &str, action: Option<String>, data: Vec<u8>) -> Delivery {
        Delivery {
            queue: queue.to_owned(),
            action,
            data,
            headers: BTreeMap::default(),
            acker: None,
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Attaches the acknowledger of a manual-ack delivery.
    pub fn with_acker(mut self, acker: Arc<dyn Acknowledger>) -> Self {
        self.acker = Some(acker);
        self
    }

    /// Whether the consumer must settle this delivery itself.
    pub fn requires_ack(&self) -> bool {
        self.acker.is_some()
    }

    /// Acknowledges the delivery. No-op on auto-ack queues.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        let Some(acker) = &self.acker else {
            return Ok(());
        };

        acker.ack().await.map_err(|err| {
            error!(error = err.to_string(), queue = self.queue, "error whiling ack msg");
            AmqpError::AckMessageError
        })
    }

    /// Negative-acknowledges the delivery. No-op on auto-ack queues.
    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        let Some(acker) = &self.acker else {
            return Ok(());
        };

        acker.nack(requeue).await.map_err(|err| {
            error!(error = err.to_string(), queue = self.queue, "error whiling nack msg");
            AmqpError::NackMessageError
        })
    }
}
