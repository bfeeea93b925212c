// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management
//!
//! `QueueDefinition` describes how a queue is declared and acknowledged.
//! `QueueManager` is the runtime handle of a declared queue: it is owned by
//! the [`crate::channel::ChannelManager`] that declared it and is also
//! reachable by name through the shared [`crate::registry::Registry`].

use crate::{
    config::QueueSettings,
    errors::AmqpError,
    transport::{AmqpChannel, Delivery},
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info};

/// Invoked for every delivery on a consumed queue.
///
/// On queues declared with `auto_ack == false` the callback owns the
/// acknowledgement through [`Delivery::ack`] and [`Delivery::nack`].
#[async_trait]
pub trait MessageCallback: Send + Sync {
    async fn on_message(&self, delivery: Delivery);
}

/// Definition of a queue with its declaration flags.
///
/// By default the queue is non-durable, non-exclusive, not auto-deleted,
/// non-passive and consumed with auto-ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) auto_ack: bool,
}

impl QueueDefinition {
    /// A definition with default flags.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            delete: false,
            exclusive: false,
            passive: false,
            auto_ack: true,
        }
    }

    /// Builds the definition from the queue's settings entry.
    pub fn from_settings(name: &str, settings: &QueueSettings) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: settings.durable,
            delete: settings.auto_delete,
            exclusive: settings.exclusive,
            passive: settings.passive,
            auto_ack: settings.auto_ack,
        }
    }

    /// Makes the queue survive broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Deletes the queue once its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Restricts the queue to the declaring connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Only checks that the queue exists.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Deliveries must be acknowledged by the consumer callback.
    pub fn manual_ack(mut self) -> Self {
        self.auto_ack = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_passive(&self) -> bool {
        self.passive
    }

    pub fn is_auto_ack(&self) -> bool {
        self.auto_ack
    }
}

/// A queue declared on the broker.
pub struct QueueManager {
    def: QueueDefinition,
    channel_name: String,
    callback: RwLock<Option<Arc<dyn MessageCallback>>>,
    consumers: Arc<Notify>,
}

impl QueueManager {
    /// Declares the queue on the given channel.
    ///
    /// # Parameters
    /// * `channel` - The consume channel of the owning channel manager
    /// * `channel_name` - Name of the owning channel
    /// * `def` - Queue name and declaration flags
    /// * `consumers` - Signalled when a callback is registered, so the
    ///   owning channel's pump subscribes the queue
    pub(crate) async fn declare(
        channel: &dyn AmqpChannel,
        channel_name: &str,
        def: QueueDefinition,
        consumers: Arc<Notify>,
    ) -> Result<Arc<QueueManager>, AmqpError> {
        debug!(queue = def.name, channel = channel_name, "creating queue");

        if let Err(err) = channel.declare_queue(&def).await {
            error!(
                error = err.to_string(),
                queue = def.name,
                "error to declare the queue"
            );
            return Err(AmqpError::DeclareQueueError(def.name));
        }

        info!(queue = def.name, "queue created");

        Ok(Arc::new(QueueManager {
            def,
            channel_name: channel_name.to_owned(),
            callback: RwLock::new(None),
            consumers,
        }))
    }

    pub(crate) async fn redeclare(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        channel.declare_queue(&self.def).await.map_err(|err| {
            error!(
                error = err.to_string(),
                queue = self.def.name,
                "error to redeclare the queue"
            );
            AmqpError::DeclareQueueError(self.def.name.clone())
        })
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Name of the channel that declared the queue.
    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn definition(&self) -> &QueueDefinition {
        &self.def
    }

    /// Registers the callback invoked for every delivery on this queue.
    ///
    /// A running pump of the owning channel subscribes the queue right away;
    /// otherwise consumption starts with the pump. Registering again
    /// replaces the callback.
    ///
    /// # Parameters
    /// * `callback` - Receives every delivery, in arrival order
    pub async fn basic_consumer(&self, callback: Arc<dyn MessageCallback>) {
        *self.callback.write().await = Some(callback);
        self.consumers.notify_one();
        debug!(queue = self.def.name, "consumer registered");
    }

    pub(crate) async fn callback(&self) -> Option<Arc<dyn MessageCallback>> {
        self.callback.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::TransportError, transport::MockAmqpChannel};

    #[test]
    fn should_build_definition_from_settings() {
        let settings = QueueSettings {
            durable: true,
            exclusive: false,
            auto_delete: true,
            auto_ack: false,
            passive: false,
        };

        let def = QueueDefinition::from_settings("orders", &settings);

        assert_eq!(
            def,
            QueueDefinition::new("orders").durable().delete().manual_ack()
        );
    }

    #[test]
    fn should_default_to_auto_ack() {
        let def = QueueDefinition::new("orders");

        assert!(def.is_auto_ack());
        assert!(!def.is_durable());
        assert!(!def.is_exclusive());
        assert!(!def.is_auto_delete());
        assert!(!def.is_passive());
    }

    #[tokio::test]
    async fn should_declare_with_flags() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_queue()
            .withf(|def| def.name == "orders" && def.durable && !def.auto_ack)
            .times(1)
            .returning(|_| Ok(()));

        let queue = QueueManager::declare(
            &channel,
            "events",
            QueueDefinition::new("orders").durable().manual_ack(),
            Arc::default(),
        )
        .await
        .unwrap();

        assert_eq!(queue.name(), "orders");
        assert_eq!(queue.channel_name(), "events");
        assert!(queue.callback().await.is_none());
    }

    #[tokio::test]
    async fn should_signal_the_pump_on_registration() {
        struct Noop;

        #[async_trait]
        impl MessageCallback for Noop {
            async fn on_message(&self, _delivery: Delivery) {}
        }

        let mut channel = MockAmqpChannel::new();
        channel.expect_declare_queue().returning(|_| Ok(()));

        let consumers = Arc::new(Notify::new());
        let queue = QueueManager::declare(
            &channel,
            "events",
            QueueDefinition::new("orders"),
            consumers.clone(),
        )
        .await
        .unwrap();

        queue.basic_consumer(Arc::new(Noop)).await;

        tokio::time::timeout(std::time::Duration::from_secs(1), consumers.notified())
            .await
            .expect("registration was not signalled");
        assert!(queue.callback().await.is_some());
    }

    #[tokio::test]
    async fn should_report_declaration_failure() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_queue()
            .returning(|_| Err(TransportError::Broker("PRECONDITION_FAILED".to_owned())));

        let result = QueueManager::declare(
            &channel,
            "events",
            QueueDefinition::new("orders"),
            Arc::default(),
        )
        .await;

        assert_eq!(
            result.err(),
            Some(AmqpError::DeclareQueueError("orders".to_owned()))
        );
    }
}
