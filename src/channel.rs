// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Management
//!
//! A `ChannelManager` wraps one logical channel bound to a connection. It
//! owns two transport channels: the consume channel, used by the channel's
//! pump and for queue declarations, and a publish-only channel so outbound
//! messages never interleave with a running consumer.

use crate::{
    config::ChannelSettings,
    connection::ConnectionManager,
    consumer,
    errors::AmqpError,
    otel,
    queue::{QueueDefinition, QueueManager},
    registry::Registry,
    transport::{AmqpChannel, OutboundMessage},
};
use indexmap::IndexMap;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, Notify, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A named channel with its consume and publish transport channels and the
/// queues it declared.
pub struct ChannelManager {
    name: String,
    settings: ChannelSettings,
    connection: Arc<ConnectionManager>,
    registry: Arc<Registry>,
    channel: RwLock<Arc<dyn AmqpChannel>>,
    publish_channel: Mutex<Arc<dyn AmqpChannel>>,
    queues: RwLock<IndexMap<String, Arc<QueueManager>>>,
    consumers: Arc<Notify>,
}

impl ChannelManager {
    pub(crate) fn new(
        name: &str,
        settings: ChannelSettings,
        connection: Arc<ConnectionManager>,
        registry: Arc<Registry>,
        channel: Arc<dyn AmqpChannel>,
        publish_channel: Arc<dyn AmqpChannel>,
    ) -> Arc<ChannelManager> {
        Arc::new(ChannelManager {
            name: name.to_owned(),
            settings,
            connection,
            registry,
            channel: RwLock::new(channel),
            publish_channel: Mutex::new(publish_channel),
            queues: RwLock::new(IndexMap::default()),
            consumers: Arc::new(Notify::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The connection this channel was opened on.
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Queue settings configured for this channel.
    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    /// Delay between reconnect attempts of this channel's pump.
    pub fn reconnect_cooldown(&self) -> Duration {
        self.connection.params().retry_delay
    }

    /// The current consume channel.
    pub async fn channel(&self) -> Arc<dyn AmqpChannel> {
        self.channel.read().await.clone()
    }

    /// Queues declared by this channel, in declaration order.
    pub async fn queues(&self) -> Vec<Arc<QueueManager>> {
        self.queues.read().await.values().cloned().collect()
    }

    /// Resolves once a consumer callback was registered on one of this
    /// channel's queues since the last call.
    pub(crate) async fn consumer_registered(&self) {
        self.consumers.notified().await
    }

    /// Declares the queue unless it already exists.
    ///
    /// Returns the instance from this channel's map first, then from the
    /// shared registry (a queue declared by another channel), and only then
    /// declares a new queue using the channel settings for that name.
    ///
    /// # Parameters
    /// * `queue_name` - The queue to declare
    ///
    /// # Returns
    /// The queue manager, or `DeclareQueueError` when the broker refuses the
    /// declaration
    pub async fn create_queue(&self, queue_name: &str) -> Result<Arc<QueueManager>, AmqpError> {
        if let Some(queue) = self.queues.read().await.get(queue_name) {
            return Ok(queue.clone());
        }

        let _declaring = self.registry.declaration_guard().await;

        if let Some(queue) = self.queues.read().await.get(queue_name) {
            return Ok(queue.clone());
        }

        if let Some(queue) = self.registry.find_queue(queue_name).await {
            debug!(
                queue = queue_name,
                owner = queue.channel_name(),
                "queue already declared by another channel"
            );
            return Ok(queue);
        }

        let settings = self
            .settings
            .queues
            .get(queue_name)
            .copied()
            .unwrap_or_default();
        let def = QueueDefinition::from_settings(queue_name, &settings);

        let channel = self.channel().await;
        let queue =
            QueueManager::declare(channel.as_ref(), &self.name, def, self.consumers.clone()).await?;

        self.queues
            .write()
            .await
            .insert(queue_name.to_owned(), queue.clone());

        Ok(self.registry.insert_queue(queue).await)
    }

    /// Publishes `body` as JSON to the `to` queue.
    ///
    /// Fire-and-forget: failures are logged and never returned.
    ///
    /// # Parameters
    /// * `action` - Action identifier carried in the message properties
    /// * `body` - Serialized as JSON
    /// * `to` - Destination queue, declared first when unknown
    pub async fn publish<T>(&self, action: &str, body: &T, to: &str)
    where
        T: Serialize + ?Sized,
    {
        let payload = match serde_json::to_vec(body) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = err.to_string(), action, "failure to serialize payload");
                return;
            }
        };

        if let Err(err) = self.publish_raw(action, payload, to).await {
            error!(
                error = err.to_string(),
                "Failed to publish message to {}", to
            );
        }
    }

    /// Publishes an encoded payload on the publish channel, declaring the
    /// destination first when no channel has declared it yet.
    pub(crate) async fn publish_raw(
        &self,
        action: &str,
        payload: Vec<u8>,
        to: &str,
    ) -> Result<(), AmqpError> {
        if self.registry.find_queue(to).await.is_none() {
            self.create_queue(to).await?;
        }

        let channel = self.publish_channel().await?;
        let message = OutboundMessage {
            action: action.to_owned(),
            message_id: Uuid::new_v4().to_string(),
            payload,
            headers: otel::inject_current_context(),
        };

        match channel.publish(to, message).await {
            Err(err) => {
                error!(error = err.to_string(), queue = to, "error publishing message");
                Err(AmqpError::PublishingError(to.to_owned()))
            }
            Ok(()) => {
                debug!(queue = to, action, "message published");
                Ok(())
            }
        }
    }

    /// The publish channel, reopened on the live connection when closed.
    async fn publish_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let mut slot = self.publish_channel.lock().await;

        if slot.is_open() {
            return Ok(slot.clone());
        }

        warn!(channel = self.name, "publish channel closed, reopening");
        let session = self.connection.get_connection().await?;
        let channel = session.open_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the publish channel");
            AmqpError::ChannelError(self.name.clone())
        })?;
        *slot = channel.clone();

        Ok(channel)
    }

    /// Rebuilds the consume channel on the live connection, reconnecting if
    /// needed, and re-declares every queue this channel owns. The previous
    /// consume channel is closed so none of its consumers stay subscribed.
    pub async fn reopen(&self) -> Result<(), AmqpError> {
        let session = self.connection.get_connection().await?;
        let channel = session.open_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to reopen the channel");
            AmqpError::ChannelError(self.name.clone())
        })?;

        for queue in self.queues().await {
            queue.redeclare(channel.as_ref()).await?;
        }

        let previous = std::mem::replace(&mut *self.channel.write().await, channel);
        if let Err(err) = previous.close().await {
            warn!(
                error = err.to_string(),
                channel = self.name,
                "error closing the previous channel"
            );
        }

        info!(channel = self.name, "channel reopened");

        Ok(())
    }

    /// Spawns the consume pump of this channel. The task runs until the
    /// token is cancelled.
    pub fn start_consuming(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        consumer::spawn(self.clone(), token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ConnectionParams, QueueSettings},
        errors::TransportError,
        transport::{MockAmqpChannel, MockSession, MockTransport, Session},
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn params(settings: ChannelSettings) -> ConnectionParams {
        let mut channels = IndexMap::new();
        channels.insert("events".to_owned(), settings);

        ConnectionParams {
            name: "default".to_owned(),
            host: "localhost".to_owned(),
            port: 5672,
            virtual_host: "/".to_owned(),
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            max_retries: 1,
            retry_delay: Duration::ZERO,
            heartbeat: 60,
            connection_timeout: Duration::from_secs(10),
            channels,
        }
    }

    fn consume_channel(declared: Arc<AtomicUsize>) -> MockAmqpChannel {
        let mut channel = MockAmqpChannel::new();
        channel.expect_is_open().return_const(true);
        channel.expect_declare_queue().returning(move |_| {
            declared.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        channel
    }

    async fn manager(
        settings: ChannelSettings,
        channel: MockAmqpChannel,
        publish_channel: MockAmqpChannel,
    ) -> Arc<ChannelManager> {
        let mut transport = MockTransport::new();
        transport.expect_connect().returning(|_| {
            let mut session = MockSession::new();
            session.expect_is_open().return_const(true);
            session.expect_open_channel().returning(|| {
                let mut channel = consume_channel(Arc::default());
                channel.expect_close().returning(|| Ok(()));
                Ok(Arc::new(channel) as Arc<dyn AmqpChannel>)
            });
            Ok(Arc::new(session) as Arc<dyn Session>)
        });

        let registry = Registry::new();
        let connection = Arc::new(ConnectionManager::new(
            params(settings.clone()),
            Arc::new(transport),
            registry.clone(),
        ));
        connection.connect().await.unwrap();

        let manager = ChannelManager::new(
            "events",
            settings,
            connection,
            registry.clone(),
            Arc::new(channel),
            Arc::new(publish_channel),
        );
        registry.insert_channel(manager.clone()).await.unwrap();
        manager
    }

    #[tokio::test]
    async fn should_declare_queue_once() {
        let declared = Arc::new(AtomicUsize::new(0));
        let manager = manager(
            ChannelSettings::default(),
            consume_channel(declared.clone()),
            MockAmqpChannel::new(),
        )
        .await;

        let first = manager.create_queue("orders").await.unwrap();
        let second = manager.create_queue("orders").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(declared.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(
            &manager.registry.get_queue("orders").await.unwrap(),
            &first
        ));
    }

    #[tokio::test]
    async fn should_declare_concurrent_requests_once() {
        let declared = Arc::new(AtomicUsize::new(0));
        let manager = manager(
            ChannelSettings::default(),
            consume_channel(declared.clone()),
            MockAmqpChannel::new(),
        )
        .await;

        let (a, b) = tokio::join!(manager.create_queue("orders"), manager.create_queue("orders"));

        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(declared.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_use_queue_settings_from_channel() {
        let mut settings = ChannelSettings::default();
        settings.queues.insert(
            "orders".to_owned(),
            QueueSettings {
                durable: true,
                auto_ack: false,
                ..QueueSettings::default()
            },
        );

        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_queue()
            .withf(|def| def.name == "orders" && def.durable && !def.auto_ack)
            .times(1)
            .returning(|_| Ok(()));

        let manager = manager(settings, channel, MockAmqpChannel::new()).await;

        let queue = manager.create_queue("orders").await.unwrap();

        assert!(!queue.definition().is_auto_ack());
    }

    #[tokio::test]
    async fn should_publish_on_publish_channel_only() {
        let declared = Arc::new(AtomicUsize::new(0));
        let mut consume = consume_channel(declared.clone());
        consume.expect_publish().never();

        let mut publish = MockAmqpChannel::new();
        publish.expect_is_open().return_const(true);
        publish
            .expect_publish()
            .withf(|key, msg| {
                key.to_string() == "orders"
                    && msg.action == "order.created"
                    && msg.payload == br#"{"id":7}"#.to_vec()
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let manager = manager(ChannelSettings::default(), consume, publish).await;

        manager
            .publish("order.created", &serde_json::json!({"id": 7}), "orders")
            .await;

        assert_eq!(declared.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_swallow_publish_failures() {
        let declared = Arc::new(AtomicUsize::new(0));
        let mut publish = MockAmqpChannel::new();
        publish.expect_is_open().return_const(true);
        publish
            .expect_publish()
            .times(2)
            .returning(|_, _| Err(TransportError::Broker("NOT_FOUND".to_owned())));

        let manager = manager(
            ChannelSettings::default(),
            consume_channel(declared),
            publish,
        )
        .await;

        manager
            .publish("order.created", &serde_json::json!({}), "orders")
            .await;

        assert_eq!(
            manager
                .publish_raw("order.created", vec![], "orders")
                .await
                .err(),
            Some(AmqpError::PublishingError("orders".to_owned()))
        );
    }

    #[tokio::test]
    async fn should_close_previous_channel_on_reopen() {
        let declared = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));

        let mut consume = consume_channel(declared.clone());
        consume.expect_close().times(1).returning({
            let closed = closed.clone();
            move || {
                closed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let manager = manager(ChannelSettings::default(), consume, MockAmqpChannel::new()).await;
        let before = manager.channel().await;
        manager.create_queue("orders").await.unwrap();

        manager.reopen().await.unwrap();

        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(!Arc::ptr_eq(&before, &manager.channel().await));
    }

    #[tokio::test]
    async fn should_reopen_even_if_previous_channel_fails_to_close() {
        let mut consume = consume_channel(Arc::default());
        consume
            .expect_close()
            .times(1)
            .returning(|| Err(TransportError::Closed));

        let manager = manager(ChannelSettings::default(), consume, MockAmqpChannel::new()).await;
        manager.create_queue("orders").await.unwrap();

        assert!(manager.reopen().await.is_ok());
    }
}
