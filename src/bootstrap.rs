// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Startup Wiring
//!
//! [`MessagingBuilder::start`] resolves the settings, connects every
//! configured connection, creates its channels, declares their queues bound
//! to the dispatcher and spawns one consume pump per channel. Configuration
//! and connection failures are returned and leave nothing running.
//!
//! ```no_run
//! use apexmq::{bootstrap::MessagingBuilder, config::Settings, handler::ActionTable};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), apexmq::errors::AmqpError> {
//! let settings = Settings::from_file("messaging.json")?;
//! let messaging = MessagingBuilder::new(settings)
//!     .register_handler(Arc::new(
//!         ActionTable::new("order").on("created", |msg| async move {
//!             println!("{}", msg.body());
//!             Ok(())
//!         }),
//!     ))
//!     .start()
//!     .await?;
//!
//! messaging.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::{
    amqp::LapinTransport,
    config::Settings,
    connection::ConnectionManager,
    dispatcher::{ConsumerDispatcher, DispatcherBuilder},
    errors::{AmqpError, HandlerError},
    events::ModelEvents,
    handler::{ConsumerHandler, ConsumerMessage},
    publisher::Publisher,
    registry::Registry,
    retry::Backoff,
    transport::Transport,
};
use std::{future::Future, sync::Arc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Collects settings and handlers, then starts the messaging layer.
pub struct MessagingBuilder {
    settings: Settings,
    transport: Option<Arc<dyn Transport>>,
    backoff: Backoff,
    dispatcher: DispatcherBuilder,
}

impl MessagingBuilder {
    /// # Parameters
    /// * `settings` - Connections with their channels and queues
    pub fn new(settings: Settings) -> MessagingBuilder {
        MessagingBuilder {
            settings,
            transport: None,
            backoff: Backoff::default(),
            dispatcher: DispatcherBuilder::new(),
        }
    }

    /// Replaces the default `lapin` transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Backoff between connection attempts for every connection.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Adds a prefix handler, see [`DispatcherBuilder::register_handler`].
    pub fn register_handler(mut self, handler: Arc<dyn ConsumerHandler>) -> Self {
        self.dispatcher = self.dispatcher.register_handler(handler);
        self
    }

    /// Binds a function to one exact action.
    pub fn register_function<F, Fut>(mut self, action: &str, f: F) -> Self
    where
        F: Fn(Arc<ConsumerMessage>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.dispatcher = self.dispatcher.register_function(action, f);
        self
    }

    /// Connects every configured connection, creates its channels and
    /// queues, subscribes the dispatcher to every queue and spawns one
    /// consume pump per channel.
    ///
    /// # Returns
    /// The running [`Messaging`], or the first configuration, connection or
    /// declaration error. On error everything started so far is shut down.
    pub async fn start(self) -> Result<Messaging, AmqpError> {
        let params = self.settings.resolve_all()?;
        let dispatcher = self.dispatcher.build()?;
        let transport = self
            .transport
            .unwrap_or_else(|| LapinTransport::new() as Arc<dyn Transport>);

        let registry = Registry::new();
        let mut messaging = Messaging {
            publisher: Publisher::new(registry.clone()),
            registry,
            connections: vec![],
            token: CancellationToken::new(),
            pumps: vec![],
        };

        for params in params {
            let connection = Arc::new(
                ConnectionManager::new(params, transport.clone(), messaging.registry.clone())
                    .with_backoff(self.backoff.clone()),
            );
            messaging.connections.push(connection.clone());

            if let Err(err) = messaging.wire(&connection, &dispatcher).await {
                error!(
                    error = err.to_string(),
                    connection = connection.name(),
                    "failure to start messaging"
                );
                messaging.shutdown().await;
                return Err(err);
            }
        }

        info!(
            connections = messaging.connections.len(),
            pumps = messaging.pumps.len(),
            "messaging started"
        );

        Ok(messaging)
    }
}

/// The running messaging layer.
pub struct Messaging {
    registry: Arc<Registry>,
    publisher: Publisher,
    connections: Vec<Arc<ConnectionManager>>,
    token: CancellationToken,
    pumps: Vec<JoinHandle<()>>,
}

impl Messaging {
    async fn wire(
        &mut self,
        connection: &Arc<ConnectionManager>,
        dispatcher: &Arc<ConsumerDispatcher>,
    ) -> Result<(), AmqpError> {
        connection.connect().await?;

        for (channel_name, settings) in &connection.params().channels {
            let channel = connection
                .create_channel(channel_name, settings.clone())
                .await?;

            for queue_name in settings.queues.keys() {
                let queue = channel.create_queue(queue_name).await?;
                queue.basic_consumer(dispatcher.clone()).await;
            }

            self.pumps
                .push(channel.start_consuming(self.token.child_token()));
        }

        Ok(())
    }

    /// A publisher over this layer's channels.
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Model hooks publishing through this layer.
    pub fn model_events(&self) -> ModelEvents {
        ModelEvents::new(self.publisher())
    }

    /// Every queue and channel created at startup or since.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The connection configured under `name`.
    pub fn connection(&self, name: &str) -> Option<&Arc<ConnectionManager>> {
        self.connections.iter().find(|c| c.name() == name)
    }

    /// Stops every pump, waits for them and closes the connections.
    pub async fn shutdown(self) {
        self.token.cancel();

        for pump in self.pumps {
            if let Err(err) = pump.await {
                error!(error = err.to_string(), "consume pump panicked");
            }
        }

        for connection in &self.connections {
            connection.close_connection().await;
        }

        info!("messaging stopped");
    }
}
