// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Management
//!
//! `ConnectionManager` owns one logical broker connection per configured
//! name. Dialing is retried according to a [`RetryPolicy`], every attempt is
//! bounded by the connection timeout, and reconnection is single-flight: the
//! session slot is guarded by an async mutex held for the whole dial, so
//! concurrent callers that find the session stale wait for one reconnect and
//! share its result.

use crate::{
    channel::ChannelManager,
    config::{ChannelSettings, ConnectionParams},
    errors::{AmqpError, TransportError},
    registry::Registry,
    retry::{Backoff, RetryPolicy},
    transport::{Session, Transport},
};
use std::sync::Arc;
use tokio::{
    sync::Mutex,
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

/// One named broker connection and its retry policy.
pub struct ConnectionManager {
    params: ConnectionParams,
    transport: Arc<dyn Transport>,
    registry: Arc<Registry>,
    retry: RetryPolicy,
    session: Mutex<Option<Arc<dyn Session>>>,
}

impl ConnectionManager {
    /// Creates a disconnected manager. Nothing is dialed until
    /// [`ConnectionManager::connect`].
    ///
    /// # Parameters
    /// * `params` - Resolved settings of the connection
    /// * `transport` - Client used to dial the broker
    /// * `registry` - Shared registry channels are added to
    pub fn new(
        params: ConnectionParams,
        transport: Arc<dyn Transport>,
        registry: Arc<Registry>,
    ) -> ConnectionManager {
        ConnectionManager {
            retry: RetryPolicy::from_params(&params),
            params,
            transport,
            registry,
            session: Mutex::new(None),
        }
    }

    /// Replaces the default fixed-delay strategy between attempts.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.retry = self.retry.with_backoff(backoff);
        self
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    /// Resolved settings this connection dials with.
    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Dials the broker.
    ///
    /// A live session is kept and returned as is. A stale one is closed
    /// before dialing again.
    ///
    /// # Returns
    /// The connected session, or `ConnectionFailure` once every attempt
    /// allowed by the retry policy failed
    pub async fn connect(&self) -> Result<Arc<dyn Session>, AmqpError> {
        self.get_connection().await
    }

    /// Returns the live session, reconnecting when absent or closed.
    ///
    /// Concurrent callers finding the session stale wait for a single
    /// reconnect and share its result.
    pub async fn get_connection(&self) -> Result<Arc<dyn Session>, AmqpError> {
        let mut slot = self.session.lock().await;

        if let Some(session) = slot.as_ref() {
            if session.is_open() {
                return Ok(session.clone());
            }
        }

        if let Some(stale) = slot.take() {
            warn!(connection = self.params.name, "connection closed, reconnecting");
            if let Err(err) = stale.close().await {
                debug!(
                    error = err.to_string(),
                    connection = self.params.name,
                    "error closing stale connection"
                );
            }
        }

        let session = self.dial().await?;
        *slot = Some(session.clone());

        Ok(session)
    }

    /// Whether a live session is currently held.
    pub async fn is_connected(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|session| session.is_open())
    }

    async fn dial(&self) -> Result<Arc<dyn Session>, AmqpError> {
        let attempts = self.retry.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(
                connection = self.params.name,
                attempt, attempts, "connecting to message broker"
            );

            let result = match timeout(
                self.params.connection_timeout,
                self.transport.connect(&self.params),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(self.params.connection_timeout)),
            };

            match result {
                Ok(session) => {
                    info!(
                        connection = self.params.name,
                        "Connected to RabbitMQ: {}", self.params.name
                    );
                    return Ok(session);
                }
                Err(err) if attempt >= attempts => {
                    error!(
                        error = err.to_string(),
                        connection = self.params.name,
                        attempts,
                        "max connection attempts reached"
                    );
                    return Err(AmqpError::ConnectionFailure {
                        name: self.params.name.clone(),
                        attempts,
                        source: err,
                    });
                }
                Err(err) => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        error = err.to_string(),
                        connection = self.params.name,
                        attempt,
                        attempts,
                        "failure to connect, retrying in {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Opens a consume channel and a dedicated publish channel on the live
    /// session and registers the resulting manager.
    pub async fn create_channel(
        self: &Arc<Self>,
        channel_name: &str,
        settings: ChannelSettings,
    ) -> Result<Arc<ChannelManager>, AmqpError> {
        let session = match self.session.lock().await.as_ref() {
            Some(session) if session.is_open() => session.clone(),
            _ => return Err(AmqpError::NotConnected(self.params.name.clone())),
        };

        let open = |err: TransportError| {
            error!(
                error = err.to_string(),
                channel = channel_name,
                "error to create the channel"
            );
            AmqpError::ChannelError(channel_name.to_owned())
        };

        let channel = session.open_channel().await.map_err(open)?;
        let publish_channel = session.open_channel().await.map_err(open)?;

        let manager = ChannelManager::new(
            channel_name,
            settings,
            self.clone(),
            self.registry.clone(),
            channel,
            publish_channel,
        );
        self.registry.insert_channel(manager.clone()).await?;

        info!(channel = channel_name, "Channel {} created.", channel_name);
        Ok(manager)
    }

    /// Closes the live session. Calling it again is a no-op.
    pub async fn close_connection(&self) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };

        match session.close().await {
            Ok(()) => info!(connection = self.params.name, "RabbitMQ connection closed"),
            Err(err) => warn!(
                error = err.to_string(),
                connection = self.params.name,
                "error closing connection"
            ),
        }
    }
}
