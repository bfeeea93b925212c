// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! The outbound entry point. A publish resolves the channel (by name, or the
//! first channel created), encodes the body as JSON once and sends it to
//! every destination queue through the channel's publish-only channel.
//!
//! Only lookup and encoding problems are returned to the caller. Transport
//! failures for a destination are logged and the remaining destinations
//! are still attempted, so event producers never fail because a
//! notification could not be delivered.

use crate::{errors::AmqpError, registry::Registry};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};

/// Where a message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// The listed queues, in order.
    Queues(Vec<String>),
    /// Every queue in the registry at publish time.
    Broadcast,
}

impl Destination {
    /// A single queue.
    pub fn queue(name: &str) -> Destination {
        Destination::Queues(vec![name.to_owned()])
    }

    /// Several queues, published to in the given order.
    pub fn queues<I, S>(names: I) -> Destination
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Destination::Queues(names.into_iter().map(Into::into).collect())
    }
}

/// Publishes JSON messages through the channels of a [`Registry`].
///
/// Cheap to clone, every clone shares the same registry.
#[derive(Clone)]
pub struct Publisher {
    registry: Arc<Registry>,
}

impl Publisher {
    pub fn new(registry: Arc<Registry>) -> Publisher {
        Publisher { registry }
    }

    /// Publishes `body` under `action` to `to`.
    ///
    /// # Parameters
    /// * `action` - Action identifier the consumer routes on
    /// * `body` - Any serializable value, encoded as JSON once
    /// * `to` - The destination queues or a broadcast
    /// * `channel_name` - Channel whose publish channel is used, `None` for
    ///   the first channel created
    ///
    /// # Returns
    /// `UnknownChannel` or `SerializePayloadError`. Per-queue transport
    /// failures are only logged.
    pub async fn publish<T>(
        &self,
        action: &str,
        body: &T,
        to: &Destination,
        channel_name: Option<&str>,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let channel = match channel_name {
            Some(name) => self.registry.get_channel(name).await?,
            None => self.registry.first_channel().await?,
        };

        let payload = serde_json::to_vec(body).map_err(|err| {
            error!(error = err.to_string(), action, "failure to serialize payload");
            AmqpError::SerializePayloadError(err.to_string())
        })?;

        let queues = match to {
            Destination::Queues(queues) => queues.clone(),
            Destination::Broadcast => self.registry.queue_names().await,
        };

        debug!(action, channel = channel.name(), ?queues, "publishing message");

        for queue in &queues {
            if let Err(err) = channel.publish_raw(action, payload.clone(), queue).await {
                error!(
                    error = err.to_string(),
                    "Failed to publish message to {}", queue
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn should_build_destinations() {
        assert_eq!(
            Destination::queue("orders"),
            Destination::Queues(vec!["orders".to_owned()])
        );
        assert_eq!(
            Destination::queues(["q1", "q2"]),
            Destination::Queues(vec!["q1".to_owned(), "q2".to_owned()])
        );
    }

    #[tokio::test]
    async fn should_name_choices_for_unknown_channel() {
        let publisher = Publisher::new(Registry::new());

        let result = publisher
            .publish("order.created", &json!({}), &Destination::Broadcast, Some("events"))
            .await;

        assert_eq!(
            result.err(),
            Some(AmqpError::UnknownChannel {
                name: "events".to_owned(),
                choices: vec![],
            })
        );
    }

    #[tokio::test]
    async fn should_require_a_channel() {
        let publisher = Publisher::new(Registry::new());

        let result = publisher
            .publish("order.created", &json!({}), &Destination::queue("orders"), None)
            .await;

        assert!(matches!(result, Err(AmqpError::UnknownChannel { .. })));
    }
}
