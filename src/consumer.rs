// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consume Pump
//!
//! One task per channel. The pump subscribes every queue of the channel that
//! has a registered callback, merges their delivery streams and hands each
//! delivery to its callback in arrival order. Queues that get a callback
//! while the pump runs are subscribed as soon as it is registered. A
//! callback that panics loses only its own delivery: it is logged, nacked on
//! manual-ack queues, and consumption continues. When the channel breaks the
//! pump waits the connection's retry delay, reopens the channel (reconnecting
//! if needed), re-declares its queues and subscribes again. Cancellation is
//! observed between deliveries and during every wait.

use crate::{
    channel::ChannelManager,
    errors::{AmqpError, TransportError},
    queue::{MessageCallback, QueueManager},
    transport::{AmqpChannel, Delivery},
};
use futures_util::{
    future::FutureExt,
    stream::{self, BoxStream, SelectAll},
    StreamExt,
};
use std::{collections::HashSet, panic::AssertUnwindSafe, sync::Arc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One stream item: the source queue, its callback and the next delivery,
/// or `None` once the broker stopped the consumer.
type Inbound = (
    Arc<QueueManager>,
    Arc<dyn MessageCallback>,
    Option<Result<Delivery, TransportError>>,
);

pub(crate) fn spawn(channel: Arc<ChannelManager>, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(channel = channel.name(), "consume pump started");

        loop {
            match pump(&channel, &token).await {
                Ok(()) => break,
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        channel = channel.name(),
                        "consume pump interrupted"
                    );
                }
            }

            if !recover(&channel, &token).await {
                break;
            }
        }

        info!(channel = channel.name(), "consume pump stopped");
    })
}

/// Consumes until cancelled (`Ok`) or until the channel breaks (`Err`).
async fn pump(channel: &ChannelManager, token: &CancellationToken) -> Result<(), AmqpError> {
    let amqp = channel.channel().await;
    let mut subscribed = HashSet::new();
    let mut deliveries = SelectAll::new();

    subscribe(channel, amqp.as_ref(), &mut subscribed, &mut deliveries).await?;

    if deliveries.is_empty() {
        debug!(channel = channel.name(), "no consumers registered yet");
    }

    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = channel.consumer_registered() => {
                subscribe(channel, amqp.as_ref(), &mut subscribed, &mut deliveries).await?;
            }
            Some((queue, callback, next)) = deliveries.next(), if !deliveries.is_empty() => match next {
                Some(Ok(delivery)) => deliver(queue.name(), callback.as_ref(), delivery).await,
                Some(Err(err)) => return Err(AmqpError::ConsumerError(err.to_string())),
                None => {
                    return Err(AmqpError::ConsumerError(format!(
                        "consumer of {} was cancelled",
                        queue.name()
                    )))
                }
            },
        }
    }
}

/// Binds a consumer for every queue of the channel that has a callback and
/// is not consumed yet.
async fn subscribe(
    channel: &ChannelManager,
    amqp: &dyn AmqpChannel,
    subscribed: &mut HashSet<String>,
    deliveries: &mut SelectAll<BoxStream<'static, Inbound>>,
) -> Result<(), AmqpError> {
    for queue in channel.queues().await {
        if subscribed.contains(queue.name()) {
            continue;
        }

        let Some(callback) = queue.callback().await else {
            continue;
        };

        let tag = format!("{}-{}", queue.name(), Uuid::new_v4());
        let no_ack = queue.definition().is_auto_ack();

        let consumer = amqp
            .consume(queue.name(), &tag, no_ack)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue = queue.name(), "error to create the consumer");
                AmqpError::BindingConsumerError(queue.name().to_owned())
            })?;

        debug!(queue = queue.name(), consumer = tag, "consumer bound");
        subscribed.insert(queue.name().to_owned());

        let end = (queue.clone(), callback.clone(), None);
        deliveries.push(
            consumer
                .map(move |item| (queue.clone(), callback.clone(), Some(item)))
                .chain(stream::once(async move { end }))
                .boxed(),
        );
    }

    Ok(())
}

/// Runs the callback for one delivery, containing any panic it raises.
async fn deliver(queue: &str, callback: &dyn MessageCallback, delivery: Delivery) {
    let settle = delivery.clone();

    let Err(panic) = AssertUnwindSafe(callback.on_message(delivery))
        .catch_unwind()
        .await
    else {
        return;
    };

    let reason = panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown");

    error!(
        queue,
        action = settle.action.as_deref().unwrap_or_default(),
        reason,
        "consumer callback panicked, dropping message"
    );

    if settle.requires_ack() {
        if let Err(err) = settle.nack(false).await {
            error!(error = err.to_string(), queue, "error settling msg");
        }
    }
}

/// Waits the cooldown and reopens the channel until it succeeds. Returns
/// `false` when cancelled first.
async fn recover(channel: &ChannelManager, token: &CancellationToken) -> bool {
    loop {
        tokio::select! {
            _ = token.cancelled() => return false,
            _ = tokio::time::sleep(channel.reconnect_cooldown()) => {}
        }

        let reopened = tokio::select! {
            _ = token.cancelled() => return false,
            reopened = channel.reopen() => reopened,
        };

        match reopened {
            Ok(()) => return true,
            Err(err) => error!(
                error = err.to_string(),
                channel = channel.name(),
                "error reconnecting, retrying after cooldown"
            ),
        }
    }
}
