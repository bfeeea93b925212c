// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue and Channel Registry
//!
//! Name-indexed lookup of every declared queue and created channel. One
//! registry is built at startup and shared by the connection managers, the
//! channel managers and the publisher. Entries are written once per name and
//! read many times.

use crate::{channel::ChannelManager, errors::AmqpError, queue::QueueManager};
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};

/// Shared name index of queues and channels.
#[derive(Default)]
pub struct Registry {
    queues: RwLock<IndexMap<String, Arc<QueueManager>>>,
    channels: RwLock<IndexMap<String, Arc<ChannelManager>>>,
    declaring: Mutex<()>,
}

impl Registry {
    /// An empty registry, ready to be shared.
    pub fn new() -> Arc<Registry> {
        Arc::new(Registry::default())
    }

    /// Looks up a declared queue, naming the valid choices when unknown.
    pub async fn get_queue(&self, name: &str) -> Result<Arc<QueueManager>, AmqpError> {
        let queues = self.queues.read().await;

        queues
            .get(name)
            .cloned()
            .ok_or_else(|| AmqpError::UnknownQueue {
                name: name.to_owned(),
                choices: queues.keys().cloned().collect(),
            })
    }

    /// Looks up a declared queue without failing when unknown.
    pub async fn find_queue(&self, name: &str) -> Option<Arc<QueueManager>> {
        self.queues.read().await.get(name).cloned()
    }

    /// Names of every declared queue, in declaration order.
    pub async fn queue_names(&self) -> Vec<String> {
        self.queues.read().await.keys().cloned().collect()
    }

    /// Registers a queue; an existing entry with the same name wins.
    pub(crate) async fn insert_queue(&self, queue: Arc<QueueManager>) -> Arc<QueueManager> {
        self.queues
            .write()
            .await
            .entry(queue.name().to_owned())
            .or_insert(queue)
            .clone()
    }

    /// Looks up a created channel, naming the valid choices when unknown.
    pub async fn get_channel(&self, name: &str) -> Result<Arc<ChannelManager>, AmqpError> {
        let channels = self.channels.read().await;

        channels
            .get(name)
            .cloned()
            .ok_or_else(|| AmqpError::UnknownChannel {
                name: name.to_owned(),
                choices: channels.keys().cloned().collect(),
            })
    }

    /// The first channel created, used when a publish names no channel.
    pub async fn first_channel(&self) -> Result<Arc<ChannelManager>, AmqpError> {
        self.channels
            .read()
            .await
            .first()
            .map(|(_, channel)| channel.clone())
            .ok_or_else(|| AmqpError::UnknownChannel {
                name: String::new(),
                choices: vec![],
            })
    }

    /// Names of every created channel, in creation order.
    pub async fn channel_names(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }

    pub(crate) async fn insert_channel(&self, channel: Arc<ChannelManager>) -> Result<(), AmqpError> {
        let mut channels = self.channels.write().await;

        if channels.contains_key(channel.name()) {
            return Err(AmqpError::Configuration(format!(
                "channel `{}` is already registered",
                channel.name()
            )));
        }

        channels.insert(channel.name().to_owned(), channel);
        Ok(())
    }

    /// Serializes queue declarations so one name is never declared twice.
    pub(crate) async fn declaration_guard(&self) -> MutexGuard<'_, ()> {
        self.declaring.lock().await
    }
}
