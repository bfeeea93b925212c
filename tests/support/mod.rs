// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker backing the integration tests.

#![allow(dead_code)]

use apexmq::{
    config::{ConnectionParams, Settings},
    errors::TransportError,
    queue::QueueDefinition,
    transport::{
        Acknowledger, AmqpChannel, Delivery, DeliveryStream, OutboundMessage, Session, Transport,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<OutboundMessage>>,
    published: Vec<(String, OutboundMessage)>,
    settled: Vec<(String, String)>,
    epochs: HashMap<String, u64>,
    connects: HashMap<String, usize>,
}

impl MemoryBroker {
    pub fn new() -> Arc<MemoryBroker> {
        Arc::new(MemoryBroker::default())
    }

    pub fn transport(self: &Arc<Self>) -> Arc<dyn Transport> {
        Arc::new(MemoryTransport {
            broker: self.clone(),
        })
    }

    /// Messages published to `queue`, in order.
    pub fn published_to(&self, queue: &str) -> Vec<OutboundMessage> {
        self.lock()
            .published
            .iter()
            .filter(|(key, _)| key == queue)
            .map(|(_, msg)| msg.clone())
            .collect()
    }

    pub fn published_queues(&self) -> Vec<String> {
        self.lock()
            .published
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn declared(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn connects(&self, name: &str) -> usize {
        self.lock().connects.get(name).copied().unwrap_or_default()
    }

    /// `(action, "ack" | "nack:<requeue>")` for every settled delivery.
    pub fn settled(&self) -> Vec<(String, String)> {
        self.lock().settled.clone()
    }

    /// Invalidates every session of the named connection, as a broker
    /// restart or network partition would.
    pub fn drop_connection(&self, name: &str) {
        *self.lock().epochs.entry(name.to_owned()).or_default() += 1;
    }

    fn epoch(&self, name: &str) -> u64 {
        self.lock().epochs.get(name).copied().unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

struct MemoryTransport {
    broker: Arc<MemoryBroker>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn Session>, TransportError> {
        *self
            .broker
            .lock()
            .connects
            .entry(params.name.clone())
            .or_default() += 1;

        Ok(Arc::new(MemorySession {
            link: Arc::new(Link {
                broker: self.broker.clone(),
                name: params.name.clone(),
                epoch: self.broker.epoch(&params.name),
                closed: AtomicBool::new(false),
            }),
        }))
    }
}

struct Link {
    broker: Arc<MemoryBroker>,
    name: String,
    epoch: u64,
    closed: AtomicBool,
}

impl Link {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.broker.epoch(&self.name) == self.epoch
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

struct MemorySession {
    link: Arc<Link>,
}

#[async_trait]
impl Session for MemorySession {
    fn is_open(&self) -> bool {
        self.link.is_open()
    }

    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, TransportError> {
        self.link.check()?;

        Ok(Arc::new(MemoryChannel {
            link: self.link.clone(),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.link.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryChannel {
    link: Arc<Link>,
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.link.is_open()
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), TransportError> {
        self.link.check()?;
        self.link
            .broker
            .lock()
            .queues
            .entry(def.name().to_owned())
            .or_default();

        Ok(())
    }

    async fn publish(
        &self,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        self.link.check()?;

        let mut state = self.link.broker.lock();
        state
            .published
            .push((routing_key.to_owned(), message.clone()));

        // the default exchange drops messages for undeclared queues
        if let Some(queue) = state.queues.get_mut(routing_key) {
            queue.push_back(message);
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, TransportError> {
        self.link.check()?;

        let seed = (self.link.clone(), queue.to_owned(), false);
        let deliveries = stream::unfold(seed, move |(link, queue, done)| async move {
            if done {
                return None;
            }

            loop {
                if !link.is_open() {
                    return Some((Err(TransportError::Closed), (link, queue, true)));
                }

                let next = link
                    .broker
                    .lock()
                    .queues
                    .get_mut(&queue)
                    .and_then(VecDeque::pop_front);

                if let Some(msg) = next {
                    let mut delivery = Delivery::new(&queue, Some(msg.action.clone()), msg.payload)
                        .with_headers(msg.headers);

                    if !no_ack {
                        delivery = delivery.with_acker(Arc::new(MemoryAcker {
                            broker: link.broker.clone(),
                            action: msg.action,
                        }));
                    }

                    return Some((Ok(delivery), (link, queue, false)));
                }

                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        Ok(deliveries.boxed())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct MemoryAcker {
    broker: Arc<MemoryBroker>,
    action: String,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.broker
            .lock()
            .settled
            .push((self.action.clone(), "ack".to_owned()));
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        self.broker
            .lock()
            .settled
            .push((self.action.clone(), format!("nack:{requeue}")));
        Ok(())
    }
}

pub fn settings(value: serde_json::Value) -> Settings {
    Settings::from_value(value).unwrap()
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn eventually<F>(condition: F)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
