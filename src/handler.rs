// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! Two kinds of handlers receive decoded messages:
//!
//! - prefix handlers implement [`ConsumerHandler`] and claim every action
//!   whose first dot segment equals their `lookup_prefix`. [`ActionTable`] is
//!   the ready-made implementation: a typed table from the remaining segments
//!   (joined with `_`) to a handler function.
//! - function handlers are bound to one exact action string with
//!   [`crate::dispatcher::DispatcherBuilder::register_function`].

use crate::errors::{AmqpError, HandlerError, HandlerResult};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{collections::BTreeMap, collections::HashMap, future::Future, sync::Arc};

/// A decoded inbound message.
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    queue: String,
    action: String,
    body: Value,
    headers: BTreeMap<String, String>,
    trace: Context,
}

impl ConsumerMessage {
    pub fn new(queue: &str, action: &str, body: Value) -> ConsumerMessage {
        ConsumerMessage {
            queue: queue.to_owned(),
            action: action.to_owned(),
            body,
            headers: BTreeMap::default(),
            trace: Context::new(),
        }
    }

    pub(crate) fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub(crate) fn with_trace(mut self, trace: Context) -> Self {
        self.trace = trace;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Trace context propagated by the publisher.
    pub fn trace_context(&self) -> &Context {
        &self.trace
    }

    /// Deserializes the body into a typed payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        T::deserialize(&self.body).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }
}

/// Handler function bound to one action.
pub type ActionFn =
    Arc<dyn Fn(Arc<ConsumerMessage>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Boxes an async closure into an [`ActionFn`].
pub fn action_fn<F, Fut>(f: F) -> ActionFn
where
    F: Fn(Arc<ConsumerMessage>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(f(msg)))
}

/// Outcome of offering a message to a prefix handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Processed,
    /// The prefix matched but the handler has nothing for the method name.
    NoMethod,
}

/// A handler claiming every action that starts with its prefix.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// First dot segment of the actions this handler claims. Must not be
    /// empty.
    fn lookup_prefix(&self) -> &str;

    /// `method` is the action without its prefix, remaining segments joined
    /// with `_` (`"order.status.updated"` gives `"status_updated"`).
    async fn process_message(
        &self,
        method: &str,
        msg: Arc<ConsumerMessage>,
    ) -> Result<Handled, HandlerError>;
}

/// Splits an action into its prefix and method name.
pub fn split_action(action: &str) -> (&str, String) {
    let mut segments = action.split('.');
    let prefix = segments.next().unwrap_or_default();
    let method = segments.collect::<Vec<_>>().join("_");

    (prefix, method)
}

/// Typed dispatch table keyed by method name.
pub struct ActionTable {
    prefix: String,
    actions: HashMap<String, ActionFn>,
}

impl ActionTable {
    pub fn new(prefix: &str) -> ActionTable {
        ActionTable {
            prefix: prefix.to_owned(),
            actions: HashMap::default(),
        }
    }

    /// Binds a method. Dotted names are accepted: `"status.updated"` and
    /// `"status_updated"` are the same method. The empty name handles
    /// actions made of the prefix alone.
    pub fn on<F, Fut>(mut self, method: &str, f: F) -> Self
    where
        F: Fn(Arc<ConsumerMessage>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.actions.insert(method.replace('.', "_"), action_fn(f));
        self
    }

    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }
}

#[async_trait]
impl ConsumerHandler for ActionTable {
    fn lookup_prefix(&self) -> &str {
        &self.prefix
    }

    async fn process_message(
        &self,
        method: &str,
        msg: Arc<ConsumerMessage>,
    ) -> Result<Handled, HandlerError> {
        match self.actions.get(method) {
            Some(f) => f(msg).await.map(|_| Handled::Processed),
            None => Ok(Handled::NoMethod),
        }
    }
}
