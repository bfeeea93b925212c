// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Dispatcher
//!
//! The inbound entry point. Every delivery is decoded and routed by its
//! action identifier:
//!
//! 1. the first registered [`ConsumerHandler`] whose prefix equals the first
//!    dot segment of the action receives it, with the remaining segments
//!    joined by `_` as the method name;
//! 2. if no prefix matched, or the matched handler has no such method, the
//!    exact action is looked up in the function table;
//! 3. otherwise the action is reported as unrouted with a single warning.
//!
//! Handlers are registered explicitly through [`DispatcherBuilder`].

use crate::{
    errors::{AmqpError, HandlerError},
    handler::{action_fn, split_action, ActionFn, ConsumerHandler, ConsumerMessage, Handled},
    otel,
    queue::MessageCallback,
    transport::Delivery,
};
use async_trait::async_trait;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use serde_json::Value;
use std::{borrow::Cow, collections::HashMap, future::Future, sync::Arc};
use tracing::{debug, error, info, warn};

/// Registers handlers and builds the [`ConsumerDispatcher`].
#[derive(Default)]
pub struct DispatcherBuilder {
    handlers: Vec<Arc<dyn ConsumerHandler>>,
    functions: HashMap<String, ActionFn>,
}

impl DispatcherBuilder {
    pub fn new() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// Adds a prefix handler. Handlers are matched in registration order.
    pub fn register_handler(mut self, handler: Arc<dyn ConsumerHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Binds a function to one exact action string, replacing any previous
    /// binding for it.
    pub fn register_function<F, Fut>(mut self, action: &str, f: F) -> Self
    where
        F: Fn(Arc<ConsumerMessage>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.functions.insert(action.to_owned(), action_fn(f));
        self
    }

    /// Fails with [`AmqpError::MissingLookupPrefix`] if a handler declares an
    /// empty prefix.
    pub fn build(self) -> Result<Arc<ConsumerDispatcher>, AmqpError> {
        if self.handlers.iter().any(|h| h.lookup_prefix().is_empty()) {
            error!("handler registered without lookup_prefix");
            return Err(AmqpError::MissingLookupPrefix);
        }

        Ok(Arc::new(ConsumerDispatcher {
            handlers: self.handlers,
            functions: self.functions,
            tracer: global::tracer("amqp consumer"),
        }))
    }
}

/// How a single delivery was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler or function processed the message.
    Handled,
    /// Nothing is registered for the action.
    Unrouted,
    /// The body is not valid JSON or the action is missing.
    Malformed,
    /// The handler returned an error.
    Failed,
}

/// Routes deliveries to the registered handlers and functions.
pub struct ConsumerDispatcher {
    handlers: Vec<Arc<dyn ConsumerHandler>>,
    functions: HashMap<String, ActionFn>,
    tracer: BoxedTracer,
}

impl ConsumerDispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// Decodes and routes one delivery. Never fails: every problem is
    /// logged, recorded on the span and reflected in the outcome.
    pub async fn dispatch(&self, delivery: &Delivery) -> DispatchOutcome {
        let action = delivery.action.clone().unwrap_or_default();
        let (ctx, mut span) = otel::new_span(&delivery.headers, &self.tracer, &delivery.queue, &action);

        info!(queue = delivery.queue, action, "consuming message");

        if action.is_empty() {
            let reason = "removing message from queue - reason: missing action";
            warn!(queue = delivery.queue, "{}", reason);
            span.set_status(Status::Error {
                description: Cow::from(reason),
            });
            return DispatchOutcome::Malformed;
        }

        let body = match serde_json::from_slice::<Value>(&delivery.data) {
            Ok(body) => body,
            Err(err) => {
                let err = AmqpError::ParsePayloadError(err.to_string());
                error!(error = err.to_string(), queue = delivery.queue, action, "error decoding msg");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("malformed payload"),
                });
                return DispatchOutcome::Malformed;
            }
        };

        let msg = Arc::new(
            ConsumerMessage::new(&delivery.queue, &action, body)
                .with_headers(delivery.headers.clone())
                .with_trace(ctx),
        );

        let outcome = match self.route(&action, msg).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(error = err.to_string(), action, "error handling msg");
                span.record_error(&*err);
                span.set_status(Status::Error {
                    description: Cow::from("handler failure"),
                });
                return DispatchOutcome::Failed;
            }
        };

        match outcome {
            DispatchOutcome::Unrouted => {
                warn!(queue = delivery.queue, action, "unrouted action, no handler registered");
                span.set_status(Status::Error {
                    description: Cow::from("unrouted action"),
                });
            }
            _ => {
                debug!(action, "message successfully processed");
                span.set_status(Status::Ok);
            }
        }

        outcome
    }

    async fn route(
        &self,
        action: &str,
        msg: Arc<ConsumerMessage>,
    ) -> Result<DispatchOutcome, HandlerError> {
        let (prefix, method) = split_action(action);

        if let Some(handler) = self.handlers.iter().find(|h| h.lookup_prefix() == prefix) {
            match handler.process_message(&method, msg.clone()).await? {
                Handled::Processed => return Ok(DispatchOutcome::Handled),
                Handled::NoMethod => {
                    debug!(prefix, method, "handler has no method, trying function table");
                }
            }
        }

        match self.functions.get(action) {
            Some(f) => f(msg).await.map(|_| DispatchOutcome::Handled),
            None => Ok(DispatchOutcome::Unrouted),
        }
    }
}

#[async_trait]
impl MessageCallback for ConsumerDispatcher {
    /// Dispatches and settles the delivery. On manual-ack queues a handled
    /// message is acked and any other outcome is dropped with a nack
    /// without requeue.
    async fn on_message(&self, delivery: Delivery) {
        let outcome = self.dispatch(&delivery).await;

        if !delivery.requires_ack() {
            return;
        }

        let settled = match outcome {
            DispatchOutcome::Handled => delivery.ack().await,
            _ => delivery.nack(false).await,
        };

        if let Err(err) = settled {
            error!(error = err.to_string(), queue = delivery.queue, "error settling msg");
        }
    }
}
