// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Model Change Hooks
//!
//! Bridges an external persistence layer to the publisher. The application
//! registers a [`ModelHook`] per model and event, then calls
//! [`ModelEvents::notify`] with the changed record once the change is
//! committed. Each matching hook builds a body from its named fields and
//! publishes it. Failures are logged so the originating write never fails
//! because of a notification.

use crate::publisher::{Destination, Publisher};
use serde_json::{Map, Value};
use std::{collections::HashMap, fmt};
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelEvent {
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for ModelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelEvent::Created => write!(f, "created"),
            ModelEvent::Updated => write!(f, "updated"),
            ModelEvent::Deleted => write!(f, "deleted"),
        }
    }
}

/// What to publish when a model event fires.
#[derive(Debug, Clone)]
pub struct ModelHook {
    to: Destination,
    action: Option<String>,
    fields: Vec<String>,
    channel: Option<String>,
}

impl ModelHook {
    pub fn new(to: Destination) -> ModelHook {
        ModelHook {
            to,
            action: None,
            fields: vec![],
            channel: None,
        }
    }

    /// Overrides the default `"<model>.<event>"` action.
    pub fn action(mut self, action: &str) -> Self {
        self.action = Some(action.to_owned());
        self
    }

    /// Restricts the body to these record fields. Absent fields are sent as
    /// `null`.
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn channel(mut self, channel: &str) -> Self {
        self.channel = Some(channel.to_owned());
        self
    }

    fn action_for(&self, model: &str, event: ModelEvent) -> String {
        self.action
            .clone()
            .unwrap_or_else(|| format!("{model}.{event}"))
    }

    fn body(&self, record: &Value) -> Value {
        if self.fields.is_empty() {
            return record.clone();
        }

        let body: Map<String, Value> = self
            .fields
            .iter()
            .map(|field| {
                let value = record.get(field).cloned().unwrap_or(Value::Null);
                (field.clone(), value)
            })
            .collect();

        Value::Object(body)
    }
}

pub struct ModelEvents {
    publisher: Publisher,
    hooks: HashMap<(String, ModelEvent), Vec<ModelHook>>,
}

impl ModelEvents {
    pub fn new(publisher: Publisher) -> ModelEvents {
        ModelEvents {
            publisher,
            hooks: HashMap::default(),
        }
    }

    pub fn on_model_create(&mut self, model: &str, hook: ModelHook) -> &mut Self {
        self.register(model, ModelEvent::Created, hook)
    }

    pub fn on_model_update(&mut self, model: &str, hook: ModelHook) -> &mut Self {
        self.register(model, ModelEvent::Updated, hook)
    }

    pub fn on_model_delete(&mut self, model: &str, hook: ModelHook) -> &mut Self {
        self.register(model, ModelEvent::Deleted, hook)
    }

    fn register(&mut self, model: &str, event: ModelEvent, hook: ModelHook) -> &mut Self {
        self.hooks
            .entry((model.to_owned(), event))
            .or_default()
            .push(hook);
        self
    }

    /// Publishes `record` through every hook registered for the model and
    /// event. Returns the number of hooks fired.
    pub async fn notify(&self, model: &str, event: ModelEvent, record: &Value) -> usize {
        let Some(hooks) = self.hooks.get(&(model.to_owned(), event)) else {
            debug!(model, %event, "no hook registered");
            return 0;
        };

        for hook in hooks {
            let action = hook.action_for(model, event);
            let body = hook.body(record);

            if let Err(err) = self
                .publisher
                .publish(&action, &body, &hook.to, hook.channel.as_deref())
                .await
            {
                error!(error = err.to_string(), model, action, "error publishing model event");
            }
        }

        hooks.len()
    }
}
