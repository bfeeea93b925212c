// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Settings
//!
//! The settings tree maps connection names to broker parameters, each
//! connection to its channels and each channel to its queues:
//!
//! ```json
//! {
//!   "default": {
//!     "HOST": "localhost", "PORT": 5672, "VIRTUAL_HOST": "/",
//!     "USER": "guest", "PASSWORD": "guest",
//!     "MAX_RETRIES": 5, "RETRY_DELAY": 5, "HEARTBEAT": 60, "CONNECTION_TIMEOUT": 10,
//!     "CHANNELS": {
//!       "events": { "QUEUES": { "orders": { "DURABLE": true, "AUTO_ACK": false } } }
//!     }
//!   }
//! }
//! ```
//!
//! Missing optional keys fall back to defaults. `USER` and `PASSWORD` are
//! required and their absence is reported when the connection parameters are
//! resolved, before any dial is attempted.

use crate::errors::AmqpError;
use indexmap::IndexMap;
use serde::Deserialize;
use std::{path::Path, time::Duration};

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 5672;
const DEFAULT_VIRTUAL_HOST: &str = "/";
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_RETRY_DELAY_SECS: f64 = 5.0;
const DEFAULT_HEARTBEAT_SECS: u16 = 60;
const DEFAULT_CONNECTION_TIMEOUT_SECS: f64 = 10.0;

/// Raw settings tree, keyed by connection name in declaration order.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Settings {
    connections: IndexMap<String, ConnectionSettings>,
}

/// Settings of a single connection as they appear in the settings source.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ConnectionSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds; fractional values are accepted.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat: u16,
    /// Seconds; fractional values are accepted.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: f64,
    #[serde(default)]
    pub channels: IndexMap<String, ChannelSettings>,
}

/// Queues declared on a channel, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ChannelSettings {
    #[serde(default)]
    pub queues: IndexMap<String, QueueSettings>,
}

/// Declaration and acknowledgement flags of one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct QueueSettings {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub auto_ack: bool,
    pub passive: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            durable: false,
            exclusive: false,
            auto_delete: false,
            auto_ack: true,
            passive: false,
        }
    }
}

/// Validated connection parameters. Immutable once resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionParams {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    pub user: String,
    pub password: String,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub heartbeat: u16,
    pub connection_timeout: Duration,
    pub channels: IndexMap<String, ChannelSettings>,
}

fn default_host() -> String {
    DEFAULT_HOST.to_owned()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_virtual_host() -> String {
    DEFAULT_VIRTUAL_HOST.to_owned()
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay() -> f64 {
    DEFAULT_RETRY_DELAY_SECS
}

fn default_heartbeat() -> u16 {
    DEFAULT_HEARTBEAT_SECS
}

fn default_connection_timeout() -> f64 {
    DEFAULT_CONNECTION_TIMEOUT_SECS
}

impl Settings {
    /// Parses the settings tree from a JSON document.
    pub fn from_json_str(raw: &str) -> Result<Settings, AmqpError> {
        serde_json::from_str(raw).map_err(|err| AmqpError::Configuration(err.to_string()))
    }

    /// Builds the settings tree from an already parsed JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Settings, AmqpError> {
        serde_json::from_value(value).map_err(|err| AmqpError::Configuration(err.to_string()))
    }

    /// Reads and parses a JSON settings file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Settings, AmqpError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            AmqpError::Configuration(format!("failure to read `{}`: {}", path.display(), err))
        })?;

        Settings::from_json_str(&raw)
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connection names in declaration order.
    pub fn connection_names(&self) -> Vec<String> {
        self.connections.keys().cloned().collect()
    }

    /// Resolves and validates the parameters of the named connection.
    pub fn connection_params(&self, name: &str) -> Result<ConnectionParams, AmqpError> {
        let Some(raw) = self.connections.get(name) else {
            return Err(AmqpError::Configuration(format!(
                "connection `{}` is not defined, your choices are {:?}",
                name,
                self.connection_names()
            )));
        };

        raw.resolve(name)
    }

    /// Resolves every configured connection, failing on the first invalid one.
    pub fn resolve_all(&self) -> Result<Vec<ConnectionParams>, AmqpError> {
        if self.is_empty() {
            return Err(AmqpError::Configuration(
                "messaging connection settings are not provided".to_owned(),
            ));
        }

        self.connections
            .iter()
            .map(|(name, raw)| raw.resolve(name))
            .collect()
    }
}

impl ConnectionSettings {
    fn resolve(&self, name: &str) -> Result<ConnectionParams, AmqpError> {
        let user = required(name, "USER", &self.user)?;
        let password = required(name, "PASSWORD", &self.password)?;

        Ok(ConnectionParams {
            name: name.to_owned(),
            host: self.host.clone(),
            port: self.port,
            virtual_host: self.virtual_host.clone(),
            user,
            password,
            max_retries: self.max_retries,
            retry_delay: seconds(name, "RETRY_DELAY", self.retry_delay)?,
            heartbeat: self.heartbeat,
            connection_timeout: seconds(name, "CONNECTION_TIMEOUT", self.connection_timeout)?,
            channels: self.channels.clone(),
        })
    }
}

fn required(connection: &str, key: &str, value: &Option<String>) -> Result<String, AmqpError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v.clone()),
        _ => Err(AmqpError::Configuration(format!(
            "connection `{}` is missing `{}`",
            connection, key
        ))),
    }
}

fn seconds(connection: &str, key: &str, value: f64) -> Result<Duration, AmqpError> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        AmqpError::Configuration(format!(
            "connection `{}` has an invalid `{}`: {}",
            connection, key, value
        ))
    })
}

impl ConnectionParams {
    /// Settings of a queue declared under the given channel, if any.
    pub fn queue_settings(&self, channel: &str, queue: &str) -> Option<QueueSettings> {
        self.channels
            .get(channel)
            .and_then(|ch| ch.queues.get(queue))
            .copied()
    }
}
