// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

pub mod amqp;
pub mod bootstrap;
pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod transport;
