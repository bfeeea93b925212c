// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # lapin Transport
//!
//! Production implementation of the [`crate::transport`] traits on top of
//! `lapin`. The action identifier travels in the `content_type` property and
//! is mirrored in `type`, string headers carry the trace context.

use crate::{
    config::ConnectionParams,
    errors::TransportError,
    queue::QueueDefinition,
    transport::{
        AmqpChannel, Acknowledger, Delivery, DeliveryStream, OutboundMessage, Session, Transport,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    uri::{AMQPAuthority, AMQPQueryString, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Dials the broker with `lapin`.
#[derive(Debug, Default, Clone)]
pub struct LapinTransport;

impl LapinTransport {
    pub fn new() -> Arc<LapinTransport> {
        Arc::new(LapinTransport)
    }
}

fn amqp_uri(params: &ConnectionParams) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: params.user.clone(),
                password: params.password.clone(),
            },
            host: params.host.clone(),
            port: params.port,
        },
        vhost: params.virtual_host.clone(),
        query: AMQPQueryString {
            heartbeat: Some(params.heartbeat),
            connection_timeout: Some(params.connection_timeout.as_millis() as u64),
            ..AMQPQueryString::default()
        },
        ..AMQPUri::default()
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn Session>, TransportError> {
        debug!(connection = params.name, "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(params.name.clone()));

        let conn = match Connection::connect_uri(amqp_uri(params), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(TransportError::from(err))
            }
        }?;
        debug!(connection = params.name, "amqp connected");

        Ok(Arc::new(LapinSession { conn }))
    }
}

pub struct LapinSession {
    conn: Connection,
}

#[async_trait]
impl Session for LapinSession {
    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, TransportError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(TransportError::from(err))
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.is_open() {
            return Ok(());
        }

        self.conn
            .close(0, "closing connection")
            .await
            .map_err(TransportError::from)
    }
}

pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), TransportError> {
        self.channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(TransportError::from)
    }

    async fn publish(
        &self,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        let headers: BTreeMap<ShortString, AMQPValue> = message
            .headers
            .into_iter()
            .map(|(k, v)| (ShortString::from(k), AMQPValue::LongString(LongString::from(v))))
            .collect();

        self.channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &message.payload,
                BasicProperties::default()
                    .with_content_type(ShortString::from(message.action.clone()))
                    .with_type(ShortString::from(message.action))
                    .with_message_id(ShortString::from(message.message_id))
                    .with_headers(FieldTable::from(headers)),
            )
            .await
            .map(|_confirm| ())
            .map_err(TransportError::from)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(TransportError::from)?;

        let queue = queue.to_owned();
        let stream = consumer.map(move |result| {
            result
                .map(|delivery| {
                    let msg = Delivery::new(
                        &queue,
                        extract_action(&delivery.properties),
                        delivery.data,
                    )
                    .with_headers(extract_headers(&delivery.properties));

                    if no_ack {
                        msg
                    } else {
                        msg.with_acker(Arc::new(LapinAcker {
                            acker: delivery.acker,
                        }))
                    }
                })
                .map_err(TransportError::from)
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.is_open() {
            return Ok(());
        }

        self.channel
            .close(0, "closing channel")
            .await
            .map_err(TransportError::from)
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(TransportError::from)
    }

    async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(TransportError::from)
    }
}

/// The action identifier lives in `content_type`; `type` is the fallback.
fn extract_action(props: &AMQPProperties) -> Option<String> {
    match (props.content_type(), props.kind()) {
        (Some(value), _) if !value.as_str().is_empty() => Some(value.to_string()),
        (_, Some(value)) if !value.as_str().is_empty() => Some(value.to_string()),
        _ => None,
    }
}

fn extract_headers(props: &AMQPProperties) -> BTreeMap<String, String> {
    let Some(headers) = props.headers() else {
        return BTreeMap::default();
    };

    headers
        .inner()
        .iter()
        .filter_map(|(key, value)| match value {
            AMQPValue::LongString(v) => Some((
                key.to_string(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )),
            AMQPValue::ShortString(v) => Some((key.to_string(), v.to_string())),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use std::time::Duration;

    fn params() -> ConnectionParams {
        ConnectionParams {
            name: "default".to_owned(),
            host: "rabbit".to_owned(),
            port: 5673,
            virtual_host: "/".to_owned(),
            user: "guest".to_owned(),
            password: "p@ss/word".to_owned(),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            heartbeat: 30,
            connection_timeout: Duration::from_secs(10),
            channels: IndexMap::default(),
        }
    }

    #[test]
    fn should_build_uri_from_params() {
        let uri = amqp_uri(&params());

        assert_eq!(uri.authority.host, "rabbit");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.authority.userinfo.password, "p@ss/word");
        assert_eq!(uri.vhost, "/");
        assert_eq!(uri.query.heartbeat, Some(30));
        assert_eq!(uri.query.connection_timeout, Some(10_000));
    }

    #[test]
    fn should_extract_action_from_content_type_first() {
        let props = BasicProperties::default()
            .with_content_type(ShortString::from("order.created"))
            .with_type(ShortString::from("ignored"));
        assert_eq!(extract_action(&props), Some("order.created".to_owned()));

        let props = BasicProperties::default().with_type(ShortString::from("user.deleted"));
        assert_eq!(extract_action(&props), Some("user.deleted".to_owned()));

        assert_eq!(extract_action(&BasicProperties::default()), None);
    }

    #[test]
    fn should_extract_string_headers() {
        let mut table = FieldTable::default();
        table.insert(
            ShortString::from("traceparent"),
            AMQPValue::LongString(LongString::from("00-abc-def-01")),
        );
        table.insert(ShortString::from("count"), AMQPValue::LongInt(3));

        let headers = extract_headers(&BasicProperties::default().with_headers(table));

        assert_eq!(headers.len(), 1);
        assert_eq!(headers["traceparent"], "00-abc-def-01");
    }
}
