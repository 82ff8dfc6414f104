// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Publishes application messages through a logical channel. Every message
//! gets a fresh id, which is what consumers deduplicate on, and an optional
//! `expires_at` header after which consumers drop it unprocessed.

use crate::{amqp::AmqpChannel, errors::AmqpError, otel};
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Header holding the expiry of a message in seconds since the epoch
pub const EXPIRES_AT_HEADER: &str = "expires_at";

/// Custom header value of an outgoing message.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    LongString(String),
    LongInt(i32),
    LongLongInt(i64),
    LongUint(u32),
    Bool(bool),
}

impl From<HeaderValue> for AMQPValue {
    fn from(value: HeaderValue) -> Self {
        match value {
            HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValue::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
            HeaderValue::Bool(v) => AMQPValue::Boolean(v),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PublishMessage {
    pub exchange: String,
    pub routing_key: String,
    pub msg_type: Option<String>,
    pub data: Vec<u8>,
    pub headers: HashMap<String, HeaderValue>,
    /// Time to live after publishing; sets the `expires_at` header.
    pub ttl: Option<Duration>,
}

impl PublishMessage {
    pub fn new(exchange: &str, routing_key: &str, data: &[u8]) -> Self {
        PublishMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            data: data.to_vec(),
            ..Default::default()
        }
    }

    /// Message whose payload is `payload` serialized to JSON.
    pub fn json<T: Serialize>(
        exchange: &str,
        routing_key: &str,
        msg_type: &str,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        let data = serde_json::to_vec(payload)?;
        Ok(PublishMessage::new(exchange, routing_key, &data).with_type(msg_type))
    }

    pub fn with_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }

    pub fn with_header(mut self, key: &str, value: HeaderValue) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

pub struct BeetlePublisher {
    channel: Arc<dyn AmqpChannel>,
}

impl BeetlePublisher {
    /// Creates a publisher on `channel`, usually a channel of a redundant
    /// connection so every broker member receives the message.
    pub fn new(channel: Arc<dyn AmqpChannel>) -> Arc<BeetlePublisher> {
        Arc::new(BeetlePublisher { channel })
    }

    /// Publishes `msg` with the trace context of `ctx`.
    ///
    /// # Returns
    /// The generated message id
    pub async fn publish(&self, ctx: &Context, msg: &PublishMessage) -> Result<String, AmqpError> {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject(ctx, &mut headers);

        for (key, value) in &msg.headers {
            headers.insert(ShortString::from(key.as_str()), value.clone().into());
        }

        if let Some(ttl) = msg.ttl {
            headers.insert(
                ShortString::from(EXPIRES_AT_HEADER),
                AMQPValue::LongLongInt(expires_at(ttl)),
            );
        }

        let message_id = Uuid::new_v4().to_string();
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_type(ShortString::from(msg.msg_type.clone().unwrap_or_default()))
            .with_message_id(ShortString::from(message_id.as_str()))
            .with_headers(FieldTable::from(headers));

        self.channel
            .basic_publish(
                &msg.exchange,
                &msg.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &msg.data,
                properties,
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    exchange = msg.exchange.as_str(),
                    "error publishing message",
                );
                err
            })?;

        debug!(message_id = message_id.as_str(), "message published");
        Ok(message_id)
    }
}

fn expires_at(ttl: Duration) -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from((now + ttl).as_secs()).unwrap_or(i64::MAX)
}
