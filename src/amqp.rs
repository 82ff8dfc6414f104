// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection and Channel Capabilities
//!
//! The traits every layer of the decorator chain implements. The lapin-backed
//! leaves live in [`crate::channel`]; each decorator holds exactly one
//! delegate (or, for the redundant connection, one per broker member) and
//! intercepts a subset of these operations while forwarding the rest.

use crate::errors::AmqpError;
use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicNackOptions, BasicPublishOptions, BasicQosOptions, BasicRejectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, ExchangeKind,
};
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;

/// A message handed to a consumer or returned by `basic_get`.
///
/// Unlike lapin's delivery it carries no acker: acknowledgements must go
/// through the channel so every decorator on the way sees them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    /// The queue the message was consumed from.
    pub queue: String,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl Delivery {
    pub(crate) fn from_lapin(queue: &str, delivery: lapin::message::Delivery) -> Self {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            queue: queue.to_owned(),
            properties: delivery.properties,
            data: delivery.data,
        }
    }

    /// The same delivery under a different tag space.
    pub fn with_tag(mut self, delivery_tag: u64) -> Self {
        self.delivery_tag = delivery_tag;
        self
    }
}

/// Result of a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDeclareOk {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Callback receiving the deliveries of a `basic_consume`.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery);
}

/// A broker connection able to open channels.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    /// Human readable identity used in logs.
    fn name(&self) -> String;

    fn is_connected(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// The channel operations the decorator chain works with.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueDeclareOk, AmqpError>;

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16, options: BasicQosOptions)
        -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Registers `handler` for the deliveries of `queue` and returns the
    /// consumer tag the broker assigned.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String, AmqpError>;

    async fn basic_cancel(
        &self,
        consumer_tag: &str,
        options: BasicCancelOptions,
    ) -> Result<(), AmqpError>;

    async fn basic_get(
        &self,
        queue: &str,
        options: BasicGetOptions,
    ) -> Result<Option<Delivery>, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64, options: BasicAckOptions)
        -> Result<(), AmqpError>;

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        options: BasicNackOptions,
    ) -> Result<(), AmqpError>;

    async fn basic_reject(
        &self,
        delivery_tag: u64,
        options: BasicRejectOptions,
    ) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
