// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retrying Decorator
//!
//! First layer on top of a physical connection. Channel creation and the
//! channel RPCs that can be safely repeated go through the connection's
//! [`RetryExecutor`]. Consuming, acknowledgements, cancellation and close
//! are forwarded once: delivery tags do not survive a failed channel, and a
//! consume that failed on our side may still have registered a consumer on
//! the broker.

use crate::{
    amqp::{AmqpChannel, AmqpConnection, Delivery, DeliveryHandler, QueueDeclareOk},
    errors::AmqpError,
    retry::RetryExecutor,
};
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
use std::{future::Future, sync::Arc};

pub struct RetryingConnection {
    delegate: Arc<dyn AmqpConnection>,
    executor: RetryExecutor,
}

impl RetryingConnection {
    pub fn new(delegate: Arc<dyn AmqpConnection>, executor: RetryExecutor) -> Self {
        RetryingConnection { delegate, executor }
    }
}

#[async_trait]
impl AmqpConnection for RetryingConnection {
    fn name(&self) -> String {
        self.delegate.name()
    }

    fn is_connected(&self) -> bool {
        self.delegate.is_connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let delegate = self.delegate.clone();
        let channel = self
            .executor
            .supply(move || {
                let delegate = delegate.clone();
                async move { delegate.create_channel().await }
            })
            .await?;

        Ok(Arc::new(RetryingChannel {
            delegate: channel,
            executor: self.executor.clone(),
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.delegate.close().await
    }
}

pub struct RetryingChannel {
    delegate: Arc<dyn AmqpChannel>,
    executor: RetryExecutor,
}

impl RetryingChannel {
    async fn retry<T, F, Fut>(&self, operation: F) -> Result<T, AmqpError>
    where
        F: Fn(Arc<dyn AmqpChannel>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, AmqpError>> + Send + 'static,
        T: Send + 'static,
    {
        let delegate = self.delegate.clone();
        self.executor
            .supply(move || operation(delegate.clone()))
            .await
            .map_err(AmqpError::from)
    }
}

#[async_trait]
impl AmqpChannel for RetryingChannel {
    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueDeclareOk, AmqpError> {
        let queue = queue.to_owned();
        self.retry(move |channel| {
            let queue = queue.clone();
            let arguments = arguments.clone();
            async move { channel.queue_declare(&queue, options, arguments).await }
        })
        .await
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let exchange = exchange.to_owned();
        self.retry(move |channel| {
            let exchange = exchange.clone();
            let kind = kind.clone();
            let arguments = arguments.clone();
            async move {
                channel
                    .exchange_declare(&exchange, kind, options, arguments)
                    .await
            }
        })
        .await
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let (queue, exchange, routing_key) =
            (queue.to_owned(), exchange.to_owned(), routing_key.to_owned());
        self.retry(move |channel| {
            let (queue, exchange, routing_key) =
                (queue.clone(), exchange.clone(), routing_key.clone());
            let arguments = arguments.clone();
            async move {
                channel
                    .queue_bind(&queue, &exchange, &routing_key, options, arguments)
                    .await
            }
        })
        .await
    }

    async fn basic_qos(
        &self,
        prefetch_count: u16,
        options: BasicQosOptions,
    ) -> Result<(), AmqpError> {
        self.retry(move |channel| async move { channel.basic_qos(prefetch_count, options).await })
            .await
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let (exchange, routing_key) = (exchange.to_owned(), routing_key.to_owned());
        let payload = payload.to_vec();
        self.retry(move |channel| {
            let (exchange, routing_key) = (exchange.clone(), routing_key.clone());
            let payload = payload.clone();
            let properties = properties.clone();
            async move {
                channel
                    .basic_publish(&exchange, &routing_key, options, &payload, properties)
                    .await
            }
        })
        .await
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String, AmqpError> {
        self.delegate
            .basic_consume(queue, consumer_tag, options, arguments, handler)
            .await
    }

    async fn basic_cancel(
        &self,
        consumer_tag: &str,
        options: BasicCancelOptions,
    ) -> Result<(), AmqpError> {
        self.delegate.basic_cancel(consumer_tag, options).await
    }

    async fn basic_get(
        &self,
        queue: &str,
        options: BasicGetOptions,
    ) -> Result<Option<Delivery>, AmqpError> {
        let queue = queue.to_owned();
        self.retry(move |channel| {
            let queue = queue.clone();
            async move { channel.basic_get(&queue, options).await }
        })
        .await
    }

    async fn basic_ack(
        &self,
        delivery_tag: u64,
        options: BasicAckOptions,
    ) -> Result<(), AmqpError> {
        self.delegate.basic_ack(delivery_tag, options).await
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        options: BasicNackOptions,
    ) -> Result<(), AmqpError> {
        self.delegate.basic_nack(delivery_tag, options).await
    }

    async fn basic_reject(
        &self,
        delivery_tag: u64,
        options: BasicRejectOptions,
    ) -> Result<(), AmqpError> {
        self.delegate.basic_reject(delivery_tag, options).await
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.delegate.close().await
    }
}
