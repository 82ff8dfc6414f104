// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Multiplexing
//!
//! Outermost decorator of a physical connection. A logical channel shares a
//! single control channel for publishing, declarations, binds and
//! `basic_get`, and gets a dedicated physical channel per consumer so
//! consumers never compete for one channel's flow control or tag space.
//! Delivery tags of all those channels are rewritten into one logical space.

use crate::{
    amqp::{AmqpChannel, AmqpConnection, Delivery, DeliveryHandler, QueueDeclareOk},
    errors::AmqpError,
    tags::{settle, DeliveryTagMapper, RemappingHandler},
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
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::{debug, error};

const CONTROL: usize = 0;

pub struct MultiplexingConnection {
    delegate: Arc<dyn AmqpConnection>,
}

impl MultiplexingConnection {
    pub fn new(delegate: Arc<dyn AmqpConnection>) -> Self {
        MultiplexingConnection { delegate }
    }
}

#[async_trait]
impl AmqpConnection for MultiplexingConnection {
    fn name(&self) -> String {
        self.delegate.name()
    }

    fn is_connected(&self) -> bool {
        self.delegate.is_connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let control = self.delegate.create_channel().await?;
        Ok(Arc::new(MultiplexingChannel::new(
            self.delegate.clone(),
            control,
        )))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.delegate.close().await
    }
}

#[derive(Default)]
struct State {
    next_target: usize,
    channels: HashMap<usize, Arc<dyn AmqpChannel>>,
    consumers: HashMap<String, usize>,
    qos: Option<(u16, BasicQosOptions)>,
}

pub struct MultiplexingChannel {
    connection: Arc<dyn AmqpConnection>,
    control: Arc<dyn AmqpChannel>,
    state: Mutex<State>,
    tags: Arc<DeliveryTagMapper>,
}

impl MultiplexingChannel {
    fn new(connection: Arc<dyn AmqpConnection>, control: Arc<dyn AmqpChannel>) -> Self {
        let mut state = State {
            next_target: CONTROL + 1,
            ..Default::default()
        };
        state.channels.insert(CONTROL, control.clone());

        MultiplexingChannel {
            connection,
            control,
            state: Mutex::new(state),
            tags: Arc::new(DeliveryTagMapper::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn channel(&self, target: usize) -> Option<Arc<dyn AmqpChannel>> {
        self.state().channels.get(&target).cloned()
    }

    /// Number of dedicated consumer channels currently open.
    pub fn consumer_channels(&self) -> usize {
        self.state().consumers.len()
    }

    async fn open_consumer_channel(&self) -> Result<(usize, Arc<dyn AmqpChannel>), AmqpError> {
        let channel = self.connection.create_channel().await?;

        let qos = self.state().qos;
        if let Some((prefetch_count, options)) = qos {
            if let Err(err) = channel.basic_qos(prefetch_count, options).await {
                let _ = channel.close().await;
                return Err(err);
            }
        }

        let mut state = self.state();
        let target = state.next_target;
        state.next_target += 1;
        state.channels.insert(target, channel.clone());

        Ok((target, channel))
    }

    fn release(&self, target: usize) -> Option<Arc<dyn AmqpChannel>> {
        self.tags.forget_target(target);
        self.state().channels.remove(&target)
    }
}

#[async_trait]
impl AmqpChannel for MultiplexingChannel {
    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueDeclareOk, AmqpError> {
        self.control.queue_declare(queue, options, arguments).await
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.control
            .exchange_declare(exchange, kind, options, arguments)
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
        self.control
            .queue_bind(queue, exchange, routing_key, options, arguments)
            .await
    }

    /// Applied to the control channel and every consumer channel, and
    /// remembered for consumer channels opened later.
    async fn basic_qos(
        &self,
        prefetch_count: u16,
        options: BasicQosOptions,
    ) -> Result<(), AmqpError> {
        let channels = {
            let mut state = self.state();
            state.qos = Some((prefetch_count, options));
            state.channels.values().cloned().collect::<Vec<_>>()
        };

        for channel in channels {
            channel.basic_qos(prefetch_count, options).await?;
        }

        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.control
            .basic_publish(exchange, routing_key, options, payload, properties)
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
        let (target, channel) = self.open_consumer_channel().await?;

        let handler = Arc::new(RemappingHandler {
            target,
            mapper: self.tags.clone(),
            inner: handler,
        });

        match channel
            .basic_consume(queue, consumer_tag, options, arguments, handler)
            .await
        {
            Ok(tag) => {
                debug!(queue, consumer_tag = tag.as_str(), target, "consumer channel opened");
                self.state().consumers.insert(tag.clone(), target);
                Ok(tag)
            }
            Err(err) => {
                self.release(target);
                let _ = channel.close().await;
                Err(err)
            }
        }
    }

    async fn basic_cancel(
        &self,
        consumer_tag: &str,
        options: BasicCancelOptions,
    ) -> Result<(), AmqpError> {
        let target = self
            .state()
            .consumers
            .remove(consumer_tag)
            .ok_or_else(|| AmqpError::CancelConsumerError(consumer_tag.to_owned()))?;

        let Some(channel) = self.release(target) else {
            return Ok(());
        };

        let cancelled = channel.basic_cancel(consumer_tag, options).await;
        if let Err(err) = channel.close().await {
            error!(error = err.to_string(), "failure to close consumer channel");
        }
        cancelled
    }

    async fn basic_get(
        &self,
        queue: &str,
        options: BasicGetOptions,
    ) -> Result<Option<Delivery>, AmqpError> {
        let delivery = self.control.basic_get(queue, options).await?;

        Ok(delivery.map(|delivery| {
            if options.no_ack {
                delivery
            } else {
                let logical = self.tags.register(CONTROL, delivery.delivery_tag);
                delivery.with_tag(logical)
            }
        }))
    }

    async fn basic_ack(
        &self,
        delivery_tag: u64,
        options: BasicAckOptions,
    ) -> Result<(), AmqpError> {
        settle(
            &self.tags,
            delivery_tag,
            options.multiple,
            |target| self.channel(target),
            |channel, tag, multiple| async move {
                channel.basic_ack(tag, BasicAckOptions { multiple }).await
            },
        )
        .await
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        options: BasicNackOptions,
    ) -> Result<(), AmqpError> {
        settle(
            &self.tags,
            delivery_tag,
            options.multiple,
            |target| self.channel(target),
            |channel, tag, multiple| async move {
                channel
                    .basic_nack(tag, BasicNackOptions { multiple, ..options })
                    .await
            },
        )
        .await
    }

    async fn basic_reject(
        &self,
        delivery_tag: u64,
        options: BasicRejectOptions,
    ) -> Result<(), AmqpError> {
        settle(
            &self.tags,
            delivery_tag,
            false,
            |target| self.channel(target),
            |channel, tag, _| async move { channel.basic_reject(tag, options).await },
        )
        .await
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let consumers = {
            let mut state = self.state();
            state.consumers.clear();
            state
                .channels
                .drain()
                .filter(|(target, _)| *target != CONTROL)
                .map(|(_, channel)| channel)
                .collect::<Vec<_>>()
        };

        let mut failures = vec![];
        for channel in consumers {
            if let Err(err) = channel.close().await {
                failures.push(err.to_string());
            }
        }
        if let Err(err) = self.control.close().await {
            failures.push(err.to_string());
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AmqpError::TeardownError(failures))
        }
    }
}
