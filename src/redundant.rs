// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Redundant Connection
//!
//! One logical connection over several equivalent broker members. Publishes
//! and topology declarations are sent to every member and succeed as long as
//! one member accepts them. Consumers are registered on every member, so the
//! same message may be delivered once per member; collapsing those copies is
//! left to [`crate::dedup`].

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
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{debug, error, warn};
use uuid::Uuid;

pub struct RedundantConnection {
    members: Vec<Arc<dyn AmqpConnection>>,
}

impl RedundantConnection {
    pub fn new(members: Vec<Arc<dyn AmqpConnection>>) -> Self {
        RedundantConnection { members }
    }

    pub fn members(&self) -> &[Arc<dyn AmqpConnection>] {
        &self.members
    }
}

#[async_trait]
impl AmqpConnection for RedundantConnection {
    fn name(&self) -> String {
        self.members
            .iter()
            .map(|member| member.name())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Connected while at least one member is.
    fn is_connected(&self) -> bool {
        self.members.iter().any(|member| member.is_connected())
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let mut channels = Vec::with_capacity(self.members.len());

        for (index, member) in self.members.iter().enumerate() {
            match member.create_channel().await {
                Ok(channel) => channels.push(Member {
                    index,
                    name: member.name(),
                    channel,
                }),
                Err(err) => warn!(
                    error = err.to_string(),
                    member = %member.name(),
                    "member unavailable, channel opened without it"
                ),
            }
        }

        if channels.is_empty() {
            return Err(AmqpError::NoMemberAvailable("create_channel".to_owned()));
        }

        Ok(Arc::new(RedundantChannel {
            members: channels,
            tags: Arc::new(DeliveryTagMapper::new()),
            consumers: Mutex::new(HashMap::new()),
        }))
    }

    /// Closes every member even when some of them fail.
    async fn close(&self) -> Result<(), AmqpError> {
        let mut failures = vec![];
        for member in &self.members {
            if let Err(err) = member.close().await {
                error!(error = err.to_string(), member = %member.name(), "failure to close member");
                failures.push(format!("{}: {}", member.name(), err));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AmqpError::TeardownError(failures))
        }
    }
}

struct Member {
    index: usize,
    name: String,
    channel: Arc<dyn AmqpChannel>,
}

pub struct RedundantChannel {
    members: Vec<Member>,
    tags: Arc<DeliveryTagMapper>,
    consumers: Mutex<HashMap<String, Vec<usize>>>,
}

impl RedundantChannel {
    fn member(&self, index: usize) -> Option<Arc<dyn AmqpChannel>> {
        self.members
            .iter()
            .find(|member| member.index == index)
            .map(|member| member.channel.clone())
    }

    /// Runs `operation` on every member. Returns the first success, or the
    /// last failure when no member succeeded.
    async fn broadcast<T, F, Fut>(&self, action: &str, operation: F) -> Result<T, AmqpError>
    where
        F: Fn(Arc<dyn AmqpChannel>) -> Fut,
        Fut: Future<Output = Result<T, AmqpError>>,
    {
        let mut first = None;
        let mut last_err = None;

        for member in &self.members {
            match operation(member.channel.clone()).await {
                Ok(value) => {
                    if first.is_none() {
                        first = Some(value);
                    }
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        member = member.name.as_str(),
                        action,
                        "member failed",
                    );
                    last_err = Some(err);
                }
            }
        }

        match (first, last_err) {
            (Some(value), _) => Ok(value),
            (None, Some(err)) => Err(err),
            (None, None) => Err(AmqpError::NoMemberAvailable(action.to_owned())),
        }
    }
}

#[async_trait]
impl AmqpChannel for RedundantChannel {
    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueDeclareOk, AmqpError> {
        self.broadcast("queue_declare", |channel| {
            let arguments = arguments.clone();
            async move { channel.queue_declare(queue, options, arguments).await }
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
        self.broadcast("exchange_declare", |channel| {
            let kind = kind.clone();
            let arguments = arguments.clone();
            async move {
                channel
                    .exchange_declare(exchange, kind, options, arguments)
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
        self.broadcast("queue_bind", |channel| {
            let arguments = arguments.clone();
            async move {
                channel
                    .queue_bind(queue, exchange, routing_key, options, arguments)
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
        self.broadcast("basic_qos", |channel| async move {
            channel.basic_qos(prefetch_count, options).await
        })
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
        self.broadcast("basic_publish", |channel| {
            let properties = properties.clone();
            async move {
                channel
                    .basic_publish(exchange, routing_key, options, payload, properties)
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
        let logical_tag = if consumer_tag.is_empty() {
            format!("beetle-{}", Uuid::new_v4())
        } else {
            consumer_tag.to_owned()
        };

        let mut registered = vec![];
        let mut last_err = None;
        for member in &self.members {
            let remapping = Arc::new(RemappingHandler {
                target: member.index,
                mapper: self.tags.clone(),
                inner: handler.clone(),
            });

            match member
                .channel
                .basic_consume(queue, &logical_tag, options, arguments.clone(), remapping)
                .await
            {
                Ok(_) => registered.push(member.index),
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        member = member.name.as_str(),
                        queue,
                        "failure to consume on member",
                    );
                    last_err = Some(err);
                }
            }
        }

        if registered.is_empty() {
            let err = last_err.unwrap_or_else(|| AmqpError::BindingConsumerError(queue.to_owned()));
            return Err(err);
        }

        debug!(
            queue,
            consumer_tag = logical_tag.as_str(),
            members = registered.len(),
            "consumer registered",
        );
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(logical_tag.clone(), registered);

        Ok(logical_tag)
    }

    async fn basic_cancel(
        &self,
        consumer_tag: &str,
        options: BasicCancelOptions,
    ) -> Result<(), AmqpError> {
        let registered = self
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(consumer_tag)
            .ok_or_else(|| AmqpError::CancelConsumerError(consumer_tag.to_owned()))?;

        let mut result = Ok(());
        for index in registered {
            let Some(channel) = self.member(index) else {
                continue;
            };
            if let Err(err) = channel.basic_cancel(consumer_tag, options).await {
                result = Err(err);
            }
        }
        result
    }

    /// Polls the members in order and returns the first message found.
    async fn basic_get(
        &self,
        queue: &str,
        options: BasicGetOptions,
    ) -> Result<Option<Delivery>, AmqpError> {
        let mut answered = false;
        let mut last_err = None;

        for member in &self.members {
            match member.channel.basic_get(queue, options).await {
                Ok(Some(delivery)) if options.no_ack => return Ok(Some(delivery)),
                Ok(Some(delivery)) => {
                    let logical = self.tags.register(member.index, delivery.delivery_tag);
                    return Ok(Some(delivery.with_tag(logical)));
                }
                Ok(None) => answered = true,
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        member = member.name.as_str(),
                        queue,
                        "failure to get from member"
                    );
                    last_err = Some(err);
                }
            }
        }

        // Empty only when some member said so.
        match last_err {
            Some(err) if !answered => Err(err),
            _ => Ok(None),
        }
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
            |index| self.member(index),
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
            |index| self.member(index),
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
            |index| self.member(index),
            |channel, tag, _| async move { channel.basic_reject(tag, options).await },
        )
        .await
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut failures = vec![];
        for member in &self.members {
            if let Err(err) = member.channel.close().await {
                failures.push(format!("{}: {}", member.name, err));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AmqpError::TeardownError(failures))
        }
    }
}
