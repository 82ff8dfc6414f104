// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Connections and Channels
//!
//! The leaves of the decorator chain: one physical lapin connection to a
//! single broker address, and the channels opened on it. Every RPC failure is
//! logged and mapped onto an [`AmqpError`].

use crate::{
    amqp::{AmqpChannel, AmqpConnection, Delivery, DeliveryHandler, QueueDeclareOk},
    config::BrokerAddress,
    errors::AmqpError,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicNackOptions, BasicPublishOptions, BasicQosOptions, BasicRejectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::Arc;
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// A single physical connection to one broker.
pub struct LapinConnection {
    name: String,
    inner: Connection,
}

impl LapinConnection {
    /// Opens a connection to `address`.
    ///
    /// # Parameters
    /// * `address` - The broker to connect to
    /// * `connection_name` - Client provided name shown in the broker UI
    pub async fn connect(
        address: &BrokerAddress,
        connection_name: &str,
    ) -> Result<LapinConnection, AmqpError> {
        debug!(address = address.to_string(), "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        match Connection::connect(&address.uri(), options).await {
            Ok(inner) => {
                debug!(address = address.to_string(), "amqp connected");
                Ok(LapinConnection {
                    name: address.to_string(),
                    inner,
                })
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    address = address.to_string(),
                    "failure to connect"
                );
                Err(AmqpError::ConnectionError(address.to_string()))
            }
        }
    }
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!(connection = self.name.as_str(), "creating amqp channel...");
        match self.inner.create_channel().await {
            Ok(inner) => {
                debug!(connection = self.name.as_str(), "channel created");
                Ok(Arc::new(LapinChannel { inner }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close connection");
                AmqpError::ConnectionError(self.name.clone())
            })
    }
}

/// A channel on a [`LapinConnection`].
pub struct LapinChannel {
    inner: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueDeclareOk, AmqpError> {
        match self.inner.queue_declare(queue, options, arguments).await {
            Ok(declared) => {
                debug!("queue: {} was created", queue);
                Ok(QueueDeclareOk {
                    name: declared.name().to_string(),
                    message_count: declared.message_count(),
                    consumer_count: declared.consumer_count(),
                })
            }
            Err(err) => {
                error!(error = err.to_string(), queue, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(queue.to_owned()))
            }
        }
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.inner
            .exchange_declare(exchange, kind, options, arguments)
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = exchange,
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchangeError(exchange.to_owned())
            })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.inner
            .queue_bind(queue, exchange, routing_key, options, arguments)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn basic_qos(
        &self,
        prefetch_count: u16,
        options: BasicQosOptions,
    ) -> Result<(), AmqpError> {
        self.inner
            .basic_qos(prefetch_count, options)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        match self
            .inner
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String, AmqpError> {
        let mut consumer = match self
            .inner
            .basic_consume(queue, consumer_tag, options, arguments)
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let tag = consumer.tag().to_string();
        let queue = queue.to_owned();

        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => handler.handle(Delivery::from_lapin(&queue, delivery)).await,
                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            }
            debug!(queue = queue.as_str(), "consumer stream ended");
        });

        Ok(tag)
    }

    async fn basic_cancel(
        &self,
        consumer_tag: &str,
        options: BasicCancelOptions,
    ) -> Result<(), AmqpError> {
        self.inner
            .basic_cancel(consumer_tag, options)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to cancel consumer");
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })
    }

    async fn basic_get(
        &self,
        queue: &str,
        options: BasicGetOptions,
    ) -> Result<Option<Delivery>, AmqpError> {
        match self.inner.basic_get(queue, options).await {
            Ok(message) => Ok(message.map(|msg| Delivery::from_lapin(queue, msg.delivery))),
            Err(err) => {
                error!(error = err.to_string(), queue, "failure to get message");
                Err(AmqpError::GetMessageError(queue.to_owned()))
            }
        }
    }

    async fn basic_ack(
        &self,
        delivery_tag: u64,
        options: BasicAckOptions,
    ) -> Result<(), AmqpError> {
        self.inner
            .basic_ack(delivery_tag, options)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        options: BasicNackOptions,
    ) -> Result<(), AmqpError> {
        self.inner
            .basic_nack(delivery_tag, options)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn basic_reject(
        &self,
        delivery_tag: u64,
        options: BasicRejectOptions,
    ) -> Result<(), AmqpError> {
        self.inner
            .basic_reject(delivery_tag, options)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                AmqpError::RejectMessageError
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close channel");
                AmqpError::CloseChannelError
            })
    }
}
