// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory connection and channel fakes for decorator tests that need to
//! look at more than one physical channel at a time.

use crate::{
    amqp::{AmqpChannel, AmqpConnection, Delivery, DeliveryHandler, QueueDeclareOk},
    errors::AmqpError,
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
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

#[derive(Default)]
pub struct FakeConnection {
    name: String,
    down: AtomicBool,
    closed: AtomicBool,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
}

impl FakeConnection {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(FakeConnection {
            name: name.to_owned(),
            ..Default::default()
        })
    }

    /// A connection whose broker is unreachable: every operation fails.
    pub fn down(name: &str) -> Arc<Self> {
        let connection = FakeConnection::new(name);
        connection.down.store(true, Ordering::SeqCst);
        connection
    }

    pub fn channels(&self) -> Vec<Arc<FakeChannel>> {
        self.channels.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AmqpConnection for FakeConnection {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn is_connected(&self) -> bool {
        !self.down.load(Ordering::SeqCst) && !self.is_closed()
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError);
        }
        let channel = Arc::new(FakeChannel::default());
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(AmqpError::ConnectionError(self.name.clone()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct ChannelState {
    declared: Vec<String>,
    published: Vec<(String, String, Vec<u8>)>,
    properties: Vec<BasicProperties>,
    consumers: Vec<(String, String, Arc<dyn DeliveryHandler>)>,
    cancelled: Vec<String>,
    pending: VecDeque<Delivery>,
    acked: Vec<(u64, bool)>,
    nacked: Vec<(u64, bool, bool)>,
    rejected: Vec<(u64, bool)>,
    qos: Option<u16>,
    next_consumer: usize,
}

#[derive(Default)]
pub struct FakeChannel {
    state: Mutex<ChannelState>,
    closed: AtomicBool,
    failing: AtomicBool,
}

impl FakeChannel {
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    fn check(&self, err: AmqpError) -> Result<(), AmqpError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(err)
        } else {
            Ok(())
        }
    }

    /// Pushes a delivery to the consumer of `queue`.
    pub async fn deliver(&self, queue: &str, delivery_tag: u64, data: &[u8]) {
        self.deliver_with(queue, delivery_tag, BasicProperties::default(), data)
            .await
    }

    pub async fn deliver_with(
        &self,
        queue: &str,
        delivery_tag: u64,
        properties: BasicProperties,
        data: &[u8],
    ) {
        let handler = self
            .state
            .lock()
            .unwrap()
            .consumers
            .iter()
            .find(|(q, _, _)| q == queue)
            .map(|(_, _, handler)| handler.clone())
            .unwrap();

        handler
            .handle(Delivery {
                delivery_tag,
                queue: queue.to_owned(),
                properties,
                data: data.to_vec(),
                ..Default::default()
            })
            .await
    }

    /// Queues a message for `basic_get`.
    pub fn enqueue(&self, delivery_tag: u64, data: &[u8]) {
        self.state.lock().unwrap().pending.push_back(Delivery {
            delivery_tag,
            data: data.to_vec(),
            ..Default::default()
        });
    }

    pub fn declared(&self) -> Vec<String> {
        self.state.lock().unwrap().declared.clone()
    }

    pub fn published(&self) -> Vec<(String, String, Vec<u8>)> {
        self.state.lock().unwrap().published.clone()
    }

    /// Queues with a registered consumer.
    pub fn consumers(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .consumers
            .iter()
            .map(|(queue, _, _)| queue.clone())
            .collect()
    }

    /// Properties of every published message, in order.
    pub fn published_properties(&self) -> Vec<BasicProperties> {
        self.state.lock().unwrap().properties.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn acked(&self) -> Vec<(u64, bool)> {
        self.state.lock().unwrap().acked.clone()
    }

    pub fn nacked(&self) -> Vec<(u64, bool, bool)> {
        self.state.lock().unwrap().nacked.clone()
    }

    pub fn rejected(&self) -> Vec<(u64, bool)> {
        self.state.lock().unwrap().rejected.clone()
    }

    pub fn qos(&self) -> Option<u16> {
        self.state.lock().unwrap().qos
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AmqpChannel for FakeChannel {
    async fn queue_declare(
        &self,
        queue: &str,
        _options: QueueDeclareOptions,
        _arguments: FieldTable,
    ) -> Result<QueueDeclareOk, AmqpError> {
        self.check(AmqpError::DeclareQueueError(queue.to_owned()))?;
        self.state.lock().unwrap().declared.push(queue.to_owned());
        Ok(QueueDeclareOk {
            name: queue.to_owned(),
            ..Default::default()
        })
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        _kind: ExchangeKind,
        _options: ExchangeDeclareOptions,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.check(AmqpError::DeclareExchangeError(exchange.to_owned()))?;
        self.state.lock().unwrap().declared.push(exchange.to_owned());
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        _routing_key: &str,
        _options: QueueBindOptions,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.check(AmqpError::BindingExchangeToQueueError(
            exchange.to_owned(),
            queue.to_owned(),
        ))
    }

    async fn basic_qos(
        &self,
        prefetch_count: u16,
        _options: BasicQosOptions,
    ) -> Result<(), AmqpError> {
        self.check(AmqpError::QoSDeclarationError("fake".to_owned()))?;
        self.state.lock().unwrap().qos = Some(prefetch_count);
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        _options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.check(AmqpError::PublishingError)?;
        let mut state = self.state.lock().unwrap();
        state.published.push((
            exchange.to_owned(),
            routing_key.to_owned(),
            payload.to_vec(),
        ));
        state.properties.push(properties);
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        _options: BasicConsumeOptions,
        _arguments: FieldTable,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String, AmqpError> {
        self.check(AmqpError::BindingConsumerError(queue.to_owned()))?;
        let mut state = self.state.lock().unwrap();
        state.next_consumer += 1;
        let tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", state.next_consumer)
        } else {
            consumer_tag.to_owned()
        };
        state.consumers.push((queue.to_owned(), tag.clone(), handler));
        Ok(tag)
    }

    async fn basic_cancel(
        &self,
        consumer_tag: &str,
        _options: BasicCancelOptions,
    ) -> Result<(), AmqpError> {
        self.check(AmqpError::CancelConsumerError(consumer_tag.to_owned()))?;
        let mut state = self.state.lock().unwrap();
        state.consumers.retain(|(_, tag, _)| tag != consumer_tag);
        state.cancelled.push(consumer_tag.to_owned());
        Ok(())
    }

    async fn basic_get(
        &self,
        queue: &str,
        _options: BasicGetOptions,
    ) -> Result<Option<Delivery>, AmqpError> {
        self.check(AmqpError::GetMessageError(queue.to_owned()))?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .pending
            .pop_front()
            .map(|delivery| Delivery {
                queue: queue.to_owned(),
                ..delivery
            }))
    }

    async fn basic_ack(
        &self,
        delivery_tag: u64,
        options: BasicAckOptions,
    ) -> Result<(), AmqpError> {
        self.check(AmqpError::AckMessageError)?;
        self.state
            .lock()
            .unwrap()
            .acked
            .push((delivery_tag, options.multiple));
        Ok(())
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        options: BasicNackOptions,
    ) -> Result<(), AmqpError> {
        self.check(AmqpError::NackMessageError)?;
        self.state
            .lock()
            .unwrap()
            .nacked
            .push((delivery_tag, options.multiple, options.requeue));
        Ok(())
    }

    async fn basic_reject(
        &self,
        delivery_tag: u64,
        options: BasicRejectOptions,
    ) -> Result<(), AmqpError> {
        self.check(AmqpError::RejectMessageError)?;
        self.state
            .lock()
            .unwrap()
            .rejected
            .push((delivery_tag, options.requeue));
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::SeqCst);
        self.check(AmqpError::CloseChannelError)
    }
}

/// Remembers every delivery it is handed.
#[derive(Default)]
pub struct RecordingHandler {
    deliveries: Mutex<Vec<Delivery>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingHandler::default())
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryHandler for RecordingHandler {
    async fn handle(&self, delivery: Delivery) {
        self.deliveries.lock().unwrap().push(delivery);
    }
}
