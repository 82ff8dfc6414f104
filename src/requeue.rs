// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Requeue At End
//!
//! A plain reject-with-requeue puts a message back at the head of its queue,
//! so a broken handler sees it again immediately. This decorator emulates a
//! delayed requeue at the tail with dead-lettering:
//!
//! - `<queue>_dead_letter` holds rejected messages for the configured TTL and
//!   then dead-letters them back to `<queue>` through the default exchange.
//! - `<queue>` dead-letters rejected messages into `<queue>_dead_letter`.
//!
//! When `invert_requeue_parameter` is set the queue is marked, deliveries
//! from it are remembered, and a reject/nack with `requeue = true` is turned
//! into a reject without requeue (the delayed path) while `requeue = false`
//! becomes an ack (dropped). Unmarked deliveries are forwarded unchanged.

use crate::{
    amqp::{AmqpChannel, AmqpConnection, Delivery, DeliveryHandler, QueueDeclareOk},
    errors::AmqpError,
    tags::DeliveryTagSet,
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicNackOptions, BasicPublishOptions, BasicQosOptions, BasicRejectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties, ExchangeKind,
};
use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, PoisonError, RwLock},
};
use tracing::{debug, info, warn};

/// Suffix of the companion queue holding rejected messages.
pub const DEAD_LETTER_SUFFIX: &str = "_dead_letter";
/// Per-declaration override of the requeue delay, in milliseconds. Read and
/// stripped before the declaration reaches the broker.
pub const REQUEUE_AT_END_DELAY_HEADER: &str = "x-requeue-at-end-delay";
/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequeueAtEndConfig {
    /// Delay before a rejected message re-enters its queue; negative disables.
    pub delay_ms: i64,
    pub invert_requeue_parameter: bool,
}

impl RequeueAtEndConfig {
    pub fn new(delay_ms: i64, invert_requeue_parameter: bool) -> Self {
        RequeueAtEndConfig {
            delay_ms,
            invert_requeue_parameter,
        }
    }

    pub fn disabled() -> Self {
        RequeueAtEndConfig::new(-1, false)
    }
}

impl Default for RequeueAtEndConfig {
    fn default() -> Self {
        RequeueAtEndConfig::disabled()
    }
}

/// Dead-letter queue names marked on any channel of the connection.
type MarkedQueues = Arc<RwLock<HashSet<String>>>;

pub struct RequeueAtEndConnection {
    delegate: Arc<dyn AmqpConnection>,
    config: RequeueAtEndConfig,
    marked: MarkedQueues,
}

impl RequeueAtEndConnection {
    pub fn new(delegate: Arc<dyn AmqpConnection>, config: RequeueAtEndConfig) -> Self {
        RequeueAtEndConnection {
            delegate,
            config,
            marked: MarkedQueues::default(),
        }
    }
}

#[async_trait]
impl AmqpConnection for RequeueAtEndConnection {
    fn name(&self) -> String {
        self.delegate.name()
    }

    fn is_connected(&self) -> bool {
        self.delegate.is_connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let delegate = self.delegate.create_channel().await?;
        Ok(Arc::new(RequeueAtEndChannel::new(
            delegate,
            self.config,
            self.marked.clone(),
        )))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.delegate.close().await
    }
}

pub struct RequeueAtEndChannel {
    delegate: Arc<dyn AmqpChannel>,
    config: RequeueAtEndConfig,
    marked: MarkedQueues,
    dead_letter_tags: Arc<DeliveryTagSet>,
}

impl RequeueAtEndChannel {
    fn new(
        delegate: Arc<dyn AmqpChannel>,
        config: RequeueAtEndConfig,
        marked: MarkedQueues,
    ) -> Self {
        RequeueAtEndChannel {
            delegate,
            config,
            marked,
            dead_letter_tags: Arc::new(DeliveryTagSet::new()),
        }
    }

    fn mark(&self, queue: &str) {
        self.marked
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(queue.to_owned());
    }

    /// Forgets `delivery_tag` (or everything up to it) and tells whether
    /// that delivery came from a marked queue.
    fn dead_lettered(&self, delivery_tag: u64, multiple: bool) -> bool {
        if multiple {
            self.dead_letter_tags.remove_through(delivery_tag)
        } else {
            self.dead_letter_tags.remove(delivery_tag)
        }
    }
}

fn is_marked(marked: &MarkedQueues, queue: &str) -> bool {
    marked
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .contains(queue)
}

/// Splits the requeue delay override off the declare arguments.
///
/// # Returns
/// The effective delay and the arguments to forward to the broker.
pub fn requeue_delay(
    arguments: &FieldTable,
    default_delay_ms: i64,
) -> Result<(i64, BTreeMap<ShortString, AMQPValue>), AmqpError> {
    let mut forwarded = arguments.inner().clone();

    let delay = match forwarded.remove(&ShortString::from(REQUEUE_AT_END_DELAY_HEADER)) {
        None => default_delay_ms,
        Some(value) => delay_millis(&value)?,
    };

    Ok((delay, forwarded))
}

fn delay_millis(value: &AMQPValue) -> Result<i64, AmqpError> {
    let invalid = |reason: String| {
        AmqpError::InvalidArgument(REQUEUE_AT_END_DELAY_HEADER.to_owned(), reason)
    };

    match value {
        AMQPValue::ShortShortInt(v) => Ok(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Ok(i64::from(*v)),
        AMQPValue::ShortInt(v) => Ok(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Ok(i64::from(*v)),
        AMQPValue::LongInt(v) => Ok(i64::from(*v)),
        AMQPValue::LongUInt(v) => Ok(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Ok(*v),
        AMQPValue::ShortString(v) => v
            .as_str()
            .trim()
            .parse::<i64>()
            .map_err(|err| invalid(err.to_string())),
        AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes())
            .map_err(|err| invalid(err.to_string()))?
            .trim()
            .parse::<i64>()
            .map_err(|err| invalid(err.to_string())),
        other => Err(invalid(format!("unsupported value {other:?}"))),
    }
}

fn dead_letter_arguments(queue: &str, delay_ms: i64) -> FieldTable {
    let mut args = BTreeMap::new();
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
        AMQPValue::LongString(LongString::from("")),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
        AMQPValue::LongString(LongString::from(queue.to_owned())),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
        AMQPValue::LongLongInt(LongLongInt::from(delay_ms)),
    );
    FieldTable::from(args)
}

fn original_arguments(
    mut args: BTreeMap<ShortString, AMQPValue>,
    dead_letter_queue: &str,
) -> FieldTable {
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
        AMQPValue::LongString(LongString::from("")),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
        AMQPValue::LongString(LongString::from(dead_letter_queue.to_owned())),
    );
    FieldTable::from(args)
}

/// Records the tags of deliveries from marked queues before handing them on.
struct DeadLetterTracking {
    queue: String,
    marked: MarkedQueues,
    tags: Arc<DeliveryTagSet>,
    inner: Arc<dyn DeliveryHandler>,
}

#[async_trait]
impl DeliveryHandler for DeadLetterTracking {
    async fn handle(&self, delivery: Delivery) {
        if is_marked(&self.marked, &self.queue) {
            self.tags.insert(delivery.delivery_tag);
        }
        self.inner.handle(delivery).await
    }
}

#[async_trait]
impl AmqpChannel for RequeueAtEndChannel {
    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueDeclareOk, AmqpError> {
        let (delay_ms, arguments) = requeue_delay(&arguments, self.config.delay_ms)?;

        if delay_ms < 0 {
            return self
                .delegate
                .queue_declare(queue, options, FieldTable::from(arguments))
                .await;
        }

        let dead_letter_queue = format!("{queue}{DEAD_LETTER_SUFFIX}");
        let declared = self
            .delegate
            .queue_declare(
                &dead_letter_queue,
                options,
                dead_letter_arguments(queue, delay_ms),
            )
            .await?;

        if declared.name.is_empty() {
            warn!(
                queue,
                "dead letter declaration returned no queue name, skipping requeue at end"
            );
            return self
                .delegate
                .queue_declare(queue, options, FieldTable::from(arguments))
                .await;
        }

        let declared = self
            .delegate
            .queue_declare(
                queue,
                options,
                original_arguments(arguments, &dead_letter_queue),
            )
            .await?;

        if self.config.invert_requeue_parameter {
            self.mark(queue);
        }

        info!(queue, delay_ms, "requeue at end configured");
        Ok(declared)
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.delegate
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
        self.delegate
            .queue_bind(queue, exchange, routing_key, options, arguments)
            .await
    }

    async fn basic_qos(
        &self,
        prefetch_count: u16,
        options: BasicQosOptions,
    ) -> Result<(), AmqpError> {
        self.delegate.basic_qos(prefetch_count, options).await
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.delegate
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
        let handler: Arc<dyn DeliveryHandler> = if options.no_ack {
            handler
        } else {
            Arc::new(DeadLetterTracking {
                queue: queue.to_owned(),
                marked: self.marked.clone(),
                tags: self.dead_letter_tags.clone(),
                inner: handler,
            })
        };

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
        let delivery = self.delegate.basic_get(queue, options).await?;

        if let Some(delivery) = &delivery {
            if !options.no_ack && is_marked(&self.marked, queue) {
                self.dead_letter_tags.insert(delivery.delivery_tag);
            }
        }

        Ok(delivery)
    }

    async fn basic_ack(
        &self,
        delivery_tag: u64,
        options: BasicAckOptions,
    ) -> Result<(), AmqpError> {
        self.dead_lettered(delivery_tag, options.multiple);
        self.delegate.basic_ack(delivery_tag, options).await
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        options: BasicNackOptions,
    ) -> Result<(), AmqpError> {
        if !self.dead_lettered(delivery_tag, options.multiple) {
            return self.delegate.basic_nack(delivery_tag, options).await;
        }

        if options.requeue {
            debug!(delivery_tag, "nack routed to dead letter queue");
            self.delegate
                .basic_nack(
                    delivery_tag,
                    BasicNackOptions {
                        multiple: options.multiple,
                        requeue: false,
                    },
                )
                .await
        } else {
            self.delegate
                .basic_ack(
                    delivery_tag,
                    BasicAckOptions {
                        multiple: options.multiple,
                    },
                )
                .await
        }
    }

    async fn basic_reject(
        &self,
        delivery_tag: u64,
        options: BasicRejectOptions,
    ) -> Result<(), AmqpError> {
        if !self.dead_lettered(delivery_tag, false) {
            return self.delegate.basic_reject(delivery_tag, options).await;
        }

        if options.requeue {
            debug!(delivery_tag, "reject routed to dead letter queue");
            self.delegate
                .basic_reject(delivery_tag, BasicRejectOptions { requeue: false })
                .await
        } else {
            self.delegate
                .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
                .await
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.dead_letter_tags.remove_through(u64::MAX);
        self.delegate.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        amqp::{MockAmqpChannel, MockAmqpConnection},
        testing::{FakeConnection, RecordingHandler},
    };
    use mockall::{predicate::eq, Sequence};

    fn table(entries: Vec<(&str, AMQPValue)>) -> FieldTable {
        FieldTable::from(
            entries
                .into_iter()
                .map(|(k, v)| (ShortString::from(k), v))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    fn long_string(value: &str) -> AMQPValue {
        AMQPValue::LongString(LongString::from(value.to_owned()))
    }

    fn declared(queue: &str) -> Result<QueueDeclareOk, AmqpError> {
        Ok(QueueDeclareOk {
            name: queue.to_owned(),
            ..Default::default()
        })
    }

    fn delivery(tag: u64) -> Delivery {
        Delivery {
            delivery_tag: tag,
            queue: "q".to_owned(),
            ..Default::default()
        }
    }

    fn channel(mock: MockAmqpChannel, delay_ms: i64, invert: bool) -> RequeueAtEndChannel {
        RequeueAtEndChannel::new(
            Arc::new(mock),
            RequeueAtEndConfig::new(delay_ms, invert),
            MarkedQueues::default(),
        )
    }

    fn expect_dead_letter_setup(mock: &mut MockAmqpChannel, delay_ms: i64) {
        let mut seq = Sequence::new();
        let dead_letter_args = table(vec![
            (AMQP_HEADERS_DEAD_LETTER_EXCHANGE, long_string("")),
            (AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY, long_string("q")),
            (AMQP_HEADERS_MESSAGE_TTL, AMQPValue::LongLongInt(delay_ms)),
        ]);
        let original_args = table(vec![
            (AMQP_HEADERS_DEAD_LETTER_EXCHANGE, long_string("")),
            (
                AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
                long_string("q_dead_letter"),
            ),
        ]);

        mock.expect_queue_declare()
            .withf(move |queue, _, args| {
                queue == "q_dead_letter" && args.inner() == dead_letter_args.inner()
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|queue, _, _| declared(queue));
        mock.expect_queue_declare()
            .withf(move |queue, _, args| queue == "q" && args.inner() == original_args.inner())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|queue, _, _| declared(queue));
    }

    #[tokio::test]
    async fn should_declare_unchanged_when_disabled() {
        let mut mock = MockAmqpChannel::new();
        mock.expect_queue_declare()
            .withf(|queue, _, args| queue == "q" && args.inner().is_empty())
            .times(1)
            .returning(|queue, _, _| declared(queue));
        mock.expect_basic_reject()
            .with(eq(1), eq(BasicRejectOptions { requeue: true }))
            .times(1)
            .returning(|_, _| Ok(()));

        let channel = channel(mock, -1, true);
        channel
            .queue_declare("q", QueueDeclareOptions::default(), FieldTable::default())
            .await
            .unwrap();

        channel
            .basic_reject(1, BasicRejectOptions { requeue: true })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn should_declare_dead_letter_queue_before_original() {
        let mut mock = MockAmqpChannel::new();
        expect_dead_letter_setup(&mut mock, 0);

        let channel = channel(mock, 0, false);
        let declared = channel
            .queue_declare("q", QueueDeclareOptions::default(), FieldTable::default())
            .await
            .unwrap();

        assert_eq!(declared.name, "q");
        assert!(!is_marked(&channel.marked, "q"));
    }

    #[tokio::test]
    async fn should_read_and_strip_delay_override() {
        let mut mock = MockAmqpChannel::new();
        expect_dead_letter_setup(&mut mock, 1500);

        let channel = channel(mock, -1, true);
        channel
            .queue_declare(
                "q",
                QueueDeclareOptions::default(),
                table(vec![(REQUEUE_AT_END_DELAY_HEADER, AMQPValue::LongInt(1500))]),
            )
            .await
            .unwrap();

        assert!(is_marked(&channel.marked, "q"));
    }

    #[tokio::test]
    async fn should_reject_malformed_delay_override() {
        let channel = channel(MockAmqpChannel::new(), 0, true);

        let result = channel
            .queue_declare(
                "q",
                QueueDeclareOptions::default(),
                table(vec![(REQUEUE_AT_END_DELAY_HEADER, long_string("soon"))]),
            )
            .await;

        assert!(matches!(result, Err(AmqpError::InvalidArgument(_, _))));
    }

    #[tokio::test]
    async fn should_fall_back_when_dead_letter_declare_returns_no_name() {
        let mut mock = MockAmqpChannel::new();
        let mut seq = Sequence::new();
        mock.expect_queue_declare()
            .withf(|queue, _, _| queue == "q_dead_letter")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| declared(""));
        mock.expect_queue_declare()
            .withf(|queue, _, args| queue == "q" && args.inner().is_empty())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|queue, _, _| declared(queue));

        let channel = channel(mock, 0, true);
        channel
            .queue_declare("q", QueueDeclareOptions::default(), FieldTable::default())
            .await
            .unwrap();

        assert!(!is_marked(&channel.marked, "q"));
    }

    #[tokio::test]
    async fn should_route_requeue_to_dead_letter_for_marked_queue() {
        let mut mock = MockAmqpChannel::new();
        expect_dead_letter_setup(&mut mock, 0);
        mock.expect_basic_get()
            .returning(|_, _| Ok(Some(delivery(5))));
        mock.expect_basic_reject()
            .with(eq(5), eq(BasicRejectOptions { requeue: false }))
            .times(1)
            .returning(|_, _| Ok(()));

        let channel = channel(mock, 0, true);
        channel
            .queue_declare("q", QueueDeclareOptions::default(), FieldTable::default())
            .await
            .unwrap();
        channel
            .basic_get("q", BasicGetOptions { no_ack: false })
            .await
            .unwrap();

        channel
            .basic_reject(5, BasicRejectOptions { requeue: true })
            .await
            .unwrap();
        assert!(channel.dead_letter_tags.is_empty());
    }

    #[tokio::test]
    async fn should_drop_by_ack_when_requeue_declined_for_marked_queue() {
        let mut mock = MockAmqpChannel::new();
        expect_dead_letter_setup(&mut mock, 0);
        mock.expect_basic_get()
            .returning(|_, _| Ok(Some(delivery(7))));
        mock.expect_basic_ack()
            .with(eq(7), eq(BasicAckOptions { multiple: false }))
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_basic_reject().never();

        let channel = channel(mock, 0, true);
        channel
            .queue_declare("q", QueueDeclareOptions::default(), FieldTable::default())
            .await
            .unwrap();
        channel
            .basic_get("q", BasicGetOptions { no_ack: false })
            .await
            .unwrap();

        channel
            .basic_reject(7, BasicRejectOptions { requeue: false })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn should_forward_unmarked_reject_unchanged() {
        let mut mock = MockAmqpChannel::new();
        expect_dead_letter_setup(&mut mock, 0);
        mock.expect_basic_get()
            .returning(|_, _| Ok(Some(delivery(2))));
        mock.expect_basic_reject()
            .with(eq(2), eq(BasicRejectOptions { requeue: true }))
            .times(1)
            .returning(|_, _| Ok(()));

        let channel = channel(mock, 0, false);
        channel
            .queue_declare("q", QueueDeclareOptions::default(), FieldTable::default())
            .await
            .unwrap();
        channel
            .basic_get("q", BasicGetOptions { no_ack: false })
            .await
            .unwrap();

        channel
            .basic_reject(2, BasicRejectOptions { requeue: true })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn should_not_track_auto_acked_gets() {
        let mut mock = MockAmqpChannel::new();
        expect_dead_letter_setup(&mut mock, 0);
        mock.expect_basic_get()
            .returning(|_, _| Ok(Some(delivery(3))));

        let channel = channel(mock, 0, true);
        channel
            .queue_declare("q", QueueDeclareOptions::default(), FieldTable::default())
            .await
            .unwrap();
        channel
            .basic_get("q", BasicGetOptions { no_ack: true })
            .await
            .unwrap();

        assert!(channel.dead_letter_tags.is_empty());
    }

    #[tokio::test]
    async fn should_clear_range_on_multiple_nack() {
        let mut mock = MockAmqpChannel::new();
        expect_dead_letter_setup(&mut mock, 0);
        let mut tags = vec![1u64, 2, 3];
        mock.expect_basic_get()
            .times(3)
            .returning(move |_, _| Ok(Some(delivery(tags.remove(0)))));
        mock.expect_basic_nack()
            .with(
                eq(2),
                eq(BasicNackOptions {
                    multiple: true,
                    requeue: false,
                }),
            )
            .times(1)
            .returning(|_, _| Ok(()));

        let channel = channel(mock, 0, true);
        channel
            .queue_declare("q", QueueDeclareOptions::default(), FieldTable::default())
            .await
            .unwrap();
        for _ in 0..3 {
            channel
                .basic_get("q", BasicGetOptions { no_ack: false })
                .await
                .unwrap();
        }

        channel
            .basic_nack(
                2,
                BasicNackOptions {
                    multiple: true,
                    requeue: true,
                },
            )
            .await
            .unwrap();

        assert!(!channel.dead_letter_tags.contains(1));
        assert!(channel.dead_letter_tags.contains(3));
    }

    #[tokio::test]
    async fn should_forget_tag_on_ack() {
        let mut mock = MockAmqpChannel::new();
        expect_dead_letter_setup(&mut mock, 0);
        mock.expect_basic_get()
            .returning(|_, _| Ok(Some(delivery(4))));
        mock.expect_basic_ack().times(1).returning(|_, _| Ok(()));

        let channel = channel(mock, 0, true);
        channel
            .queue_declare("q", QueueDeclareOptions::default(), FieldTable::default())
            .await
            .unwrap();
        channel
            .basic_get("q", BasicGetOptions { no_ack: false })
            .await
            .unwrap();
        channel
            .basic_ack(4, BasicAckOptions { multiple: false })
            .await
            .unwrap();

        assert!(channel.dead_letter_tags.is_empty());
    }

    fn requeue_at_end(fake: &Arc<FakeConnection>) -> RequeueAtEndConnection {
        RequeueAtEndConnection::new(fake.clone(), RequeueAtEndConfig::new(10, true))
    }

    async fn consume(channel: &Arc<dyn AmqpChannel>, no_ack: bool) -> Arc<RecordingHandler> {
        let handler = RecordingHandler::new();
        channel
            .basic_consume(
                "q",
                "c1",
                BasicConsumeOptions {
                    no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
                handler.clone(),
            )
            .await
            .unwrap();
        handler
    }

    #[tokio::test]
    async fn should_track_consumed_deliveries_of_marked_queue() {
        let fake = FakeConnection::new("rabbit1");
        let channel = requeue_at_end(&fake).create_channel().await.unwrap();
        channel
            .queue_declare("q", QueueDeclareOptions::default(), FieldTable::default())
            .await
            .unwrap();
        let handler = consume(&channel, false).await;
        let physical = fake.channels()[0].clone();

        physical.deliver("q", 3, b"retry").await;
        physical.deliver("q", 4, b"drop").await;
        channel
            .basic_reject(3, BasicRejectOptions { requeue: true })
            .await
            .unwrap();
        channel
            .basic_nack(
                4,
                BasicNackOptions {
                    multiple: false,
                    requeue: false,
                },
            )
            .await
            .unwrap();

        assert_eq!(handler.deliveries().len(), 2);
        assert_eq!(physical.rejected(), vec![(3, false)]);
        assert_eq!(physical.acked(), vec![(4, false)]);
        assert!(physical.nacked().is_empty());
    }

    #[tokio::test]
    async fn should_not_track_deliveries_of_auto_ack_consumers() {
        let fake = FakeConnection::new("rabbit1");
        let channel = requeue_at_end(&fake).create_channel().await.unwrap();
        channel
            .queue_declare("q", QueueDeclareOptions::default(), FieldTable::default())
            .await
            .unwrap();
        let handler = consume(&channel, true).await;
        let physical = fake.channels()[0].clone();

        physical.deliver("q", 3, b"m").await;
        channel
            .basic_reject(3, BasicRejectOptions { requeue: true })
            .await
            .unwrap();

        assert_eq!(handler.deliveries().len(), 1);
        assert_eq!(physical.rejected(), vec![(3, true)]);
    }

    #[tokio::test]
    async fn should_recognise_a_queue_marked_after_consuming_started() {
        let fake = FakeConnection::new("rabbit1");
        let connection = requeue_at_end(&fake);
        let consuming = connection.create_channel().await.unwrap();
        let declaring = connection.create_channel().await.unwrap();
        consume(&consuming, false).await;

        declaring
            .queue_declare("q", QueueDeclareOptions::default(), FieldTable::default())
            .await
            .unwrap();
        let physical = fake.channels()[0].clone();
        physical.deliver("q", 9, b"m").await;
        consuming
            .basic_nack(
                9,
                BasicNackOptions {
                    multiple: true,
                    requeue: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(physical.nacked(), vec![(9, true, false)]);
        assert!(physical.rejected().is_empty());
    }

    #[tokio::test]
    async fn should_share_marked_queues_across_channels() {
        let mut connection = MockAmqpConnection::new();
        connection.expect_create_channel().times(2).returning(|| {
            let mut mock = MockAmqpChannel::new();
            mock.expect_queue_declare()
                .returning(|queue, _, _| declared(queue));
            Ok(Arc::new(mock) as Arc<dyn AmqpChannel>)
        });

        let connection =
            RequeueAtEndConnection::new(Arc::new(connection), RequeueAtEndConfig::new(10, true));
        let declaring = connection.create_channel().await.unwrap();
        let _consuming = connection.create_channel().await.unwrap();

        declaring
            .queue_declare("q", QueueDeclareOptions::default(), FieldTable::default())
            .await
            .unwrap();

        assert!(is_marked(&connection.marked, "q"));
    }
}
