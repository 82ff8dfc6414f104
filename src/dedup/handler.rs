// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handling
//!
//! Runs an application listener at most once per message id, even when the
//! message arrives once per broker member or is redelivered after a crash.
//!
//! For a message with key `k` the store holds, both expiring after the
//! status TTL:
//! - `k:status`: the token of the delivery currently processing it, or
//!   `completed` once the listener succeeded
//! - `k:attempts`: how many deliveries claimed the message so far
//!
//! Whoever sets `k:status` first runs the listener; every other copy is
//! acknowledged as a duplicate. A failed listener releases the claim and
//! requeues the message so a later delivery can try again, until the
//! attempt limit drops it. A claim that cannot be released would make the
//! redelivery look like a duplicate, so the message is then left unsettled
//! and [`HandlerError::ClaimNotReleased`] is returned.

use super::store::KeyValueStore;
use crate::{
    amqp::{AmqpChannel, Delivery, DeliveryHandler},
    errors::HandlerError,
    otel,
    publisher::EXPIRES_AT_HEADER,
};
use async_trait::async_trait;
use lapin::{
    options::{BasicAckOptions, BasicRejectOptions},
    types::{AMQPValue, ShortString},
};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
    Context,
};
use std::{
    borrow::Cow,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Status value of a message whose listener succeeded.
pub const COMPLETED: &str = "completed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlingConfig {
    /// Lifetime of a processing claim and of the records kept after it.
    pub status_ttl_secs: u64,
    /// Deliveries allowed to run the listener before a message is dropped.
    pub max_attempts: i64,
}

impl Default for HandlingConfig {
    fn default() -> Self {
        HandlingConfig {
            status_ttl_secs: 86_400,
            max_attempts: 3,
        }
    }
}

/// What [`DedupStore::handle`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlingOutcome {
    /// Past its expiry, acknowledged without running the listener
    Expired,
    /// Listener succeeded, acknowledged
    Completed,
    /// Another delivery claimed the message first, acknowledged
    Duplicate,
    /// Listener failed, requeued
    Failed,
    /// Attempt limit reached, acknowledged without running the listener
    Dropped,
}

/// Transport view of a message.
#[async_trait]
pub trait MessageAdapter<M: Sync>: Send + Sync {
    /// Deduplication key, `None` when the message carries no identity.
    fn key_of(&self, message: &M) -> Option<String>;

    /// Expiry in seconds since the epoch.
    fn expires_at(&self, message: &M) -> Option<i64>;

    async fn acknowledge(&self, message: &M) -> Result<(), HandlerError>;

    async fn requeue(&self, message: &M) -> Result<(), HandlerError>;
}

/// The application callback.
#[async_trait]
pub trait MessageListener<M: Sync>: Send + Sync {
    async fn on_message(&self, ctx: &Context, message: &M) -> Result<(), HandlerError>;
}

pub struct DedupStore {
    store: Arc<dyn KeyValueStore>,
    config: HandlingConfig,
}

impl DedupStore {
    pub fn new(store: Arc<dyn KeyValueStore>, config: HandlingConfig) -> Self {
        DedupStore { store, config }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Runs `listener` for `message` unless the message expired or another
    /// delivery already claimed it, then settles the message via `adapter`.
    ///
    /// # Errors
    /// Store and settlement failures. The message is left unsettled in that
    /// case, and no claim is held for it unless the error is
    /// [`HandlerError::ClaimNotReleased`].
    pub async fn handle<M, A, L>(
        &self,
        ctx: &Context,
        message: &M,
        adapter: &A,
        listener: &L,
    ) -> Result<HandlingOutcome, HandlerError>
    where
        M: Sync,
        A: MessageAdapter<M> + ?Sized,
        L: MessageListener<M> + ?Sized,
    {
        if let Some(expires_at) = adapter.expires_at(message) {
            if expires_at < now_secs() {
                debug!(expires_at, "dropping expired message");
                adapter.acknowledge(message).await?;
                return Ok(HandlingOutcome::Expired);
            }
        }

        let Some(key) = adapter.key_of(message) else {
            return match listener.on_message(ctx, message).await {
                Ok(()) => {
                    adapter.acknowledge(message).await?;
                    Ok(HandlingOutcome::Completed)
                }
                Err(err) => {
                    warn!(error = err.to_string(), "listener failed, requeuing message");
                    adapter.requeue(message).await?;
                    Ok(HandlingOutcome::Failed)
                }
            };
        };

        let status_key = format!("{key}:status");
        let token = Uuid::new_v4().to_string();
        let claimed = self
            .store
            .put_if_absent_ttl(&status_key, &token, self.config.status_ttl_secs)
            .await?;

        if claimed != token {
            debug!(key = key.as_str(), status = claimed.as_str(), "duplicate delivery");
            adapter.acknowledge(message).await?;
            return Ok(HandlingOutcome::Duplicate);
        }

        let attempts_key = format!("{key}:attempts");
        let attempts = match self.store.increase(&attempts_key).await {
            Ok(attempts) => attempts,
            Err(err) => {
                self.release(&key, &status_key).await?;
                return Err(err.into());
            }
        };
        if let Err(err) = self
            .store
            .expire(&attempts_key, self.config.status_ttl_secs)
            .await
        {
            warn!(
                error = err.to_string(),
                key = key.as_str(),
                "failure to set attempts expiry"
            );
        }

        if attempts > self.config.max_attempts {
            error!(
                key = key.as_str(),
                attempts,
                max_attempts = self.config.max_attempts,
                "too many attempts, dropping message"
            );
            adapter.acknowledge(message).await?;
            return Ok(HandlingOutcome::Dropped);
        }

        match listener.on_message(ctx, message).await {
            Ok(()) => {
                // The claim token still marks the message as taken.
                if let Err(err) = self
                    .store
                    .put_ttl(&status_key, COMPLETED, self.config.status_ttl_secs)
                    .await
                {
                    warn!(
                        error = err.to_string(),
                        key = key.as_str(),
                        "failure to mark message completed"
                    );
                }
                adapter.acknowledge(message).await?;
                Ok(HandlingOutcome::Completed)
            }
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    key = key.as_str(),
                    attempts,
                    "listener failed, requeuing message"
                );
                self.release(&key, &status_key).await?;
                adapter.requeue(message).await?;
                Ok(HandlingOutcome::Failed)
            }
        }
    }

    async fn release(&self, key: &str, status_key: &str) -> Result<(), HandlerError> {
        self.store
            .delete(&[status_key.to_owned()])
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    key, "failure to release claim, leaving message unsettled"
                );
                HandlerError::ClaimNotReleased(err)
            })
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|now| i64::try_from(now.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// [`MessageAdapter`] for deliveries of a logical channel.
pub struct ChannelMessageAdapter {
    channel: Arc<dyn AmqpChannel>,
    reject_and_requeue: bool,
}

impl ChannelMessageAdapter {
    /// # Parameters
    /// * `channel` - The channel the deliveries were consumed from
    /// * `reject_and_requeue` - Whether a failed message goes back to its
    ///   queue; with requeue-at-end enabled this is the delayed path
    pub fn new(channel: Arc<dyn AmqpChannel>, reject_and_requeue: bool) -> Self {
        ChannelMessageAdapter {
            channel,
            reject_and_requeue,
        }
    }
}

#[async_trait]
impl MessageAdapter<Delivery> for ChannelMessageAdapter {
    fn key_of(&self, message: &Delivery) -> Option<String> {
        message
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.to_string())
            .filter(|id| !id.is_empty())
    }

    fn expires_at(&self, message: &Delivery) -> Option<i64> {
        let headers = message.properties.headers().as_ref()?;
        match headers.inner().get(&ShortString::from(EXPIRES_AT_HEADER))? {
            AMQPValue::LongLongInt(v) => Some(*v),
            AMQPValue::LongInt(v) => Some(i64::from(*v)),
            AMQPValue::LongUInt(v) => Some(i64::from(*v)),
            AMQPValue::ShortInt(v) => Some(i64::from(*v)),
            AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
            AMQPValue::Timestamp(v) => i64::try_from(*v).ok(),
            AMQPValue::ShortString(v) => v.as_str().trim().parse().ok(),
            AMQPValue::LongString(v) => {
                std::str::from_utf8(v.as_bytes()).ok()?.trim().parse().ok()
            }
            _ => None,
        }
    }

    async fn acknowledge(&self, message: &Delivery) -> Result<(), HandlerError> {
        self.channel
            .basic_ack(message.delivery_tag, BasicAckOptions { multiple: false })
            .await?;
        Ok(())
    }

    async fn requeue(&self, message: &Delivery) -> Result<(), HandlerError> {
        self.channel
            .basic_reject(
                message.delivery_tag,
                BasicRejectOptions {
                    requeue: self.reject_and_requeue,
                },
            )
            .await?;
        Ok(())
    }
}

/// Consumer callback running every delivery through [`DedupStore::handle`]
/// inside a consumer span.
pub struct DedupDeliveryHandler {
    store: Arc<DedupStore>,
    adapter: ChannelMessageAdapter,
    listener: Arc<dyn MessageListener<Delivery>>,
    tracer: BoxedTracer,
}

impl DedupDeliveryHandler {
    pub fn new(
        store: Arc<DedupStore>,
        channel: Arc<dyn AmqpChannel>,
        listener: Arc<dyn MessageListener<Delivery>>,
        reject_and_requeue: bool,
    ) -> Self {
        DedupDeliveryHandler {
            store,
            adapter: ChannelMessageAdapter::new(channel, reject_and_requeue),
            listener,
            tracer: global::tracer("beetle"),
        }
    }
}

#[async_trait]
impl DeliveryHandler for DedupDeliveryHandler {
    async fn handle(&self, delivery: Delivery) {
        let msg_type = delivery
            .properties
            .kind()
            .as_ref()
            .map(|kind| kind.to_string())
            .unwrap_or_default();
        let (ctx, mut span) = otel::new_span(&delivery.properties, &self.tracer, &msg_type);

        debug!(
            msg_type = msg_type.as_str(),
            queue = delivery.queue.as_str(),
            delivery_tag = delivery.delivery_tag,
            "received"
        );

        match self
            .store
            .handle(&ctx, &delivery, &self.adapter, self.listener.as_ref())
            .await
        {
            Ok(HandlingOutcome::Failed) => {
                span.set_status(Status::Error {
                    description: Cow::from("listener failed, message requeued"),
                });
            }
            Ok(outcome) => {
                debug!(?outcome, "message handled");
                span.set_status(Status::Ok);
            }
            Err(err @ HandlerError::ClaimNotReleased(_)) => {
                error!(error = err.to_string(), "failure to handle message, left unsettled");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("claim not released, message left unsettled"),
                });
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to handle message, requeuing");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("failure to handle message"),
                });
                if let Err(err) = self.adapter.requeue(&delivery).await {
                    error!(error = err.to_string(), "failure to requeue message");
                }
            }
        }
    }
}
