// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Beetle
//!
//! Effectively-once messaging on top of a cluster of AMQP brokers and a
//! shared redis store. Messages are published to every broker member and
//! consumed from all of them; the deduplication store collapses the copies
//! so each message is processed once.

mod otel;
mod tags;
#[cfg(test)]
mod testing;

pub mod amqp;
pub mod channel;
pub mod config;
pub mod dedup;
pub mod errors;
pub mod factory;
pub mod multiplex;
pub mod publisher;
pub mod redundant;
pub mod requeue;
pub mod retry;
pub mod retrying;

pub use otel::new_span;
pub use tags::{DeliveryTagMapper, DeliveryTagSet, Settlement};
