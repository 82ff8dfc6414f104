// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Deduplication
//!
//! Turns the at-least-once delivery of a redundant connection into
//! effectively-once processing. A message's id is claimed in a shared
//! key-value store before the listener runs; later copies of the message
//! find the claim and are acknowledged without running the listener again.

pub mod address;
pub mod failover;
pub mod handler;
pub mod memory;
pub mod redis_store;
pub mod store;

pub use failover::{MasterSwitch, RedisFailoverManager};
pub use handler::{
    ChannelMessageAdapter, DedupDeliveryHandler, DedupStore, HandlingConfig, MessageAdapter,
    MessageListener,
};
pub use memory::InMemoryDedupStore;
pub use redis_store::RedisDedupStore;
pub use store::KeyValueStore;
