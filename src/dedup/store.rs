// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use crate::errors::DedupError;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

/// The atomic key-value contract deduplication relies on.
///
/// Keys are plain application keys; implementations prefix them with the
/// system name so several deployments can share one backend.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Stores `value` unless a live record exists.
    ///
    /// # Returns
    /// The value now stored under `key`: `value` when it was absent, the
    /// existing value otherwise.
    async fn put_if_absent(&self, key: &str, value: &str) -> Result<String, DedupError>;

    /// Like [`KeyValueStore::put_if_absent`], with the new record expiring
    /// after `ttl_secs` seconds.
    async fn put_if_absent_ttl(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<String, DedupError>;

    /// Unconditionally stores `value`, clearing any expiry.
    async fn put(&self, key: &str, value: &str) -> Result<(), DedupError>;

    /// Unconditionally stores `value`, expiring after `ttl_secs` seconds.
    async fn put_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), DedupError>;

    /// Sets the expiry of a live record. Missing keys are ignored.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), DedupError>;

    /// Atomically increments the counter under `key`, starting from 1.
    async fn increase(&self, key: &str) -> Result<i64, DedupError>;

    async fn get(&self, key: &str) -> Result<Option<String>, DedupError>;

    /// Removes every key given. Missing keys are ignored.
    async fn delete(&self, keys: &[String]) -> Result<(), DedupError>;
}

/// `"<system>:<key>"`
pub fn namespaced(system: &str, key: &str) -> String {
    format!("{system}:{key}")
}
