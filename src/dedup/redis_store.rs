// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Redis Deduplication Store
//!
//! [`KeyValueStore`] backed by redis. Every request runs under the store's
//! retry policy and picks up the current connection on each attempt, so a
//! master switch made by the failover manager applies to requests already
//! retrying. The connection is a [`ConnectionManager`]: a command failing
//! on a dropped socket makes it reconnect to the same address, so the next
//! attempt can succeed after a short redis restart. A failed request is reported as either
//! [`DedupError::RequestFailed`] (attempts exhausted) or
//! [`DedupError::RequestTimedOut`] (failover deadline elapsed).

use super::{
    address::resolve_redis_address,
    failover::MasterSwitch,
    store::{namespaced, KeyValueStore},
};
use crate::{
    config::BeetleConfig,
    errors::DedupError,
    retry::{RetryExecutor, RetryPolicy},
};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use redis::{
    aio::{ConnectionManager, ConnectionManagerConfig},
    AsyncCommands, Client, Script,
};
use std::{future::Future, sync::Arc};
use tracing::{debug, error, info};

/// Returns the stored value, setting it first when the key is absent.
/// A positive `ARGV[2]` is the expiry in seconds.
const CLAIM_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if current then
  return current
end
if tonumber(ARGV[2]) > 0 then
  redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
else
  redis.call('SET', KEYS[1], ARGV[1])
end
return ARGV[1]
";

pub struct RedisDedupStore {
    system: String,
    address: ArcSwap<String>,
    connection: Arc<ArcSwap<ConnectionManager>>,
    executor: RetryExecutor,
}

impl RedisDedupStore {
    /// Connects to the redis server named by `server`.
    ///
    /// # Parameters
    /// * `server` - Literal `host:port` or path of a master file
    /// * `system` - Namespace prefixed to every key
    /// * `policy` - Retry policy of every request
    ///
    /// # Errors
    /// [`DedupError::InvalidAddress`] when `server` cannot be resolved and
    /// [`DedupError::CannotConnect`] when the resolved address is unreachable.
    pub async fn connect(
        server: &str,
        system: &str,
        policy: RetryPolicy,
    ) -> Result<RedisDedupStore, DedupError> {
        let address = resolve_redis_address(server, system)?;
        let connection = open(&address).await?;
        info!(address = address.as_str(), system, "deduplication store connected");

        Ok(RedisDedupStore {
            system: system.to_owned(),
            address: ArcSwap::from_pointee(address),
            connection: Arc::new(ArcSwap::from_pointee(connection)),
            executor: RetryExecutor::new(policy),
        })
    }

    pub async fn from_config(config: &BeetleConfig) -> Result<RedisDedupStore, DedupError> {
        RedisDedupStore::connect(
            &config.redis_server,
            &config.system_name,
            config.store_retry_policy(),
        )
        .await
    }

    /// The `host:port` of the master currently in use.
    pub fn address(&self) -> String {
        self.address.load().as_ref().clone()
    }

    async fn request<T, F, Fut>(&self, operation: F) -> Result<T, DedupError>
    where
        F: Fn(ConnectionManager) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, DedupError>> + Send + 'static,
        T: Send + 'static,
    {
        let connection = self.connection.clone();
        self.executor
            .supply(move || operation(connection.load().as_ref().clone()))
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    address = %self.address(),
                    "deduplication store request failed"
                );
                DedupError::from(err)
            })
    }

    async fn claim(&self, key: &str, value: &str, ttl_secs: u64) -> Result<String, DedupError> {
        let (key, value) = (namespaced(&self.system, key), value.to_owned());
        self.request(move |mut connection| {
            let (key, value) = (key.clone(), value.clone());
            async move {
                let script = Script::new(CLAIM_SCRIPT);
                let stored: String = script
                    .key(key)
                    .arg(value)
                    .arg(ttl_secs)
                    .invoke_async(&mut connection)
                    .await?;
                Ok(stored)
            }
        })
        .await
    }
}

/// Opens a managed connection to `address`. The first connect is tried once
/// so construction fails fast; reconnects after a drop are the manager's.
async fn open(address: &str) -> Result<ConnectionManager, DedupError> {
    let client = Client::open(format!("redis://{address}/")).map_err(|err| {
        error!(error = err.to_string(), address, "invalid redis address");
        DedupError::InvalidAddress
    })?;

    let config = ConnectionManagerConfig::new().set_number_of_retries(0);
    ConnectionManager::new_with_config(client, config)
        .await
        .map_err(|err| {
            error!(error = err.to_string(), address, "failure to connect to redis");
            DedupError::CannotConnect(address.to_owned())
        })
}

#[async_trait]
impl KeyValueStore for RedisDedupStore {
    async fn put_if_absent(&self, key: &str, value: &str) -> Result<String, DedupError> {
        self.claim(key, value, 0).await
    }

    async fn put_if_absent_ttl(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<String, DedupError> {
        self.claim(key, value, ttl_secs.max(1)).await
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), DedupError> {
        let (key, value) = (namespaced(&self.system, key), value.to_owned());
        self.request(move |mut connection| {
            let (key, value) = (key.clone(), value.clone());
            async move {
                let _: () = connection.set(key, value).await?;
                Ok(())
            }
        })
        .await
    }

    async fn put_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), DedupError> {
        let (key, value) = (namespaced(&self.system, key), value.to_owned());
        let ttl_secs = ttl_secs.max(1);
        self.request(move |mut connection| {
            let (key, value) = (key.clone(), value.clone());
            async move {
                let _: () = connection.set_ex(key, value, ttl_secs).await?;
                Ok(())
            }
        })
        .await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), DedupError> {
        let key = namespaced(&self.system, key);
        let ttl_secs = i64::try_from(ttl_secs.max(1)).unwrap_or(i64::MAX);
        self.request(move |mut connection| {
            let key = key.clone();
            async move {
                let _: bool = connection.expire(key, ttl_secs).await?;
                Ok(())
            }
        })
        .await
    }

    async fn increase(&self, key: &str) -> Result<i64, DedupError> {
        let key = namespaced(&self.system, key);
        self.request(move |mut connection| {
            let key = key.clone();
            async move {
                let value: i64 = connection.incr(key, 1).await?;
                Ok(value)
            }
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, DedupError> {
        let key = namespaced(&self.system, key);
        self.request(move |mut connection| {
            let key = key.clone();
            async move {
                let value: Option<String> = connection.get(key).await?;
                Ok(value)
            }
        })
        .await
    }

    async fn delete(&self, keys: &[String]) -> Result<(), DedupError> {
        if keys.is_empty() {
            return Ok(());
        }

        let keys = keys
            .iter()
            .map(|key| namespaced(&self.system, key))
            .collect::<Vec<_>>();
        self.request(move |mut connection| {
            let keys = keys.clone();
            async move {
                let _: () = connection.del(keys).await?;
                Ok(())
            }
        })
        .await
    }
}

#[async_trait]
impl MasterSwitch for RedisDedupStore {
    /// Connects to `address` and routes every later request there. The
    /// current connection is kept when the new master is unreachable.
    async fn reconnect(&self, address: &str) -> Result<(), DedupError> {
        let connection = open(address).await?;
        self.connection.store(Arc::new(connection));
        self.address.store(Arc::new(address.to_owned()));
        debug!(address, "deduplication store switched master");
        Ok(())
    }
}
