// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-process [`KeyValueStore`] for single-node deployments and tests.

use super::store::{namespaced, KeyValueStore};
use crate::errors::DedupError;
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Record {
    value: String,
    expires_at: Option<Instant>,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expires_at| now < expires_at)
    }
}

/// Expired records are dropped at most this often, on the next write.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Records {
    entries: HashMap<String, Record>,
    swept_at: Instant,
}

impl Records {
    fn sweep(&mut self, now: Instant) {
        if now.duration_since(self.swept_at) < SWEEP_INTERVAL {
            return;
        }
        self.entries.retain(|_, record| record.is_live(now));
        self.swept_at = now;
    }
}

#[derive(Debug)]
pub struct InMemoryDedupStore {
    system: String,
    records: Mutex<Records>,
}

impl InMemoryDedupStore {
    pub fn new(system: &str) -> Self {
        InMemoryDedupStore {
            system: system.to_owned(),
            records: Mutex::new(Records {
                entries: HashMap::new(),
                swept_at: Instant::now(),
            }),
        }
    }

    fn records(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(&self, key: &str, value: &str, ttl: Option<Duration>) -> String {
        let now = Instant::now();
        let mut records = self.records();
        records.sweep(now);
        let key = namespaced(&self.system, key);

        if let Some(existing) = records.entries.get(&key).filter(|record| record.is_live(now)) {
            return existing.value.clone();
        }

        records.entries.insert(
            key,
            Record {
                value: value.to_owned(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        value.to_owned()
    }

    fn store(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let now = Instant::now();
        let mut records = self.records();
        records.sweep(now);
        records.entries.insert(
            namespaced(&self.system, key),
            Record {
                value: value.to_owned(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
    }
}

#[async_trait]
impl KeyValueStore for InMemoryDedupStore {
    async fn put_if_absent(&self, key: &str, value: &str) -> Result<String, DedupError> {
        Ok(self.claim(key, value, None))
    }

    async fn put_if_absent_ttl(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<String, DedupError> {
        Ok(self.claim(key, value, Some(Duration::from_secs(ttl_secs))))
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), DedupError> {
        self.store(key, value, None);
        Ok(())
    }

    async fn put_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), DedupError> {
        self.store(key, value, Some(Duration::from_secs(ttl_secs)));
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), DedupError> {
        let now = Instant::now();
        let mut records = self.records();
        if let Some(record) = records
            .entries
            .get_mut(&namespaced(&self.system, key))
            .filter(|record| record.is_live(now))
        {
            record.expires_at = Some(now + Duration::from_secs(ttl_secs));
        }
        Ok(())
    }

    async fn increase(&self, key: &str) -> Result<i64, DedupError> {
        let now = Instant::now();
        let mut records = self.records();
        records.sweep(now);
        let record = records
            .entries
            .entry(namespaced(&self.system, key))
            .or_insert_with(|| Record {
                value: "0".to_owned(),
                expires_at: None,
            });

        if !record.is_live(now) {
            record.value = "0".to_owned();
            record.expires_at = None;
        }

        let next = record
            .value
            .parse::<i64>()
            .ok()
            .and_then(|current| current.checked_add(1))
            .ok_or_else(|| {
                DedupError::Redis("value is not an integer or out of range".to_owned())
            })?;
        record.value = next.to_string();

        Ok(next)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, DedupError> {
        let now = Instant::now();
        Ok(self
            .records()
            .entries
            .get(&namespaced(&self.system, key))
            .filter(|record| record.is_live(now))
            .map(|record| record.value.clone()))
    }

    async fn delete(&self, keys: &[String]) -> Result<(), DedupError> {
        let mut records = self.records();
        for key in keys {
            records.entries.remove(&namespaced(&self.system, key));
        }
        Ok(())
    }
}
