// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Redis Master Failover
//!
//! An external failover manager writes the address of the current redis
//! master into a file. [`RedisFailoverManager`] polls that file and points
//! the store at the new master when the content changes. Nothing it runs
//! into is fatal: unreadable or malformed files are logged and looked at
//! again on the next poll.

use super::address::parse_host_port;
use crate::errors::DedupError;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Something that can be pointed at a new redis master.
#[async_trait]
pub trait MasterSwitch: Send + Sync {
    async fn reconnect(&self, address: &str) -> Result<(), DedupError>;
}

pub struct RedisFailoverManager {
    switch: Arc<dyn MasterSwitch>,
    master_file: PathBuf,
    current_master: ArcSwap<String>,
}

impl RedisFailoverManager {
    /// # Parameters
    /// * `switch` - The store to reconnect
    /// * `master_file` - File naming the current master as `host:port`
    /// * `initial_master` - The master the store is connected to now
    pub fn new(switch: Arc<dyn MasterSwitch>, master_file: PathBuf, initial_master: &str) -> Self {
        RedisFailoverManager {
            switch,
            master_file,
            current_master: ArcSwap::from_pointee(initial_master.to_owned()),
        }
    }

    pub fn current_master(&self) -> String {
        self.current_master.load().as_ref().clone()
    }

    /// Reads the master file once and switches when it names a new master.
    ///
    /// # Returns
    /// Whether the store was switched to a new master
    pub async fn poll(&self) -> bool {
        let content = match tokio::fs::read_to_string(&self.master_file).await {
            Ok(content) => content,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    file = %self.master_file.display(),
                    "failure to read redis master file, retrying"
                );
                return false;
            }
        };

        let master = content.replace(['\n', '\r'], "");
        let current = self.current_master();
        if master == current {
            return false;
        }

        info!(from = current.as_str(), to = master.as_str(), "redis master file changed");

        if parse_host_port(&master).is_none() {
            warn!(
                content = master.as_str(),
                file = %self.master_file.display(),
                "invalid content in redis master file, not performing master switch"
            );
            return false;
        }

        match self.switch.reconnect(&master).await {
            Ok(()) => {
                self.current_master.store(Arc::new(master));
                true
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    master = master.as_str(),
                    "failure to switch redis master",
                );
                false
            }
        }
    }

    /// Polls the master file every `interval` until the task is aborted.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if self.poll().await {
                    debug!(master = self.current_master().as_str(), "redis master switched");
                }
            }
        })
    }
}
