// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Executor
//!
//! Runs a fallible operation under a [`RetryPolicy`]. A failed attempt is
//! followed by the policy interval; after that pause the overall deadline is
//! checked first (`TimedOut`) and the attempt budget second (`Exhausted`).
//! An in-flight attempt is never interrupted.
//!
//! The executor is a plain value. [`RetryExecutor::with_executor`] returns a
//! copy whose attempts are spawned on the given tokio runtime handle; the
//! original is left untouched.

use crate::errors::RetryError;
use std::{future::Future, time::Duration};
use tokio::{
    runtime::Handle,
    task::{JoinError, JoinHandle},
    time::{sleep, Instant},
};
use tracing::{error, warn};

/// Bounds for a retried operation: attempt count, pause between attempts and
/// an optional wall-clock deadline for the whole operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    interval: Duration,
    deadline: Option<Duration>,
}

impl RetryPolicy {
    /// A zero `max_attempts` is treated as a single attempt.
    pub fn new(max_attempts: u32, interval: Duration, deadline: Option<Duration>) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            interval,
            deadline,
        }
    }

    /// A single attempt, no pause, no deadline.
    pub const fn once() -> Self {
        RetryPolicy {
            max_attempts: 1,
            interval: Duration::ZERO,
            deadline: None,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::once()
    }
}

/// Executes operations under a bound [`RetryPolicy`], either inline on the
/// calling task or with every attempt spawned on a runtime handle.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    executor: Option<Handle>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        RetryExecutor {
            policy,
            executor: None,
        }
    }

    /// Inline executor with the default single-attempt policy.
    pub fn synchronous() -> Self {
        RetryExecutor::default()
    }

    /// Returns a copy of this executor whose attempts run on `executor`.
    pub fn with_executor(&self, executor: Handle) -> Self {
        RetryExecutor {
            policy: self.policy,
            executor: Some(executor),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_executor_bound(&self) -> bool {
        self.executor.is_some()
    }

    /// Runs `operation` until it succeeds or the policy gives up.
    ///
    /// # Returns
    /// The first successful value, or a [`RetryError`] carrying the last
    /// failure and telling which bound was hit.
    pub async fn supply<T, E, F, Fut>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + From<JoinError> + Send + 'static,
    {
        let started = Instant::now();
        let mut attempts = 0;

        loop {
            attempts += 1;

            let err = match self.attempt(&operation).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            warn!(
                error = err.to_string(),
                attempt = attempts,
                max_attempts = self.policy.max_attempts,
                "attempt failed"
            );

            sleep(self.policy.interval).await;

            if let Some(deadline) = self.policy.deadline {
                let elapsed = started.elapsed();
                if elapsed >= deadline {
                    error!(error = err.to_string(), ?elapsed, "request timed out");
                    return Err(RetryError::TimedOut { elapsed, last: err });
                }
            }

            if attempts >= self.policy.max_attempts {
                error!(error = err.to_string(), attempts, "retries exhausted");
                return Err(RetryError::Exhausted {
                    attempts,
                    last: err,
                });
            }
        }
    }

    /// Starts [`RetryExecutor::supply`] in the background and hands back a
    /// deferred result. Uses the bound executor when there is one, the
    /// current runtime otherwise.
    pub fn spawn<T, E, F, Fut>(&self, operation: F) -> JoinHandle<Result<T, RetryError<E>>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + From<JoinError> + Send + 'static,
    {
        let this = self.clone();
        let task = async move { this.supply(operation).await };

        match &self.executor {
            Some(handle) => handle.spawn(task),
            None => tokio::spawn(task),
        }
    }

    async fn attempt<T, E, F, Fut>(&self, operation: &F) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<JoinError> + Send + 'static,
    {
        match &self.executor {
            None => operation().await,
            Some(handle) => match handle.spawn(operation()).await {
                Ok(result) => result,
                Err(err) => Err(E::from(err)),
            },
        }
    }
}
