// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Factory
//!
//! Builds the logical connection an application holds. Every configured
//! broker address gets one physical connection, established through the
//! factory's [`RetryExecutor`] and decorated in a fixed order:
//!
//! ```text
//! lapin -> retrying -> requeue-at-end -> multiplexing
//! ```
//!
//! The decorated members are then merged into a [`RedundantConnection`].
//! Addresses that cannot be reached are left out unless none is left.

use crate::{
    amqp::AmqpConnection,
    channel::LapinConnection,
    config::{BeetleConfig, BrokerAddress},
    errors::{AmqpError, RetryError},
    multiplex::MultiplexingConnection,
    redundant::RedundantConnection,
    requeue::{RequeueAtEndConfig, RequeueAtEndConnection},
    retry::RetryExecutor,
    retrying::RetryingConnection,
};
use async_trait::async_trait;
use futures_util::future::join_all;
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{error, info};

/// Source of the broker addresses a connection is built from.
pub trait AddressResolver: Send + Sync {
    fn resolve(&self) -> Result<Vec<BrokerAddress>, AmqpError>;
}

/// A fixed address list.
#[derive(Debug, Clone)]
pub struct ListAddressResolver {
    addresses: Vec<BrokerAddress>,
}

impl ListAddressResolver {
    pub fn new(addresses: Vec<BrokerAddress>) -> Self {
        ListAddressResolver { addresses }
    }
}

impl AddressResolver for ListAddressResolver {
    fn resolve(&self) -> Result<Vec<BrokerAddress>, AmqpError> {
        if self.addresses.is_empty() {
            return Err(AmqpError::ConfigurationError(
                "no broker address to connect to".to_owned(),
            ));
        }
        Ok(self.addresses.clone())
    }
}

/// Opens exactly one physical connection to one address.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &BrokerAddress)
        -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

pub struct LapinConnector {
    connection_name: String,
}

impl LapinConnector {
    pub fn new(connection_name: &str) -> Self {
        LapinConnector {
            connection_name: connection_name.to_owned(),
        }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(
        &self,
        address: &BrokerAddress,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        let connection = LapinConnection::connect(address, &self.connection_name).await?;
        Ok(Arc::new(connection))
    }
}

pub struct BeetleConnectionFactory {
    resolver: Arc<dyn AddressResolver>,
    connector: Arc<dyn Connector>,
    executor: RetryExecutor,
    requeue: RequeueAtEndConfig,
}

impl BeetleConnectionFactory {
    pub fn new(
        resolver: Arc<dyn AddressResolver>,
        connector: Arc<dyn Connector>,
        executor: RetryExecutor,
        requeue: RequeueAtEndConfig,
    ) -> Self {
        BeetleConnectionFactory {
            resolver,
            connector,
            executor,
            requeue,
        }
    }

    /// Factory for the brokers, retry policy and requeue settings of `config`.
    pub fn from_config(config: &BeetleConfig) -> Result<Self, AmqpError> {
        Ok(BeetleConnectionFactory::new(
            Arc::new(ListAddressResolver::new(config.broker_addresses()?)),
            Arc::new(LapinConnector::new(&config.connection_name)),
            RetryExecutor::new(config.connection_retry_policy()),
            config.requeue_at_end(),
        ))
    }

    /// Connects to every resolved address and returns the logical connection.
    ///
    /// # Parameters
    /// * `executor` - When given, connection attempts run on this runtime and
    ///   the addresses are established concurrently. Otherwise they are
    ///   established one after the other on the calling task.
    ///
    /// # Returns
    /// A [`RedundantConnection`] over every address that could be reached, or
    /// an error when none could.
    pub async fn new_connection(
        &self,
        executor: Option<Handle>,
    ) -> Result<RedundantConnection, AmqpError> {
        let addresses = self.resolver.resolve()?;
        let retry = match executor {
            Some(handle) => self.executor.with_executor(handle),
            None => self.executor.clone(),
        };

        let established = if retry.is_executor_bound() {
            let pending = addresses
                .iter()
                .map(|address| self.establish_in_background(&retry, address.clone()));
            join_all(pending).await
        } else {
            let mut established = Vec::with_capacity(addresses.len());
            for address in &addresses {
                established.push(self.establish(&retry, address.clone()).await);
            }
            established
        };

        let mut members = Vec::with_capacity(addresses.len());
        for (address, result) in addresses.iter().zip(established) {
            match result {
                Ok(physical) => {
                    info!(address = address.to_string(), "broker member connected");
                    members.push(self.decorate(physical, &retry));
                }
                Err(err) => error!(
                    error = err.to_string(),
                    address = address.to_string(),
                    "broker member dropped from connection"
                ),
            }
        }

        if members.is_empty() {
            let names = addresses
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            return Err(AmqpError::NoMemberAvailable(names));
        }

        Ok(RedundantConnection::new(members))
    }

    async fn establish(
        &self,
        retry: &RetryExecutor,
        address: BrokerAddress,
    ) -> Result<Arc<dyn AmqpConnection>, RetryError<AmqpError>> {
        let connector = self.connector.clone();
        retry
            .supply(move || {
                let connector = connector.clone();
                let address = address.clone();
                async move { connector.connect(&address).await }
            })
            .await
    }

    async fn establish_in_background(
        &self,
        retry: &RetryExecutor,
        address: BrokerAddress,
    ) -> Result<Arc<dyn AmqpConnection>, RetryError<AmqpError>> {
        let connector = self.connector.clone();
        let task = retry.spawn(move || {
            let connector = connector.clone();
            let address = address.clone();
            async move { connector.connect(&address).await }
        });

        match task.await {
            Ok(result) => result,
            Err(err) => Err(RetryError::Exhausted {
                attempts: 0,
                last: AmqpError::from(err),
            }),
        }
    }

    fn decorate(
        &self,
        physical: Arc<dyn AmqpConnection>,
        retry: &RetryExecutor,
    ) -> Arc<dyn AmqpConnection> {
        let retrying = Arc::new(RetryingConnection::new(physical, retry.clone()));
        let requeue = Arc::new(RequeueAtEndConnection::new(retrying, self.requeue));
        Arc::new(MultiplexingConnection::new(requeue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{amqp::AmqpChannel, retry::RetryPolicy, testing::FakeConnection};
    use lapin::{options::QueueDeclareOptions, types::FieldTable};
    use std::{collections::HashMap, time::Duration};

    fn factory(
        connector: MockConnector,
        hosts: &[&str],
        requeue: RequeueAtEndConfig,
    ) -> BeetleConnectionFactory {
        let addresses = hosts
            .iter()
            .map(|host| BrokerAddress::new(host, 5672))
            .collect();

        BeetleConnectionFactory::new(
            Arc::new(ListAddressResolver::new(addresses)),
            Arc::new(connector),
            RetryExecutor::new(RetryPolicy::new(2, Duration::ZERO, None)),
            requeue,
        )
    }

    fn connector(healthy: HashMap<&'static str, Arc<FakeConnection>>) -> MockConnector {
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(move |address| {
            match healthy.get(address.host.as_str()) {
                Some(connection) => Ok(connection.clone() as Arc<dyn AmqpConnection>),
                None => Err(AmqpError::ConnectionError(address.to_string())),
            }
        });
        connector
    }

    #[tokio::test]
    async fn should_connect_every_address_in_order() {
        let healthy = HashMap::from([
            ("rabbit1", FakeConnection::new("rabbit1")),
            ("rabbit2", FakeConnection::new("rabbit2")),
        ]);
        let factory = factory(
            connector(healthy),
            &["rabbit1", "rabbit2"],
            RequeueAtEndConfig::disabled(),
        );

        let connection = factory.new_connection(None).await.unwrap();

        assert_eq!(connection.name(), "rabbit1,rabbit2");
    }

    #[tokio::test]
    async fn should_drop_unreachable_addresses() {
        let healthy = HashMap::from([("rabbit2", FakeConnection::new("rabbit2"))]);
        let factory = factory(
            connector(healthy),
            &["rabbit1", "rabbit2"],
            RequeueAtEndConfig::disabled(),
        );

        let connection = factory.new_connection(None).await.unwrap();

        assert_eq!(connection.members().len(), 1);
        assert_eq!(connection.name(), "rabbit2");
    }

    #[tokio::test]
    async fn should_retry_each_address_before_dropping_it() {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .times(2)
            .returning(|address| Err(AmqpError::ConnectionError(address.to_string())));
        let factory = factory(connector, &["rabbit1"], RequeueAtEndConfig::disabled());

        let result = factory.new_connection(None).await;

        assert_eq!(
            result.err(),
            Some(AmqpError::NoMemberAvailable("rabbit1:5672/".to_owned()))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn should_connect_concurrently_on_an_executor() {
        let healthy = HashMap::from([
            ("rabbit1", FakeConnection::new("rabbit1")),
            ("rabbit2", FakeConnection::new("rabbit2")),
            ("rabbit3", FakeConnection::new("rabbit3")),
        ]);
        let factory = factory(
            connector(healthy),
            &["rabbit1", "rabbit2", "rabbit3", "rabbit4"],
            RequeueAtEndConfig::disabled(),
        );

        let connection = factory
            .new_connection(Some(Handle::current()))
            .await
            .unwrap();

        assert_eq!(connection.name(), "rabbit1,rabbit2,rabbit3");
    }

    #[tokio::test]
    async fn should_decorate_members_with_requeue_at_end() {
        let physical = FakeConnection::new("rabbit1");
        let healthy = HashMap::from([("rabbit1", physical.clone())]);
        let factory = factory(
            connector(healthy),
            &["rabbit1"],
            RequeueAtEndConfig::new(5000, true),
        );

        let connection = factory.new_connection(None).await.unwrap();
        let channel: Arc<dyn AmqpChannel> = connection.create_channel().await.unwrap();
        channel
            .queue_declare("orders", QueueDeclareOptions::default(), FieldTable::default())
            .await
            .unwrap();

        assert_eq!(
            physical.channels()[0].declared(),
            vec!["orders_dead_letter".to_owned(), "orders".to_owned()]
        );
    }

    #[test]
    fn should_refuse_an_empty_address_list() {
        assert!(ListAddressResolver::new(vec![]).resolve().is_err());
    }
}
