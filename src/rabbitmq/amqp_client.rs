// src/rabbitmq/amqp_client.rs
//! Seam between the producer and the AMQP client library.
//!
//! The producer only needs a handful of broker capabilities: open a
//! connection, open a channel, passive-declare an exchange, publish, and
//! drive a transaction. They are expressed as traits so the lapin-backed
//! client and the in-memory broker are interchangeable.

use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, ExchangeDeclareOptions},
    types::FieldTable,
    uri::{AMQPAuthority, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::debug;

use super::errors::{RabbitMQError, Result};
use crate::config::ConnectionConfig;

/// Opens connections; one call is one connection attempt.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    type Connection: BrokerConnection;

    async fn connect(&self, config: &ConnectionConfig) -> Result<Self::Connection>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    type Channel: BrokerChannel;

    fn is_ready(&self) -> bool;

    async fn create_channel(&self) -> Result<Self::Channel>;

    async fn close(&self) -> Result<()>;
}

/// Channel operations. Channels are cheap handles that can be moved into a
/// spawned task to resolve a [`super::completion::Completion`].
#[async_trait]
pub trait BrokerChannel: Clone + Send + Sync + 'static {
    /// Passive declare: succeeds only if the exchange already exists with this kind.
    async fn check_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    /// Hand the message to the client library; does not wait for a confirm.
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()>;

    async fn start_transaction(&self) -> Result<()>;

    async fn commit_transaction(&self) -> Result<()>;

    async fn rollback_transaction(&self) -> Result<()>;
}

/// Builds the lapin URI without going through string escaping of the vhost.
pub fn amqp_uri(config: &ConnectionConfig) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.login.clone(),
                password: config.password.clone(),
            },
            host: config.host.clone(),
            port: config.port,
        },
        vhost: config.vhost.clone(),
        ..AMQPUri::default()
    }
}

#[derive(Clone, Default)]
pub struct LapinConnector {
    properties: ConnectionProperties,
}

impl LapinConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BrokerConnector for LapinConnector {
    type Connection = LapinConnection;

    async fn connect(&self, config: &ConnectionConfig) -> Result<LapinConnection> {
        debug!(addr = %config.display_addr(), "Opening AMQP connection");
        let connection = Connection::connect_uri(amqp_uri(config), self.properties.clone())
            .await
            .map_err(|e| RabbitMQError::ConnectionError(e.to_string()))?;
        Ok(LapinConnection { connection })
    }
}

pub struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    type Channel = LapinChannel;

    fn is_ready(&self) -> bool {
        self.connection.status().connected()
    }

    async fn create_channel(&self) -> Result<LapinChannel> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))?;
        Ok(LapinChannel { channel })
    }

    async fn close(&self) -> Result<()> {
        self.connection.close(0, "Producer finished").await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn check_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    passive: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ExchangeError(e.to_string()))
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type("application/octet-stream".into())
            .with_timestamp(chrono::Utc::now().timestamp() as u64);

        // The returned confirm is dropped: publishing is fire-and-forget here.
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;
        Ok(())
    }

    async fn start_transaction(&self) -> Result<()> {
        self.channel
            .tx_select()
            .await
            .map_err(|e| RabbitMQError::TransactionError(e.to_string()))
    }

    async fn commit_transaction(&self) -> Result<()> {
        self.channel
            .tx_commit()
            .await
            .map_err(|e| RabbitMQError::TransactionError(e.to_string()))
    }

    async fn rollback_transaction(&self) -> Result<()> {
        self.channel
            .tx_rollback()
            .await
            .map_err(|e| RabbitMQError::TransactionError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_keeps_vhost_verbatim() {
        let config = ConnectionConfig {
            host: "rmq.local".to_string(),
            port: 5673,
            login: "writer".to_string(),
            password: "pw".to_string(),
            vhost: "/".to_string(),
        };

        let uri = amqp_uri(&config);
        assert_eq!(uri.vhost, "/");
        assert_eq!(uri.authority.host, "rmq.local");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.authority.userinfo.username, "writer");
        assert_eq!(uri.authority.userinfo.password, "pw");
    }
}
