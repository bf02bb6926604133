use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::amqp_client::{BrokerChannel, BrokerConnection, BrokerConnector};
use super::errors::Result;
use crate::config::ProducerConfig;

pub type ChannelOf<C> = <<C as BrokerConnector>::Connection as BrokerConnection>::Channel;

/// Owns the single connection and channel of one producer.
///
/// Every producer gets a private connection: AMQP client libraries do not
/// support concurrent publishing from several writers over one connection.
pub struct ConnectionManager<C: BrokerConnector> {
    producer_id: String,
    connection: Option<C::Connection>,
    channel: Option<ChannelOf<C>>,
    in_transaction: bool,
}

impl<C: BrokerConnector> ConnectionManager<C> {
    /// Connect with bounded retries, then open the channel.
    ///
    /// Never fails: when the broker stays unreachable the manager is returned
    /// without a channel and [`ConnectionManager::is_degraded`] reports it.
    pub async fn establish(connector: &C, config: &ProducerConfig, producer_id: &str) -> Self {
        let max_attempts = config.retry.connect_attempts;
        let delay = config.retry.connect_retry_delay();
        let connection = Self::connect_with_retries(connector, config, producer_id, max_attempts, delay).await;

        let ready = connection.as_ref().map_or(false, |conn| conn.is_ready());
        if !ready {
            error!(
                producer_id,
                addr = %config.connection.display_addr(),
                attempts = max_attempts,
                "Cannot set up connection for producer"
            );
        }

        let channel = match &connection {
            Some(conn) => match conn.create_channel().await {
                Ok(channel) => {
                    debug!(producer_id, "Producer channel created");
                    Some(channel)
                }
                Err(err) => {
                    error!(producer_id, "Failed to create producer channel: {}", err);
                    None
                }
            },
            None => None,
        };

        Self {
            producer_id: producer_id.to_string(),
            connection,
            channel,
            in_transaction: false,
        }
    }

    async fn connect_with_retries(
        connector: &C,
        config: &ProducerConfig,
        producer_id: &str,
        max_attempts: u32,
        delay: Duration,
    ) -> Option<C::Connection> {
        let mut connection: Option<C::Connection> = None;

        for attempt in 1..=max_attempts {
            if connection.is_none() {
                match connector.connect(&config.connection).await {
                    Ok(conn) => connection = Some(conn),
                    // Only the first and last failures are worth a warning.
                    Err(err) if attempt == 1 || attempt == max_attempts => {
                        warn!(
                            producer_id,
                            attempt, max_attempts, "Failed to connect to RabbitMQ: {}", err
                        );
                    }
                    Err(err) => {
                        debug!(producer_id, attempt, "Failed to connect to RabbitMQ: {}", err);
                    }
                }
            }

            if connection.as_ref().map_or(false, |conn| conn.is_ready()) {
                info!(
                    producer_id,
                    attempt,
                    addr = %config.connection.display_addr(),
                    "Connected to RabbitMQ"
                );
                break;
            }

            if attempt < max_attempts {
                sleep(delay).await;
            }
        }

        connection
    }

    pub fn channel(&self) -> Option<&ChannelOf<C>> {
        self.channel.as_ref()
    }

    pub fn is_degraded(&self) -> bool {
        self.channel.is_none()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Put the channel in transactional mode. Returns whether it succeeded.
    pub async fn begin_transaction(&mut self) -> bool {
        let Some(channel) = &self.channel else {
            warn!(producer_id = %self.producer_id, "No channel; transaction not started");
            return false;
        };

        match channel.start_transaction().await {
            Ok(()) => {
                debug!(producer_id = %self.producer_id, "Transaction started");
                self.in_transaction = true;
            }
            Err(err) => {
                error!(producer_id = %self.producer_id, "Failed to start transaction: {}", err);
            }
        }
        self.in_transaction
    }

    // Method for properly closing the connection when needed
    pub async fn close(&mut self) -> Result<()> {
        self.channel = None;
        self.in_transaction = false;
        if let Some(conn) = self.connection.take() {
            info!(producer_id = %self.producer_id, "Closing RabbitMQ connection gracefully");
            conn.close().await?;
        }
        Ok(())
    }
}
