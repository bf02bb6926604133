// src/rabbitmq/memory.rs
//! In-memory broker implementing the client traits.
//!
//! It keeps just enough AMQP behaviour for producers to be exercised without
//! a server: exchanges must exist to pass a passive declare, transactional
//! channels hold messages until commit, and every answer can be scripted to
//! succeed, fail, or never arrive.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use lapin::ExchangeKind;
use tracing::debug;

use super::amqp_client::{BrokerChannel, BrokerConnection, BrokerConnector};
use super::errors::{RabbitMQError, Result};
use crate::config::ConnectionConfig;

/// How the broker answers a scripted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    /// Normal broker behaviour.
    Reply,
    Reject(String),
    /// Never answer.
    Silent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct ChannelState {
    in_transaction: bool,
    pending: Vec<PublishedMessage>,
}

#[derive(Debug)]
struct MemoryState {
    exchanges: HashSet<String>,
    delivered: Vec<PublishedMessage>,
    channels: HashMap<usize, ChannelState>,
    next_channel: usize,
    failing_connects: u32,
    refuse_connections: bool,
    never_ready: bool,
    exchange_answer: Answer,
    commit_answer: Answer,
    publish_error: Option<String>,
    connect_attempts: u32,
    exchange_checks: u32,
    transactions_started: u32,
    connections_closed: u32,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            exchanges: HashSet::new(),
            delivered: Vec::new(),
            channels: HashMap::new(),
            next_channel: 1,
            failing_connects: 0,
            refuse_connections: false,
            never_ready: false,
            exchange_answer: Answer::Reply,
            commit_answer: Answer::Reply,
            publish_error: None,
            connect_attempts: 0,
            exchange_checks: 0,
            transactions_started: 0,
            connections_closed: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_exchange(self, name: impl Into<String>) -> Self {
        self.state().exchanges.insert(name.into());
        self
    }

    /// Fail the first `n` connection attempts.
    pub fn fail_first_connects(self, n: u32) -> Self {
        self.state().failing_connects = n;
        self
    }

    pub fn refuse_connections(self) -> Self {
        self.state().refuse_connections = true;
        self
    }

    /// Connections open but never report ready.
    pub fn never_ready(self) -> Self {
        self.state().never_ready = true;
        self
    }

    pub fn set_exchange_answer(&self, answer: Answer) {
        self.state().exchange_answer = answer;
    }

    pub fn set_commit_answer(&self, answer: Answer) {
        self.state().commit_answer = answer;
    }

    pub fn fail_publishes(&self, message: impl Into<String>) {
        self.state().publish_error = Some(message.into());
    }

    /// Messages visible to consumers: non-transactional publishes and committed ones.
    pub fn delivered(&self) -> Vec<PublishedMessage> {
        self.state().delivered.clone()
    }

    pub fn uncommitted(&self) -> usize {
        self.state().channels.values().map(|c| c.pending.len()).sum()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    pub fn exchange_checks(&self) -> u32 {
        self.state().exchange_checks
    }

    pub fn transactions_started(&self) -> u32 {
        self.state().transactions_started
    }

    pub fn connections_closed(&self) -> u32 {
        self.state().connections_closed
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self, config: &ConnectionConfig) -> Result<MemoryConnection> {
        let mut state = self.state();
        state.connect_attempts += 1;

        if state.refuse_connections {
            return Err(RabbitMQError::ConnectionError(format!(
                "connection refused by {}",
                config.display_addr()
            )));
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(RabbitMQError::ConnectionError(
                "broker not accepting connections yet".to_string(),
            ));
        }

        debug!(addr = %config.display_addr(), "In-memory connection opened");
        Ok(MemoryConnection {
            broker: self.clone(),
            ready: !state.never_ready,
        })
    }
}

pub struct MemoryConnection {
    broker: MemoryBroker,
    ready: bool,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    type Channel = MemoryChannel;

    fn is_ready(&self) -> bool {
        self.ready
    }

    async fn create_channel(&self) -> Result<MemoryChannel> {
        if !self.ready {
            return Err(RabbitMQError::ChannelError("connection is not open".to_string()));
        }
        let mut state = self.broker.state();
        let id = state.next_channel;
        state.next_channel += 1;
        state.channels.insert(id, ChannelState::default());
        Ok(MemoryChannel {
            broker: self.broker.clone(),
            id,
        })
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.state();
        state.connections_closed += 1;
        // Uncommitted transactional work is discarded with the connection.
        for channel in state.channels.values_mut() {
            channel.pending.clear();
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    id: usize,
}

impl MemoryChannel {
    fn with_channel<R>(&self, f: impl FnOnce(&mut ChannelState) -> R) -> Result<R> {
        let mut state = self.broker.state();
        state
            .channels
            .get_mut(&self.id)
            .map(f)
            .ok_or_else(|| RabbitMQError::ChannelError(format!("channel {} is closed", self.id)))
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn check_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let answer = {
            let mut state = self.broker.state();
            state.exchange_checks += 1;
            match state.exchange_answer.clone() {
                Answer::Reply if !state.exchanges.contains(name) => Answer::Reject(format!(
                    "NOT_FOUND - no exchange '{}' of kind {:?} in vhost",
                    name, kind
                )),
                other => other,
            }
        };

        match answer {
            Answer::Reply => Ok(()),
            Answer::Reject(message) => Err(RabbitMQError::ExchangeError(message)),
            Answer::Silent => std::future::pending().await,
        }
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        let message = PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
        };

        let mut guard = self.broker.state();
        let state = &mut *guard;
        if let Some(error) = state.publish_error.clone() {
            return Err(RabbitMQError::PublishError(error));
        }
        let channel = state
            .channels
            .get_mut(&self.id)
            .ok_or_else(|| RabbitMQError::ChannelError(format!("channel {} is closed", self.id)))?;
        if channel.in_transaction {
            channel.pending.push(message);
        } else {
            state.delivered.push(message);
        }
        Ok(())
    }

    async fn start_transaction(&self) -> Result<()> {
        self.with_channel(|channel| channel.in_transaction = true)?;
        self.broker.state().transactions_started += 1;
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        let answer = self.broker.state().commit_answer.clone();
        match answer {
            Answer::Reply => {
                let mut guard = self.broker.state();
                let state = &mut *guard;
                let channel = state.channels.get_mut(&self.id).ok_or_else(|| {
                    RabbitMQError::ChannelError(format!("channel {} is closed", self.id))
                })?;
                if !channel.in_transaction {
                    return Err(RabbitMQError::TransactionError(
                        "PRECONDITION_FAILED - channel is not transactional".to_string(),
                    ));
                }
                let committed = std::mem::take(&mut channel.pending);
                state.delivered.extend(committed);
                Ok(())
            }
            Answer::Reject(message) => {
                self.with_channel(|channel| channel.pending.clear())?;
                Err(RabbitMQError::TransactionError(message))
            }
            Answer::Silent => std::future::pending().await,
        }
    }

    async fn rollback_transaction(&self) -> Result<()> {
        self.with_channel(|channel| channel.pending.clear())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn_config() -> ConnectionConfig {
        ConnectionConfig::default()
    }

    #[tokio::test]
    async fn refused_and_flaky_connects() {
        let broker = MemoryBroker::new().fail_first_connects(2);
        assert!(broker.connect(&conn_config()).await.is_err());
        assert!(broker.connect(&conn_config()).await.is_err());
        assert!(broker.connect(&conn_config()).await.is_ok());
        assert_eq!(broker.connect_attempts(), 3);

        let refused = MemoryBroker::new().refuse_connections();
        assert!(refused.connect(&conn_config()).await.is_err());
    }

    #[tokio::test]
    async fn passive_declare_requires_existing_exchange() {
        let broker = MemoryBroker::new().with_exchange("logs_direct");
        let channel = broker
            .connect(&conn_config())
            .await
            .unwrap()
            .create_channel()
            .await
            .unwrap();

        assert!(channel.check_exchange("logs_direct", ExchangeKind::Direct).await.is_ok());
        let err = channel
            .check_exchange("missing_direct", ExchangeKind::Direct)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("NOT_FOUND"));
        assert_eq!(broker.exchange_checks(), 2);
    }

    #[tokio::test]
    async fn transaction_holds_messages_until_commit() {
        let broker = MemoryBroker::new();
        let channel = broker
            .connect(&conn_config())
            .await
            .unwrap()
            .create_channel()
            .await
            .unwrap();

        channel.start_transaction().await.unwrap();
        channel.publish("ex", "rk", b"one").await.unwrap();
        assert!(broker.delivered().is_empty());
        assert_eq!(broker.uncommitted(), 1);

        channel.commit_transaction().await.unwrap();
        assert_eq!(broker.delivered().len(), 1);
        assert_eq!(broker.uncommitted(), 0);
    }

    #[tokio::test]
    async fn rejected_commit_discards_pending() {
        let broker = MemoryBroker::new();
        broker.set_commit_answer(Answer::Reject("CHANNEL_ERROR".to_string()));
        let channel = broker
            .connect(&conn_config())
            .await
            .unwrap()
            .create_channel()
            .await
            .unwrap();

        channel.start_transaction().await.unwrap();
        channel.publish("ex", "rk", b"one").await.unwrap();
        assert!(channel.commit_transaction().await.is_err());
        assert!(broker.delivered().is_empty());
        assert_eq!(broker.uncommitted(), 0);
    }

    #[tokio::test]
    async fn not_ready_connection_has_no_channel() {
        let broker = MemoryBroker::new().never_ready();
        let connection = broker.connect(&conn_config()).await.unwrap();
        assert!(!connection.is_ready());
        assert!(connection.create_channel().await.is_err());
    }
}
