// src/rabbitmq/mod.rs
// RabbitMQ side of the producer: client seam, connection lifecycle and publishing

pub mod amqp_client;
pub mod completion;
pub mod connection;
pub mod errors;
pub mod exchange;
pub mod memory;
pub mod publisher;
pub mod transaction;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{BrokerChannel, BrokerConnection, BrokerConnector, LapinConnector};
pub use connection::ConnectionManager;
pub use errors::{Delivery, ExchangeStatus, ProducerReport, RabbitMQError, Result};
pub use memory::MemoryBroker;
pub use publisher::RowProducer;
