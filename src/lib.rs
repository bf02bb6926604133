//! Buffered, batching RabbitMQ producer for row-oriented output.
//!
//! Rows are accumulated into fixed-size chunks, grouped into one message
//! every `rows_per_message` rows, and published to a direct exchange over a
//! private connection, optionally inside a transaction committed on
//! [`RowProducer::finish`].

pub mod config;
pub mod env;
pub mod processing;
pub mod rabbitmq;

pub use config::{ConnectionConfig, ProducerConfig, RetryPolicy};
pub use rabbitmq::{
    Delivery, ExchangeStatus, LapinConnector, MemoryBroker, ProducerReport, RabbitMQError,
    RowProducer,
};
