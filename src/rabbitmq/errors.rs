// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("RabbitMQ exchange error: {0}")]
    ExchangeError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ transaction error: {0}")]
    TransactionError(String),

    #[error("Invalid producer configuration: {0}")]
    ConfigError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

// Converting from lapin errors
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        // Use string representation for classification
        let error_text = error.to_string();
        let lowered = error_text.to_lowercase();

        if lowered.contains("connection") {
            RabbitMQError::ConnectionError(error_text)
        } else if lowered.contains("exchange") {
            RabbitMQError::ExchangeError(error_text)
        } else if lowered.contains("channel") {
            RabbitMQError::ChannelError(error_text)
        } else if lowered.contains("publish") {
            RabbitMQError::PublishError(error_text)
        } else if lowered.contains("tx") || lowered.contains("transaction") {
            RabbitMQError::TransactionError(error_text)
        } else {
            RabbitMQError::Unknown(error_text)
        }
    }
}

/// Result of a passive existence check against the target exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ExchangeStatus {
    Declared,
    /// The broker answered with an error (missing exchange, type mismatch, closed channel).
    Rejected(String),
    TimedOut,
    /// No channel could be opened, so nothing was asked.
    Unavailable,
}

/// What happened to the messages a producer handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Delivery {
    Delivered,
    NotDelivered { reason: String },
    /// The connection never became ready; every publish was dropped.
    ConnectionDegraded,
}

/// Summary returned by `RowProducer::finish`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProducerReport {
    pub producer_id: String,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub rows_flushed_on_finish: u64,
    pub exchange: ExchangeStatus,
    pub delivery: Delivery,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lapin_errors_are_classified_by_message() {
        let err: RabbitMQError =
            LapinError::InvalidConnectionState(lapin::ConnectionState::Closed).into();
        assert!(matches!(err, RabbitMQError::ConnectionError(_)));

        let err: RabbitMQError = LapinError::InvalidChannel(7).into();
        assert!(matches!(err, RabbitMQError::ChannelError(ref m) if m == "invalid channel: 7"));

        let err: RabbitMQError = LapinError::MissingHeartbeatError.into();
        assert!(matches!(err, RabbitMQError::Unknown(_)));
    }

    #[test]
    fn report_serializes_tagged_outcomes() {
        let report = ProducerReport {
            producer_id: "producer-1".to_string(),
            messages_published: 3,
            publish_failures: 0,
            rows_flushed_on_finish: 1,
            exchange: ExchangeStatus::Rejected("NOT_FOUND".to_string()),
            delivery: Delivery::NotDelivered {
                reason: "exchange missing".to_string(),
            },
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["exchange"]["status"], "rejected");
        assert_eq!(json["exchange"]["reason"], "NOT_FOUND");
        assert_eq!(json["delivery"]["outcome"], "not_delivered");
        assert_eq!(json["delivery"]["reason"], "exchange missing");
    }
}
