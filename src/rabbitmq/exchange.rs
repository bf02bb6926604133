use std::time::Duration;

use lapin::ExchangeKind;
use tracing::{debug, error};

use super::amqp_client::BrokerChannel;
use super::completion::{Completion, Resolved};
use super::errors::ExchangeStatus;

/// Passive existence check of the producer's target exchange.
///
/// Besides validating configuration, each check is a sync point: the
/// producer blocks until the broker has answered, so frames queued by
/// earlier publishes have been flushed.
#[derive(Debug, Clone)]
pub struct ExchangeVerifier {
    exchange: String,
    kind: ExchangeKind,
    timeout: Duration,
}

impl ExchangeVerifier {
    pub fn new(exchange: impl Into<String>, timeout: Duration) -> Self {
        Self {
            exchange: exchange.into(),
            kind: ExchangeKind::Direct,
            timeout,
        }
    }

    pub async fn verify<Ch: BrokerChannel>(&self, channel: Option<&Ch>) -> ExchangeStatus {
        let Some(channel) = channel else {
            debug!(exchange = %self.exchange, "No channel; skipping exchange check");
            return ExchangeStatus::Unavailable;
        };

        let channel = channel.clone();
        let name = self.exchange.clone();
        let kind = self.kind.clone();
        let completion = Completion::spawn(async move { channel.check_exchange(&name, kind).await });

        match completion.wait(self.timeout).await {
            Resolved::Success(()) => {
                debug!(exchange = %self.exchange, "Exchange declared");
                ExchangeStatus::Declared
            }
            Resolved::Failure(reason) => {
                error!(
                    exchange = %self.exchange,
                    "Exchange for producer was not declared. Reason: {}", reason
                );
                ExchangeStatus::Rejected(reason)
            }
            Resolved::TimedOut => {
                error!(
                    exchange = %self.exchange,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Exchange check was not answered in time"
                );
                ExchangeStatus::TimedOut
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::rabbitmq::amqp_client::{BrokerConnection, BrokerConnector};
    use crate::rabbitmq::memory::{Answer, MemoryBroker, MemoryChannel};

    async fn open(broker: &MemoryBroker) -> MemoryChannel {
        broker
            .connect(&ConnectionConfig::default())
            .await
            .unwrap()
            .create_channel()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn repeated_checks_stay_declared() {
        let broker = MemoryBroker::new().with_exchange("events_direct");
        let channel = open(&broker).await;
        let verifier = ExchangeVerifier::new("events_direct", Duration::from_secs(1));

        assert_eq!(verifier.verify(Some(&channel)).await, ExchangeStatus::Declared);
        assert_eq!(verifier.verify(Some(&channel)).await, ExchangeStatus::Declared);
        assert_eq!(broker.exchange_checks(), 2);
    }

    #[tokio::test]
    async fn missing_exchange_is_rejected() {
        let broker = MemoryBroker::new();
        let channel = open(&broker).await;
        let verifier = ExchangeVerifier::new("events_direct", Duration::from_secs(1));

        match verifier.verify(Some(&channel)).await {
            ExchangeStatus::Rejected(reason) => assert!(reason.contains("NOT_FOUND")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn silent_broker_times_out() {
        let broker = MemoryBroker::new().with_exchange("events_direct");
        broker.set_exchange_answer(Answer::Silent);
        let channel = open(&broker).await;
        let verifier = ExchangeVerifier::new("events_direct", Duration::from_millis(20));

        assert_eq!(verifier.verify(Some(&channel)).await, ExchangeStatus::TimedOut);
    }

    #[tokio::test]
    async fn no_channel_is_unavailable() {
        let verifier = ExchangeVerifier::new("events_direct", Duration::from_millis(20));
        assert_eq!(
            verifier.verify::<MemoryChannel>(None).await,
            ExchangeStatus::Unavailable
        );
    }
}
