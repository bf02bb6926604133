use std::time::Duration;

use tracing::{info, warn};

use super::amqp_client::BrokerChannel;
use super::completion::{Completion, Resolved};
use super::errors::Delivery;
use crate::config::RetryPolicy;

/// Commits the producer's transaction on shutdown and waits, bounded, for the answer.
#[derive(Debug, Clone)]
pub struct TransactionFinalizer {
    timeout: Duration,
}

impl TransactionFinalizer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn from_policy(policy: &RetryPolicy) -> Self {
        Self::new(policy.commit_timeout())
    }

    /// A rejected commit means none of the transaction's messages were published.
    pub async fn commit<Ch: BrokerChannel>(&self, channel: &Ch, producer_id: &str) -> Delivery {
        let channel = channel.clone();
        let completion = Completion::spawn(async move { channel.commit_transaction().await });

        match completion.wait(self.timeout).await {
            Resolved::Success(()) => {
                info!(producer_id, "All messages were successfully published");
                Delivery::Delivered
            }
            Resolved::Failure(reason) => {
                warn!(producer_id, "None of messages were published: {}", reason);
                Delivery::NotDelivered { reason }
            }
            Resolved::TimedOut => {
                warn!(
                    producer_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Commit was not acknowledged; giving up"
                );
                Delivery::NotDelivered {
                    reason: format!(
                        "commit not acknowledged within {}ms",
                        self.timeout.as_millis()
                    ),
                }
            }
        }
    }

    /// Discard everything published in the open transaction.
    pub async fn rollback<Ch: BrokerChannel>(&self, channel: &Ch, producer_id: &str) -> Delivery {
        let channel = channel.clone();
        let completion = Completion::spawn(async move { channel.rollback_transaction().await });

        let reason = match completion.wait(self.timeout).await {
            Resolved::Success(()) => {
                info!(producer_id, "Transaction rolled back");
                "transaction rolled back".to_string()
            }
            Resolved::Failure(reason) => {
                warn!(producer_id, "Rollback failed: {}", reason);
                format!("rollback failed: {}", reason)
            }
            Resolved::TimedOut => {
                warn!(producer_id, "Rollback was not acknowledged");
                "rollback not acknowledged".to_string()
            }
        };
        Delivery::NotDelivered { reason }
    }
}
