// src/rabbitmq/publisher.rs
//! Row-batching producer.
//!
//! Serialized rows are written into a [`ChunkBuffer`]; every
//! `rows_per_message` rows the buffered bytes become one AMQP message,
//! published to `<exchange_base>_direct` with either a fixed routing key or a
//! rotating queue id. Every `verify_every` messages the exchange is checked
//! again, which also waits for the client library to flush what was queued.
//!
//! ```ignore
//! let mut producer = RowProducer::connect(&LapinConnector::new(), config).await?;
//! for row in rows {
//!     producer.write_row(row.as_bytes()).await;
//! }
//! let report = producer.finish().await;
//! ```

use std::io;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::amqp_client::{BrokerChannel, BrokerConnector};
use super::connection::ConnectionManager;
use super::errors::{Delivery, ExchangeStatus, ProducerReport, Result};
use super::exchange::ExchangeVerifier;
use super::transaction::TransactionFinalizer;
use crate::config::ProducerConfig;
use crate::processing::{ChunkBuffer, RoutingTarget};

pub struct RowProducer<C: BrokerConnector> {
    producer_id: String,
    exchange_name: String,
    max_rows: usize,
    verify_every: u64,
    transactional: bool,
    connection: ConnectionManager<C>,
    verifier: ExchangeVerifier,
    finalizer: TransactionFinalizer,
    buffer: ChunkBuffer,
    routing: RoutingTarget,
    message_counter: u64,
    messages_published: u64,
    publish_failures: u64,
    exchange_status: ExchangeStatus,
    finished: bool,
}

impl<C: BrokerConnector> RowProducer<C> {
    /// Open the producer's private connection and channel.
    ///
    /// Only an invalid configuration is an error. An unreachable broker or a
    /// missing exchange is logged and shows up later in the [`ProducerReport`].
    pub async fn connect(connector: &C, config: ProducerConfig) -> Result<Self> {
        config.validate()?;

        let producer_id = format!("producer-{}", &Uuid::new_v4().to_string()[..8]);
        let exchange_name = config.exchange_name();
        info!(
            producer_id = %producer_id,
            exchange = %exchange_name,
            bind_by_id = config.bind_by_id,
            transactional = config.use_transactional_channel,
            "Starting RabbitMQ producer"
        );

        let mut connection = ConnectionManager::establish(connector, &config, &producer_id).await;
        let verifier = ExchangeVerifier::new(exchange_name.clone(), config.retry.verify_timeout());
        let exchange_status = verifier.verify(connection.channel()).await;

        if config.use_transactional_channel {
            connection.begin_transaction().await;
        }

        Ok(Self {
            producer_id,
            exchange_name,
            max_rows: config.rows_per_message,
            verify_every: config.retry.verify_every,
            transactional: config.use_transactional_channel,
            connection,
            verifier,
            finalizer: TransactionFinalizer::from_policy(&config.retry),
            buffer: ChunkBuffer::new(config.chunk_size, config.delimiter_byte()),
            routing: RoutingTarget::from_config(&config),
            message_counter: 0,
            messages_published: 0,
            publish_failures: 0,
            exchange_status,
            finished: false,
        })
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn exchange_status(&self) -> &ExchangeStatus {
        &self.exchange_status
    }

    pub fn is_degraded(&self) -> bool {
        self.connection.is_degraded()
    }

    pub fn buffered_rows(&self) -> usize {
        self.buffer.rows()
    }

    pub fn buffered_chunks(&self) -> usize {
        self.buffer.chunk_count()
    }

    pub fn message_counter(&self) -> u64 {
        self.message_counter
    }

    pub fn messages_published(&self) -> u64 {
        self.messages_published
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.buffer.write(bytes);
    }

    /// Mark a row boundary. Returns true when this row completed a message.
    pub async fn count_row(&mut self) -> bool {
        if self.buffer.mark_row() < self.max_rows {
            return false;
        }
        self.emit_message().await;
        true
    }

    pub async fn write_row(&mut self, row: &[u8]) -> bool {
        self.write(row);
        self.count_row().await
    }

    /// Re-run the passive exchange check on demand.
    pub async fn verify_exchange(&mut self) -> ExchangeStatus {
        self.exchange_status = self.verifier.verify(self.connection.channel()).await;
        self.exchange_status.clone()
    }

    async fn emit_message(&mut self) {
        let rows = self.buffer.rows();
        let payload = self.buffer.take_payload();
        let routing_key = self.routing.advance();

        match self.connection.channel() {
            Some(channel) => {
                match channel.publish(&self.exchange_name, &routing_key, &payload).await {
                    Ok(()) => {
                        self.messages_published += 1;
                        debug!(
                            producer_id = %self.producer_id,
                            routing_key = %routing_key,
                            rows,
                            bytes = payload.len(),
                            "Message published"
                        );
                    }
                    Err(err) => {
                        self.publish_failures += 1;
                        warn!(
                            producer_id = %self.producer_id,
                            routing_key = %routing_key,
                            "Failed to publish message: {}", err
                        );
                    }
                }
            }
            None => {
                self.publish_failures += 1;
                debug!(
                    producer_id = %self.producer_id,
                    rows, "No channel; message dropped"
                );
            }
        }

        self.message_counter = (self.message_counter + 1) % self.verify_every;
        if self.message_counter == 0 {
            self.verify_exchange().await;
        }
    }

    /// Flush a partial batch, commit if transactional, and close the connection.
    #[instrument(skip(self), fields(producer_id = %self.producer_id))]
    pub async fn finish(mut self) -> ProducerReport {
        let mut rows_flushed_on_finish = 0;
        if !self.buffer.is_empty() {
            rows_flushed_on_finish = self.buffer.rows() as u64;
            debug!(rows = rows_flushed_on_finish, "Flushing partial batch");
            self.emit_message().await;
        }

        let exchange = self.verify_exchange().await;
        let delivery = self.settle(&exchange).await;

        if let Err(err) = self.connection.close().await {
            warn!("Failed to close RabbitMQ connection: {}", err);
        }
        self.finished = true;

        debug_assert!(
            self.buffer.is_empty(),
            "producer finished with buffered rows"
        );

        let report = ProducerReport {
            producer_id: self.producer_id.clone(),
            messages_published: self.messages_published,
            publish_failures: self.publish_failures,
            rows_flushed_on_finish,
            exchange,
            delivery,
        };
        info!(
            messages = report.messages_published,
            failures = report.publish_failures,
            delivery = ?report.delivery,
            "Producer finished"
        );
        report
    }

    /// Drop buffered rows, roll back an open transaction and close the connection.
    ///
    /// Messages already published outside a transaction cannot be recalled.
    pub async fn abort(mut self) -> ProducerReport {
        let discarded = self.buffer.rows();
        self.buffer.take_payload();

        let delivery = match self.connection.channel() {
            Some(channel) if self.connection.in_transaction() => {
                self.finalizer.rollback(channel, &self.producer_id).await
            }
            Some(_) => Delivery::NotDelivered {
                reason: format!("aborted; {} buffered row(s) discarded", discarded),
            },
            None => Delivery::ConnectionDegraded,
        };

        if let Err(err) = self.connection.close().await {
            warn!(producer_id = %self.producer_id, "Failed to close RabbitMQ connection: {}", err);
        }
        self.finished = true;
        warn!(
            producer_id = %self.producer_id,
            discarded_rows = discarded,
            "Producer aborted"
        );

        ProducerReport {
            producer_id: self.producer_id.clone(),
            messages_published: self.messages_published,
            publish_failures: self.publish_failures,
            rows_flushed_on_finish: 0,
            exchange: self.exchange_status.clone(),
            delivery,
        }
    }

    async fn settle(&self, exchange: &ExchangeStatus) -> Delivery {
        let Some(channel) = self.connection.channel() else {
            return Delivery::ConnectionDegraded;
        };

        if self.transactional {
            if !self.connection.in_transaction() {
                return Delivery::NotDelivered {
                    reason: "transaction was never started".to_string(),
                };
            }
            // A transaction is all or nothing: a lost publish voids the rest.
            if self.publish_failures > 0 {
                self.finalizer.rollback(channel, &self.producer_id).await;
                return Delivery::NotDelivered {
                    reason: format!(
                        "{} message(s) failed to publish; transaction rolled back",
                        self.publish_failures
                    ),
                };
            }
            return self.finalizer.commit(channel, &self.producer_id).await;
        }

        if self.publish_failures > 0 {
            Delivery::NotDelivered {
                reason: format!("{} message(s) failed to publish", self.publish_failures),
            }
        } else if let ExchangeStatus::Rejected(reason) = exchange {
            Delivery::NotDelivered {
                reason: format!("exchange check failed: {}", reason),
            }
        } else {
            Delivery::Delivered
        }
    }
}

impl<C: BrokerConnector> io::Write for RowProducer<C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.write(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<C: BrokerConnector> Drop for RowProducer<C> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if !self.buffer.is_empty() {
            warn!(
                producer_id = %self.producer_id,
                rows = self.buffer.rows(),
                "Producer dropped without finish() or abort(); buffered rows are lost"
            );
        } else {
            warn!(
                producer_id = %self.producer_id,
                "Producer dropped without finish() or abort(); connection not closed gracefully"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::rabbitmq::memory::{Answer, MemoryBroker};

    fn config() -> ProducerConfig {
        let mut config = ProducerConfig::new("events");
        config.routing_key = "rk".to_string();
        config.rows_per_message = 2;
        config.chunk_size = 1024;
        config.delimiter = Some('\n');
        config.retry = RetryPolicy::fast();
        config
    }

    fn broker() -> MemoryBroker {
        MemoryBroker::new().with_exchange("events_direct")
    }

    #[tokio::test]
    async fn two_rows_make_one_trimmed_message() {
        let broker = broker();
        let mut producer = RowProducer::connect(&broker, config()).await.unwrap();

        assert!(!producer.write_row(b"a\n").await);
        assert!(producer.write_row(b"b\n").await);
        assert!(!producer.write_row(b"c\n").await);
        assert_eq!(producer.buffered_rows(), 1);

        let delivered = broker.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].exchange, "events_direct");
        assert_eq!(delivered[0].routing_key, "rk");
        assert_eq!(delivered[0].payload, b"a\nb");

        let report = producer.finish().await;
        assert_eq!(report.rows_flushed_on_finish, 1);
        assert_eq!(broker.delivered()[1].payload, b"c");
    }

    #[tokio::test]
    async fn queue_ids_rotate_per_message() {
        let broker = broker();
        let mut config = config();
        config.bind_by_id = true;
        config.num_queues = 2;
        config.rows_per_message = 1;
        let mut producer = RowProducer::connect(&broker, config).await.unwrap();

        for row in [b"1\n", b"2\n", b"3\n"] {
            producer.write_row(row).await;
        }
        let keys: Vec<String> = broker.delivered().into_iter().map(|m| m.routing_key).collect();
        assert_eq!(keys, ["1", "2", "1"]);
        producer.finish().await;
    }

    #[tokio::test]
    async fn exchange_is_rechecked_every_batch() {
        let broker = broker();
        let mut config = config();
        config.rows_per_message = 1;
        config.retry.verify_every = 3;
        let mut producer = RowProducer::connect(&broker, config).await.unwrap();
        assert_eq!(broker.exchange_checks(), 1);

        for _ in 0..7 {
            producer.write_row(b"x\n").await;
        }
        assert_eq!(broker.exchange_checks(), 3);
        assert_eq!(producer.message_counter(), 1);
        producer.finish().await;
        assert_eq!(broker.exchange_checks(), 4);
    }

    #[tokio::test]
    async fn publish_failures_are_counted_not_raised() {
        let broker = broker();
        let mut producer = RowProducer::connect(&broker, config()).await.unwrap();
        broker.fail_publishes("channel closed");

        producer.write_row(b"a\n").await;
        assert!(producer.write_row(b"b\n").await);

        let report = producer.finish().await;
        assert_eq!(report.publish_failures, 1);
        assert_eq!(report.messages_published, 0);
        assert!(matches!(report.delivery, Delivery::NotDelivered { .. }));
    }

    #[tokio::test]
    async fn silent_exchange_check_does_not_hang() {
        let broker = broker();
        broker.set_exchange_answer(Answer::Silent);
        let producer = RowProducer::connect(&broker, config()).await.unwrap();

        assert_eq!(producer.exchange_status(), &ExchangeStatus::TimedOut);
        let report = producer.finish().await;
        assert_eq!(report.exchange, ExchangeStatus::TimedOut);
    }

    #[tokio::test]
    async fn abort_rolls_back_transaction() {
        let broker = broker();
        let mut config = config();
        config.use_transactional_channel = true;
        let mut producer = RowProducer::connect(&broker, config).await.unwrap();

        producer.write_row(b"a\n").await;
        producer.write_row(b"b\n").await;
        producer.write_row(b"c\n").await;
        assert_eq!(broker.uncommitted(), 1);

        let report = producer.abort().await;
        assert!(matches!(report.delivery, Delivery::NotDelivered { .. }));
        assert_eq!(report.messages_published, 1);
        assert!(broker.delivered().is_empty());
        assert_eq!(broker.uncommitted(), 0);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn drop_with_capture<T>(value: T) -> String {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || drop(value));
        logs.text()
    }

    #[tokio::test]
    async fn dropping_unfinished_producer_warns() {
        let broker = broker();
        let mut producer = RowProducer::connect(&broker, config()).await.unwrap();
        producer.write_row(b"a\n").await;

        let logs = drop_with_capture(producer);
        assert!(logs.contains("WARN"));
        assert!(logs.contains("dropped without finish() or abort()"));
        assert!(logs.contains("buffered rows are lost"));
        assert_eq!(broker.connections_closed(), 0);
    }

    #[tokio::test]
    async fn dropping_idle_producer_warns_about_connection() {
        let producer = RowProducer::connect(&broker(), config()).await.unwrap();
        let logs = drop_with_capture(producer);
        assert!(logs.contains("connection not closed gracefully"));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut zero_rows = config();
        zero_rows.rows_per_message = 0;
        assert!(RowProducer::connect(&broker(), zero_rows).await.is_err());

        let mut huge_commit = config();
        huge_commit.retry.commit_attempts = u32::MAX;
        huge_commit.retry.commit_poll_ms = u64::MAX;
        assert!(RowProducer::connect(&broker(), huge_commit).await.is_err());
    }

    #[tokio::test]
    async fn io_write_then_count_row() {
        use std::io::Write as _;

        let broker = broker();
        let mut config = config();
        config.rows_per_message = 1;
        let mut producer = RowProducer::connect(&broker, config).await.unwrap();

        writeln!(producer, "{},{}", 1, "alpha").unwrap();
        assert!(producer.count_row().await);
        assert_eq!(broker.delivered()[0].payload, b"1,alpha");
        producer.finish().await;
    }
}
