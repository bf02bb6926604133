use std::error::Error;
use std::path::PathBuf;

use rabbitmq_row_producer::config::{self, ProducerConfig};
use rabbitmq_row_producer::rabbitmq::BrokerConnector;
use rabbitmq_row_producer::{env, LapinConnector, MemoryBroker, ProducerReport, RowProducer};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn load_config() -> Result<ProducerConfig, Box<dyn Error>> {
    match std::env::var("RMQ_CONFIG_FILE") {
        Ok(path) => Ok(config::load_config_from(&PathBuf::from(path))?),
        Err(_) => env::load_from_env(),
    }
}

/// Publish stdin, one row per line, until EOF or Ctrl+C.
async fn run<C: BrokerConnector>(
    connector: &C,
    config: ProducerConfig,
) -> Result<ProducerReport, Box<dyn Error>> {
    let delimiter = config.delimiter_byte();
    let mut producer = RowProducer::connect(connector, config).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut rows = 0u64;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                producer.write(line.as_bytes());
                if let Some(delim) = delimiter {
                    producer.write(&[delim]);
                }
                producer.count_row().await;
                rows += 1;
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted; finishing producer");
                break;
            }
        }
    }

    info!(rows, "Input exhausted");
    Ok(producer.finish().await)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = load_config()?;

    let report = if std::env::var("RMQ_DRY_RUN").is_ok_and(|v| v == "1" || v == "true") {
        let broker = MemoryBroker::new().with_exchange(config.exchange_name());
        let report = run(&broker, config).await?;
        info!(delivered = broker.delivered().len(), "Dry run complete");
        report
    } else {
        run(&LapinConnector::new(), config).await?
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
