use std::env;

use dotenv::dotenv;

use crate::config::{ConnectionConfig, ProducerConfig, RetryPolicy};

/// Environment variable holding the exchange base name; the only required one.
pub const EXCHANGE_VAR: &str = "RMQ_EXCHANGE";

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, Box<dyn std::error::Error>>
where
    T::Err: std::error::Error + 'static,
{
    match env::var(name) {
        Ok(val) => Ok(val.trim().parse()?),
        Err(_) => Ok(default),
    }
}

fn string_var(name: &str, default: String) -> String {
    env::var(name).unwrap_or(default)
}

/// Build a producer configuration from `RMQ_*` variables, reading `.env` first.
pub fn load_from_env() -> Result<ProducerConfig, Box<dyn std::error::Error>> {
    dotenv().ok();
    from_current_env()
}

pub(crate) fn from_current_env() -> Result<ProducerConfig, Box<dyn std::error::Error>> {
    let defaults = ConnectionConfig::default();
    let connection = ConnectionConfig {
        host: string_var("RMQ_HOST", defaults.host),
        port: parse_var("RMQ_PORT", defaults.port)?,
        login: string_var("RMQ_LOGIN", defaults.login),
        password: string_var("RMQ_PASSWORD", defaults.password),
        vhost: string_var("RMQ_VHOST", defaults.vhost),
    };

    let mut config = ProducerConfig::new(env::var(EXCHANGE_VAR)?);
    config.connection = connection;
    config.routing_key = string_var("RMQ_ROUTING_KEY", config.routing_key);
    config.num_queues = parse_var("RMQ_NUM_QUEUES", config.num_queues)?;
    config.bind_by_id = parse_var("RMQ_BIND_BY_ID", config.bind_by_id)?;
    config.use_transactional_channel =
        parse_var("RMQ_TRANSACTIONAL", config.use_transactional_channel)?;
    config.rows_per_message = parse_var("RMQ_ROWS_PER_MESSAGE", config.rows_per_message)?;
    config.chunk_size = parse_var("RMQ_CHUNK_SIZE", config.chunk_size)?;

    // Empty string disables the delimiter.
    if let Ok(delim) = env::var("RMQ_DELIMITER") {
        config.delimiter = match delim.as_str() {
            "" => None,
            "\\n" => Some('\n'),
            "\\t" => Some('\t'),
            other => {
                let mut chars = other.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Some(c),
                    _ => {
                        return Err(format!(
                            "RMQ_DELIMITER must be a single character, got {:?}",
                            other
                        )
                        .into())
                    }
                }
            }
        };
    }

    let defaults = RetryPolicy::default();
    config.retry = RetryPolicy {
        connect_attempts: parse_var("RMQ_CONNECT_ATTEMPTS", defaults.connect_attempts)?,
        connect_retry_delay_ms: parse_var("RMQ_CONNECT_RETRY_DELAY_MS", defaults.connect_retry_delay_ms)?,
        commit_attempts: parse_var("RMQ_COMMIT_ATTEMPTS", defaults.commit_attempts)?,
        commit_poll_ms: parse_var("RMQ_COMMIT_POLL_MS", defaults.commit_poll_ms)?,
        verify_every: parse_var("RMQ_VERIFY_EVERY", defaults.verify_every)?,
        verify_timeout_ms: parse_var("RMQ_VERIFY_TIMEOUT_MS", defaults.verify_timeout_ms)?,
    };

    config.validate()?;
    Ok(config)
}
