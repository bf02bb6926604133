// src/config.rs
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::rabbitmq::errors::RabbitMQError;

/// Suffix appended to the configured exchange base name.
pub const EXCHANGE_SUFFIX: &str = "_direct";

// Configuration structures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    pub connection: ConnectionConfig,
    #[serde(default = "default_routing_key")]
    pub routing_key: String,
    pub exchange_base: String,
    #[serde(default = "default_num_queues")]
    pub num_queues: usize,
    #[serde(default)]
    pub bind_by_id: bool,
    #[serde(default)]
    pub use_transactional_channel: bool,
    #[serde(default = "default_delimiter")]
    pub delimiter: Option<char>,
    #[serde(default = "default_rows_per_message")]
    pub rows_per_message: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_login")]
    pub login: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
}

/// Attempt counts and intervals for the three blocking waits of a producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,
    #[serde(default = "default_commit_attempts")]
    pub commit_attempts: u32,
    #[serde(default = "default_commit_poll_ms")]
    pub commit_poll_ms: u64,
    /// Re-check the exchange after this many published messages.
    #[serde(default = "default_verify_every")]
    pub verify_every: u64,
    #[serde(default = "default_verify_timeout_ms")]
    pub verify_timeout_ms: u64,
}

// Default values
fn default_host() -> String { "localhost".to_string() }
fn default_port() -> u16 { 5672 }
fn default_login() -> String { "guest".to_string() }
fn default_password() -> String { "guest".to_string() }
fn default_vhost() -> String { "/".to_string() }
fn default_routing_key() -> String { String::new() }
fn default_num_queues() -> usize { 1 }
fn default_delimiter() -> Option<char> { Some('\n') }
fn default_rows_per_message() -> usize { 1 }
fn default_chunk_size() -> usize { 4096 }
fn default_connect_attempts() -> u32 { 1000 }
fn default_connect_retry_delay_ms() -> u64 { 200 }
fn default_commit_attempts() -> u32 { 1000 }
fn default_commit_poll_ms() -> u64 { 10 }
fn default_verify_every() -> u64 { 10_000 }
fn default_verify_timeout_ms() -> u64 { 30_000 }

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            login: default_login(),
            password: default_password(),
            vhost: default_vhost(),
        }
    }
}

impl ConnectionConfig {
    /// Address for log lines; never includes the password.
    pub fn display_addr(&self) -> String {
        format!("{}@{}:{}{}", self.login, self.host, self.port, self.vhost)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connect_attempts: default_connect_attempts(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),
            commit_attempts: default_commit_attempts(),
            commit_poll_ms: default_commit_poll_ms(),
            verify_every: default_verify_every(),
            verify_timeout_ms: default_verify_timeout_ms(),
        }
    }
}

impl RetryPolicy {
    /// Millisecond-scale policy for tests and dry runs.
    pub fn fast() -> Self {
        Self {
            connect_attempts: 3,
            connect_retry_delay_ms: 1,
            commit_attempts: 20,
            commit_poll_ms: 1,
            verify_every: default_verify_every(),
            verify_timeout_ms: 200,
        }
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn commit_poll(&self) -> Duration {
        Duration::from_millis(self.commit_poll_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    /// Upper bound on the commit wait: `commit_attempts` polls of `commit_poll`.
    /// Saturates instead of overflowing.
    pub fn commit_timeout(&self) -> Duration {
        self.commit_poll()
            .checked_mul(self.commit_attempts)
            .unwrap_or(Duration::MAX)
    }
}

impl ProducerConfig {
    pub fn new(exchange_base: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::default(),
            routing_key: default_routing_key(),
            exchange_base: exchange_base.into(),
            num_queues: default_num_queues(),
            bind_by_id: false,
            use_transactional_channel: false,
            delimiter: default_delimiter(),
            rows_per_message: default_rows_per_message(),
            chunk_size: default_chunk_size(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn exchange_name(&self) -> String {
        format!("{}{}", self.exchange_base, EXCHANGE_SUFFIX)
    }

    /// The delimiter as the single byte the chunk buffer compares against.
    pub fn delimiter_byte(&self) -> Option<u8> {
        self.delimiter.and_then(|c| u8::try_from(c).ok())
    }

    pub fn validate(&self) -> std::result::Result<(), RabbitMQError> {
        let fail = |msg: &str| -> std::result::Result<(), RabbitMQError> {
            Err(RabbitMQError::ConfigError(msg.to_string()))
        };

        if self.exchange_base.is_empty() {
            return fail("exchange_base cannot be empty");
        }
        if self.rows_per_message == 0 {
            return fail("rows_per_message must be at least 1");
        }
        if self.chunk_size == 0 {
            return fail("chunk_size must be at least 1");
        }
        if self.bind_by_id && self.num_queues == 0 {
            return fail("num_queues must be at least 1 when binding by id");
        }
        if let Some(delim) = self.delimiter {
            if !delim.is_ascii() {
                return fail("delimiter must be a single-byte ASCII character");
            }
        }
        if self.retry.connect_attempts == 0 || self.retry.commit_attempts == 0 {
            return fail("retry attempt counts must be at least 1");
        }
        if self.retry.verify_every == 0 {
            return fail("verify_every must be at least 1");
        }
        if self.retry.commit_poll().checked_mul(self.retry.commit_attempts).is_none() {
            return fail("commit_attempts * commit_poll_ms overflows");
        }
        Ok(())
    }
}

// Configuration loading and management functions
pub fn find_config_file() -> Result<PathBuf> {
    // Check various locations
    let locations = [
        ("Current directory", Path::new("RowProducer.json")),
        ("Current directory (alternative)", Path::new("config/RowProducer.json")),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.to_path_buf());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(".RowProducer.json");
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find RowProducer.json configuration file. \
         Please create one in the current directory or your home directory."
    ))
}

pub fn load_config_from(path: &Path) -> Result<ProducerConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;

    let config: ProducerConfig = serde_json::from_str(&content)
        .context("Configuration file contains invalid JSON or missing required fields")?;

    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;

    info!(path = %path.display(), exchange = %config.exchange_name(), "Loaded producer configuration");
    Ok(config)
}

pub fn load_config() -> Result<ProducerConfig> {
    let path = find_config_file()?;
    load_config_from(&path)
}
