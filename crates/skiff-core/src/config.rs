use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConsumerError;
use crate::types::{ConsumeFrom, now_millis};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub instance_name: String,
    pub rebalance_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub consume_from: ConsumeFrom,
    pub consume_timestamp_ms: i64,
    pub max_count_for_queue: usize,
    pub max_size_for_queue: usize,
    /// `None` leaves the per-queue count limit untouched on rebalance.
    pub max_count_for_topic: Option<usize>,
    /// `None` leaves the per-queue size limit untouched on rebalance.
    pub max_size_for_topic: Option<usize>,
    pub pull_interval_ms: u64,
    pub pull_batch_size: u32,
    pub consume_timeout_secs: u64,
    pub consume_batch_max_size: usize,
    /// Redelivery limit handed to the broker with every send-back; -1 keeps the broker default.
    pub max_reconsume_times: i32,
    pub scheduler_workers: usize,
    pub pull_expired_interval_secs: u64,
    pub expiry_sweep_interval_secs: u64,
    pub search_offset_timeout_ms: u64,
    pub request_buffer_size: usize,
    pub flow_control_delay_ms: u64,
    pub pull_error_delay_ms: u64,
    pub send_back_retry_delay_ms: u64,
    /// Re-run a rebalance pass this long after a partition failed offset initialization.
    pub offset_init_retry_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            instance_name: "DEFAULT".to_string(),
            rebalance_interval_secs: 20,
            heartbeat_interval_secs: 30,
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consume_from: ConsumeFrom::LastOffset,
            consume_timestamp_ms: now_millis() - 30 * 60 * 1000,
            max_count_for_queue: 1000,
            max_size_for_queue: 100,
            max_count_for_topic: None,
            max_size_for_topic: None,
            pull_interval_ms: 0,
            pull_batch_size: 32,
            consume_timeout_secs: 15 * 60,
            consume_batch_max_size: 1,
            max_reconsume_times: -1,
            scheduler_workers: 2,
            pull_expired_interval_secs: 120,
            expiry_sweep_interval_secs: 10,
            search_offset_timeout_ms: 3000,
            request_buffer_size: 16,
            flow_control_delay_ms: 50,
            pull_error_delay_ms: 3000,
            send_back_retry_delay_ms: 5000,
            offset_init_retry_ms: None,
        }
    }
}

impl ClientConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self, ConsumerError> {
        let mut figment = Figment::from(Serialized::defaults(ClientConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("SKIFF_CLIENT_").split("__"));

        let config: Self = figment.extract()?;
        if config.rebalance_interval_secs == 0 || config.heartbeat_interval_secs == 0 {
            return Err(ConsumerError::InvalidConfig(
                "client intervals must be positive".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_secs(self.rebalance_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl ConsumerConfig {
    /// Load from defaults, then an optional TOML file, then `SKIFF_` env vars.
    /// An unrecognized `consume_from` value fails here, before anything starts.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConsumerError> {
        let mut figment = Figment::from(Serialized::defaults(ConsumerConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("SKIFF_").split("__"));

        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConsumerError> {
        let invalid = |what: &str| Err(ConsumerError::InvalidConfig(format!("{what} must be positive")));

        if self.scheduler_workers == 0 {
            return invalid("scheduler_workers");
        }
        if self.pull_batch_size == 0 {
            return invalid("pull_batch_size");
        }
        if self.consume_batch_max_size == 0 {
            return invalid("consume_batch_max_size");
        }
        if self.max_count_for_queue == 0 || self.max_size_for_queue == 0 {
            return invalid("per-queue limits");
        }
        if self.pull_expired_interval_secs == 0 {
            return invalid("pull_expired_interval_secs");
        }
        if self.expiry_sweep_interval_secs == 0 {
            return invalid("expiry_sweep_interval_secs");
        }
        if self.request_buffer_size == 0 {
            return invalid("request_buffer_size");
        }
        if self.consume_timeout_secs == 0 {
            return invalid("consume_timeout_secs");
        }
        Ok(())
    }

    pub fn pull_interval(&self) -> Duration {
        Duration::from_millis(self.pull_interval_ms)
    }

    pub fn consume_timeout(&self) -> Duration {
        Duration::from_secs(self.consume_timeout_secs)
    }

    pub fn pull_expired_interval(&self) -> Duration {
        Duration::from_secs(self.pull_expired_interval_secs)
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_interval_secs)
    }

    pub fn search_offset_timeout(&self) -> Duration {
        Duration::from_millis(self.search_offset_timeout_ms)
    }

    pub fn flow_control_delay(&self) -> Duration {
        Duration::from_millis(self.flow_control_delay_ms)
    }

    pub fn pull_error_delay(&self) -> Duration {
        Duration::from_millis(self.pull_error_delay_ms)
    }

    pub fn send_back_retry_delay(&self) -> Duration {
        Duration::from_millis(self.send_back_retry_delay_ms)
    }

    pub fn offset_init_retry(&self) -> Option<Duration> {
        self.offset_init_retry_ms.map(Duration::from_millis)
    }
}
