use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::NetLocation;
use crate::relay::DialBackoff;
use crate::udp_endpoint::{
    DEFAULT_FULL_CONE_TIMEOUT, DEFAULT_QUEUE_CAPACITY, DEFAULT_SYMMETRIC_TIMEOUT,
};

fn default_full_cone_secs() -> u64 {
    DEFAULT_FULL_CONE_TIMEOUT.as_secs()
}

fn default_symmetric_secs() -> u64 {
    DEFAULT_SYMMETRIC_TIMEOUT.as_secs()
}

fn default_dial_secs() -> u64 {
    10
}

fn default_backoff_base_millis() -> u64 {
    500
}

fn default_backoff_max_secs() -> u64 {
    60
}

fn default_backoff_max_tracked() -> usize {
    256
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_stats_interval_secs() -> u64 {
    60
}

/// One UDP port forwarder: datagrams arriving on `bind_location` are relayed
/// to `target`, with a dedicated upstream socket per client.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    pub bind_location: NetLocation,
    pub target: NetLocation,
    #[serde(default)]
    pub bind_interface: Option<String>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How often traffic counters are logged. 0 disables stats logging.
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    #[serde(default = "default_full_cone_secs")]
    pub full_cone_secs: u64,
    #[serde(default = "default_symmetric_secs")]
    pub symmetric_secs: u64,
    #[serde(default = "default_dial_secs")]
    pub dial_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            full_cone_secs: default_full_cone_secs(),
            symmetric_secs: default_symmetric_secs(),
            dial_secs: default_dial_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn full_cone(&self) -> Duration {
        Duration::from_secs(self.full_cone_secs)
    }

    pub fn symmetric(&self) -> Duration {
        Duration::from_secs(self.symmetric_secs)
    }

    pub fn dial(&self) -> Duration {
        Duration::from_secs(self.dial_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base_millis")]
    pub base_millis: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub max_secs: u64,
    #[serde(default = "default_backoff_max_tracked")]
    pub max_tracked: usize,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_millis: default_backoff_base_millis(),
            max_secs: default_backoff_max_secs(),
            max_tracked: default_backoff_max_tracked(),
        }
    }
}

impl BackoffConfig {
    pub fn create_backoff(&self) -> DialBackoff {
        DialBackoff::new(
            Duration::from_millis(self.base_millis),
            Duration::from_secs(self.max_secs),
            self.max_tracked,
        )
    }
}
