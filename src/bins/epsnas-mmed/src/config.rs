//! MME Configuration
//!
//! Feature flags, default GUMMEI used for network-assigned GUTIs, and NAS
//! timer durations. Loaded from a YAML file; every section has defaults so
//! a partial (or absent) file still yields a runnable configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// T3450 default value (seconds) - ATTACH ACCEPT retransmission
pub const T3450_DEFAULT_VALUE: u64 = 6;
/// T3460 default value (seconds) - authentication request retransmission
pub const T3460_DEFAULT_VALUE: u64 = 6;
/// T3470 default value (seconds) - identity request retransmission
pub const T3470_DEFAULT_VALUE: u64 = 6;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Optional MME behaviours (TS 24.301 network options)
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MmeFeatures {
    /// Attach for emergency bearer services is supported
    #[serde(default)]
    pub emergency_attach: bool,
    /// Emergency attach with an unauthenticated IMSI may skip authentication
    #[serde(default)]
    pub unauthenticated_imsi: bool,
}

/// Default GUMMEI used when the network assigns a GUTI itself
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GummeiConf {
    /// MME code
    #[serde(default)]
    pub mme_code: u8,
    /// MME group id
    #[serde(default)]
    pub mme_gid: u16,
    /// Tracking area code advertised with a network-assigned GUTI
    #[serde(default)]
    pub tac: u16,
}

/// NAS timer durations in seconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimerConf {
    #[serde(default = "TimerConf::default_t3450")]
    pub t3450: u64,
    #[serde(default = "TimerConf::default_t3460")]
    pub t3460: u64,
    #[serde(default = "TimerConf::default_t3470")]
    pub t3470: u64,
}

impl TimerConf {
    fn default_t3450() -> u64 {
        T3450_DEFAULT_VALUE
    }
    fn default_t3460() -> u64 {
        T3460_DEFAULT_VALUE
    }
    fn default_t3470() -> u64 {
        T3470_DEFAULT_VALUE
    }
}

impl Default for TimerConf {
    fn default() -> Self {
        TimerConf {
            t3450: T3450_DEFAULT_VALUE,
            t3460: T3460_DEFAULT_VALUE,
            t3470: T3470_DEFAULT_VALUE,
        }
    }
}

/// MME configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MmeConfig {
    #[serde(default)]
    pub features: MmeFeatures,
    #[serde(default)]
    pub gummei: GummeiConf,
    #[serde(default)]
    pub timers: TimerConf,
    /// Run the identification common procedure even when a supplied GUTI is
    /// known to the network. Off by default: identification is initiated
    /// only when the GUTI lookup fails.
    #[serde(default)]
    pub force_guti_identification: bool,
}

impl MmeConfig {
    /// Load the configuration from a YAML file
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn t3450(&self) -> Duration {
        Duration::from_secs(self.timers.t3450)
    }

    pub fn t3460(&self) -> Duration {
        Duration::from_secs(self.timers.t3460)
    }

    pub fn t3470(&self) -> Duration {
        Duration::from_secs(self.timers.t3470)
    }
}
