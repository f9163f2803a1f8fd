use serde::Deserialize;
use std::time::Duration;

use crate::types::PortFilter;

/// Connection and pin I/O tuning for one board.
#[derive(Debug, Clone, Deserialize)]
pub struct BoardConfig {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_open_timeout")]
    pub open_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_read_interval")]
    pub digital_read_interval_ms: u64,
    #[serde(default = "default_read_interval")]
    pub analog_read_interval_ms: u64,
    #[serde(default = "default_read_timeout")]
    pub digital_read_timeout_ms: u64,
    #[serde(default = "default_read_timeout")]
    pub analog_read_timeout_ms: u64,
    #[serde(default = "default_write_pacing")]
    pub write_pacing_ms: u64,
    #[serde(default)]
    pub filters: Vec<PortFilter>,
    #[serde(default = "default_init_i2c")]
    pub init_i2c: bool,
    #[serde(default)]
    pub i2c_delay_us: u16,
}

fn default_baud_rate() -> u32 {
    57600
}
fn default_open_timeout() -> u64 {
    5000
}
fn default_handshake_timeout() -> u64 {
    10_000
}
fn default_read_interval() -> u64 {
    20
}
fn default_read_timeout() -> u64 {
    100
}
fn default_write_pacing() -> u64 {
    10
}
fn default_init_i2c() -> bool {
    true
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            open_timeout_ms: default_open_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
            digital_read_interval_ms: default_read_interval(),
            analog_read_interval_ms: default_read_interval(),
            digital_read_timeout_ms: default_read_timeout(),
            analog_read_timeout_ms: default_read_timeout(),
            write_pacing_ms: default_write_pacing(),
            filters: Vec::new(),
            init_i2c: default_init_i2c(),
            i2c_delay_us: 0,
        }
    }
}

impl BoardConfig {
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn digital_read_interval(&self) -> Duration {
        Duration::from_millis(self.digital_read_interval_ms)
    }

    pub fn analog_read_interval(&self) -> Duration {
        Duration::from_millis(self.analog_read_interval_ms)
    }

    pub fn digital_read_timeout(&self) -> Duration {
        Duration::from_millis(self.digital_read_timeout_ms)
    }

    pub fn analog_read_timeout(&self) -> Duration {
        Duration::from_millis(self.analog_read_timeout_ms)
    }

    pub fn write_pacing(&self) -> Duration {
        Duration::from_millis(self.write_pacing_ms)
    }
}
