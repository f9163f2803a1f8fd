//! Board session orchestrator.
//!
//! Reads a TOML config file, selects the port/protocol backend and wires a
//! `Registry` plus the host event channel into a `Session`.
//!
//! Supported modes:
//! - `sim`: `SimBoard` plays port, transport and protocol client
//! - `serial`: `SerialPorts` over tokio-serial, protocol client supplied by
//!   the caller through `create_session_with`

pub mod extension;

use boardlink_hal::config::BoardConfig;
use boardlink_hal::sim::{SIM_PRODUCT_ID, SIM_VENDOR_ID, SimBoard};
use boardlink_hal::traits::ProtocolFactory;
use boardlink_hal::types::PortDescriptor;
use boardlink_runtime::{BoardError, HostEvent, HostNotifier, Registry};
use boardlink_serial::SerialPorts;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use extension::{Extension, parse_pin};

/// Top-level orchestrator config, deserialized from TOML.
#[derive(Debug, Deserialize)]
pub struct OrchestratorConfig {
    pub mode: ModeConfig,
    #[serde(default)]
    pub board: BoardConfig,
    #[serde(default)]
    pub extension: ExtensionSection,
    #[serde(default)]
    pub sim: SimSection,
}

#[derive(Debug, Deserialize)]
pub struct ModeConfig {
    #[serde(rename = "type")]
    pub mode_type: String,
}

#[derive(Debug, Deserialize)]
pub struct ExtensionSection {
    #[serde(default = "default_extension_id")]
    pub id: String,
    /// Peripheral name announced to the host when the firmware does not
    /// identify itself.
    #[serde(default = "default_extension_name")]
    pub name: String,
}

fn default_extension_id() -> String {
    "boardlink".to_string()
}
fn default_extension_name() -> String {
    "Board".to_string()
}

impl Default for ExtensionSection {
    fn default() -> Self {
        Self {
            id: default_extension_id(),
            name: default_extension_name(),
        }
    }
}

/// Initial state of the simulated board.
#[derive(Debug, Deserialize)]
pub struct SimSection {
    #[serde(default = "default_sim_path")]
    pub path: String,
    #[serde(default = "default_sim_vendor_id")]
    pub usb_vendor_id: u16,
    #[serde(default = "default_sim_product_id")]
    pub usb_product_id: u16,
    /// Digital pins that read HIGH.
    #[serde(default)]
    pub high_pins: Vec<u8>,
    /// Analog values indexed by channel (A0 first).
    #[serde(default)]
    pub analog_values: Vec<u16>,
}

fn default_sim_path() -> String {
    "sim://board0".to_string()
}
fn default_sim_vendor_id() -> u16 {
    SIM_VENDOR_ID
}
fn default_sim_product_id() -> u16 {
    SIM_PRODUCT_ID
}

impl Default for SimSection {
    fn default() -> Self {
        Self {
            path: default_sim_path(),
            usb_vendor_id: default_sim_vendor_id(),
            usb_product_id: default_sim_product_id(),
            high_pins: Vec::new(),
            analog_values: Vec::new(),
        }
    }
}

impl SimSection {
    pub fn build(&self) -> SimBoard {
        let sim = SimBoard::with_descriptor(PortDescriptor {
            usb_vendor_id: Some(self.usb_vendor_id),
            usb_product_id: Some(self.usb_product_id),
            path: self.path.clone(),
        });
        for &pin in &self.high_pins {
            sim.set_digital_input(pin, true);
        }
        for (channel, &value) in self.analog_values.iter().enumerate() {
            sim.set_analog_input(channel as u8, value);
        }
        sim
    }
}

/// Parsed mode selection.
#[derive(Debug, Clone, PartialEq)]
pub enum HalMode {
    Sim,
    Serial,
}

impl OrchestratorConfig {
    /// Parse from TOML string.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Parse from TOML file path.
    pub fn from_file(path: &str) -> Result<Self, OrchestratorError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OrchestratorError::ConfigError(format!("{path}: {e}")))?;
        Self::from_toml(&content).map_err(|e| OrchestratorError::ConfigError(e.to_string()))
    }

    /// Resolve the mode from config.
    pub fn hal_mode(&self) -> Result<HalMode, OrchestratorError> {
        match self.mode.mode_type.as_str() {
            "sim" => Ok(HalMode::Sim),
            "serial" => Ok(HalMode::Serial),
            other => Err(OrchestratorError::ConfigError(format!(
                "unknown mode type: {other}"
            ))),
        }
    }
}

/// Everything a host needs to drive boards: the shared registry, a command
/// surface bound to the configured extension id and the host event stream.
pub struct Session {
    pub registry: Registry,
    pub extension: Extension,
    pub host_events: mpsc::UnboundedReceiver<HostEvent>,
    /// The simulated device in `sim` mode.
    pub sim: Option<SimBoard>,
}

impl Session {
    /// Another command producer sharing this session's boards.
    pub fn extension(&self, id: &str) -> Extension {
        Extension::new(id, self.registry.clone())
    }
}

/// Create a session from orchestrator config.
pub fn create_session(config: &OrchestratorConfig) -> Result<Session, OrchestratorError> {
    match config.hal_mode()? {
        HalMode::Sim => {
            let sim = config.sim.build();
            let (host, host_events) = HostNotifier::channel();
            let registry = Registry::named(
                &config.extension.name,
                config.board.clone(),
                Arc::new(sim.clone()),
                Arc::new(sim.clone()),
                host,
            );
            log::info!("session: simulated board at {}", sim.descriptor());
            Ok(Session {
                extension: Extension::new(&config.extension.id, registry.clone()),
                registry,
                host_events,
                sim: Some(sim),
            })
        }
        HalMode::Serial => Err(OrchestratorError::ConfigError(
            "serial mode needs a protocol client; use create_session_with".into(),
        )),
    }
}

/// Create a session whose boards speak through `protocol`. In `sim` mode the
/// simulated device is used as port provider and `protocol` is ignored.
pub fn create_session_with(
    config: &OrchestratorConfig,
    protocol: Arc<dyn ProtocolFactory>,
) -> Result<Session, OrchestratorError> {
    match config.hal_mode()? {
        HalMode::Sim => create_session(config),
        HalMode::Serial => {
            let (host, host_events) = HostNotifier::channel();
            let registry = Registry::named(
                &config.extension.name,
                config.board.clone(),
                Arc::new(SerialPorts::new()),
                protocol,
                host,
            );
            log::info!(
                "session: serial ports at {} baud, {} filter(s)",
                config.board.baud_rate,
                config.board.filters.len()
            );
            Ok(Session {
                extension: Extension::new(&config.extension.id, registry.clone()),
                registry,
                host_events,
                sim: None,
            })
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("config error: {0}")]
    ConfigError(String),
    #[error("board error: {0}")]
    BoardError(#[from] BoardError),
}
