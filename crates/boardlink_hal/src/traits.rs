use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::types::{BoardTopology, FirmwareInfo, PinMode, PortDescriptor, PortFilter};

#[derive(Debug, Error)]
pub enum HalError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("port access denied: {0}")]
    AccessDenied(String),
    #[error("communication error: {0}")]
    CommError(String),
    #[error("serial transport unavailable: {0}")]
    Unsupported(String),
    #[error("link closed")]
    LinkClosed,
}

impl HalError {
    /// The link is gone and the board has to be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HalError::LinkClosed)
    }
}

/// Asynchronous notification from a protocol client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Open,
    Ready,
    Close,
    Error(String),
    Disconnect,
    DigitalSample { pin: u8, value: u16 },
    AnalogSample { channel: u8, value: u16 },
}

/// Receiver for the signals of one protocol client instance.
pub trait SignalHandler: Send + Sync {
    fn on_signal(&self, signal: Signal);
}

/// An opened byte-stream link to a board.
#[async_trait]
pub trait Transport: Send + Sync {
    fn descriptor(&self) -> &PortDescriptor;
    fn is_open(&self) -> bool;
    async fn write(&self, bytes: &[u8]) -> Result<(), HalError>;
    /// Returns `Err(HalError::LinkClosed)` once the transport is closed.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, HalError>;
    fn close(&self) -> Result<(), HalError>;
}

/// Discovers and opens ports.
#[async_trait]
pub trait PortProvider: Send + Sync {
    /// Pick a port accepted by `filters` (any port when empty).
    async fn request_port(&self, filters: &[PortFilter]) -> Result<PortDescriptor, HalError>;
    async fn open(
        &self,
        port: &PortDescriptor,
        baud_rate: u32,
    ) -> Result<Arc<dyn Transport>, HalError>;
}

/// Builds a protocol client on top of an opened transport.
///
/// Signals must be delivered asynchronously: a client may not call the
/// handler from inside `attach`.
pub trait ProtocolFactory: Send + Sync {
    fn attach(
        &self,
        transport: Arc<dyn Transport>,
        signals: Arc<dyn SignalHandler>,
    ) -> Result<Arc<dyn ProtocolClient>, HalError>;
}

/// Command side of the firmware protocol. Commands are queued, not
/// acknowledged.
pub trait ProtocolClient: Send + Sync {
    fn set_pin_mode(&self, pin: u8, mode: PinMode) -> Result<(), HalError>;
    fn write_digital(&self, pin: u8, value: u16, enqueue: bool) -> Result<(), HalError>;
    fn write_pwm(&self, pin: u8, value: u16) -> Result<(), HalError>;
    fn write_servo(&self, pin: u8, value: u16) -> Result<(), HalError>;
    fn report_digital(&self, pin: u8, enable: bool) -> Result<(), HalError>;
    fn report_analog(&self, channel: u8, enable: bool) -> Result<(), HalError>;
    fn i2c_config(&self, delay_us: u16) -> Result<(), HalError>;
    fn reset(&self) -> Result<(), HalError>;
    fn topology(&self) -> BoardTopology;
    fn firmware(&self) -> Option<FirmwareInfo>;
}
