//! Serial transport for boardlink.
//!
//! Implements `PortProvider` and `Transport` over tokio-serial. Ports are
//! picked by USB vendor/product id and opened 8N1 without flow control.

use async_trait::async_trait;
use boardlink_hal::traits::{HalError, PortProvider, Transport};
use boardlink_hal::types::{PortDescriptor, PortFilter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, watch};
use tokio_serial::{
    DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialPortInfo, SerialPortType,
    SerialStream, StopBits,
};

/// A port found during enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub descriptor: PortDescriptor,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(port: SerialPortInfo) -> Self {
        match port.port_type {
            SerialPortType::UsbPort(usb) => PortInfo {
                descriptor: PortDescriptor {
                    usb_vendor_id: Some(usb.vid),
                    usb_product_id: Some(usb.pid),
                    path: port.port_name,
                },
                manufacturer: usb.manufacturer,
                product: usb.product,
            },
            _ => PortInfo {
                descriptor: PortDescriptor {
                    usb_vendor_id: None,
                    usb_product_id: None,
                    path: port.port_name,
                },
                manufacturer: None,
                product: None,
            },
        }
    }
}

/// First port accepted by `filters`. With no filters any USB port qualifies.
pub fn select_port<'a>(ports: &'a [PortInfo], filters: &[PortFilter]) -> Option<&'a PortInfo> {
    ports.iter().find(|port| {
        if filters.is_empty() {
            port.descriptor.usb_vendor_id.is_some()
        } else {
            port.descriptor.matches_any(filters)
        }
    })
}

fn open_error(path: &str, err: tokio_serial::Error) -> HalError {
    match err.kind() {
        tokio_serial::ErrorKind::NoDevice => HalError::DeviceNotFound(path.to_string()),
        tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            HalError::AccessDenied(format!("{path}: {err}"))
        }
        tokio_serial::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
            HalError::DeviceNotFound(path.to_string())
        }
        _ => HalError::CommError(format!("open {path}: {err}")),
    }
}

fn io_error(err: std::io::Error) -> HalError {
    match err.kind() {
        std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::UnexpectedEof => HalError::LinkClosed,
        _ => HalError::CommError(err.to_string()),
    }
}

/// Serial ports of this host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialPorts;

impl SerialPorts {
    pub fn new() -> Self {
        Self
    }

    pub fn list(&self) -> Result<Vec<PortInfo>, HalError> {
        let ports =
            tokio_serial::available_ports().map_err(|e| HalError::Unsupported(e.to_string()))?;
        Ok(ports.into_iter().map(PortInfo::from).collect())
    }
}

#[async_trait]
impl PortProvider for SerialPorts {
    async fn request_port(&self, filters: &[PortFilter]) -> Result<PortDescriptor, HalError> {
        let ports = self.list()?;
        log::debug!("{} serial port(s) present", ports.len());
        select_port(&ports, filters)
            .map(|port| port.descriptor.clone())
            .ok_or_else(|| {
                HalError::DeviceNotFound(format!(
                    "no serial port matches {} filter(s)",
                    filters.len()
                ))
            })
    }

    async fn open(
        &self,
        port: &PortDescriptor,
        baud_rate: u32,
    ) -> Result<Arc<dyn Transport>, HalError> {
        Ok(Arc::new(SerialTransport::open(port, baud_rate)?))
    }
}

/// An opened serial port. The OS handle is released once the transport is
/// closed and its last reference dropped.
pub struct SerialTransport {
    descriptor: PortDescriptor,
    reader: Mutex<ReadHalf<SerialStream>>,
    writer: Mutex<WriteHalf<SerialStream>>,
    open: AtomicBool,
    closed: watch::Sender<bool>,
}

impl SerialTransport {
    pub fn open(port: &PortDescriptor, baud_rate: u32) -> Result<Self, HalError> {
        let stream = tokio_serial::new(port.path.as_str(), baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| open_error(&port.path, e))?;

        log::info!("Opened serial port {port} at {baud_rate} baud");

        let (reader, writer) = tokio::io::split(stream);
        let (closed, _) = watch::channel(false);
        Ok(Self {
            descriptor: port.clone(),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            open: AtomicBool::new(true),
            closed,
        })
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn descriptor(&self) -> &PortDescriptor {
        &self.descriptor
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), HalError> {
        if !self.is_open() {
            return Err(HalError::LinkClosed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await.map_err(io_error)?;
        writer.flush().await.map_err(io_error)
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, HalError> {
        if !self.is_open() {
            return Err(HalError::LinkClosed);
        }
        let mut closed = self.closed.subscribe();
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = closed.wait_for(|c| *c) => Err(HalError::LinkClosed),
            read = reader.read(buf) => match read {
                Ok(0) => Err(HalError::LinkClosed),
                Ok(n) => Ok(n),
                Err(e) => Err(io_error(e)),
            },
        }
    }

    fn close(&self) -> Result<(), HalError> {
        if self.open.swap(false, Ordering::SeqCst) {
            log::info!("Closed serial port {}", self.descriptor);
            self.closed.send_replace(true);
        }
        Ok(())
    }
}
