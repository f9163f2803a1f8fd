//! Simulated board for tests and the `sim` session mode.
//!
//! `SimBoard` plays every external role at once: it is the port provider,
//! the opened transport and the protocol client. Signals are delivered from
//! spawned tasks, so a tokio runtime must be running.

use crate::traits::{
    HalError, PortProvider, ProtocolClient, ProtocolFactory, Signal, SignalHandler, Transport,
};
use crate::types::{
    BoardTopology, Capability, FirmwareInfo, PinCapabilities, PinMode, PortDescriptor, PortFilter,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

pub const SIM_VENDOR_ID: u16 = 0x04D8;
pub const SIM_PRODUCT_ID: u16 = 0xE83A;

/// Counters of what the host asked the simulated device to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    pub opens: usize,
    pub closes: usize,
    pub digital_reports: usize,
    pub analog_reports: usize,
    pub writes: usize,
    pub resets: usize,
    pub i2c_configs: usize,
}

struct SimDevice {
    descriptor: PortDescriptor,
    topology: BoardTopology,
    firmware: Option<FirmwareInfo>,
    digital_inputs: HashMap<u8, bool>,
    analog_inputs: HashMap<u8, u16>,
    outputs: HashMap<u8, u16>,
    modes: HashMap<u8, PinMode>,
    send_ready: bool,
    answer_reports: bool,
    open_error: Option<String>,
    open_delay: Duration,
    sample_delay: Duration,
    transport_open: bool,
    sinks: Vec<Arc<dyn SignalHandler>>,
    stats: SimStats,
}

#[derive(Clone)]
pub struct SimBoard {
    inner: Arc<Mutex<SimDevice>>,
}

impl SimBoard {
    pub fn new() -> Self {
        Self::with_descriptor(PortDescriptor {
            usb_vendor_id: Some(SIM_VENDOR_ID),
            usb_product_id: Some(SIM_PRODUCT_ID),
            path: "sim://board0".to_string(),
        })
    }

    pub fn with_descriptor(descriptor: PortDescriptor) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimDevice {
                descriptor,
                topology: uno_topology(),
                firmware: Some(FirmwareInfo {
                    name: "StandardFirmata.ino".to_string(),
                    major: 2,
                    minor: 5,
                }),
                digital_inputs: HashMap::new(),
                analog_inputs: HashMap::new(),
                outputs: HashMap::new(),
                modes: HashMap::new(),
                send_ready: true,
                answer_reports: true,
                open_error: None,
                open_delay: Duration::ZERO,
                sample_delay: Duration::ZERO,
                transport_open: false,
                sinks: Vec::new(),
                stats: SimStats::default(),
            })),
        }
    }

    fn device(&self) -> MutexGuard<'_, SimDevice> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn descriptor(&self) -> PortDescriptor {
        self.device().descriptor.clone()
    }

    pub fn set_digital_input(&self, pin: u8, value: bool) {
        self.device().digital_inputs.insert(pin, value);
    }

    pub fn set_analog_input(&self, channel: u8, value: u16) {
        self.device().analog_inputs.insert(channel, value);
    }

    /// Last value written to `pin` by any write command.
    pub fn output(&self, pin: u8) -> Option<u16> {
        self.device().outputs.get(&pin).copied()
    }

    pub fn mode(&self, pin: u8) -> Option<PinMode> {
        self.device().modes.get(&pin).copied()
    }

    /// Identity reported after the handshake; `None` for firmware that
    /// does not answer the query.
    pub fn set_firmware(&self, firmware: Option<FirmwareInfo>) {
        self.device().firmware = firmware;
    }

    /// When false the device never completes its handshake.
    pub fn set_send_ready(&self, send: bool) {
        self.device().send_ready = send;
    }

    /// When false reporting requests are accepted but no samples come back.
    pub fn set_answer_reports(&self, answer: bool) {
        self.device().answer_reports = answer;
    }

    pub fn set_open_error(&self, error: Option<&str>) {
        self.device().open_error = error.map(str::to_string);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        self.device().open_delay = delay;
    }

    pub fn set_sample_delay(&self, delay: Duration) {
        self.device().sample_delay = delay;
    }

    pub fn stats(&self) -> SimStats {
        self.device().stats.clone()
    }

    pub fn is_transport_open(&self) -> bool {
        self.device().transport_open
    }

    /// Number of protocol clients attached so far.
    pub fn attach_count(&self) -> usize {
        self.device().sinks.len()
    }

    /// Deliver `signal` through the most recently attached client.
    pub fn emit(&self, signal: Signal) {
        let sink = self.device().sinks.last().cloned();
        if let Some(sink) = sink {
            sink.on_signal(signal);
        }
    }

    /// Deliver `signal` through the client attached `index`-th, which may
    /// belong to a connection that has since been replaced.
    pub fn emit_via(&self, index: usize, signal: Signal) {
        let sink = self.device().sinks.get(index).cloned();
        if let Some(sink) = sink {
            sink.on_signal(signal);
        }
    }
}

impl Default for SimBoard {
    fn default() -> Self {
        Self::new()
    }
}

fn deliver_later(sink: Arc<dyn SignalHandler>, delay: Duration, signals: Vec<Signal>) {
    tokio::spawn(async move {
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }
        for signal in signals {
            sink.on_signal(signal);
        }
    });
}

/// Twenty pins laid out like an ATmega328 board: D0-D13, then A0-A5.
fn uno_topology() -> BoardTopology {
    let pins = (0u8..20)
        .map(|pin| {
            let mut caps = vec![
                Capability::new(PinMode::Input, 1),
                Capability::new(PinMode::Output, 1),
                Capability::new(PinMode::Pullup, 1),
            ];
            let mut analog_channel = None;
            if (2..=13).contains(&pin) {
                caps.push(Capability::new(PinMode::Servo, 14));
            }
            if matches!(pin, 3 | 5 | 6 | 9 | 10 | 11) {
                caps.push(Capability::new(PinMode::Pwm, 8));
            }
            if pin >= 14 {
                caps.push(Capability::new(PinMode::Analog, 10));
                analog_channel = Some(pin - 14);
            }
            if matches!(pin, 18 | 19) {
                caps.push(Capability::new(PinMode::I2c, 1));
            }
            PinCapabilities {
                capabilities: caps,
                analog_channel,
            }
        })
        .collect();
    BoardTopology { pins }
}

#[async_trait]
impl PortProvider for SimBoard {
    async fn request_port(&self, filters: &[PortFilter]) -> Result<PortDescriptor, HalError> {
        let descriptor = self.descriptor();
        if filters.is_empty() || descriptor.matches_any(filters) {
            Ok(descriptor)
        } else {
            Err(HalError::DeviceNotFound(format!(
                "no simulated port matches {} filter(s)",
                filters.len()
            )))
        }
    }

    async fn open(
        &self,
        port: &PortDescriptor,
        _baud_rate: u32,
    ) -> Result<Arc<dyn Transport>, HalError> {
        let delay = self.device().open_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut dev = self.device();
        if let Some(err) = &dev.open_error {
            return Err(HalError::AccessDenied(err.clone()));
        }
        if dev.transport_open {
            return Err(HalError::AccessDenied(format!("{} is already open", port.path)));
        }
        dev.transport_open = true;
        dev.stats.opens += 1;
        let (closed, _) = watch::channel(false);
        Ok(Arc::new(SimTransport {
            board: self.clone(),
            descriptor: port.clone(),
            open: AtomicBool::new(true),
            closed,
        }))
    }
}

impl ProtocolFactory for SimBoard {
    fn attach(
        &self,
        _transport: Arc<dyn Transport>,
        signals: Arc<dyn SignalHandler>,
    ) -> Result<Arc<dyn ProtocolClient>, HalError> {
        let mut dev = self.device();
        dev.sinks.push(signals.clone());
        let mut startup = vec![Signal::Open];
        if dev.send_ready {
            startup.push(Signal::Ready);
        }
        log::debug!("sim {}: client #{} attached", dev.descriptor.path, dev.sinks.len());
        drop(dev);

        deliver_later(signals.clone(), Duration::ZERO, startup);
        Ok(Arc::new(SimClient {
            board: self.clone(),
            signals,
        }))
    }
}

struct SimTransport {
    board: SimBoard,
    descriptor: PortDescriptor,
    open: AtomicBool,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl Transport for SimTransport {
    fn descriptor(&self) -> &PortDescriptor {
        &self.descriptor
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn write(&self, _bytes: &[u8]) -> Result<(), HalError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(HalError::LinkClosed)
        }
    }

    async fn read(&self, _buf: &mut [u8]) -> Result<usize, HalError> {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|c| *c).await;
        Err(HalError::LinkClosed)
    }

    fn close(&self) -> Result<(), HalError> {
        if self.open.swap(false, Ordering::SeqCst) {
            let mut dev = self.board.device();
            dev.transport_open = false;
            dev.stats.closes += 1;
            drop(dev);
            self.closed.send_replace(true);
        }
        Ok(())
    }
}

struct SimClient {
    board: SimBoard,
    signals: Arc<dyn SignalHandler>,
}

impl SimClient {
    fn linked(&self) -> Result<MutexGuard<'_, SimDevice>, HalError> {
        let dev = self.board.device();
        if dev.transport_open {
            Ok(dev)
        } else {
            Err(HalError::LinkClosed)
        }
    }

    fn record_write(&self, pin: u8, value: u16) -> Result<(), HalError> {
        let mut dev = self.linked()?;
        dev.outputs.insert(pin, value);
        dev.stats.writes += 1;
        Ok(())
    }
}

impl ProtocolClient for SimClient {
    fn set_pin_mode(&self, pin: u8, mode: PinMode) -> Result<(), HalError> {
        self.linked()?.modes.insert(pin, mode);
        Ok(())
    }

    fn write_digital(&self, pin: u8, value: u16, _enqueue: bool) -> Result<(), HalError> {
        self.record_write(pin, value)
    }

    fn write_pwm(&self, pin: u8, value: u16) -> Result<(), HalError> {
        self.record_write(pin, value)
    }

    fn write_servo(&self, pin: u8, value: u16) -> Result<(), HalError> {
        self.record_write(pin, value)
    }

    fn report_digital(&self, pin: u8, enable: bool) -> Result<(), HalError> {
        let mut dev = self.linked()?;
        if !enable {
            return Ok(());
        }
        dev.stats.digital_reports += 1;
        if dev.answer_reports {
            let value = dev.digital_inputs.get(&pin).copied().unwrap_or(false) as u16;
            let delay = dev.sample_delay;
            drop(dev);
            deliver_later(
                self.signals.clone(),
                delay,
                vec![Signal::DigitalSample { pin, value }],
            );
        }
        Ok(())
    }

    fn report_analog(&self, channel: u8, enable: bool) -> Result<(), HalError> {
        let mut dev = self.linked()?;
        if !enable {
            return Ok(());
        }
        dev.stats.analog_reports += 1;
        if dev.answer_reports {
            let value = dev.analog_inputs.get(&channel).copied().unwrap_or(0);
            let delay = dev.sample_delay;
            drop(dev);
            deliver_later(
                self.signals.clone(),
                delay,
                vec![Signal::AnalogSample { channel, value }],
            );
        }
        Ok(())
    }

    fn i2c_config(&self, _delay_us: u16) -> Result<(), HalError> {
        self.linked()?.stats.i2c_configs += 1;
        Ok(())
    }

    fn reset(&self) -> Result<(), HalError> {
        self.linked()?.stats.resets += 1;
        Ok(())
    }

    fn topology(&self) -> BoardTopology {
        self.board.device().topology.clone()
    }

    fn firmware(&self) -> Option<FirmwareInfo> {
        self.board.device().firmware.clone()
    }
}
