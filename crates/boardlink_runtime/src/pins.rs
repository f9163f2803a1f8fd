//! Per-pin cache of the last sampled value, mode and read bookkeeping.

use boardlink_hal::types::{BoardTopology, InputBias, PinCapabilities, PinMode};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::BoardError;

#[derive(Debug, Clone, PartialEq)]
pub struct Pin {
    pub index: u8,
    pub mode: PinMode,
    pub value: u16,
    pub last_update: Option<Instant>,
    pub updating: bool,
    pub input_bias: InputBias,
    pub capabilities: PinCapabilities,
}

impl Pin {
    fn new(index: u8, capabilities: PinCapabilities) -> Self {
        let mode = if capabilities.supports(PinMode::Input) {
            PinMode::Input
        } else {
            capabilities
                .capabilities
                .first()
                .map(|c| c.mode)
                .unwrap_or(PinMode::Ignore)
        };
        Self {
            index,
            mode,
            value: 0,
            last_update: None,
            updating: false,
            input_bias: InputBias::None,
            capabilities,
        }
    }

    fn is_fresh(&self, now: Instant, interval: Duration) -> bool {
        self.last_update
            .is_some_and(|at| now.saturating_duration_since(at) < interval)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadKind {
    Digital,
    Analog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadPlan {
    Cached(u16),
    Sample,
}

/// Pin table of one connection. Built when the board reports ready; `epoch`
/// is the connection generation it was built under.
#[derive(Debug, Default)]
pub struct PinTable {
    epoch: u64,
    pins: Vec<Pin>,
    analog_pins: Vec<u8>,
    waiters: HashMap<(ReadKind, u8), oneshot::Sender<u16>>,
}

impl PinTable {
    pub fn from_topology(topology: &BoardTopology, epoch: u64) -> Self {
        let pins = topology
            .pins
            .iter()
            .enumerate()
            .map(|(index, caps)| Pin::new(index as u8, caps.clone()))
            .collect();
        Self {
            epoch,
            pins,
            analog_pins: topology.analog_pins(),
            waiters: HashMap::new(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    pub fn get(&self, index: u8) -> Option<&Pin> {
        self.pins.get(index as usize)
    }

    pub fn get_mut(&mut self, index: u8) -> Option<&mut Pin> {
        self.pins.get_mut(index as usize)
    }

    fn pin_mut(&mut self, index: u8) -> Result<&mut Pin, BoardError> {
        self.pins
            .get_mut(index as usize)
            .ok_or(BoardError::InvalidPin(index))
    }

    /// Pin number of analog channel `channel`.
    pub fn analog_pin(&self, channel: u8) -> Option<u8> {
        self.analog_pins.get(channel as usize).copied()
    }

    pub fn analog_pins(&self) -> &[u8] {
        &self.analog_pins
    }

    /// Pins that support `mode` and are not analog inputs.
    pub fn pins_supporting(&self, mode: PinMode) -> Vec<u8> {
        self.pins
            .iter()
            .filter(|p| p.capabilities.supports(mode) && !p.capabilities.supports(PinMode::Analog))
            .map(|p| p.index)
            .collect()
    }

    /// Decide whether a read can be served from cache.
    pub(crate) fn plan_read(
        &self,
        kind: ReadKind,
        index: u8,
        now: Instant,
        interval: Duration,
    ) -> Result<ReadPlan, BoardError> {
        let pin = self.get(index).ok_or(BoardError::InvalidPin(index))?;
        let cached = ReadPlan::Cached(pin.value);
        if kind == ReadKind::Digital && !pin.mode.is_digital_readable() {
            return Ok(cached);
        }
        if pin.updating || pin.is_fresh(now, interval) {
            return Ok(cached);
        }
        Ok(ReadPlan::Sample)
    }

    /// Mark `index` in flight and register the waiter for its next sample.
    pub(crate) fn begin_read(
        &mut self,
        kind: ReadKind,
        index: u8,
    ) -> Result<oneshot::Receiver<u16>, BoardError> {
        self.pin_mut(index)?.updating = true;
        let (tx, rx) = oneshot::channel();
        self.waiters.insert((kind, index), tx);
        Ok(rx)
    }

    /// Switch the pin into `mode`, returning the mode when a change is needed.
    pub(crate) fn switch_mode(&mut self, index: u8, mode: PinMode) -> Result<Option<PinMode>, BoardError> {
        let pin = self.pin_mut(index)?;
        if pin.mode == mode {
            return Ok(None);
        }
        pin.mode = mode;
        Ok(Some(mode))
    }

    /// Bring an input pin in line with its recorded bias. Pins in any other
    /// mode are left alone.
    pub(crate) fn apply_bias(&mut self, index: u8) -> Result<Option<PinMode>, BoardError> {
        let pin = self.pin_mut(index)?;
        let mode = pin.input_bias.mode();
        if !pin.mode.is_digital_readable() || pin.mode == mode {
            return Ok(None);
        }
        pin.mode = mode;
        Ok(Some(mode))
    }

    pub(crate) fn set_bias(&mut self, index: u8, bias: InputBias) -> Result<PinMode, BoardError> {
        let pin = self.pin_mut(index)?;
        pin.input_bias = bias;
        pin.mode = bias.mode();
        Ok(pin.mode)
    }

    /// Hand a sample to the pending read of `index`, if any.
    pub(crate) fn resolve(&mut self, kind: ReadKind, index: u8, value: u16) -> bool {
        match self.waiters.remove(&(kind, index)) {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    pub(crate) fn store(&mut self, index: u8, value: u16, now: Instant) {
        if let Some(pin) = self.get_mut(index) {
            pin.value = value;
            pin.last_update = Some(now);
        }
    }

    /// Disarm the pending read of `index` and zero its cached value.
    pub(crate) fn fail(&mut self, kind: ReadKind, index: u8) {
        self.waiters.remove(&(kind, index));
        if let Some(pin) = self.get_mut(index) {
            pin.value = 0;
        }
    }

    pub(crate) fn finish(&mut self, index: u8) {
        if let Some(pin) = self.get_mut(index) {
            pin.updating = false;
        }
    }

    /// Drop every pending waiter; their reads observe a closed channel.
    pub(crate) fn clear_waiters(&mut self) {
        self.waiters.clear();
    }
}
