use serde::{Deserialize, Serialize};
use std::fmt;

/// Logic level constants as the firmware reports them.
pub const LOW: u16 = 0;
pub const HIGH: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinMode {
    Input,
    Output,
    Analog,
    Pwm,
    Servo,
    Shift,
    I2c,
    OneWire,
    Stepper,
    Encoder,
    Serial,
    Pullup,
    Ignore,
}

impl PinMode {
    /// Mode code used by the firmware's pin-mode command.
    pub fn code(self) -> u8 {
        match self {
            PinMode::Input => 0x00,
            PinMode::Output => 0x01,
            PinMode::Analog => 0x02,
            PinMode::Pwm => 0x03,
            PinMode::Servo => 0x04,
            PinMode::Shift => 0x05,
            PinMode::I2c => 0x06,
            PinMode::OneWire => 0x07,
            PinMode::Stepper => 0x08,
            PinMode::Encoder => 0x09,
            PinMode::Serial => 0x0A,
            PinMode::Pullup => 0x0B,
            PinMode::Ignore => 0x7F,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let mode = match code {
            0x00 => PinMode::Input,
            0x01 => PinMode::Output,
            0x02 => PinMode::Analog,
            0x03 => PinMode::Pwm,
            0x04 => PinMode::Servo,
            0x05 => PinMode::Shift,
            0x06 => PinMode::I2c,
            0x07 => PinMode::OneWire,
            0x08 => PinMode::Stepper,
            0x09 => PinMode::Encoder,
            0x0A => PinMode::Serial,
            0x0B => PinMode::Pullup,
            0x7F => PinMode::Ignore,
            _ => return None,
        };
        Some(mode)
    }

    /// Input modes in which a digital read samples the pin level. Pins driven
    /// as outputs or claimed by another function (PWM, servo, bus...) are
    /// served from cache.
    pub fn is_digital_readable(self) -> bool {
        matches!(self, PinMode::Input | PinMode::Pullup)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputBias {
    #[default]
    None,
    PullUp,
}

impl InputBias {
    pub fn from_pull_up(pull_up: bool) -> Self {
        if pull_up {
            InputBias::PullUp
        } else {
            InputBias::None
        }
    }

    /// Pin mode that applies this bias.
    pub fn mode(self) -> PinMode {
        match self {
            InputBias::None => PinMode::Input,
            InputBias::PullUp => PinMode::Pullup,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub mode: PinMode,
    pub resolution: u8,
}

impl Capability {
    pub fn new(mode: PinMode, resolution: u8) -> Self {
        Self { mode, resolution }
    }
}

/// Capability set reported by the firmware for a single pin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinCapabilities {
    pub capabilities: Vec<Capability>,
    pub analog_channel: Option<u8>,
}

impl PinCapabilities {
    pub fn supports(&self, mode: PinMode) -> bool {
        self.capabilities.iter().any(|c| c.mode == mode)
    }
}

/// Pin layout of a board, indexed by pin number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardTopology {
    pub pins: Vec<PinCapabilities>,
}

impl BoardTopology {
    /// Pin numbers ordered by analog channel (`analog_pins()[0]` is A0).
    pub fn analog_pins(&self) -> Vec<u8> {
        let mut channels: Vec<(u8, u8)> = self
            .pins
            .iter()
            .enumerate()
            .filter_map(|(index, pin)| pin.analog_channel.map(|ch| (ch, index as u8)))
            .collect();
        channels.sort_unstable();
        channels.into_iter().map(|(_, index)| index).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirmwareInfo {
    pub name: String,
    pub major: u8,
    pub minor: u8,
}

impl fmt::Display for FirmwareInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}.{}", self.name, self.major, self.minor)
    }
}

/// Identity of an opened port, captured once at open time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortDescriptor {
    pub usb_vendor_id: Option<u16>,
    pub usb_product_id: Option<u16>,
    pub path: String,
}

impl PortDescriptor {
    pub fn matches(&self, filter: &PortFilter) -> bool {
        self.usb_vendor_id == Some(filter.usb_vendor_id)
            && self.usb_product_id == Some(filter.usb_product_id)
    }

    pub fn matches_any(&self, filters: &[PortFilter]) -> bool {
        filters.iter().any(|f| self.matches(f))
    }
}

impl fmt::Display for PortDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.usb_vendor_id, self.usb_product_id) {
            (Some(vid), Some(pid)) => write!(f, "{} ({vid:04X}:{pid:04X})", self.path),
            _ => f.write_str(&self.path),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct PortFilter {
    pub usb_vendor_id: u16,
    pub usb_product_id: u16,
}
