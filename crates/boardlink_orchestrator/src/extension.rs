//! Command surface used by one command producer (a block extension).
//!
//! Every command degrades to a neutral result instead of failing: reads on
//! a missing board or an unassigned pin return false/0, writes are dropped.

use boardlink_hal::types::PinMode;
use boardlink_runtime::{Board, BoardError, Registry};
use std::sync::{Mutex, PoisonError};

pub const NOT_CONNECTED: &str = "not connected";
pub const PIN_NOT_ASSIGNED: &str = "pin not assigned";

/// Parse a pin identifier coming from the host. Empty input is the
/// unassigned sentinel. Analog identifiers may carry an `A` prefix.
pub fn parse_pin(input: &str) -> Option<u8> {
    let trimmed = input.trim();
    let digits = trimmed
        .strip_prefix('A')
        .or_else(|| trimmed.strip_prefix('a'))
        .unwrap_or(trimmed);
    digits.parse().ok()
}

pub struct Extension {
    id: String,
    registry: Registry,
    board: Mutex<Option<Board>>,
}

impl Extension {
    pub fn new(id: &str, registry: Registry) -> Self {
        Self {
            id: id.to_string(),
            registry,
            board: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The board this extension last acquired, while it is still connected.
    pub fn board(&self) -> Option<Board> {
        let board = self
            .board
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        board.filter(Board::is_connected)
    }

    /// Find or connect a board for this extension.
    pub async fn scan(&self) -> Result<Board, BoardError> {
        let board = self.registry.acquire(&self.id).await?;
        *self.board.lock().unwrap_or_else(PoisonError::into_inner) = Some(board.clone());
        Ok(board)
    }

    pub fn disconnect(&self) {
        let board = self
            .board
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(board) = board {
            board.disconnect();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.board().is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.board().is_some_and(|b| b.is_ready())
    }

    /// Neutral message for a command that cannot reach a pin, if any.
    pub fn status_message(&self, pin: Option<u8>) -> Option<&'static str> {
        if !self.is_ready() {
            Some(NOT_CONNECTED)
        } else if pin.is_none() {
            Some(PIN_NOT_ASSIGNED)
        } else {
            None
        }
    }

    fn target(&self, pin: Option<u8>) -> Option<(Board, u8)> {
        let pin = pin?;
        self.board().map(|board| (board, pin))
    }

    pub async fn digital_read(&self, pin: Option<u8>) -> bool {
        let Some((board, pin)) = self.target(pin) else {
            return false;
        };
        board.read_digital(pin).await.unwrap_or_else(|err| {
            log::debug!("{}: digital read of pin {pin}: {err}", self.id);
            false
        })
    }

    pub async fn analog_read(&self, channel: Option<u8>) -> u16 {
        let Some((board, channel)) = self.target(channel) else {
            return 0;
        };
        board.read_analog(channel).await.unwrap_or_else(|err| {
            log::debug!("{}: analog read of A{channel}: {err}", self.id);
            0
        })
    }

    pub async fn set_input_bias(&self, pin: Option<u8>, pull_up: bool) {
        if let Some((board, pin)) = self.target(pin) {
            self.dropped(board.set_input_bias(pin, pull_up).await);
        }
    }

    pub async fn digital_write(&self, pin: Option<u8>, value: bool) {
        if let Some((board, pin)) = self.target(pin) {
            self.dropped(board.write_digital(pin, value, false).await);
        }
    }

    pub async fn pwm_write(&self, pin: Option<u8>, value: u16) {
        if let Some((board, pin)) = self.target(pin) {
            self.dropped(board.write_pwm(pin, value).await);
        }
    }

    pub async fn servo_write(&self, pin: Option<u8>, value: u16) {
        if let Some((board, pin)) = self.target(pin) {
            self.dropped(board.write_servo(pin, value).await);
        }
    }

    fn dropped(&self, result: Result<(), BoardError>) {
        if let Err(err) = result {
            log::debug!("{}: command dropped: {err}", self.id);
        }
    }

    fn pins(&self, mode: PinMode) -> Vec<u8> {
        self.board()
            .map(|b| b.pins_supporting(mode))
            .unwrap_or_default()
    }

    pub fn input_pins(&self) -> Vec<u8> {
        self.pins(PinMode::Input)
    }

    pub fn pwm_pins(&self) -> Vec<u8> {
        self.pins(PinMode::Pwm)
    }

    pub fn servo_pins(&self) -> Vec<u8> {
        self.pins(PinMode::Servo)
    }
}
