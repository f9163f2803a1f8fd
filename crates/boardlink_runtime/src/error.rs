use boardlink_hal::traits::HalError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BoardError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("board did not finish its handshake within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("no sample from pin {pin} within {timeout:?}")]
    ReadTimeout { pin: u8, timeout: Duration },
    #[error("serial transport unavailable: {0}")]
    UnsupportedEnvironment(String),
    #[error("board disconnected: {0}")]
    UnexpectedDisconnect(String),
    #[error("board is not connected")]
    NotConnected,
    #[error("pin {0} does not exist on this board")]
    InvalidPin(u8),
    #[error("a connection attempt is already in progress")]
    Busy,
}

impl From<HalError> for BoardError {
    fn from(err: HalError) -> Self {
        match err {
            HalError::Unsupported(msg) => BoardError::UnsupportedEnvironment(msg),
            HalError::LinkClosed => BoardError::UnexpectedDisconnect(err.to_string()),
            other => BoardError::Connection(other.to_string()),
        }
    }
}
