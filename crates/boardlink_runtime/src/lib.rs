//! Board connection lifecycle, pin state cache and board registry.
//!
//! `Board` drives one physical board through
//! Disconnected -> Requesting -> Connected -> Ready and back, `PinTable`
//! caches pin samples between reads, and `Registry` lets several command
//! producers share a board.

pub mod board;
pub mod error;
pub mod events;
pub mod pins;
pub mod registry;

pub use board::{Board, BoardId, ConnectionState};
pub use error::BoardError;
pub use events::{BoardEvent, HostEvent, HostNotifier};
pub use pins::{Pin, PinTable, ReadKind};
pub use registry::{Registry, RegistryEvent};
