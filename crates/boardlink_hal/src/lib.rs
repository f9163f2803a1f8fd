//! Boundary of the board link: what the core expects from the serial
//! transport and the firmware protocol client, plus a simulated board.

pub mod config;
pub mod sim;
pub mod traits;
pub mod types;
