//! # Cell HAL Library
//!
//! Hardware access for the assembly cell: the MCP2515 CAN controller on SPI,
//! the I/O expander boards behind it and the multi-axis motion board.
//! Every device has a software stand-in so the whole cell runs without
//! hardware.
//!
//! # Module Structure
//!
//! - [`bus`] - MCP2515 bus controller, receive ring, SPI and loopback chips
//! - [`io`] - I/O expander process image over CAN
//! - [`motion`] - Motion controller with native and simulated backends
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                          cell_hal                             │
//! │  ┌──────────────┐   frames   ┌──────────────┐                 │
//! │  │ BusController│◄──────────►│  IoExpander  │                 │
//! │  │  (drain task)│            │ (image, poll)│                 │
//! │  └──────┬───────┘            └──────────────┘                 │
//! │         ▼ CanTransceiver                                      │
//! │  Mcp2515 over spidev  |  LoopbackChip                         │
//! │                                                               │
//! │  ┌──────────────────┐  MotionBackend  ┌───────────────────┐   │
//! │  │ MotionController │────────────────►│ Native | Simulated│   │
//! │  │  (control loop)  │                 └───────────────────┘   │
//! │  └──────────────────┘                                         │
//! └───────────────────────────────────────────────────────────────┘
//! ```

pub mod bus;
pub mod io;
pub mod motion;

pub use crate::bus::{BusController, BusError, BusStats, CanTransceiver};
pub use crate::io::{IoError, IoExpander, IoSnapshot};
pub use crate::motion::{CancelToken, MotionController, MotionError, MotionEvent};
