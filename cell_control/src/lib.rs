//! # Cell Control Library
//!
//! Coordination layer of the assembly cell. Sits on top of `cell_hal` and
//! turns bus, I/O and motion into one robot with teaching points, an
//! emergency-stop monitor and a sequence engine.
//!
//! ## Layers
//!
//! 1. **RobotManager** - lifecycle, commands, safety monitor, status
//! 2. **SequenceManager** - ordered programs with pause/resume/stop
//! 3. **PositionStore** - named teaching points persisted as JSON
//! 4. **EventBus** - per-kind listeners and a broadcast event stream
//!
//! # Module Structure
//!
//! - [`robot`] - RobotManager, robot state, modes and status snapshot
//! - [`sequence`] - SequenceManager, step trait and named definitions
//! - [`points`] - Teaching points and legacy import
//! - [`events`] - Robot events and their delivery
//! - [`error`] - Error types

pub mod error;
pub mod events;
pub mod points;
pub mod robot;
pub mod sequence;

pub use crate::error::{PointError, RobotError, SequenceError};
pub use crate::events::{EventBus, ListenerId, RobotEvent, RobotEventKind, TimedEvent};
pub use crate::points::{Coordinate, Position, PositionStore};
pub use crate::robot::{RobotManager, RobotMode, RobotState, RobotStatus, SafetyState};
pub use crate::sequence::{
    SequenceDefinition, SequenceKind, SequenceManager, SequenceProgress, SequenceState,
    SequenceStep,
};
