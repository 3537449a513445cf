//! Error types of the control layer.
//!
//! Hardware errors from `cell_hal` convert upward into [`RobotError`];
//! sequence failures wrap the originating [`RobotError`] together with the
//! step that failed.

use cell_common::axis::AxisId;
use cell_hal::{BusError, IoError, MotionError};
use thiserror::Error;

use crate::robot::RobotMode;

// ─── Points ─────────────────────────────────────────────────────────

/// Teaching-point store errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PointError {
    #[error("Point store I/O error: {0}")]
    Io(String),

    #[error("Point store parse error: {0}")]
    Parse(String),

    #[error("Point already exists: {0}")]
    Duplicate(String),

    #[error("Point not found: {0}")]
    NotFound(String),

    #[error("Point is protected: {0}")]
    Protected(String),

    #[error("Invalid point name: {0:?}")]
    InvalidName(String),

    #[error("Point {name}: {axis} coordinate {value} is not a finite number")]
    InvalidCoordinate { name: String, axis: AxisId, value: f64 },

    #[error("Legacy point file line {line}: {reason}")]
    Legacy { line: usize, reason: String },
}

impl From<std::io::Error> for PointError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for PointError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

// ─── Robot ──────────────────────────────────────────────────────────

/// Errors surfaced by [`crate::robot::RobotManager`].
#[derive(Debug, Clone, Error)]
pub enum RobotError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    #[error("Motion error: {0}")]
    Motion(#[from] MotionError),

    #[error("Point error: {0}")]
    Point(#[from] PointError),

    #[error("Robot not initialized")]
    NotInitialized,

    #[error("Emergency stop active")]
    EmergencyActive,

    #[error("Cannot enter {0:?} mode: not every axis is homed")]
    NotHomed(RobotMode),
}

// ─── Sequence ───────────────────────────────────────────────────────

/// Errors surfaced by [`crate::sequence::SequenceManager`].
#[derive(Debug, Clone, Error)]
pub enum SequenceError {
    #[error("A sequence is already running")]
    AlreadyRunning,

    #[error("Step {step} ({name}) failed: {source}")]
    StepFailed {
        step: usize,
        name: String,
        #[source]
        source: RobotError,
    },

    #[error("Sequence stopped at step {step}")]
    Stopped { step: usize },

    #[error("Unknown sequence: {0}")]
    UnknownSequence(String),

    #[error("Invalid sequence definition: {0}")]
    Definition(String),

    #[error(transparent)]
    Robot(#[from] RobotError),
}
