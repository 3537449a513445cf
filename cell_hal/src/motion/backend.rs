//! Motion backend capability interface.
//!
//! A backend executes single, short commands for one axis. Everything that
//! spans time (homing sequences, completion waits, stop confirmation) lives
//! in the controller, so backend calls never block for long.

use cell_common::axis::{AxisConfig, AxisId, HomingDirection, JogDirection};
use std::time::Duration;
use thiserror::Error;

/// Backend failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("Failed to load motion library: {0}")]
    Load(String),

    #[error("Missing symbol {symbol}: {reason}")]
    Symbol {
        symbol: &'static str,
        reason: String,
    },

    #[error("Backend not open")]
    NotOpen,

    #[error("Axis {0} not configured")]
    NotConfigured(AxisId),

    /// A native call returned failure.
    #[error("{function} failed (axis {axis})")]
    Call {
        function: &'static str,
        axis: AxisId,
    },
}

/// Drive status decoded once at the backend boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriveStatus {
    /// Pulse output active.
    pub busy: bool,
    pub in_position: bool,
    pub alarm: bool,
    pub emergency: bool,
    /// Raw origin sensor level.
    pub origin_sensor: bool,
    /// Drive-side homing still running.
    pub homing: bool,
}

/// Discrete per-axis drive outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AxisOutput {
    Servo = 0,
    Clear = 1,
    Homing = 2,
}

/// Parameters of an automatic origin search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HomingRequest {
    pub direction: HomingDirection,
    /// Search speed (mm/s).
    pub speed: f64,
}

/// Narrow motion capability set.
///
/// Positions are in mm, speeds in mm/s. Implementations convert to their
/// native units internally.
pub trait MotionBackend: Send {
    fn name(&self) -> &'static str;

    fn open(&mut self) -> Result<(), BackendError>;

    /// Program mode, speeds, accelerations and soft limits for one axis.
    fn configure_axis(&mut self, config: &AxisConfig) -> Result<(), BackendError>;

    fn move_absolute(&mut self, axis: AxisId, position: f64, speed: f64)
    -> Result<(), BackendError>;

    fn move_relative(&mut self, axis: AxisId, distance: f64, speed: f64)
    -> Result<(), BackendError>;

    fn jog(&mut self, axis: AxisId, direction: JogDirection, speed: f64)
    -> Result<(), BackendError>;

    fn stop(&mut self, axis: AxisId) -> Result<(), BackendError>;

    /// Start an automatic origin search.
    fn home(&mut self, axis: AxisId, request: &HomingRequest) -> Result<(), BackendError>;

    fn write_axis_output(
        &mut self,
        axis: AxisId,
        output: AxisOutput,
        on: bool,
    ) -> Result<(), BackendError>;

    /// Arm soft limits, or release them with `None`.
    fn set_soft_limits(
        &mut self,
        axis: AxisId,
        limits: Option<(f64, f64)>,
    ) -> Result<(), BackendError>;

    /// Redefine the current position.
    fn set_position(&mut self, axis: AxisId, position: f64) -> Result<(), BackendError>;

    fn read_position(&mut self, axis: AxisId) -> Result<f64, BackendError>;

    /// Raw alarm code, 0 when clear.
    fn read_alarm(&mut self, axis: AxisId) -> Result<u16, BackendError>;

    fn read_drive_status(&mut self, axis: AxisId) -> Result<DriveStatus, BackendError>;

    /// Advance simulated time. Hardware backends ignore it.
    fn advance(&mut self, _dt: Duration) {}

    fn close(&mut self) -> Result<(), BackendError>;
}
