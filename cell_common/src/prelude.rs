//! Prelude module for common re-exports.
//!
//! Consumers can do `use cell_common::prelude::*;` and get the most
//! important types without listing individual paths.

// ─── Logging ────────────────────────────────────────────────────────
pub use crate::config::LogLevel;

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    BackendKind, BusConfig, CellConfig, ConfigError, ConfigLoader, IoConfig, MotionConfig,
    RobotConfig, SequenceConfig, SharedConfig, load_config_dir,
};

// ─── System Constants ───────────────────────────────────────────────
pub use crate::consts::{MAX_AXES, MAX_IO_BOARDS};

// ─── Axes ───────────────────────────────────────────────────────────
pub use crate::axis::{
    AlarmFlags, AxisConfig, AxisId, AxisState, AxisStatus, HomingDirection, HomingSensor,
    JogDirection, MotorKind, SensorLogic,
};

// ─── I/O and bus ────────────────────────────────────────────────────
pub use crate::can::{CanFrame, FrameError};
pub use crate::io::{ActiveLevel, IoDirection, IoName, IoPort, IoTarget};
