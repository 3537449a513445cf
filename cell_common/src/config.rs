//! Cell configuration.
//!
//! [`load_config_dir`] reads `cell.toml` and the optional `axes.toml` from
//! one directory into a validated [`CellConfig`]:
//!
//! ```rust,no_run
//! use cell_common::config::{ConfigError, load_config_dir};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = load_config_dir(Path::new("config"))?;
//!     println!("{}: {} axes", config.shared.service_name, config.axes.len());
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

use crate::axis::{AxisConfig, AxisId, MotorKind};
use crate::consts::{AXES_CONFIG_FILE, CELL_CONFIG_FILE, MAX_IO_BOARDS};

/// Configuration loading failures.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Configuration file not found")]
    FileNotFound,

    /// Unreadable file or malformed TOML.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Default log verbosity of the cell binary (`RUST_LOG` still wins).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

fn default_service_name() -> String {
    "cell".to_string()
}

/// `[shared]` section: cell identity and logging.
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "cell-01"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedConfig {
    #[serde(default)]
    pub log_level: LogLevel,

    /// Cell instance name, logged at startup.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            service_name: default_service_name(),
        }
    }
}

impl SharedConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "shared.service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Read one TOML file into any deserializable type.
///
/// A missing file is `FileNotFound` so callers can tell an optional file
/// apart from a broken one; everything else is `ParseError`.
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::FileNotFound,
            _ => ConfigError::ParseError(format!("{}: {e}", path.display())),
        })?;
        toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

// ─── Bus ────────────────────────────────────────────────────────────

fn default_spi_device() -> PathBuf {
    PathBuf::from("/dev/spidev0.0")
}
fn default_spi_speed_hz() -> u32 {
    10_000_000
}
fn default_bus_poll_interval_ms() -> u64 {
    2
}
fn default_init_poll_limit() -> u32 {
    100
}
fn default_init_poll_interval_ms() -> u64 {
    1
}
fn default_reset_settle_ms() -> u64 {
    30
}
fn default_busy_retries() -> u32 {
    3
}
fn default_busy_retry_delay_ms() -> u64 {
    1
}

/// CAN controller settings.
///
/// # TOML Example
///
/// ```toml
/// [bus]
/// spi_device = "/dev/spidev0.0"
/// spi_speed_hz = 10000000
/// poll_interval_ms = 2
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Use the in-memory loopback transceiver instead of the chip.
    #[serde(default)]
    pub simulate: bool,

    #[serde(default = "default_spi_device")]
    pub spi_device: PathBuf,

    #[serde(default = "default_spi_speed_hz")]
    pub spi_speed_hz: u32,

    /// Receive drain period.
    #[serde(default = "default_bus_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Mode confirmation polls after reset / mode request.
    #[serde(default = "default_init_poll_limit")]
    pub init_poll_limit: u32,

    #[serde(default = "default_init_poll_interval_ms")]
    pub init_poll_interval_ms: u64,

    #[serde(default = "default_reset_settle_ms")]
    pub reset_settle_ms: u64,

    /// Local retries when every transmit buffer is pending.
    #[serde(default = "default_busy_retries")]
    pub busy_retries: u32,

    #[serde(default = "default_busy_retry_delay_ms")]
    pub busy_retry_delay_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            simulate: false,
            spi_device: default_spi_device(),
            spi_speed_hz: default_spi_speed_hz(),
            poll_interval_ms: default_bus_poll_interval_ms(),
            init_poll_limit: default_init_poll_limit(),
            init_poll_interval_ms: default_init_poll_interval_ms(),
            reset_settle_ms: default_reset_settle_ms(),
            busy_retries: default_busy_retries(),
            busy_retry_delay_ms: default_busy_retry_delay_ms(),
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.spi_speed_hz == 0 {
            return Err(ConfigError::ValidationError(
                "bus.spi_speed_hz must be positive".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "bus.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.init_poll_limit == 0 {
            return Err(ConfigError::ValidationError(
                "bus.init_poll_limit must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ─── I/O ────────────────────────────────────────────────────────────

fn default_io_boards() -> Vec<u8> {
    vec![0]
}
fn default_io_poll_interval_ms() -> u64 {
    20
}

/// I/O expander settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoConfig {
    /// Boards present on the bus.
    #[serde(default = "default_io_boards")]
    pub boards: Vec<u8>,

    #[serde(default = "default_io_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            boards: default_io_boards(),
            poll_interval_ms: default_io_poll_interval_ms(),
        }
    }
}

impl IoConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for &board in &self.boards {
            if board as usize >= MAX_IO_BOARDS {
                return Err(ConfigError::ValidationError(format!(
                    "io.boards: board id {board} must be below {MAX_IO_BOARDS}"
                )));
            }
            if !seen.insert(board) {
                return Err(ConfigError::ValidationError(format!(
                    "io.boards: board id {board} listed twice"
                )));
            }
        }
        Ok(())
    }
}

// ─── Motion ─────────────────────────────────────────────────────────

/// Motion backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Vendor motion library loaded at runtime.
    #[default]
    Native,
    /// Software axis model.
    Simulation,
}

fn default_library_path() -> PathBuf {
    PathBuf::from("libcsms_splebo_n.so")
}
fn default_status_interval_ms() -> u64 {
    10
}
fn default_homing_timeout_ms() -> u64 {
    60_000
}
fn default_motion_timeout_ms() -> u64 {
    30_000
}
fn default_stop_confirm_timeout_ms() -> u64 {
    500
}
fn default_homing_busy_wait_ms() -> u64 {
    2_000
}

/// Motion controller settings.
///
/// # TOML Example
///
/// ```toml
/// [motion]
/// backend = "simulation"
/// status_interval_ms = 10
/// homing_timeout_ms = 60000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionConfig {
    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default = "default_library_path")]
    pub library_path: PathBuf,

    /// Control loop period.
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,

    #[serde(default = "default_homing_timeout_ms")]
    pub homing_timeout_ms: u64,

    /// Default window for `wait_motion_complete` callers without their own.
    #[serde(default = "default_motion_timeout_ms")]
    pub motion_timeout_ms: u64,

    #[serde(default = "default_stop_confirm_timeout_ms")]
    pub stop_confirm_timeout_ms: u64,

    /// Window for an actuator to report busy after its homing pulse.
    #[serde(default = "default_homing_busy_wait_ms")]
    pub homing_busy_wait_ms: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Native,
            library_path: default_library_path(),
            status_interval_ms: default_status_interval_ms(),
            homing_timeout_ms: default_homing_timeout_ms(),
            motion_timeout_ms: default_motion_timeout_ms(),
            stop_confirm_timeout_ms: default_stop_confirm_timeout_ms(),
            homing_busy_wait_ms: default_homing_busy_wait_ms(),
        }
    }
}

impl MotionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let windows = [
            ("status_interval_ms", self.status_interval_ms),
            ("homing_timeout_ms", self.homing_timeout_ms),
            ("motion_timeout_ms", self.motion_timeout_ms),
            ("stop_confirm_timeout_ms", self.stop_confirm_timeout_ms),
        ];
        for (field, value) in windows {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "motion.{field} must be positive"
                )));
            }
        }
        Ok(())
    }
}

// ─── Robot ──────────────────────────────────────────────────────────

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/robot")
}
fn default_points_file() -> String {
    "positions.json".to_string()
}
fn default_sequences_file() -> String {
    "sequences.toml".to_string()
}
fn default_estop_poll_interval_ms() -> u64 {
    20
}
fn default_event_capacity() -> usize {
    256
}

/// Robot manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotConfig {
    /// Directory holding the teaching-point store and sequence definitions.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_points_file")]
    pub points_file: String,

    #[serde(default = "default_sequences_file")]
    pub sequences_file: String,

    #[serde(default = "default_estop_poll_interval_ms")]
    pub estop_poll_interval_ms: u64,

    /// Run the emergency-stop monitor.
    #[serde(default = "default_true")]
    pub enable_safety_checks: bool,

    /// Capacity of the broadcast event stream.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_true() -> bool {
    true
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            points_file: default_points_file(),
            sequences_file: default_sequences_file(),
            estop_poll_interval_ms: default_estop_poll_interval_ms(),
            enable_safety_checks: true,
            event_capacity: default_event_capacity(),
        }
    }
}

impl RobotConfig {
    pub fn points_path(&self) -> PathBuf {
        self.data_dir.join(&self.points_file)
    }

    pub fn sequences_path(&self) -> PathBuf {
        self.data_dir.join(&self.sequences_file)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.estop_poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "robot.estop_poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "robot.event_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ─── Sequence ───────────────────────────────────────────────────────

fn default_step_delay_ms() -> u64 {
    100
}
fn default_move_timeout_ms() -> u64 {
    60_000
}
fn default_speed_percent() -> f64 {
    50.0
}

/// Sequence engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceConfig {
    /// Pause between consecutive steps.
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,

    /// Window for each motion wait inside a step.
    #[serde(default = "default_move_timeout_ms")]
    pub move_timeout_ms: u64,

    /// Speed for steps without their own override (% of `max_speed`).
    #[serde(default = "default_speed_percent")]
    pub default_speed: f64,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            step_delay_ms: default_step_delay_ms(),
            move_timeout_ms: default_move_timeout_ms(),
            default_speed: default_speed_percent(),
        }
    }
}

impl SequenceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.move_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "sequence.move_timeout_ms must be positive".to_string(),
            ));
        }
        if !(self.default_speed > 0.0 && self.default_speed <= 100.0) {
            return Err(ConfigError::ValidationError(format!(
                "sequence.default_speed {} outside (0, 100]",
                self.default_speed
            )));
        }
        Ok(())
    }
}

// ─── CellConfig ─────────────────────────────────────────────────────

/// Full configuration tree of the cell.
///
/// Read by [`load_config_dir`] from `cell.toml` plus the optional
/// `axes.toml`. Every section falls back to its defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellConfig {
    #[serde(default)]
    pub shared: SharedConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub io: IoConfig,

    #[serde(default)]
    pub motion: MotionConfig,

    #[serde(default)]
    pub robot: RobotConfig,

    #[serde(default)]
    pub sequence: SequenceConfig,

    /// Axis records; may also come from `axes.toml`.
    #[serde(default, rename = "axis")]
    pub axes: Vec<AxisConfig>,
}

/// Layout of `axes.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
struct AxesFile {
    #[serde(default)]
    axis: Vec<AxisConfig>,
}

impl CellConfig {
    /// Fallback axis set: X, Y and Z stepping axes.
    pub fn default_axes() -> Vec<AxisConfig> {
        [AxisId::X, AxisId::Y, AxisId::Z]
            .into_iter()
            .map(|axis| AxisConfig::new(axis, MotorKind::Stepping))
            .collect()
    }

    /// Switch bus and motion to their in-memory backends.
    pub fn force_simulation(&mut self) {
        self.bus.simulate = true;
        self.motion.backend = BackendKind::Simulation;
    }

    /// Fitted axis records.
    pub fn fitted_axes(&self) -> impl Iterator<Item = &AxisConfig> {
        self.axes.iter().filter(|a| a.motor_kind.is_fitted())
    }

    pub fn axis(&self, axis: AxisId) -> Option<&AxisConfig> {
        self.axes.iter().find(|a| a.axis == axis)
    }

    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` on the first failing check,
    /// including duplicate axis ids.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        self.bus.validate()?;
        self.io.validate()?;
        self.motion.validate()?;
        self.robot.validate()?;
        self.sequence.validate()?;

        let mut seen = HashSet::new();
        for axis in &self.axes {
            if !seen.insert(axis.axis) {
                return Err(ConfigError::ValidationError(format!(
                    "axis {} defined more than once",
                    axis.axis
                )));
            }
            axis.validate()?;
        }
        Ok(())
    }
}

/// Load and validate the configuration directory.
///
/// `dir/cell.toml` is required. `dir/axes.toml`, when present, replaces any
/// axis records from `cell.toml`. With no axis records at all the default
/// X/Y/Z set is used.
///
/// # Errors
///
/// `FileNotFound` if `cell.toml` is missing, `ParseError` on malformed
/// TOML, `ValidationError` from [`CellConfig::validate`].
pub fn load_config_dir(dir: &Path) -> Result<CellConfig, ConfigError> {
    let mut config = CellConfig::load(&dir.join(CELL_CONFIG_FILE))?;

    match AxesFile::load(&dir.join(AXES_CONFIG_FILE)) {
        Ok(file) => config.axes = file.axis,
        Err(ConfigError::FileNotFound) => {}
        Err(e) => return Err(e),
    }

    if config.axes.is_empty() {
        warn!(
            dir = %dir.display(),
            "No axis configuration found, using default X/Y/Z stepping axes"
        );
        config.axes = CellConfig::default_axes();
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[derive(Debug, Deserialize)]
    struct SharedOnly {
        #[serde(default)]
        shared: SharedConfig,
    }

    #[test]
    fn test_log_level_directives() {
        let levels: Vec<&str> = [
            LogLevel::Trace,
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
        ]
        .iter()
        .map(LogLevel::as_str)
        .collect();
        assert_eq!(levels, ["trace", "debug", "info", "warn", "error"]);
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn test_shared_section_from_toml() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[shared]\nlog_level = \"warn\"\nservice_name = \"cell-02\"\n").unwrap();
        file.flush().unwrap();

        let config = SharedOnly::load(file.path()).unwrap();
        assert_eq!(config.shared.log_level, LogLevel::Warn);
        assert_eq!(config.shared.service_name, "cell-02");
    }

    #[test]
    fn test_shared_section_defaults() {
        let config: SharedOnly = toml::from_str("").unwrap();
        assert_eq!(config.shared, SharedConfig::default());
        assert_eq!(config.shared.service_name, "cell");
    }

    #[test]
    fn test_blank_service_name_rejected() {
        let config = CellConfig {
            shared: SharedConfig {
                service_name: "  ".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(msg)) if msg.contains("service_name")
        ));
    }

    #[test]
    fn test_unknown_log_level_is_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[shared]\nlog_level = \"loud\"\n").unwrap();
        file.flush().unwrap();
        assert!(matches!(
            SharedOnly::load(file.path()),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            SharedOnly::load(&dir.path().join("cell.toml")),
            Err(ConfigError::FileNotFound)
        ));
    }

    #[test]
    fn test_cell_config_defaults() {
        let config = CellConfig::default();
        assert_eq!(config.bus.spi_device, PathBuf::from("/dev/spidev0.0"));
        assert_eq!(config.bus.busy_retries, 3);
        assert_eq!(config.io.boards, vec![0]);
        assert_eq!(config.motion.backend, BackendKind::Native);
        assert_eq!(config.motion.status_interval_ms, 10);
        assert_eq!(config.motion.homing_timeout_ms, 60_000);
        assert_eq!(config.robot.points_path(), PathBuf::from("data/robot/positions.json"));
        assert_eq!(config.sequence.step_delay_ms, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_force_simulation() {
        let mut config = CellConfig::default();
        config.force_simulation();
        assert!(config.bus.simulate);
        assert_eq!(config.motion.backend, BackendKind::Simulation);
    }

    #[test]
    fn test_io_board_out_of_range() {
        let io = IoConfig {
            boards: vec![0, 16],
            ..Default::default()
        };
        assert!(matches!(io.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_duplicate_axis_rejected() {
        let config = CellConfig {
            axes: vec![
                AxisConfig::new(AxisId::X, MotorKind::Stepping),
                AxisConfig::new(AxisId::X, MotorKind::Stepping),
            ],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(msg)) if msg.contains("more than once")
        ));
    }
}
