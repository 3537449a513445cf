//! Axis data model.
//!
//! Defines the fixed axis slots, the per-axis configuration record loaded
//! from `axes.toml`, and the runtime status snapshot published by the
//! motion controller.
//!
//! `AxisConfig` is immutable after load except through an explicit
//! reconfiguration. `AxisStatus` is only ever handed out by value.

use bitflags::bitflags;
use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::consts::MAX_AXES;

// ─── AxisId ─────────────────────────────────────────────────────────

/// Axis slot identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum AxisId {
    X = 0,
    Y = 1,
    Z = 2,
    U = 3,
    S1 = 4,
    S2 = 5,
    A = 6,
    B = 7,
}

impl AxisId {
    /// All axis slots in index order.
    pub const ALL: [AxisId; MAX_AXES] = [
        Self::X,
        Self::Y,
        Self::Z,
        Self::U,
        Self::S1,
        Self::S2,
        Self::A,
        Self::B,
    ];

    /// Slot index (also the native backend's axis number).
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub const fn from_index(index: usize) -> Option<Self> {
        if index < MAX_AXES {
            Some(Self::ALL[index])
        } else {
            None
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::X => "x",
            Self::Y => "y",
            Self::Z => "z",
            Self::U => "u",
            Self::S1 => "s1",
            Self::S2 => "s2",
            Self::A => "a",
            Self::B => "b",
        }
    }
}

impl fmt::Display for AxisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_ascii_uppercase())
    }
}

impl FromStr for AxisId {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|axis| axis.as_str() == lower)
            .ok_or_else(|| format!("unknown axis: {s:?}"))
    }
}

// ─── MotorKind ──────────────────────────────────────────────────────

/// Motor backend kind. Selects the homing sub-procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum MotorKind {
    /// Slot not fitted.
    #[default]
    None = 0,
    /// Electric actuator with its own homing controller.
    VendorActuator = 1,
    /// Open-loop stepping motor driven by the pulse generator.
    Stepping = 2,
    /// Closed-loop stepping motor.
    ClosedLoopStepping = 3,
}

impl MotorKind {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::VendorActuator),
            2 => Some(Self::Stepping),
            3 => Some(Self::ClosedLoopStepping),
            _ => None,
        }
    }

    #[inline]
    pub const fn is_fitted(&self) -> bool {
        !matches!(self, Self::None)
    }
}

// ─── Directions & sensors ───────────────────────────────────────────

/// Homing search direction.
///
/// `Cw` travels towards the positive end, `Ccw` towards the negative end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HomingDirection {
    Cw,
    #[default]
    Ccw,
}

impl HomingDirection {
    #[inline]
    pub const fn sign(&self) -> f64 {
        match self {
            Self::Cw => 1.0,
            Self::Ccw => -1.0,
        }
    }
}

/// How the homing reference is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum HomingSensor {
    /// No sensor: the current position becomes the reference.
    Off = 0,
    /// Sensor wired but searched by the drive itself.
    On = 1,
    /// Automatic origin search by the pulse generator.
    #[default]
    Auto = 2,
}

/// Home sensor contact logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SensorLogic {
    /// Normally open: signal present at the reference.
    #[default]
    #[serde(rename = "NO")]
    NormallyOpen,
    /// Normally closed: signal drops at the reference.
    #[serde(rename = "NC")]
    NormallyClosed,
}

impl SensorLogic {
    /// Translate a raw sensor level into "reference reached".
    #[inline]
    pub const fn is_triggered(&self, raw: bool) -> bool {
        match self {
            Self::NormallyOpen => raw,
            Self::NormallyClosed => !raw,
        }
    }
}

/// Jog travel direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JogDirection {
    Positive,
    Negative,
}

impl JogDirection {
    #[inline]
    pub const fn sign(&self) -> f64 {
        match self {
            Self::Positive => 1.0,
            Self::Negative => -1.0,
        }
    }
}

impl FromStr for JogDirection {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "+" | "positive" | "pos" => Ok(Self::Positive),
            "-" | "negative" | "neg" => Ok(Self::Negative),
            _ => Err(format!("unknown jog direction: {s:?}")),
        }
    }
}

// ─── AxisConfig ─────────────────────────────────────────────────────

fn default_max_speed() -> f64 {
    200.0
}
fn default_start_speed() -> f64 {
    2.0
}
fn default_accel() -> f64 {
    2940.0
}
fn default_pulse_length() -> f64 {
    0.01
}
fn default_limit_minus() -> f64 {
    -0.5
}
fn default_limit_plus() -> f64 {
    800.5
}
fn default_true() -> bool {
    true
}
fn default_homing_order() -> u8 {
    1
}
fn default_origin_speed() -> f64 {
    10.0
}
fn default_offset_speed() -> f64 {
    10.0
}

/// Per-axis configuration (units: mm, mm/s, mm/s²).
///
/// # TOML Example
///
/// ```toml
/// [[axis]]
/// axis = "z"
/// motor_kind = "stepping"
/// max_speed = 150.0
/// limit_minus = -0.5
/// limit_plus = 120.0
/// homing_order = 0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisConfig {
    pub axis: AxisId,

    #[serde(default)]
    pub motor_kind: MotorKind,

    #[serde(default = "default_max_speed")]
    pub max_speed: f64,

    /// Start (initial) velocity of the pulse generator.
    #[serde(default = "default_start_speed")]
    pub start_speed: f64,

    #[serde(default = "default_accel")]
    pub max_accel: f64,

    #[serde(default = "default_accel")]
    pub max_decel: f64,

    /// Position units per native pulse.
    #[serde(default = "default_pulse_length")]
    pub pulse_length: f64,

    #[serde(default = "default_limit_minus")]
    pub limit_minus: f64,

    #[serde(default = "default_limit_plus")]
    pub limit_plus: f64,

    /// Wait for the drive's in-position signal before reporting completion.
    #[serde(default = "default_true")]
    pub in_position: bool,

    /// Homing group. Lower orders home first; equal orders home together.
    #[serde(default = "default_homing_order")]
    pub homing_order: u8,

    #[serde(default)]
    pub homing_direction: HomingDirection,

    #[serde(default)]
    pub homing_sensor: HomingSensor,

    #[serde(default)]
    pub sensor_logic: SensorLogic,

    #[serde(default = "default_origin_speed")]
    pub origin_speed: f64,

    /// Coordinate assigned to the reference once homing completes.
    #[serde(default)]
    pub origin_offset: f64,

    #[serde(default = "default_offset_speed")]
    pub offset_speed: f64,
}

impl AxisConfig {
    /// Default record for a fitted axis of the given kind.
    pub fn new(axis: AxisId, motor_kind: MotorKind) -> Self {
        Self {
            axis,
            motor_kind,
            max_speed: default_max_speed(),
            start_speed: default_start_speed(),
            max_accel: default_accel(),
            max_decel: default_accel(),
            pulse_length: default_pulse_length(),
            limit_minus: default_limit_minus(),
            limit_plus: default_limit_plus(),
            in_position: true,
            homing_order: default_homing_order(),
            homing_direction: HomingDirection::default(),
            homing_sensor: HomingSensor::default(),
            sensor_logic: SensorLogic::default(),
            origin_speed: default_origin_speed(),
            origin_offset: 0.0,
            offset_speed: default_offset_speed(),
        }
    }

    /// Validate the record.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for non-positive speeds,
    /// accelerations or pulse length, an empty soft-limit window, or an
    /// origin offset outside the soft limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_speed", self.max_speed),
            ("max_accel", self.max_accel),
            ("max_decel", self.max_decel),
            ("pulse_length", self.pulse_length),
            ("origin_speed", self.origin_speed),
            ("offset_speed", self.offset_speed),
        ];
        for (field, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "axis {}: {field} must be positive, got {value}",
                    self.axis
                )));
            }
        }
        if self.start_speed < 0.0 || self.start_speed > self.max_speed {
            return Err(ConfigError::ValidationError(format!(
                "axis {}: start_speed {} outside [0, max_speed]",
                self.axis, self.start_speed
            )));
        }
        if self.limit_minus >= self.limit_plus {
            return Err(ConfigError::ValidationError(format!(
                "axis {}: limit_minus ({}) must be below limit_plus ({})",
                self.axis, self.limit_minus, self.limit_plus
            )));
        }
        if !self.within_limits(self.origin_offset) {
            return Err(ConfigError::ValidationError(format!(
                "axis {}: origin_offset {} outside soft limits",
                self.axis, self.origin_offset
            )));
        }
        Ok(())
    }

    /// True if `position` lies inside `[limit_minus, limit_plus]`.
    #[inline]
    pub fn within_limits(&self, position: f64) -> bool {
        position >= self.limit_minus && position <= self.limit_plus
    }

    /// Commanded speed for a percentage of `max_speed`.
    #[inline]
    pub fn speed_for_percent(&self, percent: f64) -> f64 {
        self.max_speed * percent / 100.0
    }

    #[inline]
    pub fn mm_to_pulse(&self, mm: f64) -> i32 {
        (mm / self.pulse_length).round() as i32
    }

    #[inline]
    pub fn pulse_to_mm(&self, pulse: i32) -> f64 {
        f64::from(pulse) * self.pulse_length
    }
}

// ─── Runtime state ──────────────────────────────────────────────────

/// Per-axis state machine.
///
/// `Idle → Homing → Idle`, `Idle → Moving → Idle`, `Idle → Jogging → Idle`.
/// `Error` is reachable from anywhere and only left by an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisState {
    #[default]
    Idle,
    Homing,
    Moving,
    Jogging,
    Error,
}

impl AxisState {
    #[inline]
    pub const fn is_in_motion(&self) -> bool {
        matches!(self, Self::Homing | Self::Moving | Self::Jogging)
    }
}

impl fmt::Display for AxisState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Homing => "homing",
            Self::Moving => "moving",
            Self::Jogging => "jogging",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

bitflags! {
    /// Alarm conditions latched on an axis.
    ///
    /// CRITICAL flags force the axis into `AxisState::Error`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct AlarmFlags: u16 {
        /// Soft limit reached while jogging.
        const SOFT_LIMIT        = 0x0001;
        /// Homing reference not found in time. **CRITICAL**.
        const HOMING_TIMEOUT    = 0x0002;
        /// Motion did not complete in time.
        const MOTION_TIMEOUT    = 0x0004;
        /// Drive reported an alarm. **CRITICAL**.
        const DRIVE_ALARM       = 0x0008;
        /// Emergency stop asserted. **CRITICAL**.
        const EMERGENCY_STOP    = 0x0010;
        /// Native backend call failed. **CRITICAL**.
        const BACKEND_FAULT     = 0x0020;
        /// Stop command was not confirmed by the drive.
        const STOP_UNCONFIRMED  = 0x0040;
    }
}

impl AlarmFlags {
    pub const CRITICAL_MASK: Self = Self::from_bits_truncate(
        Self::HOMING_TIMEOUT.bits()
            | Self::DRIVE_ALARM.bits()
            | Self::EMERGENCY_STOP.bits()
            | Self::BACKEND_FAULT.bits(),
    );

    #[inline]
    pub const fn has_critical(&self) -> bool {
        self.intersects(Self::CRITICAL_MASK)
    }
}

impl Default for AlarmFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Runtime status snapshot of one axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisStatus {
    pub axis: AxisId,
    pub state: AxisState,
    /// Current position (mm).
    pub position: f64,
    /// Target of the move in progress, if any.
    pub target: Option<f64>,
    pub moving: bool,
    pub homed: bool,
    pub alarm: AlarmFlags,
    /// Raw alarm code reported by the drive (0 = none).
    pub alarm_code: u16,
    pub last_error: Option<String>,
}

impl AxisStatus {
    pub fn new(axis: AxisId) -> Self {
        Self {
            axis,
            state: AxisState::Idle,
            position: 0.0,
            target: None,
            moving: false,
            homed: false,
            alarm: AlarmFlags::empty(),
            alarm_code: 0,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_id_parse_and_display() {
        assert_eq!("x".parse::<AxisId>().unwrap(), AxisId::X);
        assert_eq!("S1".parse::<AxisId>().unwrap(), AxisId::S1);
        assert!("w".parse::<AxisId>().is_err());
        assert_eq!(AxisId::Z.to_string(), "Z");
        assert_eq!(AxisId::from_index(3), Some(AxisId::U));
        assert_eq!(AxisId::from_index(8), None);
    }

    #[test]
    fn axis_index_matches_slot_order() {
        for (i, axis) in AxisId::ALL.iter().enumerate() {
            assert_eq!(axis.index(), i);
        }
    }

    #[test]
    fn motor_kind_from_u8() {
        assert_eq!(MotorKind::from_u8(1), Some(MotorKind::VendorActuator));
        assert_eq!(MotorKind::from_u8(3), Some(MotorKind::ClosedLoopStepping));
        assert_eq!(MotorKind::from_u8(9), None);
        assert!(!MotorKind::None.is_fitted());
    }

    #[test]
    fn sensor_logic_inverts_nc() {
        assert!(SensorLogic::NormallyOpen.is_triggered(true));
        assert!(SensorLogic::NormallyClosed.is_triggered(false));
        assert!(!SensorLogic::NormallyClosed.is_triggered(true));
    }

    #[test]
    fn axis_config_defaults_from_toml() {
        let cfg: AxisConfig = toml::from_str("axis = \"y\"\nmotor_kind = \"stepping\"").unwrap();
        assert_eq!(cfg.axis, AxisId::Y);
        assert_eq!(cfg.motor_kind, MotorKind::Stepping);
        assert_eq!(cfg.homing_direction, HomingDirection::Ccw);
        assert_eq!(cfg.homing_sensor, HomingSensor::Auto);
        assert!((cfg.pulse_length - 0.01).abs() < f64::EPSILON);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn axis_config_rejects_inverted_limits() {
        let mut cfg = AxisConfig::new(AxisId::X, MotorKind::Stepping);
        cfg.limit_minus = 10.0;
        cfg.limit_plus = 5.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn axis_config_rejects_zero_pulse_length() {
        let mut cfg = AxisConfig::new(AxisId::X, MotorKind::Stepping);
        cfg.pulse_length = 0.0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("pulse_length"));
    }

    #[test]
    fn axis_config_rejects_offset_outside_limits() {
        let mut cfg = AxisConfig::new(AxisId::X, MotorKind::Stepping);
        cfg.origin_offset = 900.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn pulse_conversion() {
        let cfg = AxisConfig::new(AxisId::X, MotorKind::Stepping);
        assert_eq!(cfg.mm_to_pulse(1.0), 100);
        assert_eq!(cfg.mm_to_pulse(-2.5), -250);
        assert!((cfg.pulse_to_mm(150) - 1.5).abs() < 1e-9);
        assert!((cfg.speed_for_percent(50.0) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn alarm_flags_critical() {
        assert!(!AlarmFlags::SOFT_LIMIT.has_critical());
        assert!(AlarmFlags::EMERGENCY_STOP.has_critical());
        assert!((AlarmFlags::SOFT_LIMIT | AlarmFlags::DRIVE_ALARM).has_critical());
        assert_eq!(AlarmFlags::default(), AlarmFlags::empty());
    }

    #[test]
    fn axis_state_motion() {
        assert!(AxisState::Jogging.is_in_motion());
        assert!(!AxisState::Error.is_in_motion());
        assert_eq!(AxisState::Homing.to_string(), "homing");
    }
}
