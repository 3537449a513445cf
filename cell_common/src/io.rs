//! I/O addressing for the CAN expander boards.
//!
//! Every board exposes two separate address spaces: 32 inputs and 64
//! outputs. A single point is named by [`IoPort`] (board, port, direction).
//! Functional names ([`IoName`]) resolve to ports through the static
//! [`IO_TABLE`], which also records each point's active level.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{INPUT_IMAGE_BYTES, MAX_IO_BOARDS, OUTPUT_IMAGE_BYTES};

/// Inputs per board.
pub const INPUTS_PER_BOARD: u8 = (INPUT_IMAGE_BYTES * 8) as u8;

/// Outputs per board.
pub const OUTPUTS_PER_BOARD: u8 = (OUTPUT_IMAGE_BYTES * 8) as u8;

// ─── IoDirection ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoDirection {
    Input,
    Output,
}

// ─── ActiveLevel ────────────────────────────────────────────────────

/// Electrical level at which a point is considered active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveLevel {
    #[default]
    High,
    Low,
}

impl ActiveLevel {
    #[inline]
    pub const fn is_active(&self, raw: bool) -> bool {
        match self {
            Self::High => raw,
            Self::Low => !raw,
        }
    }
}

// ─── IoPort ─────────────────────────────────────────────────────────

/// Address validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IoAddressError {
    #[error("board {0} out of range (max {max})", max = MAX_IO_BOARDS - 1)]
    BoardOutOfRange(u8),
    #[error("{direction:?} port {port} out of range on board {board}")]
    PortOutOfRange {
        board: u8,
        port: u8,
        direction: IoDirection,
    },
    #[error("malformed I/O address: {0:?}")]
    Malformed(String),
}

/// One bit on one expander board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IoPort {
    pub board: u8,
    pub port: u8,
    pub direction: IoDirection,
}

impl IoPort {
    #[inline]
    pub const fn input(board: u8, port: u8) -> Self {
        Self {
            board,
            port,
            direction: IoDirection::Input,
        }
    }

    #[inline]
    pub const fn output(board: u8, port: u8) -> Self {
        Self {
            board,
            port,
            direction: IoDirection::Output,
        }
    }

    /// Check board and port against the image sizes.
    pub fn validate(&self) -> Result<(), IoAddressError> {
        if self.board as usize >= MAX_IO_BOARDS {
            return Err(IoAddressError::BoardOutOfRange(self.board));
        }
        let limit = match self.direction {
            IoDirection::Input => INPUTS_PER_BOARD,
            IoDirection::Output => OUTPUTS_PER_BOARD,
        };
        if self.port >= limit {
            return Err(IoAddressError::PortOutOfRange {
                board: self.board,
                port: self.port,
                direction: self.direction,
            });
        }
        Ok(())
    }

    /// Byte index and bit mask inside the board image.
    #[inline]
    pub const fn bit(&self) -> (usize, u8) {
        ((self.port / 8) as usize, 1 << (self.port % 8))
    }
}

impl fmt::Display for IoPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.direction {
            IoDirection::Input => "in",
            IoDirection::Output => "out",
        };
        write!(f, "{prefix}{}.{}", self.board, self.port)
    }
}

impl FromStr for IoPort {
    type Err = IoAddressError;

    /// Parses `in0.15` / `out0.15`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || IoAddressError::Malformed(s.to_string());
        let (direction, rest) = if let Some(rest) = s.strip_prefix("out") {
            (IoDirection::Output, rest)
        } else if let Some(rest) = s.strip_prefix("in") {
            (IoDirection::Input, rest)
        } else {
            return Err(malformed());
        };
        let (board, port) = rest.split_once('.').ok_or_else(malformed)?;
        let port = IoPort {
            board: board.parse().map_err(|_| malformed())?,
            port: port.parse().map_err(|_| malformed())?,
            direction,
        };
        port.validate()?;
        Ok(port)
    }
}

// ─── IoName ─────────────────────────────────────────────────────────

/// Functional I/O point of the cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum IoName {
    // ── Inputs ──────────────────────
    DriverUp = 0,
    DriverDown,
    ScrewGuideClose,
    ScrewGuideOpen,
    ScrewDetect,
    FeederScrew,
    DsHigh,
    DsOk,
    DsLow,
    TorqueUp,
    WorkLockRelease,
    WorkLockLock,
    WorkPresent,
    StartLeftSw,
    StartRightSw,
    EmergencyStop,
    DoorClosed,

    // ── Outputs ─────────────────────
    DriverValve,
    ScrewGuideValve,
    ScrewVacuum,
    DsTiming,
    DsReset,
    DriverMotor,
    WorkLock,
    EmergencyLamp,
    StartLeftLed,
    StartRightLed,
    Buzzer,
}

/// Static binding of a functional name to a physical point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoBinding {
    pub name: IoName,
    pub label: &'static str,
    pub port: IoPort,
    pub active: ActiveLevel,
}

const fn bind_in(name: IoName, label: &'static str, port: u8, active: ActiveLevel) -> IoBinding {
    IoBinding {
        name,
        label,
        port: IoPort::input(0, port),
        active,
    }
}

const fn bind_out(name: IoName, label: &'static str, port: u8) -> IoBinding {
    IoBinding {
        name,
        label,
        port: IoPort::output(0, port),
        active: ActiveLevel::High,
    }
}

/// Name → point table, indexed by `IoName as usize`.
pub static IO_TABLE: [IoBinding; 28] = [
    bind_in(IoName::DriverUp, "driver_up", 0, ActiveLevel::High),
    bind_in(IoName::DriverDown, "driver_down", 1, ActiveLevel::High),
    bind_in(IoName::ScrewGuideClose, "screw_guide_close", 2, ActiveLevel::High),
    bind_in(IoName::ScrewGuideOpen, "screw_guide_open", 3, ActiveLevel::High),
    bind_in(IoName::ScrewDetect, "screw_detect", 4, ActiveLevel::High),
    bind_in(IoName::FeederScrew, "feeder_screw", 5, ActiveLevel::High),
    bind_in(IoName::DsHigh, "ds_high", 6, ActiveLevel::High),
    bind_in(IoName::DsOk, "ds_ok", 7, ActiveLevel::High),
    bind_in(IoName::DsLow, "ds_low", 8, ActiveLevel::High),
    bind_in(IoName::TorqueUp, "torque_up", 9, ActiveLevel::High),
    bind_in(IoName::WorkLockRelease, "work_lock_release", 10, ActiveLevel::High),
    bind_in(IoName::WorkLockLock, "work_lock_lock", 11, ActiveLevel::High),
    bind_in(IoName::WorkPresent, "work_present", 12, ActiveLevel::High),
    bind_in(IoName::StartLeftSw, "start_left_sw", 13, ActiveLevel::High),
    bind_in(IoName::StartRightSw, "start_right_sw", 14, ActiveLevel::High),
    bind_in(IoName::EmergencyStop, "emergency_stop", 15, ActiveLevel::High),
    // Door switch reads high while the door is shut.
    bind_in(IoName::DoorClosed, "door_closed", 16, ActiveLevel::High),
    bind_out(IoName::DriverValve, "driver_valve", 0),
    bind_out(IoName::ScrewGuideValve, "screw_guide_valve", 2),
    bind_out(IoName::ScrewVacuum, "screw_vacuum", 4),
    bind_out(IoName::DsTiming, "ds_timing", 6),
    bind_out(IoName::DsReset, "ds_reset", 7),
    bind_out(IoName::DriverMotor, "driver_motor", 9),
    bind_out(IoName::WorkLock, "work_lock", 10),
    bind_out(IoName::EmergencyLamp, "emergency_lamp", 12),
    bind_out(IoName::StartLeftLed, "start_left_led", 13),
    bind_out(IoName::StartRightLed, "start_right_led", 14),
    bind_out(IoName::Buzzer, "buzzer", 15),
];

impl IoName {
    #[inline]
    pub fn binding(self) -> &'static IoBinding {
        &IO_TABLE[self as usize]
    }

    #[inline]
    pub fn port(self) -> IoPort {
        self.binding().port
    }

    #[inline]
    pub fn direction(self) -> IoDirection {
        self.binding().port.direction
    }

    /// Iterate every named point.
    pub fn all() -> impl Iterator<Item = IoName> {
        IO_TABLE.iter().map(|b| b.name)
    }

    /// Reverse lookup from a physical point.
    pub fn from_port(port: IoPort) -> Option<IoName> {
        IO_TABLE.iter().find(|b| b.port == port).map(|b| b.name)
    }
}

impl fmt::Display for IoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binding().label)
    }
}

impl FromStr for IoName {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IO_TABLE
            .iter()
            .find(|b| b.label == s)
            .map(|b| b.name)
            .ok_or_else(|| format!("unknown I/O name: {s:?}"))
    }
}

/// Addressing accepted by the expander: a raw point or a functional name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoTarget {
    Port(IoPort),
    Named(IoName),
}

impl IoTarget {
    #[inline]
    pub fn port(&self) -> IoPort {
        match self {
            Self::Port(p) => *p,
            Self::Named(n) => n.port(),
        }
    }
}

impl From<IoPort> for IoTarget {
    fn from(port: IoPort) -> Self {
        Self::Port(port)
    }
}

impl From<IoName> for IoTarget {
    fn from(name: IoName) -> Self {
        Self::Named(name)
    }
}

impl fmt::Display for IoTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Port(p) => write!(f, "{p}"),
            Self::Named(n) => write!(f, "{n} ({})", n.port()),
        }
    }
}
