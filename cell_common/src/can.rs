//! CAN frame representation shared by the bus driver and the I/O expander.

use core::fmt;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::CAN_MAX_PAYLOAD;

/// Largest 11-bit identifier.
pub const STANDARD_ID_MAX: u32 = 0x7FF;

/// Largest 29-bit identifier.
pub const EXTENDED_ID_MAX: u32 = 0x1FFF_FFFF;

/// Frame construction failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("identifier {id:#x} out of range (extended: {extended})")]
    IdOutOfRange { id: u32, extended: bool },

    #[error("payload of {0} bytes exceeds {max}", max = CAN_MAX_PAYLOAD)]
    PayloadTooLong(usize),
}

/// A single CAN data frame.
///
/// `slot` records the chip buffer the frame was received in (or should be
/// loaded into); it carries no meaning on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanFrame {
    pub id: u32,
    pub extended: bool,
    pub slot: u8,
    pub data: Vec<u8, CAN_MAX_PAYLOAD>,
}

impl CanFrame {
    /// Standard (11-bit) frame.
    pub fn new(id: u32, payload: &[u8]) -> Result<Self, FrameError> {
        Self::build(id, false, payload)
    }

    /// Extended (29-bit) frame.
    pub fn new_extended(id: u32, payload: &[u8]) -> Result<Self, FrameError> {
        Self::build(id, true, payload)
    }

    fn build(id: u32, extended: bool, payload: &[u8]) -> Result<Self, FrameError> {
        let max = if extended { EXTENDED_ID_MAX } else { STANDARD_ID_MAX };
        if id > max {
            return Err(FrameError::IdOutOfRange { id, extended });
        }
        let data =
            Vec::from_slice(payload).map_err(|_| FrameError::PayloadTooLong(payload.len()))?;
        Ok(Self {
            id,
            extended,
            slot: 0,
            data,
        })
    }

    /// Data length code.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    pub fn with_slot(mut self, slot: u8) -> Self {
        self.slot = slot;
        self
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "{:08X}", self.id)?;
        } else {
            write!(f, "{:03X}", self.id)?;
        }
        write!(f, " [{}]", self.len())?;
        for b in &self.data {
            write!(f, " {b:02X}")?;
        }
        Ok(())
    }
}
