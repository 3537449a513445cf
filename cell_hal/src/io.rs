//! Named bit-level I/O over the CAN expander boards.
//!
//! Each board's 64 outputs are latched locally and sent as one 8-byte frame
//! (`0xC0 + board`). Boards report their 32 inputs as a 4-byte frame
//! (`0xD0 + board`). Every transmit goes through [`BusController`], whose
//! gate serializes access to the chip.

use cell_common::can::CanFrame;
use cell_common::config::IoConfig;
use cell_common::consts::{INPUT_IMAGE_BYTES, MAX_IO_BOARDS, OUTPUT_IMAGE_BYTES};
use cell_common::io::{IoAddressError, IoDirection, IoName, IoPort, IoTarget};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

use crate::bus::{BusController, BusError};

/// Output image frame id for board 0.
pub const OUTPUT_FRAME_BASE: u32 = 0xC0;

/// Input report frame id for board 0.
pub const INPUT_FRAME_BASE: u32 = 0xD0;

#[derive(Debug, Clone, Error)]
pub enum IoError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Unknown I/O name: {0}")]
    UnknownName(String),

    #[error("Input {0} cannot be written")]
    NotWritable(IoPort),

    #[error("Address error: {0}")]
    OutOfRange(#[from] IoAddressError),

    #[error("Timed out after {timeout_ms} ms waiting for {target} = {expected}")]
    Timeout {
        target: String,
        expected: bool,
        timeout_ms: u64,
    },
}

#[derive(Debug, Clone, Copy, Default)]
struct BoardImage {
    inputs: [u8; INPUT_IMAGE_BYTES],
    outputs: [u8; OUTPUT_IMAGE_BYTES],
    reports: u64,
}

/// Per-board image as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoardSnapshot {
    pub board: u8,
    pub inputs: [u8; INPUT_IMAGE_BYTES],
    pub outputs: [u8; OUTPUT_IMAGE_BYTES],
    /// Input reports applied since start.
    pub reports: u64,
}

/// Copy of the expander state at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IoSnapshot {
    pub boards: Vec<BoardSnapshot>,
    pub emergency: bool,
    pub door_open: bool,
}

/// I/O expander facade.
pub struct IoExpander {
    bus: Arc<BusController>,
    config: IoConfig,
    images: RwLock<[BoardImage; MAX_IO_BOARDS]>,
}

impl IoExpander {
    pub fn new(bus: Arc<BusController>, config: IoConfig) -> Self {
        Self {
            bus,
            config,
            images: RwLock::new([BoardImage::default(); MAX_IO_BOARDS]),
        }
    }

    pub fn bus(&self) -> &Arc<BusController> {
        &self.bus
    }

    pub fn boards(&self) -> &[u8] {
        &self.config.boards
    }

    /// Clear every output latch and send the images.
    pub async fn initialize_outputs(&self) -> Result<(), IoError> {
        {
            let mut images = self.images.write();
            for image in images.iter_mut() {
                image.outputs = [0; OUTPUT_IMAGE_BYTES];
            }
        }
        for &board in &self.config.boards {
            self.send_outputs(board).await?;
        }
        info!(boards = ?self.config.boards, "I/O outputs initialized");
        Ok(())
    }

    /// Raw level of a point. Outputs read back their latch.
    pub fn read(&self, target: impl Into<IoTarget>) -> Result<bool, IoError> {
        let port = target.into().port();
        port.validate()?;
        let (byte, mask) = port.bit();
        let images = self.images.read();
        let image = &images[port.board as usize];
        let raw = match port.direction {
            IoDirection::Input => image.inputs[byte],
            IoDirection::Output => image.outputs[byte],
        };
        Ok(raw & mask != 0)
    }

    /// Resolve a functional name given as text.
    pub fn lookup(name: &str) -> Result<IoName, IoError> {
        name.parse::<IoName>()
            .map_err(|_| IoError::UnknownName(name.to_string()))
    }

    /// Latch an output and send its board image.
    pub async fn write(&self, target: impl Into<IoTarget>, value: bool) -> Result<(), IoError> {
        let target = target.into();
        let port = target.port();
        port.validate()?;
        if port.direction == IoDirection::Input {
            return Err(IoError::NotWritable(port));
        }

        {
            let (byte, mask) = port.bit();
            let mut images = self.images.write();
            let outputs = &mut images[port.board as usize].outputs;
            if value {
                outputs[byte] |= mask;
            } else {
                outputs[byte] &= !mask;
            }
        }
        debug!(%target, value, "output written");
        self.send_outputs(port.board).await
    }

    /// Whether a named point is in its active state.
    pub fn is_active(&self, name: IoName) -> Result<bool, IoError> {
        let binding = name.binding();
        Ok(binding.active.is_active(self.read(binding.port)?))
    }

    pub fn check_emergency(&self) -> bool {
        self.is_active(IoName::EmergencyStop).unwrap_or(false)
    }

    pub fn check_door_open(&self) -> bool {
        !self.is_active(IoName::DoorClosed).unwrap_or(true)
    }

    /// Apply every queued input report. Other frames are discarded.
    ///
    /// Returns the number of reports applied.
    pub fn refresh(&self) -> usize {
        let mut applied = 0;
        while let Some(frame) = self.bus.poll_receive() {
            if self.apply_report(&frame) {
                applied += 1;
            }
        }
        applied
    }

    fn apply_report(&self, frame: &CanFrame) -> bool {
        if frame.extended || frame.id < INPUT_FRAME_BASE {
            return false;
        }
        let board = (frame.id - INPUT_FRAME_BASE) as usize;
        if board >= MAX_IO_BOARDS {
            return false;
        }
        let Some(payload) = frame.payload().get(..INPUT_IMAGE_BYTES) else {
            warn!(%frame, "short input report ignored");
            return false;
        };
        let mut images = self.images.write();
        let image = &mut images[board];
        image.inputs.copy_from_slice(payload);
        image.reports += 1;
        trace!(board, inputs = ?image.inputs, "input report");
        true
    }

    /// Send every configured board's output image, then apply reports.
    pub async fn poll_cycle(&self) -> Result<usize, IoError> {
        for &board in &self.config.boards {
            self.send_outputs(board).await?;
        }
        Ok(self.refresh())
    }

    /// Drive an output on for `duration`, then off.
    pub async fn pulse(&self, target: impl Into<IoTarget>, duration: Duration) -> Result<(), IoError> {
        let target = target.into();
        self.write(target, true).await?;
        sleep(duration).await;
        self.write(target, false).await
    }

    /// Wait until a point reads `expected`, refreshing every poll interval.
    pub async fn wait_input(
        &self,
        target: impl Into<IoTarget>,
        expected: bool,
        limit: Duration,
    ) -> Result<(), IoError> {
        let target = target.into();
        let period = Duration::from_millis(self.config.poll_interval_ms);
        let wait = async {
            loop {
                self.refresh();
                if self.read(target)? == expected {
                    return Ok::<(), IoError>(());
                }
                sleep(period).await;
            }
        };
        match timeout(limit, wait).await {
            Ok(result) => result,
            Err(_) => Err(IoError::Timeout {
                target: target.to_string(),
                expected,
                timeout_ms: limit.as_millis() as u64,
            }),
        }
    }

    pub fn snapshot(&self) -> IoSnapshot {
        let boards = {
            let images = self.images.read();
            self.config
                .boards
                .iter()
                .map(|&board| {
                    let image = &images[board as usize];
                    BoardSnapshot {
                        board,
                        inputs: image.inputs,
                        outputs: image.outputs,
                        reports: image.reports,
                    }
                })
                .collect()
        };
        IoSnapshot {
            boards,
            emergency: self.check_emergency(),
            door_open: self.check_door_open(),
        }
    }

    async fn send_outputs(&self, board: u8) -> Result<(), IoError> {
        let outputs = self.images.read()[board as usize].outputs;
        let frame = CanFrame::new(OUTPUT_FRAME_BASE + u32::from(board), &outputs)
            .map_err(BusError::from)?;
        self.bus.transmit(&frame).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cell_common::config::BusConfig;

    async fn expander() -> IoExpander {
        let bus = Arc::new(BusController::simulated(BusConfig {
            simulate: true,
            ..Default::default()
        }));
        bus.initialize().await.unwrap();
        IoExpander::new(bus, IoConfig::default())
    }

    fn report(board: u8, inputs: [u8; 4]) -> CanFrame {
        CanFrame::new(INPUT_FRAME_BASE + u32::from(board), &inputs).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn output_latch_reads_back() {
        let io = expander().await;
        let buzzer = IoPort::output(0, 15);
        io.write(buzzer, true).await.unwrap();
        assert!(io.read(buzzer).unwrap());
        assert!(io.read(IoName::Buzzer).unwrap());

        let sent = io.bus().loopback().unwrap().last_sent(0xC0).unwrap();
        assert_eq!(sent.payload(), &[0, 0x80, 0, 0, 0, 0, 0, 0]);

        io.write(buzzer, false).await.unwrap();
        assert!(!io.read(buzzer).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn inputs_are_not_writable() {
        let io = expander().await;
        assert!(matches!(
            io.write(IoName::DoorClosed, true).await,
            Err(IoError::NotWritable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn address_validation() {
        let io = expander().await;
        assert!(matches!(
            io.read(IoPort::input(0, 32)),
            Err(IoError::OutOfRange(_))
        ));
        assert!(matches!(
            io.write(IoPort::output(16, 0), true).await,
            Err(IoError::OutOfRange(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reports_update_inputs() {
        let io = expander().await;
        let handle = io.bus().loopback().unwrap().clone();
        handle.inject(report(0, [0x00, 0x80, 0x01, 0x00]));
        io.bus().drain_pending().await.unwrap();

        assert_eq!(io.refresh(), 1);
        assert!(io.check_emergency());
        assert!(!io.check_door_open());
        assert!(io.read(IoPort::input(0, 15)).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn door_open_when_switch_low() {
        let io = expander().await;
        assert!(io.check_door_open());
        assert!(!io.check_emergency());
    }

    #[tokio::test(start_paused = true)]
    async fn echoed_output_frames_are_ignored() {
        let io = expander().await;
        io.write(IoName::Buzzer, true).await.unwrap();
        io.bus().drain_pending().await.unwrap();
        assert_eq!(io.refresh(), 0);
        assert!(!io.read(IoPort::input(0, 15)).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_input_times_out() {
        let io = expander().await;
        let err = io
            .wait_input(IoName::WorkPresent, true, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, IoError::Timeout { timeout_ms: 100, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_input_sees_report() {
        let io = expander().await;
        io.bus()
            .loopback()
            .unwrap()
            .inject(report(0, [0x00, 0x10, 0x00, 0x00]));
        io.wait_input(IoName::WorkPresent, true, Duration::from_millis(200))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pulse_leaves_output_off() {
        let io = expander().await;
        io.pulse(IoName::DsReset, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(!io.read(IoName::DsReset).unwrap());
        let frames = io.bus().loopback().unwrap().sent();
        assert!(frames.iter().any(|f| f.payload()[0] == 0x80));
    }

    #[test]
    fn lookup_by_label() {
        assert_eq!(IoExpander::lookup("buzzer").unwrap(), IoName::Buzzer);
        assert!(matches!(
            IoExpander::lookup("nope"),
            Err(IoError::UnknownName(_))
        ));
    }
}
