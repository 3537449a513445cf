//! In-memory transceiver used when no physical bus is present.
//!
//! Behaves like the chip in loopback mode: every transmitted frame is
//! echoed into the receive queue. A [`LoopbackHandle`] stands in for the
//! remote boards: it injects frames and inspects what was sent.

use cell_common::can::CanFrame;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use super::{BusError, CanTransceiver, ChipMode};

#[derive(Debug)]
struct LoopbackState {
    mode: ChipMode,
    rx: VecDeque<CanFrame>,
    sent: Vec<CanFrame>,
    echo: bool,
    /// Remaining transmit attempts to reject as busy.
    busy_for: u32,
    open: bool,
}

/// Loopback transceiver.
pub struct LoopbackTransceiver {
    state: Arc<Mutex<LoopbackState>>,
}

/// Test and simulation access to a [`LoopbackTransceiver`].
#[derive(Clone)]
pub struct LoopbackHandle {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackTransceiver {
    pub fn new() -> (Self, LoopbackHandle) {
        let state = Arc::new(Mutex::new(LoopbackState {
            mode: ChipMode::Normal,
            rx: VecDeque::new(),
            sent: Vec::new(),
            echo: true,
            busy_for: 0,
            open: true,
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            LoopbackHandle { state },
        )
    }
}

impl CanTransceiver for LoopbackTransceiver {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn reset(&mut self) -> Result<(), BusError> {
        let mut state = self.state.lock();
        state.mode = ChipMode::Configuration;
        state.rx.clear();
        state.open = true;
        Ok(())
    }

    fn operating_mode(&mut self) -> Result<ChipMode, BusError> {
        Ok(self.state.lock().mode)
    }

    fn request_mode(&mut self, mode: ChipMode) -> Result<(), BusError> {
        self.state.lock().mode = mode;
        Ok(())
    }

    fn configure_bit_timing(&mut self) -> Result<(), BusError> {
        Ok(())
    }

    fn transmit(&mut self, frame: &CanFrame) -> Result<(), BusError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(BusError::NotInitialized);
        }
        if state.busy_for > 0 {
            state.busy_for -= 1;
            return Err(BusError::Busy { attempts: 1 });
        }
        state.sent.push(frame.clone());
        if state.echo {
            state.rx.push_back(frame.clone());
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<CanFrame>, BusError> {
        Ok(self.state.lock().rx.pop_front())
    }

    fn close(&mut self) -> Result<(), BusError> {
        self.state.lock().open = false;
        Ok(())
    }
}

impl LoopbackHandle {
    /// Queue a frame as if a remote node had sent it.
    pub fn inject(&self, frame: CanFrame) {
        self.state.lock().rx.push_back(frame);
    }

    /// Frames transmitted so far.
    pub fn sent(&self) -> Vec<CanFrame> {
        self.state.lock().sent.clone()
    }

    /// Most recent transmitted frame with the given identifier.
    pub fn last_sent(&self, id: u32) -> Option<CanFrame> {
        self.state
            .lock()
            .sent
            .iter()
            .rev()
            .find(|f| f.id == id)
            .cloned()
    }

    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    pub fn set_echo(&self, echo: bool) {
        self.state.lock().echo = echo;
    }

    /// Reject the next `attempts` transmits as if every buffer were pending.
    pub fn set_busy_for(&self, attempts: u32) {
        self.state.lock().busy_for = attempts;
    }

    pub fn pending_rx(&self) -> usize {
        self.state.lock().rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echoes_transmitted_frames() {
        let (mut chip, handle) = LoopbackTransceiver::new();
        let frame = CanFrame::new(0xC0, &[1]).unwrap();
        chip.transmit(&frame).unwrap();
        assert_eq!(chip.receive().unwrap(), Some(frame.clone()));
        assert_eq!(handle.sent(), vec![frame]);
    }

    #[test]
    fn busy_injection() {
        let (mut chip, handle) = LoopbackTransceiver::new();
        handle.set_busy_for(1);
        let frame = CanFrame::new(0xC0, &[1]).unwrap();
        assert!(matches!(chip.transmit(&frame), Err(BusError::Busy { .. })));
        assert!(chip.transmit(&frame).is_ok());
    }
}
