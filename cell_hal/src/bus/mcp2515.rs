//! MCP2515 stand-alone CAN controller driver.
//!
//! Register-level access over an [`SpiTransport`]. Raw status bytes are
//! decoded into [`ReadStatus`] / [`RxStatus`] here and never leave this
//! module.

use bitflags::bitflags;
use cell_common::can::CanFrame;
use tracing::trace;

use super::spi::SpiTransport;
use super::{BusError, CanTransceiver, ChipMode};

/// SPI instruction set.
pub mod instruction {
    pub const RESET: u8 = 0xC0;
    pub const READ: u8 = 0x03;
    pub const WRITE: u8 = 0x02;
    pub const BIT_MODIFY: u8 = 0x05;
    /// Read RX buffer; `| 0x00` RXB0 header, `| 0x04` RXB1 header.
    pub const READ_RX_BUFFER: u8 = 0x90;
    /// Load TX buffer; `| 0x00/0x02/0x04` selects TXB0/1/2 header.
    pub const LOAD_TX_BUFFER: u8 = 0x40;
    /// Request to send; `| 1 << n` for TXBn.
    pub const RTS: u8 = 0x80;
    pub const READ_STATUS: u8 = 0xA0;
    pub const RX_STATUS: u8 = 0xB0;
}

/// Register addresses.
pub mod register {
    pub const CANSTAT: u8 = 0x0E;
    pub const CANCTRL: u8 = 0x0F;
    pub const CNF3: u8 = 0x28;
    pub const CNF2: u8 = 0x29;
    pub const CNF1: u8 = 0x2A;
    pub const RXB0CTRL: u8 = 0x60;
    pub const RXB1CTRL: u8 = 0x70;
}

/// CANCTRL/CANSTAT operating-mode field.
const MODE_MASK: u8 = 0xE0;
const MODE_SHIFT: u8 = 5;

/// 16 MHz crystal, 500 kbit/s.
const CNF1_500K: u8 = 0x00;
const CNF2_500K: u8 = 0x80;
const CNF3_500K: u8 = 0x01;

/// Receive any message, filters off.
const RX_ANY: u8 = 0x60;

/// SIDL extended-identifier enable.
const SIDL_EXIDE: u8 = 0x08;

/// Header (SIDH, SIDL, EID8, EID0, DLC) plus 8 data bytes.
const BUFFER_LEN: usize = 13;

const TX_BUFFERS: u8 = 3;

bitflags! {
    /// READ STATUS response.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReadStatus: u8 {
        const RX0IF = 0x01;
        const RX1IF = 0x02;
        const TXB0REQ = 0x04;
        const TX0IF = 0x08;
        const TXB1REQ = 0x10;
        const TX1IF = 0x20;
        const TXB2REQ = 0x40;
        const TX2IF = 0x80;
    }
}

impl ReadStatus {
    /// Index of the first transmit buffer without a pending request.
    pub fn free_tx_buffer(self) -> Option<u8> {
        [Self::TXB0REQ, Self::TXB1REQ, Self::TXB2REQ]
            .iter()
            .position(|req| !self.contains(*req))
            .map(|n| n as u8)
    }
}

bitflags! {
    /// RX STATUS response (message-received bits only).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RxStatus: u8 {
        const MSG_RXB0 = 0x40;
        const MSG_RXB1 = 0x80;
    }
}

impl ChipMode {
    fn from_canstat(value: u8) -> Self {
        match (value & MODE_MASK) >> MODE_SHIFT {
            0 => Self::Normal,
            1 => Self::Sleep,
            2 => Self::Loopback,
            3 => Self::ListenOnly,
            _ => Self::Configuration,
        }
    }

    fn to_canctrl(self) -> u8 {
        (self as u8) << MODE_SHIFT
    }
}

/// Encode an identifier into SIDH, SIDL, EID8, EID0.
pub fn encode_id(id: u32, extended: bool) -> [u8; 4] {
    if extended {
        [
            ((id & 0x1FE0_0000) >> 21) as u8,
            SIDL_EXIDE | ((id & 0x001C_0000) >> 13) as u8 | ((id & 0x0003_0000) >> 16) as u8,
            ((id & 0xFF00) >> 8) as u8,
            (id & 0xFF) as u8,
        ]
    } else {
        [((id & 0x7F8) >> 3) as u8, ((id & 0x7) << 5) as u8, 0, 0]
    }
}

/// Decode SIDH, SIDL, EID8, EID0 into `(id, extended)`.
pub fn decode_id(header: &[u8; 4]) -> (u32, bool) {
    let [sidh, sidl, eid8, eid0] = *header;
    if sidl & SIDL_EXIDE != 0 {
        let id = (u32::from(sidh) << 21)
            | (u32::from(sidl & 0xE0) << 13)
            | (u32::from(sidl & 0x03) << 16)
            | (u32::from(eid8) << 8)
            | u32::from(eid0);
        (id, true)
    } else {
        ((u32::from(sidh) << 3) | (u32::from(sidl) >> 5), false)
    }
}

/// MCP2515 driver over any SPI transport.
pub struct Mcp2515<T: SpiTransport> {
    spi: T,
}

impl<T: SpiTransport> Mcp2515<T> {
    pub fn new(spi: T) -> Self {
        Self { spi }
    }

    pub fn read_register(&mut self, addr: u8) -> Result<u8, BusError> {
        let mut buf = [instruction::READ, addr, 0];
        self.spi.transfer(&mut buf)?;
        Ok(buf[2])
    }

    pub fn write_register(&mut self, addr: u8, value: u8) -> Result<(), BusError> {
        self.spi.transfer(&mut [instruction::WRITE, addr, value])
    }

    pub fn bit_modify(&mut self, addr: u8, mask: u8, value: u8) -> Result<(), BusError> {
        self.spi
            .transfer(&mut [instruction::BIT_MODIFY, addr, mask, value])
    }

    pub fn read_status(&mut self) -> Result<ReadStatus, BusError> {
        let mut buf = [instruction::READ_STATUS, 0];
        self.spi.transfer(&mut buf)?;
        Ok(ReadStatus::from_bits_retain(buf[1]))
    }

    pub fn rx_status(&mut self) -> Result<RxStatus, BusError> {
        let mut buf = [instruction::RX_STATUS, 0];
        self.spi.transfer(&mut buf)?;
        Ok(RxStatus::from_bits_truncate(buf[1]))
    }

    fn read_rx_buffer(&mut self, n: u8) -> Result<CanFrame, BusError> {
        let mut buf = [0u8; 1 + BUFFER_LEN];
        buf[0] = instruction::READ_RX_BUFFER | (n << 2);
        self.spi.transfer(&mut buf)?;

        let (id, extended) = decode_id(&[buf[1], buf[2], buf[3], buf[4]]);
        let len = usize::from(buf[5] & 0x0F).min(8);
        let frame = if extended {
            CanFrame::new_extended(id, &buf[6..6 + len])?
        } else {
            CanFrame::new(id, &buf[6..6 + len])?
        };
        Ok(frame.with_slot(n))
    }

    fn load_tx_buffer(&mut self, n: u8, frame: &CanFrame) -> Result<(), BusError> {
        let len = frame.len();
        let mut buf = [0u8; 1 + BUFFER_LEN];
        buf[0] = instruction::LOAD_TX_BUFFER | (n << 1);
        buf[1..5].copy_from_slice(&encode_id(frame.id, frame.extended));
        buf[5] = len as u8;
        buf[6..6 + len].copy_from_slice(frame.payload());
        self.spi.transfer(&mut buf[..6 + len])
    }

    pub fn into_inner(self) -> T {
        self.spi
    }
}

impl<T: SpiTransport> CanTransceiver for Mcp2515<T> {
    fn name(&self) -> &'static str {
        "mcp2515"
    }

    fn reset(&mut self) -> Result<(), BusError> {
        self.spi.transfer(&mut [instruction::RESET])
    }

    fn operating_mode(&mut self) -> Result<ChipMode, BusError> {
        Ok(ChipMode::from_canstat(self.read_register(register::CANSTAT)?))
    }

    fn request_mode(&mut self, mode: ChipMode) -> Result<(), BusError> {
        self.bit_modify(register::CANCTRL, MODE_MASK, mode.to_canctrl())
    }

    fn configure_bit_timing(&mut self) -> Result<(), BusError> {
        self.write_register(register::CNF1, CNF1_500K)?;
        self.write_register(register::CNF2, CNF2_500K)?;
        self.write_register(register::CNF3, CNF3_500K)?;
        self.write_register(register::RXB0CTRL, RX_ANY)?;
        self.write_register(register::RXB1CTRL, RX_ANY)
    }

    fn transmit(&mut self, frame: &CanFrame) -> Result<(), BusError> {
        let status = self.read_status()?;
        let Some(n) = status.free_tx_buffer() else {
            return Err(BusError::Busy { attempts: 1 });
        };
        debug_assert!(n < TX_BUFFERS);
        self.load_tx_buffer(n, frame)?;
        self.spi.transfer(&mut [instruction::RTS | (1 << n)])?;
        trace!(buffer = n, %frame, "frame queued");
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<CanFrame>, BusError> {
        let status = self.rx_status()?;
        let n = if status.contains(RxStatus::MSG_RXB0) {
            0
        } else if status.contains(RxStatus::MSG_RXB1) {
            1
        } else {
            return Ok(None);
        };
        // Reading through READ RX BUFFER clears the buffer's interrupt flag.
        self.read_rx_buffer(n).map(Some)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use parking_lot::Mutex;

    /// Register-file model of the chip, enough for the driver paths.
    pub(crate) struct ChipModel {
        pub regs: [u8; 128],
        pub tx_pending: [bool; 3],
        pub tx_loaded: Vec<(u8, Vec<u8>)>,
        pub rx: VecDeque<[u8; BUFFER_LEN]>,
        /// Keep reporting configuration mode after a normal-mode request.
        pub stuck_in_config: bool,
        /// Never report configuration mode after reset.
        pub dead: bool,
        pub log: Vec<u8>,
    }

    impl Default for ChipModel {
        fn default() -> Self {
            Self {
                regs: [0; 128],
                tx_pending: [false; 3],
                tx_loaded: Vec::new(),
                rx: VecDeque::new(),
                stuck_in_config: false,
                dead: false,
                log: Vec::new(),
            }
        }
    }

    #[derive(Clone, Default)]
    pub(crate) struct FakeSpi(pub Arc<Mutex<ChipModel>>);

    impl SpiTransport for FakeSpi {
        fn transfer(&mut self, buf: &mut [u8]) -> Result<(), BusError> {
            let mut chip = self.0.lock();
            let cmd = buf[0];
            chip.log.push(cmd);
            match cmd {
                instruction::RESET => {
                    if !chip.dead {
                        chip.regs[register::CANSTAT as usize] = 0x80;
                    }
                }
                instruction::READ => buf[2] = chip.regs[buf[1] as usize],
                instruction::WRITE => chip.regs[buf[1] as usize] = buf[2],
                instruction::BIT_MODIFY => {
                    let (addr, mask, value) = (buf[1] as usize, buf[2], buf[3]);
                    chip.regs[addr] = (chip.regs[addr] & !mask) | (value & mask);
                    if addr == register::CANCTRL as usize {
                        let requested = chip.regs[addr] & MODE_MASK;
                        if !(chip.stuck_in_config && requested == 0) && !chip.dead {
                            chip.regs[register::CANSTAT as usize] = requested;
                        }
                    }
                }
                instruction::READ_STATUS => {
                    let mut s = 0;
                    for (n, bit) in [0x04, 0x10, 0x40].iter().enumerate() {
                        if chip.tx_pending[n] {
                            s |= bit;
                        }
                    }
                    buf[1] = s;
                }
                instruction::RX_STATUS => {
                    buf[1] = if chip.rx.is_empty() { 0 } else { 0x40 };
                }
                c if c & 0xF8 == instruction::LOAD_TX_BUFFER => {
                    chip.tx_loaded.push(((c & 0x06) >> 1, buf[1..].to_vec()));
                }
                c if c & 0xF0 == instruction::READ_RX_BUFFER => {
                    if let Some(data) = chip.rx.pop_front() {
                        buf[1..].copy_from_slice(&data);
                    }
                }
                c if c & 0xF0 == instruction::RTS => {
                    for n in 0..3 {
                        if c & (1 << n) != 0 {
                            chip.tx_pending[n] = true;
                        }
                    }
                }
                _ => {}
            }
            Ok(())
        }
    }

    #[test]
    fn standard_id_encoding() {
        assert_eq!(encode_id(0xC0, false), [0x18, 0x00, 0, 0]);
        assert_eq!(encode_id(0x7FF, false), [0xFF, 0xE0, 0, 0]);
        assert_eq!(decode_id(&[0x1A, 0x00, 0, 0]), (0xD0, false));
    }

    #[test]
    fn extended_id_encoding() {
        let id = 0x1234_5678 & 0x1FFF_FFFF;
        let header = encode_id(id, true);
        assert_ne!(header[1] & SIDL_EXIDE, 0);
        assert_eq!(decode_id(&header), (id, true));
    }

    #[test]
    fn mode_field() {
        assert_eq!(ChipMode::from_canstat(0x80), ChipMode::Configuration);
        assert_eq!(ChipMode::from_canstat(0x00), ChipMode::Normal);
        assert_eq!(ChipMode::Configuration.to_canctrl(), 0x80);
    }

    #[test]
    fn transmit_uses_first_free_buffer() {
        let spi = FakeSpi::default();
        let mut chip = Mcp2515::new(spi.clone());
        spi.0.lock().tx_pending[0] = true;

        let frame = CanFrame::new(0xC0, &[0xAA, 0x55]).unwrap();
        chip.transmit(&frame).unwrap();

        let model = spi.0.lock();
        let (n, bytes) = &model.tx_loaded[0];
        assert_eq!(*n, 1);
        assert_eq!(&bytes[..7], &[0x18, 0x00, 0, 0, 2, 0xAA, 0x55]);
        assert!(model.tx_pending[1]);
    }

    #[test]
    fn transmit_busy_when_all_pending() {
        let spi = FakeSpi::default();
        let mut chip = Mcp2515::new(spi.clone());
        spi.0.lock().tx_pending = [true; 3];

        let frame = CanFrame::new(0xC0, &[0]).unwrap();
        assert!(matches!(
            chip.transmit(&frame),
            Err(BusError::Busy { attempts: 1 })
        ));
    }

    #[test]
    fn receive_decodes_rx_buffer() {
        let spi = FakeSpi::default();
        let mut chip = Mcp2515::new(spi.clone());
        let mut raw = [0u8; BUFFER_LEN];
        raw[..4].copy_from_slice(&encode_id(0xD0, false));
        raw[4] = 4;
        raw[5..9].copy_from_slice(&[1, 2, 3, 4]);
        spi.0.lock().rx.push_back(raw);

        let frame = chip.receive().unwrap().unwrap();
        assert_eq!(frame.id, 0xD0);
        assert_eq!(frame.payload(), &[1, 2, 3, 4]);
        assert!(chip.receive().unwrap().is_none());
    }

    #[test]
    fn bit_timing_registers() {
        let spi = FakeSpi::default();
        let mut chip = Mcp2515::new(spi.clone());
        chip.configure_bit_timing().unwrap();
        let model = spi.0.lock();
        assert_eq!(model.regs[register::CNF1 as usize], 0x00);
        assert_eq!(model.regs[register::CNF2 as usize], 0x80);
        assert_eq!(model.regs[register::CNF3 as usize], 0x01);
        assert_eq!(model.regs[register::RXB0CTRL as usize], 0x60);
        assert_eq!(model.regs[register::RXB1CTRL as usize], 0x60);
    }
}
