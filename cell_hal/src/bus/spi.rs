//! SPI transport for the CAN controller chip.

use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};
use std::path::Path;
use tracing::debug;

use super::BusError;

/// Full-duplex byte transport.
///
/// `transfer` clocks `buf` out and overwrites it with the bytes clocked in.
pub trait SpiTransport: Send {
    fn transfer(&mut self, buf: &mut [u8]) -> Result<(), BusError>;
}

/// Linux spidev transport (mode 3, 8-bit words).
pub struct SpidevTransport {
    spi: Spidev,
}

impl SpidevTransport {
    pub fn open(device: &Path, speed_hz: u32) -> Result<Self, BusError> {
        let mut spi = Spidev::open(device).map_err(|e| {
            BusError::Transport(format!("open {}: {e}", device.display()))
        })?;

        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(speed_hz)
            .mode(SpiModeFlags::SPI_MODE_3)
            .build();
        spi.configure(&options)
            .map_err(|e| BusError::Transport(format!("configure {}: {e}", device.display())))?;

        debug!(device = %device.display(), speed_hz, "SPI device opened");
        Ok(Self { spi })
    }
}

impl SpiTransport for SpidevTransport {
    fn transfer(&mut self, buf: &mut [u8]) -> Result<(), BusError> {
        let tx = buf.to_vec();
        let mut transfer = SpidevTransfer::read_write(&tx, buf);
        self.spi
            .transfer(&mut transfer)
            .map_err(|e| BusError::Transport(e.to_string()))
    }
}
