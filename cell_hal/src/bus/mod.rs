//! CAN bus access.
//!
//! [`BusController`] owns one [`CanTransceiver`] behind a single async gate,
//! so no two transactions interleave on the wire. A background drain task
//! moves received frames into a fixed-capacity [`RxRing`].
//!
//! # Module Structure
//!
//! - [`mcp2515`] - Register-level MCP2515 driver
//! - [`spi`] - SPI transport trait and Linux spidev implementation
//! - [`loopback`] - In-memory transceiver for hardware-free operation
//! - [`ring`] - Receive ring with drop-oldest overflow policy

pub mod loopback;
pub mod mcp2515;
pub mod ring;
pub mod spi;

use cell_common::can::{CanFrame, FrameError};
use cell_common::config::BusConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, error, info, warn};

use self::loopback::{LoopbackHandle, LoopbackTransceiver};
use self::mcp2515::Mcp2515;
use self::ring::{PushOutcome, RxRing};
use self::spi::SpidevTransport;

// ─── Errors ─────────────────────────────────────────────────────────

/// Bus error taxonomy.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// Chip did not confirm the requested mode in time.
    #[error("Bus initialization failed: {0}")]
    Init(String),

    /// Every transmit buffer stayed pending.
    #[error("Bus busy: no free transmit buffer after {attempts} attempts")]
    Busy { attempts: u32 },

    #[error("SPI transport error: {0}")]
    Transport(String),

    #[error("Bus not initialized")]
    NotInitialized,

    #[error("Invalid frame: {0}")]
    InvalidFrame(#[from] FrameError),
}

// ─── Transceiver trait ──────────────────────────────────────────────

/// Controller operating mode (CANSTAT.OPMOD).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChipMode {
    Normal = 0,
    Sleep = 1,
    Loopback = 2,
    ListenOnly = 3,
    Configuration = 4,
}

/// Synchronous CAN controller interface.
///
/// Implementations perform one short register transaction per call.
/// [`BusController`] serializes every call through its gate.
pub trait CanTransceiver: Send {
    fn name(&self) -> &'static str;

    /// Issue a controller reset. The chip enters configuration mode.
    fn reset(&mut self) -> Result<(), BusError>;

    fn operating_mode(&mut self) -> Result<ChipMode, BusError>;

    fn request_mode(&mut self, mode: ChipMode) -> Result<(), BusError>;

    /// Program bit timing and receive-buffer acceptance.
    fn configure_bit_timing(&mut self) -> Result<(), BusError>;

    /// Queue one frame. `Busy` when no transmit buffer is free.
    fn transmit(&mut self, frame: &CanFrame) -> Result<(), BusError>;

    /// Take one pending received frame, if any.
    fn receive(&mut self) -> Result<Option<CanFrame>, BusError>;

    fn close(&mut self) -> Result<(), BusError> {
        Ok(())
    }
}

// ─── Statistics ─────────────────────────────────────────────────────

/// Bus counters snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub transmitted: u64,
    pub received: u64,
    pub dropped_frames: u64,
    pub overflow_events: u64,
    pub busy_retries: u64,
}

#[derive(Default)]
struct Counters {
    transmitted: AtomicU64,
    received: AtomicU64,
    busy_retries: AtomicU64,
}

// ─── BusController ──────────────────────────────────────────────────

type Gate = Arc<tokio::sync::Mutex<Box<dyn CanTransceiver>>>;

/// Serialized access to one CAN controller.
pub struct BusController {
    config: BusConfig,
    chip: Gate,
    ring: Arc<Mutex<RxRing>>,
    counters: Arc<Counters>,
    initialized: AtomicBool,
    drain_task: Mutex<Option<JoinHandle<()>>>,
    loopback: Option<LoopbackHandle>,
}

impl BusController {
    pub fn new(config: BusConfig, chip: Box<dyn CanTransceiver>) -> Self {
        Self {
            config,
            chip: Arc::new(tokio::sync::Mutex::new(chip)),
            ring: Arc::new(Mutex::new(RxRing::new())),
            counters: Arc::new(Counters::default()),
            initialized: AtomicBool::new(false),
            drain_task: Mutex::new(None),
            loopback: None,
        }
    }

    /// Controller over the in-memory loopback transceiver.
    pub fn simulated(config: BusConfig) -> Self {
        let (chip, handle) = LoopbackTransceiver::new();
        let mut bus = Self::new(config, Box::new(chip));
        bus.loopback = Some(handle);
        bus
    }

    /// Build the transceiver selected by `config.simulate`.
    ///
    /// # Errors
    ///
    /// `Transport` if the SPI device cannot be opened.
    pub fn from_config(config: &BusConfig) -> Result<Self, BusError> {
        if config.simulate {
            info!("CAN bus: loopback simulation");
            return Ok(Self::simulated(config.clone()));
        }
        let spi = SpidevTransport::open(&config.spi_device, config.spi_speed_hz)?;
        info!(device = %config.spi_device.display(), "CAN bus: MCP2515 over spidev");
        Ok(Self::new(config.clone(), Box::new(Mcp2515::new(spi))))
    }

    /// Loopback handle when running simulated.
    pub fn loopback(&self) -> Option<&LoopbackHandle> {
        self.loopback.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Reset the chip, program bit timing, enter normal mode and start the
    /// receive drain task.
    ///
    /// # Errors
    ///
    /// `Init` if either mode confirmation is not observed within
    /// `init_poll_limit` polls.
    pub async fn initialize(&self) -> Result<(), BusError> {
        if self.is_initialized() {
            warn!("CAN bus already initialized");
            return Ok(());
        }

        {
            let mut chip = self.chip.lock().await;
            chip.reset()?;
            sleep(Duration::from_millis(self.config.reset_settle_ms)).await;

            chip.request_mode(ChipMode::Configuration)?;
            self.await_mode(chip.as_mut(), ChipMode::Configuration)
                .await?;

            chip.configure_bit_timing()?;

            chip.request_mode(ChipMode::Normal)?;
            self.await_mode(chip.as_mut(), ChipMode::Normal).await?;
            debug!(chip = chip.name(), "CAN controller in normal mode");
        }

        self.ring.lock().clear();
        self.initialized.store(true, Ordering::Release);
        self.spawn_drain_task();
        info!("✅ CAN bus initialized");
        Ok(())
    }

    async fn await_mode(
        &self,
        chip: &mut dyn CanTransceiver,
        wanted: ChipMode,
    ) -> Result<(), BusError> {
        let poll_interval = Duration::from_millis(self.config.init_poll_interval_ms);
        for _ in 0..self.config.init_poll_limit {
            if chip.operating_mode()? == wanted {
                return Ok(());
            }
            sleep(poll_interval).await;
        }
        Err(BusError::Init(format!(
            "{wanted:?} mode not confirmed after {} polls",
            self.config.init_poll_limit
        )))
    }

    fn spawn_drain_task(&self) {
        let chip = Arc::clone(&self.chip);
        let ring = Arc::clone(&self.ring);
        let counters = Arc::clone(&self.counters);
        let period = Duration::from_millis(self.config.poll_interval_ms);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let mut chip = chip.lock().await;
                if let Err(e) = drain_into(chip.as_mut(), &ring, &counters) {
                    debug!(error = %e, "receive drain failed");
                }
            }
        });

        if let Some(old) = self.drain_task.lock().replace(handle) {
            old.abort();
        }
    }

    /// Drain every pending chip frame into the ring now.
    ///
    /// Returns the number of frames moved.
    pub async fn drain_pending(&self) -> Result<usize, BusError> {
        self.ensure_initialized()?;
        let mut chip = self.chip.lock().await;
        drain_into(chip.as_mut(), &self.ring, &self.counters)
    }

    /// Transmit one frame, retrying locally while the chip is busy.
    ///
    /// # Errors
    ///
    /// `Busy` after `busy_retries` retries, `NotInitialized` before
    /// [`initialize`](Self::initialize), transport errors as they occur.
    pub async fn transmit(&self, frame: &CanFrame) -> Result<(), BusError> {
        self.ensure_initialized()?;
        let attempts = self.config.busy_retries + 1;
        let mut attempt = 1;
        loop {
            let result = {
                let mut chip = self.chip.lock().await;
                chip.transmit(frame)
            };
            match result {
                Ok(()) => {
                    self.counters.transmitted.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(BusError::Busy { .. }) if attempt < attempts => {
                    self.counters.busy_retries.fetch_add(1, Ordering::Relaxed);
                    attempt += 1;
                    sleep(Duration::from_millis(self.config.busy_retry_delay_ms)).await;
                }
                Err(BusError::Busy { .. }) => {
                    warn!(id = frame.id, attempts, "transmit buffers stayed busy");
                    return Err(BusError::Busy { attempts });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Oldest received frame, if any. Never blocks on the chip.
    pub fn poll_receive(&self) -> Option<CanFrame> {
        self.ring.lock().pop()
    }

    pub fn stats(&self) -> BusStats {
        let ring = self.ring.lock();
        BusStats {
            transmitted: self.counters.transmitted.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            dropped_frames: ring.dropped(),
            overflow_events: ring.overflow_events(),
            busy_retries: self.counters.busy_retries.load(Ordering::Relaxed),
        }
    }

    /// Stop the drain task and close the transceiver.
    pub async fn shutdown(&self) {
        if let Some(task) = self.drain_task.lock().take() {
            task.abort();
        }
        self.initialized.store(false, Ordering::Release);
        let mut chip = self.chip.lock().await;
        if let Err(e) = chip.close() {
            error!(error = %e, "CAN transceiver close failed");
        }
        info!("CAN bus shut down");
    }

    fn ensure_initialized(&self) -> Result<(), BusError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(BusError::NotInitialized)
        }
    }
}

impl Drop for BusController {
    fn drop(&mut self) {
        if let Some(task) = self.drain_task.get_mut().take() {
            task.abort();
        }
    }
}

fn drain_into(
    chip: &mut dyn CanTransceiver,
    ring: &Mutex<RxRing>,
    counters: &Counters,
) -> Result<usize, BusError> {
    let mut moved = 0;
    while let Some(frame) = chip.receive()? {
        counters.received.fetch_add(1, Ordering::Relaxed);
        let outcome = ring.lock().push(frame);
        if let PushOutcome::DroppedOldest { new_episode: true } = outcome {
            warn!("CAN receive ring overflow, dropping oldest frames");
        }
        moved += 1;
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::mcp2515::tests::FakeSpi;
    use super::*;

    fn fast_config() -> BusConfig {
        BusConfig {
            simulate: true,
            init_poll_limit: 5,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_brings_chip_to_normal_mode() {
        let spi = FakeSpi::default();
        let bus = BusController::new(fast_config(), Box::new(Mcp2515::new(spi.clone())));
        bus.initialize().await.unwrap();
        assert!(bus.is_initialized());

        let model = spi.0.lock();
        assert_eq!(model.log[0], mcp2515::instruction::RESET);
        assert_eq!(model.regs[mcp2515::register::CANSTAT as usize] & 0xE0, 0);
        assert_eq!(model.regs[mcp2515::register::CNF2 as usize], 0x80);
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_fails_without_config_mode() {
        let spi = FakeSpi::default();
        spi.0.lock().dead = true;
        spi.0.lock().regs[mcp2515::register::CANSTAT as usize] = 0x00;
        let bus = BusController::new(fast_config(), Box::new(Mcp2515::new(spi)));
        assert!(matches!(bus.initialize().await, Err(BusError::Init(_))));
        assert!(!bus.is_initialized());
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_fails_without_normal_mode() {
        let spi = FakeSpi::default();
        spi.0.lock().stuck_in_config = true;
        let bus = BusController::new(fast_config(), Box::new(Mcp2515::new(spi)));
        let err = bus.initialize().await.unwrap_err();
        assert!(err.to_string().contains("Normal"));
    }

    #[tokio::test]
    async fn transmit_requires_initialize() {
        let bus = BusController::simulated(fast_config());
        let frame = CanFrame::new(0xC0, &[0]).unwrap();
        assert!(matches!(
            bus.transmit(&frame).await,
            Err(BusError::NotInitialized)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_is_retried_then_surfaced() {
        let bus = BusController::simulated(fast_config());
        bus.initialize().await.unwrap();
        let handle = bus.loopback().unwrap().clone();
        let frame = CanFrame::new(0xC0, &[0]).unwrap();

        // Two busy answers are absorbed by the retries.
        handle.set_busy_for(2);
        bus.transmit(&frame).await.unwrap();
        assert_eq!(bus.stats().busy_retries, 2);

        // More than busy_retries + 1 surfaces.
        handle.set_busy_for(10);
        assert!(matches!(
            bus.transmit(&frame).await,
            Err(BusError::Busy { attempts: 4 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn loopback_frames_reach_poll_receive() {
        let bus = BusController::simulated(fast_config());
        bus.initialize().await.unwrap();
        let frame = CanFrame::new(0xC3, &[9, 8]).unwrap();
        bus.transmit(&frame).await.unwrap();
        bus.drain_pending().await.unwrap();
        assert_eq!(bus.poll_receive(), Some(frame));
        assert_eq!(bus.poll_receive(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_task_runs_in_background() {
        let bus = BusController::simulated(fast_config());
        bus.initialize().await.unwrap();
        bus.loopback()
            .unwrap()
            .inject(CanFrame::new(0xD0, &[1, 0, 0, 0]).unwrap());
        sleep(Duration::from_millis(10)).await;
        assert_eq!(bus.stats().received, 1);
        assert!(bus.poll_receive().is_some());
    }
}
