//! HAL integration tests.
//!
//! Bus and expander over the loopback chip, motion controller over the
//! simulation backend.

use cell_common::axis::{AxisConfig, AxisId, AxisState, MotorKind};
use cell_common::can::CanFrame;
use cell_common::config::{BackendKind, BusConfig, IoConfig, MotionConfig};
use cell_common::io::IoName;
use cell_hal::bus::ring::RX_RING_CAPACITY;
use cell_hal::io::INPUT_FRAME_BASE;
use cell_hal::{BusController, IoExpander, MotionController, MotionError};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

async fn expander() -> IoExpander {
    let bus = Arc::new(BusController::simulated(BusConfig {
        simulate: true,
        ..Default::default()
    }));
    bus.initialize().await.expect("bus init");
    IoExpander::new(bus, IoConfig::default())
}

#[tokio::test(start_paused = true)]
async fn test_emergency_input_reaches_expander_through_drain_task() {
    let io = expander().await;
    let remote = io.bus().loopback().expect("loopback").clone();

    // Input 15 (emergency stop) is bit 7 of byte 1.
    remote.inject(CanFrame::new(INPUT_FRAME_BASE, &[0x00, 0x80, 0x00, 0x00]).unwrap());
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(io.refresh(), 1);
    assert!(io.check_emergency());
    assert!(io.is_active(IoName::EmergencyStop).unwrap());
    assert!(io.check_door_open());
}

#[tokio::test(start_paused = true)]
async fn test_output_write_sends_board_image() {
    let io = expander().await;
    let remote = io.bus().loopback().expect("loopback").clone();
    remote.set_echo(false);

    io.write(IoName::Buzzer, true).await.unwrap();
    let frame = remote.last_sent(0xC0).expect("output frame");
    assert_eq!(frame.payload()[1], 0x80);
    assert!(io.read(IoName::Buzzer).unwrap());
    assert!(io.bus().stats().transmitted >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_bus_shutdown_stops_transmit() {
    let bus = BusController::simulated(BusConfig {
        simulate: true,
        ..Default::default()
    });
    bus.initialize().await.unwrap();
    bus.shutdown().await;
    assert!(!bus.is_initialized());
    let frame = CanFrame::new(0x123, &[1]).unwrap();
    assert!(bus.transmit(&frame).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_receive_overflow_drops_oldest_and_counts_episodes() {
    let bus = BusController::simulated(BusConfig {
        simulate: true,
        ..Default::default()
    });
    bus.initialize().await.unwrap();
    let remote = bus.loopback().expect("loopback").clone();

    for n in 0..200u16 {
        remote.inject(CanFrame::new(0x100 + u32::from(n), &[n as u8]).unwrap());
    }
    bus.drain_pending().await.unwrap();

    let stats = bus.stats();
    assert_eq!(stats.received, 200);
    assert_eq!(stats.dropped_frames, 200 - RX_RING_CAPACITY as u64);
    assert_eq!(stats.overflow_events, 1);
    // Oldest frames went first.
    let oldest = bus.poll_receive().expect("frame");
    assert_eq!(oldest.id, 0x100 + (200 - RX_RING_CAPACITY) as u32);

    // The pop ended the episode; the next overflow starts a new one.
    for n in 0..2u8 {
        remote.inject(CanFrame::new(0x400, &[n]).unwrap());
    }
    bus.drain_pending().await.unwrap();
    assert_eq!(bus.stats().overflow_events, 2);
}

fn sim_motion() -> MotionConfig {
    MotionConfig {
        backend: BackendKind::Simulation,
        ..Default::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Targets outside the soft limits never reach the backend and leave the
    /// axis where it was.
    #[test]
    fn test_out_of_limit_moves_never_reach_backend(
        beyond in 0.001f64..10_000.0,
        negative in any::<bool>(),
        speed in 1.0f64..=100.0,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        rt.block_on(async {
            let config = AxisConfig::new(AxisId::X, MotorKind::Stepping);
            let target = if negative {
                config.limit_minus - beyond
            } else {
                config.limit_plus + beyond
            };
            let mc = MotionController::from_config(&sim_motion(), &[config]);
            mc.initialize().await.unwrap();
            let sim = mc.simulation().unwrap().clone();
            let before = sim.position(AxisId::X);

            let result = mc.move_absolute(AxisId::X, target, speed).await;
            let rejected = matches!(result, Err(MotionError::AxisLimit { .. }));
            prop_assert!(rejected);
            prop_assert_eq!(sim.motion_commands(AxisId::X), 0);
            tokio::time::sleep(Duration::from_millis(50)).await;
            prop_assert_eq!(sim.position(AxisId::X), before);
            prop_assert_eq!(mc.get_status(AxisId::X).unwrap().state, AxisState::Idle);
            Ok(())
        })?;
    }
}

#[tokio::test(start_paused = true)]
async fn test_homing_order_groups_run_concurrently() {
    let mut y = AxisConfig::new(AxisId::Y, MotorKind::Stepping);
    y.homing_order = 1;
    let mut z = AxisConfig::new(AxisId::Z, MotorKind::Stepping);
    z.homing_order = 1;
    let mc = MotionController::from_config(&sim_motion(), &[y, z]);
    mc.initialize().await.unwrap();

    let (a, b) = tokio::join!(mc.home(AxisId::Y), mc.home(AxisId::Z));
    a.unwrap();
    b.unwrap();
    assert!(mc.all_homed());
}
