//! Homing procedures, selected by motor kind.
//!
//! Every procedure runs sensor check, then offset move, then parameter
//! commit. Each wait is bounded by `motion.homing_timeout_ms`.

use cell_common::axis::{AxisConfig, HomingSensor, MotorKind};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::backend::{AxisOutput, DriveStatus, HomingRequest};
use super::{Inner, MotionError};

/// Width of the actuator's homing start pulse.
const HOMING_PULSE: Duration = Duration::from_millis(100);

pub(super) async fn run(inner: &Inner, config: &AxisConfig) -> Result<(), MotionError> {
    match config.motor_kind {
        MotorKind::VendorActuator => home_actuator(inner, config).await,
        MotorKind::Stepping => home_stepping(inner, config, true).await,
        // Closed-loop drives keep their limits armed during the search.
        MotorKind::ClosedLoopStepping => home_stepping(inner, config, false).await,
        MotorKind::None => Err(MotionError::NotConfigured(config.axis)),
    }
}

fn timeout_error(inner: &Inner, config: &AxisConfig) -> MotionError {
    MotionError::HomingTimeout {
        axis: config.axis,
        timeout_ms: inner.config.homing_timeout_ms,
    }
}

/// Wait for the search to start, then for it to finish.
async fn await_search(
    inner: &Inner,
    config: &AxisConfig,
) -> Result<DriveStatus, MotionError> {
    let axis = config.axis;
    let busy_wait = Duration::from_millis(inner.config.homing_busy_wait_ms);
    if inner
        .wait_drive(axis, busy_wait, |d| d.busy || d.homing)
        .await?
        .is_none()
    {
        warn!(%axis, "drive did not report busy, homing may already be done");
    }

    let window = Duration::from_millis(inner.config.homing_timeout_ms);
    inner
        .wait_drive(axis, window, |d| !d.busy && !d.homing)
        .await?
        .ok_or_else(|| timeout_error(inner, config))
}

/// Actuator with its own homing controller: start it, then watch busy.
async fn home_actuator(inner: &Inner, config: &AxisConfig) -> Result<(), MotionError> {
    let axis = config.axis;

    inner
        .call(|b| b.write_axis_output(axis, AxisOutput::Homing, true))
        .await?;
    sleep(HOMING_PULSE).await;
    inner
        .call(|b| b.write_axis_output(axis, AxisOutput::Homing, false))
        .await?;

    let drive = await_search(inner, config).await?;

    if !config.sensor_logic.is_triggered(drive.origin_sensor) {
        warn!(%axis, "origin sensor not reported after actuator homing");
    }

    // The actuator applies its origin offset internally.
    let offset = config.origin_offset;
    inner.call(|b| b.set_position(axis, offset)).await?;
    Ok(())
}

/// Pulse-train motor: automatic origin search, offset move, commit.
async fn home_stepping(
    inner: &Inner,
    config: &AxisConfig,
    release_limits: bool,
) -> Result<(), MotionError> {
    let axis = config.axis;
    let limits = Some((config.limit_minus, config.limit_plus));

    if config.homing_sensor != HomingSensor::Auto {
        debug!(%axis, sensor = ?config.homing_sensor, "no origin search, committing parameters");
        let offset = config.origin_offset;
        inner
            .call(|b| {
                b.set_position(axis, offset)?;
                b.set_soft_limits(axis, limits)
            })
            .await?;
        return Ok(());
    }

    if release_limits {
        inner.call(|b| b.set_soft_limits(axis, None)).await?;
    }

    let request = HomingRequest {
        direction: config.homing_direction,
        speed: config.origin_speed,
    };
    inner.call(|b| b.home(axis, &request)).await?;

    let drive = await_search(inner, config).await?;
    if !config.sensor_logic.is_triggered(drive.origin_sensor) {
        warn!(%axis, "origin search ended off the sensor");
        return Err(timeout_error(inner, config));
    }

    if config.origin_offset != 0.0 {
        let (offset, speed) = (config.origin_offset, config.offset_speed);
        inner.call(|b| b.move_relative(axis, offset, speed)).await?;
        let motion_window = Duration::from_millis(inner.config.motion_timeout_ms);
        inner
            .wait_drive(axis, motion_window, |d| !d.busy)
            .await?
            .ok_or_else(|| timeout_error(inner, config))?;
    }

    let offset = config.origin_offset;
    inner
        .call(|b| {
            if release_limits {
                b.set_soft_limits(axis, limits)?;
            }
            b.set_position(axis, offset)
        })
        .await?;

    info!(%axis, origin = offset, "origin search complete");
    Ok(())
}
