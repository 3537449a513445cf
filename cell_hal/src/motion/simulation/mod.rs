//! Software motion backend.
//!
//! Drop-in replacement for the native backend when no motion board is
//! fitted. Time only advances through [`MotionBackend::advance`], which the
//! controller calls from its control loop, so tests on a paused tokio clock
//! stay deterministic.
//!
//! # Module Structure
//!
//! - [`axis`] - Per-axis trapezoidal motion model
//! - [`referencing`] - Home switch search state machine

pub mod axis;
pub mod referencing;

use cell_common::axis::{AxisConfig, AxisId, JogDirection};
use cell_common::consts::MAX_AXES;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use self::axis::AxisSimulator;
use super::backend::{AxisOutput, BackendError, DriveStatus, HomingRequest, MotionBackend};

type Axes = [Option<AxisSimulator>; MAX_AXES];

/// Simulated motion board.
pub struct SimulationBackend {
    axes: Arc<Mutex<Axes>>,
    open: bool,
}

/// Inspection and fault injection for a [`SimulationBackend`].
#[derive(Clone)]
pub struct SimulationHandle {
    axes: Arc<Mutex<Axes>>,
}

impl SimulationBackend {
    pub fn new() -> (Self, SimulationHandle) {
        let axes = Arc::new(Mutex::new(std::array::from_fn(|_| None)));
        (
            Self {
                axes: Arc::clone(&axes),
                open: false,
            },
            SimulationHandle { axes },
        )
    }

    fn with_axis<T>(
        &self,
        axis: AxisId,
        f: impl FnOnce(&mut AxisSimulator) -> T,
    ) -> Result<T, BackendError> {
        if !self.open {
            return Err(BackendError::NotOpen);
        }
        let mut axes = self.axes.lock();
        axes[axis.index()]
            .as_mut()
            .map(f)
            .ok_or(BackendError::NotConfigured(axis))
    }
}

impl MotionBackend for SimulationBackend {
    fn name(&self) -> &'static str {
        "simulation"
    }

    fn open(&mut self) -> Result<(), BackendError> {
        self.open = true;
        info!("simulated motion board opened");
        Ok(())
    }

    fn configure_axis(&mut self, config: &AxisConfig) -> Result<(), BackendError> {
        if !self.open {
            return Err(BackendError::NotOpen);
        }
        let mut axes = self.axes.lock();
        let slot = &mut axes[config.axis.index()];
        match slot {
            Some(sim) => sim.reconfigure(config.clone()),
            None => *slot = Some(AxisSimulator::new(config.clone())),
        }
        Ok(())
    }

    fn move_absolute(
        &mut self,
        axis: AxisId,
        position: f64,
        speed: f64,
    ) -> Result<(), BackendError> {
        self.with_axis(axis, |sim| sim.move_absolute(position, speed))
    }

    fn move_relative(
        &mut self,
        axis: AxisId,
        distance: f64,
        speed: f64,
    ) -> Result<(), BackendError> {
        self.with_axis(axis, |sim| sim.move_relative(distance, speed))
    }

    fn jog(
        &mut self,
        axis: AxisId,
        direction: JogDirection,
        speed: f64,
    ) -> Result<(), BackendError> {
        self.with_axis(axis, |sim| sim.jog(direction, speed))
    }

    fn stop(&mut self, axis: AxisId) -> Result<(), BackendError> {
        self.with_axis(axis, |sim| sim.stop())
    }

    fn home(&mut self, axis: AxisId, request: &HomingRequest) -> Result<(), BackendError> {
        self.with_axis(axis, |sim| sim.home(request.direction, request.speed))
    }

    fn write_axis_output(
        &mut self,
        axis: AxisId,
        output: AxisOutput,
        on: bool,
    ) -> Result<(), BackendError> {
        self.with_axis(axis, |sim| sim.write_output(output, on))
    }

    fn set_soft_limits(
        &mut self,
        axis: AxisId,
        limits: Option<(f64, f64)>,
    ) -> Result<(), BackendError> {
        self.with_axis(axis, |sim| sim.set_soft_limits(limits))
    }

    fn set_position(&mut self, axis: AxisId, position: f64) -> Result<(), BackendError> {
        self.with_axis(axis, |sim| sim.set_position(position))
    }

    fn read_position(&mut self, axis: AxisId) -> Result<f64, BackendError> {
        self.with_axis(axis, |sim| sim.position())
    }

    fn read_alarm(&mut self, axis: AxisId) -> Result<u16, BackendError> {
        self.with_axis(axis, |sim| sim.alarm_code())
    }

    fn read_drive_status(&mut self, axis: AxisId) -> Result<DriveStatus, BackendError> {
        self.with_axis(axis, |sim| sim.drive_status())
    }

    fn advance(&mut self, dt: Duration) {
        for sim in self.axes.lock().iter_mut().flatten() {
            sim.update(dt);
        }
    }

    fn close(&mut self) -> Result<(), BackendError> {
        self.open = false;
        Ok(())
    }
}

impl SimulationHandle {
    /// Latch a drive alarm code on an axis. Cleared by the drive's Clear
    /// output.
    pub fn inject_alarm(&self, axis: AxisId, code: u16) {
        if let Some(sim) = self.axes.lock()[axis.index()].as_mut() {
            sim.inject_alarm(code);
        }
    }

    /// Drive the emergency input of every axis.
    pub fn set_emergency(&self, active: bool) {
        for sim in self.axes.lock().iter_mut().flatten() {
            sim.set_emergency(active);
        }
    }

    pub fn position(&self, axis: AxisId) -> Option<f64> {
        self.axes.lock()[axis.index()].as_ref().map(|sim| sim.position())
    }

    /// Distance from the home switch.
    pub fn physical_position(&self, axis: AxisId) -> Option<f64> {
        self.axes.lock()[axis.index()]
            .as_ref()
            .map(|sim| sim.physical_position())
    }

    /// Motion commands (moves, jogs, homing searches) the axis received.
    pub fn motion_commands(&self, axis: AxisId) -> u64 {
        self.axes.lock()[axis.index()]
            .as_ref()
            .map_or(0, |sim| sim.commands())
    }

    /// Soft limits currently armed on the axis.
    pub fn soft_limits(&self, axis: AxisId) -> Option<(f64, f64)> {
        self.axes.lock()[axis.index()]
            .as_ref()
            .and_then(|sim| sim.soft_limits())
    }

    /// How often the axis' soft limits were switched off.
    pub fn limit_releases(&self, axis: AxisId) -> u64 {
        self.axes.lock()[axis.index()]
            .as_ref()
            .map_or(0, |sim| sim.limit_releases())
    }

    pub fn output(&self, axis: AxisId, output: AxisOutput) -> bool {
        self.axes.lock()[axis.index()]
            .as_ref()
            .is_some_and(|sim| sim.output(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cell_common::axis::MotorKind;

    #[test]
    fn unconfigured_axis_is_rejected() {
        let (mut backend, _) = SimulationBackend::new();
        assert_eq!(
            backend.read_position(AxisId::X),
            Err(BackendError::NotOpen)
        );
        backend.open().unwrap();
        assert_eq!(
            backend.read_position(AxisId::Y),
            Err(BackendError::NotConfigured(AxisId::Y))
        );
    }

    #[test]
    fn advance_moves_every_axis() {
        let (mut backend, handle) = SimulationBackend::new();
        backend.open().unwrap();
        for axis in [AxisId::X, AxisId::Y] {
            backend
                .configure_axis(&AxisConfig::new(axis, MotorKind::Stepping))
                .unwrap();
            backend.move_absolute(axis, 10.0, 50.0).unwrap();
        }
        for _ in 0..200 {
            backend.advance(Duration::from_millis(10));
        }
        assert_eq!(handle.position(AxisId::X), Some(10.0));
        assert_eq!(handle.position(AxisId::Y), Some(10.0));
        assert_eq!(handle.motion_commands(AxisId::X), 1);
    }

    #[test]
    fn emergency_halts_motion() {
        let (mut backend, handle) = SimulationBackend::new();
        backend.open().unwrap();
        backend
            .configure_axis(&AxisConfig::new(AxisId::X, MotorKind::Stepping))
            .unwrap();
        handle.set_emergency(true);
        backend.move_absolute(AxisId::X, 10.0, 50.0).unwrap();
        backend.advance(Duration::from_millis(10));
        let status = backend.read_drive_status(AxisId::X).unwrap();
        assert!(status.emergency);
        assert!(!status.busy);
        assert_eq!(handle.position(AxisId::X), Some(0.0));
    }
}
