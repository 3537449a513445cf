//! Axis physics for the simulation backend.
//!
//! Each axis integrates a trapezoidal velocity profile: accelerate at
//! `max_accel`, cruise at the commanded speed and brake at `max_decel` so
//! that it stops on the target. Soft limits act like the pulse generator's
//! limit registers and halt the axis where it stands.

use cell_common::axis::{AxisConfig, HomingDirection, JogDirection, MotorKind};
use std::time::Duration;
use tracing::{debug, trace};

use super::referencing::{Referencing, ReferencingState, direction_sign, on_switch};
use crate::motion::backend::{AxisOutput, DriveStatus};

/// Distance from the switch at power-on, opposite to the homing direction.
pub const POWER_ON_DISTANCE: f64 = 5.0;

const VELOCITY_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Command {
    Idle,
    /// Physical target and cruise speed.
    Target { target: f64, speed: f64 },
    Jog { direction: f64, speed: f64 },
    Stopping,
}

/// Simulated axis.
#[derive(Debug, Clone)]
pub struct AxisSimulator {
    config: AxisConfig,
    /// Position relative to the home switch.
    physical: f64,
    /// Logical coordinate = physical + offset.
    offset: f64,
    velocity: f64,
    command: Command,
    limits: Option<(f64, f64)>,
    referencing: Referencing,
    outputs: [bool; 3],
    alarm_code: u16,
    emergency: bool,
    /// Motion commands accepted since power-on.
    commands: u64,
    /// Times the soft limits were switched off.
    limit_releases: u64,
}

impl AxisSimulator {
    pub fn new(config: AxisConfig) -> Self {
        let physical = -direction_sign(config.homing_direction) * POWER_ON_DISTANCE;
        Self {
            limits: Some((config.limit_minus, config.limit_plus)),
            config,
            physical,
            offset: -physical,
            velocity: 0.0,
            command: Command::Idle,
            referencing: Referencing::default(),
            outputs: [false; 3],
            alarm_code: 0,
            emergency: false,
            commands: 0,
            limit_releases: 0,
        }
    }

    #[inline]
    pub fn position(&self) -> f64 {
        self.physical + self.offset
    }

    #[inline]
    pub fn physical_position(&self) -> f64 {
        self.physical
    }

    #[inline]
    pub fn velocity(&self) -> f64 {
        self.velocity
    }

    #[inline]
    pub fn commands(&self) -> u64 {
        self.commands
    }

    #[inline]
    pub fn output(&self, output: AxisOutput) -> bool {
        self.outputs[output as usize]
    }

    #[inline]
    pub fn alarm_code(&self) -> u16 {
        self.alarm_code
    }

    pub fn reconfigure(&mut self, config: AxisConfig) {
        self.limits = Some((config.limit_minus, config.limit_plus));
        self.config = config;
        self.offset = -self.physical;
    }

    fn halted(&self) -> bool {
        self.alarm_code != 0 || self.emergency
    }

    pub fn move_absolute(&mut self, position: f64, speed: f64) {
        self.commands += 1;
        if self.halted() {
            return;
        }
        self.command = Command::Target {
            target: position - self.offset,
            speed,
        };
    }

    pub fn move_relative(&mut self, distance: f64, speed: f64) {
        let base = match self.command {
            Command::Target { target, .. } => target + self.offset,
            _ => self.position(),
        };
        self.move_absolute(base + distance, speed);
    }

    pub fn jog(&mut self, direction: JogDirection, speed: f64) {
        self.commands += 1;
        if self.halted() {
            return;
        }
        self.command = Command::Jog {
            direction: direction.sign(),
            speed,
        };
    }

    pub fn stop(&mut self) {
        if self.referencing.is_active() {
            self.referencing.reset();
        }
        if self.command != Command::Idle || self.velocity.abs() > VELOCITY_EPSILON {
            self.command = Command::Stopping;
        }
    }

    pub fn home(&mut self, direction: HomingDirection, speed: f64) {
        self.commands += 1;
        if self.halted() {
            return;
        }
        self.command = Command::Idle;
        self.velocity = 0.0;
        self.referencing.start(direction, speed);
    }

    pub fn write_output(&mut self, output: AxisOutput, on: bool) {
        let was = self.outputs[output as usize];
        self.outputs[output as usize] = on;
        if on && !was {
            match output {
                AxisOutput::Clear => {
                    if self.alarm_code != 0 {
                        debug!(axis = %self.config.axis, "drive alarm cleared");
                    }
                    self.alarm_code = 0;
                }
                // The actuator runs its own search on the rising edge.
                AxisOutput::Homing if self.config.motor_kind == MotorKind::VendorActuator => {
                    let speed = self.config.origin_speed;
                    self.home(self.config.homing_direction, speed);
                }
                _ => {}
            }
        }
    }

    pub fn set_soft_limits(&mut self, limits: Option<(f64, f64)>) {
        if limits.is_none() {
            self.limit_releases += 1;
        }
        self.limits = limits;
    }

    #[inline]
    pub fn soft_limits(&self) -> Option<(f64, f64)> {
        self.limits
    }

    #[inline]
    pub fn limit_releases(&self) -> u64 {
        self.limit_releases
    }

    pub fn set_position(&mut self, position: f64) {
        self.offset = position - self.physical;
        if let Command::Target { .. } = self.command {
            self.command = Command::Stopping;
        }
    }

    pub fn inject_alarm(&mut self, code: u16) {
        self.alarm_code = code;
        if code != 0 {
            self.halt();
        }
    }

    pub fn set_emergency(&mut self, active: bool) {
        self.emergency = active;
        if active {
            self.halt();
        }
    }

    fn halt(&mut self) {
        self.referencing.reset();
        self.command = Command::Idle;
        self.velocity = 0.0;
    }

    pub fn drive_status(&self) -> DriveStatus {
        let busy = self.command != Command::Idle
            || self.referencing.is_active()
            || self.velocity.abs() > VELOCITY_EPSILON;
        DriveStatus {
            busy,
            in_position: !busy,
            alarm: self.alarm_code != 0,
            emergency: self.emergency,
            origin_sensor: self.config.sensor_logic.is_triggered(on_switch(self.physical)),
            homing: self.referencing.is_active(),
        }
    }

    /// Advance the model by one step.
    pub fn update(&mut self, dt: Duration) {
        let dt = dt.as_secs_f64();
        if dt <= 0.0 || self.halted() {
            return;
        }

        if self.referencing.is_active() {
            self.update_referencing(dt);
            return;
        }

        match self.command {
            Command::Idle => {}
            Command::Target { target, speed } => self.update_target(target, speed, dt),
            Command::Jog { direction, speed } => {
                self.ramp_towards(direction * speed, dt);
                self.physical += self.velocity * dt;
            }
            Command::Stopping => self.decelerate_to_stop(dt),
        }

        self.check_soft_limits();

        trace!(
            axis = %self.config.axis,
            position = self.position(),
            velocity = self.velocity,
            "axis step"
        );
    }

    fn update_referencing(&mut self, dt: f64) {
        self.velocity = self.referencing.velocity();
        let step = self.velocity * dt;
        self.physical += step;
        if self.referencing.update(self.physical, step) {
            self.velocity = 0.0;
            match self.referencing.state() {
                ReferencingState::Referenced => {
                    self.physical = 0.0;
                    self.offset = 0.0;
                    debug!(axis = %self.config.axis, "simulated referencing complete");
                }
                _ => {
                    debug!(axis = %self.config.axis, "simulated referencing failed");
                }
            }
            self.referencing.reset();
        }
    }

    fn update_target(&mut self, target: f64, speed: f64, dt: f64) {
        let error = target - self.physical;
        let decel = self.config.max_decel;
        let stopping_distance = self.velocity * self.velocity / (2.0 * decel);
        let desired = if error.abs() <= stopping_distance {
            error.signum() * (2.0 * decel * error.abs()).sqrt().min(speed)
        } else {
            error.signum() * speed
        };
        self.ramp_towards(desired, dt);

        let step = self.velocity * dt;
        if error.abs() <= VELOCITY_EPSILON || (step.signum() == error.signum() && step.abs() >= error.abs()) {
            self.physical = target;
            self.velocity = 0.0;
            self.command = Command::Idle;
        } else {
            self.physical += step;
        }
    }

    fn ramp_towards(&mut self, desired: f64, dt: f64) {
        let rate = if desired.abs() < self.velocity.abs() {
            self.config.max_decel
        } else {
            self.config.max_accel
        };
        let max_change = rate * dt;
        self.velocity += (desired - self.velocity).clamp(-max_change, max_change);
    }

    fn decelerate_to_stop(&mut self, dt: f64) {
        let change = self.config.max_decel * dt;
        if self.velocity.abs() <= change {
            self.velocity = 0.0;
            self.command = Command::Idle;
            return;
        }
        self.velocity -= self.velocity.signum() * change;
        self.physical += self.velocity * dt;
    }

    fn check_soft_limits(&mut self) {
        let Some((minus, plus)) = self.limits else {
            return;
        };
        let position = self.position();
        let clamped = position.clamp(minus, plus);
        if clamped != position {
            self.physical = clamped - self.offset;
            self.velocity = 0.0;
            self.command = Command::Idle;
            debug!(axis = %self.config.axis, position = clamped, "soft limit stop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cell_common::axis::AxisId;

    const DT: Duration = Duration::from_millis(10);

    fn stepping_axis() -> AxisConfig {
        let mut config = AxisConfig::new(AxisId::X, MotorKind::Stepping);
        config.max_speed = 100.0;
        config.max_accel = 500.0;
        config.max_decel = 500.0;
        config.limit_minus = -1.0;
        config.limit_plus = 300.0;
        config
    }

    fn run(sim: &mut AxisSimulator, steps: usize) {
        for _ in 0..steps {
            sim.update(DT);
        }
    }

    #[test]
    fn test_power_on_offset_from_switch() {
        let sim = AxisSimulator::new(stepping_axis());
        assert_eq!(sim.physical_position(), 5.0);
        assert_eq!(sim.position(), 0.0);
        assert!(!sim.drive_status().origin_sensor);
    }

    #[test]
    fn test_positioning_reaches_target() {
        let mut sim = AxisSimulator::new(stepping_axis());
        sim.move_absolute(100.0, 50.0);
        assert!(sim.drive_status().busy);

        sim.update(DT);
        assert!(sim.velocity() > 0.0);
        assert!(sim.velocity() <= 50.0);

        run(&mut sim, 400);
        assert_eq!(sim.position(), 100.0);
        assert!(!sim.drive_status().busy);
        assert!(sim.drive_status().in_position);
    }

    #[test]
    fn test_velocity_limit() {
        let mut sim = AxisSimulator::new(stepping_axis());
        sim.move_absolute(250.0, 40.0);
        for _ in 0..200 {
            sim.update(DT);
            assert!(sim.velocity().abs() <= 40.0 + 1e-9);
        }
    }

    #[test]
    fn test_jog_stops_at_soft_limit() {
        let mut sim = AxisSimulator::new(stepping_axis());
        sim.jog(JogDirection::Positive, 100.0);
        run(&mut sim, 1_000);
        assert_eq!(sim.position(), 300.0);
        assert!(!sim.drive_status().busy);
    }

    #[test]
    fn test_stop_decelerates() {
        let mut sim = AxisSimulator::new(stepping_axis());
        sim.jog(JogDirection::Positive, 100.0);
        run(&mut sim, 50);
        sim.stop();
        run(&mut sim, 30);
        assert_eq!(sim.velocity(), 0.0);
        assert!(!sim.drive_status().busy);
    }

    #[test]
    fn test_referencing_sets_logical_zero() {
        let mut sim = AxisSimulator::new(stepping_axis());
        sim.set_soft_limits(None);
        sim.home(HomingDirection::Ccw, 10.0);
        assert!(sim.drive_status().homing);
        run(&mut sim, 500);
        assert!(!sim.drive_status().busy);
        assert_eq!(sim.position(), 0.0);
        assert!(sim.drive_status().origin_sensor);
    }

    #[test]
    fn test_normally_closed_sensor_inverts() {
        let mut config = stepping_axis();
        config.sensor_logic = cell_common::axis::SensorLogic::NormallyClosed;
        let sim = AxisSimulator::new(config);
        assert!(sim.drive_status().origin_sensor);
    }

    #[test]
    fn test_actuator_homes_on_output_edge() {
        let mut config = stepping_axis();
        config.motor_kind = MotorKind::VendorActuator;
        let mut sim = AxisSimulator::new(config);
        sim.write_output(AxisOutput::Homing, true);
        assert!(sim.drive_status().homing);
        sim.write_output(AxisOutput::Homing, false);
        run(&mut sim, 500);
        assert_eq!(sim.position(), 0.0);
    }

    #[test]
    fn test_alarm_halts_and_clear_resets() {
        let mut sim = AxisSimulator::new(stepping_axis());
        sim.move_absolute(100.0, 50.0);
        run(&mut sim, 10);
        sim.inject_alarm(0x0400);
        let held = sim.position();
        run(&mut sim, 10);
        assert_eq!(sim.position(), held);
        assert!(sim.drive_status().alarm);

        sim.write_output(AxisOutput::Clear, true);
        assert_eq!(sim.alarm_code(), 0);
    }

    #[test]
    fn test_set_position_redefines_coordinate() {
        let mut sim = AxisSimulator::new(stepping_axis());
        sim.set_position(12.5);
        assert_eq!(sim.position(), 12.5);
        assert_eq!(sim.physical_position(), 5.0);
    }
}
