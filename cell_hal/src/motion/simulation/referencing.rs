//! Home switch search for the simulated axes.
//!
//! The switch sits at physical position 0. A search runs in three phases:
//! fast approach until the switch is hit, back off until it is released,
//! then a slow re-approach that defines the reference edge.

use cell_common::axis::HomingDirection;
use tracing::{debug, trace};

/// Switch detection band around physical 0.
pub const SWITCH_HYSTERESIS: f64 = 0.5;

/// Distance from the switch that counts as released.
const RELEASE_DISTANCE: f64 = 1.0;

/// Re-approach speed as a fraction of the search speed.
const CREEP_FACTOR: f64 = 0.25;

/// Travel after which the search gives up.
const MAX_SEARCH_TRAVEL: f64 = 2_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferencingState {
    Idle,
    Searching,
    BackingOff,
    Approaching,
    Referenced,
    Failed,
}

/// Referencing state machine for one axis.
#[derive(Debug, Clone)]
pub struct Referencing {
    state: ReferencingState,
    /// +1 towards the positive end, -1 towards the negative end.
    direction: f64,
    speed: f64,
    travelled: f64,
}

impl Default for Referencing {
    fn default() -> Self {
        Self {
            state: ReferencingState::Idle,
            direction: -1.0,
            speed: 0.0,
            travelled: 0.0,
        }
    }
}

/// True when `position` lies on the switch.
#[inline]
pub fn on_switch(position: f64) -> bool {
    position.abs() <= SWITCH_HYSTERESIS
}

/// Search direction sign for a homing direction.
#[inline]
pub fn direction_sign(direction: HomingDirection) -> f64 {
    match direction {
        HomingDirection::Cw => 1.0,
        HomingDirection::Ccw => -1.0,
    }
}

impl Referencing {
    pub fn start(&mut self, direction: HomingDirection, speed: f64) {
        self.direction = direction_sign(direction);
        self.speed = speed;
        self.travelled = 0.0;
        self.state = ReferencingState::Searching;
        debug!(direction = self.direction, speed, "referencing started");
    }

    #[inline]
    pub fn state(&self) -> ReferencingState {
        self.state
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            ReferencingState::Searching | ReferencingState::BackingOff | ReferencingState::Approaching
        )
    }

    /// Velocity the axis should run at in the current phase.
    pub fn velocity(&self) -> f64 {
        match self.state {
            ReferencingState::Searching => self.direction * self.speed,
            ReferencingState::BackingOff => -self.direction * self.speed,
            ReferencingState::Approaching => self.direction * self.speed * CREEP_FACTOR,
            _ => 0.0,
        }
    }

    /// Feed the position reached after a step of `step` mm.
    ///
    /// Returns `true` once the search has finished, successfully or not.
    pub fn update(&mut self, position: f64, step: f64) -> bool {
        if !self.is_active() {
            return false;
        }
        self.travelled += step.abs();
        if self.travelled > MAX_SEARCH_TRAVEL {
            debug!(travelled = self.travelled, "referencing failed, switch not found");
            self.state = ReferencingState::Failed;
            return true;
        }

        match self.state {
            ReferencingState::Searching if self.reached(position) => {
                trace!(position, "switch hit");
                self.state = ReferencingState::BackingOff;
            }
            ReferencingState::BackingOff if (position).abs() > RELEASE_DISTANCE => {
                trace!(position, "switch released");
                self.state = ReferencingState::Approaching;
            }
            ReferencingState::Approaching if self.reached(position) => {
                debug!(position, "reference edge found");
                self.state = ReferencingState::Referenced;
                return true;
            }
            _ => {}
        }
        false
    }

    /// Switch reached while travelling in the search direction.
    fn reached(&self, position: f64) -> bool {
        if self.direction > 0.0 {
            position >= -SWITCH_HYSTERESIS
        } else {
            position <= SWITCH_HYSTERESIS
        }
    }

    pub fn reset(&mut self) {
        self.state = ReferencingState::Idle;
        self.travelled = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_phase_search() {
        let mut sm = Referencing::default();
        sm.start(HomingDirection::Ccw, 10.0);
        assert_eq!(sm.state(), ReferencingState::Searching);
        assert_eq!(sm.velocity(), -10.0);

        assert!(!sm.update(3.0, 0.1));
        assert!(!sm.update(0.4, 0.1));
        assert_eq!(sm.state(), ReferencingState::BackingOff);
        assert_eq!(sm.velocity(), 10.0);

        assert!(!sm.update(1.2, 0.1));
        assert_eq!(sm.state(), ReferencingState::Approaching);
        assert_eq!(sm.velocity(), -2.5);

        assert!(sm.update(0.5, 0.1));
        assert_eq!(sm.state(), ReferencingState::Referenced);
        assert!(!sm.is_active());
    }

    #[test]
    fn test_positive_direction_detection() {
        let mut sm = Referencing::default();
        sm.start(HomingDirection::Cw, 10.0);
        assert!(!sm.update(-3.0, 0.1));
        assert!(!sm.update(-0.4, 0.1));
        assert_eq!(sm.state(), ReferencingState::BackingOff);
    }

    #[test]
    fn test_gives_up_after_max_travel() {
        let mut sm = Referencing::default();
        sm.start(HomingDirection::Ccw, 10.0);
        // Never reaches the switch.
        let mut done = false;
        for _ in 0..3_000 {
            if sm.update(100.0, 1.0) {
                done = true;
                break;
            }
        }
        assert!(done);
        assert_eq!(sm.state(), ReferencingState::Failed);
    }

    #[test]
    fn test_reset() {
        let mut sm = Referencing::default();
        sm.start(HomingDirection::Ccw, 10.0);
        sm.reset();
        assert!(!sm.is_active());
        assert_eq!(sm.velocity(), 0.0);
    }
}
