//! Servo bus capability for the arm.

use crate::drivers::DriverError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

type Result<T> = std::result::Result<T, DriverError>;

/// Joint angles in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct JointPositions {
    pub base: f32,
    pub shoulder: f32,
    pub elbow: f32,
    pub wrist: f32,
}

impl JointPositions {
    pub fn new(base: f32, shoulder: f32, elbow: f32, wrist: f32) -> JointPositions {
        JointPositions {
            base,
            shoulder,
            elbow,
            wrist,
        }
    }

    pub fn as_array(&self) -> [f32; 4] {
        [self.base, self.shoulder, self.elbow, self.wrist]
    }

    /// Largest single joint move between two poses
    pub fn max_difference(&self, other: &JointPositions) -> f32 {
        self.as_array()
            .iter()
            .zip(other.as_array().iter())
            .fold(0.0_f32, |max, (a, b)| max.max((a - b).abs()))
    }

    /// Linear interpolation, `t` of 0.0 is self and 1.0 is `target`
    pub fn lerp(&self, target: &JointPositions, t: f32) -> JointPositions {
        JointPositions::new(
            self.base + (target.base - self.base) * t,
            self.shoulder + (target.shoulder - self.shoulder) * t,
            self.elbow + (target.elbow - self.elbow) * t,
            self.wrist + (target.wrist - self.wrist) * t,
        )
    }

    pub fn is_finite(&self) -> bool {
        self.as_array().iter().all(|angle| angle.is_finite())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GripCommand {
    Open,
    Close,
}

impl GripCommand {
    /// Gripper closure for this command, 0.0 is fully open
    pub fn closure(&self) -> f32 {
        match self {
            GripCommand::Open => 0.0,
            GripCommand::Close => 1.0,
        }
    }
}

/// Maps gripper servo pulses onto a 0.0 (open) to 1.0 (closed) range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GripperCalibration {
    pub open_pulse: f32,
    pub closed_pulse: f32,
}

impl Default for GripperCalibration {
    fn default() -> Self {
        GripperCalibration {
            open_pulse: 32.0,
            closed_pulse: 607.0,
        }
    }
}

impl GripperCalibration {
    pub fn pulse_for(&self, closure: f32) -> f32 {
        let closure = closure.clamp(0.0, 1.0);
        self.open_pulse + (self.closed_pulse - self.open_pulse) * closure
    }

    pub fn closure_for(&self, pulse: f32) -> f32 {
        ((pulse - self.open_pulse) / (self.closed_pulse - self.open_pulse)).clamp(0.0, 1.0)
    }
}

#[async_trait]
pub trait ServoDriver: Send + Sync {
    /// Starts a move that should finish after `duration`. Returns once the
    /// command is on the bus, not when the move is done.
    async fn move_to_timed(&mut self, position: &JointPositions, duration: Duration) -> Result<()>;
    async fn read_position(&mut self) -> Result<JointPositions>;
    /// 0.0 is fully open
    /// 1.0 is fully closed
    async fn move_gripper(&mut self, closed: f32, duration: Duration) -> Result<()>;
    /// Measured gripper closure, same range as `move_gripper`
    async fn read_gripper(&mut self) -> Result<f32>;
    /// Stop and hold the current position
    async fn halt(&mut self) -> Result<()>;
    async fn limp(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn lerp_endpoints() {
        let start = JointPositions::new(0.0, 10.0, -20.0, 5.0);
        let end = JointPositions::new(40.0, 50.0, -100.0, -5.0);
        assert_eq!(start.lerp(&end, 0.0), start);
        assert_eq!(start.lerp(&end, 1.0), end);
        let middle = start.lerp(&end, 0.5);
        assert_relative_eq!(middle.elbow, -60.0);
    }

    #[test]
    fn max_difference_picks_largest_joint() {
        let start = JointPositions::new(0.0, 10.0, -20.0, 5.0);
        let end = JointPositions::new(40.0, 50.0, -100.0, -5.0);
        assert_relative_eq!(start.max_difference(&end), 80.0);
    }

    #[test]
    fn gripper_calibration() {
        let calibration = GripperCalibration::default();
        assert_relative_eq!(calibration.pulse_for(0.0), 32.0);
        assert_relative_eq!(calibration.pulse_for(1.0), 607.0);
        assert_relative_eq!(calibration.pulse_for(2.0), 607.0);
        // pulse the servo settles at when holding a box
        assert_relative_eq!(calibration.closure_for(422.0), 0.678, epsilon = 1e-3);
    }
}
