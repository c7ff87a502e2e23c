//! Mecanum drive kinematics.
//!
//! Inverse kinematics mixes a body velocity into four wheel speeds, forward
//! kinematics recovers the body velocity from measured wheel speeds.

use crate::error::{ensure_finite, Result};
use crate::geometry::BodyVelocity;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DriveConfig {
    /// front to rear axle distance in meters
    pub wheelbase: f32,
    /// left to right wheel distance in meters
    pub track_width: f32,
    pub wheel_radius: f32,
    /// m/s
    pub max_linear_speed: f32,
    /// rad/s
    pub max_angular_speed: f32,
    /// wheel rad/s
    pub max_wheel_speed: f32,
}

impl Default for DriveConfig {
    fn default() -> Self {
        DriveConfig {
            wheelbase: 0.22,
            track_width: 0.195,
            wheel_radius: 0.04825,
            max_linear_speed: 0.3,
            max_angular_speed: 1.0,
            max_wheel_speed: 15.0,
        }
    }
}

/// Wheel angular speeds in rad/s, positive drives the robot forward.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WheelCommand {
    pub front_left: f32,
    pub front_right: f32,
    pub rear_left: f32,
    pub rear_right: f32,
}

impl WheelCommand {
    pub fn new(front_left: f32, front_right: f32, rear_left: f32, rear_right: f32) -> Self {
        WheelCommand {
            front_left,
            front_right,
            rear_left,
            rear_right,
        }
    }

    pub fn stop() -> Self {
        WheelCommand::default()
    }

    pub fn as_array(&self) -> [f32; 4] {
        [
            self.front_left,
            self.front_right,
            self.rear_left,
            self.rear_right,
        ]
    }

    pub fn max_abs(&self) -> f32 {
        self.as_array()
            .iter()
            .fold(0.0_f32, |max, speed| max.max(speed.abs()))
    }

    fn scaled(&self, factor: f32) -> Self {
        WheelCommand::new(
            self.front_left * factor,
            self.front_right * factor,
            self.rear_left * factor,
            self.rear_right * factor,
        )
    }
}

#[derive(Debug, Clone)]
pub struct MecanumKinematics {
    config: DriveConfig,
}

impl MecanumKinematics {
    pub fn new(config: DriveConfig) -> Self {
        MecanumKinematics { config }
    }

    pub fn config(&self) -> &DriveConfig {
        &self.config
    }

    /// half wheelbase plus half track
    fn lever_arm(&self) -> f32 {
        (self.config.wheelbase + self.config.track_width) / 2.0
    }

    /// Mixes a body velocity into wheel speeds.
    ///
    /// Linear speed and yaw rate are clamped to the configured maxima first.
    /// When a wheel would still exceed its rated speed all four wheels are
    /// scaled down by the same factor so the turning radius is unchanged.
    pub fn to_wheel_command(
        &self,
        linear_x: f32,
        linear_y: f32,
        angular_z: f32,
    ) -> Result<WheelCommand> {
        let mut linear_x = ensure_finite("linear_x", linear_x)?;
        let mut linear_y = ensure_finite("linear_y", linear_y)?;
        let angular_z = ensure_finite("angular_z", angular_z)?.clamp(
            -self.config.max_angular_speed,
            self.config.max_angular_speed,
        );

        let linear_speed = (linear_x.powi(2) + linear_y.powi(2)).sqrt();
        if linear_speed > self.config.max_linear_speed {
            let factor = self.config.max_linear_speed / linear_speed;
            linear_x *= factor;
            linear_y *= factor;
        }

        let rotation = self.lever_arm() * angular_z;
        let radius = self.config.wheel_radius;
        let command = WheelCommand::new(
            (linear_x - linear_y - rotation) / radius,
            (linear_x + linear_y + rotation) / radius,
            (linear_x + linear_y - rotation) / radius,
            (linear_x - linear_y + rotation) / radius,
        );

        let peak = command.max_abs();
        if peak > self.config.max_wheel_speed {
            let factor = self.config.max_wheel_speed / peak;
            tracing::trace!("wheel speed {:.2} over limit, scaling by {:.3}", peak, factor);
            Ok(command.scaled(factor))
        } else {
            Ok(command)
        }
    }

    pub fn velocity_to_wheel_command(&self, velocity: &BodyVelocity) -> Result<WheelCommand> {
        self.to_wheel_command(velocity.linear_x, velocity.linear_y, velocity.angular_z)
    }

    /// Recovers body velocity from wheel speeds
    pub fn to_body_velocity(&self, wheels: &WheelCommand) -> Result<BodyVelocity> {
        let front_left = ensure_finite("front_left", wheels.front_left)?;
        let front_right = ensure_finite("front_right", wheels.front_right)?;
        let rear_left = ensure_finite("rear_left", wheels.rear_left)?;
        let rear_right = ensure_finite("rear_right", wheels.rear_right)?;
        let quarter_radius = self.config.wheel_radius / 4.0;
        Ok(BodyVelocity::new(
            quarter_radius * (front_left + front_right + rear_left + rear_right),
            quarter_radius * (-front_left + front_right + rear_left - rear_right),
            quarter_radius * (-front_left + front_right - rear_left + rear_right)
                / self.lever_arm(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ControllerError;
    use approx::assert_relative_eq;

    fn kinematics() -> MecanumKinematics {
        MecanumKinematics::new(DriveConfig::default())
    }

    #[test]
    fn forward_motion_spins_all_wheels_equally() {
        let command = kinematics().to_wheel_command(0.2, 0.0, 0.0).unwrap();
        let expected = 0.2 / 0.04825;
        for speed in command.as_array() {
            assert_relative_eq!(speed, expected, epsilon = 1e-4);
        }
    }

    #[test]
    fn strafe_left_uses_diagonal_pairs() {
        let command = kinematics().to_wheel_command(0.0, 0.1, 0.0).unwrap();
        assert!(command.front_left < 0.0);
        assert!(command.rear_right < 0.0);
        assert!(command.front_right > 0.0);
        assert!(command.rear_left > 0.0);
    }

    #[test]
    fn round_trip_within_bounds() {
        let kinematics = kinematics();
        let samples = [
            (0.0, 0.0, 0.0),
            (0.3, 0.0, 0.0),
            (-0.15, 0.2, 0.0),
            (0.1, -0.1, 0.8),
            (0.0, 0.0, -1.0),
            (0.2, 0.2, 1.0),
        ];
        for (x, y, z) in samples {
            let command = kinematics.to_wheel_command(x, y, z).unwrap();
            let velocity = kinematics.to_body_velocity(&command).unwrap();
            assert_relative_eq!(velocity.linear_x, x, epsilon = 1e-4);
            assert_relative_eq!(velocity.linear_y, y, epsilon = 1e-4);
            assert_relative_eq!(velocity.angular_z, z, epsilon = 1e-4);
        }
    }

    #[test]
    fn inputs_are_clamped_before_mixing() {
        let kinematics = kinematics();
        let command = kinematics.to_wheel_command(3.0, 4.0, 5.0).unwrap();
        let velocity = kinematics.to_body_velocity(&command).unwrap();
        let linear = (velocity.linear_x.powi(2) + velocity.linear_y.powi(2)).sqrt();
        assert!(linear <= 0.3 + 1e-4);
        assert!(velocity.angular_z <= 1.0 + 1e-4);
    }

    #[test]
    fn overflow_scaling_preserves_wheel_ratios() {
        let config = DriveConfig {
            max_wheel_speed: 4.0,
            ..DriveConfig::default()
        };
        let limited = MecanumKinematics::new(config);
        let unlimited = kinematics();
        for (x, y, z) in [(0.3, 0.0, 0.5), (0.2, -0.2, -1.0), (0.05, 0.25, 0.7)] {
            let raw = unlimited.to_wheel_command(x, y, z).unwrap().as_array();
            let scaled = limited.to_wheel_command(x, y, z).unwrap().as_array();
            let max = scaled.iter().fold(0.0_f32, |m, s| m.max(s.abs()));
            assert_relative_eq!(max, 4.0, epsilon = 1e-4);
            let factor = scaled[0] / raw[0];
            for (before, after) in raw.iter().zip(scaled.iter()) {
                assert_relative_eq!(after / before, factor, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn rejects_non_finite_input() {
        let kinematics = kinematics();
        assert!(matches!(
            kinematics.to_wheel_command(f32::NAN, 0.0, 0.0),
            Err(ControllerError::InvalidCommand(_))
        ));
        assert!(matches!(
            kinematics.to_wheel_command(0.0, 0.0, f32::INFINITY),
            Err(ControllerError::InvalidCommand(_))
        ));
        let wheels = WheelCommand::new(1.0, f32::NAN, 1.0, 1.0);
        assert!(matches!(
            kinematics.to_body_velocity(&wheels),
            Err(ControllerError::InvalidCommand(_))
        ));
    }
}
