//! Wheel feedback odometry for the mecanum base.
//!
//! Dead-reckons the robot pose from realized wheel speeds. External
//! localization can replace the estimate at any time.

use crate::drive_kinematics::{MecanumKinematics, WheelCommand};
use crate::geometry::{normalize_angle, Pose2D};

/// Smallest integration step, used when the caller passes a non-positive delta
pub const MIN_DELTA_TIME: f32 = 1e-4;

pub struct OdometryEstimator {
    kinematics: MecanumKinematics,
    /// Current estimated pose
    pose: Pose2D,
}

impl OdometryEstimator {
    /// Create a new estimator
    ///
    /// # Arguments
    /// * `kinematics` - drive model used to turn wheel speeds into body velocity
    /// * `start_pose` - initial pose of the robot
    pub fn new(kinematics: MecanumKinematics, start_pose: Pose2D) -> Self {
        Self {
            kinematics,
            pose: start_pose,
        }
    }

    /// Integrate one feedback sample
    ///
    /// Heading is integrated first and the position step uses the new
    /// heading (first order Euler).
    ///
    /// # Arguments
    /// * `actual` - wheel speeds the motors actually achieved
    /// * `delta_time` - seconds since the previous sample
    ///
    /// # Returns
    /// The updated pose
    pub fn update(&mut self, actual: &WheelCommand, delta_time: f32) -> Pose2D {
        let delta_time = if delta_time.is_finite() && delta_time > 0.0 {
            delta_time
        } else {
            MIN_DELTA_TIME
        };

        let velocity = match self.kinematics.to_body_velocity(actual) {
            Ok(velocity) => velocity,
            Err(error) => {
                tracing::warn!("Ignoring wheel feedback: {}", error);
                return self.pose;
            }
        };

        if velocity.is_zero() {
            return self.pose;
        }

        let heading = normalize_angle(self.pose.heading + velocity.angular_z * delta_time);
        let (sin, cos) = heading.sin_cos();
        self.pose = Pose2D {
            x: self.pose.x + (velocity.linear_x * cos - velocity.linear_y * sin) * delta_time,
            y: self.pose.y + (velocity.linear_x * sin + velocity.linear_y * cos) * delta_time,
            heading,
        };
        self.pose
    }

    /// Replace the running estimate with an externally computed pose
    pub fn apply_correction(&mut self, pose: Pose2D) {
        if !pose.is_finite() {
            tracing::warn!("Rejected non finite pose correction {:?}", pose);
            return;
        }
        tracing::debug!("Pose corrected from {:?} to {:?}", self.pose, pose);
        self.pose = Pose2D::new(pose.x, pose.y, pose.heading);
    }

    /// Get the current pose
    pub fn pose(&self) -> Pose2D {
        self.pose
    }
}
