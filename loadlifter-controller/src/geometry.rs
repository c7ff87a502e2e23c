//! Planar pose and velocity types shared by the drive, odometry and planner.

use serde::{Deserialize, Serialize};
use std::f32::consts::{PI, TAU};

/// Wraps an angle into (-pi, pi]
pub fn normalize_angle(angle: f32) -> f32 {
    let mut wrapped = angle % TAU;
    if wrapped <= -PI {
        wrapped += TAU;
    } else if wrapped > PI {
        wrapped -= TAU;
    }
    wrapped
}

/// Robot pose in the world frame.
///
/// Heading is in radians, counter-clockwise from the world x axis,
/// always kept in (-pi, pi].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose2D {
    pub x: f32,
    pub y: f32,
    pub heading: f32,
}

impl Pose2D {
    pub fn new(x: f32, y: f32, heading: f32) -> Pose2D {
        Pose2D {
            x,
            y,
            heading: normalize_angle(heading),
        }
    }

    pub fn from_degrees(x: f32, y: f32, heading_degrees: f32) -> Pose2D {
        Pose2D::new(x, y, heading_degrees.to_radians())
    }

    pub fn distance_to(&self, x: f32, y: f32) -> f32 {
        ((x - self.x).powi(2) + (y - self.y).powi(2)).sqrt()
    }

    /// World bearing from this pose to a point
    pub fn bearing_to(&self, x: f32, y: f32) -> f32 {
        (y - self.y).atan2(x - self.x)
    }

    /// Rotates a world frame vector into this pose's body frame
    pub fn world_to_body(&self, x: f32, y: f32) -> (f32, f32) {
        let (sin, cos) = self.heading.sin_cos();
        (x * cos + y * sin, -x * sin + y * cos)
    }

    /// Rotates a body frame vector into the world frame
    pub fn body_to_world(&self, x: f32, y: f32) -> (f32, f32) {
        let (sin, cos) = self.heading.sin_cos();
        (x * cos - y * sin, x * sin + y * cos)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.heading.is_finite()
    }
}

/// Body frame velocity: x forward, y to the left, z counter-clockwise.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BodyVelocity {
    /// m/s
    pub linear_x: f32,
    /// m/s
    pub linear_y: f32,
    /// rad/s
    pub angular_z: f32,
}

impl BodyVelocity {
    pub fn new(linear_x: f32, linear_y: f32, angular_z: f32) -> BodyVelocity {
        BodyVelocity {
            linear_x,
            linear_y,
            angular_z,
        }
    }

    pub fn zero() -> BodyVelocity {
        BodyVelocity::default()
    }

    pub fn is_zero(&self) -> bool {
        self.linear_x == 0.0 && self.linear_y == 0.0 && self.angular_z == 0.0
    }
}
