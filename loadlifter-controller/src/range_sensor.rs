//! Range sensor adapter.
//!
//! The scanner reports angles in its own convention (0 deg to the right,
//! 180 deg to the left, 270 deg straight ahead, growing clockwise) and
//! distances in millimeters from the sensor head. Everything downstream
//! works with robot-centered polar points: radians, counter-clockwise from
//! the forward axis, meters.

use crate::geometry::normalize_angle;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RangeSensorConfig {
    /// Raw angle (degrees) that points along the robot's forward axis
    pub forward_angle_deg: f32,
    /// Raw angles grow clockwise when seen from above
    pub clockwise: bool,
    /// Sensor head position relative to the robot center, meters
    pub mount_x: f32,
    pub mount_y: f32,
    /// Readings closer than this are the robot itself or noise
    pub min_range: f32,
    pub max_range: f32,
    /// Hard cap on points kept from a single scan
    pub max_points: usize,
}

impl Default for RangeSensorConfig {
    fn default() -> Self {
        RangeSensorConfig {
            forward_angle_deg: 270.0,
            clockwise: true,
            mount_x: 0.042,
            mount_y: 0.0,
            min_range: 0.05,
            max_range: 8.0,
            max_points: 1440,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPoint {
    pub angle_deg: f32,
    pub distance_mm: f32,
    pub intensity: u8,
}

impl RawPoint {
    pub fn new(angle_deg: f32, distance_mm: f32, intensity: u8) -> Self {
        RawPoint {
            angle_deg,
            distance_mm,
            intensity,
        }
    }
}

/// One full revolution as delivered by the driver
#[derive(Debug, Clone, PartialEq)]
pub struct RawScan {
    /// seconds on the controller clock
    pub timestamp: f64,
    pub points: Vec<RawPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangePoint {
    /// radians, robot frame, counter-clockwise from forward
    pub angle: f32,
    /// meters from the robot center
    pub distance: f32,
    pub timestamp: f64,
}

impl RangePoint {
    /// Position of the point in the robot frame
    pub fn to_cartesian(&self) -> (f32, f32) {
        let (sin, cos) = self.angle.sin_cos();
        (self.distance * cos, self.distance * sin)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RangeScan {
    pub timestamp: f64,
    /// ordered by angle
    pub points: Vec<RangePoint>,
}

impl RangeScan {
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }
}

pub struct RangeSensorAdapter {
    config: RangeSensorConfig,
}

impl RangeSensorAdapter {
    pub fn new(config: RangeSensorConfig) -> Self {
        RangeSensorAdapter { config }
    }

    /// Converts a raw angle into a robot frame angle in radians
    fn robot_angle(&self, angle_deg: f32) -> f32 {
        let relative = if self.config.clockwise {
            self.config.forward_angle_deg - angle_deg
        } else {
            angle_deg - self.config.forward_angle_deg
        };
        normalize_angle(relative.to_radians())
    }

    pub fn normalize(&self, raw: &RawScan) -> RangeScan {
        let mut points: Vec<RangePoint> = raw
            .points
            .iter()
            .filter(|point| point.angle_deg.is_finite() && point.distance_mm.is_finite())
            .filter_map(|point| {
                let range = point.distance_mm / 1000.0;
                if range < self.config.min_range || range > self.config.max_range {
                    return None;
                }
                let (sin, cos) = self.robot_angle(point.angle_deg).sin_cos();
                let x = self.config.mount_x + range * cos;
                let y = self.config.mount_y + range * sin;
                Some(RangePoint {
                    angle: y.atan2(x),
                    distance: (x * x + y * y).sqrt(),
                    timestamp: raw.timestamp,
                })
            })
            .collect();

        points.sort_by(|a, b| a.angle.total_cmp(&b.angle));
        if points.len() > self.config.max_points {
            tracing::debug!(
                "Scan has {} points, keeping {}",
                points.len(),
                self.config.max_points
            );
            let stride = points.len() as f32 / self.config.max_points as f32;
            points = (0..self.config.max_points)
                .map(|i| points[(i as f32 * stride) as usize])
                .collect();
        }

        RangeScan {
            timestamp: raw.timestamp,
            points,
        }
    }
}
