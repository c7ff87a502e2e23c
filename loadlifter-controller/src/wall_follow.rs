//! Range based wall following and corridor centring.
//!
//! Distances are read from the local obstacle map in the robot frame. One
//! follower drives forward along a wall (or between two) until something
//! shows up ahead, or until the opposite side opens when asked to watch it.

use crate::geometry::{BodyVelocity, Pose2D};
use crate::obstacle_map::{LocalObstacleMap, Region};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct WallFollowConfig {
    /// distance from the robot center to the followed wall, meters
    pub wall_distance: f32,
    /// stop once something is this close ahead of the robot center
    pub front_stop: f32,
    /// m/s
    pub forward_speed: f32,
    /// rad/s per meter of distance error
    pub kp_distance: f32,
    /// rad/s per meter the wall ahead is farther than the wall behind
    pub kp_orientation: f32,
    /// rad/s per meter the two side walls differ when centring
    pub kp_center: f32,
    /// rad/s
    pub max_turn_rate: f32,
    /// smallest correction once outside the tolerance, rad/s
    pub min_turn_rate: f32,
    /// distance errors within this are ignored, meters
    pub tolerance: f32,
    /// closer than `wall_distance - guard_margin` turns away at once
    pub guard_margin: f32,
    /// rad/s per meter inside the guard
    pub guard_gain: f32,
    /// forward speed never drops below this share while correcting
    pub min_forward_fraction: f32,
    /// distance error at which forward speed is lowest, meters
    pub slowdown_error: f32,
    /// how far to look for walls, meters
    pub sensing_radius: f32,
    /// half length of the side window measuring wall distance
    pub side_window: f32,
    /// offset of the windows ahead and behind that measure wall orientation
    pub orientation_offset: f32,
    /// half length of those orientation windows
    pub orientation_window: f32,
    /// half width of the corridor ahead checked for a front stop
    pub front_half_width: f32,
    /// a side counts as open beyond this distance
    pub open_side_distance: f32,
    /// after a side opened, it has to close to this before it counts again
    pub rearm_distance: f32,
}

impl Default for WallFollowConfig {
    fn default() -> Self {
        WallFollowConfig {
            wall_distance: 0.25,
            front_stop: 0.35,
            forward_speed: 0.15,
            kp_distance: 4.0,
            kp_orientation: 6.0,
            kp_center: 2.0,
            max_turn_rate: 0.8,
            min_turn_rate: 0.1,
            tolerance: 0.01,
            guard_margin: 0.05,
            guard_gain: 2.0,
            min_forward_fraction: 0.3,
            slowdown_error: 0.15,
            sensing_radius: 1.0,
            side_window: 0.15,
            orientation_offset: 0.1,
            orientation_window: 0.03,
            front_half_width: 0.15,
            open_side_distance: 0.6,
            rearm_distance: 0.45,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WallSide {
    Left,
    Right,
}

impl WallSide {
    pub fn opposite(&self) -> WallSide {
        match self {
            WallSide::Left => WallSide::Right,
            WallSide::Right => WallSide::Left,
        }
    }

    /// +1 for left (positive body y), -1 for right
    fn sign(&self) -> f32 {
        match self {
            WallSide::Left => 1.0,
            WallSide::Right => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FollowMode {
    Wall(WallSide),
    /// stay halfway between the left and right walls
    Center,
}

/// Why a follower stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FollowEvent {
    FrontStop,
    SideOpen,
}

/// Wall distances around the robot, meters from its center.
/// Nothing in range reads as `sensing_radius`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WallReadings {
    pub front: f32,
    pub left: f32,
    pub right: f32,
    pub left_ahead: f32,
    pub left_behind: f32,
    pub right_ahead: f32,
    pub right_behind: f32,
}

impl WallReadings {
    /// Every direction open
    pub fn open(range: f32) -> Self {
        WallReadings {
            front: range,
            left: range,
            right: range,
            left_ahead: range,
            left_behind: range,
            right_ahead: range,
            right_behind: range,
        }
    }

    pub fn from_map(pose: &Pose2D, map: &LocalObstacleMap, config: &WallFollowConfig) -> Self {
        let points: Vec<(f32, f32)> = map
            .query(&Region::around(pose, config.sensing_radius))
            .iter()
            .map(|cell| pose.world_to_body(cell.x - pose.x, cell.y - pose.y))
            .collect();
        WallReadings::from_points(&points, config)
    }

    /// `points` are obstacle positions in the robot frame
    pub fn from_points(points: &[(f32, f32)], config: &WallFollowConfig) -> Self {
        let range = config.sensing_radius;
        let front = points
            .iter()
            .filter(|(x, y)| *x > 0.0 && y.abs() <= config.front_half_width)
            .map(|(x, _)| *x)
            .fold(range, f32::min);
        let side = |sign: f32, center: f32, half_length: f32| {
            points
                .iter()
                .filter(|(x, y)| sign * y > 0.0 && (x - center).abs() <= half_length)
                .map(|(_, y)| sign * y)
                .fold(range, f32::min)
        };
        let offset = config.orientation_offset;
        let window = config.orientation_window;
        WallReadings {
            front,
            left: side(1.0, 0.0, config.side_window),
            right: side(-1.0, 0.0, config.side_window),
            left_ahead: side(1.0, offset, window),
            left_behind: side(1.0, -offset, window),
            right_ahead: side(-1.0, offset, window),
            right_behind: side(-1.0, -offset, window),
        }
    }

    pub fn side(&self, side: WallSide) -> f32 {
        match side {
            WallSide::Left => self.left,
            WallSide::Right => self.right,
        }
    }

    /// Positive when the wall on `side` recedes ahead of the robot
    fn divergence(&self, side: WallSide) -> f32 {
        match side {
            WallSide::Left => self.left_ahead - self.left_behind,
            WallSide::Right => self.right_ahead - self.right_behind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FollowStep {
    Drive(BodyVelocity),
    Done(FollowEvent),
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct OpenSideWatch {
    side: WallSide,
    armed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WallFollower {
    config: WallFollowConfig,
    mode: FollowMode,
    front_stop: f32,
    watch: Option<OpenSideWatch>,
}

impl WallFollower {
    pub fn new(config: WallFollowConfig, mode: FollowMode) -> Self {
        WallFollower {
            front_stop: config.front_stop,
            config,
            mode,
            watch: None,
        }
    }

    pub fn with_front_stop(mut self, distance: f32) -> Self {
        self.front_stop = distance;
        self
    }

    /// Also stop when the side opposite the followed wall opens up. With
    /// `require_rearm` that side has to be seen closed first.
    pub fn until_side_opens(mut self, require_rearm: bool) -> Self {
        let side = match self.mode {
            FollowMode::Wall(side) => side.opposite(),
            FollowMode::Center => WallSide::Right,
        };
        self.watch = Some(OpenSideWatch {
            side,
            armed: !require_rearm,
        });
        self
    }

    pub fn mode(&self) -> FollowMode {
        self.mode
    }

    pub fn tick(&mut self, readings: &WallReadings) -> FollowStep {
        if readings.front <= self.front_stop {
            tracing::info!(
                "Front stop at {:.2}m (limit {:.2}m)",
                readings.front,
                self.front_stop
            );
            return FollowStep::Done(FollowEvent::FrontStop);
        }
        if let Some(watch) = self.watch.as_mut() {
            let distance = readings.side(watch.side);
            if !watch.armed && distance < self.config.rearm_distance {
                tracing::debug!(
                    "{:?} side closed at {:.2}m, watching for an opening",
                    watch.side,
                    distance
                );
                watch.armed = true;
            }
            if watch.armed && distance >= self.config.open_side_distance {
                tracing::info!("{:?} side open at {:.2}m", watch.side, distance);
                return FollowStep::Done(FollowEvent::SideOpen);
            }
        }
        let velocity = match self.mode {
            FollowMode::Wall(side) => self.follow(side, readings),
            FollowMode::Center => self.center(readings),
        };
        FollowStep::Drive(velocity)
    }

    fn follow(&self, side: WallSide, readings: &WallReadings) -> BodyVelocity {
        let config = &self.config;
        let distance = readings.side(side);
        let error = distance - config.wall_distance;

        // turning toward the wall is positive for the left side
        let correction = if error.abs() <= config.tolerance {
            0.0
        } else {
            (error.abs() * config.kp_distance).clamp(config.min_turn_rate, config.max_turn_rate)
                * error.signum()
        };
        let alignment = readings.divergence(side) * config.kp_orientation;
        let mut turn = side.sign()
            * (correction + alignment).clamp(-config.max_turn_rate, config.max_turn_rate);

        if distance < config.wall_distance - config.guard_margin {
            let push = ((config.wall_distance - distance) * config.guard_gain)
                .clamp(config.min_turn_rate, config.max_turn_rate);
            turn = -side.sign() * push;
        }

        let slowdown = 0.7 * error.abs().min(config.slowdown_error) / config.slowdown_error;
        let forward = config.forward_speed * (1.0 - slowdown).max(config.min_forward_fraction);
        BodyVelocity::new(forward, 0.0, turn)
    }

    /// Steers toward the wider side, damped by the same wall alignment
    /// term as following
    fn center(&self, readings: &WallReadings) -> BodyVelocity {
        let config = &self.config;
        let difference = readings.left - readings.right;
        let correction = if difference.abs() <= config.tolerance {
            0.0
        } else {
            difference * config.kp_center
        };
        let alignment = 0.5
            * (readings.divergence(WallSide::Left) - readings.divergence(WallSide::Right))
            * config.kp_orientation;
        let turn = (correction + alignment).clamp(-config.max_turn_rate, config.max_turn_rate);
        BodyVelocity::new(config.forward_speed, 0.0, turn)
    }
}
