//! Command line parsing for simulated scenarios.

use loadlifter_controller::{
    geometry::Pose2D,
    simulation::{CircleObstacle, WallSegment},
    wall_follow::{FollowMode, WallSide},
};
use nalgebra as na;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ScenarioError {
    #[error("expected {expected} comma separated numbers, got {got:?}")]
    WrongCount { expected: usize, got: String },
    #[error("{0:?} is not a finite number")]
    NotANumber(String),
    #[error("obstacle radius must be positive, got {0}")]
    BadRadius(f32),
    #[error("wall needs two different end points")]
    ZeroLengthWall,
    #[error("expected a positive number of seconds, got {0:?}")]
    NotPositive(String),
    #[error("unknown follow mode {0:?}, expected left, right or center")]
    UnknownMode(String),
}

fn parse_numbers<const N: usize>(text: &str) -> Result<[f32; N], ScenarioError> {
    let parts: Vec<&str> = text.split(',').map(str::trim).collect();
    if parts.len() != N {
        return Err(ScenarioError::WrongCount {
            expected: N,
            got: text.to_owned(),
        });
    }
    let mut numbers = [0.0; N];
    for (number, part) in numbers.iter_mut().zip(parts) {
        *number = part
            .parse::<f32>()
            .ok()
            .filter(|value| value.is_finite())
            .ok_or_else(|| ScenarioError::NotANumber(part.to_owned()))?;
    }
    Ok(numbers)
}

/// `x,y,heading` with the heading in degrees
pub fn parse_pose(text: &str) -> Result<Pose2D, ScenarioError> {
    let [x, y, heading] = parse_numbers(text)?;
    Ok(Pose2D::from_degrees(x, y, heading))
}

/// `x,y,radius` in meters
pub fn parse_obstacle(text: &str) -> Result<CircleObstacle, ScenarioError> {
    let [x, y, radius] = parse_numbers(text)?;
    if radius <= 0.0 {
        return Err(ScenarioError::BadRadius(radius));
    }
    Ok(CircleObstacle::new(x, y, radius))
}

/// `x1,y1,x2,y2` in meters
pub fn parse_wall(text: &str) -> Result<WallSegment, ScenarioError> {
    let [x1, y1, x2, y2] = parse_numbers(text)?;
    if x1 == x2 && y1 == y2 {
        return Err(ScenarioError::ZeroLengthWall);
    }
    Ok(WallSegment::new((x1, y1), (x2, y2)))
}

/// Finite and above zero
pub fn parse_seconds(text: &str) -> Result<f64, ScenarioError> {
    text.trim()
        .parse::<f64>()
        .ok()
        .filter(|seconds| seconds.is_finite() && *seconds > 0.0)
        .ok_or_else(|| ScenarioError::NotPositive(text.to_owned()))
}

pub fn parse_follow_mode(text: &str) -> Result<FollowMode, ScenarioError> {
    match text.trim().to_lowercase().as_str() {
        "left" => Ok(FollowMode::Wall(WallSide::Left)),
        "right" => Ok(FollowMode::Wall(WallSide::Right)),
        "center" | "centre" => Ok(FollowMode::Center),
        _ => Err(ScenarioError::UnknownMode(text.to_owned())),
    }
}

/// `x,y,z` in meters
pub fn parse_point(text: &str) -> Result<na::Vector3<f32>, ScenarioError> {
    let [x, y, z] = parse_numbers(text)?;
    Ok(na::Vector3::new(x, y, z))
}
