use crate::drivers::DriverError;
use crate::robot_config::ConfigError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("target is unreachable: {0}")]
    Unreachable(String),
    #[error("navigation blocked after {ticks} ticks without progress")]
    Blocked { ticks: u32 },
    #[error("{sensor} data is stale ({age_secs:.2}s without a new sample)")]
    SensorStale { sensor: &'static str, age_secs: f32 },
    #[error("no object detected in gripper after grasp")]
    GripVerificationFailed,
    #[error("could not return the arm to its carry pose: {0}")]
    RetractFailed(String),
    #[error("no trajectory planned")]
    NoTrajectory,
    #[error("motion aborted")]
    Aborted,
    #[error("failed when talking to hardware")]
    Driver(#[from] DriverError),
    #[error("error while loading configuration")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, ControllerError>;

/// Rejects NaN and infinite values at the command boundary
pub(crate) fn ensure_finite(name: &str, value: f32) -> Result<f32> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ControllerError::InvalidCommand(format!(
            "{} must be finite, got {}",
            name, value
        )))
    }
}
