//! Capability interfaces for the drive base hardware.
//!
//! The real motor controller, wheel encoders and range sensor live behind
//! adapters outside this crate. The control loop only ever asks for the
//! latest sample and never waits for a new one, so implementations must
//! return immediately (`None` when nothing new arrived since the last call).

use crate::drive_kinematics::WheelCommand;
use crate::range_sensor::RawScan;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("hardware bus error: {0}")]
    Bus(String),
    #[error("device not detected: {0}")]
    NotDetected(String),
    #[error("driver disconnected")]
    Disconnected,
}

/// Realized wheel speeds reported by the encoders.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WheelFeedbackSample {
    pub wheels: WheelCommand,
    /// seconds on the controller clock
    pub timestamp: f64,
}

pub trait RangeSensor: Send {
    /// Newest complete scan not yet handed out
    fn latest_scan(&mut self) -> Option<RawScan>;
}

pub trait WheelFeedback: Send {
    /// Newest encoder sample not yet handed out
    fn latest_feedback(&mut self) -> Option<WheelFeedbackSample>;
}

pub trait MotorDriver: Send {
    /// Queues a command for the motor controller. Must not block.
    fn write_command(&mut self, command: &WheelCommand) -> Result<(), DriverError>;
}
