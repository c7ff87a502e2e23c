//! Deterministic stand-ins for the robot hardware.
//!
//! `SimulatedBase` keeps a ground truth pose that follows the last wheel
//! command and ray-casts circular obstacles and walls into scans in the range sensor's
//! native convention. Time only moves when `advance` is called, so tests and
//! the sim runner control it completely.

use crate::arm_driver::{GripperCalibration, JointPositions, ServoDriver};
use crate::drive_kinematics::{DriveConfig, MecanumKinematics, WheelCommand};
use crate::drivers::{DriverError, MotorDriver, RangeSensor, WheelFeedback, WheelFeedbackSample};
use crate::geometry::{normalize_angle, Pose2D};
use crate::range_sensor::{RangeSensorConfig, RawPoint, RawScan};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircleObstacle {
    pub x: f32,
    pub y: f32,
    pub radius: f32,
}

impl CircleObstacle {
    pub fn new(x: f32, y: f32, radius: f32) -> Self {
        CircleObstacle { x, y, radius }
    }

    /// Distance along a unit ray to the first intersection
    fn intersect(&self, origin: (f32, f32), direction: (f32, f32)) -> Option<f32> {
        let fx = origin.0 - self.x;
        let fy = origin.1 - self.y;
        let b = fx * direction.0 + fy * direction.1;
        let c = fx * fx + fy * fy - self.radius * self.radius;
        let discriminant = b * b - c;
        if discriminant < 0.0 {
            return None;
        }
        let root = discriminant.sqrt();
        [-b - root, -b + root].into_iter().find(|t| *t >= 0.0)
    }
}

/// Straight wall between two points
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WallSegment {
    pub start: (f32, f32),
    pub end: (f32, f32),
}

impl WallSegment {
    pub fn new(start: (f32, f32), end: (f32, f32)) -> Self {
        WallSegment { start, end }
    }

    fn intersect(&self, origin: (f32, f32), direction: (f32, f32)) -> Option<f32> {
        let edge = (self.end.0 - self.start.0, self.end.1 - self.start.1);
        let cross = |a: (f32, f32), b: (f32, f32)| a.0 * b.1 - a.1 * b.0;
        let denominator = cross(direction, edge);
        if denominator.abs() < 1e-9 {
            return None;
        }
        let offset = (self.start.0 - origin.0, self.start.1 - origin.1);
        let along_ray = cross(offset, edge) / denominator;
        let along_wall = cross(offset, direction) / denominator;
        (along_ray >= 0.0 && (0.0..=1.0).contains(&along_wall)).then_some(along_ray)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// seconds between scans
    pub scan_period: f64,
    /// rays per scan
    pub beam_count: usize,
    pub obstacles: Vec<CircleObstacle>,
    pub walls: Vec<WallSegment>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            scan_period: 0.1,
            beam_count: 360,
            obstacles: vec![],
            walls: vec![],
        }
    }
}

#[derive(Debug)]
struct SimState {
    pose: Pose2D,
    command: WheelCommand,
    time: f64,
    last_scan: Option<f64>,
    feedback_pending: bool,
    sensors_frozen: bool,
    motor_fault: Option<DriverError>,
    obstacles: Vec<CircleObstacle>,
    walls: Vec<WallSegment>,
    writes: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mecanum base with wheel encoders and a range sensor.
///
/// Clones share the same simulated robot, so one clone can be handed out per
/// capability.
#[derive(Clone)]
pub struct SimulatedBase {
    state: Arc<Mutex<SimState>>,
    kinematics: MecanumKinematics,
    sensor: RangeSensorConfig,
    scan_period: f64,
    beam_count: usize,
}

impl SimulatedBase {
    pub fn new(
        drive: DriveConfig,
        sensor: RangeSensorConfig,
        config: SimulationConfig,
        start: Pose2D,
    ) -> Self {
        SimulatedBase {
            state: Arc::new(Mutex::new(SimState {
                pose: start,
                command: WheelCommand::stop(),
                time: 0.0,
                last_scan: None,
                feedback_pending: true,
                sensors_frozen: false,
                motor_fault: None,
                obstacles: config.obstacles,
                walls: config.walls,
                writes: 0,
            })),
            kinematics: MecanumKinematics::new(drive),
            sensor,
            scan_period: config.scan_period,
            beam_count: config.beam_count.max(1),
        }
    }

    /// Moves simulated time forward, driving with the last wheel command
    pub fn advance(&self, delta_time: f64) {
        let mut state = lock(&self.state);
        if delta_time <= 0.0 {
            return;
        }
        if let Ok(velocity) = self.kinematics.to_body_velocity(&state.command) {
            let dt = delta_time as f32;
            let heading = normalize_angle(state.pose.heading + velocity.angular_z * dt);
            let (sin, cos) = heading.sin_cos();
            state.pose = Pose2D {
                x: state.pose.x + (velocity.linear_x * cos - velocity.linear_y * sin) * dt,
                y: state.pose.y + (velocity.linear_x * sin + velocity.linear_y * cos) * dt,
                heading,
            };
        }
        state.time += delta_time;
        state.feedback_pending = true;
    }

    pub fn time(&self) -> f64 {
        lock(&self.state).time
    }

    /// Ground truth pose
    pub fn pose(&self) -> Pose2D {
        lock(&self.state).pose
    }

    pub fn last_command(&self) -> WheelCommand {
        lock(&self.state).command
    }

    pub fn command_count(&self) -> u64 {
        lock(&self.state).writes
    }

    /// Frozen sensors stop delivering scans and encoder samples
    pub fn set_sensors_frozen(&self, frozen: bool) {
        lock(&self.state).sensors_frozen = frozen;
    }

    pub fn set_motor_fault(&self, fault: Option<DriverError>) {
        lock(&self.state).motor_fault = fault;
    }

    pub fn add_obstacle(&self, obstacle: CircleObstacle) {
        lock(&self.state).obstacles.push(obstacle);
    }

    pub fn add_wall(&self, wall: WallSegment) {
        lock(&self.state).walls.push(wall);
    }

    pub fn clear_obstacles(&self) {
        let mut state = lock(&self.state);
        state.obstacles.clear();
        state.walls.clear();
    }

    fn cast(&self, state: &SimState) -> RawScan {
        let pose = state.pose;
        let (mount_x, mount_y) = pose.body_to_world(self.sensor.mount_x, self.sensor.mount_y);
        let origin = (pose.x + mount_x, pose.y + mount_y);
        let points = (0..self.beam_count)
            .filter_map(|beam| {
                let sensor_angle = beam as f32 * TAU / self.beam_count as f32;
                let world_angle = pose.heading + sensor_angle;
                let direction = (world_angle.cos(), world_angle.sin());
                let distance = state
                    .obstacles
                    .iter()
                    .filter_map(|obstacle| obstacle.intersect(origin, direction))
                    .chain(
                        state
                            .walls
                            .iter()
                            .filter_map(|wall| wall.intersect(origin, direction)),
                    )
                    .fold(f32::INFINITY, f32::min);
                if distance > self.sensor.max_range {
                    return None;
                }
                let offset = sensor_angle.to_degrees();
                let raw_angle = if self.sensor.clockwise {
                    self.sensor.forward_angle_deg - offset
                } else {
                    self.sensor.forward_angle_deg + offset
                };
                Some(RawPoint::new(
                    raw_angle.rem_euclid(360.0),
                    distance * 1000.0,
                    100,
                ))
            })
            .collect();
        RawScan {
            timestamp: state.time,
            points,
        }
    }
}

impl MotorDriver for SimulatedBase {
    fn write_command(&mut self, command: &WheelCommand) -> Result<(), DriverError> {
        let mut state = lock(&self.state);
        if let Some(fault) = state.motor_fault.clone() {
            return Err(fault);
        }
        state.command = *command;
        state.writes += 1;
        Ok(())
    }
}

impl WheelFeedback for SimulatedBase {
    fn latest_feedback(&mut self) -> Option<WheelFeedbackSample> {
        let mut state = lock(&self.state);
        if state.sensors_frozen || !state.feedback_pending {
            return None;
        }
        state.feedback_pending = false;
        Some(WheelFeedbackSample {
            wheels: state.command,
            timestamp: state.time,
        })
    }
}

impl RangeSensor for SimulatedBase {
    fn latest_scan(&mut self) -> Option<RawScan> {
        let mut state = lock(&self.state);
        if state.sensors_frozen {
            return None;
        }
        let due = match state.last_scan {
            Some(last) => state.time - last >= self.scan_period - 1e-9,
            None => true,
        };
        if !due {
            return None;
        }
        state.last_scan = Some(state.time);
        Some(self.cast(&state))
    }
}

/// Everything the simulated servo bus was asked to do
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServoState {
    pub joints: JointPositions,
    pub gripper: f32,
    pub commands: Vec<JointPositions>,
    pub grip_commands: Vec<f32>,
    pub halted: bool,
    pub limp: bool,
}

#[derive(Debug)]
struct ServoSim {
    state: ServoState,
    object_present: bool,
}

/// Inspection and fault injection for a `SimulatedServoDriver`
#[derive(Clone)]
pub struct ServoHandle(Arc<Mutex<ServoSim>>);

impl ServoHandle {
    pub fn snapshot(&self) -> ServoState {
        lock(&self.0).state.clone()
    }

    /// Moves the joints without a command, like turning a limp arm by hand
    pub fn set_joints(&self, joints: JointPositions) {
        lock(&self.0).state.joints = joints;
    }

    /// Whether the next grasp finds something between the fingers
    pub fn set_object_present(&self, present: bool) {
        lock(&self.0).object_present = present;
    }
}

pub struct SimulatedServoDriver {
    shared: Arc<Mutex<ServoSim>>,
    /// closure the gripper stops at when holding a box
    object_closure: f32,
}

impl SimulatedServoDriver {
    pub fn new(start: JointPositions) -> Self {
        SimulatedServoDriver {
            shared: Arc::new(Mutex::new(ServoSim {
                state: ServoState {
                    joints: start,
                    ..ServoState::default()
                },
                object_present: true,
            })),
            object_closure: GripperCalibration::default().closure_for(422.0),
        }
    }

    pub fn with_object(self, present: bool) -> Self {
        lock(&self.shared).object_present = present;
        self
    }

    pub fn handle(&self) -> ServoHandle {
        ServoHandle(self.shared.clone())
    }
}

#[async_trait]
impl ServoDriver for SimulatedServoDriver {
    async fn move_to_timed(
        &mut self,
        position: &JointPositions,
        _duration: Duration,
    ) -> Result<(), DriverError> {
        let mut sim = lock(&self.shared);
        sim.state.joints = *position;
        sim.state.commands.push(*position);
        sim.state.halted = false;
        sim.state.limp = false;
        Ok(())
    }

    async fn read_position(&mut self) -> Result<JointPositions, DriverError> {
        Ok(lock(&self.shared).state.joints)
    }

    async fn move_gripper(&mut self, closed: f32, _duration: Duration) -> Result<(), DriverError> {
        let mut sim = lock(&self.shared);
        sim.state.grip_commands.push(closed);
        sim.state.gripper = if closed > 0.5 && sim.object_present {
            closed.min(self.object_closure)
        } else {
            closed
        };
        Ok(())
    }

    async fn read_gripper(&mut self) -> Result<f32, DriverError> {
        Ok(lock(&self.shared).state.gripper)
    }

    async fn halt(&mut self) -> Result<(), DriverError> {
        lock(&self.shared).state.halted = true;
        Ok(())
    }

    async fn limp(&mut self) -> Result<(), DriverError> {
        lock(&self.shared).state.limp = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range_sensor::RangeSensorAdapter;
    use approx::assert_relative_eq;

    fn base(obstacles: Vec<CircleObstacle>) -> SimulatedBase {
        SimulatedBase::new(
            DriveConfig::default(),
            RangeSensorConfig::default(),
            SimulationConfig {
                obstacles,
                ..SimulationConfig::default()
            },
            Pose2D::default(),
        )
    }

    #[test]
    fn follows_wheel_command() {
        let mut base = base(vec![]);
        let kinematics = MecanumKinematics::new(DriveConfig::default());
        base.write_command(&kinematics.to_wheel_command(0.2, 0.0, 0.0).unwrap())
            .unwrap();
        for _ in 0..10 {
            base.advance(0.1);
        }
        assert_relative_eq!(base.pose().x, 0.2, epsilon = 1e-4);
        assert_relative_eq!(base.time(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn scan_sees_obstacle_ahead() {
        let mut base = base(vec![CircleObstacle::new(1.0, 0.0, 0.1)]);
        let raw = base.latest_scan().unwrap();
        let scan = RangeSensorAdapter::new(RangeSensorConfig::default()).normalize(&raw);
        let nearest = scan
            .points
            .iter()
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
            .unwrap();
        // front of the obstacle, measured from the robot center
        assert_relative_eq!(nearest.distance, 0.9, epsilon = 1e-3);
        assert_relative_eq!(nearest.angle, 0.0, epsilon = 1e-3);
    }

    #[test]
    fn scan_sees_wall_beside() {
        let mut base = base(vec![]);
        base.add_wall(WallSegment::new((-1.0, 0.3), (1.0, 0.3)));
        let raw = base.latest_scan().unwrap();
        let scan = RangeSensorAdapter::new(RangeSensorConfig::default()).normalize(&raw);
        let nearest = scan
            .points
            .iter()
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
            .unwrap();
        assert_relative_eq!(nearest.distance, 0.3, epsilon = 5e-3);
        assert!(nearest.angle > 1.4 && nearest.angle < 1.8, "{}", nearest.angle);
    }

    #[test]
    fn ray_misses_past_wall_end() {
        let wall = WallSegment::new((1.0, -0.5), (1.0, 0.5));
        assert_relative_eq!(wall.intersect((0.0, 0.0), (1.0, 0.0)).unwrap(), 1.0);
        assert_eq!(wall.intersect((0.0, 0.0), (-1.0, 0.0)), None);
        assert_eq!(wall.intersect((0.0, 1.0), (1.0, 0.0)), None);
        assert_eq!(wall.intersect((0.0, 0.0), (0.0, 1.0)), None);
    }

    #[test]
    fn scans_follow_period() {
        let mut base = base(vec![CircleObstacle::new(1.0, 0.0, 0.1)]);
        assert!(base.latest_scan().is_some());
        assert!(base.latest_scan().is_none());
        base.advance(0.05);
        assert!(base.latest_scan().is_none());
        base.advance(0.05);
        assert!(base.latest_scan().is_some());
    }

    #[test]
    fn frozen_sensors_deliver_nothing() {
        let mut base = base(vec![CircleObstacle::new(1.0, 0.0, 0.1)]);
        base.set_sensors_frozen(true);
        base.advance(1.0);
        assert!(base.latest_scan().is_none());
        assert!(base.latest_feedback().is_none());
    }

    #[test]
    fn motor_fault_rejects_commands() {
        let mut base = base(vec![]);
        base.set_motor_fault(Some(DriverError::Disconnected));
        assert_eq!(
            base.write_command(&WheelCommand::stop()),
            Err(DriverError::Disconnected)
        );
        assert_eq!(base.command_count(), 0);
    }

    #[tokio::test]
    async fn servo_grip_depends_on_object() {
        let mut driver = SimulatedServoDriver::new(JointPositions::default());
        let handle = driver.handle();
        driver.move_gripper(1.0, Duration::ZERO).await.unwrap();
        assert!(driver.read_gripper().await.unwrap() < 0.7);
        handle.set_object_present(false);
        driver.move_gripper(1.0, Duration::ZERO).await.unwrap();
        assert_relative_eq!(driver.read_gripper().await.unwrap(), 1.0);
        assert_eq!(handle.snapshot().grip_commands, vec![1.0, 1.0]);
    }
}
