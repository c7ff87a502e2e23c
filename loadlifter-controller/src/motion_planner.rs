//! Arm motion sequencing.
//!
//! Turns gripper targets into joint space trajectories and plays them on the
//! servo bus. A trajectory is planned completely up front (IK, joint limits
//! and collisions for every point) so nothing moves unless the whole motion
//! is valid.

use crate::arm_config::{ArmConfig, Posture};
use crate::arm_controller::{ArmKinematics, EndEffectorPose};
use crate::arm_driver::{GripCommand, JointPositions, ServoDriver};
use crate::collision_handler::CollisionHandler;
use crate::error::{ControllerError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointTrajectoryPoint {
    pub joints: JointPositions,
    /// seconds from the start of the trajectory
    pub time_offset: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TrajectoryStep {
    Move(JointTrajectoryPoint),
    Grip(GripCommand),
}

/// Gripper actions around a motion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GripSequence {
    /// before the first move
    pub approach: Option<GripCommand>,
    /// after the last move
    pub finish: Option<GripCommand>,
}

impl GripSequence {
    pub fn none() -> Self {
        GripSequence::default()
    }

    pub fn pick() -> Self {
        GripSequence {
            approach: Some(GripCommand::Open),
            finish: Some(GripCommand::Close),
        }
    }

    pub fn place() -> Self {
        GripSequence {
            approach: None,
            finish: Some(GripCommand::Open),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ArmTrajectory {
    pub steps: Vec<TrajectoryStep>,
    /// seconds, grip steps included
    pub duration: f32,
}

impl ArmTrajectory {
    pub fn points(&self) -> impl Iterator<Item = &JointTrajectoryPoint> {
        self.steps.iter().filter_map(|step| match step {
            TrajectoryStep::Move(point) => Some(point),
            TrajectoryStep::Grip(_) => None,
        })
    }

    pub fn final_joints(&self) -> Option<JointPositions> {
        self.points().last().map(|point| point.joints)
    }
}

/// Interrupts a running `execute` from another task
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.aborted.store(false, Ordering::SeqCst);
    }

    /// Sleeps until `deadline`, returns false when aborted first
    async fn wait_until(&self, deadline: Instant) -> bool {
        loop {
            if self.is_aborted() {
                return false;
            }
            tokio::select! {
                _ = sleep_until(deadline) => return !self.is_aborted(),
                // a permit left over from an earlier abort wakes us with the
                // flag already reset, keep waiting in that case
                _ = self.notify.notified() => {}
            }
        }
    }
}

pub struct ArmMotionSequencer {
    kinematics: ArmKinematics,
    collision_handler: CollisionHandler,
    driver: Box<dyn ServoDriver>,
    last_joints: JointPositions,
    home: JointPositions,
    plan: Option<ArmTrajectory>,
    abort: AbortHandle,
}

impl ArmMotionSequencer {
    pub async fn new(config: ArmConfig, mut driver: Box<dyn ServoDriver>) -> Result<Self> {
        let last_joints = driver.read_position().await?;
        Ok(ArmMotionSequencer {
            kinematics: ArmKinematics::new(config.clone()),
            collision_handler: CollisionHandler::new(config.clone()),
            home: config.home(),
            driver,
            last_joints,
            plan: None,
            abort: AbortHandle::default(),
        })
    }

    fn config(&self) -> &ArmConfig {
        self.kinematics.config()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Interrupt the running trajectory
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn current_joints(&self) -> JointPositions {
        self.last_joints
    }

    pub fn trajectory(&self) -> Option<&ArmTrajectory> {
        self.plan.as_ref()
    }

    pub fn kinematics(&self) -> &ArmKinematics {
        &self.kinematics
    }

    /// Straight joint space move to a single target
    pub fn plan(&mut self, target: &EndEffectorPose, grip: GripSequence) -> Result<&ArmTrajectory> {
        self.plan_waypoints(&[target.clone()], grip)
    }

    /// Open, hover above the object, descend and close
    pub fn plan_pick(&mut self, target: &EndEffectorPose) -> Result<&ArmTrajectory> {
        let hover = target.raised(self.config().hover_height);
        self.plan_waypoints(&[hover, target.clone()], GripSequence::pick())
    }

    /// Hover above the drop spot, descend and open
    pub fn plan_place(&mut self, target: &EndEffectorPose) -> Result<&ArmTrajectory> {
        let hover = target.raised(self.config().hover_height);
        self.plan_waypoints(&[hover, target.clone()], GripSequence::place())
    }

    /// Back to the carry pose
    pub fn plan_retract(&mut self) -> Result<&ArmTrajectory> {
        let carry = self.config().carry_pose;
        self.plan_joints(carry, GripSequence::none(), "carry pose")
    }

    pub fn posture_names(&self) -> impl Iterator<Item = &str> {
        self.config().postures.keys().map(String::as_str)
    }

    /// Sets the gripper, then moves to the named posture
    pub fn plan_posture(&mut self, name: &str) -> Result<&ArmTrajectory> {
        let posture: Posture = match self.config().postures.get(name) {
            Some(posture) => *posture,
            None => {
                self.plan = None;
                return Err(ControllerError::InvalidCommand(format!(
                    "unknown posture {}",
                    name
                )));
            }
        };
        let grip = GripSequence {
            approach: Some(posture.gripper),
            finish: None,
        };
        self.plan_joints(posture.joints, grip, name)
    }

    pub fn home_pose(&self) -> JointPositions {
        self.home
    }

    /// Opens the gripper and moves to the home pose
    pub fn plan_home(&mut self) -> Result<&ArmTrajectory> {
        let grip = GripSequence {
            approach: Some(GripCommand::Open),
            finish: None,
        };
        self.plan_joints(self.home, grip, "home")
    }

    /// Teaches the current servo positions as home
    pub async fn set_home_from_current(&mut self) -> Result<JointPositions> {
        let joints = self.driver.read_position().await?;
        if !joints.is_finite() {
            return Err(ControllerError::InvalidCommand(format!(
                "servo reported {:?}",
                joints
            )));
        }
        if let Some(joint) = self.config().limits.violation(&joints) {
            return Err(ControllerError::InvalidCommand(format!(
                "current {} joint is outside its limits",
                joint
            )));
        }
        self.last_joints = joints;
        self.home = joints;
        tracing::info!("Home set to {:?}", joints);
        Ok(joints)
    }

    /// Forget the taught home
    pub fn clear_home(&mut self) {
        self.home = self.config().limits.midpoint();
    }

    fn plan_joints(
        &mut self,
        target: JointPositions,
        grip: GripSequence,
        label: &str,
    ) -> Result<&ArmTrajectory> {
        self.plan = None;
        if let Some(joint) = self.config().limits.violation(&target) {
            return Err(ControllerError::Unreachable(format!(
                "{} {} joint out of range",
                label, joint
            )));
        }
        let trajectory = self.build(&[target], grip)?;
        Ok(self.store(trajectory))
    }

    fn plan_waypoints(
        &mut self,
        waypoints: &[EndEffectorPose],
        grip: GripSequence,
    ) -> Result<&ArmTrajectory> {
        self.plan = None;
        let joints = waypoints
            .iter()
            .map(|waypoint| self.solve(waypoint))
            .collect::<Result<Vec<_>>>()
            .map_err(|error| {
                tracing::warn!("Arm plan rejected: {}", error);
                error
            })?;
        let trajectory = self.build(&joints, grip)?;
        Ok(self.store(trajectory))
    }

    fn store(&mut self, trajectory: ArmTrajectory) -> &ArmTrajectory {
        tracing::info!(
            "Planned arm trajectory with {} steps over {:.2}s",
            trajectory.steps.len(),
            trajectory.duration
        );
        self.plan.insert(trajectory)
    }

    fn solve(&self, target: &EndEffectorPose) -> Result<JointPositions> {
        let (positions, joints) = self.kinematics.calculate_full_poses(target)?;
        if !self.collision_handler.pose_collision_free(&positions) {
            return Err(ControllerError::Unreachable(format!(
                "arm pose for {:?} collides with the chassis or leaves the workspace",
                target.position
            )));
        }
        Ok(joints)
    }

    /// Evenly spaced points per segment, each segment as long as its
    /// largest joint move takes at the rated joint speed
    fn build(&self, waypoints: &[JointPositions], grip: GripSequence) -> Result<ArmTrajectory> {
        let config = self.config();
        let mut steps = vec![];
        let mut cursor = 0.0;
        if let Some(command) = grip.approach {
            steps.push(TrajectoryStep::Grip(command));
            cursor += config.gripper_duration;
        }

        let mut from = self.last_joints;
        for to in waypoints {
            let segment_duration = from.max_difference(to) / config.max_joint_speed;
            let count = ((segment_duration / config.point_interval).ceil() as usize).max(1);
            for i in 1..=count {
                let fraction = i as f32 / count as f32;
                let joints = if i == count { *to } else { from.lerp(to, fraction) };
                let positions = self.kinematics.calculate_fk(&joints);
                if !self.collision_handler.pose_collision_free(&positions) {
                    return Err(ControllerError::Unreachable(format!(
                        "path to {:?} passes through the chassis",
                        to
                    )));
                }
                steps.push(TrajectoryStep::Move(JointTrajectoryPoint {
                    joints,
                    time_offset: cursor + segment_duration * fraction,
                }));
            }
            cursor += segment_duration;
            from = *to;
        }

        if let Some(command) = grip.finish {
            steps.push(TrajectoryStep::Grip(command));
            cursor += config.gripper_duration;
        }
        Ok(ArmTrajectory {
            steps,
            duration: cursor,
        })
    }

    /// Plays the planned trajectory, waiting for each point's nominal
    /// arrival time. Consumes the plan.
    pub async fn execute(&mut self) -> Result<JointPositions> {
        let trajectory = self.plan.take().ok_or(ControllerError::NoTrajectory)?;
        self.abort.reset();
        let gripper_duration = Duration::from_secs_f32(self.config().gripper_duration);
        let start = Instant::now();
        let mut deadline = start;

        for step in trajectory.steps.iter() {
            if self.abort.is_aborted() {
                return self.stop_aborted().await;
            }
            match step {
                TrajectoryStep::Move(point) => {
                    let arrival = start + Duration::from_secs_f32(point.time_offset);
                    self.driver
                        .move_to_timed(&point.joints, arrival.saturating_duration_since(deadline))
                        .await?;
                    self.last_joints = point.joints;
                    deadline = arrival;
                }
                TrajectoryStep::Grip(command) => {
                    tracing::debug!("Gripper {:?}", command);
                    self.driver
                        .move_gripper(command.closure(), gripper_duration)
                        .await?;
                    deadline += gripper_duration;
                }
            }
            if !self.abort.wait_until(deadline).await {
                return self.stop_aborted().await;
            }
        }
        Ok(self.last_joints)
    }

    async fn stop_aborted(&mut self) -> Result<JointPositions> {
        tracing::warn!("Arm motion aborted at {:?}", self.last_joints);
        self.driver.halt().await?;
        Err(ControllerError::Aborted)
    }

    /// Stop the servos where they are
    pub async fn halt(&mut self) -> Result<()> {
        self.plan = None;
        self.driver.halt().await?;
        Ok(())
    }

    /// Release servo torque so the arm can be moved by hand
    pub async fn limp(&mut self) -> Result<()> {
        self.plan = None;
        self.driver.limp().await?;
        Ok(())
    }

    /// Checks that the last grasp actually caught something
    pub async fn verify_grip(&mut self) -> Result<()> {
        let closure = self.driver.read_gripper().await?;
        if closure >= self.config().empty_grip_closure {
            tracing::warn!("Gripper closed to {:.2}, nothing caught", closure);
            return Err(ControllerError::GripVerificationFailed);
        }
        tracing::debug!("Gripper holding at {:.2}", closure);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::{ServoHandle, SimulatedServoDriver};
    use approx::assert_relative_eq;
    use nalgebra as na;

    fn pick_target() -> EndEffectorPose {
        EndEffectorPose::new(na::Vector3::new(0.2, 0.0, -0.05), -45.0)
    }

    async fn sequencer(object: bool) -> (ArmMotionSequencer, ServoHandle) {
        let config = ArmConfig::default();
        let driver = SimulatedServoDriver::new(config.carry_pose).with_object(object);
        let handle = driver.handle();
        let sequencer = ArmMotionSequencer::new(config, Box::new(driver)).await.unwrap();
        (sequencer, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_target_executes_nothing() {
        let (mut sequencer, handle) = sequencer(true).await;
        let behind = EndEffectorPose::new(na::Vector3::new(-0.2, 0.0, 0.05), 0.0);
        assert!(matches!(
            sequencer.plan(&behind, GripSequence::none()),
            Err(ControllerError::Unreachable(_))
        ));
        assert!(sequencer.trajectory().is_none());
        assert!(matches!(
            sequencer.execute().await,
            Err(ControllerError::NoTrajectory)
        ));
        assert!(handle.snapshot().commands.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_plan_clears_previous_plan() {
        let (mut sequencer, _) = sequencer(true).await;
        sequencer.plan_pick(&pick_target()).unwrap();
        let behind = EndEffectorPose::new(na::Vector3::new(-0.2, 0.0, 0.05), 0.0);
        assert!(sequencer.plan(&behind, GripSequence::none()).is_err());
        assert!(sequencer.trajectory().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn joint_speeds_stay_within_rating() {
        let (mut sequencer, _) = sequencer(true).await;
        let trajectory = sequencer.plan_pick(&pick_target()).unwrap().clone();
        let mut previous = JointTrajectoryPoint {
            joints: ArmConfig::default().carry_pose,
            time_offset: ArmConfig::default().gripper_duration,
        };
        for point in trajectory.points() {
            let elapsed = point.time_offset - previous.time_offset;
            let moved = previous.joints.max_difference(&point.joints);
            if elapsed > 0.0 {
                assert!(moved / elapsed <= 90.0 + 1e-2, "{} deg/s", moved / elapsed);
            } else {
                assert!(moved < 1e-4);
            }
            previous = *point;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pick_opens_first_and_closes_last() {
        let (mut sequencer, _) = sequencer(true).await;
        let trajectory = sequencer.plan_pick(&pick_target()).unwrap();
        assert_eq!(
            trajectory.steps.first(),
            Some(&TrajectoryStep::Grip(GripCommand::Open))
        );
        assert_eq!(
            trajectory.steps.last(),
            Some(&TrajectoryStep::Grip(GripCommand::Close))
        );
        let grips = trajectory
            .steps
            .iter()
            .filter(|step| matches!(step, TrajectoryStep::Grip(_)))
            .count();
        assert_eq!(grips, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_plays_every_point_on_time() {
        let (mut sequencer, handle) = sequencer(true).await;
        let trajectory = sequencer.plan_pick(&pick_target()).unwrap().clone();
        let point_count = trajectory.points().count();
        let start = Instant::now();
        let joints = sequencer.execute().await.unwrap();
        let elapsed = start.elapsed().as_secs_f32();
        assert_relative_eq!(elapsed, trajectory.duration, epsilon = 1e-2);
        assert_eq!(Some(joints), trajectory.final_joints());
        let state = handle.snapshot();
        assert_eq!(state.commands.len(), point_count);
        assert_eq!(state.grip_commands, vec![0.0, 1.0]);
        assert!(sequencer.trajectory().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_halts_servo_mid_trajectory() {
        let (mut sequencer, handle) = sequencer(true).await;
        let total = sequencer.plan_pick(&pick_target()).unwrap().points().count();
        let abort = sequencer.abort_handle();
        let (result, _) = tokio::join!(sequencer.execute(), async {
            tokio::time::sleep(Duration::from_millis(900)).await;
            abort.abort();
        });
        assert!(matches!(result, Err(ControllerError::Aborted)));
        let state = handle.snapshot();
        assert!(state.halted);
        assert!(state.commands.len() < total);
        // close never sent
        assert_eq!(state.grip_commands, vec![0.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_abort_does_not_cancel_next_run() {
        let (mut sequencer, handle) = sequencer(true).await;
        sequencer.abort();
        sequencer.plan_retract().unwrap();
        sequencer.plan_pick(&pick_target()).unwrap();
        assert!(sequencer.execute().await.is_ok());
        assert!(!handle.snapshot().halted);
    }

    #[tokio::test(start_paused = true)]
    async fn grip_verification() {
        let (mut holding, _) = sequencer(true).await;
        holding.plan_pick(&pick_target()).unwrap();
        holding.execute().await.unwrap();
        assert!(holding.verify_grip().await.is_ok());

        let (mut empty, _) = sequencer(false).await;
        empty.plan_pick(&pick_target()).unwrap();
        empty.execute().await.unwrap();
        assert!(matches!(
            empty.verify_grip().await,
            Err(ControllerError::GripVerificationFailed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn posture_sets_gripper_then_moves() {
        let (mut sequencer, handle) = sequencer(true).await;
        let trajectory = sequencer.plan_posture("base_left_45_closed").unwrap().clone();
        assert_eq!(
            trajectory.steps.first(),
            Some(&TrajectoryStep::Grip(GripCommand::Close))
        );
        let joints = sequencer.execute().await.unwrap();
        assert_eq!(joints.base, 45.0);
        assert_eq!(joints.shoulder, ArmConfig::default().carry_pose.shoulder);
        assert_eq!(handle.snapshot().grip_commands, vec![1.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_posture_is_rejected() {
        let (mut sequencer, handle) = sequencer(true).await;
        sequencer.plan_retract().unwrap();
        assert!(matches!(
            sequencer.plan_posture("wave"),
            Err(ControllerError::InvalidCommand(_))
        ));
        assert!(sequencer.trajectory().is_none());
        assert!(handle.snapshot().commands.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lists_postures() {
        let (sequencer, _) = sequencer(true).await;
        let names: Vec<_> = sequencer.posture_names().collect();
        assert!(names.contains(&"base_zero"));
        assert!(names.contains(&"base_right_90_closed"));
    }

    #[tokio::test(start_paused = true)]
    async fn home_defaults_to_joint_midpoints() {
        let (mut sequencer, handle) = sequencer(true).await;
        sequencer.plan_home().unwrap();
        let joints = sequencer.execute().await.unwrap();
        assert_eq!(joints, JointPositions::new(0.0, 60.0, -75.0, 0.0));
        assert_eq!(handle.snapshot().grip_commands, vec![0.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn taught_home_is_used_until_cleared() {
        let (mut sequencer, handle) = sequencer(true).await;
        let taught = JointPositions::new(30.0, 90.0, -150.0, 60.0);
        handle.set_joints(taught);
        assert_eq!(sequencer.set_home_from_current().await.unwrap(), taught);
        assert_eq!(sequencer.home_pose(), taught);

        sequencer.plan_posture("base_zero").unwrap();
        sequencer.execute().await.unwrap();
        sequencer.plan_home().unwrap();
        assert_eq!(sequencer.execute().await.unwrap(), taught);

        sequencer.clear_home();
        assert_eq!(sequencer.home_pose(), JointPositions::new(0.0, 60.0, -75.0, 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn home_outside_limits_is_not_taught() {
        let (mut sequencer, handle) = sequencer(true).await;
        handle.set_joints(JointPositions::new(0.0, 90.0, 45.0, 0.0));
        assert!(matches!(
            sequencer.set_home_from_current().await,
            Err(ControllerError::InvalidCommand(_))
        ));
        assert_eq!(sequencer.home_pose(), JointPositions::new(0.0, 60.0, -75.0, 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn limp_releases_servos() {
        let (mut sequencer, handle) = sequencer(true).await;
        sequencer.plan_retract().unwrap();
        sequencer.limp().await.unwrap();
        assert!(handle.snapshot().limp);
        assert!(sequencer.trajectory().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retract_returns_to_carry_pose() {
        let (mut sequencer, _) = sequencer(true).await;
        sequencer.plan_pick(&pick_target()).unwrap();
        sequencer.execute().await.unwrap();
        sequencer.plan_retract().unwrap();
        let joints = sequencer.execute().await.unwrap();
        assert_eq!(joints, ArmConfig::default().carry_pose);
    }
}
