//! Pick and place task orchestration.
//!
//! The state machine never touches hardware. It is fed navigation and arm
//! outcomes by the control loop and answers with the next directive.

use crate::arm_controller::EndEffectorPose;
use crate::error::ControllerError;
use crate::geometry::Pose2D;
use crate::navigation::{NavGoal, PlannerState};
use nalgebra as na;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    NavigatingToPick,
    Picking,
    NavigatingToPlace,
    Placing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Where the robot has to stand and where the gripper has to go from there
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManipulationTarget {
    pub stand_pose: Pose2D,
    pub effector: EndEffectorPose,
}

impl ManipulationTarget {
    pub fn new(stand_pose: Pose2D, effector: EndEffectorPose) -> Self {
        ManipulationTarget {
            stand_pose,
            effector,
        }
    }
}

/// Output of the object detector, position in the world frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDetection {
    pub class: String,
    pub position: na::Vector3<f32>,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionRequest {
    pub pick: ManipulationTarget,
    pub place: ManipulationTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    Blocked,
    Unreachable,
    GripVerificationFailed,
    /// the pick or place itself succeeded, the arm did not get back
    RetractFailed,
    SensorStale,
    Aborted,
    InvalidCommand,
    NoTrajectory,
    Driver,
    Config,
}

impl From<&ControllerError> for FailureReason {
    fn from(error: &ControllerError) -> Self {
        match error {
            ControllerError::Blocked { .. } => FailureReason::Blocked,
            ControllerError::Unreachable(_) => FailureReason::Unreachable,
            ControllerError::GripVerificationFailed => FailureReason::GripVerificationFailed,
            ControllerError::RetractFailed(_) => FailureReason::RetractFailed,
            ControllerError::SensorStale { .. } => FailureReason::SensorStale,
            ControllerError::Aborted => FailureReason::Aborted,
            ControllerError::InvalidCommand(_) => FailureReason::InvalidCommand,
            ControllerError::NoTrajectory => FailureReason::NoTrajectory,
            ControllerError::Driver(_) => FailureReason::Driver,
            ControllerError::Config(_) => FailureReason::Config,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub reason: FailureReason,
    /// status the task was in when it failed
    pub last_status: TaskStatus,
    pub retries: u32,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionTask {
    pub id: TaskId,
    pub pick: ManipulationTarget,
    pub place: ManipulationTarget,
    pub status: TaskStatus,
    /// retries spent in the current phase
    pub retries: u32,
    pub failure: Option<FailureReport>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MissionConfig {
    /// meters
    pub tolerance_radius: f32,
    /// degrees
    pub tolerance_heading: f32,
    pub nav_retry_budget: u32,
    /// tolerances are multiplied by this on every navigation retry
    pub tolerance_relax_factor: f32,
    pub arm_retry_budget: u32,
    /// approach pitch moves this many degrees toward level on every arm retry
    pub pitch_relax_deg: f32,
    pub min_detection_confidence: f32,
    /// empty accepts every class
    pub accepted_classes: Vec<String>,
    /// distance between a detected object and the robot center when picking
    pub standoff_distance: f32,
    /// gripper pitch used to approach detected objects, degrees
    pub approach_pitch: f32,
    /// where detected objects are brought
    pub drop_off: ManipulationTarget,
    /// finished tasks kept for inspection
    pub archive_size: usize,
}

impl Default for MissionConfig {
    fn default() -> Self {
        MissionConfig {
            tolerance_radius: 0.05,
            tolerance_heading: 3.0,
            nav_retry_budget: 2,
            tolerance_relax_factor: 1.5,
            arm_retry_budget: 1,
            pitch_relax_deg: 15.0,
            min_detection_confidence: 0.6,
            accepted_classes: vec![],
            standoff_distance: 0.3,
            approach_pitch: -45.0,
            drop_off: ManipulationTarget::new(
                Pose2D::from_degrees(0.0, 0.0, 180.0),
                EndEffectorPose::new(na::Vector3::new(0.2, 0.0, 0.0), -45.0),
            ),
            archive_size: 100,
        }
    }
}

/// What the control loop has to do next
#[derive(Debug, Clone, PartialEq)]
pub enum MissionDirective {
    Navigate(NavGoal),
    Pick(EndEffectorPose),
    Place(EndEffectorPose),
    /// stop driving and hold the arm, the active task is over
    Halt,
}

pub struct TaskStateMachine {
    config: MissionConfig,
    /// arm base position relative to the robot center
    arm_mount: na::Vector3<f32>,
    next_id: TaskId,
    pending: VecDeque<MissionTask>,
    active: Option<MissionTask>,
    archive: VecDeque<MissionTask>,
    completed: u64,
    failed: u64,
}

impl TaskStateMachine {
    pub fn new(config: MissionConfig, arm_mount: na::Vector3<f32>) -> Self {
        TaskStateMachine {
            config,
            arm_mount,
            next_id: 1,
            pending: VecDeque::new(),
            active: None,
            archive: VecDeque::new(),
            completed: 0,
            failed: 0,
        }
    }

    pub fn active(&self) -> Option<&MissionTask> {
        self.active.as_ref()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Finished tasks, oldest first
    pub fn archive(&self) -> impl Iterator<Item = &MissionTask> {
        self.archive.iter()
    }

    pub fn completed_count(&self) -> u64 {
        self.completed
    }

    pub fn failed_count(&self) -> u64 {
        self.failed
    }

    pub fn enqueue(&mut self, request: MissionRequest) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        tracing::info!(
            "Task {} queued: pick at ({:.2}, {:.2}), place at ({:.2}, {:.2})",
            id,
            request.pick.stand_pose.x,
            request.pick.stand_pose.y,
            request.place.stand_pose.x,
            request.place.stand_pose.y
        );
        self.pending.push_back(MissionTask {
            id,
            pick: request.pick,
            place: request.place,
            status: TaskStatus::Pending,
            retries: 0,
            failure: None,
        });
        id
    }

    /// Turns a detection into a task that brings the object to the drop off
    pub fn submit_detection(
        &mut self,
        detection: &ObjectDetection,
        robot_pose: &Pose2D,
    ) -> Option<TaskId> {
        if !detection.confidence.is_finite()
            || detection.confidence < self.config.min_detection_confidence
        {
            tracing::debug!(
                "Dropping {} detection with confidence {:.2}",
                detection.class,
                detection.confidence
            );
            return None;
        }
        if !self.config.accepted_classes.is_empty()
            && !self.config.accepted_classes.contains(&detection.class)
        {
            tracing::debug!("Ignoring detection of class {}", detection.class);
            return None;
        }
        let pick = self.approach_target(detection, robot_pose)?;
        let place = self.config.drop_off.clone();
        Some(self.enqueue(MissionRequest { pick, place }))
    }

    /// Stand facing the object at the standoff distance, approaching from
    /// where the robot is now
    fn approach_target(
        &self,
        detection: &ObjectDetection,
        robot_pose: &Pose2D,
    ) -> Option<ManipulationTarget> {
        let object = detection.position;
        if !object.iter().all(|value| value.is_finite()) {
            tracing::warn!("Detection with non finite position {:?}", object);
            return None;
        }
        let bearing = robot_pose.bearing_to(object.x, object.y);
        let standoff = self.config.standoff_distance;
        let stand_pose = Pose2D::new(
            object.x - standoff * bearing.cos(),
            object.y - standoff * bearing.sin(),
            bearing,
        );
        let effector = EndEffectorPose::new(
            na::Vector3::new(
                standoff - self.arm_mount.x,
                -self.arm_mount.y,
                object.z - self.arm_mount.z,
            ),
            self.config.approach_pitch,
        );
        Some(ManipulationTarget::new(stand_pose, effector))
    }

    /// Starts the next queued task when none is active
    pub fn dispatch(&mut self) -> Option<MissionDirective> {
        if self.active.is_some() {
            return None;
        }
        let mut task = self.pending.pop_front()?;
        task.status = TaskStatus::NavigatingToPick;
        tracing::info!("Task {} started, {} still queued", task.id, self.pending.len());
        let goal = self.nav_goal(&task.pick, 0);
        self.active = Some(task);
        Some(MissionDirective::Navigate(goal))
    }

    fn nav_goal(&self, target: &ManipulationTarget, retries: u32) -> NavGoal {
        NavGoal::with_degrees(
            target.stand_pose,
            self.config.tolerance_radius,
            self.config.tolerance_heading,
        )
        .relaxed(self.config.tolerance_relax_factor.powi(retries as i32))
    }

    fn effector_target(&self, target: &ManipulationTarget, retries: u32) -> EndEffectorPose {
        let relax = self.config.pitch_relax_deg * retries as f32;
        let pitch = target.effector.end_effector_angle;
        let relaxed = if pitch < 0.0 {
            (pitch + relax).min(0.0)
        } else {
            (pitch - relax).max(0.0)
        };
        EndEffectorPose::new(target.effector.position, relaxed)
    }

    fn set_status(task: &mut MissionTask, status: TaskStatus) {
        tracing::info!("Task {} {:?} -> {:?}", task.id, task.status, status);
        task.status = status;
        task.retries = 0;
    }

    /// Reacts to the navigation planner's state. `avoiding_ticks` is only
    /// used to report a blocked failure.
    pub fn on_navigation(
        &mut self,
        state: PlannerState,
        avoiding_ticks: u32,
    ) -> Option<MissionDirective> {
        let mut task = self.active.take()?;
        let directive = match (task.status, state) {
            (TaskStatus::NavigatingToPick, PlannerState::Arrived) => {
                Self::set_status(&mut task, TaskStatus::Picking);
                Some(MissionDirective::Pick(self.effector_target(&task.pick, 0)))
            }
            (TaskStatus::NavigatingToPlace, PlannerState::Arrived) => {
                Self::set_status(&mut task, TaskStatus::Placing);
                Some(MissionDirective::Place(self.effector_target(&task.place, 0)))
            }
            (TaskStatus::NavigatingToPick, PlannerState::Blocked)
            | (TaskStatus::NavigatingToPlace, PlannerState::Blocked) => {
                if task.retries < self.config.nav_retry_budget {
                    task.retries += 1;
                    let target = if task.status == TaskStatus::NavigatingToPick {
                        &task.pick
                    } else {
                        &task.place
                    };
                    let goal = self.nav_goal(target, task.retries);
                    tracing::warn!(
                        "Task {} blocked, retry {} of {} with tolerance {:.3}m",
                        task.id,
                        task.retries,
                        self.config.nav_retry_budget,
                        goal.tolerance_radius
                    );
                    Some(MissionDirective::Navigate(goal))
                } else {
                    self.fail(
                        task,
                        &ControllerError::Blocked {
                            ticks: avoiding_ticks,
                        },
                    );
                    return Some(MissionDirective::Halt);
                }
            }
            _ => None,
        };
        self.active = Some(task);
        directive
    }

    /// Reacts to the outcome of a pick or place sequence
    pub fn on_arm_result(
        &mut self,
        result: std::result::Result<(), ControllerError>,
    ) -> Option<MissionDirective> {
        let mut task = self.active.take()?;
        if !matches!(task.status, TaskStatus::Picking | TaskStatus::Placing) {
            self.active = Some(task);
            return None;
        }
        match result {
            Ok(()) if task.status == TaskStatus::Picking => {
                Self::set_status(&mut task, TaskStatus::NavigatingToPlace);
                let goal = self.nav_goal(&task.place, 0);
                self.active = Some(task);
                Some(MissionDirective::Navigate(goal))
            }
            Ok(()) => {
                Self::set_status(&mut task, TaskStatus::Completed);
                self.completed += 1;
                self.store(task);
                Some(MissionDirective::Halt)
            }
            Err(ControllerError::Unreachable(detail))
                if task.retries < self.config.arm_retry_budget =>
            {
                task.retries += 1;
                let picking = task.status == TaskStatus::Picking;
                let target = if picking { &task.pick } else { &task.place };
                let effector = self.effector_target(target, task.retries);
                tracing::warn!(
                    "Task {} arm target unreachable ({}), retry {} at pitch {:.1}°",
                    task.id,
                    detail,
                    task.retries,
                    effector.end_effector_angle
                );
                self.active = Some(task);
                if picking {
                    Some(MissionDirective::Pick(effector))
                } else {
                    Some(MissionDirective::Place(effector))
                }
            }
            Err(error) => {
                self.fail(task, &error);
                Some(MissionDirective::Halt)
            }
        }
    }

    /// Operator abort, fails the active task
    pub fn abort(&mut self) -> bool {
        self.fail_active(&ControllerError::Aborted)
    }

    /// Fails the active task with `error`, returns false when idle
    pub fn fail_active(&mut self, error: &ControllerError) -> bool {
        match self.active.take() {
            Some(task) => {
                self.fail(task, error);
                true
            }
            None => false,
        }
    }

    fn fail(&mut self, mut task: MissionTask, error: &ControllerError) {
        let report = FailureReport {
            reason: FailureReason::from(error),
            last_status: task.status,
            retries: task.retries,
            detail: error.to_string(),
        };
        tracing::error!(
            "Task {} failed in {:?} after {} retries: {}",
            task.id,
            report.last_status,
            report.retries,
            report.detail
        );
        task.status = TaskStatus::Failed;
        task.failure = Some(report);
        self.failed += 1;
        self.store(task);
    }

    fn store(&mut self, task: MissionTask) {
        self.archive.push_back(task);
        while self.archive.len() > self.config.archive_size {
            self.archive.pop_front();
        }
    }
}
