//! Fixed rate control loop.
//!
//! One task owns every component. Each tick it drains operator commands,
//! reads the newest sensor samples, updates odometry and the obstacle map,
//! advances the task state machine and sends one wheel command. Arm motions
//! run as a sequential phase inside the tick with the drive stopped; the
//! command channel is still watched during that phase so an abort lands.
//!
//! Wall following and the channel route are operator behaviors. They drive
//! the wheels instead of the planner while no task is running.

use crate::arm_driver::{JointPositions, ServoDriver};
use crate::drive_kinematics::{MecanumKinematics, WheelCommand};
use crate::drivers::{MotorDriver, RangeSensor, WheelFeedback};
use crate::error::{ControllerError, Result};
use crate::geometry::{BodyVelocity, Pose2D};
use crate::mission::{MissionDirective, MissionRequest, ObjectDetection, TaskStateMachine};
use crate::motion_planner::ArmMotionSequencer;
use crate::navigation::{NavigationPlanner, PlannerState};
use crate::obstacle_map::LocalObstacleMap;
use crate::odometry::OdometryEstimator;
use crate::range_sensor::RangeSensorAdapter;
use crate::robot_config::RobotConfig;
use crate::route::{RouteConfig, RouteFollower};
use crate::telemetry::{
    ActiveTask, BehaviorKind, SensorHealth, TelemetryPublisher, TelemetrySnapshot,
};
use crate::wall_follow::{FollowMode, FollowStep, WallFollowConfig, WallFollower, WallReadings};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

const COMMAND_QUEUE_SIZE: usize = 64;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    pub rate_hz: f32,
    /// seconds without a new sample before driving cautiously
    pub stale_timeout: f64,
    /// seconds without a new sample before stopping and failing the task
    pub extended_stale_timeout: f64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        ControlConfig {
            rate_hz: 20.0,
            stale_timeout: 0.5,
            extended_stale_timeout: 2.0,
        }
    }
}

impl ControlConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.rate_hz)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Detection(ObjectDetection),
    Enqueue(MissionRequest),
    Abort,
    CorrectPose(Pose2D),
    /// Follow a wall, or centre between two, until something is ahead
    FollowWall(FollowMode),
    /// Sweep the side channels off the main corridor and come back
    FollowRoute,
    /// Move the arm to a named posture
    Posture(String),
    Home,
    /// Teach the current arm position as home
    SetHome,
    Shutdown,
}

enum Behavior {
    Follow(WallFollower),
    Route(RouteFollower),
}

impl Behavior {
    fn kind(&self) -> BehaviorKind {
        match self {
            Behavior::Follow(follower) => BehaviorKind::FollowWall(follower.mode()),
            Behavior::Route(_) => BehaviorKind::Route,
        }
    }
}

/// Arm motions asked for by the operator outside of a task
#[derive(Debug, Clone, PartialEq)]
enum ArmRequest {
    Posture(String),
    Home,
    SetHome,
}

/// Hardware capabilities the loop drives
pub struct Hardware {
    pub range_sensor: Box<dyn RangeSensor>,
    pub wheel_feedback: Box<dyn WheelFeedback>,
    pub motor: Box<dyn MotorDriver>,
    pub servo: Box<dyn ServoDriver>,
}

/// The outside world's end of a running loop
pub struct ControlHandle {
    pub commands: mpsc::Sender<ControlCommand>,
    pub telemetry: watch::Receiver<TelemetrySnapshot>,
}

pub struct ControlLoop {
    config: ControlConfig,
    adapter: RangeSensorAdapter,
    kinematics: MecanumKinematics,
    odometry: OdometryEstimator,
    map: LocalObstacleMap,
    planner: NavigationPlanner,
    tasks: TaskStateMachine,
    sequencer: ArmMotionSequencer,
    range_sensor: Box<dyn RangeSensor>,
    wheel_feedback: Box<dyn WheelFeedback>,
    motor: Box<dyn MotorDriver>,
    commands: mpsc::Receiver<ControlCommand>,
    /// commands that arrived during an arm phase
    deferred: Vec<ControlCommand>,
    telemetry: TelemetryPublisher,
    tick: u64,
    last_wheel_command: WheelCommand,
    /// controller time of the newest scan and encoder sample
    last_scan_seen: Option<f64>,
    last_feedback_seen: Option<f64>,
    last_feedback_stamp: Option<f64>,
    /// sensor ages are measured from here when no sample arrived since
    sensor_baseline: Option<f64>,
    health: SensorHealth,
    pending_arm: Option<MissionDirective>,
    wall_follow: WallFollowConfig,
    route: RouteConfig,
    behavior: Option<Behavior>,
    arm_request: Option<ArmRequest>,
    shutdown: bool,
}

impl ControlLoop {
    pub async fn new(
        config: RobotConfig,
        hardware: Hardware,
        start_pose: Pose2D,
    ) -> Result<(ControlLoop, ControlHandle)> {
        config.validate()?;
        let (sender, receiver) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let kinematics = MecanumKinematics::new(config.drive.clone());
        let sequencer = ArmMotionSequencer::new(config.arm.clone(), hardware.servo).await?;
        let telemetry = TelemetryPublisher::new();
        let handle = ControlHandle {
            commands: sender,
            telemetry: telemetry.subscribe(),
        };
        let control_loop = ControlLoop {
            adapter: RangeSensorAdapter::new(config.range_sensor.clone()),
            odometry: OdometryEstimator::new(kinematics.clone(), start_pose),
            kinematics,
            map: LocalObstacleMap::new(config.obstacle_map.clone()),
            planner: NavigationPlanner::new(config.navigation.clone()),
            tasks: TaskStateMachine::new(config.mission.clone(), config.arm.mount),
            sequencer,
            range_sensor: hardware.range_sensor,
            wheel_feedback: hardware.wheel_feedback,
            motor: hardware.motor,
            commands: receiver,
            deferred: vec![],
            telemetry,
            tick: 0,
            last_wheel_command: WheelCommand::stop(),
            last_scan_seen: None,
            last_feedback_seen: None,
            last_feedback_stamp: None,
            sensor_baseline: None,
            health: SensorHealth::Ok,
            pending_arm: None,
            wall_follow: config.wall_follow,
            route: config.route,
            behavior: None,
            arm_request: None,
            shutdown: false,
            config: config.control,
        };
        Ok((control_loop, handle))
    }

    pub fn pose(&self) -> Pose2D {
        self.odometry.pose()
    }

    pub fn planner_state(&self) -> PlannerState {
        self.planner.state()
    }

    pub fn tasks(&self) -> &TaskStateMachine {
        &self.tasks
    }

    pub fn sensor_health(&self) -> SensorHealth {
        self.health
    }

    pub fn arm_joints(&self) -> JointPositions {
        self.sequencer.current_joints()
    }

    pub fn arm_home(&self) -> JointPositions {
        self.sequencer.home_pose()
    }

    pub fn behavior(&self) -> Option<BehaviorKind> {
        self.behavior.as_ref().map(Behavior::kind)
    }

    pub fn subscribe(&self) -> watch::Receiver<TelemetrySnapshot> {
        self.telemetry.subscribe()
    }

    /// Runs at the configured rate until a `Shutdown` command arrives
    pub async fn run(mut self) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let start = Instant::now();
        tracing::info!("Control loop running at {:.1} Hz", self.config.rate_hz);
        loop {
            interval.tick().await;
            let now = start.elapsed().as_secs_f64();
            if !self.tick(now).await {
                break;
            }
        }
        self.stop_hardware().await;
        tracing::info!("Control loop stopped after {} ticks", self.tick);
        Ok(())
    }

    /// One control cycle at controller time `now` (seconds).
    /// Returns false once shutdown was requested.
    pub async fn tick(&mut self, now: f64) -> bool {
        self.drain_commands();
        if self.shutdown {
            return false;
        }

        self.read_sensors(now);
        self.map.decay(now);
        self.update_health(now).await;

        if self.health == SensorHealth::Lost {
            self.write_wheels(WheelCommand::stop());
            self.publish(now);
            self.tick += 1;
            return true;
        }

        if self.pending_arm.is_none() && self.arm_request.is_none() {
            self.advance_mission();
        }

        if let Some(request) = self.arm_request.take() {
            self.write_wheels(WheelCommand::stop());
            if let Err(error) = self.run_arm_request(&request).await {
                tracing::warn!("Arm request {:?} failed: {}", request, error);
            }
            self.sensor_baseline = None;
        } else if let Some(directive) = self.pending_arm.take() {
            self.write_wheels(WheelCommand::stop());
            let result = self.run_arm_phase(directive).await;
            if let Err(error) = &result {
                tracing::warn!("Arm phase ended with: {}", error);
            }
            if let Some(next) = self.tasks.on_arm_result(result) {
                self.apply_directive(next);
            }
            // sensors were not polled while the arm moved
            self.sensor_baseline = None;
        } else if self.behavior.is_some() {
            self.drive_behavior(now);
        } else {
            self.drive();
        }

        self.publish(now);
        self.tick += 1;
        !self.shutdown
    }

    fn drain_commands(&mut self) {
        for command in std::mem::take(&mut self.deferred) {
            self.handle_command(command);
        }
        while let Ok(command) = self.commands.try_recv() {
            self.handle_command(command);
        }
    }

    fn handle_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Detection(detection) => {
                let pose = self.odometry.pose();
                if let Some(id) = self.tasks.submit_detection(&detection, &pose) {
                    tracing::info!("Detection of {} became task {}", detection.class, id);
                }
            }
            ControlCommand::Enqueue(request) => {
                self.tasks.enqueue(request);
            }
            ControlCommand::Abort => {
                tracing::warn!("Abort requested");
                if self.tasks.abort() {
                    self.planner.stop();
                    self.pending_arm = None;
                    self.write_wheels(WheelCommand::stop());
                }
                if self.behavior.take().is_some() {
                    self.write_wheels(WheelCommand::stop());
                }
                self.arm_request = None;
                self.sequencer.abort();
            }
            ControlCommand::CorrectPose(pose) => self.odometry.apply_correction(pose),
            ControlCommand::FollowWall(mode) => {
                if self.reject_while_busy("wall following", false) {
                    return;
                }
                tracing::info!("Following {:?}", mode);
                self.planner.stop();
                self.behavior = Some(Behavior::Follow(WallFollower::new(
                    self.wall_follow.clone(),
                    mode,
                )));
            }
            ControlCommand::FollowRoute => {
                if self.reject_while_busy("route", false) {
                    return;
                }
                tracing::info!("Starting channel route");
                self.planner.stop();
                self.behavior = Some(Behavior::Route(RouteFollower::new(
                    self.route.clone(),
                    self.wall_follow.clone(),
                )));
            }
            ControlCommand::Posture(name) => self.request_arm(ArmRequest::Posture(name)),
            ControlCommand::Home => self.request_arm(ArmRequest::Home),
            ControlCommand::SetHome => self.request_arm(ArmRequest::SetHome),
            ControlCommand::Shutdown => {
                tracing::info!("Shutdown requested");
                self.shutdown = true;
            }
        }
    }

    /// Warns and returns true when a task or arm motion owns the robot.
    /// Arm requests also wait for a running behavior.
    fn reject_while_busy(&self, what: &str, arm: bool) -> bool {
        let busy = if self.tasks.active().is_some() || self.pending_arm.is_some() {
            Some("a task is running")
        } else if self.arm_request.is_some() {
            Some("an arm request is pending")
        } else if arm && self.behavior.is_some() {
            Some("a behavior is driving")
        } else {
            None
        };
        match busy {
            Some(reason) => {
                tracing::warn!("Ignoring {} request, {}", what, reason);
                true
            }
            None => false,
        }
    }

    fn request_arm(&mut self, request: ArmRequest) {
        if !self.reject_while_busy("arm", true) {
            self.arm_request = Some(request);
        }
    }

    fn read_sensors(&mut self, now: f64) {
        if let Some(sample) = self.wheel_feedback.latest_feedback() {
            let delta_time = match self.last_feedback_stamp {
                Some(previous) => (sample.timestamp - previous) as f32,
                None => 0.0,
            };
            self.odometry.update(&sample.wheels, delta_time);
            self.last_feedback_stamp = Some(sample.timestamp);
            self.last_feedback_seen = Some(now);
        }
        if let Some(raw) = self.range_sensor.latest_scan() {
            let scan = self.adapter.normalize(&raw);
            let outcome = self.map.ingest(&scan, &self.odometry.pose());
            tracing::trace!("Scan with {} points: {:?}", scan.len(), outcome);
            self.last_scan_seen = Some(now);
        }
    }

    async fn update_health(&mut self, now: f64) {
        let baseline = *self.sensor_baseline.get_or_insert(now);
        let age = |seen: Option<f64>| now - seen.map_or(baseline, |seen| seen.max(baseline));
        let scan_age = age(self.last_scan_seen);
        let feedback_age = age(self.last_feedback_seen);
        let (sensor, stale_age) = if scan_age >= feedback_age {
            ("range sensor", scan_age)
        } else {
            ("wheel feedback", feedback_age)
        };

        let health = if stale_age > self.config.extended_stale_timeout {
            SensorHealth::Lost
        } else if stale_age > self.config.stale_timeout {
            SensorHealth::Stale
        } else {
            SensorHealth::Ok
        };

        if health != self.health {
            tracing::warn!(
                "Sensor health {:?} -> {:?} ({} {:.2}s old)",
                self.health,
                health,
                sensor,
                stale_age
            );
        }
        match health {
            SensorHealth::Lost if self.health != SensorHealth::Lost => {
                let error = ControllerError::SensorStale {
                    sensor,
                    age_secs: stale_age as f32,
                };
                self.tasks.fail_active(&error);
                self.planner.stop();
                self.pending_arm = None;
                self.behavior = None;
                self.arm_request = None;
                self.write_wheels(WheelCommand::stop());
                if let Err(error) = self.sequencer.halt().await {
                    tracing::error!("Failed to halt arm: {}", error);
                }
            }
            SensorHealth::Lost => {}
            SensorHealth::Stale => {
                self.map.clear();
                self.planner.set_sensor_stale(true);
            }
            SensorHealth::Ok => self.planner.set_sensor_stale(false),
        }
        self.health = health;
    }

    fn advance_mission(&mut self) {
        let directive = if self.tasks.active().is_none() {
            if self.behavior.is_some() {
                return;
            }
            self.tasks.dispatch()
        } else {
            match self.planner.state() {
                state @ (PlannerState::Arrived | PlannerState::Blocked) => self
                    .tasks
                    .on_navigation(state, self.planner.avoiding_ticks()),
                _ => None,
            }
        };
        if let Some(directive) = directive {
            self.apply_directive(directive);
        }
    }

    fn apply_directive(&mut self, directive: MissionDirective) {
        match directive {
            MissionDirective::Navigate(goal) => {
                if let Err(error) = self.planner.set_goal(goal) {
                    tracing::error!("Rejected navigation goal: {}", error);
                    self.tasks.fail_active(&error);
                    self.planner.stop();
                }
            }
            MissionDirective::Pick(_) | MissionDirective::Place(_) => {
                self.planner.stop();
                self.pending_arm = Some(directive);
            }
            MissionDirective::Halt => self.planner.stop(),
        }
    }

    async fn run_arm_phase(&mut self, directive: MissionDirective) -> Result<()> {
        match directive {
            MissionDirective::Pick(effector) => {
                self.sequencer.plan_pick(&effector)?;
                self.execute_arm().await?;
                self.sequencer.verify_grip().await?;
            }
            MissionDirective::Place(effector) => {
                self.sequencer.plan_place(&effector)?;
                self.execute_arm().await?;
            }
            MissionDirective::Navigate(_) | MissionDirective::Halt => return Ok(()),
        }
        self.sequencer.plan_retract().map_err(retract_failed)?;
        self.execute_arm().await.map_err(retract_failed)?;
        Ok(())
    }

    async fn run_arm_request(&mut self, request: &ArmRequest) -> Result<()> {
        match request {
            ArmRequest::Posture(name) => {
                self.sequencer.plan_posture(name)?;
            }
            ArmRequest::Home => {
                self.sequencer.plan_home()?;
            }
            ArmRequest::SetHome => {
                self.sequencer.set_home_from_current().await?;
                return Ok(());
            }
        }
        self.execute_arm().await?;
        Ok(())
    }

    /// Plays the planned trajectory while still listening for commands
    async fn execute_arm(&mut self) -> Result<JointPositions> {
        let abort = self.sequencer.abort_handle();
        let execution = self.sequencer.execute();
        tokio::pin!(execution);
        loop {
            tokio::select! {
                result = &mut execution => return result,
                Some(command) = self.commands.recv() => match command {
                    ControlCommand::Abort => {
                        tracing::warn!("Abort requested during arm motion");
                        abort.abort();
                    }
                    ControlCommand::Shutdown => {
                        self.shutdown = true;
                        abort.abort();
                    }
                    other => self.deferred.push(other),
                },
            }
        }
    }

    fn drive(&mut self) {
        let velocity = self.planner.tick(&self.odometry.pose(), &self.map);
        self.send_velocity(&velocity);
    }

    /// Runs the active behavior on the map around the robot. Holds still
    /// before the first scan and without fresh sensors, an empty map reads
    /// as open space on every side.
    fn drive_behavior(&mut self, now: f64) {
        if self.health != SensorHealth::Ok || self.last_scan_seen.is_none() {
            self.write_wheels(WheelCommand::stop());
            return;
        }
        let pose = self.odometry.pose();
        let readings = WallReadings::from_map(&pose, &self.map, &self.wall_follow);
        let (velocity, finished) = match self.behavior.as_mut() {
            Some(Behavior::Follow(follower)) => match follower.tick(&readings) {
                FollowStep::Drive(velocity) => (velocity, false),
                FollowStep::Done(event) => {
                    tracing::info!("Wall following ended on {:?}", event);
                    (BodyVelocity::zero(), true)
                }
            },
            Some(Behavior::Route(route)) => {
                let velocity = route.tick(now, &pose, &readings);
                (velocity, route.is_finished())
            }
            None => return,
        };
        if finished {
            self.behavior = None;
        }
        self.send_velocity(&velocity);
    }

    fn send_velocity(&mut self, velocity: &BodyVelocity) {
        let command = match self.kinematics.velocity_to_wheel_command(velocity) {
            Ok(command) => command,
            Err(error) => {
                tracing::warn!("Holding previous wheel command: {}", error);
                self.last_wheel_command
            }
        };
        self.write_wheels(command);
    }

    fn write_wheels(&mut self, command: WheelCommand) {
        match self.motor.write_command(&command) {
            Ok(()) => self.last_wheel_command = command,
            Err(error) => tracing::warn!("Motor write failed: {}", error),
        }
    }

    async fn stop_hardware(&mut self) {
        self.planner.stop();
        self.write_wheels(WheelCommand::stop());
        if let Err(error) = self.sequencer.halt().await {
            tracing::error!("Failed to halt arm: {}", error);
        }
        if let Err(error) = self.sequencer.limp().await {
            tracing::error!("Failed to release arm servos: {}", error);
        }
    }

    fn publish(&self, now: f64) {
        self.telemetry.publish(TelemetrySnapshot {
            tick: self.tick,
            timestamp: now,
            pose: self.odometry.pose(),
            planner_state: self.planner.state(),
            goal: self.planner.goal(),
            active_task: self.tasks.active().map(|task| ActiveTask {
                id: task.id,
                status: task.status,
            }),
            pending_tasks: self.tasks.pending_len(),
            completed: self.tasks.completed_count(),
            failed: self.tasks.failed_count(),
            wheel_command: self.last_wheel_command,
            sensor_health: self.health,
            obstacle_cells: self.map.len(),
            behavior: self.behavior(),
        });
    }
}

/// The pick or place already happened, a failing retract must not repeat it
fn retract_failed(error: ControllerError) -> ControllerError {
    match error {
        ControllerError::Unreachable(detail) => ControllerError::RetractFailed(detail),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm_config::ArmConfig;
    use crate::arm_controller::EndEffectorPose;
    use crate::mission::{ManipulationTarget, TaskStatus};
    use crate::simulation::{ServoHandle, SimulatedBase, SimulatedServoDriver, SimulationConfig};
    use nalgebra as na;

    const DT: f64 = 0.05;

    async fn setup() -> (ControlLoop, ControlHandle, SimulatedBase, ServoHandle) {
        let config = RobotConfig::default();
        let base = SimulatedBase::new(
            config.drive.clone(),
            config.range_sensor.clone(),
            SimulationConfig::default(),
            Pose2D::default(),
        );
        let servo = SimulatedServoDriver::new(ArmConfig::default().carry_pose);
        let servo_handle = servo.handle();
        let hardware = Hardware {
            range_sensor: Box::new(base.clone()),
            wheel_feedback: Box::new(base.clone()),
            motor: Box::new(base.clone()),
            servo: Box::new(servo),
        };
        let (control, handle) = ControlLoop::new(config, hardware, Pose2D::default())
            .await
            .unwrap();
        (control, handle, base, servo_handle)
    }

    fn request() -> MissionRequest {
        MissionRequest {
            pick: ManipulationTarget::new(
                Pose2D::new(1.0, 0.0, 0.0),
                EndEffectorPose::new(na::Vector3::new(0.2, 0.0, -0.05), -45.0),
            ),
            place: ManipulationTarget::new(
                Pose2D::new(1.0, 0.5, 0.0),
                EndEffectorPose::new(na::Vector3::new(0.2, 0.0, 0.0), -45.0),
            ),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_loop_holds_still() {
        let (mut control, _handle, base, _) = setup().await;
        for _ in 0..10 {
            base.advance(DT);
            assert!(control.tick(base.time()).await);
        }
        assert_eq!(base.last_command(), WheelCommand::stop());
        assert_eq!(control.planner_state(), PlannerState::Idle);
        assert_eq!(control.sensor_health(), SensorHealth::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn enqueued_task_starts_driving() {
        let (mut control, handle, base, _) = setup().await;
        handle
            .commands
            .send(ControlCommand::Enqueue(request()))
            .await
            .unwrap();
        base.advance(DT);
        control.tick(base.time()).await;
        assert_eq!(control.planner_state(), PlannerState::Seeking);
        assert_eq!(
            control.tasks().active().map(|task| task.status),
            Some(TaskStatus::NavigatingToPick)
        );
        assert!(base.last_command().front_left > 0.0);
        let snapshot = handle.telemetry.borrow().clone();
        assert_eq!(snapshot.tick, 0);
        assert_eq!(snapshot.planner_state, PlannerState::Seeking);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_stops_the_robot() {
        let (mut control, handle, base, _) = setup().await;
        handle
            .commands
            .send(ControlCommand::Enqueue(request()))
            .await
            .unwrap();
        for _ in 0..5 {
            base.advance(DT);
            control.tick(base.time()).await;
        }
        handle.commands.send(ControlCommand::Abort).await.unwrap();
        base.advance(DT);
        control.tick(base.time()).await;
        assert_eq!(base.last_command(), WheelCommand::stop());
        assert_eq!(control.planner_state(), PlannerState::Idle);
        assert_eq!(control.tasks().failed_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_sensors_slow_down_then_stop() {
        let (mut control, handle, base, _) = setup().await;
        handle
            .commands
            .send(ControlCommand::Enqueue(request()))
            .await
            .unwrap();
        base.advance(DT);
        control.tick(base.time()).await;
        base.set_sensors_frozen(true);
        for _ in 0..12 {
            base.advance(DT);
            control.tick(base.time()).await;
        }
        assert_eq!(control.sensor_health(), SensorHealth::Stale);
        assert_eq!(control.planner_state(), PlannerState::Avoiding);
        for _ in 0..30 {
            base.advance(DT);
            control.tick(base.time()).await;
        }
        assert_eq!(control.sensor_health(), SensorHealth::Lost);
        assert_eq!(base.last_command(), WheelCommand::stop());
        let task = control.tasks().archive().next().unwrap();
        assert_eq!(
            task.failure.as_ref().unwrap().reason,
            crate::mission::FailureReason::SensorStale
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pose_correction_replaces_estimate() {
        let (mut control, handle, base, _) = setup().await;
        handle
            .commands
            .send(ControlCommand::CorrectPose(Pose2D::new(2.0, 1.0, 0.5)))
            .await
            .unwrap();
        base.advance(DT);
        control.tick(base.time()).await;
        assert_eq!(control.pose(), Pose2D::new(2.0, 1.0, 0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_ends_the_loop() {
        let (control, handle, _base, servo) = setup().await;
        handle.commands.send(ControlCommand::Shutdown).await.unwrap();
        control.run().await.unwrap();
        let state = servo.snapshot();
        assert!(state.halted);
        assert!(state.limp);
    }

    #[test]
    fn unreachable_retract_is_reported_as_retract_failure() {
        assert!(matches!(
            retract_failed(ControllerError::Unreachable("carry pose".to_owned())),
            ControllerError::RetractFailed(_)
        ));
        assert!(matches!(
            retract_failed(ControllerError::Aborted),
            ControllerError::Aborted
        ));
    }

    async fn step(control: &mut ControlLoop, base: &SimulatedBase, ticks: usize) {
        for _ in 0..ticks {
            base.advance(DT);
            control.tick(base.time()).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn posture_moves_the_arm() {
        let (mut control, handle, base, servo) = setup().await;
        handle
            .commands
            .send(ControlCommand::Posture("base_left_90".to_owned()))
            .await
            .unwrap();
        step(&mut control, &base, 1).await;
        assert_eq!(control.arm_joints().base, 90.0);
        let state = servo.snapshot();
        assert_eq!(state.joints.base, 90.0);
        assert_eq!(state.grip_commands, vec![0.0]);
        assert_eq!(base.last_command(), WheelCommand::stop());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_posture_leaves_the_arm_alone() {
        let (mut control, handle, base, servo) = setup().await;
        handle
            .commands
            .send(ControlCommand::Posture("wave".to_owned()))
            .await
            .unwrap();
        step(&mut control, &base, 2).await;
        assert!(servo.snapshot().commands.is_empty());
        assert_eq!(control.sensor_health(), SensorHealth::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn taught_home_is_where_home_goes() {
        let (mut control, handle, base, servo) = setup().await;
        let taught = JointPositions::new(-30.0, 90.0, -150.0, 60.0);
        servo.set_joints(taught);
        handle.commands.send(ControlCommand::SetHome).await.unwrap();
        step(&mut control, &base, 1).await;
        assert_eq!(control.arm_home(), taught);

        handle
            .commands
            .send(ControlCommand::Posture("base_zero".to_owned()))
            .await
            .unwrap();
        step(&mut control, &base, 1).await;
        assert_eq!(control.arm_joints().base, 0.0);

        handle.commands.send(ControlCommand::Home).await.unwrap();
        step(&mut control, &base, 1).await;
        assert_eq!(control.arm_joints(), taught);
    }

    #[tokio::test(start_paused = true)]
    async fn arm_requests_wait_for_the_task() {
        let (mut control, handle, base, servo) = setup().await;
        handle
            .commands
            .send(ControlCommand::Enqueue(request()))
            .await
            .unwrap();
        step(&mut control, &base, 1).await;
        handle.commands.send(ControlCommand::Home).await.unwrap();
        handle
            .commands
            .send(ControlCommand::FollowWall(FollowMode::Center))
            .await
            .unwrap();
        step(&mut control, &base, 1).await;
        assert!(servo.snapshot().commands.is_empty());
        assert_eq!(control.behavior(), None);
        assert_eq!(control.planner_state(), PlannerState::Seeking);
    }

    #[tokio::test(start_paused = true)]
    async fn behavior_holds_back_queued_tasks() {
        let (mut control, handle, base, servo) = setup().await;
        handle
            .commands
            .send(ControlCommand::FollowWall(FollowMode::Center))
            .await
            .unwrap();
        step(&mut control, &base, 1).await;
        assert_eq!(
            control.behavior(),
            Some(BehaviorKind::FollowWall(FollowMode::Center))
        );
        handle
            .commands
            .send(ControlCommand::Enqueue(request()))
            .await
            .unwrap();
        handle
            .commands
            .send(ControlCommand::Posture("base_zero".to_owned()))
            .await
            .unwrap();
        step(&mut control, &base, 3).await;
        assert!(control.tasks().active().is_none());
        assert_eq!(control.tasks().pending_len(), 1);
        assert!(servo.snapshot().commands.is_empty());
        assert!(base.last_command().front_left > 0.0);
        assert_eq!(handle.telemetry.borrow().behavior, control.behavior());

        handle.commands.send(ControlCommand::Abort).await.unwrap();
        step(&mut control, &base, 1).await;
        assert_eq!(control.behavior(), None);
        assert_eq!(
            control.tasks().active().map(|task| task.status),
            Some(TaskStatus::NavigatingToPick)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn behavior_stops_without_fresh_sensors() {
        let (mut control, handle, base, _) = setup().await;
        handle
            .commands
            .send(ControlCommand::FollowRoute)
            .await
            .unwrap();
        step(&mut control, &base, 2).await;
        assert_eq!(control.behavior(), Some(BehaviorKind::Route));
        base.set_sensors_frozen(true);
        step(&mut control, &base, 12).await;
        assert_eq!(control.sensor_health(), SensorHealth::Stale);
        assert_eq!(base.last_command(), WheelCommand::stop());
        assert_eq!(control.behavior(), Some(BehaviorKind::Route));
        step(&mut control, &base, 30).await;
        assert_eq!(control.sensor_health(), SensorHealth::Lost);
        assert_eq!(control.behavior(), None);
    }
}
