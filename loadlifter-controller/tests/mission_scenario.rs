use loadlifter_controller::{
    arm_controller::EndEffectorPose,
    control_loop::{ControlCommand, ControlHandle, ControlLoop, Hardware},
    drive_kinematics::WheelCommand,
    geometry::Pose2D,
    mission::{FailureReason, ManipulationTarget, MissionRequest, TaskStatus},
    navigation::PlannerState,
    robot_config::RobotConfig,
    simulation::{CircleObstacle, ServoHandle, SimulatedBase, SimulatedServoDriver, SimulationConfig},
    telemetry::SensorHealth,
};
use nalgebra as na;
use std::time::Duration;

const DT: f64 = 0.05;

struct Scenario {
    control: ControlLoop,
    handle: ControlHandle,
    base: SimulatedBase,
    servo: ServoHandle,
}

impl Scenario {
    async fn new(obstacles: Vec<CircleObstacle>, object_present: bool) -> Scenario {
        let config = RobotConfig::included().unwrap();
        let base = SimulatedBase::new(
            config.drive.clone(),
            config.range_sensor.clone(),
            SimulationConfig {
                obstacles,
                ..SimulationConfig::default()
            },
            Pose2D::default(),
        );
        let servo = SimulatedServoDriver::new(config.arm.carry_pose).with_object(object_present);
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
        Scenario {
            control,
            handle,
            base,
            servo: servo_handle,
        }
    }

    async fn step(&mut self) {
        self.base.advance(DT);
        assert!(self.control.tick(self.base.time()).await);
    }

    /// Steps until `done` holds, returns false if it never did
    async fn run_until(&mut self, max_ticks: usize, done: impl Fn(&ControlLoop) -> bool) -> bool {
        for _ in 0..max_ticks {
            self.step().await;
            if done(&self.control) {
                return true;
            }
        }
        false
    }

    async fn send(&self, command: ControlCommand) {
        self.handle.commands.send(command).await.unwrap();
    }
}

fn pick_and_place(pick: Pose2D, place: Pose2D) -> MissionRequest {
    MissionRequest {
        pick: ManipulationTarget::new(
            pick,
            EndEffectorPose::new(na::Vector3::new(0.2, 0.0, -0.05), -45.0),
        ),
        place: ManipulationTarget::new(
            place,
            EndEffectorPose::new(na::Vector3::new(0.2, 0.0, 0.0), -45.0),
        ),
    }
}

#[tokio::test(start_paused = true)]
async fn completes_pick_and_place() {
    let mut scenario = Scenario::new(vec![], true).await;
    scenario
        .send(ControlCommand::Enqueue(pick_and_place(
            Pose2D::new(1.0, 0.0, 0.0),
            Pose2D::new(1.0, 0.5, 0.0),
        )))
        .await;

    let completed = scenario
        .run_until(2000, |control| control.tasks().completed_count() == 1)
        .await;
    assert!(completed);
    assert_eq!(scenario.control.tasks().failed_count(), 0);
    assert!(scenario.control.tasks().active().is_none());

    let pose = scenario.base.pose();
    assert!(pose.distance_to(1.0, 0.5) < 0.1, "ended at {:?}", pose);

    // open, close around the box, then open again to release it
    let servo = scenario.servo.snapshot();
    assert_eq!(servo.grip_commands, vec![0.0, 1.0, 0.0]);
    assert!(servo.commands.len() > 4);

    scenario.step().await;
    assert_eq!(scenario.base.last_command(), WheelCommand::stop());
    assert_eq!(scenario.control.planner_state(), PlannerState::Idle);
    let telemetry = scenario.handle.telemetry.borrow().clone();
    assert_eq!(telemetry.completed, 1);
    assert_eq!(telemetry.active_task, None);
}

#[tokio::test(start_paused = true)]
async fn empty_grip_fails_the_task() {
    let mut scenario = Scenario::new(vec![], false).await;
    scenario
        .send(ControlCommand::Enqueue(pick_and_place(
            Pose2D::new(0.5, 0.0, 0.0),
            Pose2D::new(0.0, 0.0, 0.0),
        )))
        .await;

    let failed = scenario
        .run_until(1000, |control| control.tasks().failed_count() == 1)
        .await;
    assert!(failed);
    let task = scenario.control.tasks().archive().next().unwrap();
    let failure = task.failure.as_ref().unwrap();
    assert_eq!(failure.reason, FailureReason::GripVerificationFailed);
    assert_eq!(failure.last_status, TaskStatus::Picking);
}

#[tokio::test(start_paused = true)]
async fn drives_around_an_obstacle() {
    let obstacle = CircleObstacle::new(1.0, -0.05, 0.1);
    let mut scenario = Scenario::new(vec![obstacle], true).await;
    scenario
        .send(ControlCommand::Enqueue(pick_and_place(
            Pose2D::new(2.0, 0.0, 0.0),
            Pose2D::new(2.0, 0.5, 0.0),
        )))
        .await;

    let mut avoided = false;
    let mut closest = f32::INFINITY;
    for _ in 0..3000 {
        scenario.step().await;
        avoided |= scenario.control.planner_state() == PlannerState::Avoiding;
        let pose = scenario.base.pose();
        closest = closest.min(pose.distance_to(obstacle.x, obstacle.y));
        let status = scenario.control.tasks().active().map(|task| task.status);
        if status != Some(TaskStatus::NavigatingToPick) {
            break;
        }
    }

    assert!(avoided);
    assert!(closest > obstacle.radius, "came within {:.3}m", closest);
    assert!(scenario.base.pose().distance_to(2.0, 0.0) < 0.1);
}

#[tokio::test(start_paused = true)]
async fn abort_during_arm_motion_halts_the_arm() {
    let mut scenario = Scenario::new(vec![], true).await;
    scenario
        .send(ControlCommand::Enqueue(pick_and_place(
            Pose2D::new(0.3, 0.0, 0.0),
            Pose2D::new(0.0, 0.0, 0.0),
        )))
        .await;

    let arrived = scenario
        .run_until(1000, |control| control.planner_state() == PlannerState::Arrived)
        .await;
    assert!(arrived);

    let commands = scenario.handle.commands.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        commands.send(ControlCommand::Abort).await.unwrap();
    });
    // the pick runs inside this tick
    scenario.step().await;

    let task = scenario.control.tasks().archive().next().unwrap();
    let failure = task.failure.as_ref().unwrap();
    assert_eq!(failure.reason, FailureReason::Aborted);
    assert_eq!(failure.last_status, TaskStatus::Picking);
    assert!(scenario.servo.snapshot().halted);
    assert_eq!(scenario.base.last_command(), WheelCommand::stop());
}

#[tokio::test(start_paused = true)]
async fn lost_sensors_stop_the_robot() {
    let mut scenario = Scenario::new(vec![], true).await;
    scenario
        .send(ControlCommand::Enqueue(pick_and_place(
            Pose2D::new(3.0, 0.0, 0.0),
            Pose2D::new(0.0, 0.0, 0.0),
        )))
        .await;
    scenario.run_until(10, |_| false).await;
    assert!(scenario.base.last_command().front_left > 0.0);

    scenario.base.set_sensors_frozen(true);
    let lost = scenario
        .run_until(100, |control| control.sensor_health() == SensorHealth::Lost)
        .await;
    assert!(lost);
    assert_eq!(scenario.base.last_command(), WheelCommand::stop());
    assert_eq!(scenario.control.tasks().failed_count(), 1);

    // the robot stays put while nothing comes back
    let pose = scenario.base.pose();
    scenario.run_until(20, |_| false).await;
    assert_eq!(scenario.base.pose(), pose);

    scenario.base.set_sensors_frozen(false);
    let recovered = scenario
        .run_until(10, |control| control.sensor_health() == SensorHealth::Ok)
        .await;
    assert!(recovered);
}

#[tokio::test(start_paused = true)]
async fn detections_become_tasks() {
    let mut scenario = Scenario::new(vec![], true).await;
    scenario
        .send(ControlCommand::Detection(
            loadlifter_controller::mission::ObjectDetection {
                class: "box".to_owned(),
                position: na::Vector3::new(1.5, 0.0, 0.0),
                confidence: 0.9,
            },
        ))
        .await;
    scenario
        .send(ControlCommand::Detection(
            loadlifter_controller::mission::ObjectDetection {
                class: "box".to_owned(),
                position: na::Vector3::new(1.5, 1.0, 0.0),
                confidence: 0.2,
            },
        ))
        .await;
    scenario.step().await;
    assert_eq!(
        scenario.control.tasks().active().map(|task| task.status),
        Some(TaskStatus::NavigatingToPick)
    );
    assert_eq!(scenario.control.tasks().pending_len(), 0);
    assert_eq!(scenario.control.planner_state(), PlannerState::Seeking);
}
