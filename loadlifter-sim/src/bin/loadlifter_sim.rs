use anyhow::{Context, Result};
use clap::Parser;
use loadlifter_controller::{
    arm_controller::EndEffectorPose,
    control_loop::{ControlCommand, ControlLoop, Hardware},
    geometry::Pose2D,
    mission::{ManipulationTarget, MissionRequest, ObjectDetection},
    robot_config::RobotConfig,
    simulation::{
        CircleObstacle, SimulatedBase, SimulatedServoDriver, SimulationConfig, WallSegment,
    },
    telemetry::TelemetrySnapshot,
    wall_follow::FollowMode,
};
use loadlifter_sim::{logging, scenario};
use nalgebra as na;
use std::{path::PathBuf, time::Duration};
use tokio::time::{interval, sleep, MissedTickBehavior};

/// Physics step of the simulated world
const SIM_STEP: Duration = Duration::from_millis(10);

#[derive(Parser)]
#[command(author, version, about = "Run the loadlifter controller against a simulated robot")]
struct Args {
    /// Robot config, JSON or YAML. Uses the included config when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stand pose for the pick as x,y,heading_deg
    #[arg(long, value_parser = scenario::parse_pose, default_value = "1.5,0,0")]
    pick: Pose2D,

    /// Stand pose for the place as x,y,heading_deg. Defaults to the drop-off.
    #[arg(long, value_parser = scenario::parse_pose)]
    place: Option<Pose2D>,

    /// Report a detected box at x,y,z instead of a fixed pick
    #[arg(long, value_parser = scenario::parse_point)]
    detection: Option<na::Vector3<f32>>,

    /// Circular obstacle as x,y,radius, may be repeated
    #[arg(long = "obstacle", value_parser = scenario::parse_obstacle)]
    obstacles: Vec<CircleObstacle>,

    /// Straight wall as x1,y1,x2,y2, may be repeated
    #[arg(long = "wall", value_parser = scenario::parse_wall)]
    walls: Vec<WallSegment>,

    /// Simulate a box that slips out of the gripper
    #[arg(long)]
    empty_grip: bool,

    /// Follow the left or right wall, or center between two, instead of a mission
    #[arg(long, value_parser = scenario::parse_follow_mode, conflicts_with_all = ["route", "posture"])]
    follow_wall: Option<FollowMode>,

    /// Sweep the side channels off the corridor instead of a mission
    #[arg(long, conflicts_with = "posture")]
    route: bool,

    /// Move the arm to a named posture instead of a mission
    #[arg(long)]
    posture: Option<String>,

    /// Give up after this many seconds
    #[arg(long, value_parser = scenario::parse_seconds, default_value = "120")]
    timeout: f64,

    /// Log telemetry every this many seconds
    #[arg(long, value_parser = scenario::parse_seconds, default_value = "1")]
    telemetry_period: f64,

    /// Log as JSON
    #[arg(long)]
    json: bool,

    /// Sets the level of verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// What ends the run
#[derive(Debug, Clone, Copy, PartialEq)]
enum Goal {
    Mission,
    Behavior,
    /// arm requests finish inside the tick that receives them
    ArmByTick(u64),
}

impl Goal {
    fn reached(&self, snapshot: &TelemetrySnapshot, behavior_seen: bool) -> bool {
        match self {
            Goal::Mission => {
                snapshot.completed + snapshot.failed > 0
                    && snapshot.active_task.is_none()
                    && snapshot.pending_tasks == 0
            }
            Goal::Behavior => behavior_seen && snapshot.behavior.is_none(),
            Goal::ArmByTick(tick) => snapshot.tick >= *tick,
        }
    }
}

fn mission_command(args: &Args, config: &RobotConfig) -> ControlCommand {
    match args.detection {
        Some(position) => ControlCommand::Detection(ObjectDetection {
            class: "box".to_owned(),
            position,
            confidence: 1.0,
        }),
        None => {
            let place = match args.place {
                Some(stand_pose) => ManipulationTarget::new(
                    stand_pose,
                    config.mission.drop_off.effector.clone(),
                ),
                None => config.mission.drop_off.clone(),
            };
            ControlCommand::Enqueue(MissionRequest {
                pick: ManipulationTarget::new(
                    args.pick,
                    EndEffectorPose::new(na::Vector3::new(0.2, 0.0, -0.05), -45.0),
                ),
                place,
            })
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::setup_tracing(args.verbose, args.json);

    let config = match &args.config {
        Some(path) => RobotConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => RobotConfig::included()?,
    };

    let base = SimulatedBase::new(
        config.drive.clone(),
        config.range_sensor.clone(),
        SimulationConfig {
            obstacles: args.obstacles.clone(),
            walls: args.walls.clone(),
            ..SimulationConfig::default()
        },
        Pose2D::default(),
    );
    let servo = SimulatedServoDriver::new(config.arm.carry_pose).with_object(!args.empty_grip);
    let hardware = Hardware {
        range_sensor: Box::new(base.clone()),
        wheel_feedback: Box::new(base.clone()),
        motor: Box::new(base.clone()),
        servo: Box::new(servo),
    };

    let (first_command, goal) = if args.route {
        (ControlCommand::FollowRoute, Goal::Behavior)
    } else if let Some(mode) = args.follow_wall {
        (ControlCommand::FollowWall(mode), Goal::Behavior)
    } else if let Some(name) = &args.posture {
        (ControlCommand::Posture(name.clone()), Goal::ArmByTick(0))
    } else {
        (mission_command(&args, &config), Goal::Mission)
    };

    let (control_loop, handle) = ControlLoop::new(config, hardware, Pose2D::default()).await?;
    let mut telemetry = handle.telemetry.clone();
    let control_task = tokio::spawn(control_loop.run());

    tokio::spawn({
        let base = base.clone();
        async move {
            let mut physics = interval(SIM_STEP);
            physics.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                physics.tick().await;
                base.advance(SIM_STEP.as_secs_f64());
            }
        }
    });

    tokio::spawn({
        let commands = handle.commands.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Detected Ctrl+c");
                let _ = commands.send(ControlCommand::Shutdown).await;
            }
        }
    });

    // a tick under way may already have drained the channel, so the
    // request lands one tick later at most
    let goal = match goal {
        Goal::ArmByTick(_) => Goal::ArmByTick(telemetry.borrow().tick + 2),
        other => other,
    };
    handle.commands.send(first_command).await?;
    let mut behavior_seen = false;

    let deadline = sleep(Duration::from_secs_f64(args.timeout));
    tokio::pin!(deadline);
    let mut report = interval(Duration::from_secs_f64(args.telemetry_period));
    loop {
        tokio::select! {
            _ = &mut deadline => {
                tracing::warn!("Timed out after {:.0}s", args.timeout);
                break;
            }
            _ = report.tick() => {
                let snapshot = telemetry.borrow().clone();
                tracing::info!("Telemetry {}", snapshot.to_json()?);
            }
            changed = telemetry.changed() => {
                if changed.is_err() {
                    tracing::info!("Control loop exited");
                    break;
                }
                let snapshot = telemetry.borrow_and_update().clone();
                behavior_seen |= snapshot.behavior.is_some();
                if goal.reached(&snapshot, behavior_seen) {
                    tracing::info!(
                        "Done with {} completed and {} failed, robot at {:?}",
                        snapshot.completed,
                        snapshot.failed,
                        base.pose()
                    );
                    break;
                }
            }
        }
    }

    // fails once the loop already stopped on Ctrl+c
    let _ = handle.commands.send(ControlCommand::Shutdown).await;
    control_task.await??;
    Ok(())
}
