//! Read-only controller snapshot for operator consoles.

use crate::drive_kinematics::WheelCommand;
use crate::geometry::Pose2D;
use crate::mission::{TaskId, TaskStatus};
use crate::navigation::{NavGoal, PlannerState};
use crate::wall_follow::FollowMode;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SensorHealth {
    #[default]
    Ok,
    /// no fresh data within the stale timeout, driving cautiously
    Stale,
    /// no fresh data within the extended timeout, robot stopped
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTask {
    pub id: TaskId,
    pub status: TaskStatus,
}

/// Operator behavior driving the wheels instead of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BehaviorKind {
    FollowWall(FollowMode),
    Route,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TelemetrySnapshot {
    pub tick: u64,
    /// seconds on the controller clock
    pub timestamp: f64,
    pub pose: Pose2D,
    pub planner_state: PlannerState,
    pub goal: Option<NavGoal>,
    pub active_task: Option<ActiveTask>,
    pub pending_tasks: usize,
    pub completed: u64,
    pub failed: u64,
    pub wheel_command: WheelCommand,
    pub sensor_health: SensorHealth,
    pub obstacle_cells: usize,
    pub behavior: Option<BehaviorKind>,
}

impl TelemetrySnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Publishes whole snapshots, readers always see the latest one
pub struct TelemetryPublisher {
    sender: watch::Sender<TelemetrySnapshot>,
}

impl TelemetryPublisher {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(TelemetrySnapshot::default());
        TelemetryPublisher { sender }
    }

    pub fn publish(&self, snapshot: TelemetrySnapshot) {
        self.sender.send_replace(snapshot);
    }

    pub fn subscribe(&self) -> watch::Receiver<TelemetrySnapshot> {
        self.sender.subscribe()
    }

    pub fn latest(&self) -> TelemetrySnapshot {
        self.sender.borrow().clone()
    }
}

impl Default for TelemetryPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_see_latest_snapshot() {
        let publisher = TelemetryPublisher::new();
        let receiver = publisher.subscribe();
        publisher.publish(TelemetrySnapshot {
            tick: 1,
            ..TelemetrySnapshot::default()
        });
        publisher.publish(TelemetrySnapshot {
            tick: 2,
            ..TelemetrySnapshot::default()
        });
        assert_eq!(receiver.borrow().tick, 2);
        assert_eq!(publisher.latest().tick, 2);
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let publisher = TelemetryPublisher::new();
        publisher.publish(TelemetrySnapshot {
            tick: 7,
            ..TelemetrySnapshot::default()
        });
        assert_eq!(publisher.latest().tick, 7);
    }

    #[test]
    fn serializes_to_json() {
        let snapshot = TelemetrySnapshot {
            active_task: Some(ActiveTask {
                id: 3,
                status: TaskStatus::Picking,
            }),
            sensor_health: SensorHealth::Stale,
            behavior: Some(BehaviorKind::FollowWall(FollowMode::Wall(
                crate::wall_follow::WallSide::Left,
            ))),
            ..TelemetrySnapshot::default()
        };
        let json = snapshot.to_json().unwrap();
        assert!(json.contains("\"Picking\""));
        assert!(json.contains("\"Stale\""));
        assert!(json.contains("\"FollowWall\""));
        let parsed: TelemetrySnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, snapshot);
    }
}
