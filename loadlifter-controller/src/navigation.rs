//! Reactive navigation planner.
//!
//! Produces one body velocity per control tick from the current pose, the
//! active goal and the local obstacle map. Behavior is an explicit state
//! machine so every transition can be exercised on its own:
//!
//! - `Idle` until a goal is set
//! - `Seeking` drives straight for the goal while the direct path is clear
//! - `Avoiding` follows a potential field (summed repulsion + attraction +
//!   circulation around cells that block the path)
//! - `Arrived` once inside both tolerances
//! - `Blocked` when avoidance stops making progress

use crate::error::{ensure_finite, Result};
use crate::geometry::{normalize_angle, BodyVelocity, Pose2D};
use crate::obstacle_map::{LocalObstacleMap, ObstacleCell, Region};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::f32::consts::{FRAC_PI_2, PI};

/// Closest distance used when computing repulsion, avoids blowing up
const MIN_REPULSION_DISTANCE: f32 = 0.05;
/// lateral sums (meters) closer to zero than this count as balanced
const LATERAL_TIE_TOLERANCE: f32 = 1e-3;
/// cells this close to the robot to goal line block it head on
const CENTERLINE_HALF_WIDTH: f32 = 0.05;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct NavigationConfig {
    /// m/s
    pub max_linear_speed: f32,
    /// rad/s
    pub max_angular_speed: f32,
    /// floor for the approach speed so the goal is reached in finite time
    pub min_approach_speed: f32,
    pub kp_linear: f32,
    pub kp_heading: f32,
    /// within this distance the robot turns toward the goal heading
    /// instead of toward the goal position
    pub heading_blend_distance: f32,
    /// half width of the corridor along the direct path that must be clear
    pub safety_envelope: f32,
    pub sensing_radius: f32,
    /// translation speed while avoiding
    pub avoid_speed: f32,
    pub attraction_gain: f32,
    pub repulsion_gain: f32,
    pub circulation_gain: f32,
    /// consecutive clear ticks needed to go back to seeking
    pub clear_ticks: u32,
    /// avoiding ticks tolerated before progress is checked
    pub avoid_tick_budget: u32,
    /// ticks over which distance to goal must shrink
    pub progress_window: usize,
    /// meters the distance to goal must shrink over the window
    pub min_progress: f32,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        NavigationConfig {
            max_linear_speed: 0.3,
            max_angular_speed: 1.0,
            min_approach_speed: 0.04,
            kp_linear: 1.0,
            kp_heading: 2.0,
            heading_blend_distance: 0.3,
            safety_envelope: 0.3,
            sensing_radius: 1.0,
            avoid_speed: 0.15,
            attraction_gain: 1.0,
            repulsion_gain: 0.02,
            circulation_gain: 1.0,
            clear_ticks: 5,
            avoid_tick_budget: 100,
            progress_window: 40,
            min_progress: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NavGoal {
    pub target: Pose2D,
    /// meters
    pub tolerance_radius: f32,
    /// radians
    pub tolerance_heading: f32,
}

impl NavGoal {
    pub fn new(target: Pose2D, tolerance_radius: f32, tolerance_heading: f32) -> Self {
        NavGoal {
            target,
            tolerance_radius,
            tolerance_heading,
        }
    }

    pub fn with_degrees(target: Pose2D, tolerance_radius: f32, tolerance_heading_deg: f32) -> Self {
        NavGoal::new(target, tolerance_radius, tolerance_heading_deg.to_radians())
    }

    /// Same target with both tolerances widened
    pub fn relaxed(&self, factor: f32) -> Self {
        NavGoal {
            target: self.target,
            tolerance_radius: self.tolerance_radius * factor,
            tolerance_heading: (self.tolerance_heading * factor).min(PI),
        }
    }

    fn validate(&self) -> Result<()> {
        ensure_finite("goal x", self.target.x)?;
        ensure_finite("goal y", self.target.y)?;
        ensure_finite("goal heading", self.target.heading)?;
        ensure_finite("tolerance radius", self.tolerance_radius)?;
        ensure_finite("tolerance heading", self.tolerance_heading)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PlannerState {
    #[default]
    Idle,
    Seeking,
    Avoiding,
    Arrived,
    Blocked,
}

pub struct NavigationPlanner {
    config: NavigationConfig,
    state: PlannerState,
    goal: Option<NavGoal>,
    clear_streak: u32,
    avoiding_ticks: u32,
    progress: VecDeque<f32>,
    /// +1 circulates counter-clockwise (pass on the left), -1 clockwise,
    /// 0 for a balanced field
    circulation_side: f32,
    sensor_stale: bool,
}

impl NavigationPlanner {
    pub fn new(config: NavigationConfig) -> Self {
        NavigationPlanner {
            config,
            state: PlannerState::Idle,
            goal: None,
            clear_streak: 0,
            avoiding_ticks: 0,
            progress: VecDeque::new(),
            circulation_side: 1.0,
            sensor_stale: false,
        }
    }

    pub fn state(&self) -> PlannerState {
        self.state
    }

    pub fn goal(&self) -> Option<NavGoal> {
        self.goal
    }

    pub fn avoiding_ticks(&self) -> u32 {
        self.avoiding_ticks
    }

    pub fn set_goal(&mut self, goal: NavGoal) -> Result<()> {
        goal.validate()?;
        tracing::info!(
            "New goal ({:.2}, {:.2}, {:.1}°) tolerance {:.3}m / {:.1}°",
            goal.target.x,
            goal.target.y,
            goal.target.heading.to_degrees(),
            goal.tolerance_radius,
            goal.tolerance_heading.to_degrees()
        );
        self.goal = Some(goal);
        self.reset_avoidance();
        self.transition(PlannerState::Seeking);
        Ok(())
    }

    /// Drop the goal and hold still
    pub fn stop(&mut self) {
        self.goal = None;
        self.reset_avoidance();
        self.transition(PlannerState::Idle);
    }

    /// While sensors are stale the map cannot be trusted to be clear
    pub fn set_sensor_stale(&mut self, stale: bool) {
        if stale != self.sensor_stale {
            tracing::warn!("Navigation cautious mode {}", if stale { "on" } else { "off" });
        }
        self.sensor_stale = stale;
    }

    fn reset_avoidance(&mut self) {
        self.clear_streak = 0;
        self.avoiding_ticks = 0;
        self.progress.clear();
    }

    fn transition(&mut self, next: PlannerState) {
        if self.state != next {
            tracing::info!("Navigation {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    pub fn tick(&mut self, pose: &Pose2D, map: &LocalObstacleMap) -> BodyVelocity {
        let goal = match (self.state, self.goal) {
            (PlannerState::Seeking, Some(goal)) | (PlannerState::Avoiding, Some(goal)) => goal,
            _ => return BodyVelocity::zero(),
        };

        let distance = pose.distance_to(goal.target.x, goal.target.y);
        if distance <= goal.tolerance_radius {
            let heading_error = normalize_angle(goal.target.heading - pose.heading);
            if heading_error.abs() <= goal.tolerance_heading {
                self.transition(PlannerState::Arrived);
                return BodyVelocity::zero();
            }
            return BodyVelocity::new(0.0, 0.0, self.steer(heading_error));
        }

        let cells = map.query(&Region::around(pose, self.config.sensing_radius));
        let blocking = self.blocking_cells(pose, &goal, distance, &cells);

        match self.state {
            PlannerState::Seeking => {
                if blocking.is_empty() && !self.sensor_stale {
                    return self.seek(pose, &goal, distance);
                }
                tracing::debug!("{} cells block the direct path", blocking.len());
                self.enter_avoiding(pose, &goal, distance, &blocking);
                self.avoid(pose, &goal, distance, &cells, !blocking.is_empty())
            }
            _ => {
                if blocking.is_empty() && !self.sensor_stale {
                    self.clear_streak += 1;
                } else {
                    self.clear_streak = 0;
                }
                if self.clear_streak >= self.config.clear_ticks {
                    self.reset_avoidance();
                    self.transition(PlannerState::Seeking);
                    return self.seek(pose, &goal, distance);
                }

                self.avoiding_ticks += 1;
                self.progress.push_back(distance);
                while self.progress.len() > self.config.progress_window {
                    self.progress.pop_front();
                }
                if self.is_stuck() {
                    tracing::warn!(
                        "No progress after {} avoiding ticks, {:.2}m from goal",
                        self.avoiding_ticks,
                        distance
                    );
                    self.transition(PlannerState::Blocked);
                    return BodyVelocity::zero();
                }
                self.avoid(pose, &goal, distance, &cells, !blocking.is_empty())
            }
        }
    }

    fn is_stuck(&self) -> bool {
        if self.avoiding_ticks <= self.config.avoid_tick_budget
            || self.progress.len() < self.config.progress_window
        {
            return false;
        }
        match (self.progress.front(), self.progress.back()) {
            (Some(oldest), Some(newest)) => oldest - newest < self.config.min_progress,
            _ => false,
        }
    }

    fn enter_avoiding(
        &mut self,
        pose: &Pose2D,
        goal: &NavGoal,
        distance: f32,
        blocking: &[ObstacleCell],
    ) {
        let (ux, uy) = unit_towards(pose, goal, distance);
        let lateral_sum: f32 = blocking
            .iter()
            .map(|cell| ux * (cell.y - pose.y) - uy * (cell.x - pose.x))
            .sum();
        let on_centerline = blocking.iter().any(|cell| {
            (ux * (cell.y - pose.y) - uy * (cell.x - pose.x)).abs() <= CENTERLINE_HALF_WIDTH
        });
        // pass on the side away from the obstacles. A balanced field only
        // circulates when something sits on the path itself, left then.
        // Otherwise the repulsion cancels sideways into a straight retreat.
        self.circulation_side = if lateral_sum > LATERAL_TIE_TOLERANCE {
            -1.0
        } else if lateral_sum < -LATERAL_TIE_TOLERANCE {
            1.0
        } else if on_centerline {
            1.0
        } else {
            0.0
        };
        self.reset_avoidance();
        self.avoiding_ticks = 1;
        self.progress.push_back(distance);
        self.transition(PlannerState::Avoiding);
    }

    /// Occupied cells inside the corridor between the robot and the goal
    fn blocking_cells(
        &self,
        pose: &Pose2D,
        goal: &NavGoal,
        distance: f32,
        cells: &[ObstacleCell],
    ) -> Vec<ObstacleCell> {
        let (ux, uy) = unit_towards(pose, goal, distance);
        let reach = (distance + self.config.safety_envelope).min(self.config.sensing_radius);
        cells
            .iter()
            .filter(|cell| {
                let rx = cell.x - pose.x;
                let ry = cell.y - pose.y;
                let along = rx * ux + ry * uy;
                let lateral = ux * ry - uy * rx;
                along > 0.0 && along <= reach && lateral.abs() <= self.config.safety_envelope
            })
            .copied()
            .collect()
    }

    fn steer(&self, heading_error: f32) -> f32 {
        (self.config.kp_heading * heading_error).clamp(
            -self.config.max_angular_speed,
            self.config.max_angular_speed,
        )
    }

    fn seek(&self, pose: &Pose2D, goal: &NavGoal, distance: f32) -> BodyVelocity {
        let speed = (self.config.kp_linear * distance).clamp(
            self.config.min_approach_speed,
            self.config.max_linear_speed,
        );
        let (ux, uy) = unit_towards(pose, goal, distance);
        let (bx, by) = pose.world_to_body(ux, uy);
        let facing = if distance > self.config.heading_blend_distance {
            pose.bearing_to(goal.target.x, goal.target.y)
        } else {
            goal.target.heading
        };
        let heading_error = normalize_angle(facing - pose.heading);
        BodyVelocity::new(bx * speed, by * speed, self.steer(heading_error))
    }

    fn avoid(
        &self,
        pose: &Pose2D,
        goal: &NavGoal,
        distance: f32,
        cells: &[ObstacleCell],
        path_blocked: bool,
    ) -> BodyVelocity {
        let (ux, uy) = unit_towards(pose, goal, distance);
        let (rx, ry) = repulsion(pose, cells, self.config.sensing_radius, self.config.repulsion_gain);
        let (cx, cy) = if path_blocked {
            let strength = self.config.circulation_gain * self.circulation_side;
            (-uy * strength, ux * strength)
        } else {
            (0.0, 0.0)
        };
        let dx = ux * self.config.attraction_gain + rx + cx;
        let dy = uy * self.config.attraction_gain + ry + cy;
        let norm = (dx * dx + dy * dy).sqrt();
        if norm < 1e-6 {
            return BodyVelocity::zero();
        }

        let (bx, by) = pose.world_to_body(dx / norm, dy / norm);
        let direction = by.atan2(bx);
        // retreating: keep the rear toward the motion instead of spinning around
        let heading_error = if direction.abs() <= FRAC_PI_2 {
            direction
        } else {
            normalize_angle(direction - PI)
        };
        BodyVelocity::new(
            bx * self.config.avoid_speed,
            by * self.config.avoid_speed,
            self.steer(heading_error),
        )
    }
}

fn unit_towards(pose: &Pose2D, goal: &NavGoal, distance: f32) -> (f32, f32) {
    if distance <= f32::EPSILON {
        return pose.body_to_world(1.0, 0.0);
    }
    (
        (goal.target.x - pose.x) / distance,
        (goal.target.y - pose.y) / distance,
    )
}

/// Sum of repulsive vectors (world frame) from every cell within `radius`.
///
/// Every cell contributes, so equidistant cells on opposite sides cancel
/// sideways and leave a straight push back.
pub fn repulsion(pose: &Pose2D, cells: &[ObstacleCell], radius: f32, gain: f32) -> (f32, f32) {
    cells.iter().fold((0.0, 0.0), |(sum_x, sum_y), cell| {
        let dx = pose.x - cell.x;
        let dy = pose.y - cell.y;
        let distance = (dx * dx + dy * dy).sqrt();
        if distance >= radius {
            return (sum_x, sum_y);
        }
        let clamped = distance.max(MIN_REPULSION_DISTANCE);
        let magnitude = gain * (1.0 / clamped - 1.0 / radius) / clamped;
        if distance <= f32::EPSILON {
            // on top of the cell, push straight back
            let (bx, by) = pose.body_to_world(-1.0, 0.0);
            return (sum_x + bx * magnitude, sum_y + by * magnitude);
        }
        (
            sum_x + dx / distance * magnitude,
            sum_y + dy / distance * magnitude,
        )
    })
}
