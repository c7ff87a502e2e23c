//! Storage channel sweep.
//!
//! The robot follows the left wall of a main corridor. Every opening on the
//! right is a side channel: it turns in, drives centred to the dead end,
//! turns around and drives back out to continue along the corridor. A wall
//! ahead ends the outbound leg, after which the robot turns around and
//! follows the other wall back to where it came from.

use crate::geometry::{normalize_angle, BodyVelocity, Pose2D};
use crate::wall_follow::{
    FollowEvent, FollowMode, FollowStep, WallFollowConfig, WallFollower, WallReadings, WallSide,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Segments that may finish within a single tick before the rest waits
const MAX_SEGMENTS_PER_TICK: usize = 4;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RouteConfig {
    /// seconds driven past the first opening before turning into it
    pub forward_after_open: f64,
    /// same for every later opening
    pub forward_after_open_repeat: f64,
    /// seconds driven straight into a side channel before centring
    pub side_entry_forward: f64,
    /// front stop at the dead end of a side channel
    pub side_dead_end_stop: f32,
    /// front stop when driving back out, the far corridor wall
    pub side_rejoin_stop: f32,
    /// seconds driven straight before turning back into the corridor
    pub side_exit_forward: f64,
    /// the first opening only counts after the right side was seen closed
    pub require_rearm: bool,
    /// m/s on the timed straight legs
    pub forward_speed: f32,
    /// rad/s
    pub turn_rate: f32,
    pub kp_turn: f32,
    /// degrees
    pub turn_tolerance: f32,
}

impl Default for RouteConfig {
    fn default() -> Self {
        RouteConfig {
            forward_after_open: 1.0,
            forward_after_open_repeat: 1.0,
            side_entry_forward: 1.0,
            side_dead_end_stop: 0.25,
            side_rejoin_stop: 0.54,
            side_exit_forward: 0.5,
            require_rearm: false,
            forward_speed: 0.15,
            turn_rate: 0.8,
            kp_turn: 2.0,
            turn_tolerance: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RouteSegment {
    /// Left wall along the main corridor until the right side opens or a
    /// wall shows up ahead
    Corridor { require_rearm: bool },
    Follow {
        mode: FollowMode,
        front_stop: Option<f32>,
    },
    Straight { seconds: f64 },
    /// Turn in place, positive is counter-clockwise
    Turn { degrees: f32 },
}

#[derive(Debug, Clone, PartialEq)]
enum ActiveSegment {
    Follow {
        follower: WallFollower,
        corridor: bool,
    },
    Straight {
        until: f64,
    },
    Turn {
        /// radians still to go
        remaining: f32,
        last_heading: f32,
    },
}

pub struct RouteFollower {
    config: RouteConfig,
    wall: WallFollowConfig,
    segments: VecDeque<RouteSegment>,
    active: Option<ActiveSegment>,
    side_channels: u32,
    finished: bool,
}

impl RouteFollower {
    pub fn new(config: RouteConfig, wall: WallFollowConfig) -> Self {
        let first = RouteSegment::Corridor {
            require_rearm: config.require_rearm,
        };
        RouteFollower {
            config,
            wall,
            segments: VecDeque::from([first]),
            active: None,
            side_channels: 0,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Side channels entered so far
    pub fn side_channels(&self) -> u32 {
        self.side_channels
    }

    /// Segments still queued after the running one
    pub fn remaining(&self) -> impl Iterator<Item = &RouteSegment> {
        self.segments.iter()
    }

    /// Velocity for this tick, zero once the route is done
    pub fn tick(&mut self, now: f64, pose: &Pose2D, readings: &WallReadings) -> BodyVelocity {
        for _ in 0..MAX_SEGMENTS_PER_TICK {
            if self.finished {
                return BodyVelocity::zero();
            }
            if self.active.is_none() {
                match self.segments.pop_front() {
                    Some(segment) => self.start(segment, now, pose),
                    None => {
                        tracing::info!(
                            "Route finished after {} side channels",
                            self.side_channels
                        );
                        self.finished = true;
                        return BodyVelocity::zero();
                    }
                }
            }
            if let Some(velocity) = self.step(now, pose, readings) {
                return velocity;
            }
            self.active = None;
        }
        BodyVelocity::zero()
    }

    fn start(&mut self, segment: RouteSegment, now: f64, pose: &Pose2D) {
        tracing::debug!("Route segment {:?}", segment);
        let active = match segment {
            RouteSegment::Corridor { require_rearm } => ActiveSegment::Follow {
                follower: WallFollower::new(self.wall.clone(), FollowMode::Wall(WallSide::Left))
                    .until_side_opens(require_rearm),
                corridor: true,
            },
            RouteSegment::Follow { mode, front_stop } => {
                let follower = WallFollower::new(self.wall.clone(), mode);
                ActiveSegment::Follow {
                    follower: match front_stop {
                        Some(distance) => follower.with_front_stop(distance),
                        None => follower,
                    },
                    corridor: false,
                }
            }
            RouteSegment::Straight { seconds } => ActiveSegment::Straight {
                until: now + seconds,
            },
            RouteSegment::Turn { degrees } => ActiveSegment::Turn {
                remaining: degrees.to_radians(),
                last_heading: pose.heading,
            },
        };
        self.active = Some(active);
    }

    /// None once the running segment is done
    fn step(&mut self, now: f64, pose: &Pose2D, readings: &WallReadings) -> Option<BodyVelocity> {
        let event = match self.active.as_mut()? {
            ActiveSegment::Follow { follower, corridor } => match follower.tick(readings) {
                FollowStep::Drive(velocity) => return Some(velocity),
                FollowStep::Done(event) if *corridor => event,
                FollowStep::Done(_) => return None,
            },
            ActiveSegment::Straight { until } => {
                if now >= *until {
                    return None;
                }
                if readings.front <= self.wall.front_stop {
                    tracing::warn!("Straight leg cut short, {:.2}m ahead", readings.front);
                    return None;
                }
                return Some(BodyVelocity::new(self.config.forward_speed, 0.0, 0.0));
            }
            ActiveSegment::Turn {
                remaining,
                last_heading,
            } => {
                *remaining -= normalize_angle(pose.heading - *last_heading);
                *last_heading = pose.heading;
                if remaining.abs() <= self.config.turn_tolerance.to_radians() {
                    return None;
                }
                let rate = (self.config.kp_turn * *remaining)
                    .clamp(-self.config.turn_rate, self.config.turn_rate);
                return Some(BodyVelocity::new(0.0, 0.0, rate));
            }
        };
        self.corridor_event(event);
        None
    }

    fn corridor_event(&mut self, event: FollowEvent) {
        match event {
            FollowEvent::FrontStop => {
                tracing::info!("End of corridor, heading back along the right wall");
                self.segments.extend([
                    RouteSegment::Turn { degrees: 180.0 },
                    RouteSegment::Follow {
                        mode: FollowMode::Wall(WallSide::Right),
                        front_stop: None,
                    },
                    RouteSegment::Turn { degrees: 180.0 },
                ]);
            }
            FollowEvent::SideOpen => {
                let forward = if self.side_channels == 0 {
                    self.config.forward_after_open
                } else {
                    self.config.forward_after_open_repeat
                };
                self.side_channels += 1;
                tracing::info!("Side channel {} opens on the right", self.side_channels);
                self.segments.extend([
                    RouteSegment::Straight { seconds: forward },
                    RouteSegment::Turn { degrees: -90.0 },
                    RouteSegment::Straight {
                        seconds: self.config.side_entry_forward,
                    },
                    RouteSegment::Follow {
                        mode: FollowMode::Center,
                        front_stop: Some(self.config.side_dead_end_stop),
                    },
                    RouteSegment::Turn { degrees: 180.0 },
                    RouteSegment::Follow {
                        mode: FollowMode::Center,
                        front_stop: Some(self.config.side_rejoin_stop),
                    },
                    RouteSegment::Straight {
                        seconds: self.config.side_exit_forward,
                    },
                    RouteSegment::Turn { degrees: -90.0 },
                    RouteSegment::Corridor {
                        require_rearm: true,
                    },
                ]);
            }
        }
    }
}
