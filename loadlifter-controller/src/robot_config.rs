use crate::arm_config::ArmConfig;
use crate::control_loop::ControlConfig;
use crate::drive_kinematics::DriveConfig;
use crate::mission::MissionConfig;
use crate::navigation::NavigationConfig;
use crate::obstacle_map::ObstacleMapConfig;
use crate::range_sensor::RangeSensorConfig;
use crate::route::RouteConfig;
use crate::wall_follow::WallFollowConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to access config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid json config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid yaml config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Every tunable of the robot. Missing sections and fields fall back to
/// their defaults so partial files stay valid.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct RobotConfig {
    pub control: ControlConfig,
    pub drive: DriveConfig,
    pub range_sensor: RangeSensorConfig,
    pub obstacle_map: ObstacleMapConfig,
    pub navigation: NavigationConfig,
    pub arm: ArmConfig,
    pub mission: MissionConfig,
    pub wall_follow: WallFollowConfig,
    pub route: RouteConfig,
}

fn positive(name: &str, value: f32) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{} must be positive, got {}",
            name, value
        )))
    }
}

impl RobotConfig {
    /// Loadlifter ships with an included config file.
    pub fn included() -> Result<RobotConfig, ConfigError> {
        RobotConfig::parse_json(include_str!("../config/loadlifter.json"))
    }

    pub fn parse_json(text: &str) -> Result<RobotConfig, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn parse_yaml(text: &str) -> Result<RobotConfig, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn serialize_to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn serialize_to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        fs::write(path, self.serialize_to_json()?)?;
        Ok(())
    }

    pub fn save_yaml(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        fs::write(path, self.serialize_to_yaml()?)?;
        Ok(())
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<RobotConfig, ConfigError> {
        RobotConfig::parse_json(&fs::read_to_string(path)?)
    }

    pub fn load_yaml(path: impl AsRef<Path>) -> Result<RobotConfig, ConfigError> {
        RobotConfig::parse_yaml(&fs::read_to_string(path)?)
    }

    /// Picks the parser from the file extension, yaml unless it ends in `.json`
    pub fn load(path: impl AsRef<Path>) -> Result<RobotConfig, ConfigError> {
        let path = path.as_ref();
        let config = match path.extension().and_then(|extension| extension.to_str()) {
            Some("json") => RobotConfig::load_json(path)?,
            _ => RobotConfig::load_yaml(path)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the controller cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("control.rate_hz", self.control.rate_hz)?;
        positive("control.stale_timeout", self.control.stale_timeout as f32)?;
        if self.control.extended_stale_timeout <= self.control.stale_timeout {
            return Err(ConfigError::Invalid(
                "control.extended_stale_timeout must exceed control.stale_timeout".to_owned(),
            ));
        }

        positive("drive.wheelbase", self.drive.wheelbase)?;
        positive("drive.track_width", self.drive.track_width)?;
        positive("drive.wheel_radius", self.drive.wheel_radius)?;
        positive("drive.max_wheel_speed", self.drive.max_wheel_speed)?;
        positive("drive.max_linear_speed", self.drive.max_linear_speed)?;
        positive("drive.max_angular_speed", self.drive.max_angular_speed)?;

        if self.range_sensor.min_range >= self.range_sensor.max_range {
            return Err(ConfigError::Invalid(
                "range_sensor.min_range must be below max_range".to_owned(),
            ));
        }

        positive("obstacle_map.resolution", self.obstacle_map.resolution)?;
        positive("obstacle_map.half_life", self.obstacle_map.half_life)?;
        if self.obstacle_map.eviction_threshold >= self.obstacle_map.query_threshold {
            return Err(ConfigError::Invalid(
                "obstacle_map.eviction_threshold must be below query_threshold".to_owned(),
            ));
        }

        positive("navigation.max_linear_speed", self.navigation.max_linear_speed)?;
        positive("navigation.max_angular_speed", self.navigation.max_angular_speed)?;
        positive("navigation.avoid_speed", self.navigation.avoid_speed)?;
        let approach = self.navigation.min_approach_speed;
        if !(0.0..=self.navigation.max_linear_speed).contains(&approach) {
            return Err(ConfigError::Invalid(format!(
                "navigation.min_approach_speed {} must be within [0, max_linear_speed]",
                approach
            )));
        }
        positive("navigation.safety_envelope", self.navigation.safety_envelope)?;
        if self.navigation.sensing_radius < self.navigation.safety_envelope {
            return Err(ConfigError::Invalid(
                "navigation.sensing_radius must cover the safety envelope".to_owned(),
            ));
        }

        positive("arm.upper_arm_length", self.arm.upper_arm_length)?;
        positive("arm.forearm_length", self.arm.forearm_length)?;
        positive("arm.max_joint_speed", self.arm.max_joint_speed)?;
        positive("arm.point_interval", self.arm.point_interval)?;
        let limits = &self.arm.limits;
        for (joint, limit) in [
            ("base", limits.base),
            ("shoulder", limits.shoulder),
            ("elbow", limits.elbow),
            ("wrist", limits.wrist),
        ] {
            if limit.min >= limit.max {
                return Err(ConfigError::Invalid(format!(
                    "arm.limits.{} is inverted: [{}, {}]",
                    joint, limit.min, limit.max
                )));
            }
        }
        if let Some(joint) = self.arm.limits.violation(&self.arm.carry_pose) {
            return Err(ConfigError::Invalid(format!(
                "arm.carry_pose {} is outside its limits",
                joint
            )));
        }
        for (name, posture) in &self.arm.postures {
            if let Some(joint) = self.arm.limits.violation(&posture.joints) {
                return Err(ConfigError::Invalid(format!(
                    "arm.postures.{} {} is outside its limits",
                    name, joint
                )));
            }
        }
        if let Some(joint) = self
            .arm
            .home_pose
            .and_then(|home| self.arm.limits.violation(&home))
        {
            return Err(ConfigError::Invalid(format!(
                "arm.home_pose {} is outside its limits",
                joint
            )));
        }

        positive("mission.tolerance_radius", self.mission.tolerance_radius)?;
        if !(0.0..=1.0).contains(&self.mission.min_detection_confidence) {
            return Err(ConfigError::Invalid(
                "mission.min_detection_confidence must be within [0, 1]".to_owned(),
            ));
        }

        let wall = &self.wall_follow;
        positive("wall_follow.wall_distance", wall.wall_distance)?;
        positive("wall_follow.front_stop", wall.front_stop)?;
        positive("wall_follow.forward_speed", wall.forward_speed)?;
        positive("wall_follow.max_turn_rate", wall.max_turn_rate)?;
        positive("wall_follow.slowdown_error", wall.slowdown_error)?;
        positive("wall_follow.sensing_radius", wall.sensing_radius)?;
        if !(0.0..=wall.max_turn_rate).contains(&wall.min_turn_rate) {
            return Err(ConfigError::Invalid(format!(
                "wall_follow.min_turn_rate {} must be within [0, max_turn_rate]",
                wall.min_turn_rate
            )));
        }
        if !(0.0..=1.0).contains(&wall.min_forward_fraction) {
            return Err(ConfigError::Invalid(
                "wall_follow.min_forward_fraction must be within [0, 1]".to_owned(),
            ));
        }

        let route = &self.route;
        positive("route.forward_speed", route.forward_speed)?;
        positive("route.turn_rate", route.turn_rate)?;
        positive("route.turn_tolerance", route.turn_tolerance)?;
        positive("route.side_dead_end_stop", route.side_dead_end_stop)?;
        positive("route.side_rejoin_stop", route.side_rejoin_stop)?;
        for (name, seconds) in [
            ("route.forward_after_open", route.forward_after_open),
            ("route.forward_after_open_repeat", route.forward_after_open_repeat),
            ("route.side_entry_forward", route.side_entry_forward),
            ("route.side_exit_forward", route.side_exit_forward),
        ] {
            if !(seconds.is_finite() && seconds >= 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "{} must not be negative, got {}",
                    name, seconds
                )));
            }
        }
        Ok(())
    }
}
