use crate::arm_driver::{GripCommand, JointPositions};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hard joint range in degrees
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct JointLimit {
    pub min: f32,
    pub max: f32,
}

impl JointLimit {
    pub fn new(min: f32, max: f32) -> JointLimit {
        JointLimit { min, max }
    }

    pub fn contains(&self, angle: f32) -> bool {
        angle >= self.min && angle <= self.max
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JointLimits {
    pub base: JointLimit,
    pub shoulder: JointLimit,
    pub elbow: JointLimit,
    pub wrist: JointLimit,
}

impl Default for JointLimits {
    fn default() -> Self {
        JointLimits {
            base: JointLimit::new(-120.0, 120.0),
            shoulder: JointLimit::new(-30.0, 150.0),
            elbow: JointLimit::new(-160.0, 10.0),
            wrist: JointLimit::new(-120.0, 120.0),
        }
    }
}

impl JointLimits {
    /// Name of the first joint outside its range
    pub fn violation(&self, joints: &JointPositions) -> Option<&'static str> {
        [
            ("base", self.base, joints.base),
            ("shoulder", self.shoulder, joints.shoulder),
            ("elbow", self.elbow, joints.elbow),
            ("wrist", self.wrist, joints.wrist),
        ]
        .into_iter()
        .find(|(_, limit, angle)| !limit.contains(*angle))
        .map(|(name, _, _)| name)
    }

    /// Middle of every joint range, the home used until one is taught
    pub fn midpoint(&self) -> JointPositions {
        let middle = |limit: JointLimit| (limit.min + limit.max) / 2.0;
        JointPositions::new(
            middle(self.base),
            middle(self.shoulder),
            middle(self.elbow),
            middle(self.wrist),
        )
    }
}

/// Named joint target with a gripper state
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Posture {
    pub joints: JointPositions,
    pub gripper: GripCommand,
}

impl Posture {
    pub fn new(joints: JointPositions, gripper: GripCommand) -> Posture {
        Posture { joints, gripper }
    }
}

/// Carry pose turned to each base angle, open and closed
fn default_postures(carry: &JointPositions) -> BTreeMap<String, Posture> {
    let mut postures = BTreeMap::new();
    for (name, base) in [
        ("base_zero", 0.0),
        ("base_left_45", 45.0),
        ("base_left_90", 90.0),
        ("base_right_45", -45.0),
        ("base_right_90", -90.0),
    ] {
        let joints = JointPositions { base, ..*carry };
        postures.insert(name.to_owned(), Posture::new(joints, GripCommand::Open));
        postures.insert(
            format!("{}_closed", name),
            Posture::new(joints, GripCommand::Close),
        );
    }
    postures
}

/// Geometry and motion settings of the arm.
///
/// Positions are relative to the arm base (x forward, z up), lengths are
/// meters, angles degrees.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ArmConfig {
    /// shoulder joint position relative to the arm base
    pub shoulder: Vector3<f32>,
    pub upper_arm_length: f32,
    pub forearm_length: f32,
    /// wrist joint to gripper tip
    pub end_effector_length: f32,
    pub limits: JointLimits,
    /// arm base position relative to the robot center
    pub mount: Vector3<f32>,
    /// robot body collider, relative to the arm base
    pub chassis_center: Vector3<f32>,
    pub chassis_half_extents: Vector3<f32>,
    /// deg/s, rated speed of the slowest servo
    pub max_joint_speed: f32,
    /// seconds between trajectory points
    pub point_interval: f32,
    /// seconds the gripper needs to open or close
    pub gripper_duration: f32,
    /// gripper closure at or above this after a grasp means nothing was caught
    pub empty_grip_closure: f32,
    /// approach height above a pick or place target
    pub hover_height: f32,
    /// joints used while driving with or without a load
    pub carry_pose: JointPositions,
    pub postures: BTreeMap<String, Posture>,
    /// taught home, the middle of the joint ranges when unset
    pub home_pose: Option<JointPositions>,
}

impl Default for ArmConfig {
    fn default() -> Self {
        let carry_pose = JointPositions::new(0.0, 90.0, -150.0, 60.0);
        ArmConfig {
            shoulder: Vector3::new(0.0, 0.0, 0.16),
            upper_arm_length: 0.13,
            forearm_length: 0.13,
            end_effector_length: 0.17,
            limits: JointLimits::default(),
            mount: Vector3::new(0.1, 0.0, 0.1),
            chassis_center: Vector3::new(-0.05, 0.0, -0.07),
            chassis_half_extents: Vector3::new(0.14, 0.11, 0.06),
            max_joint_speed: 90.0,
            point_interval: 0.05,
            gripper_duration: 0.7,
            empty_grip_closure: 0.95,
            hover_height: 0.06,
            postures: default_postures(&carry_pose),
            carry_pose,
            home_pose: None,
        }
    }
}

impl ArmConfig {
    /// Longest distance from the shoulder the gripper tip can reach
    pub fn total_reach(&self) -> f32 {
        self.upper_arm_length + self.forearm_length + self.end_effector_length
    }

    /// Taught home or the middle of the joint ranges
    pub fn home(&self) -> JointPositions {
        self.home_pose.unwrap_or_else(|| self.limits.midpoint())
    }
}
