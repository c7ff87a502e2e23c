use crate::arm_config::ArmConfig;
use crate::arm_driver::JointPositions;
use crate::error::{ensure_finite, ControllerError, Result};
use nalgebra as na;
use serde::{Deserialize, Serialize};

/// Gripper tip target relative to the arm base.
///
/// `end_effector_angle` is the gripper pitch in degrees, 0 is level and
/// negative points down.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EndEffectorPose {
    pub position: na::Vector3<f32>,
    pub end_effector_angle: f32,
}

impl EndEffectorPose {
    pub fn new(position: na::Vector3<f32>, end_effector_angle: f32) -> EndEffectorPose {
        EndEffectorPose {
            position,
            end_effector_angle,
        }
    }

    /// Same pose shifted straight up
    pub fn raised(&self, height: f32) -> EndEffectorPose {
        EndEffectorPose::new(
            self.position + na::Vector3::new(0.0, 0.0, height),
            self.end_effector_angle,
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArmPositions {
    pub base: na::Vector3<f32>,
    pub shoulder: na::Vector3<f32>,
    pub elbow: na::Vector3<f32>,
    pub wrist: na::Vector3<f32>,
    pub end_effector: na::Vector3<f32>,
    pub end_effector_angle: f32,
}

impl ArmPositions {
    pub fn get_end_effector_pose(&self) -> EndEffectorPose {
        EndEffectorPose::new(self.end_effector, self.end_effector_angle)
    }
}

/// Closed form kinematics for the base yaw + three pitch joint arm
#[derive(Debug, Clone)]
pub struct ArmKinematics {
    config: ArmConfig,
}

impl ArmKinematics {
    pub fn new(config: ArmConfig) -> ArmKinematics {
        ArmKinematics { config }
    }

    pub fn config(&self) -> &ArmConfig {
        &self.config
    }

    /// calculate IK
    /// This method expects a point relative to the arm base.
    /// Always picks the elbow up solution and fails instead of clamping
    /// when a joint would leave its range.
    pub fn calculate_ik(&self, pose: &EndEffectorPose) -> Result<JointPositions> {
        let x = ensure_finite("target x", pose.position.x)?;
        let y = ensure_finite("target y", pose.position.y)?;
        let z = ensure_finite("target z", pose.position.z)?;
        let pitch = ensure_finite("target pitch", pose.end_effector_angle)?.to_radians();

        let base_angle = y.atan2(x);
        let horizontal_distance = (x.powi(2) + y.powi(2)).sqrt();
        let height = z - self.config.shoulder.z;

        // wrist joint position in the arm plane
        let wrist_horizontal = horizontal_distance - self.config.end_effector_length * pitch.cos();
        let wrist_vertical = height - self.config.end_effector_length * pitch.sin();
        let wrist_distance = (wrist_horizontal.powi(2) + wrist_vertical.powi(2)).sqrt();

        let upper = self.config.upper_arm_length;
        let fore = self.config.forearm_length;
        if wrist_distance > upper + fore + 1e-6 {
            return Err(ControllerError::Unreachable(format!(
                "wrist {:.3}m from shoulder, reach is {:.3}m",
                wrist_distance,
                upper + fore
            )));
        }
        if wrist_distance < (upper - fore).abs() || wrist_distance < 1e-6 {
            return Err(ControllerError::Unreachable(format!(
                "wrist {:.3}m from shoulder is inside the dead zone",
                wrist_distance
            )));
        }

        let elbow_inner = ((upper.powi(2) + fore.powi(2) - wrist_distance.powi(2))
            / (2.0 * upper * fore))
            .clamp(-1.0, 1.0)
            .acos();
        let shoulder_inner = ((upper.powi(2) + wrist_distance.powi(2) - fore.powi(2))
            / (2.0 * upper * wrist_distance))
            .clamp(-1.0, 1.0)
            .acos();

        let shoulder_angle = wrist_vertical.atan2(wrist_horizontal) + shoulder_inner;
        let elbow_angle = -(std::f32::consts::PI - elbow_inner);
        let wrist_angle = pitch - shoulder_angle - elbow_angle;

        let joints = JointPositions::new(
            base_angle.to_degrees(),
            shoulder_angle.to_degrees(),
            elbow_angle.to_degrees(),
            wrist_angle.to_degrees(),
        );
        if let Some(joint) = self.config.limits.violation(&joints) {
            return Err(ControllerError::Unreachable(format!(
                "{} joint out of range in {:?}",
                joint, joints
            )));
        }
        Ok(joints)
    }

    pub fn calculate_fk(&self, joints: &JointPositions) -> ArmPositions {
        let base = na::Vector3::new(0.0, 0.0, 0.0);
        let base_rotation =
            na::Rotation3::from_axis_angle(&na::Vector3::z_axis(), joints.base.to_radians());
        // positive pitch lifts the link
        let pitch = |degrees: f32| {
            na::Rotation3::from_axis_angle(&na::Vector3::y_axis(), -degrees.to_radians())
        };
        let link = |length: f32| na::Vector3::new(length, 0.0, 0.0);

        let shoulder = base + base_rotation * self.config.shoulder;
        let upper_pitch = joints.shoulder;
        let elbow = shoulder + base_rotation * pitch(upper_pitch) * link(self.config.upper_arm_length);
        let fore_pitch = upper_pitch + joints.elbow;
        let wrist = elbow + base_rotation * pitch(fore_pitch) * link(self.config.forearm_length);
        let effector_pitch = fore_pitch + joints.wrist;
        let end_effector = wrist
            + base_rotation * pitch(effector_pitch) * link(self.config.end_effector_length);

        ArmPositions {
            base,
            shoulder,
            elbow,
            wrist,
            end_effector,
            end_effector_angle: effector_pitch,
        }
    }

    pub fn calculate_full_poses(
        &self,
        target: &EndEffectorPose,
    ) -> Result<(ArmPositions, JointPositions)> {
        let joints = self.calculate_ik(target)?;
        Ok((self.calculate_fk(&joints), joints))
    }
}
