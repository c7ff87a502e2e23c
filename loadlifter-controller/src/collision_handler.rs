use crate::arm_config::ArmConfig;
use crate::arm_controller::ArmPositions;
use nalgebra as na;
use parry3d::{query::PointQuery, shape};

/// Keeps arm poses inside the reachable sphere and out of the robot body
pub struct CollisionHandler {
    workspace_sphere: shape::Ball,
    chassis_collider: shape::Cuboid,
    config: ArmConfig,
}

impl CollisionHandler {
    pub fn new(config: ArmConfig) -> Self {
        Self {
            workspace_sphere: shape::Ball::new(config.total_reach()),
            chassis_collider: shape::Cuboid::new(config.chassis_half_extents),
            config,
        }
    }

    pub fn point_in_workspace(&self, point: &na::Point3<f32>) -> bool {
        self.workspace_sphere.contains_point(
            &na::Isometry3::translation(
                self.config.shoulder.x,
                self.config.shoulder.y,
                self.config.shoulder.z,
            ),
            point,
        )
    }

    /// true when the point is clear of the chassis
    pub fn check_self_collision(&self, point: &na::Point3<f32>) -> bool {
        !self.chassis_collider.contains_point(
            &na::Isometry3::translation(
                self.config.chassis_center.x,
                self.config.chassis_center.y,
                self.config.chassis_center.z,
            ),
            point,
        )
    }

    pub fn pose_collision_free(&self, arm_pose: &ArmPositions) -> bool {
        self.point_in_workspace(&arm_pose.end_effector.into())
            && self.check_self_collision(&arm_pose.elbow.into())
            && self.check_self_collision(&arm_pose.wrist.into())
            && self.check_self_collision(&arm_pose.end_effector.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm_controller::ArmKinematics;
    use crate::arm_driver::JointPositions;

    #[test]
    fn test_workspace_collider() {
        let config = ArmConfig::default();
        let root_point = config.shoulder;
        let collision_handler = CollisionHandler::new(config);
        assert!(collision_handler.point_in_workspace(&na::Point3::new(0.0, 0.0, 0.0)));
        assert!(
            collision_handler.point_in_workspace(&(na::Point3::new(0.42, 0.0, 0.0) + root_point))
        );
        assert!(
            collision_handler.point_in_workspace(&(na::Point3::new(0.0, 0.42, 0.0) + root_point))
        );
        assert!(
            !collision_handler.point_in_workspace(&(na::Point3::new(0.44, 0.0, 0.0) + root_point))
        );
    }

    #[test]
    fn test_chassis_collider() {
        let collision_handler = CollisionHandler::new(ArmConfig::default());
        assert!(
            !collision_handler.check_self_collision(&na::Point3::new(0.0, 0.0, -0.05)),
            "point inside the body"
        );
        assert!(
            collision_handler.check_self_collision(&na::Point3::new(0.0, 0.0, 0.05)),
            "point above the body"
        );
        assert!(
            collision_handler.check_self_collision(&na::Point3::new(0.2, 0.0, -0.05)),
            "point in front of the body"
        );
    }

    #[test]
    fn arm_folded_into_body_collides() {
        let kinematics = ArmKinematics::new(ArmConfig::default());
        let collision_handler = CollisionHandler::new(ArmConfig::default());
        // reaching back and down into the body
        let positions = kinematics.calculate_fk(&JointPositions::new(180.0, -30.0, -30.0, 0.0));
        assert!(!collision_handler.pose_collision_free(&positions));
        let carry = kinematics.calculate_fk(&ArmConfig::default().carry_pose);
        assert!(collision_handler.pose_collision_free(&carry));
    }
}
