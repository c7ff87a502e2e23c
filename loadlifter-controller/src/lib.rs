#![doc = include_str!("../README.md")]

pub mod arm_config;
pub mod arm_controller;
pub mod arm_driver;
pub mod collision_handler;
pub mod control_loop;
pub mod drive_kinematics;
pub mod drivers;
pub mod error;
pub mod geometry;
pub mod mission;
pub mod motion_planner;
pub mod navigation;
pub mod obstacle_map;
pub mod odometry;
pub mod range_sensor;
pub mod robot_config;
pub mod route;
pub mod simulation;
pub mod telemetry;
pub mod wall_follow;
