//! Core data model shared by every stage.

pub mod types;

pub use types::{
    ActionSample, Actions, Angles, Encoders, EventCmd, EventSample, EventType, Imu,
    MotorCommands, Setpoint, StateSample, States, SystemState, Timestamps, Vec3,
};
