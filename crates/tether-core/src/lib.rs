pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod interrupt;
pub mod pattern;
pub mod permission;
pub mod task;
pub mod telemetry;

pub use error::TetherError;
