#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod accel;
pub mod buffer;
pub mod config;
pub mod intervals;
pub mod kernel;
pub mod ops;
pub mod qarray;

pub use accel::{AccelError, AccelManager};
pub use buffer::{Buffer, BufferError, DType};
pub use config::{AccelConfig, AccelTarget, ConfigError, RuntimeConfig};
pub use intervals::Interval;
pub use ops::{PointingError, pointing_detector, pointing_detector_with};
