//! Prelude (helpful reexports) for this package

pub use crate::actions::ProtocolActions;
pub use crate::adc::{AdcChannel, AdcSampler};
pub use crate::bitfield::BitField;
pub use crate::capture::{CaptureController, CaptureHooks, CaptureMode, HookRegistry};
pub use crate::config::SensorConfig;
pub use crate::error::{ConfigError, LinkError};
pub use crate::interconnect::{Interconnect, Status};
pub use crate::link::DeviceLink;
pub use crate::model::SensorModel;
pub use crate::serial::{SerialFramer, SerialOp, StandardFramer};
pub use crate::session::{DeviceInfo, Session};
