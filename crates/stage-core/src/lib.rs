//! Core traits and types for rotation-stage device control.
//!
//! This crate holds the seams between the device control layer and its
//! external collaborators:
//!
//! - [`link::ActuatorLink`] - the driver for the physical stage
//! - [`link::LinkFactory`] - opens a link for a port and bus address
//! - [`property::PropertyStore`] - durable per-device key/value properties
//! - [`error`] - driver errors and the device-level [`error::StageError`]
//!
//! Driver crates (`stage-driver-thorlabs`, `stage-driver-mock`) implement the
//! link traits; the root `rotation_stage` crate consumes them.

pub mod error;
pub mod link;
pub mod property;

pub use error::{DriverError, DriverErrorKind, StageError, StageResult};
pub use link::{
    normalize_degrees, ActuatorLink, LinkFactory, FULL_TURN_DEGREES, MAX_VELOCITY,
};
pub use property::PropertyStore;
