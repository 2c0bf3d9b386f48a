//! Device control and state layer for a serial rotation stage.
//!
//! Exposes a motorized rotation mount (in practice a Thorlabs Elliptec ELL14)
//! as a device with position, velocity and home-offset attributes plus homing
//! and swipe maintenance commands.
//!
//! # Modules
//!
//! - [`controller`] - [`StageController`]: connection lifecycle, state machine,
//!   attribute semantics
//! - [`dispatcher`] - motion token and the swipe sequence
//! - [`maintenance`] - operation counter and persistence policy
//! - [`state`] - [`DeviceState`] and status reporting
//! - [`interface`] - by-name attribute/command surface for RPC servers
//! - [`store`] - in-memory and TOML-file property stores
//! - [`config`] / [`logging`] - figment configuration and tracing setup
//!
//! Link implementations live in `stage-driver-thorlabs` and
//! `stage-driver-mock`; the traits they implement live in `stage-core`.

pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod interface;
pub mod logging;
pub mod maintenance;
pub mod state;
pub mod store;

pub use controller::{ControllerOptions, DeviceIdentity, StageController};
pub use dispatcher::{CommandDispatcher, MotionToken, SWEEP_WAYPOINTS};
pub use interface::{DeviceInterface, ATTRIBUTES, COMMANDS};
pub use maintenance::{CounterPersistence, MaintenanceCounter, DEFAULT_SWIPE_THRESHOLD};
pub use stage_core::{StageError, StageResult};
pub use state::{DeviceState, StatusReport, SWIPE_ADVISORY};
pub use store::{MemoryPropertyStore, TomlPropertyStore};
