//! Thorlabs rotation mount link for rotation-stage.
//!
//! This crate provides an [`stage_core::ActuatorLink`] for the Thorlabs
//! Elliptec ELL14 rotation mount on its RS-485 multidrop bus.
//!
//! # Usage
//!
//! ```rust,ignore
//! use stage_driver_thorlabs::{Ell14Config, Ell14LinkFactory};
//!
//! let factory = Arc::new(Ell14LinkFactory::new(Ell14Config::default()));
//! let controller = StageController::new(identity, factory, store);
//! ```

mod ell14;
pub mod shared_ports;

pub use ell14::{
    address_prefix, Ell14Config, Ell14Link, Ell14LinkFactory, Ell14Reply, Ell14StatusCode,
};
pub use shared_ports::{get_or_open_port, wrap_shared, SharedPort};
