//! Actuator link traits.
//!
//! The device control layer never talks to a serial port directly. It holds an
//! `Arc<dyn ActuatorLink>` obtained from a [`LinkFactory`] and treats it as an
//! opaque driver for one rotary axis.
//!
//! # Contract
//!
//! - Angles are in degrees. Positions and home offsets reported by a link are
//!   normalized into `[0, 360)`.
//! - Motion methods return once the link considers the command complete or
//!   failed. Timeouts are the link's responsibility.
//! - Methods take `&self`; implementations use interior mutability so a link
//!   can be shared as `Arc<dyn ActuatorLink>`.
//! - A link that is busy on the wire surfaces its own transport error. The
//!   caller passes it through unmodified.

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Degrees in one full revolution.
pub const FULL_TURN_DEGREES: f64 = 360.0;

/// Highest velocity value the actuator firmware accepts.
pub const MAX_VELOCITY: f64 = 64.0;

/// Wrap an angle into `[0, 360)`.
///
/// Returns `None` for NaN or infinite input.
///
/// ```rust
/// use stage_core::normalize_degrees;
///
/// assert_eq!(normalize_degrees(370.0), Some(10.0));
/// assert_eq!(normalize_degrees(-90.0), Some(270.0));
/// assert_eq!(normalize_degrees(360.0), Some(0.0));
/// assert_eq!(normalize_degrees(f64::NAN), None);
/// ```
pub fn normalize_degrees(value: f64) -> Option<f64> {
    if !value.is_finite() {
        return None;
    }
    let wrapped = value.rem_euclid(FULL_TURN_DEGREES);
    // rem_euclid rounds tiny negative inputs up to exactly 360.0
    if wrapped >= FULL_TURN_DEGREES {
        Some(0.0)
    } else {
        Some(wrapped)
    }
}

/// Driver for a single rotary axis.
#[async_trait]
pub trait ActuatorLink: Send + Sync {
    /// Move to an absolute angle in degrees.
    async fn move_absolute(&self, degrees: f64) -> Result<()>;

    /// Move by a signed angle in degrees.
    async fn move_relative(&self, degrees: f64) -> Result<()>;

    /// Run the home sequence.
    async fn home(&self) -> Result<()>;

    /// Query the current angle in degrees.
    async fn get_position(&self) -> Result<f64>;

    /// Query the velocity setting.
    async fn get_velocity(&self) -> Result<f64>;

    /// Set the velocity. Callers clamp to `[0, MAX_VELOCITY]` beforehand.
    async fn set_velocity(&self, velocity: f64) -> Result<()>;

    /// Query the home offset in degrees.
    async fn get_home_offset(&self) -> Result<f64>;

    /// Set the home offset in degrees. Callers normalize beforehand.
    async fn set_home_offset(&self, degrees: f64) -> Result<()>;

    /// Whether the axis is currently in motion.
    async fn is_moving(&self) -> Result<bool>;

    /// Send an opaque command string and return the raw reply.
    ///
    /// Diagnostics only: no normalization or validation is applied.
    async fn raw_command(&self, command: &str) -> Result<String>;

    /// Release the underlying transport.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Opens actuator links.
///
/// Mirrors the driver factory pattern: a factory knows one driver type and
/// builds a connected link from a transport identifier and bus address.
pub trait LinkFactory: Send + Sync {
    /// Short identifier used in configuration (e.g. `"ell14"`).
    fn driver_type(&self) -> &'static str;

    /// Human-readable driver name.
    fn name(&self) -> &'static str;

    /// Open a link to the axis at `address` on `port`.
    fn connect(&self, port: &str, address: u8) -> BoxFuture<'static, Result<Arc<dyn ActuatorLink>>>;
}
