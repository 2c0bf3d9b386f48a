//! Error types for stage drivers and the device control layer.
//!
//! Two levels of error live here:
//!
//! - **[`DriverError`]**: structured errors raised inside driver crates. Drivers
//!   return `anyhow::Result` at the [`ActuatorLink`](crate::link::ActuatorLink)
//!   seam and use `DriverError` when they want the failure category to survive
//!   the trip through `anyhow`.
//! - **[`StageError`]**: the error kinds the device control layer returns to
//!   its caller. Every link-layer failure is translated into one of these
//!   kinds with the original message preserved; nothing is swallowed.
//!
//! ## StageError kinds
//!
//! - **`Connect`**: opening the link failed. Fatal for that initialize attempt;
//!   the device enters `Fault`.
//! - **`NotConnected`**: an operation needs the link but none is open.
//! - **`Motion`**: the link rejected or failed a command. The device state is
//!   not demoted since the link may recover on the next command.
//! - **`Busy`**: the motion token is held by another command. Retry later.
//! - **`Persistence`**: the property store failed. Callers log these and carry
//!   on with an in-memory counter.
//! - **`InvalidArgument`** / **`ReadOnly`**: misuse of the attribute/command
//!   surface.

use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Category of a driver-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    Initialization,
    Configuration,
    Communication,
    Shutdown,
    Hardware,
    Timeout,
    InvalidParameter,
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Shutdown => "shutdown",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Structured driver error with category.
#[derive(Error, Debug, Clone)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    pub driver_type: String,
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

// =============================================================================
// Device Errors
// =============================================================================

/// Convenience alias for results of device-level operations.
pub type StageResult<T> = std::result::Result<T, StageError>;

/// Error kinds returned by the device control layer.
///
/// # Example
///
/// ```rust
/// use stage_core::error::StageError;
///
/// let err = StageError::motion("move_absolute", anyhow::anyhow!("GS02 mechanical timeout"));
/// assert!(err.to_string().contains("move_absolute"));
/// assert!(!err.is_retryable());
/// assert!(StageError::Busy.is_retryable());
/// ```
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    /// Opening the actuator link failed.
    ///
    /// The device is left in `Fault` until an explicit re-initialize.
    #[error("Cannot connect on port {port}: {message}")]
    Connect { port: String, message: String },

    /// No actuator link is open (never initialized, connect failed, or shut down).
    #[error("Device is not connected")]
    NotConnected,

    /// The actuator link failed or rejected a command.
    #[error("{operation} failed: {message}")]
    Motion {
        operation: &'static str,
        message: String,
    },

    /// Another motion command holds the motion token.
    #[error("Motion command already in progress")]
    Busy,

    /// Loading or saving persisted properties failed.
    #[error("Property store error: {0}")]
    Persistence(String),

    /// A value or name passed to the device was not acceptable.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Attempted write to a read-only attribute.
    #[error("Attribute '{0}' is read-only")]
    ReadOnly(String),
}

impl StageError {
    /// Translate a link-layer failure into a `Motion` error, keeping the full
    /// error chain in the message.
    pub fn motion(operation: &'static str, err: anyhow::Error) -> Self {
        Self::Motion {
            operation,
            message: format!("{err:#}"),
        }
    }

    /// Translate a link open failure into a `Connect` error.
    pub fn connect(port: impl Into<String>, err: anyhow::Error) -> Self {
        Self::Connect {
            port: port.into(),
            message: format!("{err:#}"),
        }
    }

    /// Translate a property store failure into a `Persistence` error.
    pub fn persistence(err: anyhow::Error) -> Self {
        Self::Persistence(format!("{err:#}"))
    }

    /// Whether the caller can reasonably retry the same call unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy)
    }
}
