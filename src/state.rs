//! Device state machine and status reporting.
//!
//! The state is derived, never set from outside: the controller recomputes it
//! from link validity and the actuator's motion flag before every externally
//! observable interaction.
//!
//! ```text
//!            connect ok          is_moving
//!   Init ───────────────▶ On ◀───────────▶ Moving
//!     │                    │                  │
//!     │ connect failed     └──── shutdown ────┴──▶ Init
//!     ▼
//!   Fault ── reinitialize ──▶ Init
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status line while connected and idle.
pub const STATUS_ON: &str = "The device is ON";

/// Status line while the actuator reports motion.
pub const STATUS_MOVING: &str = "The device is MOVING";

/// Status line before a link has been opened or after shutdown.
pub const STATUS_INIT: &str = "The device is not connected";

/// Advisory line prepended to the status once the maintenance counter is over
/// its threshold.
pub const SWIPE_ADVISORY: &str = "PLEASE EXECUTE SWIPE OPERATION!!!";

/// Connection/motion state of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceState {
    /// No link yet, or the link was shut down.
    Init,
    /// Connected and idle.
    On,
    /// Connected and the actuator reports motion.
    Moving,
    /// The last initialize attempt could not open the link.
    Fault,
}

impl DeviceState {
    /// Whether `next` is reachable from `self` along a defined edge.
    ///
    /// Staying in the same state is always allowed. Every state may fall back
    /// to `Init`, which is how shutdown and reinitialize start over.
    pub fn can_transition_to(self, next: DeviceState) -> bool {
        use DeviceState::*;
        self == next
            || matches!(
                (self, next),
                (Init, On) | (Init, Fault) | (On, Moving) | (Moving, On) | (_, Init)
            )
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceState::Init => "INIT",
            DeviceState::On => "ON",
            DeviceState::Moving => "MOVING",
            DeviceState::Fault => "FAULT",
        };
        f.write_str(label)
    }
}

/// Snapshot returned by a status refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// State after the refresh.
    pub state: DeviceState,
    /// Human-readable status, including the swipe advisory when due.
    pub status: String,
    /// Operations since the last successful swipe.
    pub num_operations: u64,
    /// Whether the maintenance counter is over its threshold.
    pub maintenance_due: bool,
}

/// Build the status text from a base line and the maintenance flag.
pub fn compose_status(base: &str, maintenance_due: bool) -> String {
    if maintenance_due {
        format!("{}\n{}", SWIPE_ADVISORY, base)
    } else {
        base.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_labels() {
        assert_eq!(DeviceState::Init.to_string(), "INIT");
        assert_eq!(DeviceState::On.to_string(), "ON");
        assert_eq!(DeviceState::Moving.to_string(), "MOVING");
        assert_eq!(DeviceState::Fault.to_string(), "FAULT");
    }

    #[test]
    fn test_defined_edges() {
        use DeviceState::*;
        assert!(Init.can_transition_to(On));
        assert!(Init.can_transition_to(Fault));
        assert!(On.can_transition_to(Moving));
        assert!(Moving.can_transition_to(On));
        assert!(Fault.can_transition_to(Init));
        assert!(Moving.can_transition_to(Init));

        // Fault is only reachable from Init
        assert!(!On.can_transition_to(Fault));
        assert!(!Moving.can_transition_to(Fault));
        // Fault is sticky until reinitialize
        assert!(!Fault.can_transition_to(On));
        assert!(!Init.can_transition_to(Moving));
    }

    #[test]
    fn test_compose_status_advisory_on_own_line() {
        assert_eq!(compose_status(STATUS_ON, false), "The device is ON");
        let status = compose_status(STATUS_MOVING, true);
        let lines: Vec<&str> = status.lines().collect();
        assert_eq!(lines, vec![SWIPE_ADVISORY, STATUS_MOVING]);
    }

    #[test]
    fn test_state_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&DeviceState::Moving).unwrap(), "\"MOVING\"");
        let state: DeviceState = serde_json::from_str("\"FAULT\"").unwrap();
        assert_eq!(state, DeviceState::Fault);
    }
}
