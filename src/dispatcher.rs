//! Motion command exclusivity and the swipe sequence.
//!
//! At most one motion command runs per device. Exclusivity is a single
//! non-reentrant token: [`CommandDispatcher::try_acquire_motion_token`] fails
//! fast with [`StageError::Busy`] when the token is out and never queues.
//! Reads and settings do not take the token.

use crate::maintenance::MaintenanceCounter;
use stage_core::{ActuatorLink, StageError, StageResult};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Waypoints of the swipe sequence, in degrees.
pub const SWEEP_WAYPOINTS: [f64; 3] = [0.0, 359.0, 0.0];

/// Proof of exclusive motion access. Dropping it releases the token.
#[derive(Debug)]
pub struct MotionToken {
    _guard: OwnedMutexGuard<()>,
}

/// Serializes motion commands for one device.
#[derive(Debug, Default)]
pub struct CommandDispatcher {
    token: Arc<Mutex<()>>,
}

impl CommandDispatcher {
    /// Create a dispatcher with the token available.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the motion token, or fail with `Busy` if another command holds it.
    pub fn try_acquire_motion_token(&self) -> StageResult<MotionToken> {
        let guard = self
            .token
            .clone()
            .try_lock_owned()
            .map_err(|_| StageError::Busy)?;
        Ok(MotionToken { _guard: guard })
    }

    /// Wait until no motion command is in flight and take the token.
    ///
    /// Used by shutdown so the link is never closed under a running move.
    pub async fn wait_idle(&self) -> MotionToken {
        MotionToken {
            _guard: self.token.clone().lock_owned().await,
        }
    }

    /// Whether a motion command currently holds the token.
    pub fn is_busy(&self) -> bool {
        self.token.try_lock().is_err()
    }

    /// Run the swipe sequence under an already held token.
    ///
    /// Saves the current position, visits [`SWEEP_WAYPOINTS`], moves back to
    /// the saved position and resets `counter`. Sub-moves are not counted. The
    /// first failing step aborts the sequence with the counter untouched and
    /// the mount wherever the failed step left it.
    #[tracing::instrument(skip_all)]
    pub async fn run_sweep(
        &self,
        _token: &MotionToken,
        link: &dyn ActuatorLink,
        counter: &MaintenanceCounter,
    ) -> StageResult<()> {
        let saved = link
            .get_position()
            .await
            .map_err(|e| sweep_step_error("read start position", e))?;
        tracing::debug!(saved, "Swipe started");

        for (step, waypoint) in SWEEP_WAYPOINTS.iter().enumerate() {
            link.move_absolute(*waypoint).await.map_err(|e| {
                sweep_step_error(&format!("step {} (move to {})", step + 1, waypoint), e)
            })?;
        }

        link.move_absolute(saved)
            .await
            .map_err(|e| sweep_step_error(&format!("restore position {}", saved), e))?;

        counter.reset();
        tracing::info!(restored = saved, "Swipe completed, operation count reset");
        Ok(())
    }
}

fn sweep_step_error(step: &str, err: anyhow::Error) -> StageError {
    tracing::warn!(step, error = %err, "Swipe aborted");
    StageError::motion("swipe", err.context(format!("swipe {}", step)))
}
