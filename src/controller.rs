//! Stage controller: connection lifecycle, state machine and attribute semantics.
//!
//! [`StageController`] owns the link to one rotation stage. Every public read
//! and command first refreshes the derived state from the actuator, then
//! dispatches to the [`ActuatorLink`]. Motion commands additionally take the
//! dispatcher's motion token and count toward swipe maintenance.
//!
//! # Example
//!
//! ```rust,ignore
//! use rotation_stage::{DeviceIdentity, MemoryPropertyStore, StageController};
//! use stage_driver_mock::MockLinkFactory;
//!
//! let controller = StageController::new(
//!     DeviceIdentity::new("lab/rotator/1", "/dev/ttyUSB0", 0),
//!     Arc::new(MockLinkFactory::new()),
//!     Arc::new(MemoryPropertyStore::new()),
//! );
//! controller.initialize("/dev/ttyUSB0", 0).await?;
//! controller.write_position(370.0).await?; // moves to 10 degrees
//! ```

use crate::dispatcher::CommandDispatcher;
use crate::maintenance::{CounterPersistence, MaintenanceCounter, DEFAULT_SWIPE_THRESHOLD};
use crate::state::{compose_status, DeviceState, StatusReport, STATUS_INIT, STATUS_MOVING, STATUS_ON};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use stage_core::{
    normalize_degrees, ActuatorLink, LinkFactory, PropertyStore, StageError, StageResult,
    MAX_VELOCITY,
};
use std::sync::Arc;
use tracing::instrument;

/// Which device this controller drives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Device name; keys persisted properties.
    pub name: String,
    /// Serial transport identifier (e.g. `/dev/ttyUSB0`).
    pub port: String,
    /// Bus address, 0-15.
    pub address: u8,
}

impl DeviceIdentity {
    /// Build an identity from its parts.
    pub fn new(name: impl Into<String>, port: impl Into<String>, address: u8) -> Self {
        Self {
            name: name.into(),
            port: port.into(),
            address,
        }
    }
}

/// Behavioral options for a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerOptions {
    /// Operations after which the swipe advisory appears.
    pub swipe_threshold: u64,
    /// When the operation count is loaded and saved.
    pub persistence: CounterPersistence,
    /// Run a swipe right after a successful initialize.
    pub swipe_on_init: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            swipe_threshold: DEFAULT_SWIPE_THRESHOLD,
            persistence: CounterPersistence::default(),
            swipe_on_init: false,
        }
    }
}

#[derive(Debug)]
struct Fsm {
    state: DeviceState,
    // Status line without the maintenance advisory
    base_status: String,
}

/// Device control and state layer for one rotation stage.
///
/// Shared as `Arc<StageController>`; every operation takes `&self`.
pub struct StageController {
    identity: RwLock<DeviceIdentity>,
    factory: Arc<dyn LinkFactory>,
    store: Arc<dyn PropertyStore>,
    options: ControllerOptions,
    link: RwLock<Option<Arc<dyn ActuatorLink>>>,
    fsm: Mutex<Fsm>,
    counter: MaintenanceCounter,
    dispatcher: CommandDispatcher,
}

impl StageController {
    /// Create a controller in `Init` with default options. No link is opened.
    pub fn new(
        identity: DeviceIdentity,
        factory: Arc<dyn LinkFactory>,
        store: Arc<dyn PropertyStore>,
    ) -> Self {
        Self::with_options(identity, factory, store, ControllerOptions::default())
    }

    /// Create a controller in `Init` with explicit options.
    pub fn with_options(
        identity: DeviceIdentity,
        factory: Arc<dyn LinkFactory>,
        store: Arc<dyn PropertyStore>,
        options: ControllerOptions,
    ) -> Self {
        Self {
            identity: RwLock::new(identity),
            factory,
            store,
            counter: MaintenanceCounter::new(options.swipe_threshold),
            options,
            link: RwLock::new(None),
            fsm: Mutex::new(Fsm {
                state: DeviceState::Init,
                base_status: STATUS_INIT.to_string(),
            }),
            dispatcher: CommandDispatcher::new(),
        }
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Open the link to the axis at `address` on `port`.
    ///
    /// On success the device is `On` and the operation count is restored
    /// according to the persistence policy. On failure the device is `Fault`
    /// with the port named in the status, and the error is returned. An
    /// already open link is shut down first.
    #[instrument(skip(self), fields(device = %self.identity.read().name))]
    pub async fn initialize(&self, port: &str, address: u8) -> StageResult<()> {
        if self.link.read().is_some() {
            self.shutdown().await?;
        }

        self.set_state(DeviceState::Init, STATUS_INIT);
        let name = {
            let mut identity = self.identity.write();
            identity.port = port.to_string();
            identity.address = address;
            identity.name.clone()
        };

        tracing::info!(
            port,
            address,
            driver = self.factory.driver_type(),
            "Initializing rotation stage"
        );

        let link = match self.factory.connect(port, address).await {
            Ok(link) => link,
            Err(e) => {
                let err = StageError::connect(port, e);
                tracing::error!(port, error = %err, "Rotation stage connect failed");
                self.set_state(DeviceState::Fault, &err.to_string());
                return Err(err);
            }
        };
        *self.link.write() = Some(link);

        if self.options.persistence.loads() {
            if let Err(e) = self.counter.load(self.store.as_ref(), &name) {
                tracing::warn!(device = %name, error = %e, "Could not restore operation count");
            }
        }

        self.set_state(DeviceState::On, STATUS_ON);
        tracing::info!(
            device = %name,
            num_operations = self.counter.count(),
            "Rotation stage ready"
        );

        if self.options.swipe_on_init {
            if let Err(e) = self.swipe().await {
                tracing::warn!(device = %name, error = %e, "Startup swipe failed");
            }
        }

        Ok(())
    }

    /// Tear down the link and initialize again with the last port and address.
    ///
    /// This is the only way out of `Fault`.
    pub async fn reinitialize(&self) -> StageResult<()> {
        let DeviceIdentity { port, address, .. } = self.identity();
        self.shutdown().await?;
        self.initialize(&port, address).await
    }

    /// Wait for any in-flight motion, persist the count and close the link.
    ///
    /// A no-op when no link is open. Afterwards the device is `Init`.
    #[instrument(skip(self), fields(device = %self.identity.read().name))]
    pub async fn shutdown(&self) -> StageResult<()> {
        let _token = self.dispatcher.wait_idle().await;

        let taken = self.link.write().take();
        let Some(link) = taken else {
            tracing::debug!("Shutdown with no open link");
            if self.state() == DeviceState::Fault {
                self.set_state(DeviceState::Init, STATUS_INIT);
            }
            return Ok(());
        };

        if self.options.persistence.saves_on_shutdown() {
            self.persist_counter();
        }

        let closed = link.close().await;
        self.set_state(DeviceState::Init, STATUS_INIT);

        match closed {
            Ok(()) => {
                tracing::info!(num_operations = self.counter.count(), "Rotation stage shut down");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Link close reported an error");
                Err(StageError::motion("shutdown", e))
            }
        }
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Recompute state and status from the actuator.
    ///
    /// Without an open link no query is made and the current `Init`/`Fault`
    /// state is reported as is.
    pub async fn refresh_status(&self) -> StageResult<StatusReport> {
        if let Some(link) = self.current_link() {
            let moving = link
                .is_moving()
                .await
                .map_err(|e| StageError::motion("refresh_status", e))?;
            if moving {
                self.set_state(DeviceState::Moving, STATUS_MOVING);
            } else {
                self.set_state(DeviceState::On, STATUS_ON);
            }
        }
        Ok(self.report())
    }

    /// Last computed state, without querying the actuator.
    pub fn state(&self) -> DeviceState {
        self.fsm.lock().state
    }

    /// Last computed status text, without querying the actuator.
    pub fn status(&self) -> String {
        self.report().status
    }

    /// Operations since the last successful swipe.
    pub fn num_operations(&self) -> u64 {
        self.counter.count()
    }

    /// Whether the swipe advisory is due.
    pub fn maintenance_due(&self) -> bool {
        self.counter.is_over_threshold()
    }

    /// Current device identity.
    pub fn identity(&self) -> DeviceIdentity {
        self.identity.read().clone()
    }

    /// Options this controller was built with.
    pub fn options(&self) -> ControllerOptions {
        self.options
    }

    /// Whether a motion command is in flight.
    pub fn is_busy(&self) -> bool {
        self.dispatcher.is_busy()
    }

    // =========================================================================
    // Attributes
    // =========================================================================

    /// Current angle in degrees, always queried from the actuator.
    pub async fn read_position(&self) -> StageResult<f64> {
        let link = self.prepare().await?;
        link.get_position()
            .await
            .map_err(|e| StageError::motion("read_position", e))
    }

    /// Move to `value` degrees, wrapped into `[0, 360)`.
    #[instrument(skip(self))]
    pub async fn write_position(&self, value: f64) -> StageResult<()> {
        let target = normalize_degrees(value)
            .ok_or_else(|| StageError::InvalidArgument(format!("position {} is not finite", value)))?;

        let _token = self.dispatcher.try_acquire_motion_token()?;
        let link = self.prepare().await?;

        self.set_state(DeviceState::Moving, STATUS_MOVING);
        link.move_absolute(target)
            .await
            .map_err(|e| StageError::motion("write_position", e))?;
        self.motion_completed();
        Ok(())
    }

    /// Move by `delta` degrees from the current position.
    #[instrument(skip(self))]
    pub async fn move_relative(&self, delta: f64) -> StageResult<()> {
        if !delta.is_finite() {
            return Err(StageError::InvalidArgument(format!(
                "distance {} is not finite",
                delta
            )));
        }

        let _token = self.dispatcher.try_acquire_motion_token()?;
        let link = self.prepare().await?;

        self.set_state(DeviceState::Moving, STATUS_MOVING);
        link.move_relative(delta)
            .await
            .map_err(|e| StageError::motion("move_relative", e))?;
        self.motion_completed();
        Ok(())
    }

    /// Current velocity setting.
    pub async fn get_velocity(&self) -> StageResult<f64> {
        let link = self.prepare().await?;
        link.get_velocity()
            .await
            .map_err(|e| StageError::motion("get_velocity", e))
    }

    /// Set the velocity, clamped to `[0, 64]`. Returns the value sent.
    pub async fn set_velocity(&self, velocity: f64) -> StageResult<f64> {
        if !velocity.is_finite() {
            return Err(StageError::InvalidArgument(format!(
                "velocity {} is not finite",
                velocity
            )));
        }
        let clamped = velocity.clamp(0.0, MAX_VELOCITY);
        if clamped != velocity {
            tracing::debug!(requested = velocity, applied = clamped, "Velocity clamped");
        }

        let link = self.prepare().await?;
        link.set_velocity(clamped)
            .await
            .map_err(|e| StageError::motion("set_velocity", e))?;
        Ok(clamped)
    }

    /// Current home offset in degrees.
    pub async fn get_home_offset(&self) -> StageResult<f64> {
        let link = self.prepare().await?;
        link.get_home_offset()
            .await
            .map_err(|e| StageError::motion("get_home_offset", e))
    }

    /// Set the home offset, wrapped into `[0, 360)`. Returns the value sent.
    pub async fn set_home_offset(&self, value: f64) -> StageResult<f64> {
        let offset = normalize_degrees(value).ok_or_else(|| {
            StageError::InvalidArgument(format!("home offset {} is not finite", value))
        })?;

        let link = self.prepare().await?;
        link.set_home_offset(offset)
            .await
            .map_err(|e| StageError::motion("set_home_offset", e))?;
        Ok(offset)
    }

    /// Add `delta` degrees to the home offset. Returns the new offset.
    pub async fn shift_home_offset(&self, delta: f64) -> StageResult<f64> {
        if !delta.is_finite() {
            return Err(StageError::InvalidArgument(format!(
                "offset shift {} is not finite",
                delta
            )));
        }
        let current = self.get_home_offset().await?;
        let shifted = self.set_home_offset(current + delta).await?;
        tracing::info!(from = current, to = shifted, "Home offset shifted");
        Ok(shifted)
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Run the home sequence.
    #[instrument(skip(self))]
    pub async fn home(&self) -> StageResult<()> {
        let _token = self.dispatcher.try_acquire_motion_token()?;
        let link = self.prepare().await?;

        self.set_state(DeviceState::Moving, STATUS_MOVING);
        link.home().await.map_err(|e| StageError::motion("home", e))?;
        self.motion_completed();
        Ok(())
    }

    /// Sweep the full range and reset the operation count.
    ///
    /// The token is held for the whole sequence, so no other motion command
    /// can run between its moves.
    #[instrument(skip(self))]
    pub async fn swipe(&self) -> StageResult<()> {
        let token = self.dispatcher.try_acquire_motion_token()?;
        let link = self.prepare().await?;

        self.set_state(DeviceState::Moving, STATUS_MOVING);
        self.dispatcher
            .run_sweep(&token, link.as_ref(), &self.counter)
            .await?;
        self.set_state(DeviceState::On, STATUS_ON);

        if self.options.persistence.saves_each_change() {
            self.persist_counter();
        }
        Ok(())
    }

    /// Send `command` to the actuator verbatim and return its reply.
    ///
    /// Diagnostics only. Nothing is validated or normalized, the motion token
    /// is not taken and the operation count is not touched. A raw motion
    /// command can therefore move the mount behind the controller's back.
    #[instrument(skip(self))]
    pub async fn raw_command(&self, command: &str) -> StageResult<String> {
        let link = self.prepare().await?;
        link.raw_command(command)
            .await
            .map_err(|e| StageError::motion("raw_command", e))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn current_link(&self) -> Option<Arc<dyn ActuatorLink>> {
        self.link.read().clone()
    }

    /// Refresh status, then hand out the link or fail with `NotConnected`.
    async fn prepare(&self) -> StageResult<Arc<dyn ActuatorLink>> {
        self.refresh_status().await?;
        self.current_link().ok_or(StageError::NotConnected)
    }

    fn set_state(&self, state: DeviceState, base_status: &str) {
        let mut fsm = self.fsm.lock();
        if fsm.state != state {
            if fsm.state.can_transition_to(state) {
                tracing::debug!(from = %fsm.state, to = %state, "State transition");
            } else {
                tracing::warn!(from = %fsm.state, to = %state, "Undefined state transition");
            }
        }
        fsm.state = state;
        fsm.base_status = base_status.to_string();
    }

    fn report(&self) -> StatusReport {
        let (state, base) = {
            let fsm = self.fsm.lock();
            (fsm.state, fsm.base_status.clone())
        };
        let maintenance_due = self.counter.is_over_threshold();
        StatusReport {
            state,
            status: compose_status(&base, maintenance_due),
            num_operations: self.counter.count(),
            maintenance_due,
        }
    }

    fn motion_completed(&self) {
        self.set_state(DeviceState::On, STATUS_ON);
        let count = self.counter.increment();
        if count == self.counter.threshold().saturating_add(1) {
            tracing::warn!(
                num_operations = count,
                threshold = self.counter.threshold(),
                "Swipe operation due"
            );
        }
        if self.options.persistence.saves_each_change() {
            self.persist_counter();
        }
    }

    fn persist_counter(&self) {
        let name = self.identity.read().name.clone();
        if let Err(e) = self.counter.save(self.store.as_ref(), &name) {
            tracing::warn!(device = %name, error = %e, "Could not persist operation count");
        }
    }
}

impl std::fmt::Debug for StageController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageController")
            .field("identity", &*self.identity.read())
            .field("driver", &self.factory.driver_type())
            .field("state", &self.state())
            .field("num_operations", &self.counter.count())
            .finish()
    }
}
