//! Mock rotation stage link (ELL14-like).

use crate::common::ErrorConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use stage_core::error::{DriverError, DriverErrorKind};
use stage_core::link::{normalize_degrees, ActuatorLink, LinkFactory, MAX_VELOCITY};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const DRIVER_TYPE: &str = "mock_rotator";

/// ELL14 calibration: 143360 pulses per revolution.
const PULSES_PER_DEGREE: f64 = 143_360.0 / 360.0;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the mock rotator
#[derive(Debug, Clone, Deserialize)]
pub struct MockRotatorConfig {
    /// Initial position in degrees (default: 0.0)
    #[serde(default)]
    pub initial_position: f64,

    /// Initial velocity, 0-64 (default: 64)
    #[serde(default = "default_velocity")]
    pub velocity: f64,

    /// Initial home offset in degrees (default: 0.0)
    #[serde(default)]
    pub home_offset: f64,

    /// Simulated travel time per degree at full velocity (default: 0, instant)
    #[serde(default)]
    pub ms_per_degree: f64,
}

fn default_velocity() -> f64 {
    MAX_VELOCITY
}

impl Default for MockRotatorConfig {
    fn default() -> Self {
        Self {
            initial_position: 0.0,
            velocity: default_velocity(),
            home_offset: 0.0,
            ms_per_degree: 0.0,
        }
    }
}

impl MockRotatorConfig {
    /// Check the configuration for values the simulated firmware would reject.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=MAX_VELOCITY).contains(&self.velocity) {
            return Err(anyhow!("Velocity must be 0-{}", MAX_VELOCITY));
        }
        if normalize_degrees(self.initial_position).is_none() {
            return Err(anyhow!("Initial position must be finite"));
        }
        if normalize_degrees(self.home_offset).is_none() {
            return Err(anyhow!("Home offset must be finite"));
        }
        if !self.ms_per_degree.is_finite() || self.ms_per_degree < 0.0 {
            return Err(anyhow!("ms_per_degree must be a non-negative number"));
        }
        Ok(())
    }
}

// =============================================================================
// MockRotatorLink - Simulated Rotary Stage
// =============================================================================

/// Simulated rotation mount implementing [`ActuatorLink`].
///
/// Simulates an ELL14 with:
/// - Position wrapping into 0-360 degrees
/// - Velocity-dependent motion timing
/// - Home offset storage
/// - A moving flag visible to `is_moving` while a move is in progress
/// - Error injection through [`ErrorConfig`]
/// - A command history for assertions
///
/// # Example
///
/// ```rust,ignore
/// let link = MockRotatorLink::new(0);
/// link.move_absolute(90.0).await?;
/// assert_eq!(link.get_position().await?, 90.0);
/// ```
pub struct MockRotatorLink {
    address: u8,
    ms_per_degree: f64,
    position_degrees: RwLock<f64>,
    velocity: RwLock<f64>,
    home_offset: RwLock<f64>,
    moving: AtomicBool,
    closed: AtomicBool,
    errors: RwLock<ErrorConfig>,
    history: Mutex<Vec<String>>,
    motion_count: AtomicUsize,
}

impl MockRotatorLink {
    /// Create a mock link with default configuration.
    pub fn new(address: u8) -> Self {
        Self::with_config(address, MockRotatorConfig::default())
    }

    /// Create a mock link with custom configuration.
    pub fn with_config(address: u8, config: MockRotatorConfig) -> Self {
        Self {
            address,
            ms_per_degree: config.ms_per_degree.max(0.0),
            position_degrees: RwLock::new(normalize_degrees(config.initial_position).unwrap_or(0.0)),
            velocity: RwLock::new(config.velocity.clamp(0.0, MAX_VELOCITY)),
            home_offset: RwLock::new(normalize_degrees(config.home_offset).unwrap_or(0.0)),
            moving: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            errors: RwLock::new(ErrorConfig::none()),
            history: Mutex::new(Vec::new()),
            motion_count: AtomicUsize::new(0),
        }
    }

    /// Replace the error injection configuration.
    pub fn set_error_config(&self, errors: ErrorConfig) {
        *self.errors.write() = errors;
    }

    /// Commands that changed the simulated device, oldest first.
    pub fn history(&self) -> Vec<String> {
        self.history.lock().clone()
    }

    /// Forget the recorded history.
    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    /// Number of completed motion commands.
    pub fn motion_count(&self) -> usize {
        self.motion_count.load(Ordering::Relaxed)
    }

    /// Whether `close` was called since the last (re)connect.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Current velocity without going through the error injection path.
    pub fn velocity_setting(&self) -> f64 {
        *self.velocity.read()
    }

    fn reopen(&self) {
        self.closed.store(false, Ordering::Relaxed);
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(DriverError::new(
                DRIVER_TYPE,
                DriverErrorKind::Communication,
                "Link is closed",
            )
            .into());
        }
        let errors = self.errors.read().clone();
        errors.check_operation(DRIVER_TYPE, operation)?;
        Ok(())
    }

    fn record(&self, entry: String) {
        tracing::trace!(address = self.address, entry = %entry, "Mock rotator command");
        self.history.lock().push(entry);
    }

    /// Calculate movement duration based on distance and velocity.
    fn calculate_duration(&self, distance_degrees: f64) -> Duration {
        if self.ms_per_degree <= 0.0 {
            return Duration::ZERO;
        }
        let velocity_factor = (*self.velocity.read()).max(1.0) / MAX_VELOCITY;
        let duration_ms = distance_degrees.abs() * self.ms_per_degree / velocity_factor;
        Duration::from_millis(duration_ms.round() as u64)
    }

    async fn travel_to(&self, target: f64) {
        let current = *self.position_degrees.read();
        let duration = self.calculate_duration(target - current);

        self.moving.store(true, Ordering::Release);
        if !duration.is_zero() {
            sleep(duration).await;
        }
        *self.position_degrees.write() = target;
        self.moving.store(false, Ordering::Release);
        self.motion_count.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl ActuatorLink for MockRotatorLink {
    async fn move_absolute(&self, degrees: f64) -> Result<()> {
        self.check("move_absolute")?;
        let target =
            normalize_degrees(degrees).ok_or_else(|| anyhow!("Invalid target {}", degrees))?;
        self.record(format!("move_absolute {:.3}", target));
        self.travel_to(target).await;
        Ok(())
    }

    async fn move_relative(&self, degrees: f64) -> Result<()> {
        self.check("move_relative")?;
        let current = *self.position_degrees.read();
        let target = normalize_degrees(current + degrees)
            .ok_or_else(|| anyhow!("Invalid distance {}", degrees))?;
        self.record(format!("move_relative {:.3}", degrees));
        self.travel_to(target).await;
        Ok(())
    }

    async fn home(&self) -> Result<()> {
        self.check("home")?;
        self.record("home".to_string());
        self.travel_to(0.0).await;
        Ok(())
    }

    async fn get_position(&self) -> Result<f64> {
        self.check("get_position")?;
        Ok(*self.position_degrees.read())
    }

    async fn get_velocity(&self) -> Result<f64> {
        self.check("get_velocity")?;
        Ok(*self.velocity.read())
    }

    async fn set_velocity(&self, velocity: f64) -> Result<()> {
        self.check("set_velocity")?;
        if !(0.0..=MAX_VELOCITY).contains(&velocity) {
            return Err(anyhow!("Velocity must be 0-{}", MAX_VELOCITY));
        }
        self.record(format!("set_velocity {:.0}", velocity));
        *self.velocity.write() = velocity;
        Ok(())
    }

    async fn get_home_offset(&self) -> Result<f64> {
        self.check("get_home_offset")?;
        Ok(*self.home_offset.read())
    }

    async fn set_home_offset(&self, degrees: f64) -> Result<()> {
        self.check("set_home_offset")?;
        let offset =
            normalize_degrees(degrees).ok_or_else(|| anyhow!("Invalid offset {}", degrees))?;
        self.record(format!("set_home_offset {:.3}", offset));
        *self.home_offset.write() = offset;
        Ok(())
    }

    async fn is_moving(&self) -> Result<bool> {
        self.check("is_moving")?;
        Ok(self.moving.load(Ordering::Acquire))
    }

    async fn raw_command(&self, command: &str) -> Result<String> {
        self.check("raw_command")?;
        self.record(format!("raw {}", command));
        let reply = if command.ends_with("gp") {
            let pulses = (*self.position_degrees.read() * PULSES_PER_DEGREE).round() as u32;
            format!("{:X}PO{:08X}", self.address, pulses)
        } else {
            format!("{:X}GS00", self.address)
        };
        Ok(reply)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        self.record("close".to_string());
        Ok(())
    }
}

// =============================================================================
// MockLinkFactory - LinkFactory implementation
// =============================================================================

/// Factory for mock rotator links.
///
/// Links are remembered per `(port, address)`, so reconnecting reaches the same
/// simulated device with its position intact. Ports can be marked unreachable
/// to exercise connect failures.
pub struct MockLinkFactory {
    config: MockRotatorConfig,
    unreachable: Mutex<HashSet<String>>,
    links: Mutex<HashMap<(String, u8), Arc<MockRotatorLink>>>,
}

impl MockLinkFactory {
    /// Create a factory producing default mock links.
    pub fn new() -> Self {
        Self::with_config(MockRotatorConfig::default())
    }

    /// Create a factory producing links with the given configuration.
    pub fn with_config(config: MockRotatorConfig) -> Self {
        Self {
            config,
            unreachable: Mutex::new(HashSet::new()),
            links: Mutex::new(HashMap::new()),
        }
    }

    /// Mark a port as unreachable (builder form).
    pub fn with_unreachable_port(self, port: &str) -> Self {
        self.set_reachable(port, false);
        self
    }

    /// Mark a port reachable or unreachable.
    pub fn set_reachable(&self, port: &str, reachable: bool) {
        let mut unreachable = self.unreachable.lock();
        if reachable {
            unreachable.remove(port);
        } else {
            unreachable.insert(port.to_string());
        }
    }

    /// The simulated device behind `(port, address)`, created on demand.
    pub fn link(&self, port: &str, address: u8) -> Arc<MockRotatorLink> {
        self.links
            .lock()
            .entry((port.to_string(), address))
            .or_insert_with(|| Arc::new(MockRotatorLink::with_config(address, self.config.clone())))
            .clone()
    }
}

impl Default for MockLinkFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkFactory for MockLinkFactory {
    fn driver_type(&self) -> &'static str {
        DRIVER_TYPE
    }

    fn name(&self) -> &'static str {
        "Mock Rotation Stage"
    }

    fn connect(&self, port: &str, address: u8) -> BoxFuture<'static, Result<Arc<dyn ActuatorLink>>> {
        let result: Result<Arc<dyn ActuatorLink>> = if self.unreachable.lock().contains(port) {
            Err(DriverError::new(
                DRIVER_TYPE,
                DriverErrorKind::Communication,
                format!("Cannot open serial port {}: no such device", port),
            )
            .into())
        } else {
            let link = self.link(port, address);
            link.reopen();
            tracing::debug!(port, address, "Mock rotator connected");
            Ok(link as Arc<dyn ActuatorLink>)
        };
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorScenario;

    #[test]
    fn test_config_validation() {
        assert!(MockRotatorConfig::default().validate().is_ok());

        let too_fast = MockRotatorConfig {
            velocity: 100.0,
            ..Default::default()
        };
        assert!(too_fast.validate().is_err());

        let negative_timing = MockRotatorConfig {
            ms_per_degree: -1.0,
            ..Default::default()
        };
        assert!(negative_timing.validate().is_err());
    }

    #[tokio::test]
    async fn test_absolute_moves_wrap() -> Result<()> {
        let link = MockRotatorLink::new(0);

        link.move_absolute(90.0).await?;
        assert_eq!(link.get_position().await?, 90.0);

        link.move_absolute(450.0).await?;
        assert_eq!(link.get_position().await?, 90.0);

        link.move_absolute(-30.0).await?;
        assert_eq!(link.get_position().await?, 330.0);
        assert_eq!(link.motion_count(), 3);

        Ok(())
    }

    #[tokio::test]
    async fn test_relative_movement() -> Result<()> {
        let link = MockRotatorLink::new(0);

        link.move_absolute(350.0).await?;
        link.move_relative(20.0).await?;
        assert_eq!(link.get_position().await?, 10.0);

        link.move_relative(-20.0).await?;
        assert_eq!(link.get_position().await?, 350.0);

        Ok(())
    }

    #[tokio::test]
    async fn test_homing_returns_to_zero() -> Result<()> {
        let link = MockRotatorLink::new(0);
        link.move_absolute(123.0).await?;
        link.home().await?;
        assert_eq!(link.get_position().await?, 0.0);
        assert_eq!(link.history().last().map(String::as_str), Some("home"));
        Ok(())
    }

    #[tokio::test]
    async fn test_velocity_range_enforced() -> Result<()> {
        let link = MockRotatorLink::new(0);
        link.set_velocity(32.0).await?;
        assert_eq!(link.get_velocity().await?, 32.0);
        assert!(link.set_velocity(100.0).await.is_err());
        assert_eq!(link.velocity_setting(), 32.0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_moving_flag_during_travel() -> Result<()> {
        let link = Arc::new(MockRotatorLink::with_config(
            0,
            MockRotatorConfig {
                ms_per_degree: 1.0,
                ..Default::default()
            },
        ));

        let mover = {
            let link = link.clone();
            tokio::spawn(async move { link.move_absolute(90.0).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(link.is_moving().await?);

        mover.await??;
        assert!(!link.is_moving().await?);
        assert_eq!(link.get_position().await?, 90.0);
        Ok(())
    }

    #[tokio::test]
    async fn test_injected_failure_leaves_position() -> Result<()> {
        let link = MockRotatorLink::new(0);
        link.move_absolute(45.0).await?;
        link.set_error_config(ErrorConfig::scenario(ErrorScenario::Timeout {
            operation: "move_absolute",
        }));

        let err = link.move_absolute(90.0).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(link.get_position().await?, 45.0);
        Ok(())
    }

    #[tokio::test]
    async fn test_closed_link_rejects_commands() -> Result<()> {
        let link = MockRotatorLink::new(0);
        link.close().await?;
        assert!(link.is_closed());
        assert!(link.get_position().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_raw_command_position_reply() -> Result<()> {
        let link = MockRotatorLink::new(2);
        link.move_absolute(90.0).await?;
        assert_eq!(link.raw_command("2gp").await?, "2PO00008C00");
        assert_eq!(link.raw_command("2gs").await?, "2GS00");
        Ok(())
    }

    #[tokio::test]
    async fn test_factory_unreachable_port() {
        let factory = MockLinkFactory::new().with_unreachable_port("/dev/missing");
        let err = factory.connect("/dev/missing", 0).await.err();
        assert!(err.is_some_and(|e| e.to_string().contains("/dev/missing")));

        factory.set_reachable("/dev/missing", true);
        assert!(factory.connect("/dev/missing", 0).await.is_ok());
    }

    #[tokio::test]
    async fn test_factory_reconnect_reaches_same_device() -> Result<()> {
        let factory = MockLinkFactory::new();
        let first = factory.connect("/dev/ttyUSB0", 3).await?;
        first.move_absolute(200.0).await?;
        first.close().await?;

        let second = factory.connect("/dev/ttyUSB0", 3).await?;
        assert_eq!(second.get_position().await?, 200.0);
        assert_eq!(factory.driver_type(), "mock_rotator");
        Ok(())
    }
}
