//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/rotation-stage.toml`)
//! 2. Environment variables prefixed with `ROTATION_STAGE_`, with `__`
//!    separating nested keys
//!
//! Every field has a default, so a missing file yields a usable mock setup.
//!
//! # Example
//! ```no_run
//! use rotation_stage::config::StageConfig;
//!
//! let config = StageConfig::load()?;
//! config.validate()?;
//! println!("Device: {}", config.device.name);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! `ROTATION_STAGE_DEVICE__PORT=/dev/ttyUSB1` overrides `[device] port`.

use crate::controller::{ControllerOptions, DeviceIdentity};
use crate::logging::OutputFormat;
use crate::maintenance::{CounterPersistence, DEFAULT_SWIPE_THRESHOLD};
use crate::store::{MemoryPropertyStore, TomlPropertyStore};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use stage_core::{LinkFactory, PropertyStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/rotation-stage.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "ROTATION_STAGE_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Device identity and driver selection
    pub device: DeviceConfig,
    /// Link timing
    pub link: LinkConfig,
    /// Swipe maintenance policy
    pub maintenance: MaintenanceConfig,
    /// Logging output
    pub logging: LoggingConfig,
}

/// Link implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    /// Thorlabs ELL14 over a serial port
    Ell14,
    /// Simulated rotator
    #[default]
    Mock,
}

/// Device identity and driver selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device name; keys persisted properties
    pub name: String,
    /// Link implementation
    pub driver: DriverKind,
    /// Serial transport identifier
    pub port: String,
    /// Bus address (0-15)
    pub address: u8,
    /// Run a swipe right after initialize
    pub swipe_on_init: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "rotation-stage".to_string(),
            driver: DriverKind::default(),
            port: "/dev/ttyUSB0".to_string(),
            address: 0,
            swipe_on_init: false,
        }
    }
}

/// Link timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Reply timeout for queries and settings in milliseconds
    pub timeout_ms: u64,
    /// Timeout for motion commands in milliseconds
    pub move_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 500,
            move_timeout_ms: 10_000,
        }
    }
}

/// Swipe maintenance policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Operations after which a swipe is advised
    pub threshold: u64,
    /// When the operation count is loaded and saved
    pub persistence: CounterPersistence,
    /// Property file used when persistence is enabled
    pub store_path: PathBuf,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SWIPE_THRESHOLD,
            persistence: CounterPersistence::default(),
            store_path: PathBuf::from("stage-properties.toml"),
        }
    }
}

/// Logging output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format
    pub format: OutputFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: OutputFormat::Pretty,
        }
    }
}

impl StageConfig {
    /// Load configuration from the default path and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path and environment variables
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        if self.device.name.trim().is_empty() {
            return Err("Device name must not be empty".to_string());
        }

        if self.device.address > 0x0F {
            return Err(format!(
                "Invalid bus address {}. Must be 0-15",
                self.device.address
            ));
        }

        if self.device.driver == DriverKind::Ell14 && self.device.port.trim().is_empty() {
            return Err("A serial port is required for the ell14 driver".to_string());
        }

        if self.maintenance.threshold == 0 {
            return Err("Maintenance threshold must be greater than zero".to_string());
        }

        if self.link.timeout_ms == 0 || self.link.move_timeout_ms == 0 {
            return Err("Link timeouts must be greater than zero".to_string());
        }

        Ok(())
    }

    /// Device identity from the `[device]` section.
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(&self.device.name, &self.device.port, self.device.address)
    }

    /// Controller options from the `[device]` and `[maintenance]` sections.
    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            swipe_threshold: self.maintenance.threshold,
            persistence: self.maintenance.persistence,
            swipe_on_init: self.device.swipe_on_init,
        }
    }

    /// Build the link factory for the configured driver.
    pub fn link_factory(&self) -> anyhow::Result<Arc<dyn LinkFactory>> {
        match self.device.driver {
            #[cfg(feature = "thorlabs")]
            DriverKind::Ell14 => {
                let config = stage_driver_thorlabs::Ell14Config {
                    timeout_ms: self.link.timeout_ms,
                    move_timeout_ms: self.link.move_timeout_ms,
                    pulses_per_degree: None,
                };
                Ok(Arc::new(stage_driver_thorlabs::Ell14LinkFactory::new(config)))
            }
            #[cfg(feature = "mock")]
            DriverKind::Mock => {
                tracing::warn!(
                    device = %self.device.name,
                    "Using the simulated rotator; no hardware will move"
                );
                Ok(Arc::new(stage_driver_mock::MockLinkFactory::new()))
            }
            #[allow(unreachable_patterns)]
            other => anyhow::bail!("Driver {:?} is not compiled into this build", other),
        }
    }

    /// Build the property store for the configured persistence policy.
    pub fn property_store(&self) -> Arc<dyn PropertyStore> {
        match self.maintenance.persistence {
            CounterPersistence::InMemory => Arc::new(MemoryPropertyStore::new()),
            CounterPersistence::OnShutdown | CounterPersistence::EveryOperation => {
                Arc::new(TomlPropertyStore::new(&self.maintenance.store_path))
            }
        }
    }
}
