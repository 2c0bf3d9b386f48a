//! Mock rotation stage link for rotation-stage.
//!
//! Provides a simulated ELL14-like rotator implementing
//! [`stage_core::ActuatorLink`], so the device control layer can be exercised
//! without hardware. All timing uses `tokio::time::sleep`, which makes the
//! simulation compatible with paused-clock tests.
//!
//! # Usage
//!
//! ```rust,ignore
//! use stage_driver_mock::MockLinkFactory;
//!
//! let factory = Arc::new(MockLinkFactory::new().with_unreachable_port("/dev/missing"));
//! let controller = StageController::new(identity, factory.clone(), store);
//! controller.initialize("/dev/ttyUSB0", 0).await?;
//!
//! // Reach into the simulated device to inject failures
//! factory.link("/dev/ttyUSB0", 0).set_error_config(ErrorConfig::scenario(
//!     ErrorScenario::Timeout { operation: "move_absolute" },
//! ));
//! ```

pub mod common;
mod mock_rotator;

pub use common::{ErrorConfig, ErrorScenario, MockRng};
pub use mock_rotator::{MockLinkFactory, MockRotatorConfig, MockRotatorLink};
