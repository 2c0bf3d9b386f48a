//! Controller behavior against the simulated rotator.

use rotation_stage::state::{STATUS_MOVING, STATUS_ON};
use rotation_stage::{
    ControllerOptions, DeviceIdentity, DeviceState, MemoryPropertyStore, StageController,
    StageError, SWIPE_ADVISORY,
};
use stage_driver_mock::{ErrorConfig, ErrorScenario, MockLinkFactory, MockRotatorConfig};
use std::sync::Arc;
use std::time::Duration;

const PORT: &str = "/dev/ttyUSB0";
const ADDRESS: u8 = 2;

fn controller_with(factory: Arc<MockLinkFactory>, options: ControllerOptions) -> StageController {
    StageController::with_options(
        DeviceIdentity::new("lab/rotator/1", PORT, ADDRESS),
        factory,
        Arc::new(MemoryPropertyStore::new()),
        options,
    )
}

async fn connected() -> (StageController, Arc<MockLinkFactory>) {
    let factory = Arc::new(MockLinkFactory::new());
    let controller = controller_with(factory.clone(), ControllerOptions::default());
    controller.initialize(PORT, ADDRESS).await.unwrap();
    (controller, factory)
}

/// Simulated rotator that needs 1 ms per degree at full speed.
fn slow_factory() -> Arc<MockLinkFactory> {
    Arc::new(MockLinkFactory::with_config(MockRotatorConfig {
        ms_per_degree: 1.0,
        ..Default::default()
    }))
}

#[tokio::test]
async fn test_initialize_enters_on() {
    let (controller, _factory) = connected().await;

    let report = controller.refresh_status().await.unwrap();
    assert_eq!(report.state, DeviceState::On);
    assert_eq!(report.status, STATUS_ON);
    assert_eq!(report.num_operations, 0);
    assert!(!report.maintenance_due);
}

#[tokio::test]
async fn test_write_position_wraps_modulo_360() {
    let (controller, _factory) = connected().await;

    controller.write_position(370.0).await.unwrap();
    assert!((controller.read_position().await.unwrap() - 10.0).abs() < 1e-9);

    controller.write_position(-90.0).await.unwrap();
    assert!((controller.read_position().await.unwrap() - 270.0).abs() < 1e-9);

    controller.write_position(720.0).await.unwrap();
    assert_eq!(controller.read_position().await.unwrap(), 0.0);
}

#[tokio::test]
async fn test_non_finite_position_is_rejected() {
    let (controller, factory) = connected().await;

    let err = controller.write_position(f64::NAN).await.unwrap_err();
    assert!(matches!(err, StageError::InvalidArgument(_)));
    assert_eq!(controller.num_operations(), 0);
    assert_eq!(factory.link(PORT, ADDRESS).motion_count(), 0);
}

#[tokio::test]
async fn test_counter_increments_only_on_success() {
    let (controller, factory) = connected().await;
    factory
        .link(PORT, ADDRESS)
        .set_error_config(ErrorConfig::scenario(ErrorScenario::FailOnce {
            operation: "move_absolute",
        }));

    let err = controller.write_position(45.0).await.unwrap_err();
    assert!(matches!(err, StageError::Motion { operation: "write_position", .. }));
    assert_eq!(controller.num_operations(), 0);
    // Motion failures do not demote the state
    assert_eq!(controller.refresh_status().await.unwrap().state, DeviceState::On);

    controller.write_position(45.0).await.unwrap();
    assert_eq!(controller.num_operations(), 1);

    controller.home().await.unwrap();
    assert_eq!(controller.num_operations(), 2);

    controller.move_relative(-10.0).await.unwrap();
    assert_eq!(controller.num_operations(), 3);
    assert!((controller.read_position().await.unwrap() - 350.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_home_failure_is_motion_error() {
    let (controller, factory) = connected().await;
    factory
        .link(PORT, ADDRESS)
        .set_error_config(ErrorConfig::scenario(ErrorScenario::Timeout { operation: "home" }));

    let err = controller.home().await.unwrap_err();
    match err {
        StageError::Motion { operation, message } => {
            assert_eq!(operation, "home");
            assert!(message.contains("timed out"), "{}", message);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(controller.num_operations(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_writes_one_busy() {
    let controller = controller_with(slow_factory(), ControllerOptions::default());
    controller.initialize(PORT, ADDRESS).await.unwrap();

    let (first, second) = tokio::join!(
        controller.write_position(90.0),
        controller.write_position(180.0)
    );

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(StageError::Busy)))
            .count(),
        1
    );
    assert_eq!(controller.num_operations(), 1);
    assert!(!controller.is_busy());
}

#[tokio::test(start_paused = true)]
async fn test_state_is_moving_during_motion() {
    let controller = Arc::new(controller_with(slow_factory(), ControllerOptions::default()));
    controller.initialize(PORT, ADDRESS).await.unwrap();

    let mover = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.write_position(180.0).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let report = controller.refresh_status().await.unwrap();
    assert_eq!(report.state, DeviceState::Moving);
    assert_eq!(report.status, STATUS_MOVING);

    // Reads do not take the motion token
    assert!(controller.read_position().await.is_ok());
    assert_eq!(controller.home().await.unwrap_err(), StageError::Busy);

    mover.await.unwrap().unwrap();
    assert_eq!(controller.refresh_status().await.unwrap().state, DeviceState::On);
    assert_eq!(controller.read_position().await.unwrap(), 180.0);
}

#[tokio::test]
async fn test_velocity_is_clamped() {
    let (controller, factory) = connected().await;
    let link = factory.link(PORT, ADDRESS);

    assert_eq!(controller.set_velocity(100.0).await.unwrap(), 64.0);
    assert_eq!(link.velocity_setting(), 64.0);

    assert_eq!(controller.set_velocity(-5.0).await.unwrap(), 0.0);
    assert_eq!(controller.get_velocity().await.unwrap(), 0.0);

    assert_eq!(controller.set_velocity(32.0).await.unwrap(), 32.0);
    assert_eq!(controller.get_velocity().await.unwrap(), 32.0);

    assert!(matches!(
        controller.set_velocity(f64::INFINITY).await,
        Err(StageError::InvalidArgument(_))
    ));
    assert_eq!(link.velocity_setting(), 32.0);
}

#[tokio::test]
async fn test_home_offset_is_normalized_and_shiftable() {
    let (controller, _factory) = connected().await;

    assert_eq!(controller.set_home_offset(-10.0).await.unwrap(), 350.0);
    assert_eq!(controller.get_home_offset().await.unwrap(), 350.0);

    let shifted = controller.shift_home_offset(20.0).await.unwrap();
    assert!((shifted - 10.0).abs() < 1e-9);
    assert!((controller.get_home_offset().await.unwrap() - 10.0).abs() < 1e-9);

    // Offsets are settings, not motion
    assert_eq!(controller.num_operations(), 0);
}

#[tokio::test]
async fn test_advisory_after_threshold_and_swipe_clears_it() {
    let (controller, _factory) = connected().await;

    for i in 0..10_001u32 {
        controller
            .write_position(f64::from(i % 360))
            .await
            .unwrap();
    }

    assert_eq!(controller.num_operations(), 10_001);
    let report = controller.refresh_status().await.unwrap();
    assert!(report.maintenance_due);
    assert_eq!(report.status.lines().next(), Some(SWIPE_ADVISORY));
    assert_eq!(report.status.lines().nth(1), Some(STATUS_ON));

    controller.swipe().await.unwrap();
    assert_eq!(controller.num_operations(), 0);
    let report = controller.refresh_status().await.unwrap();
    assert!(!report.maintenance_due);
    assert!(!report.status.contains(SWIPE_ADVISORY));
}

#[tokio::test]
async fn test_advisory_is_strictly_above_threshold() {
    let factory = Arc::new(MockLinkFactory::new());
    let controller = controller_with(
        factory,
        ControllerOptions {
            swipe_threshold: 3,
            ..Default::default()
        },
    );
    controller.initialize(PORT, ADDRESS).await.unwrap();

    for _ in 0..3 {
        controller.home().await.unwrap();
    }
    assert!(!controller.refresh_status().await.unwrap().maintenance_due);

    controller.home().await.unwrap();
    assert!(controller.refresh_status().await.unwrap().maintenance_due);
}

#[tokio::test]
async fn test_swipe_restores_position_without_counting() {
    let (controller, factory) = connected().await;
    controller.write_position(123.0).await.unwrap();
    let link = factory.link(PORT, ADDRESS);
    link.clear_history();

    controller.swipe().await.unwrap();

    assert_eq!(
        link.history(),
        vec![
            "move_absolute 0.000",
            "move_absolute 359.000",
            "move_absolute 0.000",
            "move_absolute 123.000",
        ]
    );
    assert_eq!(controller.read_position().await.unwrap(), 123.0);
    assert_eq!(controller.num_operations(), 0);
    assert_eq!(controller.state(), DeviceState::On);
}

#[tokio::test]
async fn test_failed_swipe_keeps_count() {
    let (controller, factory) = connected().await;
    for _ in 0..5 {
        controller.home().await.unwrap();
    }
    factory
        .link(PORT, ADDRESS)
        .set_error_config(ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: "move_absolute",
            count: 2,
        }));

    let err = controller.swipe().await.unwrap_err();
    match err {
        StageError::Motion { operation, message } => {
            assert_eq!(operation, "swipe");
            assert!(message.contains("step 3"), "{}", message);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(controller.num_operations(), 5);
    // The mount stays where the sweep stopped
    assert_eq!(controller.read_position().await.unwrap(), 359.0);
}

#[tokio::test]
async fn test_unreachable_port_faults() {
    let factory = Arc::new(MockLinkFactory::new().with_unreachable_port("/dev/ttyUSB9"));
    let controller = controller_with(factory.clone(), ControllerOptions::default());

    let err = controller.initialize("/dev/ttyUSB9", ADDRESS).await.unwrap_err();
    assert!(matches!(err, StageError::Connect { ref port, .. } if port == "/dev/ttyUSB9"));

    let report = controller.refresh_status().await.unwrap();
    assert_eq!(report.state, DeviceState::Fault);
    assert!(report.status.contains("Cannot connect on port /dev/ttyUSB9"));

    assert_eq!(controller.read_position().await.unwrap_err(), StageError::NotConnected);
    assert_eq!(controller.home().await.unwrap_err(), StageError::NotConnected);
    // Fault is sticky
    assert_eq!(controller.refresh_status().await.unwrap().state, DeviceState::Fault);

    factory.set_reachable("/dev/ttyUSB9", true);
    controller.reinitialize().await.unwrap();
    assert_eq!(controller.state(), DeviceState::On);
    assert!(controller.read_position().await.is_ok());
}

#[tokio::test]
async fn test_not_connected_before_initialize() {
    let controller = controller_with(Arc::new(MockLinkFactory::new()), ControllerOptions::default());

    assert_eq!(controller.state(), DeviceState::Init);
    assert_eq!(controller.refresh_status().await.unwrap().state, DeviceState::Init);
    assert_eq!(
        controller.write_position(10.0).await.unwrap_err(),
        StageError::NotConnected
    );
    assert_eq!(
        controller.raw_command("0gp").await.unwrap_err(),
        StageError::NotConnected
    );
}

#[tokio::test]
async fn test_raw_command_bypasses_counter() {
    let (controller, factory) = connected().await;
    controller.write_position(90.0).await.unwrap();

    let reply = controller.raw_command("2gp").await.unwrap();

    assert_eq!(reply, "2PO00008C00");
    assert_eq!(controller.num_operations(), 1);
    assert_eq!(factory.link(PORT, ADDRESS).history().last().unwrap(), "raw 2gp");
}

#[tokio::test]
async fn test_shutdown_without_initialize_is_noop() {
    let controller = controller_with(Arc::new(MockLinkFactory::new()), ControllerOptions::default());

    controller.shutdown().await.unwrap();
    controller.shutdown().await.unwrap();
    assert_eq!(controller.state(), DeviceState::Init);
}

#[tokio::test]
async fn test_shutdown_closes_link() {
    let (controller, factory) = connected().await;

    controller.shutdown().await.unwrap();

    assert!(factory.link(PORT, ADDRESS).is_closed());
    assert_eq!(controller.state(), DeviceState::Init);
    assert_eq!(controller.read_position().await.unwrap_err(), StageError::NotConnected);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_motion() {
    let factory = slow_factory();
    let controller = Arc::new(controller_with(factory.clone(), ControllerOptions::default()));
    controller.initialize(PORT, ADDRESS).await.unwrap();

    let mover = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.write_position(200.0).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;

    controller.shutdown().await.unwrap();

    let link = factory.link(PORT, ADDRESS);
    assert_eq!(link.motion_count(), 1);
    assert!(link.is_closed());
    mover.await.unwrap().unwrap();
    assert_eq!(controller.num_operations(), 1);
}

#[tokio::test]
async fn test_swipe_on_init() {
    let factory = Arc::new(MockLinkFactory::with_config(MockRotatorConfig {
        initial_position: 45.0,
        ..Default::default()
    }));
    let controller = controller_with(
        factory.clone(),
        ControllerOptions {
            swipe_on_init: true,
            ..Default::default()
        },
    );

    controller.initialize(PORT, ADDRESS).await.unwrap();

    let history = factory.link(PORT, ADDRESS).history();
    assert_eq!(history.len(), 4);
    assert_eq!(history[1], "move_absolute 359.000");
    assert_eq!(controller.read_position().await.unwrap(), 45.0);
    assert_eq!(controller.state(), DeviceState::On);
}

#[tokio::test]
async fn test_failed_startup_swipe_keeps_device_on() {
    let factory = Arc::new(MockLinkFactory::new());
    factory
        .link(PORT, ADDRESS)
        .set_error_config(ErrorConfig::scenario(ErrorScenario::FailOnce {
            operation: "move_absolute",
        }));
    let controller = controller_with(
        factory,
        ControllerOptions {
            swipe_on_init: true,
            ..Default::default()
        },
    );

    controller.initialize(PORT, ADDRESS).await.unwrap();
    assert_eq!(controller.refresh_status().await.unwrap().state, DeviceState::On);
}

#[tokio::test]
async fn test_link_loss_surfaces_as_motion_error() {
    let (controller, factory) = connected().await;
    factory
        .link(PORT, ADDRESS)
        .set_error_config(ErrorConfig::scenario(ErrorScenario::CommunicationLoss));

    let err = controller.read_position().await.unwrap_err();
    assert!(matches!(err, StageError::Motion { operation: "refresh_status", .. }));
    assert!(err.to_string().contains("Communication lost"));
}
