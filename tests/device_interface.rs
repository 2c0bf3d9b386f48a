//! The by-name attribute/command surface.

use rotation_stage::{DeviceIdentity, DeviceInterface, MemoryPropertyStore, StageController, StageError};
use serde_json::{json, Value};
use stage_driver_mock::MockLinkFactory;
use std::sync::Arc;

async fn device() -> (StageController, Arc<MockLinkFactory>) {
    let factory = Arc::new(MockLinkFactory::new());
    let controller = StageController::new(
        DeviceIdentity::new("lab/rotator/1", "/dev/ttyUSB0", 0),
        factory.clone(),
        Arc::new(MemoryPropertyStore::new()),
    );
    controller.initialize("/dev/ttyUSB0", 0).await.unwrap();
    (controller, factory)
}

#[tokio::test]
async fn test_attribute_round_trip() {
    let (device, _factory) = device().await;

    device.write_attribute("position", json!(400.0)).await.unwrap();
    assert_eq!(device.read_attribute("position").await.unwrap(), json!(40.0));

    device.write_attribute("velocity", json!(80)).await.unwrap();
    assert_eq!(device.read_attribute("velocity").await.unwrap(), json!(64.0));

    device.write_attribute("home_offset", json!(-30.0)).await.unwrap();
    assert_eq!(device.read_attribute("home_offset").await.unwrap(), json!(330.0));

    assert_eq!(device.read_attribute("num_operations").await.unwrap(), json!(1));
    assert_eq!(device.read_attribute("state").await.unwrap(), json!("ON"));
    assert_eq!(
        device.read_attribute("status").await.unwrap(),
        json!("The device is ON")
    );
}

#[tokio::test]
async fn test_read_only_and_unknown_attributes() {
    let (device, _factory) = device().await;

    assert_eq!(
        device.write_attribute("num_operations", json!(0)).await.unwrap_err(),
        StageError::ReadOnly("num_operations".to_string())
    );
    assert_eq!(
        device.write_attribute("state", json!("ON")).await.unwrap_err(),
        StageError::ReadOnly("state".to_string())
    );
    assert!(matches!(
        device.read_attribute("temperature").await,
        Err(StageError::InvalidArgument(_))
    ));
    assert!(matches!(
        device.write_attribute("position", json!("ninety")).await,
        Err(StageError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_commands() {
    let (device, factory) = device().await;

    device.write_attribute("position", json!(90.0)).await.unwrap();
    assert_eq!(device.execute_command("homing", Value::Null).await.unwrap(), Value::Null);
    assert_eq!(device.read_attribute("position").await.unwrap(), json!(0.0));

    device
        .execute_command("move_relative", json!(15.0))
        .await
        .unwrap();
    assert_eq!(device.read_attribute("position").await.unwrap(), json!(15.0));
    assert_eq!(device.num_operations(), 3);

    let offset = device.execute_command("shift_offset", json!(5)).await.unwrap();
    assert_eq!(offset, json!(5.0));

    let reply = device
        .execute_command("raw_command", json!("0gp"))
        .await
        .unwrap();
    assert_eq!(reply, json!("0PO00001755"));

    device.execute_command("swipe", Value::Null).await.unwrap();
    assert_eq!(device.num_operations(), 0);

    device.execute_command("init", Value::Null).await.unwrap();
    assert_eq!(device.read_attribute("state").await.unwrap(), json!("ON"));
    assert!(factory
        .link("/dev/ttyUSB0", 0)
        .history()
        .contains(&"close".to_string()));
}

#[tokio::test]
async fn test_command_argument_errors() {
    let (device, _factory) = device().await;

    assert!(matches!(
        device.execute_command("raw_command", json!(12)).await,
        Err(StageError::InvalidArgument(_))
    ));
    assert!(matches!(
        device.execute_command("shift_offset", Value::Null).await,
        Err(StageError::InvalidArgument(_))
    ));
    assert!(matches!(
        device.execute_command("self_destruct", Value::Null).await,
        Err(StageError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_tables_describe_surface() {
    let (device, _factory) = device().await;

    let attributes: Vec<&str> = device.attributes().iter().map(|a| a.name).collect();
    assert_eq!(
        attributes,
        vec!["position", "velocity", "home_offset", "num_operations", "state", "status"]
    );
    let commands: Vec<&str> = device.commands().iter().map(|c| c.name).collect();
    assert!(commands.contains(&"swipe"));
    assert!(commands.contains(&"raw_command"));
}
