//! End-to-end tests through the application controller

mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::tempdir;
use tokio::time::timeout;

use common::{permissions, test_config, MockRadio, PeripheralScript};
use navlink::bluetooth::{ConnectionState, EventFilter, EventStatus, PeripheralIdentity};
use navlink::{AppController, AppLifecycle, DeviceRegistry};

#[tokio::test]
async fn test_controller_persists_pairing_and_publishes_events() {
    let dir = tempdir().unwrap();
    let mut config = test_config();
    config.registry.path = dir.path().join("devices.json");

    let radio = MockRadio::new();
    radio.add_peripheral("AA:01", PeripheralScript::data_device());
    let controller = AppController::new(&config, radio.clone(), Box::new(permissions(true)));

    let (_, mut connected) = controller
        .events()
        .subscribe(EventFilter::statuses(vec![EventStatus::Connected]));
    let (_, mut all) = controller.events().subscribe(EventFilter::devices(vec!["AA:01".to_string()]));

    controller
        .connection()
        .connect(PeripheralIdentity::new("AA:01", Some("NavBand A".to_string())))
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(1), connected.recv()).await.unwrap().unwrap();
    assert_eq!(event.device_id, "AA:01");
    assert_eq!(event.device_name, "NavBand A");

    let mut seen = Vec::new();
    while let Ok(Some(event)) = timeout(Duration::from_millis(100), all.recv()).await {
        seen.push(event.status);
    }
    assert_eq!(
        seen,
        vec![EventStatus::PairingStarted, EventStatus::Connected, EventStatus::PairingCompleted]
    );

    controller.shutdown().await;
    timeout(
        Duration::from_secs(1),
        controller.connection().wait_for(|s| s.state == ConnectionState::Idle),
    )
    .await
    .unwrap()
    .unwrap();

    let reopened = DeviceRegistry::open(&config.registry.path);
    let records = reopened.list_records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].peripheral.label(), "NavBand A");
}

#[tokio::test]
async fn test_controller_follows_app_lifecycle() {
    let dir = tempdir().unwrap();
    let mut config = test_config();
    config.registry.path = dir.path().join("devices.json");
    let controller = AppController::new(&config, MockRadio::new(), Box::new(permissions(true)));

    assert!(!controller.monitor().is_armed());
    controller.set_app_state(AppLifecycle::Background).await;
    assert!(controller.monitor().is_armed());
    controller.set_app_state(AppLifecycle::Foreground).await;
    assert!(!controller.monitor().is_armed());

    controller.shutdown().await;
    assert!(!controller.monitor().is_started());
}
