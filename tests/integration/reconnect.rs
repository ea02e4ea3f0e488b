//! Link loss, heartbeat loss and the reconnection policy.

use std::sync::Arc;
use std::time::Duration;

use constellation::device::{ConstellationEvent, DeviceStatus};
use constellation::orchestration::SelectionCriteria;
use constellation::Error;

use crate::fixtures::{
    connected_manager, fast_options, wait_for_event, DeviceScript, MockFleet, Registration,
};

fn disconnected(device: &str, gave_up: bool) -> impl Fn(&ConstellationEvent) -> bool + '_ {
    move |e| {
        matches!(
            e,
            ConstellationEvent::DeviceDisconnected { device_id, failed, .. }
                if device_id == device && *failed == gave_up
        )
    }
}

fn connected(device: &str) -> impl Fn(&ConstellationEvent) -> bool + '_ {
    move |e| matches!(e, ConstellationEvent::DeviceConnected { device_id } if device_id == device)
}

#[tokio::test(start_paused = true)]
async fn test_dropped_link_reconnects() {
    let (fleet, connector) = MockFleet::start();
    let manager = connected_manager(&fleet, connector, fast_options(), &[("phone", &[])]).await;
    let mut events = manager.events().subscribe();

    fleet.drop_link("phone");

    match wait_for_event(&mut events, disconnected("phone", false)).await {
        ConstellationEvent::DeviceDisconnected { reason, .. } => {
            assert!(reason.contains("link closed"))
        }
        other => panic!("unexpected event {:?}", other),
    }
    wait_for_event(&mut events, connected("phone")).await;

    assert_eq!(fleet.connections("phone"), 2);
    let device = manager.registry().get_device("phone").await.unwrap();
    assert_eq!(device.status, DeviceStatus::Connected);
    assert_eq!(device.connection_attempts, 0);
    assert!(manager.heartbeat().is_running("phone").await);

    // The new link carries tasks.
    let result = manager
        .dispatch("after reconnect", Some("phone"), &SelectionCriteria::default(), None)
        .await
        .unwrap();
    assert_eq!(result.device_id, "phone");

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnection_gives_up_after_retry_budget() {
    let (fleet, connector) = MockFleet::start();
    let manager = connected_manager(&fleet, connector, fast_options(), &[("phone", &[])]).await;
    let mut events = manager.events().subscribe();

    fleet.update("phone", |s| {
        s.registration = Registration::Reject("device retired".to_string())
    });
    fleet.drop_link("phone");

    wait_for_event(&mut events, disconnected("phone", false)).await;
    match wait_for_event(&mut events, disconnected("phone", true)).await {
        ConstellationEvent::DeviceDisconnected { reason, .. } => {
            assert!(reason.contains("device retired"))
        }
        other => panic!("unexpected event {:?}", other),
    }

    let device = manager.registry().get_device("phone").await.unwrap();
    assert_eq!(device.status, DeviceStatus::Failed);
    assert_eq!(device.connection_attempts, 2);
    assert_eq!(fleet.connections("phone"), 3);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_missed_heartbeats_disconnect_device() {
    let (fleet, connector) = MockFleet::start();
    fleet.script(
        "phone",
        DeviceScript {
            answer_heartbeats: false,
            ..Default::default()
        },
    );
    let manager = connected_manager(&fleet, connector, fast_options(), &[("phone", &[])]).await;
    let mut events = manager.events().subscribe();

    match wait_for_event(&mut events, disconnected("phone", false)).await {
        ConstellationEvent::DeviceDisconnected { reason, .. } => {
            assert!(reason.contains("heartbeats missed"), "reason: {}", reason)
        }
        other => panic!("unexpected event {:?}", other),
    }

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_pending_task_fails_on_link_loss() {
    let (fleet, connector) = MockFleet::start();
    fleet.script(
        "phone",
        DeviceScript {
            ignore_tasks: true,
            ..Default::default()
        },
    );
    let manager = connected_manager(&fleet, connector, fast_options(), &[("phone", &[])]).await;

    let dispatcher = Arc::clone(&manager);
    let pending = tokio::spawn(async move {
        dispatcher
            .dispatch("never answered", Some("phone"), &SelectionCriteria::default(), None)
            .await
    });
    while fleet.received().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fleet.drop_link("phone");

    let err = pending.await.unwrap().unwrap_err();
    match err {
        Error::TaskFailed { error, .. } => assert!(error.contains("link closed")),
        other => panic!("expected TaskFailed, got {:?}", other),
    }
    assert_eq!(manager.orchestrator().pending_count().await, 0);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_explicit_disconnect_does_not_reconnect() {
    let (fleet, connector) = MockFleet::start();
    let manager = connected_manager(&fleet, connector, fast_options(), &[("phone", &[])]).await;

    manager.disconnect_device("phone").await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(fleet.connections("phone"), 1);
    assert_eq!(
        manager.registry().get_device("phone").await.unwrap().status,
        DeviceStatus::Disconnected
    );
    assert!(!manager.heartbeat().is_running("phone").await);
    assert!(!manager.processor().is_processing("phone").await);

    manager.shutdown().await;
}
