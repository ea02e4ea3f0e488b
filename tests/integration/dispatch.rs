//! Single-task dispatch against scripted devices.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use constellation::device::{ConstellationEvent, DeviceSpec, DeviceStatus, Envelope};
use constellation::orchestration::{DeviceManager, SelectionCriteria};
use constellation::Error;

use crate::fixtures::{
    connected_manager, fast_options, wait_for_event, DeviceScript, MockFleet, Registration,
};

#[tokio::test(start_paused = true)]
async fn test_dispatch_completes_on_named_device() {
    let (fleet, connector) = MockFleet::start();
    let manager = connected_manager(&fleet, connector, fast_options(), &[("phone", &[])]).await;
    let mut events = manager.events().subscribe();

    let result = manager
        .dispatch("take a photo", Some("phone"), &SelectionCriteria::default(), None)
        .await
        .unwrap();

    assert_eq!(result.device_id, "phone");
    assert_eq!(result.result.as_ref().unwrap()["task"], result.task_id.as_str());
    assert_eq!(fleet.received(), vec![result.task_id.clone()]);

    let event = wait_for_event(&mut events, |e| {
        matches!(e, ConstellationEvent::TaskCompleted { .. })
    })
    .await;
    assert_eq!(event.task_id(), Some(result.task_id.as_str()));
    assert_eq!(manager.orchestrator().pending_count().await, 0);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_scripted_failure_surfaces_as_task_failed() {
    let (fleet, connector) = MockFleet::start();
    fleet.script(
        "phone",
        DeviceScript {
            fail_tasks: true,
            ..Default::default()
        },
    );
    let manager = connected_manager(&fleet, connector, fast_options(), &[("phone", &[])]).await;

    let err = manager
        .dispatch("take a photo", Some("phone"), &SelectionCriteria::default(), None)
        .await
        .unwrap_err();

    match err {
        Error::TaskFailed { error, .. } => assert!(error.contains("scripted failure")),
        other => panic!("expected TaskFailed, got {:?}", other),
    }
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_task_times_out() {
    let (fleet, connector) = MockFleet::start();
    fleet.script(
        "phone",
        DeviceScript {
            ignore_tasks: true,
            ..Default::default()
        },
    );
    let manager = connected_manager(&fleet, connector, fast_options(), &[("phone", &[])]).await;

    let err = manager
        .dispatch(
            "take a photo",
            Some("phone"),
            &SelectionCriteria::default(),
            Some(Duration::from_secs(3)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout { .. }));
    assert_eq!(manager.orchestrator().pending_count().await, 0);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_device_info_merged_after_connect() {
    let (fleet, connector) = MockFleet::start();
    fleet.script("laptop", DeviceScript::default().with_capabilities(&["gpu"]));
    let manager = DeviceManager::new(fast_options(), Arc::new(connector));
    manager
        .register_device(DeviceSpec::new("laptop", "mem://laptop").with_capabilities(&["office"]))
        .await;

    manager.connect_device("laptop").await.unwrap();

    let mut device = manager.registry().get_device("laptop").await.unwrap();
    for _ in 0..50 {
        if device.capabilities.contains("gpu") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        device = manager.registry().get_device("laptop").await.unwrap();
    }
    assert!(device.capabilities.contains("office"));
    assert!(device.capabilities.contains("gpu"));
    assert_eq!(device.metadata["platform"], "mock");
    assert_eq!(device.status, DeviceStatus::Connected);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_rejected_registration() {
    let (fleet, connector) = MockFleet::start();
    fleet.script(
        "phone",
        DeviceScript {
            registration: Registration::Reject("unknown orchestrator".to_string()),
            ..Default::default()
        },
    );
    let manager = DeviceManager::new(fast_options(), Arc::new(connector));
    manager
        .register_device(DeviceSpec::new("phone", "mem://phone"))
        .await;

    let err = manager.connect_device("phone").await.unwrap_err();

    match err {
        Error::Connection { device_id, reason } => {
            assert_eq!(device_id, "phone");
            assert!(reason.contains("unknown orchestrator"));
        }
        other => panic!("expected Connection, got {:?}", other),
    }
    let device = manager.registry().get_device("phone").await.unwrap();
    assert_eq!(device.status, DeviceStatus::Disconnected);
    assert!(!manager.connections().is_connected("phone").await);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_registration_times_out() {
    let (fleet, connector) = MockFleet::start();
    fleet.script(
        "phone",
        DeviceScript {
            registration: Registration::Silent,
            ..Default::default()
        },
    );
    let manager = DeviceManager::new(fast_options(), Arc::new(connector));
    manager
        .register_device(DeviceSpec::new("phone", "mem://phone"))
        .await;

    let err = manager.connect_device("phone").await.unwrap_err();

    assert!(err.to_string().contains("registration timed out"));
    assert_eq!(
        manager.registry().get_device("phone").await.unwrap().status,
        DeviceStatus::Disconnected
    );
    fleet.drop_link("phone");
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_selects_capable_device() {
    let (fleet, connector) = MockFleet::start();
    let manager = connected_manager(
        &fleet,
        connector,
        fast_options(),
        &[("phone", &["camera"]), ("laptop", &["office", "browser"])],
    )
    .await;

    let result = manager
        .dispatch(
            "draft a letter",
            None,
            &SelectionCriteria::with_capabilities(&["office"]),
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.device_id, "laptop");
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_without_devices_fails() {
    let (_fleet, connector) = MockFleet::start();
    let manager = DeviceManager::new(fast_options(), Arc::new(connector));

    let err = manager
        .dispatch("anything", None, &SelectionCriteria::default(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::DeviceNotFound(_)));
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_to_disconnected_device_fails() {
    let (fleet, connector) = MockFleet::start();
    let manager = connected_manager(&fleet, connector, fast_options(), &[("phone", &[])]).await;
    manager.disconnect_device("phone").await.unwrap();

    let err = manager
        .dispatch("anything", Some("phone"), &SelectionCriteria::default(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::DeviceNotConnected(_)));
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_completion_only_accepted_from_dispatch_device() {
    let (fleet, connector) = MockFleet::start();
    fleet.script(
        "phone",
        DeviceScript {
            ignore_tasks: true,
            ..Default::default()
        },
    );
    let manager = connected_manager(
        &fleet,
        connector,
        fast_options(),
        &[("phone", &[]), ("laptop", &[])],
    )
    .await;

    let dispatcher = Arc::clone(&manager);
    let pending = tokio::spawn(async move {
        dispatcher
            .dispatch("take a photo", Some("phone"), &SelectionCriteria::default(), None)
            .await
    });
    while fleet.received().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let session = fleet.received()[0].clone();

    fleet.send_as(
        "laptop",
        Envelope::task_completed("laptop", &session, Some(json!("forged"))),
    );
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(manager.orchestrator().is_pending(&session).await);
    assert!(!pending.is_finished());

    fleet.send_as(
        "phone",
        Envelope::task_completed("phone", &session, Some(json!("real"))),
    );
    let result = pending.await.unwrap().unwrap();

    assert_eq!(result.device_id, "phone");
    assert_eq!(result.result, Some(json!("real")));
    manager.shutdown().await;
}
