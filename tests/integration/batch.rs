//! Batch and constellation execution across the mock fleet.

use std::time::Duration;

use constellation::core::{
    Constellation, ConstellationState, Dependency, DependencyType, Task, TaskStatus,
};
use constellation::orchestration::{BatchEntry, BatchTask};

use crate::fixtures::{connected_manager, diamond, fast_options, DeviceScript, MockFleet};

fn position(received: &[String], task_id: &str) -> usize {
    received
        .iter()
        .position(|t| t == task_id)
        .unwrap_or_else(|| panic!("{} was never dispatched", task_id))
}

// Parallel batch tests

#[tokio::test(start_paused = true)]
async fn test_parallel_batch_respects_concurrency_cap() {
    let (fleet, connector) = MockFleet::start();
    let manager = connected_manager(
        &fleet,
        connector,
        fast_options(),
        &[("phone", &[]), ("laptop", &[])],
    )
    .await;

    let tasks: Vec<BatchTask> = (1..=5)
        .map(|i| {
            let device = if i % 2 == 0 { "phone" } else { "laptop" };
            BatchTask::new(&format!("job{}", i), "work").on_device(device)
        })
        .collect();
    let results = manager
        .parallel()
        .execute_tasks_parallel(tasks)
        .await
        .unwrap();

    assert_eq!(results.len(), 5);
    assert!(results.values().all(BatchEntry::is_success));
    assert!(fleet.max_in_flight() <= 2);
    assert_eq!(fleet.received().len(), 5);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failure_does_not_abort_siblings() {
    let (fleet, connector) = MockFleet::start();
    fleet.script(
        "broken",
        DeviceScript {
            fail_tasks: true,
            ..Default::default()
        },
    );
    let manager = connected_manager(
        &fleet,
        connector,
        fast_options(),
        &[("broken", &[]), ("phone", &[])],
    )
    .await;

    let results = manager
        .parallel()
        .execute_tasks_parallel(vec![
            BatchTask::new("bad", "work").on_device("broken"),
            BatchTask::new("good1", "work").on_device("phone"),
            BatchTask::new("good2", "work").on_device("phone"),
        ])
        .await
        .unwrap();

    match &results["bad"] {
        BatchEntry::Failed { device_id, error } => {
            assert_eq!(device_id.as_deref(), Some("broken"));
            assert!(error.contains("scripted failure"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(results["good1"].is_success());
    assert!(results["good2"].is_success());

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_batch_selects_by_capability() {
    let (fleet, connector) = MockFleet::start();
    let manager = connected_manager(
        &fleet,
        connector,
        fast_options(),
        &[("phone", &["camera"]), ("laptop", &["office"])],
    )
    .await;

    let results = manager
        .parallel()
        .execute_tasks_parallel(vec![
            BatchTask::new("photo", "take a photo").with_capabilities(&["camera"]),
            BatchTask::new("letter", "write a letter").with_capabilities(&["office"]),
        ])
        .await
        .unwrap();

    let device_of = |id: &str| match &results[id] {
        BatchEntry::Completed { device_id, .. } => device_id.clone(),
        other => panic!("{} did not complete: {:?}", id, other),
    };
    assert_eq!(device_of("photo"), "phone");
    assert_eq!(device_of("letter"), "laptop");

    manager.shutdown().await;
}

// Dependency-ordered batch tests

#[tokio::test(start_paused = true)]
async fn test_diamond_runs_in_dependency_order() {
    let (fleet, connector) = MockFleet::start();
    let manager = connected_manager(&fleet, connector, fast_options(), &[("phone", &[])]).await;

    let results = manager
        .parallel()
        .execute_tasks_with_dependencies(vec![
            BatchTask::new("d", "join").on_device("phone").depends_on(&["b", "c"]),
            BatchTask::new("c", "right").on_device("phone").depends_on(&["a"]),
            BatchTask::new("b", "left").on_device("phone").depends_on(&["a"]),
            BatchTask::new("a", "start").on_device("phone"),
        ])
        .await
        .unwrap();

    assert!(results.values().all(BatchEntry::is_success));
    let received = fleet.received();
    assert_eq!(received.len(), 4);
    assert_eq!(position(&received, "a"), 0);
    assert_eq!(position(&received, "d"), 3);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_missing_dependency_fails_without_dispatch() {
    let (fleet, connector) = MockFleet::start();
    let manager = connected_manager(&fleet, connector, fast_options(), &[("phone", &[])]).await;

    let results = manager
        .parallel()
        .execute_tasks_with_dependencies(vec![
            BatchTask::new("orphan", "work").on_device("phone").depends_on(&["ghost"]),
            BatchTask::new("free", "work").on_device("phone"),
        ])
        .await
        .unwrap();

    match &results["orphan"] {
        BatchEntry::Failed { error, .. } => assert!(error.contains("ghost")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(results["free"].is_success());
    assert_eq!(fleet.received(), vec!["free".to_string()]);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_dependency_skips_dependent() {
    let (fleet, connector) = MockFleet::start();
    fleet.script(
        "broken",
        DeviceScript {
            fail_tasks: true,
            ..Default::default()
        },
    );
    let manager = connected_manager(
        &fleet,
        connector,
        fast_options(),
        &[("broken", &[]), ("phone", &[])],
    )
    .await;

    let results = manager
        .parallel()
        .execute_tasks_with_dependencies(vec![
            BatchTask::new("first", "work").on_device("broken"),
            BatchTask::new("second", "work").on_device("phone").depends_on(&["first"]),
        ])
        .await
        .unwrap();

    assert!(!results["first"].is_success());
    match &results["second"] {
        BatchEntry::Failed { device_id, error } => {
            assert!(device_id.is_none());
            assert!(error.contains("first"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(fleet.received(), vec!["first".to_string()]);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cycle_fails_members_only() {
    let (fleet, connector) = MockFleet::start();
    let manager = connected_manager(&fleet, connector, fast_options(), &[("phone", &[])]).await;

    let results = manager
        .parallel()
        .execute_tasks_with_dependencies(vec![
            BatchTask::new("x", "work").on_device("phone").depends_on(&["y"]),
            BatchTask::new("y", "work").on_device("phone").depends_on(&["x"]),
            BatchTask::new("z", "work").on_device("phone"),
        ])
        .await
        .unwrap();

    assert!(!results["x"].is_success());
    assert!(!results["y"].is_success());
    assert!(results["z"].is_success());
    assert_eq!(fleet.received(), vec!["z".to_string()]);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_dependency_timeout_fails_waiting_task() {
    let (fleet, connector) = MockFleet::start();
    fleet.script(
        "stuck",
        DeviceScript {
            ignore_tasks: true,
            ..Default::default()
        },
    );
    let manager = connected_manager(&fleet, connector, fast_options(), &[("stuck", &[])]).await;

    let results = manager
        .parallel()
        .with_dependency_timeout(Duration::from_secs(5))
        .execute_tasks_with_dependencies(vec![
            BatchTask::new("first", "work")
                .on_device("stuck")
                .with_timeout(Duration::from_secs(60)),
            BatchTask::new("second", "work").on_device("stuck").depends_on(&["first"]),
        ])
        .await
        .unwrap();

    match &results["second"] {
        BatchEntry::Failed { device_id, error } => {
            assert!(device_id.is_none());
            assert!(error.contains("waiting for dependencies"), "error: {}", error);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    match &results["first"] {
        BatchEntry::Failed { device_id, .. } => assert_eq!(device_id.as_deref(), Some("stuck")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(fleet.received(), vec!["first".to_string()]);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_finish_only_dependency_runs_after_failure() {
    let (fleet, connector) = MockFleet::start();
    fleet.script(
        "broken",
        DeviceScript {
            fail_tasks: true,
            ..Default::default()
        },
    );
    let manager = connected_manager(
        &fleet,
        connector,
        fast_options(),
        &[("broken", &[]), ("phone", &[])],
    )
    .await;

    let mut second = BatchTask::new("second", "clean up").on_device("phone");
    second.after = vec!["first".to_string()];
    let results = manager
        .parallel()
        .execute_tasks_with_dependencies(vec![second, BatchTask::new("first", "work").on_device("broken")])
        .await
        .unwrap();

    assert!(!results["first"].is_success());
    assert!(results["second"].is_success());
    assert_eq!(fleet.received(), vec!["first".to_string(), "second".to_string()]);

    manager.shutdown().await;
}

// Constellation execution tests

#[tokio::test(start_paused = true)]
async fn test_execute_constellation_marks_tasks() {
    let (fleet, connector) = MockFleet::start();
    let manager = connected_manager(&fleet, connector, fast_options(), &[("phone", &[])]).await;
    let mut constellation = diamond();

    let results = manager
        .parallel()
        .execute_constellation(&mut constellation)
        .await
        .unwrap();

    assert_eq!(results.len(), 4);
    for task in constellation.tasks() {
        assert_eq!(task.status, TaskStatus::Completed, "task {}", task.id);
        assert!(task.result.is_some());
    }
    assert_eq!(constellation.state, ConstellationState::Completed);
    let received = fleet.received();
    assert_eq!(position(&received, "a"), 0);
    assert_eq!(position(&received, "d"), 3);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_execute_constellation_propagates_failure() {
    let (fleet, connector) = MockFleet::start();
    fleet.script(
        "broken",
        DeviceScript {
            fail_tasks: true,
            ..Default::default()
        },
    );
    let manager = connected_manager(&fleet, connector, fast_options(), &[("broken", &[])]).await;
    let mut constellation = diamond();

    let results = manager
        .parallel()
        .execute_constellation(&mut constellation)
        .await
        .unwrap();

    assert!(results.values().all(|e| !e.is_success()));
    for task in constellation.tasks() {
        assert_eq!(task.status, TaskStatus::Failed, "task {}", task.id);
    }
    assert_eq!(constellation.state, ConstellationState::Failed);
    assert_eq!(fleet.received(), vec!["a".to_string()]);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_execute_constellation_completion_edge_survives_failure() {
    let (fleet, connector) = MockFleet::start();
    fleet.script(
        "broken",
        DeviceScript {
            fail_tasks: true,
            ..Default::default()
        },
    );
    let manager = connected_manager(
        &fleet,
        connector,
        fast_options(),
        &[("broken", &[]), ("phone", &[])],
    )
    .await;

    let mut constellation = Constellation::new("cleanup");
    constellation
        .add_task(Task::new("build", "build", "compile").with_target_device("broken"))
        .unwrap();
    constellation
        .add_task(Task::new("cleanup", "cleanup", "remove temp files").with_target_device("phone"))
        .unwrap();
    constellation
        .add_dependency(
            Dependency::new(&Dependency::edge_id("build", "cleanup"), "build", "cleanup")
                .with_type(DependencyType::CompletionOnly),
        )
        .unwrap();

    manager
        .parallel()
        .execute_constellation(&mut constellation)
        .await
        .unwrap();

    assert_eq!(constellation.get_task("build").unwrap().status, TaskStatus::Failed);
    assert_eq!(constellation.get_task("cleanup").unwrap().status, TaskStatus::Completed);
    assert_eq!(fleet.received(), vec!["build".to_string(), "cleanup".to_string()]);

    manager.shutdown().await;
}
