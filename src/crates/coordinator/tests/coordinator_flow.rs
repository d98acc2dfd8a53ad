//! End-to-end coordinator tests against fake workers

mod support;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use coordinator::{
    spawn_dispatch_loop, spawn_reaper, Coordinator, CoordinatorConfig,
};
use protocol::{BuildRecord, BuildRequest, BuildState, RegisterPayload, Shutdown};
use support::{spawn_fake_worker, Behavior};

fn request(id: &str) -> BuildRequest {
    BuildRequest {
        request_id: id.to_string(),
        project_path: "/projects/app".to_string(),
        task_name: "assemble".to_string(),
        build_options: BTreeMap::new(),
        cache_enabled: false,
        requirements: vec![],
        submitted_at: chrono::Utc::now(),
    }
}

fn register(coordinator: &Coordinator, worker_id: &str, address: &str, max_concurrent: u32) {
    coordinator
        .register_worker(RegisterPayload {
            worker_id: worker_id.to_string(),
            address: address.to_string(),
            capabilities: vec!["gradle".to_string()],
            max_concurrent,
        })
        .unwrap();
}

/// Keep a worker's heartbeat fresh for the duration of a test.
fn keep_alive(coordinator: Arc<Coordinator>, worker_id: String, shutdown: Shutdown) {
    tokio::spawn(async move {
        while !shutdown.is_triggered() {
            let _ = coordinator.heartbeat(&worker_id, 0);
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
    });
}

async fn wait_for(
    coordinator: &Coordinator,
    request_id: &str,
    deadline: Duration,
    predicate: impl Fn(&BuildRecord) -> bool,
) -> BuildRecord {
    let started = tokio::time::Instant::now();
    loop {
        if let Ok(record) = coordinator.get_build(request_id) {
            if predicate(&record) {
                return record;
            }
            if started.elapsed() > deadline {
                panic!(
                    "timed out waiting for {request_id}: state={:?} attempts={}",
                    record.state, record.attempts
                );
            }
        } else if started.elapsed() > deadline {
            panic!("timed out waiting for {request_id}: record missing");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn build_completes_on_a_live_worker() {
    let coordinator = Coordinator::new(CoordinatorConfig::default());
    let shutdown = Shutdown::new();
    spawn_dispatch_loop(Arc::clone(&coordinator), shutdown.clone());

    let fake = spawn_fake_worker("w1", Behavior::Succeed { delay: Duration::from_millis(50) }).await;
    register(&coordinator, &fake.worker_id, &fake.addr, 2);
    keep_alive(Arc::clone(&coordinator), fake.worker_id.clone(), shutdown.clone());

    coordinator.submit_build(request("bld-1")).unwrap();
    let record = wait_for(&coordinator, "bld-1", Duration::from_secs(5), |r| {
        r.state.is_terminal()
    })
    .await;

    assert_eq!(record.state, BuildState::Succeeded);
    assert_eq!(record.attempts, 1);
    assert_eq!(record.assigned_worker.as_deref(), Some("w1"));
    let summary = record.result.unwrap();
    assert_eq!(summary.exit_code, Some(0));
    assert_eq!(summary.artifacts, vec!["/out/app.jar".to_string()]);

    // The slot was released once the result landed
    let worker = &coordinator.list_workers()[0];
    assert_eq!(worker.in_flight, 0);
    shutdown.trigger();
}

#[tokio::test]
async fn unreachable_worker_triggers_retry_on_another() {
    let config = CoordinatorConfig {
        heartbeat_period_seconds: 1,
        max_attempts: 3,
        ..Default::default()
    };
    let coordinator = Coordinator::new(config);
    let shutdown = Shutdown::new();
    spawn_dispatch_loop(Arc::clone(&coordinator), shutdown.clone());
    spawn_reaper(Arc::clone(&coordinator), shutdown.clone());

    // w1 accepts the build and then goes silent (no heartbeats, no reply)
    let hung = spawn_fake_worker("w1", Behavior::Hang).await;
    register(&coordinator, &hung.worker_id, &hung.addr, 1);

    // w2 is healthy; registered second so the tie-break sends the first
    // dispatch to w1
    let live = spawn_fake_worker("w2", Behavior::Succeed { delay: Duration::from_millis(20) }).await;
    register(&coordinator, &live.worker_id, &live.addr, 1);
    keep_alive(Arc::clone(&coordinator), live.worker_id.clone(), shutdown.clone());

    coordinator.submit_build(request("bld-1")).unwrap();

    // First attempt lands on the hung worker
    wait_for(&coordinator, "bld-1", Duration::from_secs(5), |r| {
        r.assigned_worker.as_deref() == Some("w1")
    })
    .await;
    assert_eq!(hung.executions.load(std::sync::atomic::Ordering::SeqCst), 1);

    // After three missed heartbeats the reaper fails the attempt over; the
    // build must finish on w2 with the attempt counter at 2
    let record = wait_for(&coordinator, "bld-1", Duration::from_secs(15), |r| {
        r.state.is_terminal()
    })
    .await;
    assert_eq!(record.state, BuildState::Succeeded);
    assert_eq!(record.attempts, 2);
    assert_eq!(record.assigned_worker.as_deref(), Some("w2"));
    shutdown.trigger();
}

#[tokio::test]
async fn user_failure_is_not_retried() {
    let coordinator = Coordinator::new(CoordinatorConfig::default());
    let shutdown = Shutdown::new();
    spawn_dispatch_loop(Arc::clone(&coordinator), shutdown.clone());

    let fake = spawn_fake_worker(
        "w1",
        Behavior::FailUser {
            exit_code: 1,
            message: "compile error".to_string(),
        },
    )
    .await;
    register(&coordinator, &fake.worker_id, &fake.addr, 2);
    keep_alive(Arc::clone(&coordinator), fake.worker_id.clone(), shutdown.clone());

    coordinator.submit_build(request("bld-1")).unwrap();
    let record = wait_for(&coordinator, "bld-1", Duration::from_secs(5), |r| {
        r.state.is_terminal()
    })
    .await;

    assert_eq!(record.state, BuildState::Failed);
    assert_eq!(record.attempts, 1);
    let summary = record.result.unwrap();
    assert_eq!(summary.exit_code, Some(1));
    assert_eq!(summary.error_message.as_deref(), Some("compile error"));

    // No re-dispatch happened
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fake.executions.load(std::sync::atomic::Ordering::SeqCst), 1);
    shutdown.trigger();
}

#[tokio::test]
async fn worker_load_never_exceeds_max_concurrent() {
    let coordinator = Coordinator::new(CoordinatorConfig::default());
    let shutdown = Shutdown::new();
    spawn_dispatch_loop(Arc::clone(&coordinator), shutdown.clone());

    let fake = spawn_fake_worker("w1", Behavior::Succeed { delay: Duration::from_millis(200) }).await;
    register(&coordinator, &fake.worker_id, &fake.addr, 2);
    keep_alive(Arc::clone(&coordinator), fake.worker_id.clone(), shutdown.clone());

    for i in 0..6 {
        coordinator.submit_build(request(&format!("bld-{i}"))).unwrap();
    }
    for i in 0..6 {
        let record = wait_for(
            &coordinator,
            &format!("bld-{i}"),
            Duration::from_secs(10),
            |r| r.state.is_terminal(),
        )
        .await;
        assert_eq!(record.state, BuildState::Succeeded);
    }

    assert_eq!(fake.executions.load(std::sync::atomic::Ordering::SeqCst), 6);
    assert!(
        fake.max_concurrent_seen.load(std::sync::atomic::Ordering::SeqCst) <= 2,
        "worker saw more concurrent builds than its declared limit"
    );
    shutdown.trigger();
}

#[tokio::test]
async fn rpc_failures_exhaust_attempts_and_fail() {
    let config = CoordinatorConfig {
        max_attempts: 3,
        ..Default::default()
    };
    let coordinator = Coordinator::new(config);
    let shutdown = Shutdown::new();
    spawn_dispatch_loop(Arc::clone(&coordinator), shutdown.clone());

    // Reserve a port, then close the listener: connects will be refused
    let dead_addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };
    register(&coordinator, "w-dead", &dead_addr, 2);
    keep_alive(Arc::clone(&coordinator), "w-dead".to_string(), shutdown.clone());

    coordinator.submit_build(request("bld-1")).unwrap();
    let record = wait_for(&coordinator, "bld-1", Duration::from_secs(10), |r| {
        r.state.is_terminal()
    })
    .await;

    assert_eq!(record.state, BuildState::Failed);
    assert_eq!(record.attempts, 3);
    let message = record.result.unwrap().error_message.unwrap();
    assert!(message.contains("after 3 attempts"), "message: {message}");
    shutdown.trigger();
}

#[tokio::test]
async fn cancel_running_build_is_best_effort() {
    let coordinator = Coordinator::new(CoordinatorConfig::default());
    let shutdown = Shutdown::new();
    spawn_dispatch_loop(Arc::clone(&coordinator), shutdown.clone());

    let fake = spawn_fake_worker("w1", Behavior::Hang).await;
    register(&coordinator, &fake.worker_id, &fake.addr, 1);
    keep_alive(Arc::clone(&coordinator), fake.worker_id.clone(), shutdown.clone());

    coordinator.submit_build(request("bld-1")).unwrap();
    wait_for(&coordinator, "bld-1", Duration::from_secs(5), |r| {
        r.state == BuildState::Running
    })
    .await;

    coordinator.cancel_build("bld-1").unwrap();
    let record = coordinator.get_build("bld-1").unwrap();
    assert_eq!(record.state, BuildState::Cancelled);

    // The hung worker's eventual silence cannot resurrect the record
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(coordinator.get_build("bld-1").unwrap().state, BuildState::Cancelled);
    shutdown.trigger();
}
