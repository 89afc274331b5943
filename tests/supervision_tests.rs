//! Supervisor lifecycle tests: restart policy, fatal handling, health, and
//! worker identity, driven through the in-memory queue mocks.

mod common;

use common::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use broker_relay::error::BrokerError;
use broker_relay::registry::{HandlerRegistry, RegistrationOptions};
use broker_relay::supervision::Supervisor;
use broker_relay::BrokerConfig;

fn test_config(listeners: usize) -> Arc<BrokerConfig> {
    let mut config = BrokerConfig::new("change_events");
    config.listener_count = listeners;
    config.max_retries = 1;
    config.base_retry_delay_ms = 10;
    config.max_retry_delay_ms = 50;
    config.graceful_timeout_seconds = 2;
    Arc::new(config)
}

fn registry() -> Arc<HandlerRegistry> {
    let mut builder = HandlerRegistry::builder();
    builder.register(
        RegistrationOptions::new("users", "users-handler"),
        ScriptedHandler::succeeding(),
    );
    Arc::new(builder.build().unwrap())
}

#[tokio::test]
async fn start_stop_lifecycle() {
    let queue = InMemoryQueue::new();
    let supervisor = Supervisor::new(test_config(2), MockConnectionFactory::new(queue.clone()));

    supervisor.start("change_events", registry()).await.unwrap();
    assert!(supervisor.is_supervising());
    assert_eq!(supervisor.configured_worker_count(), 2);

    wait_for("workers running", Duration::from_secs(5), || {
        supervisor.active_worker_count() == 2
    })
    .await;
    assert!(supervisor.is_healthy());
    assert_eq!(supervisor.queue_name().as_deref(), Some("change_events"));

    supervisor.stop(true).await.unwrap();
    assert!(!supervisor.is_supervising());
    assert!(!supervisor.is_healthy());
    assert_eq!(supervisor.active_worker_count(), 0);
    assert!(supervisor.queue_name().is_none());
}

#[tokio::test]
async fn double_start_is_rejected() {
    let queue = InMemoryQueue::new();
    let supervisor = Supervisor::new(test_config(1), MockConnectionFactory::new(queue.clone()));

    supervisor.start("change_events", registry()).await.unwrap();
    let second = supervisor.start("change_events", registry()).await;
    assert!(matches!(second, Err(BrokerError::InvalidState(_))));
    assert!(supervisor.is_supervising());

    supervisor.stop(true).await.unwrap();
}

#[tokio::test]
async fn start_rejects_invalid_queue_name() {
    let queue = InMemoryQueue::new();
    let supervisor = Supervisor::new(test_config(1), MockConnectionFactory::new(queue.clone()));

    let result = supervisor.start("  ", registry()).await;
    assert!(matches!(result, Err(BrokerError::InvalidInput(_))));
    assert!(!supervisor.is_supervising());
}

#[tokio::test]
async fn recoverable_worker_death_triggers_restart_with_fresh_id() {
    let queue = InMemoryQueue::new();
    let supervisor = Supervisor::new(test_config(1), MockConnectionFactory::new(queue.clone()));

    // Two transient receive failures exhaust max_retries = 1 and stop the
    // worker with a recoverable outcome.
    queue.inject_receive_error(BrokerError::database(1205, "deadlock victim"));
    queue.inject_receive_error(BrokerError::database(1205, "deadlock victim"));

    supervisor.start("change_events", registry()).await.unwrap();

    wait_for("replacement worker", Duration::from_secs(5), || {
        let snapshots = supervisor.worker_snapshots();
        snapshots.len() == 1 && snapshots[0].worker_id == 2 && snapshots[0].running
    })
    .await;

    assert!(supervisor.is_healthy());
    assert_eq!(supervisor.active_worker_count(), 1);

    supervisor.stop(true).await.unwrap();
}

#[tokio::test]
async fn fatal_database_error_stops_worker_without_restart() {
    let queue = InMemoryQueue::new();
    let supervisor = Supervisor::new(test_config(1), MockConnectionFactory::new(queue.clone()));

    queue.inject_receive_error(BrokerError::database(9617, "Service Broker is disabled"));

    supervisor.start("change_events", registry()).await.unwrap();

    wait_for("worker death without restart", Duration::from_secs(5), || {
        supervisor.active_worker_count() == 0 && supervisor.total_worker_count() == 0
    })
    .await;

    // Still supervising, but unhealthy and understaffed.
    assert!(supervisor.is_supervising());
    assert!(!supervisor.is_healthy());
    assert!(!supervisor.telemetry().fully_operational);

    supervisor.stop(true).await.unwrap();
}

#[tokio::test]
async fn ignition_failure_is_fatal_for_the_worker() {
    let queue = InMemoryQueue::new();
    queue.fail_next_connects(1);
    let supervisor = Supervisor::new(test_config(1), MockConnectionFactory::new(queue.clone()));

    supervisor.start("change_events", registry()).await.unwrap();

    wait_for("ignition failure", Duration::from_secs(5), || {
        supervisor.active_worker_count() == 0 && supervisor.total_worker_count() == 0
    })
    .await;
    assert!(supervisor
        .error_log()
        .recent(10)
        .iter()
        .any(|record| record.detail.contains("Ignition failure")));

    supervisor.stop(true).await.unwrap();
}

#[tokio::test]
async fn process_fatal_outcome_stops_supervision_and_fires_hook() {
    let queue = InMemoryQueue::new();
    let supervisor = Supervisor::new(test_config(1), MockConnectionFactory::new(queue.clone()));

    let captured: Arc<Mutex<Option<i32>>> = Arc::new(Mutex::new(None));
    let sink = captured.clone();
    supervisor.set_fatal_hook(Arc::new(move |code| {
        *sink.lock().unwrap() = Some(code);
    }));

    queue.inject_receive_error(BrokerError::ResourceExhaustion(
        "allocation failure".to_string(),
    ));

    supervisor.start("change_events", registry()).await.unwrap();

    wait_for("fatal hook", Duration::from_secs(5), || {
        *captured.lock().unwrap() == Some(2)
    })
    .await;
    wait_for("supervision stopped", Duration::from_secs(5), || {
        !supervisor.is_supervising()
    })
    .await;
}

#[tokio::test]
async fn subsystem_fault_uses_exit_code_three() {
    let queue = InMemoryQueue::new();
    let supervisor = Supervisor::new(test_config(1), MockConnectionFactory::new(queue.clone()));

    let captured: Arc<Mutex<Option<i32>>> = Arc::new(Mutex::new(None));
    let sink = captured.clone();
    supervisor.set_fatal_hook(Arc::new(move |code| {
        *sink.lock().unwrap() = Some(code);
    }));

    queue.inject_receive_error(BrokerError::Subsystem("component load failure".to_string()));

    supervisor.start("change_events", registry()).await.unwrap();

    wait_for("fatal hook", Duration::from_secs(5), || {
        *captured.lock().unwrap() == Some(3)
    })
    .await;
}

#[tokio::test]
async fn stop_clears_the_retry_ledger() {
    let queue = InMemoryQueue::new();
    let supervisor = Supervisor::new(test_config(1), MockConnectionFactory::new(queue.clone()));

    supervisor.start("change_events", registry()).await.unwrap();
    supervisor
        .retry_ledger()
        .get_or_create("CONV-X")
        .record_failure("Handler");
    assert_eq!(supervisor.retry_ledger().len(), 1);

    supervisor.stop(true).await.unwrap();
    assert!(supervisor.retry_ledger().is_empty());
}

#[tokio::test]
async fn restart_reuses_preserved_state_and_advances_worker_ids() {
    let queue = InMemoryQueue::new();
    let supervisor = Supervisor::new(test_config(2), MockConnectionFactory::new(queue.clone()));

    supervisor.start("change_events", registry()).await.unwrap();
    wait_for("initial workers", Duration::from_secs(5), || {
        supervisor.active_worker_count() == 2
    })
    .await;
    let initial_max_id = supervisor
        .worker_snapshots()
        .iter()
        .map(|s| s.worker_id)
        .max()
        .unwrap();

    supervisor.restart().await.unwrap();

    assert!(supervisor.is_supervising());
    assert_eq!(supervisor.queue_name().as_deref(), Some("change_events"));
    wait_for("restarted workers", Duration::from_secs(5), || {
        supervisor.active_worker_count() == 2
    })
    .await;

    // Replacements never reuse ids within a process lifetime.
    let new_min_id = supervisor
        .worker_snapshots()
        .iter()
        .map(|s| s.worker_id)
        .min()
        .unwrap();
    assert!(new_min_id > initial_max_id);

    supervisor.stop(true).await.unwrap();
}

#[tokio::test]
async fn restart_fails_when_state_was_cleared() {
    let queue = InMemoryQueue::new();
    let supervisor = Supervisor::new(test_config(1), MockConnectionFactory::new(queue.clone()));

    supervisor.start("change_events", registry()).await.unwrap();
    supervisor.stop(true).await.unwrap();

    let result = supervisor.restart().await;
    assert!(matches!(result, Err(BrokerError::Supervision(_))));
}

#[tokio::test]
async fn restart_failed_is_a_no_op_on_a_healthy_pool() {
    let queue = InMemoryQueue::new();
    let supervisor = Supervisor::new(test_config(2), MockConnectionFactory::new(queue.clone()));

    supervisor.start("change_events", registry()).await.unwrap();
    wait_for("workers running", Duration::from_secs(5), || {
        supervisor.active_worker_count() == 2
    })
    .await;

    assert_eq!(supervisor.restart_failed().await.unwrap(), 0);

    supervisor.stop(true).await.unwrap();
    assert_eq!(supervisor.restart_failed().await.unwrap(), 0);
}

#[tokio::test]
async fn zero_graceful_timeout_interrupts_immediately() {
    let queue = InMemoryQueue::new();
    let mut config = BrokerConfig::new("change_events");
    config.listener_count = 2;
    config.graceful_timeout_seconds = 0;
    config.base_retry_delay_ms = 10;
    config.max_retry_delay_ms = 50;
    let supervisor = Supervisor::new(Arc::new(config), MockConnectionFactory::new(queue.clone()));

    supervisor.start("change_events", registry()).await.unwrap();
    wait_for("workers running", Duration::from_secs(5), || {
        supervisor.active_worker_count() == 2
    })
    .await;

    supervisor.stop(true).await.unwrap();
    assert!(!supervisor.is_supervising());
    assert_eq!(supervisor.active_worker_count(), 0);
}

#[tokio::test]
async fn telemetry_reflects_worker_counters() {
    let queue = InMemoryQueue::new();
    let supervisor = Supervisor::new(test_config(1), MockConnectionFactory::new(queue.clone()));

    queue.push(data_row(
        "CONV-T",
        &envelope("E1", "users", "INSERT", serde_json::json!({"id": 1})),
    ));

    supervisor.start("change_events", registry()).await.unwrap();
    wait_for("message processed", Duration::from_secs(5), || {
        supervisor.telemetry().total_messages_processed == 1
    })
    .await;

    let telemetry = supervisor.telemetry();
    assert!(telemetry.supervising);
    assert_eq!(telemetry.configured_workers, 1);
    assert_eq!(telemetry.active_workers, 1);
    assert_eq!(telemetry.total_errors_encountered, 0);
    assert!(telemetry.fully_operational);
    assert_eq!(telemetry.workers.len(), 1);
    assert!(telemetry.workers[0].recently_active);

    supervisor.stop(true).await.unwrap();
}
