//! Shared test fixtures: an in-memory queue with transactional semantics and
//! a scripted connection factory, standing in for the external database side.
//!
//! The mock mirrors the contract the relay depends on: a blocking receive
//! that parks until a message arrives or the connection is interrupted,
//! rollback that redelivers the in-flight message, and commit that finalizes
//! both the removal and any pending conversation acknowledgments.

// Each test binary compiles this module separately and uses a different
// subset of it.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use broker_relay::database::{
    ConnectionFactory, InterruptHandle, QueueConnection, ReceivedRow,
};
use broker_relay::error::{BrokerError, Result};
use broker_relay::messaging::ChangeEvent;
use broker_relay::registry::ChangeHandler;
use broker_relay::ChangeType;

/// Finalized conversation acknowledgment.
#[derive(Debug, Clone)]
pub struct AckRecord {
    pub conversation_handle: String,
    pub reason: String,
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<ReceivedRow>,
    acked: Vec<AckRecord>,
    receive_errors: VecDeque<BrokerError>,
}

/// Shared in-memory queue behind every mock connection.
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    broker_enabled: AtomicBool,
    queue_enabled: AtomicBool,
    connect_failures: AtomicU32,
    dequeues: AtomicU64,
}

impl InMemoryQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            broker_enabled: AtomicBool::new(true),
            queue_enabled: AtomicBool::new(true),
            connect_failures: AtomicU32::new(0),
            dequeues: AtomicU64::new(0),
        })
    }

    pub fn push(&self, row: ReceivedRow) {
        self.state.lock().unwrap().messages.push_back(row);
        self.notify.notify_waiters();
    }

    fn push_front(&self, row: ReceivedRow) {
        self.state.lock().unwrap().messages.push_front(row);
        self.notify.notify_waiters();
    }

    fn pop(&self) -> Option<ReceivedRow> {
        self.state.lock().unwrap().messages.pop_front()
    }

    fn take_receive_error(&self) -> Option<BrokerError> {
        self.state.lock().unwrap().receive_errors.pop_front()
    }

    /// Queue an error for the next receive call on any connection.
    pub fn inject_receive_error(&self, error: BrokerError) {
        self.state.lock().unwrap().receive_errors.push_back(error);
        self.notify.notify_waiters();
    }

    pub fn acked(&self) -> Vec<AckRecord> {
        self.state.lock().unwrap().acked.clone()
    }

    pub fn acked_count(&self) -> usize {
        self.state.lock().unwrap().acked.len()
    }

    /// Messages currently visible for receive.
    pub fn visible_count(&self) -> usize {
        self.state.lock().unwrap().messages.len()
    }

    pub fn dequeue_count(&self) -> u64 {
        self.dequeues.load(Ordering::Acquire)
    }

    pub fn set_broker_enabled(&self, enabled: bool) {
        self.broker_enabled.store(enabled, Ordering::Release);
    }

    pub fn set_queue_enabled(&self, enabled: bool) {
        self.queue_enabled.store(enabled, Ordering::Release);
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.connect_failures.store(count, Ordering::Release);
    }
}

/// Interrupt flag shared between a connection and the supervisor.
struct CancelFlag {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    async fn wait(&self) {
        while !self.is_cancelled() {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl InterruptHandle for CancelFlag {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// One mock connection with transactional receive/ack semantics.
pub struct MockConnection {
    queue: Arc<InMemoryQueue>,
    cancel: Arc<CancelFlag>,
    in_flight: Option<ReceivedRow>,
    pending_acks: Vec<AckRecord>,
    closed: bool,
}

impl MockConnection {
    fn new(queue: Arc<InMemoryQueue>) -> Self {
        Self {
            queue,
            cancel: CancelFlag::new(),
            in_flight: None,
            pending_acks: Vec::new(),
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(BrokerError::Connection("connection closed".to_string()))
        } else {
            Ok(())
        }
    }

    fn return_in_flight(&mut self) {
        if let Some(row) = self.in_flight.take() {
            self.queue.push_front(row);
        }
    }
}

#[async_trait]
impl QueueConnection for MockConnection {
    async fn receive(&mut self, _statement: &str) -> Result<Option<ReceivedRow>> {
        self.ensure_open()?;
        loop {
            if let Some(error) = self.queue.take_receive_error() {
                return Err(error);
            }
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            let notified = self.queue.notify.notified();
            if let Some(row) = self.queue.pop() {
                self.queue.dequeues.fetch_add(1, Ordering::AcqRel);
                self.in_flight = Some(row.clone());
                return Ok(Some(row));
            }
            tokio::select! {
                _ = notified => {}
                _ = self.cancel.wait() => return Ok(None),
            }
        }
    }

    async fn end_conversation(&mut self, conversation_handle: &str, reason: &str) -> Result<()> {
        self.ensure_open()?;
        self.pending_acks.push(AckRecord {
            conversation_handle: conversation_handle.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.in_flight = None;
        let mut state = self.queue.state.lock().unwrap();
        state.acked.append(&mut self.pending_acks);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.pending_acks.clear();
        self.return_in_flight();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.pending_acks.clear();
        self.return_in_flight();
        self.closed = true;
        Ok(())
    }

    fn interrupt_handle(&self) -> Arc<dyn InterruptHandle> {
        self.cancel.clone()
    }
}

/// Factory producing connections onto one shared in-memory queue.
pub struct MockConnectionFactory {
    queue: Arc<InMemoryQueue>,
}

impl MockConnectionFactory {
    pub fn new(queue: Arc<InMemoryQueue>) -> Arc<Self> {
        Arc::new(Self { queue })
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn QueueConnection>> {
        let remaining = self.queue.connect_failures.load(Ordering::Acquire);
        if remaining > 0 {
            self.queue
                .connect_failures
                .store(remaining - 1, Ordering::Release);
            return Err(BrokerError::Connection(
                "scripted connection failure".to_string(),
            ));
        }
        Ok(Box::new(MockConnection::new(self.queue.clone())))
    }

    async fn is_broker_enabled(&self) -> Result<bool> {
        Ok(self.queue.broker_enabled.load(Ordering::Acquire))
    }

    async fn is_queue_enabled(&self, _queue_name: &str) -> Result<bool> {
        Ok(self.queue.queue_enabled.load(Ordering::Acquire))
    }
}

/// Build a data-message row carrying the given body.
pub fn data_row(conversation_handle: &str, body: &str) -> ReceivedRow {
    ReceivedRow {
        conversation_handle: conversation_handle.to_string(),
        message_type_name: "ChangeCaptureMessage".to_string(),
        message_body: body.to_string(),
        message_enqueue_time: Utc::now(),
        message_sequence_number: Some(1),
        priority: Some(5),
        conversation_group_id: format!("group-{conversation_handle}"),
        service_name: "ChangeCaptureService".to_string(),
        contract_name: "ChangeCaptureContract".to_string(),
    }
}

/// Build a system-message row for the given type URI.
pub fn system_row(conversation_handle: &str, message_type_name: &str) -> ReceivedRow {
    ReceivedRow {
        message_type_name: message_type_name.to_string(),
        message_body: String::new(),
        ..data_row(conversation_handle, "")
    }
}

/// Standard change envelope body.
pub fn envelope(event_id: &str, table: &str, operation: &str, record: Value) -> String {
    json!({
        "eventId": event_id,
        "tableName": table,
        "operation": operation,
        "record": record,
    })
    .to_string()
}

/// Event capture for assertions.
#[derive(Debug, Clone)]
pub struct SeenEvent {
    pub change_type: ChangeType,
    pub table: String,
    pub raw: serde_json::Map<String, Value>,
    pub had_typed: bool,
}

/// Handler that fails a scripted number of times before succeeding, recording
/// everything it sees.
#[derive(Default)]
pub struct ScriptedHandler {
    fail_remaining: AtomicU32,
    invocations: AtomicU32,
    events: Mutex<Vec<SeenEvent>>,
}

impl ScriptedHandler {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the first `failures` invocations with a retryable handler error.
    pub fn failing_times(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            fail_remaining: AtomicU32::new(failures),
            ..Default::default()
        })
    }

    /// Fail every invocation.
    pub fn always_failing() -> Arc<Self> {
        Self::failing_times(u32::MAX)
    }

    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::Acquire)
    }

    pub fn successes(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn events(&self) -> Vec<SeenEvent> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: ChangeEvent) -> Result<()> {
        self.invocations.fetch_add(1, Ordering::AcqRel);

        let remaining = self.fail_remaining.load(Ordering::Acquire);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.fail_remaining.store(remaining - 1, Ordering::Release);
            }
            return Err(BrokerError::Handler("scripted handler failure".to_string()));
        }

        self.events.lock().unwrap().push(SeenEvent {
            change_type: event.change_type,
            table: event.table_name.clone(),
            raw: event.raw_record.clone(),
            had_typed: event.has_typed_record(),
        });
        Ok(())
    }
}

#[async_trait]
impl ChangeHandler for ScriptedHandler {
    async fn on_insert(&self, event: ChangeEvent) -> Result<()> {
        self.record(event)
    }

    async fn on_update(&self, event: ChangeEvent) -> Result<()> {
        self.record(event)
    }

    async fn on_delete(&self, event: ChangeEvent) -> Result<()> {
        self.record(event)
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for<F>(what: &str, timeout: Duration, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
