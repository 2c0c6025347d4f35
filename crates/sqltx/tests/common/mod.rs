//! Shared fixtures for the manager integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sqltx::{
    ManagerConfig, Pool, TransactionConfig, TransactionEvent, TransactionManager,
    TransactionObserver,
};
use sqltx_testing::MockDatabase;

/// Observer that keeps every event.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<TransactionEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<TransactionEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&TransactionEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

impl TransactionObserver for RecordingObserver {
    fn on_event(&self, event: &TransactionEvent) {
        self.events.lock().push(event.clone());
    }
}

pub struct Harness {
    pub db: MockDatabase,
    pub manager: TransactionManager,
    pub observer: Arc<RecordingObserver>,
}

impl Harness {
    pub fn in_use(&self) -> u32 {
        self.manager.pool().status().in_use
    }
}

/// Millisecond backoff and batch delay so retries do not slow the suite.
pub fn fast_config() -> ManagerConfig {
    ManagerConfig::new()
        .transaction(TransactionConfig::new().retry_delay(Duration::from_millis(1)))
        .batch_delay(Duration::from_millis(1))
}

/// Route `tracing` output through the test harness; `RUST_LOG` filters it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn harness_with(config: ManagerConfig, max_connections: u32) -> Harness {
    init_tracing();
    let db = MockDatabase::new();
    let pool = Pool::builder()
        .min_connections(0)
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(2))
        .build(db.factory())
        .await
        .unwrap();
    let observer = Arc::new(RecordingObserver::default());
    let manager = TransactionManager::with_observer(
        pool,
        config,
        Arc::clone(&observer) as Arc<dyn TransactionObserver>,
    )
    .unwrap();
    Harness {
        db,
        manager,
        observer,
    }
}

pub async fn harness() -> Harness {
    harness_with(fast_config(), 4).await
}
