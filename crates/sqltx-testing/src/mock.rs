//! In-memory database double.
//!
//! [`MockDatabase`] is shared state; every [`MockConnection`] opened through
//! its factory talks to it. Statements run inside a transaction are staged
//! per connection and only land in the committed log on `commit`, which is
//! what atomicity tests assert against.
//!
//! Two statement shapes are interpreted against in-memory tables so that
//! versioned-row workflows can be exercised end to end:
//!
//! ```text
//! SELECT * FROM <table> WHERE id = $1
//! UPDATE <table> SET <col> = $n, ... WHERE id = $n AND <col> = $n
//! ```
//!
//! Any other statement succeeds with one affected row unless a scripted
//! response or fault says otherwise.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use sqltx_types::{
    Connection, ConnectionFactory, DbError, DynConnectionFactory, IsolationLevel, QueryResult,
    Row, SqlValue,
};

use crate::fault::{Fault, FaultPoint, Latency};

#[allow(clippy::expect_used)]
static SELECT_BY_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*SELECT\s+\*\s+FROM\s+(\w+)\s+WHERE\s+id\s*=\s*\$1\s*$")
        .expect("valid select pattern")
});

#[allow(clippy::expect_used)]
static UPDATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*UPDATE\s+(\w+)\s+SET\s+(.+?)\s+WHERE\s+id\s*=\s*\$(\d+)\s+AND\s+(\w+)\s*=\s*\$(\d+)\s*$",
    )
    .expect("valid update pattern")
});

#[allow(clippy::expect_used)]
static ASSIGN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\w+)\s*=\s*\$(\d+)").expect("valid assignment pattern"));

/// Owner id used for locks held by [`MockDatabase::hold_lock`].
pub const FOREIGN_SESSION: u64 = 0;

/// A statement with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// Connection that ran it.
    pub connection_id: u64,
    /// SQL text.
    pub sql: String,
    /// Bound parameters.
    pub params: Vec<SqlValue>,
}

/// Everything a connection did, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalEvent {
    /// Connection opened.
    Connect,
    /// Transaction started.
    Begin(IsolationLevel),
    /// Statement executed (successfully or not).
    Query(String),
    /// Transaction committed.
    Commit,
    /// Transaction rolled back.
    Rollback,
    /// Advisory lock acquired.
    Lock(String),
    /// Advisory lock released.
    Unlock(String),
    /// Health probe.
    Ping,
    /// Connection dropped.
    Close,
}

/// One journal line.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    /// Connection the event happened on.
    pub connection_id: u64,
    /// What happened.
    pub event: JournalEvent,
}

#[derive(Default)]
struct MockState {
    faults: Vec<Fault>,
    latencies: Vec<Latency>,
    responses: Vec<(String, QueryResult)>,
    tables: HashMap<String, Vec<Row>>,
    locks: HashMap<String, u64>,
    journal: Vec<JournalEntry>,
    committed: Vec<Statement>,
    next_connection_id: u64,
    connections_opened: u64,
    open_connections: u32,
    peak_open_connections: u32,
}

impl MockState {
    fn check(&mut self, point: FaultPoint, sql: Option<&str>) -> Result<(), DbError> {
        match self.faults.iter_mut().find(|f| f.matches(point, sql)) {
            Some(fault) => Err(fault.fire()),
            None => Ok(()),
        }
    }

    fn latency(&self, point: FaultPoint, sql: Option<&str>) -> Option<Duration> {
        self.latencies
            .iter()
            .find(|l| l.applies(point, sql))
            .map(|l| l.delay)
    }

    fn record(&mut self, connection_id: u64, event: JournalEvent) {
        self.journal.push(JournalEntry {
            connection_id,
            event,
        });
    }

    fn select_by_id(&self, table: &str, id: Option<&SqlValue>) -> Vec<Row> {
        let Some(id) = id else {
            return Vec::new();
        };
        self.tables
            .get(&table.to_ascii_lowercase())
            .map(|rows| {
                rows.iter()
                    .filter(|row| row.get_by_name("id") == Some(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Apply (or, with `dry_run`, just count) a conditional UPDATE.
    fn apply_update(&mut self, sql: &str, params: &[SqlValue], dry_run: bool) -> Option<u64> {
        let caps = UPDATE_RE.captures(sql)?;
        let table = caps[1].to_ascii_lowercase();
        let param = |index: &str| -> Option<SqlValue> {
            let n: usize = index.parse().ok()?;
            params.get(n.checked_sub(1)?).cloned()
        };

        let id = param(&caps[3])?;
        let guard_column = caps[4].to_string();
        let guard_value = param(&caps[5])?;

        let assignments: Vec<(String, SqlValue)> = ASSIGN_RE
            .captures_iter(&caps[2])
            .filter_map(|a| Some((a[1].to_string(), param(&a[2])?)))
            .collect();

        let rows = self.tables.entry(table).or_default();
        let mut affected = 0;
        for row in rows.iter_mut().filter(|row| {
            row.get_by_name("id") == Some(&id)
                && row.get_by_name(&guard_column) == Some(&guard_value)
        }) {
            affected += 1;
            if !dry_run {
                for (column, value) in &assignments {
                    row.set(column.clone(), value.clone());
                }
            }
        }
        Some(affected)
    }

    fn commit_statement(&mut self, statement: Statement) {
        let _ = self.apply_update(&statement.sql, &statement.params, false);
        self.committed.push(statement);
    }
}

/// Shared in-memory database.
#[derive(Clone, Default)]
pub struct MockDatabase {
    state: Arc<Mutex<MockState>>,
}

impl MockDatabase {
    /// Create an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection factory opening connections to this database.
    #[must_use]
    pub fn factory(&self) -> DynConnectionFactory {
        Arc::new(MockFactory { db: self.clone() })
    }

    /// Open a connection directly, bypassing any pool.
    pub fn connect(&self) -> Result<MockConnection, DbError> {
        let mut state = self.state.lock();
        state.check(FaultPoint::Connect, None)?;
        state.next_connection_id += 1;
        let id = state.next_connection_id;
        state.connections_opened += 1;
        state.open_connections += 1;
        state.peak_open_connections = state.peak_open_connections.max(state.open_connections);
        state.record(id, JournalEvent::Connect);
        Ok(MockConnection {
            id,
            db: self.clone(),
            staged: None,
        })
    }

    /// Inject a fault.
    pub fn inject(&self, fault: Fault) {
        self.state.lock().faults.push(fault);
    }

    /// Remove all faults.
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Slow down matching driver calls.
    pub fn add_latency(&self, latency: Latency) {
        self.state.lock().latencies.push(latency);
    }

    /// Answer queries containing `needle` with a canned result.
    pub fn respond(&self, needle: impl Into<String>, result: QueryResult) {
        self.state.lock().responses.push((needle.into(), result));
    }

    /// Seed a row into a table.
    pub fn insert_row(&self, table: &str, row: Row) {
        self.state
            .lock()
            .tables
            .entry(table.to_ascii_lowercase())
            .or_default()
            .push(row);
    }

    /// Current committed rows of a table.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .tables
            .get(&table.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    /// Current committed row by id.
    #[must_use]
    pub fn row(&self, table: &str, id: &SqlValue) -> Option<Row> {
        self.state.lock().select_by_id(table, Some(id)).into_iter().next()
    }

    /// Take an advisory lock on behalf of another session.
    pub fn hold_lock(&self, key: &str) {
        self.state.lock().locks.insert(key.to_string(), FOREIGN_SESSION);
    }

    /// Release a lock taken with [`hold_lock`](Self::hold_lock).
    pub fn release_lock(&self, key: &str) {
        let mut state = self.state.lock();
        if state.locks.get(key) == Some(&FOREIGN_SESSION) {
            state.locks.remove(key);
        }
    }

    /// Connection currently holding an advisory lock.
    #[must_use]
    pub fn lock_holder(&self, key: &str) -> Option<u64> {
        self.state.lock().locks.get(key).copied()
    }

    /// Full journal.
    #[must_use]
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state.lock().journal.clone()
    }

    /// Committed statements, in commit order.
    #[must_use]
    pub fn committed(&self) -> Vec<Statement> {
        self.state.lock().committed.clone()
    }

    /// SQL text of committed statements, in commit order.
    #[must_use]
    pub fn committed_sql(&self) -> Vec<String> {
        self.state
            .lock()
            .committed
            .iter()
            .map(|s| s.sql.clone())
            .collect()
    }

    /// Number of journal entries matching `event`.
    #[must_use]
    pub fn count(&self, event: &JournalEvent) -> usize {
        self.state
            .lock()
            .journal
            .iter()
            .filter(|e| &e.event == event)
            .count()
    }

    /// Number of `begin` calls.
    #[must_use]
    pub fn begins(&self) -> usize {
        self.state
            .lock()
            .journal
            .iter()
            .filter(|e| matches!(e.event, JournalEvent::Begin(_)))
            .count()
    }

    /// Number of successful commits.
    #[must_use]
    pub fn commits(&self) -> usize {
        self.count(&JournalEvent::Commit)
    }

    /// Number of rollbacks.
    #[must_use]
    pub fn rollbacks(&self) -> usize {
        self.count(&JournalEvent::Rollback)
    }

    /// Connections ever opened.
    #[must_use]
    pub fn connections_opened(&self) -> u64 {
        self.state.lock().connections_opened
    }

    /// Connections currently open.
    #[must_use]
    pub fn open_connections(&self) -> u32 {
        self.state.lock().open_connections
    }

    /// Highest number of simultaneously open connections seen.
    #[must_use]
    pub fn peak_open_connections(&self) -> u32 {
        self.state.lock().peak_open_connections
    }
}

impl std::fmt::Debug for MockDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockDatabase")
            .field("open_connections", &state.open_connections)
            .field("committed", &state.committed.len())
            .field("faults", &state.faults.len())
            .finish_non_exhaustive()
    }
}

/// Factory handing out [`MockConnection`]s.
#[derive(Debug, Clone)]
pub struct MockFactory {
    db: MockDatabase,
}

impl MockFactory {
    /// Create a factory for `db`.
    #[must_use]
    pub fn new(db: MockDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn connect(&self) -> Result<Box<dyn Connection>, DbError> {
        let conn = self.db.connect()?;
        Ok(Box::new(conn))
    }
}

/// A connection to a [`MockDatabase`].
#[derive(Debug)]
pub struct MockConnection {
    id: u64,
    db: MockDatabase,
    /// Statements of the open transaction; `None` outside a transaction.
    staged: Option<Vec<Statement>>,
}

impl MockConnection {
    /// Connection id, as it appears in the journal.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether a transaction is open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.staged.is_some()
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult, DbError> {
        let delay = {
            let mut state = self.db.state.lock();
            state.record(self.id, JournalEvent::Query(sql.to_string()));
            state.check(FaultPoint::Query, Some(sql))?;
            state.latency(FaultPoint::Query, Some(sql))
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let statement = Statement {
            connection_id: self.id,
            sql: sql.to_string(),
            params: params.to_vec(),
        };

        let mut state = self.db.state.lock();
        if let Some((_, result)) = state.responses.iter().find(|(n, _)| sql.contains(n.as_str())) {
            return Ok(result.clone());
        }

        if let Some(caps) = SELECT_BY_ID_RE.captures(sql) {
            return Ok(QueryResult::with_rows(
                state.select_by_id(&caps[1], params.first()),
            ));
        }

        match self.staged.as_mut() {
            Some(staged) => {
                let affected = state.apply_update(sql, params, true).unwrap_or(1);
                staged.push(statement);
                Ok(QueryResult::affected(affected))
            }
            None => {
                let affected = state.apply_update(sql, params, false).unwrap_or(1);
                state.committed.push(statement);
                Ok(QueryResult::affected(affected))
            }
        }
    }

    async fn begin(&mut self, isolation: IsolationLevel) -> Result<(), DbError> {
        let mut state = self.db.state.lock();
        state.check(FaultPoint::Begin, None)?;
        if self.staged.is_some() {
            return Err(DbError::with_code("25001", "transaction already in progress"));
        }
        state.record(self.id, JournalEvent::Begin(isolation));
        self.staged = Some(Vec::new());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        let mut state = self.db.state.lock();
        state.check(FaultPoint::Commit, None)?;
        let Some(staged) = self.staged.take() else {
            return Err(DbError::with_code("25P01", "no transaction in progress"));
        };
        for statement in staged {
            state.commit_statement(statement);
        }
        state.record(self.id, JournalEvent::Commit);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        let mut state = self.db.state.lock();
        state.check(FaultPoint::Rollback, None)?;
        self.staged = None;
        state.record(self.id, JournalEvent::Rollback);
        Ok(())
    }

    async fn try_advisory_lock(&mut self, key: &str, timeout: Duration) -> Result<bool, DbError> {
        let started = Instant::now();
        loop {
            {
                let mut state = self.db.state.lock();
                state.check(FaultPoint::Lock, None)?;
                let holder = state.locks.get(key).copied();
                if holder.is_none() || holder == Some(self.id) {
                    state.locks.insert(key.to_string(), self.id);
                    state.record(self.id, JournalEvent::Lock(key.to_string()));
                    return Ok(true);
                }
            }
            if started.elapsed() >= timeout {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn advisory_unlock(&mut self, key: &str) -> Result<(), DbError> {
        let mut state = self.db.state.lock();
        state.check(FaultPoint::Unlock, None)?;
        if state.locks.get(key) != Some(&self.id) {
            return Err(DbError::new(format!("advisory lock '{key}' is not held")));
        }
        state.locks.remove(key);
        state.record(self.id, JournalEvent::Unlock(key.to_string()));
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), DbError> {
        let delay = {
            let mut state = self.db.state.lock();
            state.record(self.id, JournalEvent::Ping);
            state.check(FaultPoint::Ping, None)?;
            state.latency(FaultPoint::Ping, None)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        let mut state = self.db.state.lock();
        // The server releases session locks when the session ends.
        let id = self.id;
        state.locks.retain(|_, owner| *owner != id);
        state.open_connections = state.open_connections.saturating_sub(1);
        state.record(id, JournalEvent::Close);
        tracing::trace!(connection_id = id, "mock connection closed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap()
            .block_on(f)
    }

    #[test]
    fn test_staged_statements_commit_together() {
        let db = MockDatabase::new();
        let mut conn = db.connect().unwrap();
        block_on(async {
            conn.begin(IsolationLevel::ReadCommitted).await.unwrap();
            conn.query("INSERT INTO t VALUES ($1)", &[SqlValue::Int(1)])
                .await
                .unwrap();
            assert!(db.committed_sql().is_empty());
            conn.commit().await.unwrap();
        });
        assert_eq!(db.committed_sql(), vec!["INSERT INTO t VALUES ($1)"]);
    }

    #[test]
    fn test_rollback_discards() {
        let db = MockDatabase::new();
        let mut conn = db.connect().unwrap();
        block_on(async {
            conn.begin(IsolationLevel::Serializable).await.unwrap();
            conn.query("DELETE FROM t", &[]).await.unwrap();
            conn.rollback().await.unwrap();
        });
        assert!(db.committed_sql().is_empty());
        assert_eq!(db.rollbacks(), 1);
    }

    #[test]
    fn test_conditional_update() {
        let db = MockDatabase::new();
        db.insert_row("docs", Row::new().with("id", 1).with("title", "a").with("version", 3));
        let mut conn = db.connect().unwrap();

        let stale = block_on(conn.query(
            "UPDATE docs SET title = $1, version = $2 WHERE id = $3 AND version = $4",
            &[SqlValue::from("b"), SqlValue::Int(3), SqlValue::Int(1), SqlValue::Int(2)],
        ))
        .unwrap();
        assert_eq!(stale.rows_affected, 0);

        let fresh = block_on(conn.query(
            "UPDATE docs SET title = $1, version = $2 WHERE id = $3 AND version = $4",
            &[SqlValue::from("b"), SqlValue::Int(4), SqlValue::Int(1), SqlValue::Int(3)],
        ))
        .unwrap();
        assert_eq!(fresh.rows_affected, 1);

        let row = db.row("docs", &SqlValue::Int(1)).unwrap();
        assert_eq!(row.get_i64("version").unwrap(), 4);
        assert_eq!(row.get_by_name("title"), Some(&SqlValue::from("b")));
    }

    #[test]
    fn test_locks_released_on_drop() {
        let db = MockDatabase::new();
        let mut conn = db.connect().unwrap();
        let got = block_on(conn.try_advisory_lock("k", Duration::from_millis(10))).unwrap();
        assert!(got);
        assert_eq!(db.lock_holder("k"), Some(conn.id()));
        drop(conn);
        assert_eq!(db.lock_holder("k"), None);
        assert_eq!(db.open_connections(), 0);
    }

    #[test]
    fn test_foreign_lock_blocks() {
        let db = MockDatabase::new();
        db.hold_lock("k");
        let mut conn = db.connect().unwrap();
        let got = block_on(conn.try_advisory_lock("k", Duration::from_millis(20))).unwrap();
        assert!(!got);
    }
}
