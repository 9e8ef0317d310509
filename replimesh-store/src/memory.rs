//! In-process document driver
//!
//! Every URL maps to one shared in-memory server, so separate connections to
//! the same URL see the same data. Transactions work on a snapshot and commit
//! optimistically: if a collection the transaction wrote changed since the
//! snapshot was taken the commit fails with [`DriverError::WriteConflict`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use replimesh_core::{Document, DriverError, Operation, OperationResult, PoolConfig, Result};

use crate::driver::{DatabaseHandle, DocumentDriver, DriverClient, DriverSession};
use crate::engine;

type Collections = HashMap<String, Vec<Document>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
pub struct MemoryDriver {
    servers: Mutex<HashMap<String, Arc<MemoryServer>>>,
    connect_attempts: AtomicUsize,
    connect_latency: Option<Duration>,
    failing: Mutex<HashSet<String>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every connection setup, to widen race windows in tests
    pub fn with_connect_latency(mut self, latency: Duration) -> Self {
        self.connect_latency = Some(latency);
        self
    }

    /// Make connection setups to `url` fail until [`MemoryDriver::heal`] is called
    pub fn fail_connections_to(&self, url: &str) {
        lock(&self.failing).insert(url.to_string());
    }

    pub fn heal(&self, url: &str) {
        lock(&self.failing).remove(url);
    }

    /// Number of connection setups attempted so far, failed ones included
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Snapshot of a collection, for assertions and the CLI
    pub fn documents(&self, url: &str, database: &str, collection: &str) -> Vec<Document> {
        let db = self.server(url).database(database);
        let state = lock(&db.state);
        state
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Preload documents without going through a connection
    pub fn seed(&self, url: &str, database: &str, collection: &str, docs: Vec<Document>) {
        let db = self.server(url).database(database);
        let mut state = lock(&db.state);
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .extend(docs);
        state.bump(collection);
    }

    fn server(&self, url: &str) -> Arc<MemoryServer> {
        lock(&self.servers)
            .entry(url.to_string())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl DocumentDriver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(
        &self,
        url: &str,
        pool: &PoolConfig,
    ) -> std::result::Result<Arc<dyn DriverClient>, DriverError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.connect_latency {
            tokio::time::sleep(latency).await;
        }
        if lock(&self.failing).contains(url) {
            return Err(DriverError::connection(url, "connection refused"));
        }

        debug!(
            max_pool_size = pool.max_pool_size,
            min_pool_size = pool.min_pool_size,
            "memory client connected"
        );
        Ok(Arc::new(MemoryClient {
            server: self.server(url),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

#[derive(Default)]
struct MemoryServer {
    databases: Mutex<HashMap<String, Arc<MemoryDatabase>>>,
}

impl MemoryServer {
    fn database(&self, name: &str) -> Arc<MemoryDatabase> {
        lock(&self.databases)
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryDatabase {
                    state: Mutex::new(DatabaseState::default()),
                })
            })
            .clone()
    }
}

struct MemoryDatabase {
    state: Mutex<DatabaseState>,
}

#[derive(Default)]
struct DatabaseState {
    /// Per collection, bumped on every committed mutation
    versions: HashMap<String, u64>,
    collections: Collections,
}

impl DatabaseState {
    fn version(&self, collection: &str) -> u64 {
        self.versions.get(collection).copied().unwrap_or(0)
    }

    fn bump(&mut self, collection: &str) {
        *self.versions.entry(collection.to_string()).or_default() += 1;
    }

    fn run(&mut self, op: &Operation) -> std::result::Result<OperationResult, DriverError> {
        let applied = apply(&mut self.collections, op)?;
        if applied.is_mutation() {
            self.bump(&op.collection);
        }
        Ok(applied.result)
    }
}

fn apply(collections: &mut Collections, op: &Operation) -> std::result::Result<engine::Applied, DriverError> {
    let docs = collections.entry(op.collection.clone()).or_default();
    engine::apply(docs, op)
}

struct MemoryClient {
    server: Arc<MemoryServer>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl DriverClient for MemoryClient {
    fn database(&self, name: &str) -> Arc<dyn DatabaseHandle> {
        Arc::new(MemoryHandle {
            name: name.to_string(),
            db: self.server.database(name),
            closed: self.closed.clone(),
        })
    }

    async fn start_session(
        &self,
        database: &str,
    ) -> std::result::Result<Box<dyn DriverSession>, DriverError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Closed);
        }
        Ok(Box::new(MemorySession {
            db: self.server.database(database),
            closed: self.closed.clone(),
            transaction: None,
            ended: false,
        }))
    }

    async fn close(&self) -> std::result::Result<(), DriverError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryHandle {
    name: String,
    db: Arc<MemoryDatabase>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl DatabaseHandle for MemoryHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, operation: &Operation) -> Result<OperationResult> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Closed.into());
        }
        Ok(lock(&self.db.state).run(operation)?)
    }
}

struct Snapshot {
    base_versions: HashMap<String, u64>,
    collections: Collections,
    /// Collections mutated inside the transaction
    written: HashSet<String>,
}

struct MemorySession {
    db: Arc<MemoryDatabase>,
    closed: Arc<AtomicBool>,
    transaction: Option<Snapshot>,
    ended: bool,
}

impl MemorySession {
    fn ensure_open(&self) -> std::result::Result<(), DriverError> {
        if self.ended || self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl DriverSession for MemorySession {
    async fn start_transaction(&mut self) -> std::result::Result<(), DriverError> {
        self.ensure_open()?;
        if self.transaction.is_some() {
            return Err(DriverError::query("transaction already in progress"));
        }
        let state = lock(&self.db.state);
        self.transaction = Some(Snapshot {
            base_versions: state.versions.clone(),
            collections: state.collections.clone(),
            written: HashSet::new(),
        });
        Ok(())
    }

    async fn run(
        &mut self,
        operation: &Operation,
    ) -> std::result::Result<OperationResult, DriverError> {
        self.ensure_open()?;
        match self.transaction.as_mut() {
            Some(snapshot) => {
                let applied = apply(&mut snapshot.collections, operation)?;
                if applied.is_mutation() {
                    snapshot.written.insert(operation.collection.clone());
                }
                Ok(applied.result)
            }
            None => lock(&self.db.state).run(operation),
        }
    }

    async fn commit_transaction(&mut self) -> std::result::Result<(), DriverError> {
        self.ensure_open()?;
        let snapshot = self
            .transaction
            .take()
            .ok_or_else(|| DriverError::query("no transaction in progress"))?;
        let Snapshot {
            base_versions,
            mut collections,
            written,
        } = snapshot;

        let mut state = lock(&self.db.state);
        let changed = written.iter().any(|name| {
            state.version(name) != base_versions.get(name).copied().unwrap_or(0)
        });
        if changed {
            return Err(DriverError::WriteConflict);
        }
        for name in written {
            let docs = collections.remove(&name).unwrap_or_default();
            state.collections.insert(name.clone(), docs);
            state.bump(&name);
        }
        Ok(())
    }

    async fn abort_transaction(&mut self) -> std::result::Result<(), DriverError> {
        self.transaction = None;
        Ok(())
    }

    async fn end_session(&mut self) {
        self.transaction = None;
        self.ended = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DatabaseExt;
    use serde_json::json;

    async fn client(driver: &MemoryDriver, url: &str) -> Arc<dyn DriverClient> {
        driver.connect(url, &PoolConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_connections_to_same_url_share_data() {
        let driver = MemoryDriver::new();
        let a = client(&driver, "memory://one").await;
        let b = client(&driver, "memory://one").await;
        let other = client(&driver, "memory://two").await;

        a.database("school")
            .insert_one("students", json!({"_id": 1}))
            .await
            .unwrap();

        assert_eq!(b.database("school").count_documents("students", json!({})).await.unwrap(), 1);
        assert_eq!(other.database("school").count_documents("students", json!({})).await.unwrap(), 0);
        assert_eq!(driver.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_failing_url() {
        let driver = MemoryDriver::new();
        driver.fail_connections_to("memory://down");
        let err = driver
            .connect("memory://down", &PoolConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DriverError::Connection { .. }));

        driver.heal("memory://down");
        assert!(driver.connect("memory://down", &PoolConfig::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_transaction_isolated_until_commit() {
        let driver = MemoryDriver::new();
        let c = client(&driver, "memory://tx").await;
        let mut session = c.start_session("school").await.unwrap();
        session.start_transaction().await.unwrap();
        session
            .run(&Operation::insert_one("t", json!({"_id": "x"})))
            .await
            .unwrap();

        assert!(driver.documents("memory://tx", "school", "t").is_empty());
        session.commit_transaction().await.unwrap();
        assert_eq!(driver.documents("memory://tx", "school", "t").len(), 1);
        session.end_session().await;
    }

    #[tokio::test]
    async fn test_abort_discards_writes() {
        let driver = MemoryDriver::new();
        let c = client(&driver, "memory://tx").await;
        let mut session = c.start_session("school").await.unwrap();
        session.start_transaction().await.unwrap();
        session
            .run(&Operation::insert_one("t", json!({"_id": "x"})))
            .await
            .unwrap();
        session.abort_transaction().await.unwrap();
        session.end_session().await;

        assert!(driver.documents("memory://tx", "school", "t").is_empty());
        let err = session.run(&Operation::find("t")).await.unwrap_err();
        assert_eq!(err, DriverError::Closed);
    }

    #[tokio::test]
    async fn test_concurrent_change_conflicts() {
        let driver = MemoryDriver::new();
        let c = client(&driver, "memory://tx").await;
        let mut session = c.start_session("school").await.unwrap();
        session.start_transaction().await.unwrap();
        session
            .run(&Operation::insert_one("t", json!({"_id": "x"})))
            .await
            .unwrap();

        c.database("school")
            .insert_one("t", json!({"_id": "y"}))
            .await
            .unwrap();

        let err = session.commit_transaction().await.unwrap_err();
        assert_eq!(err, DriverError::WriteConflict);
    }

    #[tokio::test]
    async fn test_unrelated_collection_does_not_conflict() {
        let driver = MemoryDriver::new();
        let c = client(&driver, "memory://tx").await;
        let mut session = c.start_session("school").await.unwrap();
        session.start_transaction().await.unwrap();
        session
            .run(&Operation::insert_one("t", json!({"_id": "x"})))
            .await
            .unwrap();

        c.database("school")
            .insert_one("audit", json!({"_id": "a1"}))
            .await
            .unwrap();

        session.commit_transaction().await.unwrap();
        assert_eq!(driver.documents("memory://tx", "school", "t").len(), 1);
        assert_eq!(driver.documents("memory://tx", "school", "audit").len(), 1);
    }

    #[tokio::test]
    async fn test_read_only_transaction_commits_despite_changes() {
        let driver = MemoryDriver::new();
        let c = client(&driver, "memory://tx").await;
        let mut session = c.start_session("school").await.unwrap();
        session.start_transaction().await.unwrap();
        session.run(&Operation::find("t")).await.unwrap();

        c.database("school")
            .insert_one("t", json!({"_id": "y"}))
            .await
            .unwrap();

        session.commit_transaction().await.unwrap();
        assert_eq!(driver.documents("memory://tx", "school", "t").len(), 1);
    }

    #[tokio::test]
    async fn test_closed_client_rejects_operations() {
        let driver = MemoryDriver::new();
        let c = client(&driver, "memory://closing").await;
        let db = c.database("school");
        c.close().await.unwrap();
        assert!(db.find("t", json!({})).await.is_err());
    }
}
