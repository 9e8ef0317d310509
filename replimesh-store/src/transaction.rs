//! Transaction coordinator
//!
//! Runs a unit of work inside a single-instance transaction. Writes issued
//! through the [`TransactionDb`] handle are executed against the session and
//! recorded in call order; after a successful commit they are replicated as
//! one detached task, one envelope per write. Aborted transactions replicate
//! nothing.
//!
//! The session is ended on every exit path, including a panicking unit of work.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use replimesh_core::{
    InstanceDirectory, InstanceId, MeshError, Operation, OperationResult, Result, Role,
};

use crate::driver::{DatabaseHandle, DriverSession};
use crate::engine;
use crate::executor::{await_replication, validate};
use crate::registry::ConnectionRegistry;
use crate::replication::ReplicationDispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Started,
    Executing,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct TransactionInner {
    instance: InstanceId,
    database: String,
    session: Mutex<Option<Box<dyn DriverSession>>>,
    captured: StdMutex<Vec<Operation>>,
    state: StdMutex<TransactionState>,
}

/// Database handle bound to one open transaction.
///
/// Cloning shares the same session and capture list.
#[derive(Clone)]
pub struct TransactionDb {
    inner: Arc<TransactionInner>,
}

impl TransactionDb {
    fn new(instance: InstanceId, database: String, session: Box<dyn DriverSession>) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                instance,
                database,
                session: Mutex::new(Some(session)),
                captured: StdMutex::new(Vec::new()),
                state: StdMutex::new(TransactionState::Started),
            }),
        }
    }

    pub fn instance(&self) -> &InstanceId {
        &self.inner.instance
    }

    pub fn state(&self) -> TransactionState {
        *lock(&self.inner.state)
    }

    /// Writes recorded so far, in call order
    pub fn captured(&self) -> Vec<Operation> {
        lock(&self.inner.captured).clone()
    }

    fn transition(&self, next: TransactionState) {
        let mut state = lock(&self.inner.state);
        debug!(instance = %self.inner.instance, from = ?*state, to = ?next, "transaction state");
        *state = next;
    }

    /// Commit and end the session. On success returns the captured writes.
    async fn commit(&self) -> Result<Vec<Operation>> {
        let mut session = self
            .inner
            .session
            .lock()
            .await
            .take()
            .ok_or(MeshError::SessionClosed)?;

        match session.commit_transaction().await {
            Ok(()) => {
                session.end_session().await;
                self.transition(TransactionState::Committed);
                Ok(std::mem::take(&mut *lock(&self.inner.captured)))
            }
            Err(e) => {
                if let Err(abort_err) = session.abort_transaction().await {
                    warn!(instance = %self.inner.instance, error = %abort_err, "abort after failed commit failed");
                }
                session.end_session().await;
                self.discard();
                Err(e.into())
            }
        }
    }

    /// Abort (when still open) and end the session
    async fn abort(&self) {
        let session = self.inner.session.lock().await.take();
        if let Some(mut session) = session {
            if let Err(e) = session.abort_transaction().await {
                warn!(instance = %self.inner.instance, error = %e, "transaction abort failed");
            }
            session.end_session().await;
        }
        self.discard();
    }

    fn discard(&self) {
        lock(&self.inner.captured).clear();
        self.transition(TransactionState::Aborted);
    }
}

#[async_trait]
impl DatabaseHandle for TransactionDb {
    fn name(&self) -> &str {
        &self.inner.database
    }

    async fn run(&self, operation: &Operation) -> Result<OperationResult> {
        validate(operation)?;
        if self.state() != TransactionState::Executing {
            return Err(MeshError::SessionClosed);
        }

        let operation = engine::with_assigned_ids(operation);
        let mut slot = self.inner.session.lock().await;
        let session = slot.as_mut().ok_or(MeshError::SessionClosed)?;
        let result = session.run(&operation).await?;

        if operation.kind.is_write() {
            lock(&self.inner.captured).push(operation);
        }
        Ok(result)
    }
}

pub struct TransactionCoordinator {
    directory: Arc<InstanceDirectory>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<ReplicationDispatcher>,
}

impl TransactionCoordinator {
    pub fn new(
        directory: Arc<InstanceDirectory>,
        registry: Arc<ConnectionRegistry>,
        dispatcher: Arc<ReplicationDispatcher>,
    ) -> Self {
        Self {
            directory,
            registry,
            dispatcher,
        }
    }

    /// Run `unit_of_work` in a transaction on `instance`.
    ///
    /// `Ok` commits, `Err` aborts and is returned unchanged. A commit failure
    /// (for example a write conflict) is returned as a driver error.
    pub async fn run<T, F, Fut>(
        &self,
        instance: &InstanceId,
        affected_roles: Option<&[Role]>,
        unit_of_work: F,
    ) -> Result<T>
    where
        F: FnOnce(TransactionDb) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (value, _replication) = self.run_inner(instance, affected_roles, unit_of_work).await?;
        Ok(value)
    }

    /// Like [`TransactionCoordinator::run`], but waits for replication of the
    /// committed writes. The flag is `false` when any envelope was not delivered.
    pub async fn run_and_wait<T, F, Fut>(
        &self,
        instance: &InstanceId,
        affected_roles: Option<&[Role]>,
        unit_of_work: F,
    ) -> Result<(T, bool)>
    where
        F: FnOnce(TransactionDb) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (value, replication) = self.run_inner(instance, affected_roles, unit_of_work).await?;
        Ok((value, await_replication(replication).await))
    }

    async fn run_inner<T, F, Fut>(
        &self,
        instance: &InstanceId,
        affected_roles: Option<&[Role]>,
        unit_of_work: F,
    ) -> Result<(T, Option<JoinHandle<bool>>)>
    where
        F: FnOnce(TransactionDb) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let url = self
            .directory
            .url_for_instance(instance)
            .ok_or_else(|| MeshError::NoConnectionUrl {
                instance: instance.clone(),
            })?;
        let client = self.registry.acquire(url).await?;
        let database = self.registry.default_database_name().to_string();

        let mut session = client.start_session(&database).await?;
        if let Err(e) = session.start_transaction().await {
            session.end_session().await;
            return Err(e.into());
        }

        let db = TransactionDb::new(instance.clone(), database, session);
        db.transition(TransactionState::Executing);

        let handle = db.clone();
        let outcome = AssertUnwindSafe(async move { unit_of_work(handle).await })
            .catch_unwind()
            .await;

        let value = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                db.abort().await;
                info!(instance = %instance, error = %e, "transaction aborted");
                return Err(e);
            }
            Err(panic) => {
                db.abort().await;
                warn!(instance = %instance, "transaction aborted by panic");
                std::panic::resume_unwind(panic);
            }
        };

        let captured = db.commit().await?;
        info!(
            instance = %instance,
            writes = captured.len(),
            "transaction committed"
        );

        // One task for the whole batch keeps envelopes in call order
        let replication = (!captured.is_empty()).then(|| {
            self.dispatcher.spawn_dispatch(
                captured,
                instance.clone(),
                affected_roles.map(<[Role]>::to_vec),
            )
        });

        Ok((value, replication))
    }
}
