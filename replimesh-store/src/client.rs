//! `MeshClient`: the entry point applications use
//!
//! Wires configuration, directory, selector, registry, executor, transaction
//! coordinator and replication dispatcher together behind one cloneable handle.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::info;

use replimesh_core::{
    DeleteResult, Document, InsertOneResult, InstanceDirectory, InstanceId, InstanceSelector,
    MeshConfig, MeshError, Operation, OperationResult, Result, Role, UpdateResult,
};

use crate::driver::{DatabaseExt, DatabaseHandle, DocumentDriver};
use crate::executor::OperationExecutor;
use crate::memory::MemoryDriver;
use crate::registry::ConnectionRegistry;
use crate::replication::{GithubDispatchChannel, LogChannel, ReplicationChannel, ReplicationDispatcher};
use crate::transaction::{TransactionCoordinator, TransactionDb};

/// Where a read may go
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadTarget {
    pub instance: Option<InstanceId>,
    pub role: Option<Role>,
}

impl ReadTarget {
    /// Any configured instance
    pub fn any() -> Self {
        Self::default()
    }

    pub fn role(role: Role) -> Self {
        Self {
            instance: None,
            role: Some(role),
        }
    }

    pub fn instance(instance: impl Into<InstanceId>) -> Self {
        Self {
            instance: Some(instance.into()),
            role: None,
        }
    }
}

pub struct MeshClientBuilder {
    config: MeshConfig,
    driver: Option<Arc<dyn DocumentDriver>>,
    channel: Option<Arc<dyn ReplicationChannel>>,
    seed: Option<u64>,
}

impl MeshClientBuilder {
    pub fn driver(mut self, driver: Arc<dyn DocumentDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn channel(mut self, channel: Arc<dyn ReplicationChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Seed instance selection (reproducible reads)
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<MeshClient> {
        let directory = Arc::new(InstanceDirectory::from_config(&self.config)?);

        let driver = self
            .driver
            .unwrap_or_else(|| Arc::new(MemoryDriver::new()) as Arc<dyn DocumentDriver>);
        let channel: Arc<dyn ReplicationChannel> = match self.channel {
            Some(channel) => channel,
            None if self.config.replication.enabled => Arc::new(
                GithubDispatchChannel::from_config(&self.config.replication)
                    .map_err(|e| MeshError::config(e.to_string()))?,
            ),
            None => Arc::new(LogChannel),
        };

        let selector = match self.seed {
            Some(seed) => InstanceSelector::with_seed(directory.clone(), seed),
            None => InstanceSelector::new(directory.clone()),
        };
        let registry = Arc::new(ConnectionRegistry::new(
            driver.clone(),
            self.config.database.clone(),
        ));
        let dispatcher = Arc::new(
            ReplicationDispatcher::new(directory.clone(), channel)
                .with_event_type(self.config.replication.event_type.clone()),
        );
        let executor = OperationExecutor::new(directory.clone(), registry.clone(), dispatcher.clone())
            .with_diagnostics(self.config.diagnostics);
        let transactions =
            TransactionCoordinator::new(directory.clone(), registry.clone(), dispatcher.clone());

        info!(
            driver = driver.name(),
            instances = directory.all_instances().len(),
            roles = directory.roles().len(),
            replication = self.config.replication.enabled,
            "mesh client ready"
        );

        Ok(MeshClient {
            inner: Arc::new(MeshInner {
                config: self.config,
                directory,
                selector,
                registry,
                dispatcher,
                executor,
                transactions,
            }),
        })
    }
}

struct MeshInner {
    config: MeshConfig,
    directory: Arc<InstanceDirectory>,
    selector: InstanceSelector,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<ReplicationDispatcher>,
    executor: OperationExecutor,
    transactions: TransactionCoordinator,
}

#[derive(Clone)]
pub struct MeshClient {
    inner: Arc<MeshInner>,
}

impl MeshClient {
    pub fn builder(config: MeshConfig) -> MeshClientBuilder {
        MeshClientBuilder {
            config,
            driver: None,
            channel: None,
            seed: None,
        }
    }

    pub fn new(
        config: MeshConfig,
        driver: Arc<dyn DocumentDriver>,
        channel: Arc<dyn ReplicationChannel>,
    ) -> Result<Self> {
        Self::builder(config).driver(driver).channel(channel).build()
    }

    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    pub fn directory(&self) -> &InstanceDirectory {
        &self.inner.directory
    }

    pub fn selector(&self) -> &InstanceSelector {
        &self.inner.selector
    }

    pub fn dispatcher(&self) -> &Arc<ReplicationDispatcher> {
        &self.inner.dispatcher
    }

    /// Select an instance, execute, and replicate successful writes
    pub async fn execute(
        &self,
        explicit: Option<&InstanceId>,
        operation: &Operation,
        role: Option<Role>,
        affected_roles: Option<&[Role]>,
    ) -> Result<OperationResult> {
        let instance = self.inner.selector.select_for(operation.kind, explicit, role)?;
        self.inner
            .executor
            .execute(&instance, operation, affected_roles)
            .await
    }

    pub async fn read(&self, operation: &Operation, target: ReadTarget) -> Result<OperationResult> {
        if !operation.is_read() {
            return Err(MeshError::invalid_operation(format!(
                "{} is a write; use write()",
                operation.kind
            )));
        }
        self.execute(target.instance.as_ref(), operation, target.role, None)
            .await
    }

    /// Read and decode the returned documents
    pub async fn read_as<T: DeserializeOwned>(
        &self,
        operation: &Operation,
        target: ReadTarget,
    ) -> Result<Vec<T>> {
        self.read(operation, target).await?.decode()
    }

    pub async fn write(
        &self,
        instance: &InstanceId,
        operation: &Operation,
        affected_roles: Option<&[Role]>,
    ) -> Result<OperationResult> {
        if operation.is_read() {
            return Err(MeshError::invalid_operation(format!(
                "{} is a read; use read()",
                operation.kind
            )));
        }
        self.execute(Some(instance), operation, None, affected_roles)
            .await
    }

    /// [`MeshClient::write`] that waits for replication; see
    /// [`OperationExecutor::execute_and_wait`]
    pub async fn write_and_wait(
        &self,
        instance: &InstanceId,
        operation: &Operation,
        affected_roles: Option<&[Role]>,
    ) -> Result<(OperationResult, bool)> {
        if operation.is_read() {
            return Err(MeshError::invalid_operation(format!(
                "{} is a read; use read()",
                operation.kind
            )));
        }
        self.inner
            .executor
            .execute_and_wait(instance, operation, affected_roles)
            .await
    }

    pub async fn transaction<T, F, Fut>(
        &self,
        instance: &InstanceId,
        affected_roles: Option<&[Role]>,
        unit_of_work: F,
    ) -> Result<T>
    where
        F: FnOnce(TransactionDb) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.inner
            .transactions
            .run(instance, affected_roles, unit_of_work)
            .await
    }

    /// [`MeshClient::transaction`] that waits for replication of the committed writes
    pub async fn transaction_and_wait<T, F, Fut>(
        &self,
        instance: &InstanceId,
        affected_roles: Option<&[Role]>,
        unit_of_work: F,
    ) -> Result<(T, bool)>
    where
        F: FnOnce(TransactionDb) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.inner
            .transactions
            .run_and_wait(instance, affected_roles, unit_of_work)
            .await
    }

    /// Raw handle on one collection of an instance. Writes through it are not
    /// replicated.
    pub async fn collection(&self, instance: &InstanceId, name: &str) -> Result<CollectionHandle> {
        let url = self
            .inner
            .directory
            .url_for_instance(instance)
            .ok_or_else(|| MeshError::NoConnectionUrl {
                instance: instance.clone(),
            })?;
        let db = self.inner.registry.default_database(url).await?;
        Ok(CollectionHandle {
            db,
            collection: name.to_string(),
        })
    }

    pub async fn close_all(&self) {
        self.inner.registry.close_all().await;
    }
}

/// A database handle bound to one collection
#[derive(Clone)]
pub struct CollectionHandle {
    db: Arc<dyn DatabaseHandle>,
    collection: String,
}

impl CollectionHandle {
    pub fn name(&self) -> &str {
        &self.collection
    }

    pub fn database(&self) -> &str {
        self.db.name()
    }

    pub async fn find(&self, filter: Value) -> Result<Vec<Document>> {
        self.db.find(&self.collection, filter).await
    }

    pub async fn find_one(&self, filter: Value) -> Result<Option<Document>> {
        self.db.find_one(&self.collection, filter).await
    }

    pub async fn insert_one(&self, document: Value) -> Result<InsertOneResult> {
        self.db.insert_one(&self.collection, document).await
    }

    pub async fn update_one(&self, filter: Value, update: Value) -> Result<UpdateResult> {
        self.db.update_one(&self.collection, filter, update).await
    }

    pub async fn delete_one(&self, filter: Value) -> Result<DeleteResult> {
        self.db.delete_one(&self.collection, filter).await
    }

    pub async fn count_documents(&self, filter: Value) -> Result<u64> {
        self.db.count_documents(&self.collection, filter).await
    }
}
