//! Driver boundary
//!
//! The executor, registry and transaction coordinator only talk to these
//! traits. Implementations:
//! - [`crate::memory::MemoryDriver`]: in-process document server (demo mode, tests)
//! - `crate::postgres::PgDocumentDriver`: JSONB tables over sqlx (`postgres` feature)

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use replimesh_core::{
    DeleteResult, Document, DriverError, InsertManyResult, InsertOneResult, MeshError, Operation,
    OperationKind, OperationResult, PoolConfig, Result, UpdateResult,
};

/// Opens pooled connections to one kind of backend
#[async_trait]
pub trait DocumentDriver: Send + Sync + 'static {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    async fn connect(
        &self,
        url: &str,
        pool: &PoolConfig,
    ) -> std::result::Result<Arc<dyn DriverClient>, DriverError>;
}

/// A connected, pooled client for one URL
#[async_trait]
pub trait DriverClient: Send + Sync {
    fn database(&self, name: &str) -> Arc<dyn DatabaseHandle>;

    async fn start_session(
        &self,
        database: &str,
    ) -> std::result::Result<Box<dyn DriverSession>, DriverError>;

    async fn close(&self) -> std::result::Result<(), DriverError>;
}

/// Collection primitives of one logical database.
///
/// `run` receives an already validated operation and returns the result shape
/// matching its kind.
#[async_trait]
pub trait DatabaseHandle: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, operation: &Operation) -> Result<OperationResult>;
}

/// Client session able to host one transaction at a time
#[async_trait]
pub trait DriverSession: Send {
    async fn start_transaction(&mut self) -> std::result::Result<(), DriverError>;

    async fn run(&mut self, operation: &Operation)
        -> std::result::Result<OperationResult, DriverError>;

    async fn commit_transaction(&mut self) -> std::result::Result<(), DriverError>;

    async fn abort_transaction(&mut self) -> std::result::Result<(), DriverError>;

    /// Release the session. Aborts an open transaction. Idempotent.
    async fn end_session(&mut self);
}

/// Typed convenience calls over any [`DatabaseHandle`]
#[async_trait]
pub trait DatabaseExt: DatabaseHandle {
    async fn find(&self, collection: &str, filter: Value) -> Result<Vec<Document>> {
        self.run(&Operation::find(collection).filter(filter))
            .await?
            .into_documents()
    }

    async fn find_one(&self, collection: &str, filter: Value) -> Result<Option<Document>> {
        match self
            .run(&Operation::find_one(collection).filter(filter))
            .await?
        {
            OperationResult::Document(doc) => Ok(doc),
            other => Err(unexpected(OperationKind::FindOne, &other)),
        }
    }

    async fn insert_one(&self, collection: &str, document: Value) -> Result<InsertOneResult> {
        match self.run(&Operation::insert_one(collection, document)).await? {
            OperationResult::InsertOne(r) => Ok(r),
            other => Err(unexpected(OperationKind::InsertOne, &other)),
        }
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Value>,
    ) -> Result<InsertManyResult> {
        match self
            .run(&Operation::insert_many(collection, documents))
            .await?
        {
            OperationResult::InsertMany(r) => Ok(r),
            other => Err(unexpected(OperationKind::InsertMany, &other)),
        }
    }

    async fn update_one(&self, collection: &str, filter: Value, update: Value) -> Result<UpdateResult> {
        let op = Operation::update_one(collection, filter, update);
        update_result(self.run(&op).await?, op.kind)
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: Value,
        update: Value,
    ) -> Result<UpdateResult> {
        let op = Operation::update_many(collection, filter, update);
        update_result(self.run(&op).await?, op.kind)
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: Value,
        replacement: Value,
    ) -> Result<UpdateResult> {
        let op = Operation::replace_one(collection, filter, replacement);
        update_result(self.run(&op).await?, op.kind)
    }

    async fn delete_one(&self, collection: &str, filter: Value) -> Result<DeleteResult> {
        let op = Operation::delete_one(collection, filter);
        delete_result(self.run(&op).await?, op.kind)
    }

    async fn delete_many(&self, collection: &str, filter: Value) -> Result<DeleteResult> {
        let op = Operation::delete_many(collection, filter);
        delete_result(self.run(&op).await?, op.kind)
    }

    async fn aggregate(&self, collection: &str, pipeline: Vec<Value>) -> Result<Vec<Document>> {
        self.run(&Operation::aggregate(collection, pipeline))
            .await?
            .into_documents()
    }

    async fn count_documents(&self, collection: &str, filter: Value) -> Result<u64> {
        let result = self
            .run(&Operation::count_documents(collection).filter(filter))
            .await?;
        result
            .count()
            .ok_or_else(|| unexpected(OperationKind::CountDocuments, &result))
    }
}

impl<T: DatabaseHandle + ?Sized> DatabaseExt for T {}

fn update_result(result: OperationResult, kind: OperationKind) -> Result<UpdateResult> {
    match result {
        OperationResult::Update(r) => Ok(r),
        other => Err(unexpected(kind, &other)),
    }
}

fn delete_result(result: OperationResult, kind: OperationKind) -> Result<DeleteResult> {
    match result {
        OperationResult::Delete(r) => Ok(r),
        other => Err(unexpected(kind, &other)),
    }
}

fn unexpected(kind: OperationKind, result: &OperationResult) -> MeshError {
    MeshError::invalid_operation(format!(
        "{} returned an unexpected result ({})",
        kind,
        result.cardinality()
    ))
}
