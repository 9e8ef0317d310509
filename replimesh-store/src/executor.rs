//! Operation executor
//!
//! Runs one operation against one instance and, for successful writes, hands
//! the operation to the replication dispatcher as a detached task.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use replimesh_core::{
    InstanceDirectory, InstanceId, MeshError, Operation, OperationKind, OperationResult, Result,
    Role,
};

use crate::engine;
use crate::registry::ConnectionRegistry;
use crate::replication::ReplicationDispatcher;

pub struct OperationExecutor {
    directory: Arc<InstanceDirectory>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<ReplicationDispatcher>,
    diagnostics: bool,
}

impl OperationExecutor {
    pub fn new(
        directory: Arc<InstanceDirectory>,
        registry: Arc<ConnectionRegistry>,
        dispatcher: Arc<ReplicationDispatcher>,
    ) -> Self {
        Self {
            directory,
            registry,
            dispatcher,
            diagnostics: false,
        }
    }

    /// Emit an `info` record with timing for every operation
    pub fn with_diagnostics(mut self, enabled: bool) -> Self {
        self.diagnostics = enabled;
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<ReplicationDispatcher> {
        &self.dispatcher
    }

    pub async fn execute(
        &self,
        instance: &InstanceId,
        operation: &Operation,
        affected_roles: Option<&[Role]>,
    ) -> Result<OperationResult> {
        // Replication runs detached
        let (result, _replication) = self.execute_inner(instance, operation, affected_roles).await?;
        Ok(result)
    }

    /// Like [`OperationExecutor::execute`], but waits for replication to finish.
    ///
    /// The flag is `false` when any envelope could not be delivered. For
    /// short-lived callers (the CLI) that would otherwise exit first.
    pub async fn execute_and_wait(
        &self,
        instance: &InstanceId,
        operation: &Operation,
        affected_roles: Option<&[Role]>,
    ) -> Result<(OperationResult, bool)> {
        let (result, replication) = self.execute_inner(instance, operation, affected_roles).await?;
        Ok((result, await_replication(replication).await))
    }

    async fn execute_inner(
        &self,
        instance: &InstanceId,
        operation: &Operation,
        affected_roles: Option<&[Role]>,
    ) -> Result<(OperationResult, Option<JoinHandle<bool>>)> {
        // Replicas must store new documents under the ids chosen here
        let operation = &engine::with_assigned_ids(operation);
        match self.run(instance, operation).await {
            Ok(result) => {
                let replication = operation.kind.is_write().then(|| {
                    self.dispatcher.spawn_dispatch(
                        vec![operation.clone()],
                        instance.clone(),
                        affected_roles.map(<[Role]>::to_vec),
                    )
                });
                Ok((result, replication))
            }
            Err(e) => {
                error!(
                    instance = %instance,
                    operation = %operation.kind,
                    collection = %operation.collection,
                    error = %e,
                    "operation failed"
                );
                Err(e)
            }
        }
    }

    async fn run(&self, instance: &InstanceId, operation: &Operation) -> Result<OperationResult> {
        let url = self
            .directory
            .url_for_instance(instance)
            .ok_or_else(|| MeshError::NoConnectionUrl {
                instance: instance.clone(),
            })?;
        validate(operation)?;
        let db = self.registry.default_database(url).await?;

        let started = Instant::now();
        let result = db.run(operation).await?;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        check_shape(operation.kind, &result)?;

        let access = if operation.is_read() { "read" } else { "write" };
        if self.diagnostics {
            info!(
                instance = %instance,
                access,
                operation = %operation.kind,
                collection = %operation.collection,
                duration_ms,
                result = %result.cardinality(),
                "operation executed"
            );
        }
        debug!(
            instance = %instance,
            access,
            operation = %operation.kind,
            collection = %operation.collection,
            duration_ms,
            "operation executed"
        );

        Ok(result)
    }
}

pub(crate) async fn await_replication(handle: Option<JoinHandle<bool>>) -> bool {
    match handle {
        Some(handle) => handle.await.unwrap_or_else(|e| {
            warn!(error = %e, "replication task did not complete");
            false
        }),
        None => true,
    }
}

/// Reject kinds the executor does not dispatch and payloads a kind cannot use
pub(crate) fn validate(operation: &Operation) -> Result<()> {
    let requires_data = |what: &str| match &operation.data {
        Some(_) => Ok(()),
        None => Err(MeshError::invalid_operation(format!(
            "{} requires {}",
            operation.kind, what
        ))),
    };

    match operation.kind {
        OperationKind::Find | OperationKind::FindOne | OperationKind::CountDocuments => Ok(()),
        OperationKind::DeleteOne | OperationKind::DeleteMany => Ok(()),
        OperationKind::InsertOne => match &operation.data {
            Some(Value::Object(_)) => Ok(()),
            _ => Err(MeshError::invalid_operation(
                "insertOne requires a document in data",
            )),
        },
        OperationKind::InsertMany => match &operation.data {
            Some(Value::Array(_)) => Ok(()),
            _ => Err(MeshError::invalid_operation(
                "insertMany requires an array of documents in data",
            )),
        },
        OperationKind::UpdateOne | OperationKind::UpdateMany => requires_data("an update document"),
        OperationKind::ReplaceOne => requires_data("a replacement document"),
        OperationKind::Aggregate => match &operation.pipeline {
            Some(_) => Ok(()),
            None => Err(MeshError::invalid_operation("aggregate requires a pipeline")),
        },
        OperationKind::EstimatedDocumentCount
        | OperationKind::Distinct
        | OperationKind::FindOneAndUpdate
        | OperationKind::FindOneAndReplace
        | OperationKind::FindOneAndDelete => Err(MeshError::UnsupportedOperation {
            kind: operation.kind,
        }),
    }
}

fn check_shape(kind: OperationKind, result: &OperationResult) -> Result<()> {
    let ok = match kind {
        OperationKind::Find | OperationKind::Aggregate => {
            matches!(result, OperationResult::Documents(_))
        }
        OperationKind::FindOne
        | OperationKind::FindOneAndUpdate
        | OperationKind::FindOneAndReplace
        | OperationKind::FindOneAndDelete => matches!(result, OperationResult::Document(_)),
        OperationKind::CountDocuments | OperationKind::EstimatedDocumentCount => {
            matches!(result, OperationResult::Count(_))
        }
        OperationKind::InsertOne => matches!(result, OperationResult::InsertOne(_)),
        OperationKind::InsertMany => matches!(result, OperationResult::InsertMany(_)),
        OperationKind::UpdateOne | OperationKind::UpdateMany | OperationKind::ReplaceOne => {
            matches!(result, OperationResult::Update(_))
        }
        OperationKind::DeleteOne | OperationKind::DeleteMany => {
            matches!(result, OperationResult::Delete(_))
        }
        OperationKind::Distinct => matches!(result, OperationResult::Values(_)),
    };

    if ok {
        Ok(())
    } else {
        Err(MeshError::invalid_operation(format!(
            "driver returned {} for {}",
            result.cardinality(),
            kind
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_non_executable_kinds_rejected() {
        for kind in OperationKind::ALL.iter().filter(|k| !k.is_executable()) {
            let err = validate(&Operation::new(*kind, "t")).unwrap_err();
            assert!(matches!(err, MeshError::UnsupportedOperation { .. }), "{}", kind);
        }
    }

    #[test]
    fn test_payload_validation() {
        let bad = Operation::new(OperationKind::InsertMany, "t").data(json!({"a": 1}));
        assert!(matches!(
            validate(&bad),
            Err(MeshError::InvalidOperation { .. })
        ));
        assert!(validate(&Operation::insert_many("t", vec![json!({"a": 1})])).is_ok());
        assert!(validate(&Operation::new(OperationKind::UpdateOne, "t")).is_err());
        assert!(validate(&Operation::find("t")).is_ok());
    }

    #[test]
    fn test_shape_mismatch_detected() {
        assert!(check_shape(OperationKind::Find, &OperationResult::Count(1)).is_err());
        assert!(check_shape(OperationKind::FindOne, &OperationResult::Document(None)).is_ok());
    }
}
