//! Replication dispatcher
//!
//! Turns executed writes into envelopes for every instance that holds the
//! same data as the source. Delivery failures are logged and reported as
//! `false`, never as errors: the originating write has already succeeded.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use replimesh_core::config::DEFAULT_EVENT_TYPE;
use replimesh_core::{InstanceDirectory, InstanceId, Operation, Role};

use super::channel::ReplicationChannel;
use super::envelope::ReplicationEnvelope;

pub struct ReplicationDispatcher {
    directory: Arc<InstanceDirectory>,
    channel: Arc<dyn ReplicationChannel>,
    event_type: String,
}

impl ReplicationDispatcher {
    pub fn new(directory: Arc<InstanceDirectory>, channel: Arc<dyn ReplicationChannel>) -> Self {
        Self {
            directory,
            channel,
            event_type: DEFAULT_EVENT_TYPE.to_string(),
        }
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    /// Instances that must receive writes made on `source`.
    ///
    /// Absent or empty `affected_roles` means every configured role.
    pub fn destinations(&self, source: &InstanceId, affected_roles: Option<&[Role]>) -> Vec<InstanceId> {
        match affected_roles {
            Some(roles) if !roles.is_empty() => self.directory.affected_instances(roles, source),
            _ => self
                .directory
                .affected_instances(&self.directory.roles(), source),
        }
    }

    /// Deliver one envelope per operation, in order, to the shared destination set.
    ///
    /// Returns `true` when every delivery succeeded or there was nothing to send.
    pub async fn dispatch(
        &self,
        operations: &[Operation],
        source: &InstanceId,
        affected_roles: Option<&[Role]>,
    ) -> bool {
        let destinations = self.destinations(source, affected_roles);
        if destinations.is_empty() {
            debug!(source = %source, "no other instances to replicate to");
            return true;
        }
        if operations.is_empty() {
            return true;
        }

        let mut all_delivered = true;
        for operation in operations {
            let envelope =
                ReplicationEnvelope::now(&self.event_type, operation.clone(), destinations.clone());
            match self.channel.deliver(&envelope).await {
                Ok(()) => info!(
                    source = %source,
                    operation = %operation.kind,
                    collection = %operation.collection,
                    destinations = ?destinations,
                    "replication dispatched"
                ),
                Err(e) => {
                    all_delivered = false;
                    error!(
                        source = %source,
                        operation = %operation.kind,
                        collection = %operation.collection,
                        error = %e,
                        "replication dispatch failed"
                    );
                }
            }
        }
        all_delivered
    }

    /// Detached [`ReplicationDispatcher::dispatch`]. Callers normally drop the handle.
    pub fn spawn_dispatch(
        self: &Arc<Self>,
        operations: Vec<Operation>,
        source: InstanceId,
        affected_roles: Option<Vec<Role>>,
    ) -> JoinHandle<bool> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher
                .dispatch(&operations, &source, affected_roles.as_deref())
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::channel::ChannelError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<ReplicationEnvelope>>,
        reject: bool,
    }

    #[async_trait]
    impl ReplicationChannel for Recording {
        async fn deliver(&self, envelope: &ReplicationEnvelope) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push(envelope.clone());
            if self.reject {
                return Err(ChannelError::Rejected {
                    status: 401,
                    body: "Bad credentials".into(),
                });
            }
            Ok(())
        }
    }

    fn directory() -> Arc<InstanceDirectory> {
        Arc::new(
            InstanceDirectory::builder()
                .instance("A", "memory://a")
                .instance("B", "memory://b")
                .instance("C", "memory://c")
                .role(Role::Guardian, ["A", "B"])
                .role(Role::AdministrativeStaff, ["A", "C"])
                .role(Role::Tutor, ["A"])
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_single_instance_role_short_circuits() {
        let channel = Arc::new(Recording::default());
        let dispatcher = ReplicationDispatcher::new(directory(), channel.clone());
        let ok = dispatcher
            .dispatch(
                &[Operation::insert_one("t", json!({}))],
                &InstanceId::new("A"),
                Some(&[Role::Tutor]),
            )
            .await;
        assert!(ok);
        assert!(channel.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_roles_means_all_roles() {
        let channel = Arc::new(Recording::default());
        let dispatcher = ReplicationDispatcher::new(directory(), channel.clone());
        let ok = dispatcher
            .dispatch(&[Operation::delete_many("t", json!({}))], &InstanceId::new("B"), Some(&[]))
            .await;
        assert!(ok);

        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let mut targets = sent[0].destinations().to_vec();
        targets.sort();
        assert_eq!(targets, vec![InstanceId::new("A"), InstanceId::new("C")]);
    }

    #[tokio::test]
    async fn test_rejection_reports_false() {
        let channel = Arc::new(Recording {
            reject: true,
            ..Recording::default()
        });
        let dispatcher = ReplicationDispatcher::new(directory(), channel.clone())
            .with_event_type("custom-event");
        let ok = dispatcher
            .dispatch(
                &[Operation::insert_one("t", json!({})), Operation::insert_one("t", json!({}))],
                &InstanceId::new("A"),
                Some(&[Role::Guardian]),
            )
            .await;
        assert!(!ok);

        // Later envelopes are still attempted after a failure
        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].event_type, "custom-event");
    }
}
