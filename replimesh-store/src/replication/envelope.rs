use chrono::Utc;
use serde::{Deserialize, Serialize};

use replimesh_core::{InstanceId, Operation};

/// Body of one repository dispatch event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationEnvelope {
    pub event_type: String,
    pub client_payload: ReplicationPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationPayload {
    pub operation: Operation,
    pub destination_instances: Vec<InstanceId>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl ReplicationEnvelope {
    pub fn new(
        event_type: impl Into<String>,
        operation: Operation,
        destinations: Vec<InstanceId>,
        timestamp: i64,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            client_payload: ReplicationPayload {
                operation,
                destination_instances: destinations,
                timestamp,
            },
        }
    }

    /// Envelope stamped with the current time
    pub fn now(event_type: impl Into<String>, operation: Operation, destinations: Vec<InstanceId>) -> Self {
        Self::new(event_type, operation, destinations, Utc::now().timestamp_millis())
    }

    pub fn operation(&self) -> &Operation {
        &self.client_payload.operation
    }

    pub fn destinations(&self) -> &[InstanceId] {
        &self.client_payload.destination_instances
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let op = Operation::update_one("students", json!({"_id": 4}), json!({"$set": {"grade": 2}}));
        let envelope = ReplicationEnvelope::new(
            "mongodb-replication",
            op,
            vec![InstanceId::new("ins2"), InstanceId::new("ins3")],
            1_700_000_000_000,
        );

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "event_type": "mongodb-replication",
                "client_payload": {
                    "operation": {
                        "operation": "updateOne",
                        "collection": "students",
                        "filter": {"_id": 4},
                        "data": {"$set": {"grade": 2}}
                    },
                    "destinationInstances": ["ins2", "ins3"],
                    "timestamp": 1_700_000_000_000i64
                }
            })
        );
    }
}
