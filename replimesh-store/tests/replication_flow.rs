mod common;

use std::sync::Arc;

use serde_json::json;

use common::{assert_no_envelope, fixture, next_envelope, recording_channel, DATABASE};
use replimesh_core::{
    InstanceDirectory, InstanceId, MeshError, Operation, OperationKind, PoolConfig, Role,
};
use replimesh_store::{
    DatabaseExt, DatabaseHandle, DocumentDriver, ReplicationDispatcher, ReplicationEnvelope,
};

#[tokio::test]
async fn committed_transaction_replicates_writes_in_order() {
    let mut f = fixture();
    let a = InstanceId::new("A");

    let inserted = f
        .mesh
        .transaction(&a, Some(&[Role::Guardian]), |db| async move {
            db.insert_one("T", json!({"_id": "t-1", "status": "new"})).await?;
            db.find("T", json!({})).await?;
            db.update_one("T", json!({"_id": "t-1"}), json!({"$set": {"status": "done"}}))
                .await?;
            Ok("t-1")
        })
        .await
        .unwrap();
    assert_eq!(inserted, "t-1");

    let first = next_envelope(&mut f.envelopes).await;
    let second = next_envelope(&mut f.envelopes).await;
    assert_eq!(first.operation().kind, OperationKind::InsertOne);
    assert_eq!(first.operation().collection, "T");
    assert_eq!(second.operation().kind, OperationKind::UpdateOne);
    assert_eq!(first.destinations(), second.destinations());
    assert_eq!(first.destinations(), &[InstanceId::new("B")]);
    assert_no_envelope(&mut f.envelopes).await;

    let stored = f.driver.documents("memory://a", DATABASE, "T");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0]["status"], "done");
}

#[tokio::test]
async fn aborted_transaction_replicates_nothing() {
    let mut f = fixture();
    let a = InstanceId::new("A");

    let err = f
        .mesh
        .transaction(&a, None, |db| async move {
            db.insert_one("T", json!({"_id": 1})).await?;
            db.insert_one("T", json!({"_id": 2})).await?;
            Err::<(), _>(MeshError::invalid_operation("rejected by business rule"))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::InvalidOperation { .. }));

    assert_no_envelope(&mut f.envelopes).await;
    assert!(f.driver.documents("memory://a", DATABASE, "T").is_empty());
}

#[tokio::test]
async fn driver_error_inside_transaction_aborts() {
    let mut f = fixture();
    let a = InstanceId::new("A");

    let err = f
        .mesh
        .transaction(&a, None, |db| async move {
            db.insert_one("T", json!({"_id": 1})).await?;
            db.insert_one("T", json!({"_id": 1})).await?;
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::Driver(_)));
    assert_no_envelope(&mut f.envelopes).await;
}

#[tokio::test]
async fn write_affecting_two_roles_reaches_union_minus_source() {
    let mut f = fixture();
    f.mesh
        .write(
            &InstanceId::new("A"),
            &Operation::insert_one("notices", json!({"text": "meeting"})),
            Some(&[Role::Guardian, Role::AdministrativeStaff]),
        )
        .await
        .unwrap();

    let envelope = next_envelope(&mut f.envelopes).await;
    let mut targets = envelope.destinations().to_vec();
    targets.sort();
    assert_eq!(targets, vec![InstanceId::new("B"), InstanceId::new("C")]);
}

#[tokio::test]
async fn single_instance_role_sends_nothing() {
    let mut f = fixture();
    f.mesh
        .write(
            &InstanceId::new("A"),
            &Operation::insert_one("tutoring", json!({"note": "x"})),
            Some(&[Role::Tutor]),
        )
        .await
        .unwrap();
    assert_no_envelope(&mut f.envelopes).await;
}

#[tokio::test]
async fn omitted_affected_roles_means_every_role() {
    let mut f = fixture();
    f.mesh
        .write(
            &InstanceId::new("B"),
            &Operation::delete_many("notices", json!({})),
            None,
        )
        .await
        .unwrap();

    let envelope = next_envelope(&mut f.envelopes).await;
    let mut targets = envelope.destinations().to_vec();
    targets.sort();
    assert_eq!(targets, vec![InstanceId::new("A"), InstanceId::new("C")]);
}

#[tokio::test]
async fn dispatch_short_circuits_without_destinations() {
    let directory = Arc::new(
        InstanceDirectory::builder()
            .instance("solo", "memory://solo")
            .role(Role::Director, ["solo"])
            .build()
            .unwrap(),
    );
    let (channel, mut rx) = recording_channel();
    let dispatcher = Arc::new(ReplicationDispatcher::new(directory, channel));

    let delivered = dispatcher
        .spawn_dispatch(
            vec![Operation::insert_one("T", json!({}))],
            InstanceId::new("solo"),
            None,
        )
        .await
        .unwrap();
    assert!(delivered);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn awaited_write_has_delivered_before_returning() {
    let mut f = fixture();
    let (result, delivered) = f
        .mesh
        .write_and_wait(
            &InstanceId::new("A"),
            &Operation::insert_one("notices", json!({"text": "exam"})),
            Some(&[Role::Guardian]),
        )
        .await
        .unwrap();

    assert!(delivered);
    assert!(result.into_value().get("insertedId").is_some());
    let envelope = f.envelopes.try_recv().expect("envelope already delivered");
    assert_eq!(envelope.destinations(), &[InstanceId::new("B")]);
}

#[tokio::test]
async fn awaited_transaction_reports_delivery() {
    let mut f = fixture();
    let ((), delivered) = f
        .mesh
        .transaction_and_wait(&InstanceId::new("A"), Some(&[Role::AdministrativeStaff]), |db| async move {
            db.insert_one("T", json!({"_id": 1})).await?;
            db.delete_one("T", json!({"_id": 1})).await?;
            Ok(())
        })
        .await
        .unwrap();

    assert!(delivered);
    assert_eq!(f.envelopes.try_recv().unwrap().operation().kind, OperationKind::InsertOne);
    assert_eq!(f.envelopes.try_recv().unwrap().operation().kind, OperationKind::DeleteOne);
    assert!(f.envelopes.try_recv().is_err());
}

async fn replay_on_b(f: &common::Fixture, envelopes: &[ReplicationEnvelope]) {
    let replica = f
        .driver
        .connect("memory://b", &PoolConfig::default())
        .await
        .unwrap();
    for envelope in envelopes {
        replica
            .database(DATABASE)
            .run(envelope.operation())
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn replayed_insert_keeps_source_id() {
    let mut f = fixture();
    let (result, _) = f
        .mesh
        .write_and_wait(
            &InstanceId::new("A"),
            &Operation::insert_one("T", json!({"name": "Eva"})),
            Some(&[Role::Guardian]),
        )
        .await
        .unwrap();
    let inserted_id = result.into_value()["insertedId"].clone();
    assert!(inserted_id.is_string());

    let envelope = f.envelopes.try_recv().unwrap();
    assert_eq!(envelope.operation().data.as_ref().unwrap()["_id"], inserted_id);
    replay_on_b(&f, &[envelope]).await;

    let source = f.driver.documents("memory://a", DATABASE, "T");
    let replica = f.driver.documents("memory://b", DATABASE, "T");
    assert_eq!(replica.len(), 1);
    assert_eq!(source[0]["_id"], inserted_id);
    assert_eq!(replica[0]["_id"], inserted_id);
}

#[tokio::test]
async fn replayed_transaction_converges_on_ids() {
    let mut f = fixture();
    f.mesh
        .transaction_and_wait(&InstanceId::new("A"), Some(&[Role::Guardian]), |db| async move {
            db.insert_many("T", vec![json!({"name": "Eva"}), json!({"name": "Rui"})])
                .await?;
            db.run(
                &Operation::update_one("T", json!({"name": "Ines"}), json!({"$set": {"grade": 2}}))
                    .options(json!({"upsert": true})),
            )
            .await?;
            db.run(
                &Operation::replace_one("T", json!({"name": "Leo"}), json!({"name": "Leo", "grade": 4}))
                    .options(json!({"upsert": true})),
            )
            .await?;
            Ok(())
        })
        .await
        .unwrap();

    let mut envelopes = Vec::new();
    while let Ok(envelope) = f.envelopes.try_recv() {
        envelopes.push(envelope);
    }
    assert_eq!(envelopes.len(), 3);
    replay_on_b(&f, &envelopes).await;

    let source = f.driver.documents("memory://a", DATABASE, "T");
    let replica = f.driver.documents("memory://b", DATABASE, "T");
    assert_eq!(source.len(), 4);
    assert_eq!(source, replica);
}

#[tokio::test]
async fn replayed_upsert_keeps_source_id() {
    let mut f = fixture();
    let (result, _) = f
        .mesh
        .write_and_wait(
            &InstanceId::new("A"),
            &Operation::update_one("T", json!({"code": "X1"}), json!({"$inc": {"n": 1}}))
                .options(json!({"upsert": true})),
            Some(&[Role::Guardian]),
        )
        .await
        .unwrap();
    let upserted_id = result.as_update().unwrap().upserted_id.clone().unwrap();
    assert!(upserted_id.is_string());

    let envelope = f.envelopes.try_recv().unwrap();
    replay_on_b(&f, &[envelope]).await;
    assert_eq!(f.driver.documents("memory://b", DATABASE, "T")[0]["_id"], upserted_id);
}
