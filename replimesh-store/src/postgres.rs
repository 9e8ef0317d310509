//! Postgres document driver (`postgres` feature)
//!
//! Each logical database is a schema and each collection a table
//! `(seq bigserial, id text primary key, doc jsonb)`. Filters, updates and
//! pipelines run in Rust through the shared collection engine; only the
//! resulting delta is written back. Writes read their candidate rows with
//! `FOR UPDATE`. Standalone operations run in their own short transaction,
//! sessions hold a `REPEATABLE READ` transaction so a concurrent change
//! surfaces as a write conflict.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tracing::debug;

use replimesh_core::{
    redact_url, Document, DriverError, Operation, OperationKind, OperationResult, PoolConfig,
    Result,
};

use crate::driver::{DatabaseHandle, DocumentDriver, DriverClient, DriverSession};
use crate::engine;

type DriverResult<T> = std::result::Result<T, DriverError>;

/// SQLSTATE codes with a dedicated mapping
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";

fn map_sqlx(err: sqlx::Error) -> DriverError {
    match err {
        sqlx::Error::PoolTimedOut => DriverError::Timeout,
        sqlx::Error::PoolClosed => DriverError::Closed,
        sqlx::Error::Io(e) => DriverError::connection("postgres", e.to_string()),
        sqlx::Error::Tls(e) => DriverError::connection("postgres", e.to_string()),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) => DriverError::WriteConflict,
            Some(UNIQUE_VIOLATION) => DriverError::query(format!("duplicate key: {}", db.message())),
            _ => DriverError::query(db.message().to_string()),
        },
        other => DriverError::query(other.to_string()),
    }
}

/// Collection and database names become SQL identifiers
fn identifier(name: &str) -> DriverResult<String> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(DriverError::query(format!("invalid name '{}'", name)));
    }
    Ok(format!("\"{}\"", name))
}

fn id_key(id: &Value) -> String {
    id.to_string()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PgDocumentDriver;

impl PgDocumentDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DocumentDriver for PgDocumentDriver {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn connect(
        &self,
        url: &str,
        pool: &PoolConfig,
    ) -> DriverResult<Arc<dyn DriverClient>> {
        let connecting = PgPoolOptions::new()
            .max_connections(pool.max_pool_size)
            .min_connections(pool.min_pool_size)
            .idle_timeout(pool.max_idle_time())
            .acquire_timeout(pool.server_selection_timeout())
            .test_before_acquire(true)
            .connect(url);

        let pg = tokio::time::timeout(pool.connect_timeout(), connecting)
            .await
            .map_err(|_| DriverError::Timeout)?
            .map_err(|e| DriverError::connection(redact_url(url), e.to_string()))?;

        debug!(url = %redact_url(url), "postgres pool ready");
        Ok(Arc::new(PgClient { pool: pg }))
    }
}

struct PgClient {
    pool: PgPool,
}

#[async_trait]
impl DriverClient for PgClient {
    fn database(&self, name: &str) -> Arc<dyn DatabaseHandle> {
        Arc::new(PgDatabase {
            name: name.to_string(),
            pool: self.pool.clone(),
        })
    }

    async fn start_session(&self, database: &str) -> DriverResult<Box<dyn DriverSession>> {
        if self.pool.is_closed() {
            return Err(DriverError::Closed);
        }
        Ok(Box::new(PgSession {
            schema: database.to_string(),
            pool: self.pool.clone(),
            transaction: None,
            ended: false,
        }))
    }

    async fn close(&self) -> DriverResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

struct PgDatabase {
    name: String,
    pool: PgPool,
}

#[async_trait]
impl DatabaseHandle for PgDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, operation: &Operation) -> Result<OperationResult> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let result = run_in(&mut *tx, &self.name, operation).await?;
        tx.commit().await.map_err(map_sqlx)?;
        Ok(result)
    }
}

struct PgSession {
    schema: String,
    pool: PgPool,
    transaction: Option<Transaction<'static, Postgres>>,
    ended: bool,
}

#[async_trait]
impl DriverSession for PgSession {
    async fn start_transaction(&mut self) -> DriverResult<()> {
        if self.ended {
            return Err(DriverError::Closed);
        }
        if self.transaction.is_some() {
            return Err(DriverError::query("transaction already in progress"));
        }
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        sqlx::query("set transaction isolation level repeatable read")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        self.transaction = Some(tx);
        Ok(())
    }

    async fn run(&mut self, operation: &Operation) -> DriverResult<OperationResult> {
        if self.ended {
            return Err(DriverError::Closed);
        }
        match self.transaction.as_mut() {
            Some(tx) => run_in(&mut **tx, &self.schema, operation).await,
            None => {
                let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
                let result = run_in(&mut *tx, &self.schema, operation).await?;
                tx.commit().await.map_err(map_sqlx)?;
                Ok(result)
            }
        }
    }

    async fn commit_transaction(&mut self) -> DriverResult<()> {
        let tx = self
            .transaction
            .take()
            .ok_or_else(|| DriverError::query("no transaction in progress"))?;
        tx.commit().await.map_err(map_sqlx)
    }

    async fn abort_transaction(&mut self) -> DriverResult<()> {
        match self.transaction.take() {
            Some(tx) => tx.rollback().await.map_err(map_sqlx),
            None => Ok(()),
        }
    }

    async fn end_session(&mut self) {
        if let Some(tx) = self.transaction.take() {
            if let Err(e) = tx.rollback().await {
                debug!(error = %e, "rollback on session end failed");
            }
        }
        self.ended = true;
    }
}

async fn run_in(
    conn: &mut PgConnection,
    schema: &str,
    operation: &Operation,
) -> DriverResult<OperationResult> {
    let schema = identifier(schema)?;
    let table = format!("{}.{}", schema, identifier(&operation.collection)?);

    let exists = table_exists(conn, &table).await?;
    if !exists && operation.kind.is_read() {
        let mut empty = Vec::new();
        return Ok(engine::apply(&mut empty, operation)?.result);
    }
    if !exists {
        create_table(conn, &schema, &table).await?;
    }

    let inserting = matches!(
        operation.kind,
        OperationKind::InsertOne | OperationKind::InsertMany
    );
    // Inserts rely on the primary key for duplicate detection
    let mut docs = if inserting {
        Vec::new()
    } else {
        load(conn, &table, operation).await?
    };

    let applied = engine::apply(&mut docs, operation)?;

    for doc in &applied.written {
        let id = doc.get("_id").map(id_key).unwrap_or_default();
        let sql = if inserting {
            format!("insert into {} (id, doc) values ($1, $2)", table)
        } else {
            format!(
                "insert into {} (id, doc) values ($1, $2) \
                 on conflict (id) do update set doc = excluded.doc",
                table
            )
        };
        sqlx::query(&sql)
            .bind(id)
            .bind(Json(Value::Object(doc.clone())))
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx)?;
    }

    for id in &applied.removed {
        sqlx::query(&format!("delete from {} where id = $1", table))
            .bind(id_key(id))
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx)?;
    }

    Ok(applied.result)
}

async fn table_exists(conn: &mut PgConnection, table: &str) -> DriverResult<bool> {
    let row = sqlx::query("select to_regclass($1) is not null as present")
        .bind(table)
        .fetch_one(&mut *conn)
        .await
        .map_err(map_sqlx)?;
    Ok(row.get::<bool, _>("present"))
}

async fn create_table(conn: &mut PgConnection, schema: &str, table: &str) -> DriverResult<()> {
    sqlx::query(&format!("create schema if not exists {}", schema))
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx)?;
    sqlx::query(&format!(
        r#"
        create table if not exists {} (
            seq bigserial,
            id text primary key,
            doc jsonb not null
        )
        "#,
        table
    ))
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx)?;
    Ok(())
}

/// Select for [`load`]; writes lock the rows they read until commit
fn load_sql(table: &str, by_id: bool, for_write: bool) -> String {
    let mut sql = format!("select doc from {}", table);
    if by_id {
        sql.push_str(" where id = $1");
    }
    sql.push_str(" order by seq");
    if for_write {
        sql.push_str(" for update");
    }
    sql
}

/// Candidate documents in insertion order, narrowed by a plain `_id` filter
async fn load(
    conn: &mut PgConnection,
    table: &str,
    operation: &Operation,
) -> DriverResult<Vec<Document>> {
    let by_id = operation
        .filter
        .as_ref()
        .and_then(|f| f.get("_id"))
        .filter(|id| !id.is_object());
    let sql = load_sql(table, by_id.is_some(), operation.kind.is_write());

    let rows = match by_id {
        Some(id) => {
            sqlx::query(&sql)
                .bind(id_key(id))
                .fetch_all(&mut *conn)
                .await
        }
        None => sqlx::query(&sql).fetch_all(&mut *conn).await,
    }
    .map_err(map_sqlx)?;

    let mut docs = Vec::with_capacity(rows.len());
    for row in rows {
        let Json(value): Json<Value> = row.try_get("doc").map_err(map_sqlx)?;
        if let Value::Object(doc) = value {
            docs.push(doc);
        }
    }
    Ok(docs)
}
