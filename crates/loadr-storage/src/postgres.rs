//! Postgres-backed store. One database transaction per delivery, serialized
//! per pipeline with a transaction-scoped advisory lock.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use loadr_core::{
    event_log_table, sha256_hex, truncate_micros, BusinessKey, ChangeApplied, ChangeOutcome, ChangeSummary, Column,
    ColumnType, ContentHash, DeliveryId, EventId, EventLogEntry, EventType, FieldValue, LatestRow, LoaderError,
    LoaderResult, OwnerId, PipelineSchema, ValueFields,
};
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info, instrument, warn};

use crate::{check_sequence, entity_schema, table_columns, DeliveryRecord, DeliveryTx, LoaderStore};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 1,
            acquire_timeout_secs: 30,
            idle_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    pipeline: &'static PipelineSchema,
}

impl PgStore {
    pub async fn connect(
        database_url: &str,
        pipeline: &'static PipelineSchema,
        config: PoolConfig,
    ) -> LoaderResult<Self> {
        if config.max_connections == 0 || config.max_connections < config.min_connections {
            return Err(LoaderError::Store {
                message: "max_connections must be >= min_connections and > 0".to_string(),
                source: None,
            });
        }
        let mut opts = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs));
        if let Some(idle) = config.idle_timeout_secs {
            opts = opts.idle_timeout(Duration::from_secs(idle));
        }
        let pool = opts
            .connect(database_url)
            .await
            .map_err(|err| LoaderError::store("connecting to target database", err))?;
        Ok(Self::from_pool(pool, pipeline))
    }

    pub fn from_pool(pool: PgPool, pipeline: &'static PipelineSchema) -> Self {
        Self { pool, pipeline }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the watermark table, event sequence and business tables if absent.
    #[instrument(skip(self), fields(pipeline = self.pipeline.name))]
    pub async fn migrate(&self) -> LoaderResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| LoaderError::store("opening migration transaction", err))?;
        for statement in pipeline_ddl(self.pipeline) {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(|err| LoaderError::store(format!("running `{statement}`"), err))?;
        }
        tx.commit()
            .await
            .map_err(|err| LoaderError::store("committing migration", err))?;
        info!("schema up to date");
        Ok(())
    }
}

#[async_trait]
impl LoaderStore for PgStore {
    fn pipeline(&self) -> &'static PipelineSchema {
        self.pipeline
    }

    async fn last_delivery(&self) -> LoaderResult<Option<DeliveryId>> {
        let sql = format!("SELECT MAX(delivery_id) FROM {}", self.pipeline.watermark_table());
        let last: Option<i64> = sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| LoaderError::store("reading watermark", err))?;
        Ok(last.map(DeliveryId))
    }

    async fn deliveries(&self, limit: usize) -> LoaderResult<Vec<DeliveryRecord>> {
        let sql = format!(
            "SELECT delivery_id, delivery_ts, runtime, summary FROM {} ORDER BY delivery_id DESC LIMIT $1",
            self.pipeline.watermark_table()
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|err| LoaderError::store("listing deliveries", err))?;
        rows.iter()
            .map(decode_delivery)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| LoaderError::store("decoding delivery row", err))
    }

    async fn latest(&self, entity: &str, key: &BusinessKey) -> LoaderResult<Option<LatestRow>> {
        let schema = entity_schema(self.pipeline, entity)?;
        schema.check_key(key)?;
        let sql = select_latest_sql(schema.table(), schema.key, schema.values, false);
        let mut query = sqlx::query(&sql);
        for (column, part) in schema.key.iter().zip(key.parts()) {
            query = bind_value(query, column.ty, part);
        }
        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| LoaderError::store(format!("reading {entity}"), err))?;
        row.map(|row| decode_latest(&row, key, schema.values))
            .transpose()
            .map_err(|err| LoaderError::store(format!("decoding {entity} row"), err))
    }

    async fn current_checkpoint(&self, owner_id: OwnerId) -> LoaderResult<Option<DateTime<Utc>>> {
        let sql = checkpoint_sql(self.pipeline, false);
        let stored: Option<Option<DateTime<Utc>>> = sqlx::query_scalar(&sql)
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| LoaderError::store("reading checkpoint", err))?;
        Ok(stored.flatten())
    }

    async fn events(&self, table: &str, since: EventId) -> LoaderResult<Vec<EventLogEntry>> {
        let (key_columns, value_columns) = table_columns(self.pipeline, table)?;
        let sql = format!(
            "SELECT * FROM {} WHERE event_id > $1 ORDER BY event_id",
            event_log_table(table)
        );
        let rows = sqlx::query(&sql)
            .bind(since.0)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| LoaderError::store(format!("reading {table} event log"), err))?;
        rows.iter()
            .map(|row| decode_event(row, &key_columns, &value_columns))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| LoaderError::store(format!("decoding {table} event log"), err))
    }

    #[instrument(skip(self), fields(pipeline = self.pipeline.name))]
    async fn begin(&self, delivery_id: DeliveryId) -> LoaderResult<Box<dyn DeliveryTx>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| LoaderError::store("opening delivery transaction", err))?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(advisory_lock_key(self.pipeline))
            .execute(&mut *tx)
            .await
            .map_err(|err| LoaderError::store("acquiring pipeline lock", err))?;

        let watermark = self.pipeline.watermark_table();
        let last: Option<i64> = sqlx::query_scalar(&format!("SELECT MAX(delivery_id) FROM {watermark}"))
            .fetch_one(&mut *tx)
            .await
            .map_err(|err| LoaderError::store("reading watermark", err))?;
        let recorded = delivery_recorded(&mut tx, &watermark, delivery_id).await?;
        check_sequence(self.pipeline, last.map(DeliveryId), recorded, delivery_id)?;

        debug!("delivery transaction opened");
        Ok(Box::new(PgTx {
            pipeline: self.pipeline,
            delivery_id,
            tx,
        }))
    }
}

struct PgTx {
    pipeline: &'static PipelineSchema,
    delivery_id: DeliveryId,
    tx: Transaction<'static, Postgres>,
}

impl PgTx {
    async fn check_reference(&mut self, table: &str, delivery_id: DeliveryId) -> LoaderResult<()> {
        if delivery_id == self.delivery_id {
            return Ok(());
        }
        let watermark = self.pipeline.watermark_table();
        if delivery_recorded(&mut self.tx, &watermark, delivery_id).await? {
            return Ok(());
        }
        Err(LoaderError::ReferentialIntegrity {
            entity: table.to_string(),
            delivery_id,
        })
    }

    /// Locks and returns the stored row for `key`.
    async fn locked_row(
        &mut self,
        table: &str,
        key_columns: &[Column],
        value_columns: &[Column],
        key: &BusinessKey,
    ) -> LoaderResult<Option<LatestRow>> {
        let sql = select_latest_sql(table, key_columns, value_columns, true);
        let mut query = sqlx::query(&sql);
        for (column, part) in key_columns.iter().zip(key.parts()) {
            query = bind_value(query, column.ty, part);
        }
        let row = query
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|err| LoaderError::store(format!("locking {table} row"), err))?;
        row.map(|row| decode_latest(&row, key, value_columns))
            .transpose()
            .map_err(|err| LoaderError::store(format!("decoding {table} row"), err))
    }

    async fn append_log(
        &mut self,
        table: &str,
        key_columns: &[Column],
        value_columns: &[Column],
        entry: &EventLogEntry,
    ) -> LoaderResult<()> {
        let sql = append_log_sql(table, key_columns, value_columns);
        let prev = entry.prev.as_ref();
        let mut query = sqlx::query(&sql)
            .bind(entry.event_id().0)
            .bind(entry.event_type.as_str())
            .bind(entry.delivery_id().0);
        query = bind_snapshot(query, key_columns, value_columns, Some(&entry.curr));
        query = query.bind(entry.curr.hash.0.clone()).bind(entry.curr.removed);
        query = bind_snapshot(query, key_columns, value_columns, prev);
        query
            .bind(prev.map(|row| row.hash.0.clone()))
            .bind(prev.map(|row| row.event_id.0))
            .bind(prev.map(|row| row.delivery_id.0))
            .bind(prev.map(|row| row.removed))
            .bind(entry.mask.clone())
            .execute(&mut *self.tx)
            .await
            .map_err(|err| map_write_error(&event_log_table(table), entry.delivery_id(), err))?;
        Ok(())
    }

    async fn upsert(
        &mut self,
        table: &str,
        key_columns: &[Column],
        key: &BusinessKey,
        value_columns: &[Column],
        values: &ValueFields,
        delivery_id: DeliveryId,
    ) -> LoaderResult<ChangeApplied> {
        let hash = values.content_hash();
        let existing = self.locked_row(table, key_columns, value_columns, key).await?;
        let (outcome, event_type) = match &existing {
            Some(row) if row.hash == hash && !row.removed => return Ok(ChangeApplied::unchanged(hash)),
            Some(row) if !row.removed => (ChangeOutcome::Amended, EventType::Amend),
            _ => (ChangeOutcome::Created, EventType::Create),
        };

        let sequence = self.pipeline.event_sequence();
        let sql = if existing.is_some() {
            update_sql(table, &sequence, key_columns, value_columns)
        } else {
            insert_sql(table, &sequence, key_columns, value_columns)
        };
        let mut query = sqlx::query(&sql);
        if existing.is_none() {
            for (column, part) in key_columns.iter().zip(key.parts()) {
                query = bind_value(query, column.ty, part);
            }
        }
        for column in value_columns {
            let value = values.get(column.name).unwrap_or(&FieldValue::Null);
            query = bind_value(query, column.ty, value);
        }
        query = query.bind(hash.0.clone()).bind(delivery_id.0);
        if existing.is_some() {
            for (column, part) in key_columns.iter().zip(key.parts()) {
                query = bind_value(query, column.ty, part);
            }
        }

        let event_id: i64 = query
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|err| map_write_error(table, delivery_id, err))?
            .try_get("event_id")
            .map_err(|err| LoaderError::store(format!("decoding {table} event id"), err))?;
        let curr = LatestRow {
            key: key.clone(),
            values: values.clone(),
            hash: hash.clone(),
            event_id: EventId(event_id),
            delivery_id,
            removed: false,
        };
        let entry = EventLogEntry::new(event_type, curr, existing, key_columns, value_columns);
        self.append_log(table, key_columns, value_columns, &entry).await?;
        Ok(ChangeApplied {
            outcome,
            event_id: Some(EventId(event_id)),
            hash,
        })
    }

    async fn stored_checkpoint(&mut self, owner_id: OwnerId) -> LoaderResult<Option<DateTime<Utc>>> {
        let sql = checkpoint_sql(self.pipeline, true);
        let stored: Option<Option<DateTime<Utc>>> = sqlx::query_scalar(&sql)
            .bind(owner_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|err| LoaderError::store("reading checkpoint", err))?;
        Ok(stored.flatten())
    }
}

#[async_trait]
impl DeliveryTx for PgTx {
    fn delivery_id(&self) -> DeliveryId {
        self.delivery_id
    }

    async fn apply_change(
        &mut self,
        entity: &str,
        key: &BusinessKey,
        values: &ValueFields,
        delivery_id: DeliveryId,
    ) -> LoaderResult<ChangeApplied> {
        let schema = entity_schema(self.pipeline, entity)?;
        schema.check_key(key)?;
        schema.check_values(values)?;
        self.check_reference(entity, delivery_id).await?;
        self.upsert(schema.table(), schema.key, key, schema.values, values, delivery_id)
            .await
    }

    async fn apply_removal(
        &mut self,
        entity: &str,
        key: &BusinessKey,
        delivery_id: DeliveryId,
    ) -> LoaderResult<ChangeApplied> {
        let schema = entity_schema(self.pipeline, entity)?;
        schema.check_key(key)?;
        self.check_reference(entity, delivery_id).await?;

        let table = schema.table();
        let prev = match self.locked_row(table, schema.key, schema.values, key).await? {
            None => return Ok(ChangeApplied::unchanged(ValueFields::new().content_hash())),
            Some(row) if row.removed => return Ok(ChangeApplied::unchanged(row.hash)),
            Some(row) => row,
        };
        let sql = remove_sql(table, &self.pipeline.event_sequence(), schema.key);
        let mut query = sqlx::query(&sql).bind(delivery_id.0);
        for (column, part) in schema.key.iter().zip(key.parts()) {
            query = bind_value(query, column.ty, part);
        }
        let event_id: i64 = query
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|err| map_write_error(table, delivery_id, err))?
            .try_get("event_id")
            .map_err(|err| LoaderError::store(format!("decoding {table} event id"), err))?;
        let curr = LatestRow {
            event_id: EventId(event_id),
            delivery_id,
            removed: true,
            ..prev.clone()
        };
        let hash = curr.hash.clone();
        let entry = EventLogEntry::new(EventType::Remove, curr, Some(prev), schema.key, schema.values);
        self.append_log(table, schema.key, schema.values, &entry).await?;
        Ok(ChangeApplied {
            outcome: ChangeOutcome::Removed,
            event_id: Some(EventId(event_id)),
            hash,
        })
    }

    async fn current_checkpoint(&mut self, owner_id: OwnerId) -> LoaderResult<Option<DateTime<Utc>>> {
        self.stored_checkpoint(owner_id).await
    }

    async fn advance_checkpoint(
        &mut self,
        owner_id: OwnerId,
        timestamp: DateTime<Utc>,
        delivery_id: DeliveryId,
    ) -> LoaderResult<ChangeApplied> {
        let control = self.pipeline.control;
        let timestamp = truncate_micros(timestamp);
        self.check_reference(control.table, delivery_id).await?;
        if let Some(stored) = self.stored_checkpoint(owner_id).await? {
            if timestamp < stored {
                return Err(LoaderError::Regression {
                    owner_id,
                    stored,
                    proposed: timestamp,
                });
            }
        }
        let key_columns = control.key_columns();
        let value_columns = control.value_columns();
        let key = BusinessKey::new([FieldValue::Int(owner_id)]);
        self.upsert(
            control.table,
            &key_columns,
            &key,
            &value_columns,
            &control.values_for(timestamp),
            delivery_id,
        )
        .await
    }

    async fn record_delivery(
        self: Box<Self>,
        delivery_ts: DateTime<Utc>,
        runtime: TimeDelta,
        summary: &ChangeSummary,
    ) -> LoaderResult<DeliveryRecord> {
        let PgTx {
            pipeline,
            delivery_id,
            mut tx,
        } = *self;
        let watermark = pipeline.watermark_table();
        let sql = format!(
            "INSERT INTO {watermark} (delivery_id, delivery_ts, runtime, summary) VALUES ($1, $2, $3, $4)"
        );
        sqlx::query(&sql)
            .bind(delivery_id.0)
            .bind(delivery_ts)
            .bind(runtime)
            .bind(Json(summary.clone()))
            .execute(&mut *tx)
            .await
            .map_err(|err| {
                if unique_violation(&err) {
                    LoaderError::DuplicateDelivery {
                        pipeline: pipeline.name.to_string(),
                        delivery_id,
                    }
                } else {
                    map_write_error(&watermark, delivery_id, err)
                }
            })?;
        tx.commit()
            .await
            .map_err(|err| map_write_error(&watermark, delivery_id, err))?;
        debug!(pipeline = pipeline.name, %delivery_id, "delivery transaction committed");
        Ok(DeliveryRecord {
            delivery_id,
            delivery_ts,
            runtime,
            summary: Some(summary.clone()),
        })
    }

    async fn rollback(self: Box<Self>) -> LoaderResult<()> {
        let PgTx {
            pipeline,
            delivery_id,
            tx,
        } = *self;
        if let Err(err) = tx.rollback().await {
            warn!(pipeline = pipeline.name, %delivery_id, error = %err, "rollback failed");
            return Err(LoaderError::store("rolling back delivery", err));
        }
        debug!(pipeline = pipeline.name, %delivery_id, "delivery transaction rolled back");
        Ok(())
    }
}

async fn delivery_recorded(
    tx: &mut Transaction<'static, Postgres>,
    watermark: &str,
    delivery_id: DeliveryId,
) -> LoaderResult<bool> {
    let sql = format!("SELECT EXISTS (SELECT 1 FROM {watermark} WHERE delivery_id = $1)");
    sqlx::query_scalar(&sql)
        .bind(delivery_id.0)
        .fetch_one(&mut **tx)
        .await
        .map_err(|err| LoaderError::store("reading watermark", err))
}

/// DDL for one pipeline, in execution order. Every statement is idempotent.
pub fn pipeline_ddl(pipeline: &PipelineSchema) -> Vec<String> {
    let watermark = pipeline.watermark_table();
    let mut statements = vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {watermark} (\n    \
             delivery_id BIGINT PRIMARY KEY,\n    \
             delivery_ts TIMESTAMPTZ NOT NULL,\n    \
             runtime INTERVAL,\n    \
             summary JSONB\n)"
        ),
        format!("CREATE INDEX IF NOT EXISTS {watermark}_delivery_ts_idx ON {watermark} (delivery_ts)"),
        format!("CREATE SEQUENCE IF NOT EXISTS {}", pipeline.event_sequence()),
    ];
    for entity in pipeline.entities {
        statements.push(table_ddl(entity.table(), &watermark, entity.key, entity.values));
        statements.push(event_log_ddl(entity.table(), &watermark, entity.key, entity.values));
    }
    let control = pipeline.control;
    let (key_columns, value_columns) = (control.key_columns(), control.value_columns());
    statements.push(table_ddl(control.table, &watermark, &key_columns, &value_columns));
    statements.push(event_log_ddl(control.table, &watermark, &key_columns, &value_columns));
    statements
}

fn table_ddl(table: &str, watermark: &str, key_columns: &[Column], value_columns: &[Column]) -> String {
    let mut lines: Vec<String> = key_columns
        .iter()
        .map(|c| format!("{} {} NOT NULL", c.name, c.ty.sql()))
        .collect();
    lines.extend(value_columns.iter().map(|c| format!("{} {}", c.name, c.ty.sql())));
    lines.push("hash VARCHAR NOT NULL".to_string());
    lines.push("event_id BIGINT NOT NULL UNIQUE".to_string());
    lines.push(format!(
        "delivery_id BIGINT NOT NULL REFERENCES {watermark} (delivery_id) DEFERRABLE INITIALLY DEFERRED"
    ));
    lines.push("removed BOOLEAN NOT NULL DEFAULT FALSE".to_string());
    lines.push(format!("PRIMARY KEY ({})", column_list(key_columns)));
    format!("CREATE TABLE IF NOT EXISTS {table} (\n    {}\n)", lines.join(",\n    "))
}

/// Append-only history: the row after each change, the row before it and
/// the change mask.
fn event_log_ddl(table: &str, watermark: &str, key_columns: &[Column], value_columns: &[Column]) -> String {
    let mut lines = vec![
        "event_id BIGINT PRIMARY KEY".to_string(),
        "event_type VARCHAR NOT NULL".to_string(),
        format!("delivery_id BIGINT NOT NULL REFERENCES {watermark} (delivery_id) DEFERRABLE INITIALLY DEFERRED"),
    ];
    lines.extend(key_columns.iter().map(|c| format!("curr_{} {} NOT NULL", c.name, c.ty.sql())));
    lines.extend(value_columns.iter().map(|c| format!("curr_{} {}", c.name, c.ty.sql())));
    lines.push("curr_hash VARCHAR NOT NULL".to_string());
    lines.push("curr_removed BOOLEAN NOT NULL".to_string());
    lines.extend(
        key_columns
            .iter()
            .chain(value_columns)
            .map(|c| format!("prev_{} {}", c.name, c.ty.sql())),
    );
    lines.push("prev_hash VARCHAR".to_string());
    lines.push("prev_event_id BIGINT".to_string());
    lines.push("prev_delivery_id BIGINT".to_string());
    lines.push("prev_removed BOOLEAN".to_string());
    lines.push("mask VARCHAR NOT NULL".to_string());
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        event_log_table(table),
        lines.join(",\n    ")
    )
}

fn column_list(columns: &[Column]) -> String {
    columns.iter().map(|c| c.name).collect::<Vec<_>>().join(", ")
}

fn key_predicate(key_columns: &[Column], first_placeholder: usize) -> String {
    key_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ${}", c.name, first_placeholder + i))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn select_latest_sql(table: &str, key_columns: &[Column], value_columns: &[Column], lock: bool) -> String {
    let mut select = column_list(value_columns);
    if !select.is_empty() {
        select.push_str(", ");
    }
    format!(
        "SELECT {select}hash, event_id, delivery_id, removed FROM {table} WHERE {}{}",
        key_predicate(key_columns, 1),
        if lock { " FOR UPDATE" } else { "" }
    )
}

fn append_log_sql(table: &str, key_columns: &[Column], value_columns: &[Column]) -> String {
    let data: Vec<&str> = key_columns.iter().chain(value_columns).map(|c| c.name).collect();
    let mut columns = vec![
        "event_id".to_string(),
        "event_type".to_string(),
        "delivery_id".to_string(),
    ];
    columns.extend(data.iter().map(|name| format!("curr_{name}")));
    columns.extend(["curr_hash".to_string(), "curr_removed".to_string()]);
    columns.extend(data.iter().map(|name| format!("prev_{name}")));
    columns.extend(
        ["prev_hash", "prev_event_id", "prev_delivery_id", "prev_removed", "mask"].map(String::from),
    );
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        event_log_table(table),
        columns.join(", "),
        placeholders.join(", ")
    )
}

fn insert_sql(table: &str, sequence: &str, key_columns: &[Column], value_columns: &[Column]) -> String {
    let data_columns = key_columns.len() + value_columns.len();
    let mut columns: Vec<&str> = key_columns.iter().chain(value_columns).map(|c| c.name).collect();
    columns.extend(["hash", "delivery_id", "event_id", "removed"]);
    let mut placeholders: Vec<String> = (1..=data_columns + 2).map(|i| format!("${i}")).collect();
    placeholders.push(format!("nextval('{sequence}')"));
    placeholders.push("FALSE".to_string());
    format!(
        "INSERT INTO {table} ({}) VALUES ({}) RETURNING event_id",
        columns.join(", "),
        placeholders.join(", ")
    )
}

fn update_sql(table: &str, sequence: &str, key_columns: &[Column], value_columns: &[Column]) -> String {
    let mut assignments: Vec<String> = value_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ${}", c.name, i + 1))
        .collect();
    let next = value_columns.len() + 1;
    assignments.push(format!("hash = ${next}"));
    assignments.push(format!("delivery_id = ${}", next + 1));
    assignments.push(format!("event_id = nextval('{sequence}')"));
    assignments.push("removed = FALSE".to_string());
    format!(
        "UPDATE {table} SET {} WHERE {} RETURNING event_id",
        assignments.join(", "),
        key_predicate(key_columns, next + 2)
    )
}

fn remove_sql(table: &str, sequence: &str, key_columns: &[Column]) -> String {
    format!(
        "UPDATE {table} SET removed = TRUE, event_id = nextval('{sequence}'), delivery_id = $1 WHERE {} RETURNING event_id",
        key_predicate(key_columns, 2)
    )
}

fn checkpoint_sql(pipeline: &PipelineSchema, lock: bool) -> String {
    let control = pipeline.control;
    format!(
        "SELECT {} FROM {} WHERE {} = $1{}",
        control.timestamp_column,
        control.table,
        control.owner_column,
        if lock { " FOR UPDATE" } else { "" }
    )
}

fn advisory_lock_key(pipeline: &PipelineSchema) -> i64 {
    let digest = sha256_hex(pipeline.name.as_bytes());
    i64::from_str_radix(&digest[..15], 16).unwrap_or_default()
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    ty: ColumnType,
    value: &FieldValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        FieldValue::Int(v) => query.bind(*v),
        FieldValue::Decimal(v) => query.bind(*v),
        FieldValue::Text(v) => query.bind(v.clone()),
        FieldValue::Bool(v) => query.bind(*v),
        FieldValue::Timestamp(v) => query.bind(*v),
        FieldValue::Date(v) => query.bind(*v),
        FieldValue::Null => match ty {
            ColumnType::BigInt => query.bind(None::<i64>),
            ColumnType::Numeric => query.bind(None::<Decimal>),
            ColumnType::Text => query.bind(None::<String>),
            ColumnType::Boolean => query.bind(None::<bool>),
            ColumnType::Timestamptz => query.bind(None::<DateTime<Utc>>),
            ColumnType::Date => query.bind(None::<NaiveDate>),
        },
    }
}

/// Binds the key then value columns of `row`, or NULLs when there is none.
fn bind_snapshot<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    key_columns: &[Column],
    value_columns: &[Column],
    row: Option<&LatestRow>,
) -> Query<'q, Postgres, PgArguments> {
    for (i, column) in key_columns.iter().enumerate() {
        let value = row.and_then(|r| r.key.parts().get(i)).unwrap_or(&FieldValue::Null);
        query = bind_value(query, column.ty, value);
    }
    for column in value_columns {
        let value = row.and_then(|r| r.values.get(column.name)).unwrap_or(&FieldValue::Null);
        query = bind_value(query, column.ty, value);
    }
    query
}

fn decode_value(row: &PgRow, name: &str, ty: ColumnType) -> Result<FieldValue, sqlx::Error> {
    let value = match ty {
        ColumnType::BigInt => row.try_get::<Option<i64>, _>(name)?.map(FieldValue::Int),
        ColumnType::Numeric => row.try_get::<Option<Decimal>, _>(name)?.map(FieldValue::Decimal),
        ColumnType::Text => row.try_get::<Option<String>, _>(name)?.map(FieldValue::Text),
        ColumnType::Boolean => row.try_get::<Option<bool>, _>(name)?.map(FieldValue::Bool),
        ColumnType::Timestamptz => row
            .try_get::<Option<DateTime<Utc>>, _>(name)?
            .map(FieldValue::Timestamp),
        ColumnType::Date => row.try_get::<Option<NaiveDate>, _>(name)?.map(FieldValue::Date),
    };
    Ok(value.unwrap_or(FieldValue::Null))
}

fn decode_latest(row: &PgRow, key: &BusinessKey, value_columns: &[Column]) -> Result<LatestRow, sqlx::Error> {
    let mut values = ValueFields::new();
    for column in value_columns {
        values.insert(column.name, decode_value(row, column.name, column.ty)?);
    }
    Ok(LatestRow {
        key: key.clone(),
        values,
        hash: ContentHash(row.try_get("hash")?),
        event_id: EventId(row.try_get("event_id")?),
        delivery_id: DeliveryId(row.try_get("delivery_id")?),
        removed: row.try_get("removed")?,
    })
}

fn decode_snapshot(
    row: &PgRow,
    prefix: &str,
    key_columns: &[Column],
    value_columns: &[Column],
) -> Result<(BusinessKey, ValueFields), sqlx::Error> {
    let mut parts = Vec::with_capacity(key_columns.len());
    for column in key_columns {
        parts.push(decode_value(row, &format!("{prefix}{}", column.name), column.ty)?);
    }
    let mut values = ValueFields::new();
    for column in value_columns {
        values.insert(
            column.name,
            decode_value(row, &format!("{prefix}{}", column.name), column.ty)?,
        );
    }
    Ok((BusinessKey::new(parts), values))
}

fn decode_event(row: &PgRow, key_columns: &[Column], value_columns: &[Column]) -> Result<EventLogEntry, sqlx::Error> {
    let raw_type: String = row.try_get("event_type")?;
    let event_type = EventType::parse(&raw_type)
        .ok_or_else(|| sqlx::Error::Decode(format!("unknown event type {raw_type}").into()))?;
    let (key, values) = decode_snapshot(row, "curr_", key_columns, value_columns)?;
    let curr = LatestRow {
        key,
        values,
        hash: ContentHash(row.try_get("curr_hash")?),
        event_id: EventId(row.try_get("event_id")?),
        delivery_id: DeliveryId(row.try_get("delivery_id")?),
        removed: row.try_get("curr_removed")?,
    };
    let prev_hash: Option<String> = row.try_get("prev_hash")?;
    let prev = match prev_hash {
        Some(hash) => {
            let (key, values) = decode_snapshot(row, "prev_", key_columns, value_columns)?;
            let prev_event_id: Option<i64> = row.try_get("prev_event_id")?;
            let prev_delivery_id: Option<i64> = row.try_get("prev_delivery_id")?;
            let prev_removed: Option<bool> = row.try_get("prev_removed")?;
            Some(LatestRow {
                key,
                values,
                hash: ContentHash(hash),
                event_id: EventId(prev_event_id.unwrap_or_default()),
                delivery_id: DeliveryId(prev_delivery_id.unwrap_or_default()),
                removed: prev_removed.unwrap_or(false),
            })
        }
        None => None,
    };
    Ok(EventLogEntry {
        event_type,
        curr,
        prev,
        mask: row.try_get("mask")?,
    })
}

fn decode_delivery(row: &PgRow) -> Result<DeliveryRecord, sqlx::Error> {
    let runtime: Option<sqlx::postgres::types::PgInterval> = row.try_get("runtime")?;
    let summary: Option<Json<ChangeSummary>> = row.try_get("summary")?;
    Ok(DeliveryRecord {
        delivery_id: DeliveryId(row.try_get("delivery_id")?),
        delivery_ts: row.try_get("delivery_ts")?,
        runtime: runtime.map(interval_to_delta).unwrap_or_else(TimeDelta::zero),
        summary: summary.map(|Json(summary)| summary),
    })
}

fn interval_to_delta(interval: sqlx::postgres::types::PgInterval) -> TimeDelta {
    let days = i64::from(interval.months) * 30 + i64::from(interval.days);
    TimeDelta::days(days) + TimeDelta::microseconds(interval.microseconds)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteFailure {
    Duplicate,
    MissingReference,
    /// The row itself is unacceptable; retrying cannot succeed.
    RejectedData,
    Other,
}

fn classify_sqlstate(code: &str) -> WriteFailure {
    match code {
        "23505" => WriteFailure::Duplicate,
        "23503" => WriteFailure::MissingReference,
        "23502" | "23514" => WriteFailure::RejectedData,
        code if code.starts_with("22") => WriteFailure::RejectedData,
        _ => WriteFailure::Other,
    }
}

fn sqlstate_of(err: &sqlx::Error) -> WriteFailure {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref().map_or(WriteFailure::Other, classify_sqlstate),
        _ => WriteFailure::Other,
    }
}

fn unique_violation(err: &sqlx::Error) -> bool {
    sqlstate_of(err) == WriteFailure::Duplicate
}

fn map_write_error(table: &str, delivery_id: DeliveryId, err: sqlx::Error) -> LoaderError {
    let message = match &err {
        sqlx::Error::Database(db) => db.message().to_string(),
        other => other.to_string(),
    };
    match sqlstate_of(&err) {
        WriteFailure::Duplicate => LoaderError::ConstraintViolation {
            entity: table.to_string(),
            message,
        },
        WriteFailure::MissingReference => LoaderError::ReferentialIntegrity {
            entity: table.to_string(),
            delivery_id,
        },
        WriteFailure::RejectedData => LoaderError::invalid(table, message),
        WriteFailure::Other => LoaderError::store(format!("writing {table}"), err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadr_core::schema::{ORDERS, PORTFOLIO, STRATEGY};

    #[test]
    fn ddl_covers_every_table_of_the_pipeline() {
        let ddl = pipeline_ddl(&PORTFOLIO);
        assert_eq!(ddl.len(), 3 + 2 * (PORTFOLIO.entities.len() + 1));
        assert!(ddl[0].starts_with("CREATE TABLE IF NOT EXISTS loader_portfolio ("));
        assert!(ddl[0].contains("delivery_id BIGINT PRIMARY KEY"));
        assert!(ddl[0].contains("runtime INTERVAL"));
        assert_eq!(ddl[2], "CREATE SEQUENCE IF NOT EXISTS event_id_portfolio_seq");

        let position = ddl
            .iter()
            .find(|s| s.starts_with("CREATE TABLE IF NOT EXISTS position_latest "))
            .unwrap();
        assert!(position.contains("portfolio_id BIGINT NOT NULL"));
        assert!(position.contains("wgt NUMERIC,"));
        assert!(position.contains("event_id BIGINT NOT NULL UNIQUE"));
        assert!(position.contains("REFERENCES loader_portfolio (delivery_id) DEFERRABLE INITIALLY DEFERRED"));
        assert!(position.contains("PRIMARY KEY (portfolio_id, asset_id)"));

        let control = ddl
            .iter()
            .find(|s| s.starts_with("CREATE TABLE IF NOT EXISTS portfolio_control "))
            .unwrap();
        assert!(control.contains("last_monitor_ts TIMESTAMPTZ,"));
    }

    #[test]
    fn every_table_gets_an_event_log() {
        let ddl = pipeline_ddl(&PORTFOLIO);
        for table in PORTFOLIO.entities.iter().map(|e| e.name).chain([PORTFOLIO.control.table]) {
            let prefix = format!("CREATE TABLE IF NOT EXISTS {table}_event_log (");
            assert!(ddl.iter().any(|s| s.starts_with(&prefix)), "{table}");
        }

        let log = ddl
            .iter()
            .find(|s| s.starts_with("CREATE TABLE IF NOT EXISTS position_latest_event_log "))
            .unwrap();
        assert!(log.contains("event_id BIGINT PRIMARY KEY"));
        assert!(log.contains("event_type VARCHAR NOT NULL"));
        assert!(log.contains("curr_asset_id VARCHAR NOT NULL"));
        assert!(log.contains("curr_wgt NUMERIC,"));
        assert!(log.contains("prev_asset_id VARCHAR,"));
        assert!(log.contains("prev_hash VARCHAR,"));
        assert!(log.contains("prev_event_id BIGINT,"));
        assert!(log.contains("mask VARCHAR NOT NULL"));
        assert!(log.contains("REFERENCES loader_portfolio (delivery_id) DEFERRABLE INITIALLY DEFERRED"));
    }

    #[test]
    fn event_log_insert_binds_curr_then_prev() {
        let control = STRATEGY.control;
        assert_eq!(
            append_log_sql(control.table, &control.key_columns(), &control.value_columns()),
            "INSERT INTO strategy_control_event_log (event_id, event_type, delivery_id, curr_strategy_id, \
             curr_last_decision_ts, curr_hash, curr_removed, prev_strategy_id, prev_last_decision_ts, prev_hash, \
             prev_event_id, prev_delivery_id, prev_removed, mask) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
        );
        assert!(select_latest_sql("strategy_config", &control.key_columns(), &[], true).ends_with(" FOR UPDATE"));
    }

    #[test]
    fn sqlstates_map_onto_the_error_taxonomy() {
        assert_eq!(classify_sqlstate("23505"), WriteFailure::Duplicate);
        assert_eq!(classify_sqlstate("23503"), WriteFailure::MissingReference);
        for code in ["22003", "22021", "22008", "22P02", "23502", "23514"] {
            assert_eq!(classify_sqlstate(code), WriteFailure::RejectedData, "{code}");
        }
        for code in ["40001", "57P01", "08006", "53300"] {
            assert_eq!(classify_sqlstate(code), WriteFailure::Other, "{code}");
        }
        assert!(!unique_violation(&sqlx::Error::RowNotFound));

        let err = map_write_error("position_latest", DeliveryId(2), sqlx::Error::PoolTimedOut);
        assert_eq!(err.disposition(), loadr_core::ErrorDisposition::Retry);
    }

    #[test]
    fn ddl_is_idempotent_for_all_pipelines() {
        for pipeline in [&PORTFOLIO, &STRATEGY, &ORDERS] {
            assert!(pipeline_ddl(pipeline).iter().all(|s| s.contains("IF NOT EXISTS")));
        }
    }

    #[test]
    fn write_statements_number_placeholders_in_bind_order() {
        let entity = PORTFOLIO.entity("portfolio_latest").unwrap();
        let keys = entity.key;
        let values = &entity.values[..2];

        assert_eq!(
            insert_sql("portfolio_latest", "event_id_portfolio_seq", keys, values),
            "INSERT INTO portfolio_latest (portfolio_id, portfolio_ts, long_notional, hash, delivery_id, event_id, removed) \
             VALUES ($1, $2, $3, $4, $5, nextval('event_id_portfolio_seq'), FALSE) RETURNING event_id"
        );
        assert_eq!(
            update_sql("portfolio_latest", "event_id_portfolio_seq", keys, values),
            "UPDATE portfolio_latest SET portfolio_ts = $1, long_notional = $2, hash = $3, delivery_id = $4, \
             event_id = nextval('event_id_portfolio_seq'), removed = FALSE WHERE portfolio_id = $5 RETURNING event_id"
        );
        assert_eq!(
            remove_sql("portfolio_latest", "event_id_portfolio_seq", keys),
            "UPDATE portfolio_latest SET removed = TRUE, event_id = nextval('event_id_portfolio_seq'), \
             delivery_id = $1 WHERE portfolio_id = $2 RETURNING event_id"
        );
    }

    #[test]
    fn checkpoint_reads_lock_inside_transactions() {
        assert_eq!(
            checkpoint_sql(&STRATEGY, true),
            "SELECT last_decision_ts FROM strategy_control WHERE strategy_id = $1 FOR UPDATE"
        );
        assert!(!checkpoint_sql(&STRATEGY, false).contains("FOR UPDATE"));
    }

    #[test]
    fn advisory_lock_keys_differ_per_pipeline() {
        let keys = [&PORTFOLIO, &STRATEGY, &ORDERS].map(advisory_lock_key);
        assert!(keys.iter().all(|k| *k > 0));
        assert_ne!(keys[0], keys[1]);
        assert_ne!(keys[1], keys[2]);
        assert_eq!(advisory_lock_key(&PORTFOLIO), keys[0]);
    }

    #[test]
    fn intervals_convert_to_time_deltas() {
        let interval = sqlx::postgres::types::PgInterval {
            months: 0,
            days: 1,
            microseconds: 1_500_000,
        };
        assert_eq!(
            interval_to_delta(interval),
            TimeDelta::days(1) + TimeDelta::milliseconds(1500)
        );
    }
}
