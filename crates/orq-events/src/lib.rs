//! Date-partitioned append-only event store.
//!
//! Two tables: `events` (domain events) and `raw_events` (inbound envelopes
//! awaiting mapping). Both are list-partitioned by the `YYYYMMDD` key of
//! their UTC timestamp; day partitions are created lazily on first write
//! and dropped wholesale for retention.
//!
//! Events are immutable; there is deliberately no update path here.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

use orq_schemas::{Event, RawEvent};

mod partition;

pub use partition::{partition_key_for, partition_keys_in_range, validate_partition_key};

/// Hard cap on query page size regardless of the caller's `limit`.
pub const MAX_QUERY_LIMIT: i64 = 10_000;

#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("event_type is required")]
    EventTypeRequired,
    #[error("invalid range: from {from} is after to {to}")]
    InvalidRange {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    #[error("invalid partition key: {0:?}")]
    InvalidPartitionKey(String),
    #[error("event already exists")]
    AlreadyExists,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

pub type EventResult<T> = Result<T, EventStoreError>;

// ---------------------------------------------------------------------------
// Append
// ---------------------------------------------------------------------------

/// Input for [`append_event`]. Zero `id` / missing `created_at` are filled
/// by the store (UUIDv4, now UTC).
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub id: Option<Uuid>,
    pub created_at: Option<DateTime<Utc>>,
    pub event_type: String,
    pub event_source: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub version: i32,
    pub data: Option<Value>,
    pub metadata: Option<Value>,
}

pub async fn append_event(pool: &PgPool, ev: NewEvent) -> EventResult<Event> {
    if ev.event_type.trim().is_empty() {
        return Err(EventStoreError::EventTypeRequired);
    }

    let id = ev.id.filter(|u| !u.is_nil()).unwrap_or_else(Uuid::new_v4);
    let created_at = ev.created_at.unwrap_or_else(Utc::now);
    let key = partition_key_for(created_at);
    ensure_partition_exists(pool, Table::Events, created_at).await?;

    let row = sqlx::query(
        r#"
        insert into events (
          id, created_at, event_type, event_source,
          aggregate_id, aggregate_type, version, data, metadata, partition_key
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8, $9, $10
        )
        returning nid
        "#,
    )
    .bind(id)
    .bind(created_at)
    .bind(&ev.event_type)
    .bind(&ev.event_source)
    .bind(&ev.aggregate_id)
    .bind(&ev.aggregate_type)
    .bind(ev.version)
    .bind(&ev.data)
    .bind(&ev.metadata)
    .bind(&key)
    .fetch_one(pool)
    .await
    .map_err(|e| {
        if orq_db::is_unique_violation(&e) {
            EventStoreError::AlreadyExists
        } else {
            EventStoreError::Db(e)
        }
    })?;

    let nid: i64 = row.try_get("nid")?;

    Ok(Event {
        id,
        nid,
        created_at,
        event_type: ev.event_type,
        event_source: ev.event_source,
        aggregate_id: ev.aggregate_id,
        aggregate_type: ev.aggregate_type,
        version: ev.version,
        data: ev.data,
        metadata: ev.metadata,
        partition_key: key,
    })
}

/// Input for [`append_raw_event`].
#[derive(Debug, Clone)]
pub struct NewRawEvent {
    pub path: String,
    pub headers: Value,
    pub payload: Option<Value>,
}

/// Append one inbound envelope; returns the stored row including the
/// generated `nid`.
pub async fn append_raw_event(pool: &PgPool, raw: NewRawEvent) -> EventResult<RawEvent> {
    let id = Uuid::new_v4();
    let received_at = Utc::now();
    let key = partition_key_for(received_at);
    ensure_partition_exists(pool, Table::RawEvents, received_at).await?;

    let row = sqlx::query(
        r#"
        insert into raw_events (id, received_at, path, headers, payload, partition_key)
        values ($1, $2, $3, $4, $5, $6)
        returning nid
        "#,
    )
    .bind(id)
    .bind(received_at)
    .bind(&raw.path)
    .bind(&raw.headers)
    .bind(&raw.payload)
    .bind(&key)
    .fetch_one(pool)
    .await?;

    let nid: i64 = row.try_get("nid")?;

    Ok(RawEvent {
        id,
        nid,
        received_at,
        path: raw.path,
        headers: raw.headers,
        payload: raw.payload,
        partition_key: key,
    })
}

// ---------------------------------------------------------------------------
// Partitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Events,
    RawEvents,
}

impl Table {
    fn name(&self) -> &'static str {
        match self {
            Table::Events => "events",
            Table::RawEvents => "raw_events",
        }
    }
}

/// Idempotently create the day partition containing `ts`.
///
/// The key is validated against the eight-digit whitelist before it is
/// formatted into the partition-table name.
pub async fn ensure_partition_exists(
    pool: &PgPool,
    table: Table,
    ts: DateTime<Utc>,
) -> EventResult<()> {
    let key = partition_key_for(ts);
    validate_partition_key(&key)?;

    let ddl = format!(
        "create table if not exists {table}_{key} partition of {table} for values in ('{key}')",
        table = table.name(),
        key = key,
    );
    sqlx::query(&ddl).execute(pool).await?;
    Ok(())
}

/// Drop the day partition containing `ts` (retention). Missing partitions
/// are fine.
pub async fn drop_partition(pool: &PgPool, table: Table, ts: DateTime<Utc>) -> EventResult<()> {
    let key = partition_key_for(ts);
    validate_partition_key(&key)?;

    let ddl = format!(
        "drop table if exists {table}_{key}",
        table = table.name(),
        key = key,
    );
    sqlx::query(&ddl).execute(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

fn clamp_limit(limit: i64) -> i64 {
    limit.clamp(1, MAX_QUERY_LIMIT)
}

fn event_from_row(row: &sqlx::postgres::PgRow) -> EventResult<Event> {
    Ok(Event {
        id: row.try_get("id")?,
        nid: row.try_get("nid")?,
        created_at: row.try_get("created_at")?,
        event_type: row.try_get("event_type")?,
        event_source: row.try_get("event_source")?,
        aggregate_id: row.try_get("aggregate_id")?,
        aggregate_type: row.try_get("aggregate_type")?,
        version: row.try_get("version")?,
        data: row.try_get("data")?,
        metadata: row.try_get("metadata")?,
        partition_key: row.try_get("partition_key")?,
    })
}

const EVENT_COLUMNS: &str = "id, nid, created_at, event_type, event_source, \
     aggregate_id, aggregate_type, version, data, metadata, partition_key";

/// Events of one type scoped to one aggregate, newest first.
pub async fn get_events_by_aggregate(
    pool: &PgPool,
    event_type: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    aggregate_type: &str,
    aggregate_id: &str,
    limit: i64,
) -> EventResult<Vec<Event>> {
    let keys = partition_keys_in_range(from, to)?;
    let rows = sqlx::query(&format!(
        r#"
        select {EVENT_COLUMNS}
        from events
        where partition_key = any($1)
          and created_at between $2 and $3
          and event_type = $4
          and aggregate_type = $5
          and aggregate_id = $6
        order by created_at desc, version desc
        limit $7
        "#
    ))
    .bind(&keys)
    .bind(from)
    .bind(to)
    .bind(event_type)
    .bind(aggregate_type)
    .bind(aggregate_id)
    .bind(clamp_limit(limit))
    .fetch_all(pool)
    .await?;

    rows.iter().map(event_from_row).collect()
}

/// Events of one type in a time range, newest first.
pub async fn get_events_by_type(
    pool: &PgPool,
    event_type: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    limit: i64,
) -> EventResult<Vec<Event>> {
    let keys = partition_keys_in_range(from, to)?;
    let rows = sqlx::query(&format!(
        r#"
        select {EVENT_COLUMNS}
        from events
        where partition_key = any($1)
          and created_at between $2 and $3
          and event_type = $4
        order by created_at desc, version desc
        limit $5
        "#
    ))
    .bind(&keys)
    .bind(from)
    .bind(to)
    .bind(event_type)
    .bind(clamp_limit(limit))
    .fetch_all(pool)
    .await?;

    rows.iter().map(event_from_row).collect()
}

/// Events from one source in a time range, newest first.
pub async fn get_events_by_source(
    pool: &PgPool,
    event_source: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    limit: i64,
) -> EventResult<Vec<Event>> {
    let keys = partition_keys_in_range(from, to)?;
    let rows = sqlx::query(&format!(
        r#"
        select {EVENT_COLUMNS}
        from events
        where partition_key = any($1)
          and created_at between $2 and $3
          and event_source = $4
        order by created_at desc, version desc
        limit $5
        "#
    ))
    .bind(&keys)
    .bind(from)
    .bind(to)
    .bind(event_source)
    .bind(clamp_limit(limit))
    .fetch_all(pool)
    .await?;

    rows.iter().map(event_from_row).collect()
}

/// Distinct event types seen in a time range.
pub async fn get_event_types_in_range(
    pool: &PgPool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> EventResult<Vec<String>> {
    let keys = partition_keys_in_range(from, to)?;
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        select distinct event_type
        from events
        where partition_key = any($1)
          and created_at between $2 and $3
        order by event_type
        "#,
    )
    .bind(&keys)
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(t,)| t).collect())
}

/// Maintenance delete for one event type in a range. Returns rows removed.
/// Inverted ranges are refused before any SQL runs.
pub async fn delete_events_by_type_in_range(
    pool: &PgPool,
    event_type: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> EventResult<u64> {
    if from > to {
        return Err(EventStoreError::InvalidRange { from, to });
    }
    let keys = partition_keys_in_range(from, to)?;

    let res = sqlx::query(
        r#"
        delete from events
        where partition_key = any($1)
          and created_at between $2 and $3
          and event_type = $4
        "#,
    )
    .bind(&keys)
    .bind(from)
    .bind(to)
    .bind(event_type)
    .execute(pool)
    .await?;

    Ok(res.rows_affected())
}
