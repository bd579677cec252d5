//! Core domain model for the delivery loaders: ids, typed values, content
//! hashing, change outcomes and the per-delivery change summary.

pub mod schema;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use schema::{event_log_table, pipeline, Column, ColumnType, ControlSchema, EntitySchema, PipelineSchema, PIPELINES};

pub const CRATE_NAME: &str = "loadr-core";

/// Version of the value-tuple serialization fed into the content hash.
pub const VALUE_HASH_VERSION: u32 = 1;

/// Version of the outward notification payload.
pub const NOTIFICATION_SCHEMA_VERSION: u32 = 1;

/// Owner of a control row (portfolio id or strategy id).
pub type OwnerId = i64;

/// Sequence number of a delivery file; doubles as the watermark value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(pub i64);

impl DeliveryId {
    pub const FIRST: DeliveryId = DeliveryId(1);

    pub fn next(self) -> Self {
        DeliveryId(self.0 + 1)
    }

    /// Sequence expected after `last`; an empty pipeline starts at 1.
    pub fn after(last: Option<DeliveryId>) -> Self {
        last.map(Self::next).unwrap_or(Self::FIRST)
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier assigned to every Created/Amended/Removed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Typed column value. Floats are deliberately absent: numeric columns carry
/// exact decimals so that hashes are reproducible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Int(i64),
    Decimal(Decimal),
    Text(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Timestamp at the precision the target stores and the hash covers.
    pub fn timestamp(ts: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(truncate_micros(ts))
    }

    fn normalized(self) -> Self {
        match self {
            FieldValue::Timestamp(ts) => FieldValue::timestamp(ts),
            other => other,
        }
    }

    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            FieldValue::Null => None,
            FieldValue::Int(_) => Some(ColumnType::BigInt),
            FieldValue::Decimal(_) => Some(ColumnType::Numeric),
            FieldValue::Text(_) => Some(ColumnType::Text),
            FieldValue::Bool(_) => Some(ColumnType::Boolean),
            FieldValue::Timestamp(_) => Some(ColumnType::Timestamptz),
            FieldValue::Date(_) => Some(ColumnType::Date),
        }
    }

    /// `Null` fits any column; everything else must match the column type.
    pub fn fits(&self, ty: ColumnType) -> bool {
        self.column_type().map_or(true, |own| own == ty)
    }

    fn hash_tag(&self) -> char {
        match self {
            FieldValue::Null => 'n',
            FieldValue::Int(_) => 'i',
            FieldValue::Decimal(_) => 'd',
            FieldValue::Text(_) => 's',
            FieldValue::Bool(_) => 'b',
            FieldValue::Timestamp(_) => 't',
            FieldValue::Date(_) => 'D',
        }
    }

    fn canonical_repr(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::Int(v) => v.to_string(),
            FieldValue::Decimal(v) => v.normalize().to_string(),
            FieldValue::Text(v) => v.clone(),
            FieldValue::Bool(v) => v.to_string(),
            FieldValue::Timestamp(v) => v.to_rfc3339_opts(SecondsFormat::Micros, true),
            FieldValue::Date(v) => v.format("%Y-%m-%d").to_string(),
        }
    }

    /// Converts a JSON value from a delivery file into the column's type.
    pub fn from_json(ty: ColumnType, value: &JsonValue) -> Result<Self, FieldError> {
        if value.is_null() {
            return Ok(FieldValue::Null);
        }
        match ty {
            ColumnType::BigInt => match value {
                JsonValue::Number(n) => n.as_i64().map(FieldValue::Int).ok_or_else(|| mismatch(ty, value)),
                JsonValue::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(FieldValue::Int)
                    .map_err(|_| mismatch(ty, value)),
                _ => Err(mismatch(ty, value)),
            },
            ColumnType::Numeric => {
                let text = match value {
                    JsonValue::Number(n) => n.to_string(),
                    JsonValue::String(s) => s.trim().to_string(),
                    _ => return Err(mismatch(ty, value)),
                };
                Decimal::from_str(&text)
                    .or_else(|_| Decimal::from_scientific(&text))
                    .map(FieldValue::Decimal)
                    .map_err(|_| mismatch(ty, value))
            }
            ColumnType::Text => match value {
                JsonValue::String(s) => Ok(FieldValue::Text(s.clone())),
                _ => Err(mismatch(ty, value)),
            },
            ColumnType::Boolean => match value {
                JsonValue::Bool(b) => Ok(FieldValue::Bool(*b)),
                _ => Err(mismatch(ty, value)),
            },
            ColumnType::Timestamptz => match value {
                JsonValue::String(s) => parse_timestamp(s)
                    .map(FieldValue::Timestamp)
                    .ok_or_else(|| mismatch(ty, value)),
                _ => Err(mismatch(ty, value)),
            },
            ColumnType::Date => match value {
                JsonValue::String(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                    .map(FieldValue::Date)
                    .map_err(|_| mismatch(ty, value)),
                _ => Err(mismatch(ty, value)),
            },
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("NULL"),
            FieldValue::Text(v) => write!(f, "{v:?}"),
            other => f.write_str(&other.canonical_repr()),
        }
    }
}

/// Drops sub-microsecond digits; TIMESTAMPTZ keeps microseconds.
pub fn truncate_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

/// RFC 3339 first, then naive ISO forms interpreted as UTC.
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Some(truncate_micros(ts.with_timezone(&Utc)));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
        .map(|naive| truncate_micros(naive.and_utc()))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected {expected:?}, got {found}")]
pub struct FieldError {
    pub expected: ColumnType,
    pub found: String,
}

fn mismatch(expected: ColumnType, value: &JsonValue) -> FieldError {
    FieldError {
        expected,
        found: value.to_string(),
    }
}

/// Natural identifier of a row, in the entity's key-column order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct BusinessKey(pub Vec<FieldValue>);

impl BusinessKey {
    pub fn new(parts: impl IntoIterator<Item = FieldValue>) -> Self {
        Self(parts.into_iter().map(FieldValue::normalized).collect())
    }

    pub fn parts(&self) -> &[FieldValue] {
        &self.0
    }
}

impl fmt::Display for BusinessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{part}")?;
        }
        f.write_str(")")
    }
}

/// Versioned, name-sorted tuple of value columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValueFields {
    version: u32,
    fields: BTreeMap<String, FieldValue>,
}

impl Default for ValueFields {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueFields {
    pub fn new() -> Self {
        Self {
            version: VALUE_HASH_VERSION,
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value.normalized());
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Length-prefixed serialization, so no field boundary is ambiguous.
    pub fn canonical_string(&self) -> String {
        let mut out = format!("v{}", self.version);
        for (name, value) in &self.fields {
            let repr = value.canonical_repr();
            out.push_str(&format!(
                "|{}:{}={}:{}:{}",
                name.len(),
                name,
                value.hash_tag(),
                repr.len(),
                repr
            ));
        }
        out
    }

    pub fn content_hash(&self) -> ContentHash {
        ContentHash(sha256_hex(self.canonical_string().as_bytes()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Create,
    Amend,
    Remove,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Create => "CREATE",
            EventType::Amend => "AMEND",
            EventType::Remove => "REMOVE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CREATE" => Some(EventType::Create),
            "AMEND" => Some(EventType::Amend),
            "REMOVE" => Some(EventType::Remove),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOutcome {
    Created,
    Amended,
    Unchanged,
    Removed,
}

impl ChangeOutcome {
    pub fn event_type(self) -> Option<EventType> {
        match self {
            ChangeOutcome::Created => Some(EventType::Create),
            ChangeOutcome::Amended => Some(EventType::Amend),
            ChangeOutcome::Removed => Some(EventType::Remove),
            ChangeOutcome::Unchanged => None,
        }
    }
}

/// Result of one apply call; `event_id` is set iff the outcome mutated state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeApplied {
    pub outcome: ChangeOutcome,
    pub event_id: Option<EventId>,
    pub hash: ContentHash,
}

impl ChangeApplied {
    pub fn unchanged(hash: ContentHash) -> Self {
        Self {
            outcome: ChangeOutcome::Unchanged,
            event_id: None,
            hash,
        }
    }
}

/// Current stored state of one business key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LatestRow {
    pub key: BusinessKey,
    pub values: ValueFields,
    pub hash: ContentHash,
    pub event_id: EventId,
    pub delivery_id: DeliveryId,
    pub removed: bool,
}

/// One appended row of a `<table>_event_log`: the row after the change,
/// the row before it (none on first creation) and a per-column change mask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventLogEntry {
    pub event_type: EventType,
    pub curr: LatestRow,
    pub prev: Option<LatestRow>,
    pub mask: String,
}

impl EventLogEntry {
    pub fn new(
        event_type: EventType,
        curr: LatestRow,
        prev: Option<LatestRow>,
        key_columns: &[Column],
        value_columns: &[Column],
    ) -> Self {
        let mask = change_mask(
            event_type,
            key_columns.len(),
            value_columns,
            &curr.values,
            prev.as_ref().map(|row| &row.values),
        );
        Self {
            event_type,
            curr,
            prev,
            mask,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.curr.event_id
    }

    pub fn delivery_id(&self) -> DeliveryId {
        self.curr.delivery_id
    }
}

/// One digit per key column then per value column, `1` where the column
/// changed. Creations and removals mark every column.
pub fn change_mask(
    event_type: EventType,
    key_width: usize,
    value_columns: &[Column],
    curr: &ValueFields,
    prev: Option<&ValueFields>,
) -> String {
    let prev = match (event_type, prev) {
        (EventType::Amend, Some(prev)) => prev,
        _ => return "1".repeat(key_width + value_columns.len()),
    };
    let mut mask = "0".repeat(key_width);
    for column in value_columns {
        let changed = curr.get(column.name) != prev.get(column.name);
        mask.push(if changed { '1' } else { '0' });
    }
    mask
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCounts {
    #[serde(rename = "CREATE")]
    pub create: u64,
    #[serde(rename = "AMEND")]
    pub amend: u64,
    #[serde(rename = "REMOVE")]
    pub remove: u64,
}

impl EventCounts {
    pub fn total(&self) -> u64 {
        self.create + self.amend + self.remove
    }
}

/// Per-entity {CREATE, AMEND, REMOVE} counts for one delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub stats: BTreeMap<String, EventCounts>,
    pub max_event_id: Option<EventId>,
}

impl ChangeSummary {
    pub fn tally<'a, I>(outcomes: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a ChangeApplied)>,
    {
        let mut summary = Self::default();
        for (entity, applied) in outcomes {
            summary.record(entity, applied);
        }
        summary
    }

    /// Entities with only unchanged rows still get an all-zero entry.
    pub fn record(&mut self, entity: &str, applied: &ChangeApplied) {
        let counts = self.stats.entry(entity.to_string()).or_default();
        match applied.outcome.event_type() {
            Some(EventType::Create) => counts.create += 1,
            Some(EventType::Amend) => counts.amend += 1,
            Some(EventType::Remove) => counts.remove += 1,
            None => {}
        }
        if let Some(event_id) = applied.event_id {
            self.max_event_id = Some(self.max_event_id.map_or(event_id, |max| max.max(event_id)));
        }
    }

    pub fn total_changes(&self) -> u64 {
        self.stats.values().map(EventCounts::total).sum()
    }
}

/// Payload published once per committed delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryNotification {
    pub v: u32,
    pub data_source: String,
    pub pipeline: String,
    pub delivery_id: DeliveryId,
    pub host: String,
    pub timestamp: DateTime<Utc>,
    pub stats: BTreeMap<String, EventCounts>,
    pub max_event_id: Option<EventId>,
}

impl DeliveryNotification {
    pub fn new(
        data_source: impl Into<String>,
        pipeline: impl Into<String>,
        delivery_id: DeliveryId,
        host: impl Into<String>,
        timestamp: DateTime<Utc>,
        summary: &ChangeSummary,
    ) -> Self {
        Self {
            v: NOTIFICATION_SCHEMA_VERSION,
            data_source: data_source.into(),
            pipeline: pipeline.into(),
            delivery_id,
            host: host.into(),
            timestamp,
            stats: summary.stats.clone(),
            max_event_id: summary.max_event_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Log and move on without touching the watermark.
    Skip,
    /// Roll back the delivery; the next iteration reprocesses the same file.
    AbortDelivery,
    /// Transient; retry with the poll backoff in service mode.
    Retry,
    /// Needs manual review; stop the pipeline.
    Halt,
}

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("delivery {delivery_id} already recorded for pipeline {pipeline}")]
    DuplicateDelivery {
        pipeline: String,
        delivery_id: DeliveryId,
    },
    #[error("delivery {got} out of sequence for pipeline {pipeline} (expected {expected})")]
    OutOfSequence {
        pipeline: String,
        expected: DeliveryId,
        got: DeliveryId,
    },
    #[error("checkpoint of owner {owner_id} would regress from {stored} to {proposed}")]
    Regression {
        owner_id: OwnerId,
        stored: DateTime<Utc>,
        proposed: DateTime<Utc>,
    },
    #[error("constraint violation on {entity}: {message}")]
    ConstraintViolation { entity: String, message: String },
    #[error("{entity} references delivery {delivery_id}, which is not recorded")]
    ReferentialIntegrity {
        entity: String,
        delivery_id: DeliveryId,
    },
    #[error("invalid record for {entity}: {message}")]
    InvalidRecord { entity: String, message: String },
    #[error("source error: {message}")]
    Source {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
    #[error("store error: {message}")]
    Store {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl LoaderError {
    pub fn invalid(entity: impl Into<String>, message: impl Into<String>) -> Self {
        LoaderError::InvalidRecord {
            entity: entity.into(),
            message: message.into(),
        }
    }

    pub fn source<E>(message: impl Into<String>, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        LoaderError::Source {
            message: message.into(),
            source: Some(Box::new(err)),
        }
    }

    pub fn store<E>(message: impl Into<String>, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        LoaderError::Store {
            message: message.into(),
            source: Some(Box::new(err)),
        }
    }

    pub fn disposition(&self) -> ErrorDisposition {
        match self {
            LoaderError::DuplicateDelivery { .. } => ErrorDisposition::Skip,
            LoaderError::ConstraintViolation { .. } | LoaderError::ReferentialIntegrity { .. } => {
                ErrorDisposition::AbortDelivery
            }
            LoaderError::Source { .. } | LoaderError::Store { .. } => ErrorDisposition::Retry,
            LoaderError::Regression { .. }
            | LoaderError::OutOfSequence { .. }
            | LoaderError::InvalidRecord { .. } => ErrorDisposition::Halt,
        }
    }
}

pub type LoaderResult<T> = Result<T, LoaderError>;
