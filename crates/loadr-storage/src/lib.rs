//! Target-side persistence: watermark, latest-state and checkpoint stores.
//!
//! A delivery is applied through a [`DeliveryTx`] unit of work obtained from
//! [`LoaderStore::begin`]. Nothing the unit writes is visible to readers until
//! [`DeliveryTx::record_delivery`] commits it together with the watermark, so
//! a failed delivery never leaves the watermark ahead of the rows it guards.

mod memory;
mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use loadr_core::{
    BusinessKey, ChangeApplied, ChangeSummary, Column, DeliveryId, EventId, EventLogEntry, LatestRow, LoaderError,
    LoaderResult, OwnerId, PipelineSchema, ValueFields,
};

pub use memory::MemoryStore;
pub use postgres::{pipeline_ddl, PgStore, PoolConfig};

pub const CRATE_NAME: &str = "loadr-storage";

/// One recorded row of the `loader_<pipeline>` watermark table.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRecord {
    pub delivery_id: DeliveryId,
    pub delivery_ts: DateTime<Utc>,
    pub runtime: TimeDelta,
    pub summary: Option<ChangeSummary>,
}

#[async_trait]
pub trait LoaderStore: Send + Sync {
    fn pipeline(&self) -> &'static PipelineSchema;

    /// Highest recorded delivery id, or none for a fresh pipeline.
    async fn last_delivery(&self) -> LoaderResult<Option<DeliveryId>>;

    /// Most recent deliveries first.
    async fn deliveries(&self, limit: usize) -> LoaderResult<Vec<DeliveryRecord>>;

    async fn latest(&self, entity: &str, key: &BusinessKey) -> LoaderResult<Option<LatestRow>>;

    async fn current_checkpoint(&self, owner_id: OwnerId) -> LoaderResult<Option<DateTime<Utc>>>;

    /// Event log of a business or control table after `since`, oldest first.
    async fn events(&self, table: &str, since: EventId) -> LoaderResult<Vec<EventLogEntry>>;

    /// Opens the unit of work for `delivery_id`, which must be exactly the
    /// next sequence number after [`LoaderStore::last_delivery`].
    async fn begin(&self, delivery_id: DeliveryId) -> LoaderResult<Box<dyn DeliveryTx>>;
}

#[async_trait]
pub trait DeliveryTx: Send {
    fn delivery_id(&self) -> DeliveryId;

    /// Created for a new key, Amended when the value hash differs, Unchanged
    /// otherwise. A tombstoned row comes back as Created. Every change other
    /// than Unchanged appends one event log row.
    async fn apply_change(
        &mut self,
        entity: &str,
        key: &BusinessKey,
        values: &ValueFields,
        delivery_id: DeliveryId,
    ) -> LoaderResult<ChangeApplied>;

    /// Flags a live row as removed; absent or already removed rows are Unchanged.
    async fn apply_removal(
        &mut self,
        entity: &str,
        key: &BusinessKey,
        delivery_id: DeliveryId,
    ) -> LoaderResult<ChangeApplied>;

    async fn current_checkpoint(&mut self, owner_id: OwnerId) -> LoaderResult<Option<DateTime<Utc>>>;

    /// Fails with `Regression` when `timestamp` is earlier than the stored checkpoint.
    async fn advance_checkpoint(
        &mut self,
        owner_id: OwnerId,
        timestamp: DateTime<Utc>,
        delivery_id: DeliveryId,
    ) -> LoaderResult<ChangeApplied>;

    /// Writes the watermark row and commits the unit of work.
    async fn record_delivery(
        self: Box<Self>,
        delivery_ts: DateTime<Utc>,
        runtime: TimeDelta,
        summary: &ChangeSummary,
    ) -> LoaderResult<DeliveryRecord>;

    async fn rollback(self: Box<Self>) -> LoaderResult<()>;
}

pub(crate) fn entity_schema(
    pipeline: &'static PipelineSchema,
    entity: &str,
) -> LoaderResult<&'static loadr_core::EntitySchema> {
    pipeline.entity(entity).ok_or_else(|| {
        LoaderError::invalid(entity, format!("entity is not part of pipeline {}", pipeline.name))
    })
}

pub(crate) fn table_columns(
    pipeline: &'static PipelineSchema,
    table: &str,
) -> LoaderResult<(Vec<Column>, Vec<Column>)> {
    pipeline.table_columns(table).ok_or_else(|| {
        LoaderError::invalid(table, format!("table is not part of pipeline {}", pipeline.name))
    })
}

pub(crate) fn check_sequence(
    pipeline: &PipelineSchema,
    last: Option<DeliveryId>,
    recorded: bool,
    delivery_id: DeliveryId,
) -> LoaderResult<()> {
    if recorded {
        return Err(LoaderError::DuplicateDelivery {
            pipeline: pipeline.name.to_string(),
            delivery_id,
        });
    }
    let expected = DeliveryId::after(last);
    if delivery_id != expected {
        return Err(LoaderError::OutOfSequence {
            pipeline: pipeline.name.to_string(),
            expected,
            got: delivery_id,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Exponential backoff shared by the feed client, the notifier and the
/// service loop's store reconnects.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadr_core::schema::PORTFOLIO;

    #[test]
    fn sequence_check_classifies_duplicates_and_gaps() {
        assert!(check_sequence(&PORTFOLIO, None, false, DeliveryId(1)).is_ok());
        assert!(matches!(
            check_sequence(&PORTFOLIO, Some(DeliveryId(3)), true, DeliveryId(3)),
            Err(LoaderError::DuplicateDelivery { .. })
        ));
        assert!(matches!(
            check_sequence(&PORTFOLIO, Some(DeliveryId(3)), false, DeliveryId(5)),
            Err(LoaderError::OutOfSequence { expected: DeliveryId(4), .. })
        ));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }
}
