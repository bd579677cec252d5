//! In-process store. A unit of work holds the store mutex for its whole
//! lifetime and mutates a private copy that replaces live state on commit.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use loadr_core::{
    truncate_micros, BusinessKey, ChangeApplied, ChangeOutcome, ChangeSummary, Column, DeliveryId, EventId,
    EventLogEntry, EventType, FieldValue, LatestRow, LoaderError, LoaderResult, OwnerId, PipelineSchema,
    ValueFields,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::{check_sequence, entity_schema, table_columns, DeliveryRecord, DeliveryTx, LoaderStore};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    deliveries: BTreeMap<DeliveryId, DeliveryRecord>,
    tables: HashMap<&'static str, HashMap<BusinessKey, LatestRow>>,
    event_log: HashMap<&'static str, Vec<EventLogEntry>>,
    event_ids: HashSet<EventId>,
    last_event_id: i64,
}

impl MemoryState {
    fn last_delivery(&self) -> Option<DeliveryId> {
        self.deliveries.keys().next_back().copied()
    }

    fn next_event_id(&mut self, table: &str) -> LoaderResult<EventId> {
        self.last_event_id += 1;
        let event_id = EventId(self.last_event_id);
        if !self.event_ids.insert(event_id) {
            return Err(LoaderError::ConstraintViolation {
                entity: table.to_string(),
                message: format!("event_id {event_id} already assigned"),
            });
        }
        Ok(event_id)
    }

    fn upsert(
        &mut self,
        table: &'static str,
        key_columns: &[Column],
        value_columns: &[Column],
        key: &BusinessKey,
        values: &ValueFields,
        delivery_id: DeliveryId,
    ) -> LoaderResult<ChangeApplied> {
        let hash = values.content_hash();
        let prev = self.tables.get(table).and_then(|rows| rows.get(key)).cloned();
        let (outcome, event_type) = match &prev {
            Some(row) if row.hash == hash && !row.removed => return Ok(ChangeApplied::unchanged(hash)),
            Some(row) if !row.removed => (ChangeOutcome::Amended, EventType::Amend),
            _ => (ChangeOutcome::Created, EventType::Create),
        };

        let event_id = self.next_event_id(table)?;
        let curr = LatestRow {
            key: key.clone(),
            values: values.clone(),
            hash: hash.clone(),
            event_id,
            delivery_id,
            removed: false,
        };
        self.tables.entry(table).or_default().insert(key.clone(), curr.clone());
        self.append_log(table, event_type, curr, prev, key_columns, value_columns);
        Ok(ChangeApplied {
            outcome,
            event_id: Some(event_id),
            hash,
        })
    }

    fn remove(
        &mut self,
        table: &'static str,
        key_columns: &[Column],
        value_columns: &[Column],
        key: &BusinessKey,
        delivery_id: DeliveryId,
    ) -> LoaderResult<ChangeApplied> {
        let prev = match self.tables.get(table).and_then(|rows| rows.get(key)) {
            None => return Ok(ChangeApplied::unchanged(ValueFields::new().content_hash())),
            Some(row) if row.removed => return Ok(ChangeApplied::unchanged(row.hash.clone())),
            Some(row) => row.clone(),
        };
        let event_id = self.next_event_id(table)?;
        let curr = LatestRow {
            event_id,
            delivery_id,
            removed: true,
            ..prev.clone()
        };
        let hash = curr.hash.clone();
        self.tables.entry(table).or_default().insert(key.clone(), curr.clone());
        self.append_log(table, EventType::Remove, curr, Some(prev), key_columns, value_columns);
        Ok(ChangeApplied {
            outcome: ChangeOutcome::Removed,
            event_id: Some(event_id),
            hash,
        })
    }

    fn append_log(
        &mut self,
        table: &'static str,
        event_type: EventType,
        curr: LatestRow,
        prev: Option<LatestRow>,
        key_columns: &[Column],
        value_columns: &[Column],
    ) {
        let entry = EventLogEntry::new(event_type, curr, prev, key_columns, value_columns);
        self.event_log.entry(table).or_default().push(entry);
    }
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    pipeline: &'static PipelineSchema,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new(pipeline: &'static PipelineSchema) -> Self {
        Self {
            pipeline,
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }
}

#[async_trait]
impl LoaderStore for MemoryStore {
    fn pipeline(&self) -> &'static PipelineSchema {
        self.pipeline
    }

    async fn last_delivery(&self) -> LoaderResult<Option<DeliveryId>> {
        Ok(self.state.lock().await.last_delivery())
    }

    async fn deliveries(&self, limit: usize) -> LoaderResult<Vec<DeliveryRecord>> {
        let state = self.state.lock().await;
        Ok(state.deliveries.values().rev().take(limit).cloned().collect())
    }

    async fn latest(&self, entity: &str, key: &BusinessKey) -> LoaderResult<Option<LatestRow>> {
        let schema = entity_schema(self.pipeline, entity)?;
        let state = self.state.lock().await;
        Ok(state
            .tables
            .get(schema.table())
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    async fn current_checkpoint(&self, owner_id: OwnerId) -> LoaderResult<Option<DateTime<Utc>>> {
        let state = self.state.lock().await;
        Ok(checkpoint_of(&state, self.pipeline, owner_id))
    }

    async fn events(&self, table: &str, since: EventId) -> LoaderResult<Vec<EventLogEntry>> {
        table_columns(self.pipeline, table)?;
        let state = self.state.lock().await;
        Ok(state
            .event_log
            .get(table)
            .map(|log| log.iter().filter(|e| e.event_id() > since).cloned().collect())
            .unwrap_or_default())
    }

    async fn begin(&self, delivery_id: DeliveryId) -> LoaderResult<Box<dyn DeliveryTx>> {
        let guard = self.state.clone().lock_owned().await;
        check_sequence(
            self.pipeline,
            guard.last_delivery(),
            guard.deliveries.contains_key(&delivery_id),
            delivery_id,
        )?;
        let working = guard.clone();
        debug!(pipeline = self.pipeline.name, %delivery_id, "memory unit of work opened");
        Ok(Box::new(MemoryTx {
            pipeline: self.pipeline,
            delivery_id,
            guard,
            working,
        }))
    }
}

fn checkpoint_of(state: &MemoryState, pipeline: &PipelineSchema, owner_id: OwnerId) -> Option<DateTime<Utc>> {
    let control = &pipeline.control;
    state
        .tables
        .get(control.table)
        .and_then(|rows| rows.get(&owner_key(owner_id)))
        .and_then(|row| match row.values.get(control.timestamp_column) {
            Some(FieldValue::Timestamp(ts)) => Some(*ts),
            _ => None,
        })
}

fn owner_key(owner_id: OwnerId) -> BusinessKey {
    BusinessKey::new([FieldValue::Int(owner_id)])
}

struct MemoryTx {
    pipeline: &'static PipelineSchema,
    delivery_id: DeliveryId,
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

impl MemoryTx {
    fn check_reference(&self, entity: &str, delivery_id: DeliveryId) -> LoaderResult<()> {
        if delivery_id == self.delivery_id || self.working.deliveries.contains_key(&delivery_id) {
            return Ok(());
        }
        Err(LoaderError::ReferentialIntegrity {
            entity: entity.to_string(),
            delivery_id,
        })
    }
}

#[async_trait]
impl DeliveryTx for MemoryTx {
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
        self.check_reference(entity, delivery_id)?;
        self.working
            .upsert(schema.table(), schema.key, schema.values, key, values, delivery_id)
    }

    async fn apply_removal(
        &mut self,
        entity: &str,
        key: &BusinessKey,
        delivery_id: DeliveryId,
    ) -> LoaderResult<ChangeApplied> {
        let schema = entity_schema(self.pipeline, entity)?;
        schema.check_key(key)?;
        self.check_reference(entity, delivery_id)?;
        self.working
            .remove(schema.table(), schema.key, schema.values, key, delivery_id)
    }

    async fn current_checkpoint(&mut self, owner_id: OwnerId) -> LoaderResult<Option<DateTime<Utc>>> {
        Ok(checkpoint_of(&self.working, self.pipeline, owner_id))
    }

    async fn advance_checkpoint(
        &mut self,
        owner_id: OwnerId,
        timestamp: DateTime<Utc>,
        delivery_id: DeliveryId,
    ) -> LoaderResult<ChangeApplied> {
        let control = &self.pipeline.control;
        let timestamp = truncate_micros(timestamp);
        self.check_reference(control.table, delivery_id)?;
        if let Some(stored) = checkpoint_of(&self.working, self.pipeline, owner_id) {
            if timestamp < stored {
                return Err(LoaderError::Regression {
                    owner_id,
                    stored,
                    proposed: timestamp,
                });
            }
        }
        self.working.upsert(
            control.table,
            &control.key_columns(),
            &control.value_columns(),
            &owner_key(owner_id),
            &control.values_for(timestamp),
            delivery_id,
        )
    }

    async fn record_delivery(
        self: Box<Self>,
        delivery_ts: DateTime<Utc>,
        runtime: TimeDelta,
        summary: &ChangeSummary,
    ) -> LoaderResult<DeliveryRecord> {
        let MemoryTx {
            pipeline,
            delivery_id,
            mut guard,
            mut working,
        } = *self;
        check_sequence(
            pipeline,
            working.last_delivery(),
            working.deliveries.contains_key(&delivery_id),
            delivery_id,
        )?;
        let record = DeliveryRecord {
            delivery_id,
            delivery_ts,
            runtime,
            summary: Some(summary.clone()),
        };
        working.deliveries.insert(delivery_id, record.clone());
        *guard = working;
        debug!(pipeline = pipeline.name, %delivery_id, "memory unit of work committed");
        Ok(record)
    }

    async fn rollback(self: Box<Self>) -> LoaderResult<()> {
        debug!(pipeline = self.pipeline.name, delivery_id = %self.delivery_id, "memory unit of work rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use loadr_core::schema::PORTFOLIO;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn key(asset: &str) -> BusinessKey {
        BusinessKey::new([FieldValue::Int(1), FieldValue::Text(asset.into())])
    }

    fn values(wgt: &str) -> ValueFields {
        let entity = PORTFOLIO.entity("position_latest").unwrap();
        let mut values = ValueFields::new();
        for column in entity.values {
            values.insert(column.name, FieldValue::Null);
        }
        values.insert("wgt", FieldValue::Decimal(Decimal::from_str(wgt).unwrap()));
        values
    }

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    async fn commit(tx: Box<dyn DeliveryTx>) -> DeliveryRecord {
        tx.record_delivery(Utc::now(), TimeDelta::zero(), &ChangeSummary::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn upsert_outcomes_follow_hash() {
        let store = MemoryStore::new(&PORTFOLIO);

        let mut tx = store.begin(DeliveryId(1)).await.unwrap();
        let created = tx
            .apply_change("position_latest", &key("P"), &values("0.50"), DeliveryId(1))
            .await
            .unwrap();
        assert_eq!(created.outcome, ChangeOutcome::Created);
        assert_eq!(created.event_id, Some(EventId(1)));
        commit(tx).await;

        let mut tx = store.begin(DeliveryId(2)).await.unwrap();
        let same = tx
            .apply_change("position_latest", &key("P"), &values("0.5"), DeliveryId(2))
            .await
            .unwrap();
        assert_eq!(same.outcome, ChangeOutcome::Unchanged);
        assert_eq!(same.event_id, None);
        let amended = tx
            .apply_change("position_latest", &key("P"), &values("0.55"), DeliveryId(2))
            .await
            .unwrap();
        assert_eq!(amended.outcome, ChangeOutcome::Amended);
        assert_eq!(amended.event_id, Some(EventId(2)));
        assert_ne!(amended.hash, created.hash);
        commit(tx).await;

        let row = store.latest("position_latest", &key("P")).await.unwrap().unwrap();
        assert_eq!(row.event_id, EventId(2));
        assert_eq!(row.delivery_id, DeliveryId(2));
    }

    #[tokio::test]
    async fn uncommitted_work_is_invisible_and_rolls_back() {
        let store = MemoryStore::new(&PORTFOLIO);
        let mut tx = store.begin(DeliveryId(1)).await.unwrap();
        tx.apply_change("position_latest", &key("P"), &values("0.50"), DeliveryId(1))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.last_delivery().await.unwrap(), None);
        assert!(store.latest("position_latest", &key("P")).await.unwrap().is_none());

        let mut tx = store.begin(DeliveryId(1)).await.unwrap();
        let again = tx
            .apply_change("position_latest", &key("P"), &values("0.50"), DeliveryId(1))
            .await
            .unwrap();
        assert_eq!(again.event_id, Some(EventId(1)));
    }

    #[tokio::test]
    async fn removal_tombstones_and_recreates() {
        let store = MemoryStore::new(&PORTFOLIO);
        let mut tx = store.begin(DeliveryId(1)).await.unwrap();
        tx.apply_change("position_latest", &key("P"), &values("0.50"), DeliveryId(1))
            .await
            .unwrap();
        let removed = tx.apply_removal("position_latest", &key("P"), DeliveryId(1)).await.unwrap();
        assert_eq!(removed.outcome, ChangeOutcome::Removed);
        let again = tx.apply_removal("position_latest", &key("P"), DeliveryId(1)).await.unwrap();
        assert_eq!(again.outcome, ChangeOutcome::Unchanged);
        let absent = tx.apply_removal("position_latest", &key("Q"), DeliveryId(1)).await.unwrap();
        assert_eq!(absent.outcome, ChangeOutcome::Unchanged);
        commit(tx).await;

        let row = store.latest("position_latest", &key("P")).await.unwrap().unwrap();
        assert!(row.removed);

        let mut tx = store.begin(DeliveryId(2)).await.unwrap();
        let back = tx
            .apply_change("position_latest", &key("P"), &values("0.50"), DeliveryId(2))
            .await
            .unwrap();
        assert_eq!(back.outcome, ChangeOutcome::Created);
        commit(tx).await;
        assert!(!store.latest("position_latest", &key("P")).await.unwrap().unwrap().removed);
    }

    #[tokio::test]
    async fn unknown_delivery_reference_is_rejected() {
        let store = MemoryStore::new(&PORTFOLIO);
        let mut tx = store.begin(DeliveryId(1)).await.unwrap();
        let err = tx
            .apply_change("position_latest", &key("P"), &values("0.50"), DeliveryId(7))
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::ReferentialIntegrity { delivery_id: DeliveryId(7), .. }));
    }

    #[tokio::test]
    async fn checkpoint_never_moves_backwards() {
        let store = MemoryStore::new(&PORTFOLIO);
        let mut tx = store.begin(DeliveryId(1)).await.unwrap();
        let first = tx.advance_checkpoint(7, ts(5), DeliveryId(1)).await.unwrap();
        assert_eq!(first.outcome, ChangeOutcome::Created);
        let equal = tx.advance_checkpoint(7, ts(5), DeliveryId(1)).await.unwrap();
        assert_eq!(equal.outcome, ChangeOutcome::Unchanged);
        commit(tx).await;

        let mut tx = store.begin(DeliveryId(2)).await.unwrap();
        let err = tx.advance_checkpoint(7, ts(4), DeliveryId(2)).await.unwrap_err();
        assert!(matches!(err, LoaderError::Regression { owner_id: 7, .. }));
        assert_eq!(tx.current_checkpoint(7).await.unwrap(), Some(ts(5)));
        let forward = tx.advance_checkpoint(7, ts(6), DeliveryId(2)).await.unwrap();
        assert_eq!(forward.outcome, ChangeOutcome::Amended);
        commit(tx).await;

        assert_eq!(store.current_checkpoint(7).await.unwrap(), Some(ts(6)));
        assert_eq!(store.current_checkpoint(8).await.unwrap(), None);
    }

    #[tokio::test]
    async fn watermark_advances_by_one() {
        let store = MemoryStore::new(&PORTFOLIO);
        assert!(matches!(
            store.begin(DeliveryId(2)).await,
            Err(LoaderError::OutOfSequence { .. })
        ));
        commit(store.begin(DeliveryId(1)).await.unwrap()).await;
        assert!(matches!(
            store.begin(DeliveryId(1)).await,
            Err(LoaderError::DuplicateDelivery { .. })
        ));
        commit(store.begin(DeliveryId(2)).await.unwrap()).await;

        assert_eq!(store.last_delivery().await.unwrap(), Some(DeliveryId(2)));
        let recent = store.deliveries(10).await.unwrap();
        assert_eq!(
            recent.iter().map(|d| d.delivery_id).collect::<Vec<_>>(),
            vec![DeliveryId(2), DeliveryId(1)]
        );
    }

    #[tokio::test]
    async fn invalid_rows_are_rejected_before_mutation() {
        let store = MemoryStore::new(&PORTFOLIO);
        let mut tx = store.begin(DeliveryId(1)).await.unwrap();
        let err = tx
            .apply_change("orders", &key("P"), &values("0.50"), DeliveryId(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::InvalidRecord { .. }));

        let short = ValueFields::new().with("wgt", FieldValue::Null);
        let err = tx
            .apply_change("position_latest", &key("P"), &short, DeliveryId(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::InvalidRecord { .. }));
    }

    #[tokio::test]
    async fn changes_append_to_the_event_log() {
        let store = MemoryStore::new(&PORTFOLIO);
        let mut tx = store.begin(DeliveryId(1)).await.unwrap();
        tx.apply_change("position_latest", &key("P"), &values("0.50"), DeliveryId(1))
            .await
            .unwrap();
        commit(tx).await;

        let mut tx = store.begin(DeliveryId(2)).await.unwrap();
        tx.apply_change("position_latest", &key("P"), &values("0.55"), DeliveryId(2))
            .await
            .unwrap();
        tx.apply_removal("position_latest", &key("P"), DeliveryId(2)).await.unwrap();
        commit(tx).await;

        let log = store.events("position_latest", EventId(0)).await.unwrap();
        assert_eq!(
            log.iter().map(|e| e.event_type).collect::<Vec<_>>(),
            vec![EventType::Create, EventType::Amend, EventType::Remove]
        );
        assert!(log[0].prev.is_none());
        assert_eq!(log[0].mask, "11111111");

        let amend = &log[1];
        let prev = amend.prev.as_ref().unwrap();
        assert_eq!(prev.event_id, EventId(1));
        assert_eq!(prev.delivery_id, DeliveryId(1));
        assert_eq!(prev.values, values("0.50"));
        assert_eq!(amend.curr.values, values("0.55"));
        assert_eq!(amend.event_id(), EventId(2));
        assert_eq!(amend.delivery_id(), DeliveryId(2));
        assert_eq!(amend.mask, "00000100");

        let remove = &log[2];
        assert!(remove.curr.removed);
        assert_eq!(remove.curr.hash, amend.curr.hash);
        assert_eq!(remove.mask, "11111111");

        let tail = store.events("position_latest", EventId(2)).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert!(store.events("portfolio_latest", EventId(0)).await.unwrap().is_empty());
        assert!(matches!(
            store.events("orders", EventId(0)).await,
            Err(LoaderError::InvalidRecord { .. })
        ));
    }

    #[tokio::test]
    async fn unchanged_and_rolled_back_rows_leave_no_log() {
        let store = MemoryStore::new(&PORTFOLIO);
        let mut tx = store.begin(DeliveryId(1)).await.unwrap();
        tx.apply_change("position_latest", &key("P"), &values("0.50"), DeliveryId(1))
            .await
            .unwrap();
        commit(tx).await;

        let mut tx = store.begin(DeliveryId(2)).await.unwrap();
        tx.apply_change("position_latest", &key("P"), &values("0.50"), DeliveryId(2))
            .await
            .unwrap();
        tx.apply_change("position_latest", &key("Q"), &values("0.10"), DeliveryId(2))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        let mut tx = store.begin(DeliveryId(2)).await.unwrap();
        tx.apply_change("position_latest", &key("P"), &values("0.50"), DeliveryId(2))
            .await
            .unwrap();
        commit(tx).await;

        let log = store.events("position_latest", EventId(0)).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].delivery_id(), DeliveryId(1));
    }

    #[tokio::test]
    async fn checkpoints_are_logged_under_the_control_table() {
        let store = MemoryStore::new(&PORTFOLIO);
        let mut tx = store.begin(DeliveryId(1)).await.unwrap();
        tx.advance_checkpoint(7, ts(5), DeliveryId(1)).await.unwrap();
        tx.advance_checkpoint(7, ts(6), DeliveryId(1)).await.unwrap();
        commit(tx).await;

        let log = store.events("portfolio_control", EventId(0)).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].event_type, EventType::Amend);
        assert_eq!(log[1].curr.key, owner_key(7));
        assert_eq!(log[1].mask, "01");
        assert_eq!(
            log[1].prev.as_ref().unwrap().values.get("last_monitor_ts"),
            Some(&FieldValue::Timestamp(ts(5)))
        );
    }

    #[tokio::test]
    async fn sub_microsecond_digits_are_not_stored() {
        let store = MemoryStore::new(&PORTFOLIO);
        let at = |nanos: u32| {
            let mut fields = values("0.50");
            fields.insert(
                "position_ts",
                FieldValue::Timestamp(Utc.timestamp_opt(1_704_067_200, nanos).unwrap()),
            );
            fields
        };

        let mut tx = store.begin(DeliveryId(1)).await.unwrap();
        tx.apply_change("position_latest", &key("P"), &at(100), DeliveryId(1))
            .await
            .unwrap();
        let same = tx
            .apply_change("position_latest", &key("P"), &at(900), DeliveryId(1))
            .await
            .unwrap();
        assert_eq!(same.outcome, ChangeOutcome::Unchanged);
        let later = tx
            .apply_change("position_latest", &key("P"), &at(1_000), DeliveryId(1))
            .await
            .unwrap();
        assert_eq!(later.outcome, ChangeOutcome::Amended);
        commit(tx).await;

        let row = store.latest("position_latest", &key("P")).await.unwrap().unwrap();
        assert_eq!(
            row.values.get("position_ts"),
            Some(&FieldValue::Timestamp(Utc.timestamp_opt(1_704_067_200, 1_000).unwrap()))
        );
    }
}
