//! Loader pipeline: poll the feed, apply a delivery in one unit of work,
//! record the watermark and publish the change notification.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loadr_core::{
    pipeline, ChangeSummary, DeliveryId, DeliveryNotification, ErrorDisposition, LoaderError, LoaderResult,
    PipelineSchema,
};
use loadr_source::{classify_reqwest_error, classify_status, source_for_location, DeliveryFile, DeliveryRow, DeliverySource};
use loadr_storage::{BackoffPolicy, DeliveryTx, LoaderStore, MemoryStore, PgStore, PoolConfig, RetryDisposition};
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "loadr-sync";

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub pipeline: String,
    pub data_source: String,
    pub run_as_service: bool,
    pub min_sleep: Duration,
    pub max_sleep: Duration,
    pub dry_run: bool,
    pub notifications: bool,
    pub broker_url: Option<String>,
    pub source: String,
    pub source_token: Option<String>,
    /// Postgres URL; none runs against an in-process store.
    pub target: Option<String>,
    pub host: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            pipeline: "portfolio".to_string(),
            data_source: "equity".to_string(),
            run_as_service: true,
            min_sleep: Duration::from_secs(15),
            max_sleep: Duration::from_secs(30),
            dry_run: false,
            notifications: false,
            broker_url: None,
            source: "./deliveries".to_string(),
            source_token: None,
            target: None,
            host: "localhost".to_string(),
        }
    }
}

impl LoaderConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            pipeline: std::env::var("PIPELINE").unwrap_or(defaults.pipeline),
            data_source: std::env::var("DATA_SOURCE").unwrap_or(defaults.data_source),
            run_as_service: env_flag("RUN_AS_SERVICE").unwrap_or(defaults.run_as_service),
            min_sleep: env_secs("MIN_SLEEP").unwrap_or(defaults.min_sleep),
            max_sleep: env_secs("MAX_SLEEP").unwrap_or(defaults.max_sleep),
            dry_run: env_flag("DRY_RUN").unwrap_or(defaults.dry_run),
            notifications: env_flag("NOTIFICATIONS").unwrap_or(defaults.notifications),
            broker_url: non_empty_var("BROKER_URL"),
            source: std::env::var("SOURCE").unwrap_or(defaults.source),
            source_token: non_empty_var("SOURCE_TOKEN"),
            target: non_empty_var("TARGET").or_else(|| non_empty_var("DATABASE_URL")),
            host: non_empty_var("HOSTNAME").unwrap_or(defaults.host),
        }
    }

    pub fn validate(&self) -> Result<&'static PipelineSchema, ConfigError> {
        if self.min_sleep > self.max_sleep {
            return Err(ConfigError::SleepRange {
                min: self.min_sleep,
                max: self.max_sleep,
            });
        }
        pipeline(&self.pipeline).ok_or_else(|| ConfigError::UnknownPipeline(self.pipeline.clone()))
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|v| parse_flag(&v))
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Accepts the usual spellings, including Python-style `True`/`False`.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "True" | "yes" | "on" => Some(true),
        "0" | "false" | "FALSE" | "False" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("min sleep {min:?} exceeds max sleep {max:?}")]
    SleepRange { min: Duration, max: Duration },
    #[error("unknown pipeline {0}")]
    UnknownPipeline(String),
}

/// Uniformly random delay in `[min, max]`.
pub fn poll_delay(min: Duration, max: Duration) -> Duration {
    if min >= max {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReport {
    pub run_id: Uuid,
    pub pipeline: String,
    pub delivery_id: DeliveryId,
    pub delivery_ts: DateTime<Utc>,
    pub runtime_ms: i64,
    pub rows: usize,
    pub summary: ChangeSummary,
    pub dry_run: bool,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("broker answered with status {status}")]
    Status { status: u16 },
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, notification: &DeliveryNotification) -> Result<(), NotifyError>;
}

#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn publish(&self, _notification: &DeliveryNotification) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Emits the payload as a structured log line.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(&self, notification: &DeliveryNotification) -> Result<(), NotifyError> {
        let payload = serde_json::to_string(notification)?;
        info!(
            target: "loadr::notification",
            pipeline = %notification.pipeline,
            delivery_id = %notification.delivery_id,
            %payload,
            "delivery notification"
        );
        Ok(())
    }
}

/// POSTs the payload as JSON to the broker endpoint.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
    backoff: BackoffPolicy,
}

impl HttpNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration, backoff: BackoffPolicy) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            backoff,
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn publish(&self, notification: &DeliveryNotification) -> Result<(), NotifyError> {
        let mut attempt = 0;
        loop {
            let result = self.client.post(&self.url).json(notification).send().await;
            let retryable = match result {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::NonRetryable || attempt >= self.backoff.max_retries {
                        return Err(NotifyError::Status {
                            status: status.as_u16(),
                        });
                    }
                    status.to_string()
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(err.into());
                    }
                    err.to_string()
                }
            };
            warn!(url = %self.url, attempt, reason = %retryable, "retrying notification");
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

pub fn notifier_for_config(config: &LoaderConfig) -> Result<Box<dyn Notifier>, NotifyError> {
    if !config.notifications {
        return Ok(Box::<NoopNotifier>::default());
    }
    match &config.broker_url {
        Some(url) => Ok(Box::new(HttpNotifier::new(
            url.clone(),
            Duration::from_secs(10),
            BackoffPolicy::default(),
        )?)),
        None => Ok(Box::<LogNotifier>::default()),
    }
}

pub async fn open_store(
    config: &LoaderConfig,
    schema: &'static PipelineSchema,
) -> LoaderResult<Arc<dyn LoaderStore>> {
    match &config.target {
        Some(url) => Ok(Arc::new(PgStore::connect(url, schema, PoolConfig::default()).await?)),
        None => {
            warn!(pipeline = schema.name, "no target configured; using an in-process store");
            Ok(Arc::new(MemoryStore::new(schema)))
        }
    }
}

pub struct Loader {
    store: Arc<dyn LoaderStore>,
    source: Box<dyn DeliverySource>,
    notifier: Box<dyn Notifier>,
    config: LoaderConfig,
    dry_run_cursor: Mutex<Option<DeliveryId>>,
}

impl Loader {
    pub fn new(store: Arc<dyn LoaderStore>, source: Box<dyn DeliverySource>, config: LoaderConfig) -> Self {
        Self {
            store,
            source,
            notifier: Box::<NoopNotifier>::default(),
            config,
            dry_run_cursor: Mutex::new(None),
        }
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Validates the configuration and wires store, feed and notifier from it.
    pub async fn from_config(config: LoaderConfig) -> LoaderResult<Self> {
        let schema = config
            .validate()
            .map_err(|err| LoaderError::invalid("config", err.to_string()))?;
        let store = open_store(&config, schema).await?;
        let source = source_for_location(&config.source, config.source_token.clone())?;
        let notifier = notifier_for_config(&config).map_err(|err| LoaderError::source("building notifier", err))?;
        Ok(Self::new(store, source, config).with_notifier(notifier))
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LoaderStore> {
        &self.store
    }

    async fn next_sequence(&self, stored_last: Option<DeliveryId>) -> DeliveryId {
        let stored_next = DeliveryId::after(stored_last);
        if !self.config.dry_run {
            return stored_next;
        }
        match *self.dry_run_cursor.lock().await {
            Some(previewed) if previewed >= stored_next => previewed.next(),
            _ => stored_next,
        }
    }

    /// Loads at most one delivery. `Ok(None)` means the next file is not there yet.
    pub async fn run_once(&self) -> LoaderResult<Option<DeliveryReport>> {
        let schema = self.store.pipeline();
        let stored_last = self.store.last_delivery().await?;
        let sequence = self.next_sequence(stored_last).await;

        let Some(file) = self.source.fetch(schema.name, sequence).await? else {
            debug!(pipeline = schema.name, %sequence, "no new delivery");
            return Ok(None);
        };

        let run_id = Uuid::new_v4();
        let span = info_span!("delivery", pipeline = schema.name, delivery_id = %sequence, %run_id);
        self.load(run_id, schema, stored_last, file).instrument(span).await.map(Some)
    }

    async fn load(
        &self,
        run_id: Uuid,
        schema: &'static PipelineSchema,
        stored_last: Option<DeliveryId>,
        file: DeliveryFile,
    ) -> LoaderResult<DeliveryReport> {
        let delivery_ts = Utc::now();
        // A dry run previewing past the watermark still opens the unit at the
        // store's next id; the unit is rolled back either way.
        let unit_id = if self.config.dry_run {
            DeliveryId::after(stored_last)
        } else {
            file.sequence
        };

        let mut tx = self.store.begin(unit_id).await?;
        let summary = match apply_rows(tx.as_mut(), schema, &file).await {
            Ok(summary) => summary,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed delivery also failed");
                }
                warn!(error = %err, disposition = ?err.disposition(), "delivery rolled back");
                return Err(err);
            }
        };
        let runtime = Utc::now() - delivery_ts;

        let report = DeliveryReport {
            run_id,
            pipeline: schema.name.to_string(),
            delivery_id: file.sequence,
            delivery_ts,
            runtime_ms: runtime.num_milliseconds(),
            rows: file.rows.len(),
            summary,
            dry_run: self.config.dry_run,
        };

        if self.config.dry_run {
            tx.rollback().await?;
            *self.dry_run_cursor.lock().await = Some(file.sequence);
            info!(
                rows = report.rows,
                changes = report.summary.total_changes(),
                stats = %stats_json(&report.summary),
                "dry run; delivery rolled back"
            );
            return Ok(report);
        }

        let record = tx.record_delivery(delivery_ts, runtime, &report.summary).await?;
        info!(
            rows = report.rows,
            changes = report.summary.total_changes(),
            max_event_id = ?report.summary.max_event_id,
            runtime_ms = report.runtime_ms,
            stats = %stats_json(&report.summary),
            "delivery loaded"
        );
        self.notify(record.delivery_id, &report.summary).await;
        Ok(report)
    }

    async fn notify(&self, delivery_id: DeliveryId, summary: &ChangeSummary) {
        let notification = DeliveryNotification::new(
            &self.config.data_source,
            self.store.pipeline().name,
            delivery_id,
            &self.config.host,
            Utc::now(),
            summary,
        );
        if let Err(err) = self.notifier.publish(&notification).await {
            warn!(error = %err, %delivery_id, "notification failed; delivery stays committed");
        }
    }

    /// Polls until `stop` flips to true. Only `Halt` errors end the loop early.
    pub async fn run_service(&self, mut stop: watch::Receiver<bool>) -> LoaderResult<()> {
        info!(
            pipeline = self.store.pipeline().name,
            source = %self.source.describe(),
            min_sleep_s = self.config.min_sleep.as_secs_f64(),
            max_sleep_s = self.config.max_sleep.as_secs_f64(),
            dry_run = self.config.dry_run,
            "running as a service"
        );
        let mut consecutive_failures = 0usize;
        loop {
            if *stop.borrow() {
                break;
            }
            match self.run_once().await {
                Ok(_) => consecutive_failures = 0,
                Err(err) => match err.disposition() {
                    ErrorDisposition::Skip => warn!(error = %err, "delivery skipped"),
                    ErrorDisposition::AbortDelivery => {
                        warn!(error = %err, "delivery aborted; the same file is retried next poll")
                    }
                    ErrorDisposition::Retry => {
                        consecutive_failures += 1;
                        warn!(error = %err, consecutive_failures, "transient failure; retrying next poll");
                    }
                    ErrorDisposition::Halt => {
                        error!(error = %err, "pipeline halted; manual review required");
                        return Err(err);
                    }
                },
            }

            let delay = poll_delay(self.config.min_sleep, self.config.max_sleep);
            trace!(delay_ms = delay.as_millis() as u64, "sleeping");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        info!("terminating");
        Ok(())
    }

    /// Service mode or a single pass, as configured. A duplicate delivery in
    /// single-pass mode is reported and treated as success.
    pub async fn run(&self, stop: watch::Receiver<bool>) -> LoaderResult<()> {
        if self.config.run_as_service {
            return self.run_service(stop).await;
        }
        match self.run_once().await {
            Ok(Some(report)) => {
                debug!(delivery_id = %report.delivery_id, "single pass done");
                Ok(())
            }
            Ok(None) => {
                info!("no new delivery");
                Ok(())
            }
            Err(err) if err.disposition() == ErrorDisposition::Skip => {
                warn!(error = %err, "delivery skipped");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

fn stats_json(summary: &ChangeSummary) -> String {
    serde_json::to_string(&summary.stats).unwrap_or_default()
}

/// Applies every row in file order and tallies the outcomes.
pub async fn apply_rows(
    tx: &mut dyn DeliveryTx,
    schema: &'static PipelineSchema,
    file: &DeliveryFile,
) -> LoaderResult<ChangeSummary> {
    let delivery_id = tx.delivery_id();
    let mut summary = ChangeSummary::default();
    for (index, row) in file.rows.iter().enumerate() {
        let (entity, applied) = match row {
            DeliveryRow::Upsert { entity, key, values } => {
                let entity = entity_of(schema, entity).map_err(at_row(index))?;
                let key = entity.key_from_json(key).map_err(at_row(index))?;
                let values = entity.values_from_json(values).map_err(at_row(index))?;
                let applied = tx
                    .apply_change(entity.name, &key, &values, delivery_id)
                    .await
                    .map_err(at_row(index))?;
                (entity.name, applied)
            }
            DeliveryRow::Remove { entity, key } => {
                let entity = entity_of(schema, entity).map_err(at_row(index))?;
                let key = entity.key_from_json(key).map_err(at_row(index))?;
                let applied = tx
                    .apply_removal(entity.name, &key, delivery_id)
                    .await
                    .map_err(at_row(index))?;
                (entity.name, applied)
            }
            DeliveryRow::Checkpoint { owner_id, timestamp } => {
                let applied = tx
                    .advance_checkpoint(*owner_id, *timestamp, delivery_id)
                    .await
                    .map_err(at_row(index))?;
                (schema.control.table, applied)
            }
        };
        trace!(row = index, entity, outcome = ?applied.outcome, event_id = ?applied.event_id, "row applied");
        summary.record(entity, &applied);
    }
    Ok(summary)
}

fn entity_of(schema: &'static PipelineSchema, name: &str) -> LoaderResult<&'static loadr_core::EntitySchema> {
    schema
        .entity(name)
        .ok_or_else(|| LoaderError::invalid(name, format!("not an entity of pipeline {}", schema.name)))
}

fn at_row(index: usize) -> impl Fn(LoaderError) -> LoaderError {
    move |err| match err {
        LoaderError::InvalidRecord { entity, message } => LoaderError::InvalidRecord {
            entity,
            message: format!("row {index}: {message}"),
        },
        other => other,
    }
}
