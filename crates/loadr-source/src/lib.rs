//! Delivery feed: file format, naming and the sources that serve it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loadr_core::{DeliveryId, LoaderError, LoaderResult, OwnerId};
use loadr_storage::{BackoffPolicy, RetryDisposition};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "loadr-source";

/// One row of a delivery file, applied in file order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DeliveryRow {
    Upsert {
        entity: String,
        key: Map<String, JsonValue>,
        #[serde(default)]
        values: Map<String, JsonValue>,
    },
    Remove {
        entity: String,
        key: Map<String, JsonValue>,
    },
    Checkpoint {
        owner_id: OwnerId,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryFile {
    pub sequence: DeliveryId,
    pub pipeline: String,
    #[serde(default)]
    pub produced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rows: Vec<DeliveryRow>,
}

impl DeliveryFile {
    pub fn new(pipeline: impl Into<String>, sequence: DeliveryId) -> Self {
        Self {
            sequence,
            pipeline: pipeline.into(),
            produced_at: None,
            rows: Vec::new(),
        }
    }

    pub fn with_row(mut self, row: DeliveryRow) -> Self {
        self.rows.push(row);
        self
    }

    /// Parses a fetched body and checks it against the name it was fetched by.
    pub fn parse(bytes: &[u8], pipeline: &str, sequence: DeliveryId) -> LoaderResult<Self> {
        let name = file_name_for(sequence);
        let file: DeliveryFile = serde_json::from_slice(bytes)
            .map_err(|err| LoaderError::invalid(&name, format!("malformed delivery file: {err}")))?;
        if file.sequence != sequence {
            return Err(LoaderError::invalid(
                &name,
                format!("file declares sequence {}", file.sequence),
            ));
        }
        if file.pipeline != pipeline {
            return Err(LoaderError::invalid(
                &name,
                format!("file belongs to pipeline {}, not {pipeline}", file.pipeline),
            ));
        }
        Ok(file)
    }
}

pub fn file_name_for(sequence: DeliveryId) -> String {
    format!("delivery_{:010}.json", sequence.0)
}

pub fn relative_path_for(pipeline: &str, sequence: DeliveryId) -> PathBuf {
    PathBuf::from(pipeline).join(file_name_for(sequence))
}

/// Accepts a bare name or a path; the zero padding is not required.
pub fn sequence_from_name(name: &str) -> Option<DeliveryId> {
    let base = name.rsplit(['/', '\\']).next()?;
    let digits = base.strip_prefix("delivery_")?.strip_suffix(".json")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<i64>().ok().map(DeliveryId)
}

#[async_trait]
pub trait DeliverySource: Send + Sync {
    fn describe(&self) -> String;

    /// `Ok(None)` means the file does not exist yet.
    async fn fetch(&self, pipeline: &str, sequence: DeliveryId) -> LoaderResult<Option<DeliveryFile>>;
}

/// Picks an HTTP source for `http(s)://` locations and a directory otherwise.
pub fn source_for_location(location: &str, token: Option<String>) -> LoaderResult<Box<dyn DeliverySource>> {
    if location.starts_with("http://") || location.starts_with("https://") {
        let source = HttpSource::new(HttpSourceConfig {
            base_url: location.to_string(),
            token,
            ..Default::default()
        })?;
        return Ok(Box::new(source));
    }
    if token.is_some() {
        warn!(location, "source token ignored for a local directory source");
    }
    Ok(Box::new(LocalDirSource::new(location)))
}

#[derive(Debug, Clone)]
pub struct LocalDirSource {
    root: PathBuf,
}

impl LocalDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, pipeline: &str, sequence: DeliveryId) -> PathBuf {
        self.root.join(relative_path_for(pipeline, sequence))
    }

    /// Writes a delivery file via temp file and rename, so a polling loader
    /// never sees a partial file.
    pub async fn publish(&self, file: &DeliveryFile) -> LoaderResult<PathBuf> {
        let path = self.path_for(&file.pipeline, file.sequence);
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| LoaderError::source(format!("creating {}", parent.display()), err))?;

        let bytes = serde_json::to_vec_pretty(file)
            .map_err(|err| LoaderError::source("serializing delivery file", err))?;
        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut out = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|err| LoaderError::source(format!("opening {}", temp_path.display()), err))?;
        out.write_all(&bytes)
            .await
            .map_err(|err| LoaderError::source(format!("writing {}", temp_path.display()), err))?;
        out.flush()
            .await
            .map_err(|err| LoaderError::source(format!("flushing {}", temp_path.display()), err))?;
        drop(out);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(LoaderError::source(format!("renaming into {}", path.display()), err));
        }
        Ok(path)
    }
}

#[async_trait]
impl DeliverySource for LocalDirSource {
    fn describe(&self) -> String {
        format!("dir:{}", self.root.display())
    }

    async fn fetch(&self, pipeline: &str, sequence: DeliveryId) -> LoaderResult<Option<DeliveryFile>> {
        let path = self.path_for(pipeline, sequence);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no delivery file yet");
                return Ok(None);
            }
            Err(err) => return Err(LoaderError::source(format!("reading {}", path.display()), err)),
        };
        DeliveryFile::parse(&bytes, pipeline, sequence).map(Some)
    }
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

impl From<FetchError> for LoaderError {
    fn from(err: FetchError) -> Self {
        LoaderError::source("fetching delivery", err)
    }
}

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: None,
            timeout: Duration::from_secs(20),
            user_agent: Some(format!("loadr/{}", env!("CARGO_PKG_VERSION"))),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Serves `<base_url>/<pipeline>/delivery_<seq>.json`.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    backoff: BackoffPolicy,
}

impl HttpSource {
    pub fn new(config: HttpSourceConfig) -> LoaderResult<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(ua) = &config.user_agent {
            builder = builder.user_agent(ua.clone());
        }
        let client = builder
            .build()
            .map_err(|err| LoaderError::source("building HTTP client", err))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token,
            backoff: config.backoff,
        })
    }

    pub fn url_for(&self, pipeline: &str, sequence: DeliveryId) -> String {
        format!("{}/{}/{}", self.base_url, pipeline, file_name_for(sequence))
    }

    /// `Ok(None)` on 404. Retryable failures are retried per the backoff
    /// policy; the last attempt's error is returned as is.
    async fn fetch_bytes(&self, url: &str) -> Result<Option<Vec<u8>>, FetchError> {
        let mut attempt = 0;
        loop {
            let mut request = self.client.get(url);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            let can_retry = attempt < self.backoff.max_retries;

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    if status.is_success() {
                        return Ok(Some(resp.bytes().await?.to_vec()));
                    }
                    if !can_retry || classify_status(status) == RetryDisposition::NonRetryable {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                    warn!(%status, attempt, "retryable feed response");
                }
                Err(err) => {
                    if !can_retry || classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                        return Err(FetchError::Request(err));
                    }
                    warn!(error = %err, attempt, "retryable feed request error");
                }
            }

            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl DeliverySource for HttpSource {
    fn describe(&self) -> String {
        self.base_url.clone()
    }

    async fn fetch(&self, pipeline: &str, sequence: DeliveryId) -> LoaderResult<Option<DeliveryFile>> {
        let url = self.url_for(pipeline, sequence);
        let span = info_span!("feed_fetch", pipeline, %sequence, url = %url);
        let body = self.fetch_bytes(&url).instrument(span).await?;
        body.map(|bytes| DeliveryFile::parse(&bytes, pipeline, sequence))
            .transpose()
    }
}
