//! Import archival, HTTP plumbing, and CrmState persistence for Prospect Flow.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pflow_core::{reconcile_states, CrmState};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pflow-store";

#[derive(Debug, Clone)]
pub struct ArchivedImport {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive for uploaded source files, so every cycle's
/// input stays reproducible after the upload widget is long gone.
#[derive(Debug, Clone)]
pub struct ImportArchive {
    root: PathBuf,
}

impl ImportArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn archive_relative_path(
        &self,
        received_at: DateTime<Utc>,
        label: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(received_at.format("%Y").to_string())
            .join(received_at.format("%m").to_string())
            .join(label)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store upload bytes under a hash-addressed path via atomic temp-file rename.
    pub async fn store_bytes(
        &self,
        received_at: DateTime<Utc>,
        label: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedImport> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.archive_relative_path(received_at, label, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating archive directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(ArchivedImport {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = absolute_path
            .parent()
            .expect("archive path always has parent")
            .join(temp_name);

        fs::write(&temp_path, bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(ArchivedImport {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(ArchivedImport {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp file {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
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

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            bearer_token: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// JSON API client with bearer auth and bounded retry on reads.
///
/// Writes are sent exactly once; a failed write surfaces to the caller so
/// the edit can be reported as unsaved rather than silently retried.
#[derive(Debug, Clone)]
pub struct JsonFetcher {
    client: reqwest::Client,
    bearer_token: Option<String>,
    backoff: BackoffPolicy,
}

impl JsonFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            bearer_token: config.bearer_token,
            backoff: config.backoff,
        })
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, url);
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }
        req
    }

    pub async fn get_json<Q: Serialize + ?Sized>(
        &self,
        collection: &str,
        url: &str,
        query: &Q,
    ) -> Result<serde_json::Value, FetchError> {
        let span = info_span!("http_get", collection, url);
        self.get_json_with_retry(url, query).instrument(span).await
    }

    async fn get_json_with_retry<Q: Serialize + ?Sized>(
        &self,
        url: &str,
        query: &Q,
    ) -> Result<serde_json::Value, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.request(Method::GET, url).query(query).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.json().await?);
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }

    /// Single-shot POST; never retried.
    pub async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, FetchError> {
        self.send_json(Method::POST, url, body).await
    }

    /// Single-shot write (POST/PATCH); never retried.
    pub async fn send_json(
        &self,
        method: Method,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, FetchError> {
        let resp = self.request(method, url).json(body).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        Ok(resp.json().await?)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv data in {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected response shape from {url}: {detail}")]
    Shape { url: String, detail: String },
}

/// One persistence call's per-record outcome. Aggregate success may be
/// claimed only when `failures` is empty.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SaveReport {
    pub saved: Vec<String>,
    pub failures: Vec<SaveFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SaveFailure {
    pub client_id: String,
    pub reason: String,
}

impl SaveReport {
    pub fn all_saved(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            saved: ids.into_iter().collect(),
            failures: Vec::new(),
        }
    }

    pub fn record_saved(&mut self, client_id: impl Into<String>) {
        self.saved.push(client_id.into());
    }

    pub fn record_failure(&mut self, client_id: impl Into<String>, reason: impl Into<String>) {
        self.failures.push(SaveFailure {
            client_id: client_id.into(),
            reason: reason.into(),
        });
    }

    pub fn complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Persisted CrmState table. Both variants observe the same content for the
/// same sequence of edits; only the write mechanics differ.
#[async_trait]
pub trait CrmStateStore: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Full table as currently persisted. A store with no rows yet is an
    /// empty table, not an error.
    async fn load(&self) -> Result<Vec<CrmState>, StoreError>;

    /// Persist edited rows last-write-wins per id, leaving untouched rows
    /// intact. Rows must already carry their interaction stamp.
    async fn save_edited(&self, edited: &[CrmState]) -> Result<SaveReport, StoreError>;
}

/// An empty contact field in persisted form means "never touched", so the
/// source value fills it on the next merge.
fn normalize_loaded(mut row: CrmState) -> CrmState {
    row.phone = row.phone.filter(|value| !value.trim().is_empty());
    row.email = row.email.filter(|value| !value.trim().is_empty());
    row
}

/// Flat CSV file holding the CrmState table; read in full, rewritten in
/// full on every save via atomic temp-file rename.
#[derive(Debug, Clone)]
pub struct LocalCsvStore {
    path: PathBuf,
}

impl LocalCsvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_rows(&self) -> Result<Vec<CrmState>, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let mut rows = Vec::new();
        for result in reader.deserialize::<CrmState>() {
            let row = result.map_err(|source| StoreError::Csv {
                path: self.path.clone(),
                source,
            })?;
            rows.push(normalize_loaded(row));
        }
        Ok(rows)
    }

    async fn write_rows(&self, rows: &[CrmState]) -> Result<(), StoreError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for row in rows {
            writer.serialize(row).map_err(|source| StoreError::Csv {
                path: self.path.clone(),
                source,
            })?;
        }
        let bytes = writer.into_inner().map_err(|err| StoreError::Io {
            path: self.path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, err.to_string()),
        })?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|source| StoreError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }

        let temp_name = format!(".{}.tmp", Uuid::new_v4());
        let temp_path = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(&temp_name),
            _ => PathBuf::from(&temp_name),
        };

        fs::write(&temp_path, &bytes)
            .await
            .map_err(|source| StoreError::Io {
                path: temp_path.clone(),
                source,
            })?;

        if let Err(source) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Io {
                path: self.path.clone(),
                source,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CrmStateStore for LocalCsvStore {
    fn kind(&self) -> &'static str {
        "local-csv"
    }

    async fn load(&self) -> Result<Vec<CrmState>, StoreError> {
        self.read_rows().await
    }

    async fn save_edited(&self, edited: &[CrmState]) -> Result<SaveReport, StoreError> {
        let existing = self.read_rows().await?;
        let next = reconcile_states(&existing, edited);
        self.write_rows(&next).await?;
        Ok(SaveReport::all_saved(
            edited.iter().map(|row| row.client_id.clone()),
        ))
    }
}

/// Remote record-collection backend (PocketBase-style API): list with
/// filter and field projection, create, partial update, bearer auth.
#[derive(Debug, Clone)]
pub struct RemoteCollectionStore {
    fetcher: JsonFetcher,
    base_url: String,
    collection: String,
}

impl RemoteCollectionStore {
    pub fn new(
        fetcher: JsonFetcher,
        base_url: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        let base: String = base_url.into();
        Self {
            fetcher,
            base_url: base.trim_end_matches('/').to_string(),
            collection: collection.into(),
        }
    }

    pub fn records_url(&self) -> String {
        format!("{}/api/collections/{}/records", self.base_url, self.collection)
    }

    fn record_url(&self, row_id: &str) -> String {
        format!("{}/{row_id}", self.records_url())
    }

    async fn find_row_id(&self, client_id: &str) -> Result<Option<String>, StoreError> {
        let escaped = client_id.replace('\'', "\\'");
        let query = [
            ("page", "1".to_string()),
            ("perPage", "1".to_string()),
            ("filter", format!("(client_id='{escaped}')")),
            ("fields", "id,client_id".to_string()),
        ];
        let url = self.records_url();
        let value = self.fetcher.get_json(&self.collection, &url, &query).await?;
        let items = value
            .get("items")
            .and_then(|v| v.as_array())
            .ok_or_else(|| StoreError::Shape {
                url,
                detail: "missing items array".to_string(),
            })?;
        Ok(items
            .first()
            .and_then(|item| item.get("id"))
            .and_then(|v| v.as_str())
            .map(str::to_string))
    }

    async fn upsert(&self, state: &CrmState) -> Result<(), StoreError> {
        match self.find_row_id(&state.client_id).await? {
            Some(row_id) => {
                self.fetcher
                    .send_json(Method::PATCH, &self.record_url(&row_id), &patch_body(state))
                    .await?;
            }
            None => {
                self.fetcher
                    .send_json(Method::POST, &self.records_url(), &create_body(state))
                    .await?;
            }
        }
        Ok(())
    }
}

/// Editable fields only; untouched contact fields stay out of the payload
/// so the backend keeps whatever it has.
pub fn patch_body(state: &CrmState) -> serde_json::Value {
    let mut body = serde_json::json!({
        "sales_status": state.sales_status,
        "called": state.called,
        "notes": state.notes,
        "last_interaction_at": state.last_interaction_at,
        "first_attempt_at": state.first_attempt_at,
        "second_attempt_at": state.second_attempt_at,
        "third_attempt_at": state.third_attempt_at,
        "cadence_notes": state.cadence_notes,
    });
    if let Some(phone) = &state.phone {
        body["phone"] = serde_json::Value::String(phone.clone());
    }
    if let Some(email) = &state.email {
        body["email"] = serde_json::Value::String(email.clone());
    }
    body
}

pub fn create_body(state: &CrmState) -> serde_json::Value {
    let mut body = patch_body(state);
    body["client_id"] = serde_json::Value::String(state.client_id.clone());
    body
}

#[async_trait]
impl CrmStateStore for RemoteCollectionStore {
    fn kind(&self) -> &'static str {
        "remote-collection"
    }

    async fn load(&self) -> Result<Vec<CrmState>, StoreError> {
        let url = self.records_url();
        let mut rows = Vec::new();
        let mut page = 1u64;

        loop {
            let query = [
                ("page", page.to_string()),
                ("perPage", "200".to_string()),
                ("sort", "created".to_string()),
            ];
            let value = self.fetcher.get_json(&self.collection, &url, &query).await?;
            let items = value
                .get("items")
                .and_then(|v| v.as_array())
                .ok_or_else(|| StoreError::Shape {
                    url: url.clone(),
                    detail: "missing items array".to_string(),
                })?;

            if items.is_empty() {
                break;
            }

            for item in items {
                match serde_json::from_value::<CrmState>(item.clone()) {
                    Ok(state) => rows.push(normalize_loaded(state)),
                    Err(err) => {
                        warn!(collection = %self.collection, error = %err, "skipping malformed state row");
                    }
                }
            }

            let total_pages = value.get("totalPages").and_then(|v| v.as_u64()).unwrap_or(0);
            if page >= total_pages {
                break;
            }
            page += 1;
        }

        Ok(rows)
    }

    async fn save_edited(&self, edited: &[CrmState]) -> Result<SaveReport, StoreError> {
        let mut report = SaveReport::default();
        for state in edited {
            match self.upsert(state).await {
                Ok(()) => report.record_saved(&state.client_id),
                Err(err) => {
                    warn!(client_id = %state.client_id, error = %err, "state row not persisted");
                    report.record_failure(&state.client_id, err.to_string());
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pflow_core::SalesStatus;
    use tempfile::tempdir;

    fn ts(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).expect("ts").with_timezone(&Utc)
    }

    fn state(id: &str, notes: &str) -> CrmState {
        let mut row = CrmState::new_for(id, SalesStatus::NotContacted, ts("2024-06-01T12:00:00Z"));
        row.notes = notes.to_string();
        row
    }

    #[test]
    fn upload_hashing_is_stable() {
        let hash = ImportArchive::sha256_hex(b"abc");
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn archived_bytes_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let archive = ImportArchive::new(dir.path());
        let received_at = ts("2026-02-24T12:00:00Z");

        let first = archive
            .store_bytes(received_at, "upload", "xlsx", b"workbook bytes")
            .await
            .expect("first store");
        let second = archive
            .store_bytes(received_at, "upload", "xlsx", b"workbook bytes")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn retry_delays_double_and_cap() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(160),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(160));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(160));
    }

    #[test]
    fn server_errors_and_throttles_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn missing_table_file_loads_as_empty() {
        let dir = tempdir().expect("tempdir");
        let store = LocalCsvStore::new(dir.path().join("crm_state.csv"));
        let rows = store.load().await.expect("load");
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn saving_edits_keeps_untouched_rows_byte_for_byte() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("crm_state.csv");
        let store = LocalCsvStore::new(&path);

        store
            .save_edited(&[state("1", "keep me"), state("2", "stale")])
            .await
            .expect("seed table");
        let before = std::fs::read_to_string(&path).expect("read table");
        let untouched_line = before
            .lines()
            .find(|line| line.starts_with("1,"))
            .expect("row 1 line")
            .to_string();

        let mut edit = state("2", "fresh");
        edit.sales_status = SalesStatus::Negotiating;
        let report = store.save_edited(&[edit]).await.expect("save edit");
        assert!(report.complete());
        assert_eq!(report.saved, vec!["2".to_string()]);

        let after = std::fs::read_to_string(&path).expect("read table");
        assert!(after.lines().any(|line| line == untouched_line));
        assert!(after.contains("fresh"));
        assert!(!after.contains("stale"));
    }

    #[tokio::test]
    async fn resaving_identical_rows_changes_nothing() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("crm_state.csv");
        let store = LocalCsvStore::new(&path);

        let rows = vec![state("1", "keep me"), state("2", "ditto")];
        store.save_edited(&rows).await.expect("first save");
        let first = std::fs::read_to_string(&path).expect("read table");

        store.save_edited(&[rows[1].clone()]).await.expect("re-save");
        let second = std::fs::read_to_string(&path).expect("read table");

        assert_eq!(first, second);
        assert_eq!(store.load().await.expect("load").len(), 2);
    }

    #[tokio::test]
    async fn empty_contact_fields_load_as_untouched() {
        let dir = tempdir().expect("tempdir");
        let store = LocalCsvStore::new(dir.path().join("crm_state.csv"));

        let mut row = state("1", "");
        row.phone = Some(String::new());
        row.email = Some("owner@example.com".to_string());
        store.save_edited(&[row]).await.expect("save");

        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].phone, None);
        assert_eq!(loaded[0].email.as_deref(), Some("owner@example.com"));
    }

    #[test]
    fn remote_urls_and_bodies_are_wellformed() {
        let fetcher = JsonFetcher::new(HttpClientConfig::default()).expect("fetcher");
        let store = RemoteCollectionStore::new(fetcher, "https://cms.example.com/", "crm_clients");
        assert_eq!(
            store.records_url(),
            "https://cms.example.com/api/collections/crm_clients/records"
        );

        let mut row = state("7", "call back");
        row.sales_status = SalesStatus::Negotiating;
        let patch = patch_body(&row);
        assert_eq!(patch["sales_status"], "Negotiating");
        assert_eq!(patch["notes"], "call back");
        assert!(patch.get("phone").is_none());
        assert!(patch.get("client_id").is_none());

        row.phone = Some("11987654321".to_string());
        let create = create_body(&row);
        assert_eq!(create["client_id"], "7");
        assert_eq!(create["phone"], "11987654321");
    }
}
