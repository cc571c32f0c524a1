//! Cycle orchestration: normalize raw drafts, merge them with persisted
//! state, derive the working view, and drive outreach and reports.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use pflow_adapters::{
    ClientDraft, RemoteCollectionLoader, RemoteView, SourceLoader, WorkbookLoader,
};
use pflow_core::{
    derive_recency, effective_category, whatsapp_ready, ClientRecord, CrmState, RecencyBand,
    SalesStatus, SECTOR_UNDEFINED, SENTINEL_DAYS, TAX_ID_UNKNOWN,
};
use pflow_store::{
    BackoffPolicy, CrmStateStore, HttpClientConfig, JsonFetcher, LocalCsvStore,
    RemoteCollectionStore, SaveReport,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use strsim::jaro_winkler;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pflow-pipeline";

/// Gap, in days, after which the outreach script switches to reactivation.
pub const REACTIVATION_AFTER_DAYS: i64 = 30;

/// Below this Jaro-Winkler similarity a focus query matches nothing.
pub const FOCUS_SIMILARITY_FLOOR: f64 = 0.55;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub crm_table_path: PathBuf,
    pub rules_path: PathBuf,
    /// Workbook consulted when no remote source is configured.
    pub source_workbook: Option<PathBuf>,
    pub remote_base_url: Option<String>,
    pub remote_token: Option<String>,
    /// Remote collection holding the persisted state table.
    pub state_collection: String,
    /// Remote collection the source loader lists.
    pub source_collection: String,
    pub source_filter: Option<String>,
    pub default_status: SalesStatus,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Webhook relay that owns actual message delivery.
    pub send_webhook: Option<String>,
    pub dispatch_pause_min_ms: u64,
    pub dispatch_pause_max_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("./data");
        Self {
            crm_table_path: data_dir.join("crm_state.csv"),
            data_dir,
            rules_path: PathBuf::from("./rules/suggestions.yaml"),
            source_workbook: None,
            remote_base_url: None,
            remote_token: None,
            state_collection: "crm_clients".to_string(),
            source_collection: "clients".to_string(),
            source_filter: None,
            default_status: SalesStatus::NotContacted,
            user_agent: format!("pflow/{}", env!("CARGO_PKG_VERSION")),
            http_timeout_secs: 20,
            send_webhook: None,
            dispatch_pause_min_ms: 800,
            dispatch_pause_max_ms: 2500,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let data_dir = std::env::var("PFLOW_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let crm_table_path = std::env::var("PFLOW_CRM_TABLE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("crm_state.csv"));

        Self {
            crm_table_path,
            rules_path: std::env::var("PFLOW_RULES")
                .map(PathBuf::from)
                .unwrap_or(defaults.rules_path),
            source_workbook: std::env::var("PFLOW_SOURCE_WORKBOOK")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            remote_base_url: std::env::var("PFLOW_REMOTE_URL")
                .ok()
                .filter(|v| !v.is_empty()),
            remote_token: std::env::var("PFLOW_REMOTE_TOKEN")
                .ok()
                .filter(|v| !v.is_empty()),
            state_collection: std::env::var("PFLOW_STATE_COLLECTION")
                .unwrap_or(defaults.state_collection),
            source_collection: std::env::var("PFLOW_SOURCE_COLLECTION")
                .unwrap_or(defaults.source_collection),
            source_filter: std::env::var("PFLOW_SOURCE_FILTER")
                .ok()
                .filter(|v| !v.is_empty()),
            default_status: match std::env::var("PFLOW_DEFAULT_STATUS") {
                Ok(value) if value.eq_ignore_ascii_case("new") => SalesStatus::New,
                _ => SalesStatus::NotContacted,
            },
            user_agent: std::env::var("PFLOW_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_u64("PFLOW_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            send_webhook: std::env::var("PFLOW_SEND_WEBHOOK")
                .ok()
                .filter(|v| !v.is_empty()),
            dispatch_pause_min_ms: env_u64(
                "PFLOW_DISPATCH_PAUSE_MIN_MS",
                defaults.dispatch_pause_min_ms,
            ),
            dispatch_pause_max_ms: env_u64(
                "PFLOW_DISPATCH_PAUSE_MAX_MS",
                defaults.dispatch_pause_max_ms,
            ),
            data_dir,
        }
    }

    pub fn archive_root(&self) -> PathBuf {
        self.data_dir.join("archive")
    }

    pub fn reports_root(&self) -> PathBuf {
        self.data_dir.join("reports")
    }

    pub fn dispatch_log_path(&self) -> PathBuf {
        self.data_dir.join("dispatch_log.jsonl")
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn fetcher_from_config(config: &PipelineConfig) -> Result<JsonFetcher> {
    JsonFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        bearer_token: config.remote_token.clone(),
        backoff: BackoffPolicy::default(),
    })
}

/// Remote when a base URL is configured, local CSV otherwise.
pub fn store_from_config(config: &PipelineConfig) -> Result<Box<dyn CrmStateStore>> {
    match &config.remote_base_url {
        Some(base_url) => {
            let fetcher = fetcher_from_config(config)?;
            Ok(Box::new(RemoteCollectionStore::new(
                fetcher,
                base_url.clone(),
                config.state_collection.clone(),
            )))
        }
        None => Ok(Box::new(LocalCsvStore::new(config.crm_table_path.clone()))),
    }
}

pub fn remote_loader_from_config(config: &PipelineConfig) -> Result<RemoteCollectionLoader> {
    let base_url = config
        .remote_base_url
        .clone()
        .context("PFLOW_REMOTE_URL is not set")?;
    let fetcher = fetcher_from_config(config)?;
    let views = vec![RemoteView {
        collection: config.source_collection.clone(),
        filter: config.source_filter.clone(),
        category: None,
    }];
    Ok(RemoteCollectionLoader::new(fetcher, base_url, views))
}

/// Whichever source the configuration names: remote collection first,
/// local workbook second.
pub fn loader_from_config(config: &PipelineConfig) -> Result<Box<dyn SourceLoader>> {
    if config.remote_base_url.is_some() {
        return Ok(Box::new(remote_loader_from_config(config)?));
    }
    match &config.source_workbook {
        Some(path) => Ok(Box::new(WorkbookLoader::new(path.clone()))),
        None => anyhow::bail!("no source configured: set PFLOW_REMOTE_URL or PFLOW_SOURCE_WORKBOOK"),
    }
}

/// One clock reading per cycle. Every derived figure and stamp in the same
/// cycle uses this instant so a row cannot disagree with its own report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub now: DateTime<Utc>,
    /// Operator focus selection carried across the cycle; resolved
    /// against the merged view by [`SessionContext::focus`].
    pub focus_query: Option<String>,
}

impl SessionContext {
    pub fn begin() -> Self {
        Self::begin_at(Utc::now())
    }

    pub fn begin_at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            focus_query: None,
        }
    }

    pub fn with_focus(mut self, query: impl Into<String>) -> Self {
        self.focus_query = Some(query.into());
        self
    }

    pub fn today(&self) -> NaiveDate {
        self.now.date_naive()
    }

    /// Resolves the carried focus query against a merged view.
    pub fn focus<'a>(&self, rows: &'a [MergedClient]) -> Option<&'a MergedClient> {
        self.focus_query
            .as_deref()
            .and_then(|query| find_focus(rows, query))
    }
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("source partition '{partition}' has no client id column")]
    MissingIdentityColumn { partition: String },
}

/// Strips the float-formatting ".0" suffix spreadsheet exports put on
/// numeric ids. Only applies when the rest of the id is all digits, so
/// version-style ids like "2.3.0" pass through. Idempotent.
pub fn normalize_identifier(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(stem) = trimmed.strip_suffix(".0") {
        if !stem.is_empty() && stem.chars().all(|c| c.is_ascii_digit()) {
            return stem.to_string();
        }
    }
    trimmed.to_string()
}

fn clean_contact(raw: Option<&str>) -> String {
    let value = raw.unwrap_or_default().trim();
    if value.is_empty()
        || value.eq_ignore_ascii_case("nan")
        || value.eq_ignore_ascii_case("none")
        || value.eq_ignore_ascii_case("null")
    {
        String::new()
    } else {
        value.to_string()
    }
}

/// Day-first date parsing with ISO fallbacks. Datetime payloads keep
/// their date part; anything unparseable is treated as no date.
pub fn parse_day_first_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    const DATE_FORMATS: &[&str] = &["%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%d/%m/%y", "%Y-%m-%d"];
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(date);
        }
    }

    const DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%d/%m/%Y %H:%M:%S",
        "%d/%m/%Y %H:%M",
    ];
    for format in DATETIME_FORMATS {
        if let Ok(datetime) = chrono::NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(datetime.date());
        }
    }

    DateTime::parse_from_rfc3339(trimmed)
        .ok()
        .map(|dt| dt.date_naive())
}

/// Guarantees the minimum schema over raw drafts.
///
/// A partition without an identity column at all is fatal; a blank id cell
/// in an otherwise valid partition passes through as an empty id. Running
/// the output back through changes nothing.
pub fn normalize_drafts(drafts: &[ClientDraft]) -> Result<Vec<ClientRecord>, NormalizeError> {
    let mut records = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let raw_id = match &draft.client_id {
            Some(value) => value,
            None => {
                return Err(NormalizeError::MissingIdentityColumn {
                    partition: draft.partition.clone(),
                })
            }
        };

        records.push(ClientRecord {
            client_id: normalize_identifier(raw_id),
            display_name: draft
                .display_name
                .as_deref()
                .unwrap_or_default()
                .trim()
                .to_string(),
            tax_id: draft
                .tax_id
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .unwrap_or(TAX_ID_UNKNOWN)
                .to_string(),
            sector: draft
                .sector
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .unwrap_or(SECTOR_UNDEFINED)
                .to_string(),
            phone: clean_contact(draft.phone.as_deref()),
            email: clean_contact(draft.email.as_deref()),
            last_activity_at: draft
                .last_activity_raw
                .as_deref()
                .and_then(parse_day_first_date),
            source_category: draft.source_category,
        });
    }
    Ok(records)
}

/// One row of the merged working view: source fields after the persisted
/// overrides, the state row backing it, and everything derived this cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedClient {
    pub record: ClientRecord,
    pub state: CrmState,
    /// No persisted state row existed for this id before the merge.
    pub is_new: bool,
    pub days_since_activity: i64,
    pub recency_display: String,
    pub recency_band: RecencyBand,
    pub effective_category: String,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub rows: Vec<MergedClient>,
    pub duplicate_state_rows: usize,
}

/// Left-joins source records with persisted state.
///
/// Total over the source: exactly one merged row per record, in source
/// order. Unmatched records get a fresh default state row. A present
/// persisted contact field overrides the source value; duplicate state
/// rows for one id keep the first encountered. Rows with an empty id
/// never join and always read as new.
pub fn merge_states(
    records: &[ClientRecord],
    states: &[CrmState],
    default_status: SalesStatus,
    session: &SessionContext,
) -> MergeOutcome {
    let mut by_id: HashMap<&str, &CrmState> = HashMap::new();
    let mut duplicate_state_rows = 0usize;
    for state in states {
        if state.client_id.is_empty() {
            continue;
        }
        if by_id.contains_key(state.client_id.as_str()) {
            duplicate_state_rows += 1;
            warn!(client_id = %state.client_id, "duplicate state row, keeping the first");
            continue;
        }
        by_id.insert(state.client_id.as_str(), state);
    }

    let today = session.today();
    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        let existing = if record.client_id.is_empty() {
            None
        } else {
            by_id.get(record.client_id.as_str()).copied()
        };
        let is_new = existing.is_none();
        let state = match existing {
            Some(state) => state.clone(),
            None => CrmState::new_for(record.client_id.clone(), default_status, session.now),
        };

        let mut record = record.clone();
        if let Some(phone) = &state.phone {
            record.phone = phone.clone();
        }
        if let Some(email) = &state.email {
            record.email = email.clone();
        }

        let recency = derive_recency(record.last_activity_at, today);
        let category = effective_category(
            record.source_category,
            state.sales_status,
            default_status,
            recency.band,
        );
        rows.push(MergedClient {
            record,
            state,
            is_new,
            days_since_activity: recency.days_since_activity,
            recency_display: recency.display,
            recency_band: recency.band,
            effective_category: category,
            suggestions: Vec::new(),
        });
    }

    MergeOutcome {
        rows,
        duplicate_state_rows,
    }
}

/// Stamps edited rows with the cycle clock and persists them. Rows without
/// an id are dropped before they can collide in the store.
pub async fn commit_edits(
    store: &dyn CrmStateStore,
    session: &SessionContext,
    mut edits: Vec<CrmState>,
) -> Result<SaveReport> {
    edits.retain(|edit| {
        if edit.client_id.is_empty() {
            warn!("dropping edit without a client id");
            return false;
        }
        true
    });
    for edit in &mut edits {
        edit.last_interaction_at = session.now;
    }
    store
        .save_edited(&edits)
        .await
        .context("persisting edited state rows")
}

#[derive(Debug, Clone, Deserialize)]
struct SuggestionRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<SuggestionRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SuggestionRule {
    pub suggestion: String,
    pub contains_any: Vec<String>,
}

/// Keyword rules mapping sector text to product suggestions, loaded from
/// YAML. A missing file is an empty rule set; a malformed file is a
/// configuration error.
#[derive(Debug, Clone, Default)]
pub struct SuggestionRules {
    rules: Vec<SuggestionRule>,
}

impl SuggestionRules {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::empty()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        let file: SuggestionRulesFile = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing suggestion rules {}", path.display()))?;

        let mut rules = file.rules;
        // Rules with longer keywords rank first, like partition keywords.
        rules.sort_by_key(|rule| {
            std::cmp::Reverse(rule.contains_any.iter().map(|k| k.len()).max().unwrap_or(0))
        });
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Case-insensitive any-keyword match over the sector text. Accumulates
    /// every matching rule's suggestion once, in rule order.
    pub fn apply(&self, sector: &str) -> Vec<String> {
        let haystack = sector.to_lowercase();
        let mut suggestions = Vec::new();
        for rule in &self.rules {
            let hit = rule
                .contains_any
                .iter()
                .any(|keyword| haystack.contains(&keyword.to_lowercase()));
            if hit && !suggestions.contains(&rule.suggestion) {
                suggestions.push(rule.suggestion.clone());
            }
        }
        suggestions
    }
}

pub fn apply_suggestions(rows: &mut [MergedClient], rules: &SuggestionRules) {
    for row in rows {
        row.suggestions = rules.apply(&row.record.sector);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutreachDraft {
    pub subject: String,
    pub body: String,
}

/// Picks the outreach variant from merged fields only: reactivation for a
/// long gap, an intro for brand-new relationships, a plain check-in
/// otherwise. The sentinel day count never reads as a real gap.
pub fn outreach_draft(row: &MergedClient) -> OutreachDraft {
    let name = if row.record.display_name.is_empty() {
        "there"
    } else {
        row.record.display_name.as_str()
    };

    if row.days_since_activity > REACTIVATION_AFTER_DAYS && row.days_since_activity != SENTINEL_DAYS
    {
        return OutreachDraft {
            subject: format!("It's been {} days", row.days_since_activity),
            body: format!(
                "Hi {name}! We noticed it's been {} days since your last purchase. \
                 We'd love to catch up and hear how the business is doing.",
                row.days_since_activity
            ),
        };
    }

    if row.state.sales_status == SalesStatus::New {
        let body = if row.record.sector == SECTOR_UNDEFINED {
            format!("Hi {name}! Welcome aboard. Can we set up a quick intro call this week?")
        } else {
            format!(
                "Hi {name}! Welcome aboard. We work with several {} businesses \
                 and would love to show you what fits yours.",
                row.record.sector
            )
        };
        return OutreachDraft {
            subject: "Welcome aboard".to_string(),
            body,
        };
    }

    OutreachDraft {
        subject: "Quick check-in".to_string(),
        body: format!("Hi {name}! Just checking in. Anything we can help with this week?"),
    }
}

/// Portfolio KPIs computed over the merged view each cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PortfolioSummary {
    pub total: usize,
    pub by_category: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    /// Rows still sitting at the configured default status.
    pub pending_contact: usize,
    pub negotiating: usize,
    pub whatsapp_ready: usize,
    /// Ids that had no persisted state row before this cycle, source order.
    pub new_clients: Vec<String>,
}

pub fn summarize(rows: &[MergedClient], default_status: SalesStatus) -> PortfolioSummary {
    let mut summary = PortfolioSummary {
        total: rows.len(),
        ..PortfolioSummary::default()
    };
    for row in rows {
        *summary
            .by_category
            .entry(row.effective_category.clone())
            .or_default() += 1;
        *summary
            .by_status
            .entry(row.state.sales_status.label().to_string())
            .or_default() += 1;
        if row.state.sales_status == default_status {
            summary.pending_contact += 1;
        }
        if row.state.sales_status == SalesStatus::Negotiating {
            summary.negotiating += 1;
        }
        if whatsapp_ready(&row.record.phone) {
            summary.whatsapp_ready += 1;
        }
        if row.is_new && !row.record.client_id.is_empty() {
            summary.new_clients.push(row.record.client_id.clone());
        }
    }
    summary
}

/// Finds the row a focus query names: exact display-name match first, then
/// the best fuzzy match at or above the similarity floor. Ties keep the
/// earliest row.
pub fn find_focus<'a>(rows: &'a [MergedClient], query: &str) -> Option<&'a MergedClient> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }

    if let Some(exact) = rows
        .iter()
        .find(|row| row.record.display_name.to_lowercase() == needle)
    {
        return Some(exact);
    }

    let mut best: Option<(&MergedClient, f64)> = None;
    for row in rows {
        let score = jaro_winkler(&row.record.display_name.to_lowercase(), &needle);
        let better = match best {
            Some((_, current)) => score > current,
            None => true,
        };
        if better {
            best = Some((row, score));
        }
    }
    best.filter(|(_, score)| *score >= FOCUS_SIMILARITY_FLOOR)
        .map(|(row, _)| row)
}

/// Rows eligible for a bulk send: still at the default status, with an
/// email address and an id. Source order is preserved.
pub fn dispatch_targets(rows: &[MergedClient], default_status: SalesStatus) -> Vec<MergedClient> {
    rows.iter()
        .filter(|row| {
            row.state.sales_status == default_status
                && !row.record.email.trim().is_empty()
                && !row.record.client_id.is_empty()
        })
        .cloned()
        .collect()
}

/// Outbound channel mechanics live behind this seam.
#[async_trait]
pub trait MessageSender: Send + Sync {
    fn channel(&self) -> &str;
    async fn send(&self, message: &OutboundMessage) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub client_id: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// Posts each outbound message to a configured webhook relay that owns
/// actual delivery, so mail credentials never live in this process.
#[derive(Debug, Clone)]
pub struct WebhookSender {
    fetcher: JsonFetcher,
    url: String,
}

impl WebhookSender {
    pub fn new(fetcher: JsonFetcher, url: impl Into<String>) -> Self {
        Self {
            fetcher,
            url: url.into(),
        }
    }
}

#[async_trait]
impl MessageSender for WebhookSender {
    fn channel(&self) -> &str {
        "email-webhook"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        let body = serde_json::to_value(message).context("serializing outbound message")?;
        self.fetcher
            .post_json(&self.url, &body)
            .await
            .with_context(|| format!("posting to {}", self.url))?;
        Ok(())
    }
}

pub fn webhook_sender_from_config(config: &PipelineConfig) -> Result<WebhookSender> {
    let url = config
        .send_webhook
        .clone()
        .context("PFLOW_SEND_WEBHOOK is not set")?;
    Ok(WebhookSender::new(fetcher_from_config(config)?, url))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchLogEntry {
    pub run_id: Uuid,
    pub client_id: String,
    pub channel: String,
    pub sent_at: DateTime<Utc>,
    pub subject: String,
    /// "sent" or "send_failed".
    pub outcome: String,
}

/// Append-only JSONL log of send attempts. For a successful send the
/// append is confirmed before any status mutation, so the log never
/// understates what went out.
#[derive(Debug, Clone)]
pub struct DispatchLog {
    path: PathBuf,
}

impl DispatchLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: &DispatchLogEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut line = serde_json::to_vec(entry).context("serializing dispatch log entry")?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.write_all(&line)
            .await
            .with_context(|| format!("appending to {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", self.path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DispatchOutcome {
    /// Sent, logged, status updated.
    Sent,
    Skipped { reason: String },
    SendFailed { reason: String },
    /// Sent, but the log append failed; status left untouched.
    LogFailed { reason: String },
    /// Sent and logged, but the status update did not persist.
    LogOnly { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchRecord {
    pub client_id: String,
    pub outcome: DispatchOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchSummary {
    pub run_id: Uuid,
    pub records: Vec<DispatchRecord>,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
    pub log_only: usize,
}

/// Sends to each target strictly in order, pausing a randomized interval
/// between sends. Each message is attempted at most once; failures are
/// reported per record and never retried within the run.
pub async fn run_dispatch(
    targets: &[MergedClient],
    sender: &dyn MessageSender,
    log: &DispatchLog,
    store: &dyn CrmStateStore,
    pause_ms: (u64, u64),
) -> DispatchSummary {
    let run_id = Uuid::new_v4();
    let mut summary = DispatchSummary {
        run_id,
        records: Vec::new(),
        sent: 0,
        skipped: 0,
        failed: 0,
        log_only: 0,
    };

    for (index, row) in targets.iter().enumerate() {
        if index > 0 && pause_ms.1 > 0 {
            let wait = {
                let mut rng = rand::thread_rng();
                rng.gen_range(pause_ms.0.min(pause_ms.1)..=pause_ms.1.max(pause_ms.0))
            };
            tokio::time::sleep(Duration::from_millis(wait)).await;
        }

        let outcome = dispatch_one(row, sender, log, store, run_id).await;
        match &outcome {
            DispatchOutcome::Sent => summary.sent += 1,
            DispatchOutcome::Skipped { .. } => summary.skipped += 1,
            DispatchOutcome::LogOnly { .. } => summary.log_only += 1,
            DispatchOutcome::SendFailed { .. } | DispatchOutcome::LogFailed { .. } => {
                summary.failed += 1
            }
        }
        summary.records.push(DispatchRecord {
            client_id: row.record.client_id.clone(),
            outcome,
        });
    }

    info!(
        run_id = %run_id,
        sent = summary.sent,
        skipped = summary.skipped,
        failed = summary.failed,
        "dispatch run finished"
    );
    summary
}

async fn dispatch_one(
    row: &MergedClient,
    sender: &dyn MessageSender,
    log: &DispatchLog,
    store: &dyn CrmStateStore,
    run_id: Uuid,
) -> DispatchOutcome {
    let recipient = row.record.email.trim();
    if recipient.is_empty() {
        return DispatchOutcome::Skipped {
            reason: "no email address".to_string(),
        };
    }
    if row.record.client_id.is_empty() {
        return DispatchOutcome::Skipped {
            reason: "no client id".to_string(),
        };
    }

    let draft = outreach_draft(row);
    let message = OutboundMessage {
        client_id: row.record.client_id.clone(),
        recipient: recipient.to_string(),
        subject: draft.subject,
        body: draft.body,
    };

    if let Err(err) = sender.send(&message).await {
        warn!(client_id = %message.client_id, error = %err, "send failed");
        // Best effort; the summary already carries the failure.
        let failed_entry = DispatchLogEntry {
            run_id,
            client_id: message.client_id.clone(),
            channel: sender.channel().to_string(),
            sent_at: Utc::now(),
            subject: message.subject.clone(),
            outcome: "send_failed".to_string(),
        };
        if let Err(log_err) = log.append(&failed_entry).await {
            warn!(client_id = %message.client_id, error = %log_err, "could not log failed send");
        }
        return DispatchOutcome::SendFailed {
            reason: err.to_string(),
        };
    }

    let sent_at = Utc::now();
    let entry = DispatchLogEntry {
        run_id,
        client_id: message.client_id.clone(),
        channel: sender.channel().to_string(),
        sent_at,
        subject: message.subject.clone(),
        outcome: "sent".to_string(),
    };
    // Status may only move once the log append is confirmed.
    if let Err(err) = log.append(&entry).await {
        warn!(
            client_id = %message.client_id,
            error = %err,
            "send log append failed, leaving status untouched"
        );
        return DispatchOutcome::LogFailed {
            reason: err.to_string(),
        };
    }

    let mut edited = row.state.clone();
    edited.sales_status = SalesStatus::EmailSent;
    edited.last_interaction_at = sent_at;
    stamp_attempt(&mut edited, sent_at.date_naive());

    match store.save_edited(std::slice::from_ref(&edited)).await {
        Ok(report) if report.complete() => DispatchOutcome::Sent,
        Ok(report) => {
            let reason = report
                .failures
                .first()
                .map(|failure| failure.reason.clone())
                .unwrap_or_else(|| "status not persisted".to_string());
            DispatchOutcome::LogOnly { reason }
        }
        Err(err) => DispatchOutcome::LogOnly {
            reason: err.to_string(),
        },
    }
}

/// Fills the first open attempt slot; a fourth send leaves the slots as-is.
fn stamp_attempt(state: &mut CrmState, today: NaiveDate) {
    if state.first_attempt_at.is_none() {
        state.first_attempt_at = Some(today);
    } else if state.second_attempt_at.is_none() {
        state.second_attempt_at = Some(today);
    } else if state.third_attempt_at.is_none() {
        state.third_attempt_at = Some(today);
    }
}

/// Everything one load-normalize-merge pass produced, before KPIs.
#[derive(Debug, Clone, Default)]
pub struct MergedView {
    pub rows: Vec<MergedClient>,
    pub partitions_loaded: Vec<String>,
    pub partitions_skipped: Vec<String>,
    /// Present when the source failed to load and the cycle ran on an
    /// empty table instead.
    pub load_error: Option<String>,
    pub duplicate_state_rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleRunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: String,
    pub source_origin: String,
    pub store_kind: String,
}

#[derive(Debug)]
pub struct CycleOutcome {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_origin: String,
    pub view: MergedView,
    pub summary: PortfolioSummary,
    pub reports_dir: PathBuf,
}

/// Ties a source loader, a state store and the rule set into one
/// reconciliation cycle, and writes the per-run report artifacts.
pub struct Pipeline {
    config: PipelineConfig,
    store: Box<dyn CrmStateStore>,
    rules: SuggestionRules,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        store: Box<dyn CrmStateStore>,
        rules: SuggestionRules,
    ) -> Self {
        Self {
            config,
            store,
            rules,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn CrmStateStore {
        self.store.as_ref()
    }

    /// Load, normalize and merge without writing any artifacts.
    ///
    /// A source load failure downgrades to an empty table with the cause
    /// recorded, so persisted state still surfaces. A partition without an
    /// identity column and a store failure are real errors.
    pub async fn merged_view(
        &self,
        loader: &dyn SourceLoader,
        session: &SessionContext,
    ) -> Result<MergedView> {
        let (raw, load_error) = match loader.load().await {
            Ok(raw) => (raw, None),
            Err(err) => {
                warn!(origin = loader.origin(), error = %err, "source load failed, cycle runs on an empty table");
                (Default::default(), Some(err.to_string()))
            }
        };

        let records = normalize_drafts(&raw.drafts)?;
        let states = self
            .store
            .load()
            .await
            .context("loading persisted state table")?;
        let outcome = merge_states(&records, &states, self.config.default_status, session);
        let mut rows = outcome.rows;
        apply_suggestions(&mut rows, &self.rules);

        Ok(MergedView {
            rows,
            partitions_loaded: raw.partitions_loaded,
            partitions_skipped: raw.partitions_skipped,
            load_error,
            duplicate_state_rows: outcome.duplicate_state_rows,
        })
    }

    /// Full cycle: merged view, KPIs, and the report directory for the run.
    pub async fn run_cycle(
        &self,
        loader: &dyn SourceLoader,
        session: &SessionContext,
    ) -> Result<CycleOutcome> {
        let run_id = Uuid::new_v4();
        let span = info_span!("cycle", run_id = %run_id, origin = loader.origin());
        self.run_cycle_inner(run_id, loader, session)
            .instrument(span)
            .await
    }

    async fn run_cycle_inner(
        &self,
        run_id: Uuid,
        loader: &dyn SourceLoader,
        session: &SessionContext,
    ) -> Result<CycleOutcome> {
        let started_at = session.now;

        let view = self.merged_view(loader, session).await?;
        let summary = summarize(&view.rows, self.config.default_status);
        let finished_at = Utc::now();

        let record = CycleRunRecord {
            run_id,
            started_at,
            finished_at,
            status: match &view.load_error {
                None => "completed".to_string(),
                Some(error) => format!("empty: {error}"),
            },
            source_origin: loader.origin().to_string(),
            store_kind: self.store.kind().to_string(),
        };
        let reports_dir = self.write_reports(&record, &view, &summary).await?;

        info!(
            run_id = %run_id,
            clients = summary.total,
            new = summary.new_clients.len(),
            "cycle complete"
        );

        Ok(CycleOutcome {
            run_id,
            started_at,
            finished_at,
            source_origin: record.source_origin,
            view,
            summary,
            reports_dir,
        })
    }

    async fn write_reports(
        &self,
        record: &CycleRunRecord,
        view: &MergedView,
        summary: &PortfolioSummary,
    ) -> Result<PathBuf> {
        let stamp = record.started_at.format("%Y%m%d_%H%M%S");
        let reports_dir = self
            .config
            .reports_root()
            .join(format!("{stamp}-{}", record.run_id));
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let mut lines = vec![
            "# Prospect Flow Cycle Report".to_string(),
            String::new(),
            format!("- Run ID: `{}`", record.run_id),
            format!("- Started: {}", record.started_at),
            format!("- Finished: {}", record.finished_at),
            format!("- Source: {}", record.source_origin),
            format!("- Store: {}", record.store_kind),
            format!("- Status: {}", record.status),
            format!("- Clients: {}", summary.total),
            format!("- Pending contact: {}", summary.pending_contact),
            format!("- Negotiating: {}", summary.negotiating),
            format!("- WhatsApp-ready: {}", summary.whatsapp_ready),
        ];

        if !view.partitions_loaded.is_empty() {
            lines.push(format!(
                "- Partitions loaded: {}",
                view.partitions_loaded.join(", ")
            ));
        }
        if !view.partitions_skipped.is_empty() {
            lines.push(format!(
                "- Partitions skipped: {}",
                view.partitions_skipped.join(", ")
            ));
        }
        if view.duplicate_state_rows > 0 {
            lines.push(format!(
                "- Duplicate state rows ignored: {}",
                view.duplicate_state_rows
            ));
        }

        if let Some(error) = &view.load_error {
            lines.push(String::new());
            lines.push(format!(
                "**No source data this cycle:** {error}. Persisted state is untouched; retry the import."
            ));
        }

        if !summary.by_category.is_empty() {
            lines.push(String::new());
            lines.push("## Categories".to_string());
            lines.push(String::new());
            lines.push("| Category | Clients |".to_string());
            lines.push("| --- | --- |".to_string());
            for (label, count) in &summary.by_category {
                lines.push(format!("| {label} | {count} |"));
            }
        }

        if !summary.by_status.is_empty() {
            lines.push(String::new());
            lines.push("## Statuses".to_string());
            lines.push(String::new());
            lines.push("| Status | Clients |".to_string());
            lines.push("| --- | --- |".to_string());
            for (label, count) in &summary.by_status {
                lines.push(format!("| {label} | {count} |"));
            }
        }

        if !summary.new_clients.is_empty() {
            lines.push(String::new());
            lines.push("## New clients".to_string());
            lines.push(String::new());
            for id in &summary.new_clients {
                lines.push(format!("- `{id}`"));
            }
        }
        lines.push(String::new());

        let report_path = reports_dir.join("report.md");
        fs::write(&report_path, lines.join("\n"))
            .await
            .with_context(|| format!("writing {}", report_path.display()))?;

        let merged = json!({
            "cycle_run": record,
            "clients": view.rows,
        });
        let merged_path = reports_dir.join("merged.json");
        let merged_bytes =
            serde_json::to_vec_pretty(&merged).context("serializing merged snapshot")?;
        fs::write(&merged_path, merged_bytes)
            .await
            .with_context(|| format!("writing {}", merged_path.display()))?;

        Ok(reports_dir)
    }
}
