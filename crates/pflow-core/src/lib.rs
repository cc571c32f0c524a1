//! Core domain model and pure derivations for Prospect Flow.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "pflow-core";

/// Days-without-activity value assigned when no activity date is known.
pub const SENTINEL_DAYS: i64 = 9999;

/// Shown in place of a day count when no activity date is known.
pub const RECENCY_PLACEHOLDER: &str = "—";

/// Idle for more than this many days means Critical.
pub const CRITICAL_AFTER_DAYS: i64 = 365;

/// Idle for more than this many days (within the critical window) means Inactive.
pub const INACTIVE_AFTER_DAYS: i64 = 180;

/// Sector value applied when the source omits the column.
pub const SECTOR_UNDEFINED: &str = "Undefined";

/// Tax id value applied when the source omits the column.
pub const TAX_ID_UNKNOWN: &str = "-";

/// Minimum digit count for a phone number to be dialable over WhatsApp.
pub const WHATSAPP_MIN_DIGITS: usize = 10;

/// Which source partition a record arrived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceCategory {
    Active,
    Inactive,
    Cold,
}

impl SourceCategory {
    pub fn label(self) -> &'static str {
        match self {
            SourceCategory::Active => "Active",
            SourceCategory::Inactive => "Inactive",
            SourceCategory::Cold => "Cold",
        }
    }
}

impl std::fmt::Display for SourceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Sales pipeline stage tracked per client. Serialized with the labels the
/// persisted table and the collection API use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SalesStatus {
    #[serde(rename = "Not Contacted")]
    NotContacted,
    #[serde(rename = "Attempting Contact")]
    AttemptingContact,
    #[serde(rename = "Negotiating")]
    Negotiating,
    #[serde(rename = "Closed")]
    Closed,
    #[serde(rename = "Lost")]
    Lost,
    #[serde(rename = "New")]
    New,
    #[serde(rename = "Email Sent")]
    EmailSent,
}

impl SalesStatus {
    pub fn label(self) -> &'static str {
        match self {
            SalesStatus::NotContacted => "Not Contacted",
            SalesStatus::AttemptingContact => "Attempting Contact",
            SalesStatus::Negotiating => "Negotiating",
            SalesStatus::Closed => "Closed",
            SalesStatus::Lost => "Lost",
            SalesStatus::New => "New",
            SalesStatus::EmailSent => "Email Sent",
        }
    }

    /// Every status an operator can assign, in pipeline order.
    pub fn all() -> &'static [SalesStatus] {
        &[
            SalesStatus::NotContacted,
            SalesStatus::AttemptingContact,
            SalesStatus::Negotiating,
            SalesStatus::Closed,
            SalesStatus::Lost,
            SalesStatus::New,
            SalesStatus::EmailSent,
        ]
    }
}

impl std::fmt::Display for SalesStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Threshold-derived recency classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecencyBand {
    Active,
    Inactive,
    Critical,
}

impl RecencyBand {
    pub fn label(self) -> &'static str {
        match self {
            RecencyBand::Active => "Active",
            RecencyBand::Inactive => "Inactive",
            RecencyBand::Critical => "Critical",
        }
    }
}

impl std::fmt::Display for RecencyBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One business entity as re-derived from the external source each cycle.
/// Never mutated in place; edits that must persist go through [`CrmState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub client_id: String,
    pub display_name: String,
    pub tax_id: String,
    pub sector: String,
    pub phone: String,
    pub email: String,
    pub last_activity_at: Option<NaiveDate>,
    /// `None` when the origin does not partition records by category.
    pub source_category: Option<SourceCategory>,
}

/// Persisted sales-tracking fields for one client, keyed by `client_id`.
///
/// `phone`/`email` are `None` until the operator touches them; a present
/// value overrides whatever the source supplies on the next merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmState {
    pub client_id: String,
    pub sales_status: SalesStatus,
    pub called: bool,
    pub notes: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub last_interaction_at: DateTime<Utc>,
    #[serde(default)]
    pub first_attempt_at: Option<NaiveDate>,
    #[serde(default)]
    pub second_attempt_at: Option<NaiveDate>,
    #[serde(default)]
    pub third_attempt_at: Option<NaiveDate>,
    #[serde(default)]
    pub cadence_notes: String,
}

impl CrmState {
    /// A fresh row for a client with no prior state.
    pub fn new_for(
        client_id: impl Into<String>,
        default_status: SalesStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            sales_status: default_status,
            called: false,
            notes: String::new(),
            phone: None,
            email: None,
            last_interaction_at: now,
            first_attempt_at: None,
            second_attempt_at: None,
            third_attempt_at: None,
            cadence_notes: String::new(),
        }
    }
}

/// Recency figures recomputed every cycle; never persisted as truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recency {
    pub days_since_activity: i64,
    /// Day count as text, or the placeholder when no date is known.
    pub display: String,
    pub band: RecencyBand,
}

/// Computes days-without-activity and its band from the activity date.
///
/// Absent date means the sentinel day count and the display placeholder.
pub fn derive_recency(last_activity_at: Option<NaiveDate>, today: NaiveDate) -> Recency {
    match last_activity_at {
        Some(date) => {
            let days = (today - date).num_days();
            Recency {
                days_since_activity: days,
                display: days.to_string(),
                band: band_for_days(days),
            }
        }
        None => Recency {
            days_since_activity: SENTINEL_DAYS,
            display: RECENCY_PLACEHOLDER.to_string(),
            band: band_for_days(SENTINEL_DAYS),
        },
    }
}

pub fn band_for_days(days: i64) -> RecencyBand {
    if days > CRITICAL_AFTER_DAYS {
        RecencyBand::Critical
    } else if days > INACTIVE_AFTER_DAYS {
        RecencyBand::Inactive
    } else {
        RecencyBand::Active
    }
}

/// Category shown for a record: the source partition label when one exists,
/// else a status the operator explicitly assigned, else the derived band.
pub fn effective_category(
    source_category: Option<SourceCategory>,
    sales_status: SalesStatus,
    default_status: SalesStatus,
    band: RecencyBand,
) -> String {
    if let Some(category) = source_category {
        return category.label().to_string();
    }
    if sales_status != default_status {
        return sales_status.label().to_string();
    }
    band.label().to_string()
}

/// A phone is WhatsApp-ready when it carries enough digits to dial.
pub fn whatsapp_ready(phone: &str) -> bool {
    phone.chars().filter(|c| c.is_ascii_digit()).count() >= WHATSAPP_MIN_DIGITS
}

/// Last-write-wins merge of edited rows into an existing state table.
///
/// Rows whose id appears in `edited` are dropped from `existing`, then the
/// edited rows are appended. Untouched rows keep their content and order.
pub fn reconcile_states(existing: &[CrmState], edited: &[CrmState]) -> Vec<CrmState> {
    let edited_ids: std::collections::HashSet<&str> =
        edited.iter().map(|row| row.client_id.as_str()).collect();
    let mut next: Vec<CrmState> = existing
        .iter()
        .filter(|row| !edited_ids.contains(row.client_id.as_str()))
        .cloned()
        .collect();
    next.extend(edited.iter().cloned());
    next
}
