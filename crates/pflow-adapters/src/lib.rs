//! Source loader contracts + workbook and remote-collection implementations.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use calamine::{open_workbook_auto, Reader};
use pflow_core::SourceCategory;
use pflow_store::{FetchError, JsonFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "pflow-adapters";

/// Partition-name keywords in priority order. Longer, more specific
/// keywords come first so "INATIVO" never falls through to "ATIVO".
pub const CATEGORY_KEYWORDS: &[(&str, SourceCategory)] = &[
    ("INATIVO", SourceCategory::Inactive),
    ("INACTIVE", SourceCategory::Inactive),
    ("FRIO", SourceCategory::Cold),
    ("COLD", SourceCategory::Cold),
    ("ATIVO", SourceCategory::Active),
    ("ACTIVE", SourceCategory::Active),
];

const CLIENT_ID_ALIASES: &[&str] = &["client_id", "pj_id"];
const DISPLAY_NAME_ALIASES: &[&str] = &["display_name", "razao_social", "nome"];
const TAX_ID_ALIASES: &[&str] = &["tax_id", "cnpj"];
const SECTOR_ALIASES: &[&str] = &["sector", "area_atuacao_nome", "area_atuacao"];
const PHONE_ALIASES: &[&str] = &["phone", "telefone_1", "telefone"];
const EMAIL_ALIASES: &[&str] = &["email", "email_1"];
const LAST_ACTIVITY_ALIASES: &[&str] = &["last_activity", "data_exibicao", "ultima_compra"];

const ALIAS_TABLES: &[&[&str]] = &[
    CLIENT_ID_ALIASES,
    DISPLAY_NAME_ALIASES,
    TAX_ID_ALIASES,
    SECTOR_ALIASES,
    PHONE_ALIASES,
    EMAIL_ALIASES,
    LAST_ACTIVITY_ALIASES,
];

/// Field projection for remote listings: every alias the mapper reads, so
/// responses stay small and unknown extra columns never travel.
fn projection_fields() -> String {
    ALIAS_TABLES
        .iter()
        .flat_map(|aliases| aliases.iter())
        .copied()
        .collect::<Vec<_>>()
        .join(",")
}

/// Case-insensitive substring match in keyword priority order. `None`
/// means the partition is skipped, not an error.
pub fn categorize_partition(name: &str) -> Option<SourceCategory> {
    let upper = name.to_uppercase();
    CATEGORY_KEYWORDS
        .iter()
        .find(|(keyword, _)| upper.contains(keyword))
        .map(|(_, category)| *category)
}

/// Pre-normalization row handed from loaders into the pipeline.
///
/// `client_id` is `None` when the partition carried no identity column at
/// all; an empty string means the column exists but the cell was blank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDraft {
    pub client_id: Option<String>,
    pub display_name: Option<String>,
    pub tax_id: Option<String>,
    pub sector: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub last_activity_raw: Option<String>,
    pub source_category: Option<SourceCategory>,
    pub partition: String,
}

/// One named partition of a source, cells already projected to strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPartition {
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Everything one loader run produced.
#[derive(Debug, Clone, Default)]
pub struct RawTable {
    pub drafts: Vec<ClientDraft>,
    pub partitions_loaded: Vec<String>,
    pub partitions_skipped: Vec<String>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unreadable workbook {path}: {detail}")]
    Workbook { path: String, detail: String },
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("unexpected response shape from {url}: {detail}")]
    Shape { url: String, detail: String },
}

/// A loader obtains the raw client table from one origin. Failures are
/// typed so callers can tell "failed to load" from "zero records exist".
#[async_trait]
pub trait SourceLoader: Send + Sync {
    fn origin(&self) -> &str;
    async fn load(&self) -> Result<RawTable, LoadError>;
}

fn header_index(headers: &[String], aliases: &[&str]) -> Option<usize> {
    headers.iter().position(|header| {
        let normalized = header.trim().to_lowercase();
        aliases.iter().any(|alias| normalized == *alias)
    })
}

/// Maps one partition's rows to drafts using header aliases. The identity
/// column keeps its present/absent distinction for the normalizer.
pub fn partition_to_drafts(
    partition: &RawPartition,
    category: Option<SourceCategory>,
) -> Vec<ClientDraft> {
    let id_col = header_index(&partition.headers, CLIENT_ID_ALIASES);
    let name_col = header_index(&partition.headers, DISPLAY_NAME_ALIASES);
    let tax_col = header_index(&partition.headers, TAX_ID_ALIASES);
    let sector_col = header_index(&partition.headers, SECTOR_ALIASES);
    let phone_col = header_index(&partition.headers, PHONE_ALIASES);
    let email_col = header_index(&partition.headers, EMAIL_ALIASES);
    let activity_col = header_index(&partition.headers, LAST_ACTIVITY_ALIASES);

    partition
        .rows
        .iter()
        .map(|row| {
            let cell = |idx: Option<usize>| -> Option<String> {
                idx.and_then(|i| row.get(i)).map(|v| v.trim().to_string())
            };
            ClientDraft {
                client_id: id_col
                    .map(|i| row.get(i).map(|v| v.trim().to_string()).unwrap_or_default()),
                display_name: cell(name_col),
                tax_id: cell(tax_col),
                sector: cell(sector_col),
                phone: cell(phone_col),
                email: cell(email_col),
                last_activity_raw: cell(activity_col),
                source_category: category,
                partition: partition.name.clone(),
            }
        })
        .collect()
}

/// Categorizes partitions and flattens the matching ones into one table.
pub fn assemble_table(partitions: Vec<RawPartition>) -> RawTable {
    let mut table = RawTable::default();
    for partition in partitions {
        match categorize_partition(&partition.name) {
            Some(category) => {
                let mut drafts = partition_to_drafts(&partition, Some(category));
                table.drafts.append(&mut drafts);
                table.partitions_loaded.push(partition.name);
            }
            None => {
                warn!(partition = %partition.name, "partition matches no category keyword, skipping");
                table.partitions_skipped.push(partition.name);
            }
        }
    }
    table
}

fn cell_to_string(cell: &calamine::Data) -> String {
    use calamine::Data;
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(n) => n.to_string(),
        Data::Float(f) => format!("{}", f),
        Data::Bool(b) => b.to_string(),
        Data::Error(e) => format!("#ERR({:?})", e),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| format!("{}", dt)),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
    }
}

/// Reads every categorizable sheet of a local workbook file.
#[derive(Debug, Clone)]
pub struct WorkbookLoader {
    path: PathBuf,
}

impl WorkbookLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_partitions(&self) -> Result<Vec<RawPartition>, LoadError> {
        let mut workbook = open_workbook_auto(&self.path).map_err(|err| LoadError::Workbook {
            path: self.path.display().to_string(),
            detail: err.to_string(),
        })?;

        let mut partitions = Vec::new();
        for sheet_name in workbook.sheet_names().to_vec() {
            let range = workbook
                .worksheet_range(&sheet_name)
                .map_err(|err| LoadError::Workbook {
                    path: self.path.display().to_string(),
                    detail: format!("sheet {sheet_name}: {err}"),
                })?;

            let mut rows = range.rows();
            let headers = match rows.next() {
                Some(header) => header.iter().map(cell_to_string).collect::<Vec<_>>(),
                None => continue,
            };
            let data = rows
                .map(|row| row.iter().map(cell_to_string).collect())
                .collect();
            partitions.push(RawPartition {
                name: sheet_name,
                headers,
                rows: data,
            });
        }
        Ok(partitions)
    }
}

#[async_trait]
impl SourceLoader for WorkbookLoader {
    fn origin(&self) -> &str {
        "workbook"
    }

    async fn load(&self) -> Result<RawTable, LoadError> {
        let partitions = self.read_partitions()?;
        Ok(assemble_table(partitions))
    }
}

/// One remote view: a collection plus an optional filter, mapped to a
/// category. `category: None` means the view is unpartitioned and records
/// fall back to threshold-derived classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteView {
    pub collection: String,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub category: Option<SourceCategory>,
}

/// Fetches client records from a remote record-collection API, one
/// paginated listing per configured view.
#[derive(Debug, Clone)]
pub struct RemoteCollectionLoader {
    fetcher: JsonFetcher,
    base_url: String,
    views: Vec<RemoteView>,
}

impl RemoteCollectionLoader {
    pub fn new(fetcher: JsonFetcher, base_url: impl Into<String>, views: Vec<RemoteView>) -> Self {
        let base: String = base_url.into();
        Self {
            fetcher,
            base_url: base.trim_end_matches('/').to_string(),
            views,
        }
    }

    fn view_url(&self, view: &RemoteView) -> String {
        format!(
            "{}/api/collections/{}/records",
            self.base_url, view.collection
        )
    }

    async fn load_view(&self, view: &RemoteView) -> Result<Vec<ClientDraft>, LoadError> {
        let url = self.view_url(view);
        let mut drafts = Vec::new();
        let mut page = 1u64;

        loop {
            let mut query: Vec<(&str, String)> = vec![
                ("page", page.to_string()),
                ("perPage", "200".to_string()),
                ("sort", "created".to_string()),
                ("fields", projection_fields()),
            ];
            if let Some(filter) = &view.filter {
                query.push(("filter", filter.clone()));
            }

            let value = self.fetcher.get_json(&view.collection, &url, &query).await?;
            let items = value
                .get("items")
                .and_then(|v| v.as_array())
                .ok_or_else(|| LoadError::Shape {
                    url: url.clone(),
                    detail: "missing items array".to_string(),
                })?;

            if items.is_empty() {
                break;
            }
            for item in items {
                drafts.push(draft_from_item(item, view));
            }

            let total_pages = value.get("totalPages").and_then(|v| v.as_u64()).unwrap_or(0);
            if page >= total_pages {
                break;
            }
            page += 1;
        }

        Ok(drafts)
    }
}

fn json_value_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

fn json_field(item: &JsonValue, keys: &[&str]) -> Option<String> {
    for key in keys {
        match item.get(*key) {
            Some(JsonValue::Null) | None => continue,
            Some(value) => return Some(json_value_text(value)),
        }
    }
    None
}

/// The identity field keeps the column-absent/value-empty distinction:
/// a null id is an empty value, a missing key on every alias is absence.
fn draft_id(item: &JsonValue) -> Option<String> {
    for key in CLIENT_ID_ALIASES {
        match item.get(*key) {
            Some(JsonValue::Null) => return Some(String::new()),
            Some(value) => return Some(json_value_text(value)),
            None => continue,
        }
    }
    None
}

fn draft_from_item(item: &JsonValue, view: &RemoteView) -> ClientDraft {
    ClientDraft {
        client_id: draft_id(item),
        display_name: json_field(item, DISPLAY_NAME_ALIASES),
        tax_id: json_field(item, TAX_ID_ALIASES),
        sector: json_field(item, SECTOR_ALIASES),
        phone: json_field(item, PHONE_ALIASES),
        email: json_field(item, EMAIL_ALIASES),
        last_activity_raw: json_field(item, LAST_ACTIVITY_ALIASES),
        source_category: view.category,
        partition: view.collection.clone(),
    }
}

#[async_trait]
impl SourceLoader for RemoteCollectionLoader {
    fn origin(&self) -> &str {
        "remote-collection"
    }

    async fn load(&self) -> Result<RawTable, LoadError> {
        let mut table = RawTable::default();
        for view in &self.views {
            let mut drafts = self.load_view(view).await?;
            table.drafts.append(&mut drafts);
            table.partitions_loaded.push(view.collection.clone());
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn partition(name: &str, headers: &[&str], rows: &[&[&str]]) -> RawPartition {
        RawPartition {
            name: name.to_string(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: rows
                .iter()
                .map(|row| row.iter().map(|c| c.to_string()).collect())
                .collect(),
        }
    }

    #[test]
    fn inactive_keyword_wins_over_its_active_substring() {
        assert_eq!(
            categorize_partition("INATIVOS"),
            Some(SourceCategory::Inactive)
        );
        assert_eq!(categorize_partition("ATIVOS"), Some(SourceCategory::Active));
        assert_eq!(
            categorize_partition("inactive-export"),
            Some(SourceCategory::Inactive)
        );
        assert_eq!(
            categorize_partition("Clientes FRIOS"),
            Some(SourceCategory::Cold)
        );
        assert_eq!(categorize_partition("Sheet1"), None);
    }

    #[test]
    fn uncategorizable_partitions_are_skipped_not_errors() {
        let table = assemble_table(vec![
            partition("ATIVOS", &["pj_id"], &[&["1"]]),
            partition("Resumo", &["pj_id"], &[&["2"]]),
            partition("INATIVOS", &["pj_id"], &[&["3"]]),
        ]);

        assert_eq!(table.drafts.len(), 2);
        assert_eq!(table.partitions_loaded, vec!["ATIVOS", "INATIVOS"]);
        assert_eq!(table.partitions_skipped, vec!["Resumo"]);
        assert_eq!(
            table.drafts[0].source_category,
            Some(SourceCategory::Active)
        );
        assert_eq!(
            table.drafts[1].source_category,
            Some(SourceCategory::Inactive)
        );
    }

    #[test]
    fn header_aliases_resolve_case_insensitively() {
        let part = partition(
            "ATIVOS",
            &["PJ_ID", "RAZAO_SOCIAL", "DATA_EXIBICAO", "TELEFONE_1"],
            &[&["1023", "Acme Ltda", "10/01/2023", "(11) 98765-4321"]],
        );
        let drafts = partition_to_drafts(&part, Some(SourceCategory::Active));

        assert_eq!(drafts[0].client_id.as_deref(), Some("1023"));
        assert_eq!(drafts[0].display_name.as_deref(), Some("Acme Ltda"));
        assert_eq!(drafts[0].last_activity_raw.as_deref(), Some("10/01/2023"));
        assert_eq!(drafts[0].phone.as_deref(), Some("(11) 98765-4321"));
        assert_eq!(drafts[0].sector, None);
    }

    #[test]
    fn missing_identity_column_is_tracked_per_draft() {
        let part = partition("ATIVOS", &["razao_social"], &[&["Acme"]]);
        let drafts = partition_to_drafts(&part, Some(SourceCategory::Active));
        assert_eq!(drafts[0].client_id, None);
    }

    #[test]
    fn blank_identity_cell_is_present_but_empty() {
        let part = partition("ATIVOS", &["pj_id", "razao_social"], &[&["", "Acme"]]);
        let drafts = partition_to_drafts(&part, Some(SourceCategory::Active));
        assert_eq!(drafts[0].client_id.as_deref(), Some(""));
    }

    #[test]
    fn remote_items_map_through_the_same_aliases() {
        let view = RemoteView {
            collection: "clients_active".to_string(),
            filter: None,
            category: Some(SourceCategory::Active),
        };

        let numeric_id = draft_from_item(&json!({"pj_id": 1023.0, "razao_social": "Acme"}), &view);
        assert_eq!(numeric_id.client_id.as_deref(), Some("1023.0"));
        assert_eq!(numeric_id.display_name.as_deref(), Some("Acme"));
        assert_eq!(numeric_id.source_category, Some(SourceCategory::Active));

        let null_id = draft_from_item(&json!({"client_id": null}), &view);
        assert_eq!(null_id.client_id.as_deref(), Some(""));

        let absent_id = draft_from_item(&json!({"razao_social": "NoId"}), &view);
        assert_eq!(absent_id.client_id, None);
    }

    #[test]
    fn remote_projection_covers_every_alias() {
        let fields = projection_fields();
        for alias in ["client_id", "pj_id", "razao_social", "cnpj", "data_exibicao"] {
            assert!(fields.split(',').any(|f| f == alias), "missing {alias}");
        }
    }

    #[tokio::test]
    async fn unreadable_workbook_is_a_typed_error() {
        let loader = WorkbookLoader::new("/nonexistent/clients.xlsx");
        let err = loader.load().await.expect_err("must fail");
        assert!(matches!(err, LoadError::Workbook { .. }));
    }
}
