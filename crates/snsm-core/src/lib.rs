//! Record schemas, table identifiers and the typed statement model for SNSM.
//!
//! Statements are built as data and only turned into GoogleSQL at the edge, so
//! every identifier passes through [`quote_ident`] exactly once.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "snsm-core";

const TARGET_ALIAS: &str = "Target";
const SOURCE_ALIAS: &str = "Source";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StorageType {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Date,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "STRING",
            Self::Integer => "INTEGER",
            Self::Float => "FLOAT",
            Self::Boolean => "BOOLEAN",
            Self::Timestamp => "TIMESTAMP",
            Self::Date => "DATE",
        }
    }
}

/// Column repetition. `Single` maps to BigQuery's `NULLABLE` mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Repetition {
    #[default]
    #[serde(rename = "NULLABLE")]
    Single,
    #[serde(rename = "REPEATED")]
    Repeated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    pub mode: Repetition,
}

impl ColumnDef {
    pub fn single(name: impl Into<String>, storage_type: StorageType) -> Self {
        Self {
            name: name.into(),
            storage_type,
            mode: Repetition::Single,
        }
    }

    pub fn repeated(name: impl Into<String>, storage_type: StorageType) -> Self {
        Self {
            name: name.into(),
            storage_type,
            mode: Repetition::Repeated,
        }
    }

    pub fn is_repeated(&self) -> bool {
        self.mode == Repetition::Repeated
    }
}

/// Ordered column list. Serializes as a BigQuery `TableSchema` (`{"fields": [...]}`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<ColumnDef>,
}

impl Schema {
    pub fn new(fields: Vec<ColumnDef>) -> Self {
        Self { fields }
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.fields
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<ColumnDef> for Schema {
    fn from_iter<I: IntoIterator<Item = ColumnDef>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// The two record families reconciled by this system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Post,
    Profile,
}

impl RecordKind {
    /// Merge order used by a reconciliation run.
    pub const ALL: [RecordKind; 2] = [RecordKind::Post, RecordKind::Profile];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Profile => "profile",
        }
    }

    pub fn schema(&self) -> Schema {
        schema_for(*self)
    }

    pub fn identity(&self) -> RecordIdentity {
        match self {
            Self::Post => RecordIdentity {
                unique_key: "media_id",
                partition_filter: Some("publish_date"),
                recency: Some("crawl_date"),
            },
            Self::Profile => RecordIdentity {
                unique_key: "user_id",
                partition_filter: None,
                recency: Some("crawl_date"),
            },
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which columns identify a record and decide which observation wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordIdentity {
    pub unique_key: &'static str,
    pub partition_filter: Option<&'static str>,
    pub recency: Option<&'static str>,
}

use Repetition::{Repeated, Single};
use StorageType::{Boolean, Integer, String as Str, Timestamp};

const POST_COLUMNS: &[(&str, StorageType, Repetition)] = &[
    ("media_id", Str, Single),
    ("user_id", Str, Single),
    ("username", Str, Single),
    ("caption", Str, Single),
    ("hashtags", Str, Repeated),
    ("comment_count", Integer, Single),
    ("like_count", Integer, Single),
    ("is_video", Boolean, Single),
    ("location", Str, Single),
    ("url", Str, Single),
    ("display_src", Str, Single),
    ("publish_date", Timestamp, Single),
    ("publish_short_date", Str, Single),
    ("crawl_date", Timestamp, Single),
    ("p_id", Str, Single),
    ("like_and_view_counts_disabled", Boolean, Single),
    ("tagged_accounts", Str, Repeated),
    ("tagged_account_ids", Str, Repeated),
    ("coauthor_names", Str, Repeated),
    ("coauthor_ids", Str, Repeated),
    ("video_url", Str, Single),
    ("video_view_count", Integer, Single),
    ("img_count", Integer, Single),
    ("is_paid_partnership", Boolean, Single),
    ("sponsored_by", Str, Single),
];

const PROFILE_COLUMNS: &[(&str, StorageType, Repetition)] = &[
    ("username", Str, Single),
    ("user_id", Str, Single),
    ("biography", Str, Single),
    ("bio_hashtags", Str, Repeated),
    ("category_name", Str, Single),
    ("full_name", Str, Single),
    ("external_url", Str, Single),
    ("followed_by", Integer, Single),
    ("follows", Integer, Single),
    ("media_count", Integer, Single),
    ("profile_pic_url", Str, Single),
    ("related_accounts", Str, Repeated),
    ("crawl_date", Timestamp, Single),
    ("account_status", Str, Single),
];

/// Ordered column definitions for a record kind. This is the contract with
/// whatever writes the staging tables.
pub fn schema_for(kind: RecordKind) -> Schema {
    let columns = match kind {
        RecordKind::Post => POST_COLUMNS,
        RecordKind::Profile => PROFILE_COLUMNS,
    };
    columns
        .iter()
        .map(|&(name, storage_type, mode)| ColumnDef {
            name: name.to_string(),
            storage_type,
            mode,
        })
        .collect()
}

/// Quote a GoogleSQL identifier with backticks, escaping `\` and `` ` ``.
pub fn quote_ident(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('`');
    for c in name.chars() {
        if c == '`' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('`');
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// Fully qualified path with each segment quoted.
    pub fn quoted(&self) -> String {
        format!(
            "{}.{}.{}",
            quote_ident(&self.project),
            quote_ident(&self.dataset),
            quote_ident(&self.table)
        )
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// Rows the MERGE reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeSource {
    /// The staging table as-is.
    Table(TableRef),
    /// One row per `partition_by` group: the one with the greatest `order_by` value.
    LatestPerKey {
        table: TableRef,
        partition_by: Vec<String>,
        order_by: String,
    },
}

impl MergeSource {
    pub fn table(&self) -> &TableRef {
        match self {
            Self::Table(table) => table,
            Self::LatestPerKey { table, .. } => table,
        }
    }

    fn to_sql(&self) -> String {
        match self {
            Self::Table(table) => table.quoted(),
            Self::LatestPerKey {
                table,
                partition_by,
                order_by,
            } => {
                let partition_by = partition_by
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "(\n  SELECT *\n  FROM {}\n  WHERE TRUE\n  QUALIFY ROW_NUMBER() OVER (PARTITION BY {} ORDER BY {} DESC) = 1\n)",
                    table.quoted(),
                    partition_by,
                    quote_ident(order_by)
                )
            }
        }
    }
}

/// Conditional upsert of `source` into `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeStatement {
    pub target: TableRef,
    pub source: MergeSource,
    /// Columns that must be equal on both sides for a row to match.
    pub match_columns: Vec<String>,
    /// When set, a matched row is only overwritten if the source value of this
    /// column is strictly greater than the target's.
    pub matched_guard: Option<String>,
    pub update_columns: Vec<String>,
    pub insert_columns: Vec<String>,
}

impl MergeStatement {
    pub fn to_sql(&self) -> String {
        let on = self
            .match_columns
            .iter()
            .map(|c| {
                let q = quote_ident(c);
                format!("{TARGET_ALIAS}.{q} = {SOURCE_ALIAS}.{q}")
            })
            .collect::<Vec<_>>()
            .join(" AND ");

        let mut lines = vec![
            format!("MERGE {} AS {TARGET_ALIAS}", self.target.quoted()),
            format!("USING {} AS {SOURCE_ALIAS}", self.source.to_sql()),
            format!("ON {on}"),
        ];

        if !self.update_columns.is_empty() {
            let guard = self
                .matched_guard
                .as_deref()
                .map(|c| {
                    let q = quote_ident(c);
                    format!(" AND {SOURCE_ALIAS}.{q} > {TARGET_ALIAS}.{q}")
                })
                .unwrap_or_default();
            let set = self
                .update_columns
                .iter()
                .map(|c| {
                    let q = quote_ident(c);
                    format!("{TARGET_ALIAS}.{q} = {SOURCE_ALIAS}.{q}")
                })
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!("WHEN MATCHED{guard} THEN"));
            lines.push(format!("  UPDATE SET {set}"));
        }

        let insert_columns = self
            .insert_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>();
        let values = insert_columns
            .iter()
            .map(|q| format!("{SOURCE_ALIAS}.{q}"))
            .collect::<Vec<_>>();
        lines.push("WHEN NOT MATCHED THEN".to_string());
        lines.push(format!("  INSERT ({})", insert_columns.join(", ")));
        lines.push(format!("  VALUES ({})", values.join(", ")));

        lines.join("\n")
    }
}

/// A statement the warehouse runs as a query job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Merge(MergeStatement),
    Truncate(TableRef),
}

impl Statement {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Merge(_) => "merge",
            Self::Truncate(_) => "truncate",
        }
    }

    pub fn to_sql(&self) -> String {
        match self {
            Self::Merge(merge) => merge.to_sql(),
            Self::Truncate(table) => format!("TRUNCATE TABLE {}", table.quoted()),
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}
