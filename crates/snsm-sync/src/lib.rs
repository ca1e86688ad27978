//! Staging-to-main reconciliation: table provisioning, the deduplicating upsert
//! engine and per-run orchestration over every record kind.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use snsm_core::{MergeSource, MergeStatement, RecordKind, Schema, Statement, TableRef};
use snsm_storage::{
    BigQueryClient, BigQueryConfig, MemoryWarehouse, TableLookup, TokenSource, Warehouse,
    WarehouseError, DEFAULT_API_BASE,
};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "snsm-sync";

pub const TRIGGER_ACK: &str = "Merge process successfully triggered.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePair {
    pub staging: String,
    pub main: String,
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub project: String,
    pub dataset: String,
    pub post: TablePair,
    pub profile: TablePair,
    pub warehouse: BigQueryConfig,
    pub scheduler_enabled: bool,
    pub cron: String,
}

impl ReconcileConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let get_or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let project = get_or("GCP_PROJECT", "mmm-lab");
        let dataset = get_or("BQ_DATASET", "sns");

        let auth = match (get("BQ_ACCESS_TOKEN"), get("BQ_AUTH")) {
            (Some(token), _) => TokenSource::Static(token),
            (None, None) => TokenSource::metadata_server(),
            (None, Some(mode)) => match mode.to_ascii_lowercase().as_str() {
                "metadata" => TokenSource::metadata_server(),
                "none" => TokenSource::None,
                other => bail!("BQ_AUTH must be `metadata` or `none`, got {other:?}"),
            },
        };

        let timeout_secs = match get("SNSM_HTTP_TIMEOUT_SECS") {
            Some(v) => v
                .parse::<u64>()
                .with_context(|| format!("parsing SNSM_HTTP_TIMEOUT_SECS={v}"))?,
            None => 60,
        };

        let scheduler_enabled = match get("SNSM_SCHEDULER_ENABLED") {
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => bail!("SNSM_SCHEDULER_ENABLED must be a boolean, got {other:?}"),
            },
            None => false,
        };

        let mut warehouse = BigQueryConfig::new(project.clone());
        warehouse.api_base = get_or("BQ_API_BASE", DEFAULT_API_BASE);
        warehouse.location = get("BQ_LOCATION");
        warehouse.timeout = Duration::from_secs(timeout_secs);
        warehouse.user_agent = Some(get_or("SNSM_USER_AGENT", "snsm/0.1"));
        warehouse.auth = auth;

        Ok(Self {
            post: TablePair {
                staging: get_or("POST_STAGING_TABLE_ID", "insta_media_mmm_v2_staging"),
                main: get_or("POST_MAIN_TABLE_ID", "insta_media_mmm_v2"),
            },
            profile: TablePair {
                staging: get_or("PROFILE_STAGING_TABLE_ID", "insta_profile_mmm_v2_staging"),
                main: get_or("PROFILE_MAIN_TABLE_ID", "insta_profile_mmm_v2"),
            },
            project,
            dataset,
            warehouse,
            scheduler_enabled,
            cron: get_or("SNSM_CRON", "0 0 * * * *"),
        })
    }

    pub fn tables_for(&self, kind: RecordKind) -> &TablePair {
        match kind {
            RecordKind::Post => &self.post,
            RecordKind::Profile => &self.profile,
        }
    }
}

/// Parameters of one staging-to-main merge.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub project: String,
    pub dataset: String,
    pub staging_table: String,
    pub main_table: String,
    pub unique_key_column: String,
    pub schema: Schema,
    pub partition_filter_column: Option<String>,
    pub recency_column: Option<String>,
}

impl MergeRequest {
    pub fn for_kind(config: &ReconcileConfig, kind: RecordKind) -> Self {
        let tables = config.tables_for(kind);
        let identity = kind.identity();
        Self {
            project: config.project.clone(),
            dataset: config.dataset.clone(),
            staging_table: tables.staging.clone(),
            main_table: tables.main.clone(),
            unique_key_column: identity.unique_key.to_string(),
            schema: kind.schema(),
            partition_filter_column: identity.partition_filter.map(str::to_string),
            recency_column: identity.recency.map(str::to_string),
        }
    }

    pub fn staging_ref(&self) -> TableRef {
        TableRef::new(&self.project, &self.dataset, &self.staging_table)
    }

    pub fn main_ref(&self) -> TableRef {
        TableRef::new(&self.project, &self.dataset, &self.main_table)
    }

    fn validate(&self) -> Result<(), MergeError> {
        if self.schema.is_empty() {
            return Err(MergeError::InvalidRequest("schema has no columns".into()));
        }
        let named = [
            Some(("unique key", &self.unique_key_column)),
            self.partition_filter_column
                .as_ref()
                .map(|c| ("partition filter", c)),
            self.recency_column.as_ref().map(|c| ("recency", c)),
        ];
        for (role, column) in named.into_iter().flatten() {
            if !self.schema.contains(column) {
                return Err(MergeError::InvalidRequest(format!(
                    "{role} column `{column}` is not in the schema"
                )));
            }
        }
        if self.partition_filter_column.as_ref() == Some(&self.unique_key_column) {
            return Err(MergeError::InvalidRequest(
                "partition filter column duplicates the unique key".into(),
            ));
        }
        Ok(())
    }

    /// Build the conditional upsert for this request.
    pub fn plan(&self) -> Result<MergeStatement, MergeError> {
        self.validate()?;

        let mut match_columns = vec![self.unique_key_column.clone()];
        match_columns.extend(self.partition_filter_column.clone());

        let update_columns = self
            .schema
            .column_names()
            .filter(|c| *c != self.unique_key_column)
            .map(str::to_string)
            .collect();
        let insert_columns = self.schema.column_names().map(str::to_string).collect();

        let source = match &self.recency_column {
            Some(recency) => MergeSource::LatestPerKey {
                table: self.staging_ref(),
                partition_by: match_columns.clone(),
                order_by: recency.clone(),
            },
            None => MergeSource::Table(self.staging_ref()),
        };

        Ok(MergeStatement {
            target: self.main_ref(),
            source,
            match_columns,
            matched_guard: self.recency_column.clone(),
            update_columns,
            insert_columns,
        })
    }

    pub fn truncate_statement(&self) -> Statement {
        Statement::Truncate(self.staging_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStage {
    Validate,
    Provision,
    Upsert,
    Truncate,
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("invalid merge request: {0}")]
    InvalidRequest(String),
    #[error("provisioning main table: {0}")]
    Provision(#[source] WarehouseError),
    #[error("executing merge: {0}")]
    Upsert(#[source] WarehouseError),
    #[error("truncating staging table: {0}")]
    Truncate(#[source] WarehouseError),
}

impl MergeError {
    pub fn stage(&self) -> MergeStage {
        match self {
            Self::InvalidRequest(_) => MergeStage::Validate,
            Self::Provision(_) => MergeStage::Provision,
            Self::Upsert(_) => MergeStage::Upsert,
            Self::Truncate(_) => MergeStage::Truncate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provisioned {
    AlreadyExisted,
    Created,
}

/// Creates destination tables on first use; never alters an existing one.
#[derive(Clone)]
pub struct TableProvisioner {
    warehouse: Arc<dyn Warehouse>,
}

impl TableProvisioner {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    pub async fn ensure_exists(
        &self,
        table: &TableRef,
        schema: &Schema,
    ) -> Result<Provisioned, WarehouseError> {
        match self.warehouse.get_table(table).await? {
            TableLookup::Found => {
                info!(%table, "table already exists");
                Ok(Provisioned::AlreadyExisted)
            }
            TableLookup::NotFound => {
                info!(%table, columns = schema.len(), "table not found, creating");
                match self.warehouse.create_table(table, schema).await {
                    Ok(()) => {
                        info!(%table, "table created with declared schema");
                        Ok(Provisioned::Created)
                    }
                    // Another run created it between lookup and insert.
                    Err(WarehouseError::Api { status: 409, .. }) => {
                        info!(%table, "table created concurrently");
                        Ok(Provisioned::AlreadyExisted)
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub main_table: Provisioned,
    pub affected_rows: Option<u64>,
}

/// Deduplicating conditional upsert from a staging table into its main table.
#[derive(Clone)]
pub struct UpsertEngine {
    warehouse: Arc<dyn Warehouse>,
    provisioner: TableProvisioner,
}

impl UpsertEngine {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            provisioner: TableProvisioner::new(warehouse.clone()),
            warehouse,
        }
    }

    /// Provision, upsert, then truncate staging. Staging is only cleared after
    /// the upsert has completed; a failed upsert leaves it untouched.
    pub async fn merge(&self, request: &MergeRequest) -> Result<MergeReport, MergeError> {
        let statement = request.plan()?;
        let main = request.main_ref();
        let staging = request.staging_ref();

        let main_table = self
            .provisioner
            .ensure_exists(&main, &request.schema)
            .await
            .map_err(MergeError::Provision)?;

        info!(
            %main,
            %staging,
            unique_key = %request.unique_key_column,
            deduplicated_by = request.recency_column.as_deref().unwrap_or("N/A"),
            "executing merge"
        );
        let outcome = self
            .warehouse
            .execute(&Statement::Merge(statement))
            .await
            .map_err(MergeError::Upsert)?;
        info!(%main, affected_rows = ?outcome.affected_rows, "merge completed");

        self.warehouse
            .execute(&request.truncate_statement())
            .await
            .map_err(MergeError::Truncate)?;
        info!(%staging, "staging table truncated");

        Ok(MergeReport {
            main_table,
            affected_rows: outcome.affected_rows,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum KindStatus {
    Succeeded {
        provisioned: Provisioned,
        affected_rows: Option<u64>,
    },
    Failed {
        stage: MergeStage,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindOutcome {
    pub kind: RecordKind,
    pub staging_table: String,
    pub main_table: String,
    #[serde(flatten)]
    pub status: KindStatus,
}

impl KindOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, KindStatus::Succeeded { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<KindOutcome>,
}

impl ReconcileSummary {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(KindOutcome::succeeded)
    }

    pub fn outcome(&self, kind: RecordKind) -> Option<&KindOutcome> {
        self.outcomes.iter().find(|o| o.kind == kind)
    }
}

/// Runs one merge per record kind. Failures are logged and recorded in the
/// summary; they never stop the remaining kinds.
pub struct Reconciler {
    config: ReconcileConfig,
    engine: UpsertEngine,
}

impl Reconciler {
    pub fn new(config: ReconcileConfig, warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            config,
            engine: UpsertEngine::new(warehouse),
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn requests(&self) -> Vec<(RecordKind, MergeRequest)> {
        RecordKind::ALL
            .into_iter()
            .map(|kind| (kind, MergeRequest::for_kind(&self.config, kind)))
            .collect()
    }

    pub async fn run_once(&self) -> ReconcileSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut outcomes = Vec::with_capacity(RecordKind::ALL.len());

        for (kind, request) in self.requests() {
            let span = info_span!("merge_kind", %run_id, %kind);
            let outcome = self.merge_kind(kind, &request).instrument(span).await;
            outcomes.push(outcome);
        }

        let summary = ReconcileSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcomes,
        };
        info!(%run_id, all_succeeded = summary.all_succeeded(), "all merge operations completed");
        summary
    }

    async fn merge_kind(&self, kind: RecordKind, request: &MergeRequest) -> KindOutcome {
        info!(
            staging = %request.staging_table,
            main = %request.main_table,
            "starting merge"
        );
        let status = match self.engine.merge(request).await {
            Ok(report) => KindStatus::Succeeded {
                provisioned: report.main_table,
                affected_rows: report.affected_rows,
            },
            Err(err) => {
                error!(
                    stage = ?err.stage(),
                    main = %request.main_table,
                    staging = %request.staging_table,
                    error = %err,
                    "merge failed; staging left for next cycle"
                );
                KindStatus::Failed {
                    stage: err.stage(),
                    message: err.to_string(),
                }
            }
        };
        KindOutcome {
            kind,
            staging_table: request.staging_ref().to_string(),
            main_table: request.main_ref().to_string(),
            status,
        }
    }
}

pub fn bigquery_warehouse(config: &ReconcileConfig) -> Result<Arc<dyn Warehouse>> {
    let client = BigQueryClient::new(config.warehouse.clone())?;
    Ok(Arc::new(client))
}

/// In-process warehouse with an empty staging table per kind, for local runs.
pub async fn memory_warehouse(config: &ReconcileConfig) -> Arc<MemoryWarehouse> {
    let warehouse = Arc::new(MemoryWarehouse::new());
    for kind in RecordKind::ALL {
        let request = MergeRequest::for_kind(config, kind);
        warehouse
            .seed_table(&request.staging_ref(), request.schema, Vec::new())
            .await;
    }
    warehouse
}

pub async fn run_once_from_env() -> Result<ReconcileSummary> {
    let config = ReconcileConfig::from_env()?;
    let warehouse = bigquery_warehouse(&config)?;
    let reconciler = Reconciler::new(config, warehouse);
    Ok(reconciler.run_once().await)
}

/// Cron-driven reconciliation alongside the HTTP trigger. `None` when disabled.
pub async fn maybe_build_scheduler(reconciler: Arc<Reconciler>) -> Result<Option<JobScheduler>> {
    if !reconciler.config().scheduler_enabled {
        return Ok(None);
    }

    let cron = reconciler.config().cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let reconciler = reconciler.clone();
        Box::pin(async move {
            let summary = reconciler.run_once().await;
            info!(run_id = %summary.run_id, "scheduled reconciliation finished");
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
