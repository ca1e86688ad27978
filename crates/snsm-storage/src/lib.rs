//! Warehouse capability and the BigQuery REST client for SNSM.

pub mod memory;

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use snsm_core::{Schema, Statement, TableRef};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info_span, warn, Instrument};

pub use memory::{row, MemoryWarehouse, Operation, Row, Value};

pub const CRATE_NAME: &str = "snsm-storage";

pub const DEFAULT_API_BASE: &str = "https://bigquery.googleapis.com/bigquery/v2";
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

const TOKEN_REFRESH_MARGIN_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("statement failed: {0}")]
    Execution(String),
    #[error("decoding response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Result of a table metadata lookup. Failures other than "absent" are `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableLookup {
    Found,
    NotFound,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOutcome {
    pub job_id: Option<String>,
    pub affected_rows: Option<u64>,
}

/// The operations SNSM needs from a data warehouse.
#[async_trait]
pub trait Warehouse: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_table(&self, table: &TableRef) -> Result<TableLookup, WarehouseError>;

    async fn create_table(&self, table: &TableRef, schema: &Schema) -> Result<(), WarehouseError>;

    /// Run a statement and wait for it to complete.
    async fn execute(&self, statement: &Statement) -> Result<QueryOutcome, WarehouseError>;
}

#[derive(Clone)]
pub enum TokenSource {
    /// No `Authorization` header (emulators, local mocks).
    None,
    Static(String),
    /// GCE/Cloud Functions metadata server.
    MetadataServer { url: String },
}

impl TokenSource {
    pub fn metadata_server() -> Self {
        Self::MetadataServer {
            url: METADATA_TOKEN_URL.to_string(),
        }
    }
}

impl fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Static(_) => f.write_str("Static(<redacted>)"),
            Self::MetadataServer { url } => f.debug_struct("MetadataServer").field("url", url).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BigQueryConfig {
    /// Project that query jobs are billed to.
    pub project: String,
    pub api_base: String,
    pub location: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub auth: TokenSource,
    pub poll_interval: Duration,
    /// Server-side wait per `queries` call before returning `jobComplete: false`.
    pub job_wait_ms: u64,
}

impl BigQueryConfig {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            location: None,
            timeout: Duration::from_secs(60),
            user_agent: None,
            auth: TokenSource::metadata_server(),
            poll_interval: Duration::from_secs(1),
            job_wait_ms: 10_000,
        }
    }

    /// Server-side wait per `queries` call, capped at half the HTTP timeout.
    pub fn effective_job_wait_ms(&self) -> u64 {
        let ceiling = u64::try_from(self.timeout.as_millis() / 2).unwrap_or(u64::MAX);
        self.job_wait_ms.min(ceiling)
    }
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Debug)]
pub struct BigQueryClient {
    client: reqwest::Client,
    base: Url,
    config: BigQueryConfig,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    project_id: String,
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    job_reference: Option<JobReference>,
    #[serde(default)]
    num_dml_affected_rows: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

impl BigQueryClient {
    pub fn new(config: BigQueryConfig) -> anyhow::Result<Self> {
        let base = Url::parse(&config.api_base)
            .with_context(|| format!("parsing BigQuery api base {}", config.api_base))?;
        if base.cannot_be_a_base() {
            bail!("BigQuery api base {} cannot carry a path", config.api_base);
        }

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
            base,
            config,
            token: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &BigQueryConfig {
        &self.config
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn table_url(&self, table: &TableRef) -> Url {
        self.endpoint(&[
            "projects",
            &table.project,
            "datasets",
            &table.dataset,
            "tables",
            &table.table,
        ])
    }

    async fn bearer_token(&self) -> Result<Option<String>, WarehouseError> {
        let url = match &self.config.auth {
            TokenSource::None => return Ok(None),
            TokenSource::Static(token) => return Ok(Some(token.clone())),
            TokenSource::MetadataServer { url } => url,
        };

        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| Instant::now() < t.refresh_at) {
            return Ok(Some(token.value.clone()));
        }

        let resp = self
            .client
            .get(url.as_str())
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(WarehouseError::Auth(format!(
                "metadata server returned {}",
                resp.status()
            )));
        }
        let token: MetadataToken = serde_json::from_slice(&resp.bytes().await?)?;
        let lifetime = Duration::from_secs(token.expires_in.saturating_sub(TOKEN_REFRESH_MARGIN_SECS));
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(Some(token.access_token))
    }

    async fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder, WarehouseError> {
        Ok(match self.bearer_token().await? {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    async fn query_response(resp: Response) -> Result<QueryResponse, WarehouseError> {
        if !resp.status().is_success() {
            return Err(match api_error(resp).await {
                WarehouseError::Api { status, message } => {
                    WarehouseError::Execution(format!("{status}: {message}"))
                }
                other => other,
            });
        }
        let response: QueryResponse = serde_json::from_slice(&resp.bytes().await?)?;
        for err in &response.errors {
            warn!(
                reason = err.reason.as_deref().unwrap_or_default(),
                message = err.message.as_deref().unwrap_or_default(),
                "query job reported an error entry"
            );
        }
        Ok(response)
    }
}

async fn api_error(resp: Response) -> WarehouseError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorEnvelope>(&body)
        .map(|e| e.error.message)
        .unwrap_or(body);
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        WarehouseError::Auth(format!("{status}: {message}"))
    } else {
        WarehouseError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl Warehouse for BigQueryClient {
    fn name(&self) -> &'static str {
        "bigquery"
    }

    async fn get_table(&self, table: &TableRef) -> Result<TableLookup, WarehouseError> {
        let resp = self
            .authorized(self.client.get(self.table_url(table)))
            .await?
            .send()
            .await?;
        match resp.status() {
            status if status.is_success() => Ok(TableLookup::Found),
            StatusCode::NOT_FOUND => Ok(TableLookup::NotFound),
            _ => Err(api_error(resp).await),
        }
    }

    async fn create_table(&self, table: &TableRef, schema: &Schema) -> Result<(), WarehouseError> {
        let url = self.endpoint(&[
            "projects",
            &table.project,
            "datasets",
            &table.dataset,
            "tables",
        ]);
        let body = serde_json::json!({
            "tableReference": {
                "projectId": table.project,
                "datasetId": table.dataset,
                "tableId": table.table,
            },
            "schema": schema,
        });
        let resp = self
            .authorized(self.client.post(url).json(&body))
            .await?
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(api_error(resp).await)
        }
    }

    async fn execute(&self, statement: &Statement) -> Result<QueryOutcome, WarehouseError> {
        let sql = statement.to_sql();
        let span = info_span!("bigquery_query", kind = statement.kind());
        async move {
            let request = QueryRequest {
                query: &sql,
                use_legacy_sql: false,
                timeout_ms: self.config.effective_job_wait_ms(),
                location: self.config.location.as_deref(),
            };
            let url = self.endpoint(&["projects", &self.config.project, "queries"]);
            let resp = self
                .authorized(self.client.post(url).json(&request))
                .await?
                .send()
                .await?;
            let mut response = Self::query_response(resp).await?;

            // Waiting on the same job; nothing is resubmitted.
            while !response.job_complete {
                let job = response.job_reference.clone().ok_or_else(|| {
                    WarehouseError::Execution("incomplete query response without jobReference".into())
                })?;
                tokio::time::sleep(self.config.poll_interval).await;

                let mut url = self.endpoint(&["projects", &job.project_id, "queries", &job.job_id]);
                {
                    let mut query = url.query_pairs_mut();
                    query.append_pair("timeoutMs", &self.config.effective_job_wait_ms().to_string());
                    if let Some(location) = job.location.as_deref().or(self.config.location.as_deref()) {
                        query.append_pair("location", location);
                    }
                }
                let resp = self.authorized(self.client.get(url)).await?.send().await?;
                response = Self::query_response(resp).await?;
            }

            Ok(QueryOutcome {
                job_id: response.job_reference.map(|j| j.job_id),
                affected_rows: response
                    .num_dml_affected_rows
                    .as_deref()
                    .and_then(|v| v.parse().ok()),
            })
        }
        .instrument(span)
        .await
    }
}
