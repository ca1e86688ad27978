use std::sync::Arc;

use chrono::{TimeZone, Utc};
use snsm_core::{ColumnDef, RecordKind, Schema, Statement, StorageType, TableRef};
use snsm_storage::{row, MemoryWarehouse, Operation, Row, Value};
use snsm_sync::{
    KindStatus, MergeError, MergeRequest, MergeStage, Provisioned, ReconcileConfig, Reconciler,
    TableProvisioner, UpsertEngine,
};

fn ts(hour: u32) -> Value {
    Value::Timestamp(Utc.with_ymd_and_hms(2026, 2, 24, hour, 0, 0).unwrap())
}

fn schema() -> Schema {
    Schema::new(vec![
        ColumnDef::single("id", StorageType::String),
        ColumnDef::single("part", StorageType::String),
        ColumnDef::single("seen", StorageType::Timestamp),
        ColumnDef::single("value", StorageType::String),
        ColumnDef::repeated("tags", StorageType::String),
    ])
}

fn rec(id: &str, part: &str, hour: u32, value: &str) -> Row {
    row([
        ("id", id.into()),
        ("part", part.into()),
        ("seen", ts(hour)),
        ("value", value.into()),
        ("tags", Value::strings([value])),
    ])
}

fn request(partition: bool, recency: bool) -> MergeRequest {
    MergeRequest {
        project: "proj".into(),
        dataset: "sns".into(),
        staging_table: "things_staging".into(),
        main_table: "things".into(),
        unique_key_column: "id".into(),
        schema: schema(),
        partition_filter_column: partition.then(|| "part".to_string()),
        recency_column: recency.then(|| "seen".to_string()),
    }
}

struct Harness {
    wh: Arc<MemoryWarehouse>,
    engine: UpsertEngine,
    request: MergeRequest,
}

impl Harness {
    async fn new(request: MergeRequest, staged: Vec<Row>) -> Self {
        let wh = Arc::new(MemoryWarehouse::new());
        wh.seed_table(&request.staging_ref(), schema(), staged).await;
        let engine = UpsertEngine::new(wh.clone());
        Self {
            wh,
            engine,
            request,
        }
    }

    async fn with_main(self, rows: Vec<Row>) -> Self {
        self.wh.seed_table(&self.request.main_ref(), schema(), rows).await;
        self
    }

    async fn stage(&self, rows: Vec<Row>) {
        self.wh
            .append_rows(&self.request.staging_ref(), rows)
            .await
            .unwrap();
    }

    async fn merge(&self) -> Result<snsm_sync::MergeReport, MergeError> {
        self.engine.merge(&self.request).await
    }

    async fn main_rows(&self) -> Vec<Row> {
        self.wh.rows(&self.request.main_ref()).await.unwrap_or_default()
    }

    async fn staging_rows(&self) -> Vec<Row> {
        self.wh.rows(&self.request.staging_ref()).await.unwrap()
    }

    fn main_row<'a>(rows: &'a [Row], id: &str) -> Vec<&'a Row> {
        rows.iter().filter(|r| r["id"] == Value::from(id)).collect()
    }
}

#[tokio::test]
async fn rerunning_without_new_rows_changes_nothing() {
    let h = Harness::new(
        request(true, true),
        vec![rec("a", "p1", 1, "one"), rec("b", "p1", 2, "two")],
    )
    .await;
    h.merge().await.unwrap();
    let after_first = h.main_rows().await;

    h.merge().await.unwrap();
    assert_eq!(h.main_rows().await, after_first);

    // Restaging identical observations is also a no-op.
    h.stage(vec![rec("a", "p1", 1, "one"), rec("b", "p1", 2, "two")]).await;
    h.merge().await.unwrap();
    assert_eq!(h.main_rows().await, after_first);
}

#[tokio::test]
async fn newest_staged_observation_wins() {
    let h = Harness::new(
        request(false, true),
        vec![rec("A", "p1", 2, "new"), rec("A", "p1", 1, "old")],
    )
    .await;
    h.merge().await.unwrap();

    let rows = h.main_rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["value"], Value::from("new"));
    assert_eq!(rows[0]["seen"], ts(2));
}

#[tokio::test]
async fn partition_filter_scopes_identity() {
    let h = Harness::new(
        request(true, true),
        vec![rec("u1", "p1", 1, "first"), rec("u1", "p2", 1, "second")],
    )
    .await;
    h.merge().await.unwrap();

    let rows = h.main_rows().await;
    let u1 = Harness::main_row(&rows, "u1");
    assert_eq!(u1.len(), 2);
    let mut parts = u1.iter().map(|r| r["part"].clone()).collect::<Vec<_>>();
    parts.sort_by(|a, b| a.sql_cmp(b).unwrap());
    assert_eq!(parts, vec![Value::from("p1"), Value::from("p2")]);
}

#[tokio::test]
async fn stale_staged_rows_do_not_overwrite() {
    let h = Harness::new(request(false, true), vec![rec("A", "p1", 3, "stale")])
        .await
        .with_main(vec![rec("A", "p1", 5, "current")])
        .await;
    h.merge().await.unwrap();

    assert_eq!(h.main_rows().await, vec![rec("A", "p1", 5, "current")]);
    assert!(h.staging_rows().await.is_empty());
}

#[tokio::test]
async fn newer_staged_rows_replace_every_non_key_column() {
    let h = Harness::new(request(false, true), vec![rec("A", "p9", 7, "fresh")])
        .await
        .with_main(vec![rec("A", "p1", 5, "current"), rec("B", "p1", 1, "other")])
        .await;
    h.merge().await.unwrap();

    let rows = h.main_rows().await;
    assert_eq!(rows.len(), 2);
    assert_eq!(Harness::main_row(&rows, "A"), vec![&rec("A", "p9", 7, "fresh")]);
    assert_eq!(Harness::main_row(&rows, "B"), vec![&rec("B", "p1", 1, "other")]);
}

#[tokio::test]
async fn unmatched_rows_are_inserted_whole() {
    let staged = row([
        ("id", "N".into()),
        ("part", "p1".into()),
        ("seen", ts(4)),
        ("value", "brand new".into()),
        ("tags", Value::strings(["x", "y", "z"])),
    ]);
    let h = Harness::new(request(true, true), vec![staged.clone()])
        .await
        .with_main(vec![rec("A", "p1", 1, "existing")])
        .await;
    h.merge().await.unwrap();

    let rows = h.main_rows().await;
    assert_eq!(rows.len(), 2);
    assert_eq!(Harness::main_row(&rows, "N"), vec![&staged]);
}

#[tokio::test]
async fn successful_merge_clears_staging() {
    let h = Harness::new(
        request(true, true),
        vec![rec("a", "p1", 1, "x"), rec("a", "p1", 2, "y"), rec("b", "p2", 1, "z")],
    )
    .await;
    let report = h.merge().await.unwrap();

    assert_eq!(report.main_table, Provisioned::Created);
    assert_eq!(report.affected_rows, Some(2));
    assert!(h.staging_rows().await.is_empty());

    let executed = h.wh.executed().await;
    assert_eq!(executed.len(), 2);
    assert!(matches!(executed[0], Statement::Merge(_)));
    assert_eq!(executed[1], Statement::Truncate(h.request.staging_ref()));
}

#[tokio::test]
async fn provisioning_creates_table_once() {
    let wh = Arc::new(MemoryWarehouse::new());
    let provisioner = TableProvisioner::new(wh.clone());
    let table = TableRef::new("proj", "sns", "things");

    let first = provisioner.ensure_exists(&table, &schema()).await.unwrap();
    let second = provisioner.ensure_exists(&table, &schema()).await.unwrap();

    assert_eq!(first, Provisioned::Created);
    assert_eq!(second, Provisioned::AlreadyExisted);
    assert_eq!(wh.create_count(), 1);
    assert_eq!(wh.table_schema(&table).await, Some(schema()));
}

#[tokio::test]
async fn existing_table_schema_is_never_altered() {
    let wh = Arc::new(MemoryWarehouse::new());
    let table = TableRef::new("proj", "sns", "things");
    let narrow = Schema::new(vec![ColumnDef::single("id", StorageType::String)]);
    wh.seed_table(&table, narrow.clone(), vec![]).await;

    let provisioner = TableProvisioner::new(wh.clone());
    assert_eq!(
        provisioner.ensure_exists(&table, &schema()).await.unwrap(),
        Provisioned::AlreadyExisted
    );
    assert_eq!(wh.table_schema(&table).await, Some(narrow));
    assert_eq!(wh.create_count(), 0);
}

#[tokio::test]
async fn empty_staging_is_a_clean_no_op() {
    let existing = vec![rec("A", "p1", 1, "kept")];
    let h = Harness::new(request(true, true), vec![])
        .await
        .with_main(existing.clone())
        .await;
    let report = h.merge().await.unwrap();

    assert_eq!(report.affected_rows, Some(0));
    assert_eq!(h.main_rows().await, existing);
    assert!(h.staging_rows().await.is_empty());
}

#[tokio::test]
async fn without_recency_matched_rows_always_overwrite() {
    let h = Harness::new(request(false, false), vec![rec("A", "p1", 1, "older but staged")])
        .await
        .with_main(vec![rec("A", "p1", 5, "current")])
        .await;
    h.merge().await.unwrap();

    assert_eq!(h.main_rows().await, vec![rec("A", "p1", 1, "older but staged")]);
}

#[tokio::test]
async fn failed_upsert_keeps_staging_for_next_cycle() {
    let staged = vec![rec("A", "p1", 1, "x")];
    let h = Harness::new(request(true, true), staged.clone()).await;
    h.wh.fail_next(Operation::Merge, "quota exceeded").await;

    let err = h.merge().await.unwrap_err();
    assert_eq!(err.stage(), MergeStage::Upsert);
    assert_eq!(h.staging_rows().await, staged);
    assert!(h.main_rows().await.is_empty());
    assert!(h.wh.executed().await.is_empty());

    // Next cycle picks the same rows up.
    h.merge().await.unwrap();
    assert_eq!(h.main_rows().await, staged);
    assert!(h.staging_rows().await.is_empty());
}

#[tokio::test]
async fn failed_truncate_reports_after_committed_upsert() {
    let staged = vec![rec("A", "p1", 1, "x")];
    let h = Harness::new(request(true, true), staged.clone()).await;
    h.wh.fail_next(Operation::Truncate, "lock contention").await;

    let err = h.merge().await.unwrap_err();
    assert!(matches!(err, MergeError::Truncate(_)));
    assert_eq!(h.main_rows().await, staged);
    assert_eq!(h.staging_rows().await, staged);

    // Leftover rows are harmless on the next run.
    h.merge().await.unwrap();
    assert_eq!(h.main_rows().await, staged);
}

#[tokio::test]
async fn provisioning_failures_abort_before_merging() {
    let h = Harness::new(request(true, true), vec![rec("A", "p1", 1, "x")]).await;
    h.wh.fail_next(Operation::GetTable, "backend error").await;
    let err = h.merge().await.unwrap_err();
    assert_eq!(err.stage(), MergeStage::Provision);

    h.wh.fail_next(Operation::CreateTable, "permission denied").await;
    let err = h.merge().await.unwrap_err();
    assert_eq!(err.stage(), MergeStage::Provision);

    assert!(h.wh.executed().await.is_empty());
    assert_eq!(h.staging_rows().await.len(), 1);
}

fn default_config() -> ReconcileConfig {
    ReconcileConfig::from_lookup(|_| None).unwrap()
}

#[tokio::test]
async fn one_kind_failing_does_not_block_the_other() {
    let config = default_config();
    let wh = Arc::new(MemoryWarehouse::new());

    // Post staging table is missing; profile has one row.
    let profile = MergeRequest::for_kind(&config, RecordKind::Profile);
    let profile_row = row([
        ("user_id", "42".into()),
        ("username", "someone".into()),
        ("crawl_date", ts(3)),
        ("related_accounts", Value::strings(["a", "b"])),
    ]);
    wh.seed_table(&profile.staging_ref(), RecordKind::Profile.schema(), vec![profile_row])
        .await;

    let reconciler = Reconciler::new(config.clone(), wh.clone());
    let summary = reconciler.run_once().await;

    assert!(!summary.all_succeeded());
    let kinds = summary.outcomes.iter().map(|o| o.kind).collect::<Vec<_>>();
    assert_eq!(kinds, RecordKind::ALL);

    let post = summary.outcome(RecordKind::Post).unwrap();
    assert!(matches!(
        post.status,
        KindStatus::Failed {
            stage: MergeStage::Upsert,
            ..
        }
    ));
    assert_eq!(post.main_table, "mmm-lab.sns.insta_media_mmm_v2");

    let profile_outcome = summary.outcome(RecordKind::Profile).unwrap();
    assert!(profile_outcome.succeeded());

    let main = wh.rows(&profile.main_ref()).await.unwrap();
    assert_eq!(main.len(), 1);
    assert_eq!(main[0]["username"], Value::from("someone"));
    assert_eq!(main[0]["biography"], Value::Null);
    assert_eq!(main[0].len(), RecordKind::Profile.schema().len());
}

#[tokio::test]
async fn full_run_reconciles_both_kinds() {
    let config = default_config();
    let wh = Arc::new(MemoryWarehouse::new());
    let post = MergeRequest::for_kind(&config, RecordKind::Post);
    let profile = MergeRequest::for_kind(&config, RecordKind::Profile);

    let post_row = |hour: u32, caption: &str, day: u32| {
        row([
            ("media_id", "m1".into()),
            (
                "publish_date",
                Value::Timestamp(Utc.with_ymd_and_hms(2026, 2, day, 0, 0, 0).unwrap()),
            ),
            ("crawl_date", ts(hour)),
            ("caption", caption.into()),
            ("hashtags", Value::strings(["#a"])),
        ])
    };
    wh.seed_table(
        &post.staging_ref(),
        RecordKind::Post.schema(),
        vec![post_row(1, "v1", 1), post_row(2, "v2", 1), post_row(1, "other day", 2)],
    )
    .await;
    wh.seed_table(&profile.staging_ref(), RecordKind::Profile.schema(), vec![])
        .await;

    let summary = Reconciler::new(config, wh.clone()).run_once().await;
    assert!(summary.all_succeeded());

    let posts = wh.rows(&post.main_ref()).await.unwrap();
    assert_eq!(posts.len(), 2);
    let captions = posts.iter().map(|r| r["caption"].clone()).collect::<Vec<_>>();
    assert!(captions.contains(&Value::from("v2")));
    assert!(captions.contains(&Value::from("other day")));
    assert!(wh.rows(&post.staging_ref()).await.unwrap().is_empty());
    assert!(wh.rows(&profile.main_ref()).await.unwrap().is_empty());
    assert_eq!(wh.create_count(), 2);
}

#[tokio::test]
async fn memory_mode_runs_complete_with_empty_staging() {
    let config = default_config();
    let wh = snsm_sync::memory_warehouse(&config).await;
    let reconciler = Reconciler::new(config.clone(), wh.clone());

    let first = reconciler.run_once().await;
    assert!(first.all_succeeded());
    let second = reconciler.run_once().await;
    assert!(second.all_succeeded());
    assert!(second
        .outcomes
        .iter()
        .all(|o| matches!(o.status, KindStatus::Succeeded { provisioned: Provisioned::AlreadyExisted, .. })));
    assert_eq!(wh.create_count(), 2);

    let post = MergeRequest::for_kind(&config, RecordKind::Post);
    wh.append_rows(
        &post.staging_ref(),
        vec![row([("media_id", "m9".into()), ("crawl_date", ts(3))])],
    )
    .await
    .unwrap();
    assert!(reconciler.run_once().await.all_succeeded());
    assert_eq!(wh.rows(&post.main_ref()).await.unwrap().len(), 1);
    assert!(wh.rows(&post.staging_ref()).await.unwrap().is_empty());
}
