//! In-process warehouse that executes typed statements with BigQuery's MERGE semantics.
//!
//! Used by the test suites and by `serve --memory`.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snsm_core::{MergeSource, MergeStatement, Schema, Statement, TableRef};
use tokio::sync::Mutex;

use crate::{QueryOutcome, TableLookup, Warehouse, WarehouseError};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Array(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn strings<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Array(items.into_iter().map(|s| Self::String(s.into())).collect())
    }

    /// Ordering between comparable scalars; `None` for NULLs, arrays and mixed types.
    pub fn sql_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Integer(a), Self::Float(b)) => (*a as f64).partial_cmp(b),
            (Self::Float(a), Self::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Self::Boolean(a), Self::Boolean(b)) => Some(a.cmp(b)),
            (Self::Timestamp(a), Self::Timestamp(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// `=` as evaluated in a join condition. NULL never matches.
    pub fn sql_eq(&self, other: &Value) -> bool {
        self.sql_cmp(other) == Some(Ordering::Equal)
    }

    /// `>` in a WHERE/WHEN condition. NULL on either side is false.
    pub fn sql_gt(&self, other: &Value) -> bool {
        self.sql_cmp(other) == Some(Ordering::Greater)
    }

    /// True when `self` comes before `other` under `ORDER BY .. DESC` (NULLs last).
    fn sorts_before_desc(&self, other: &Value) -> bool {
        match (self.is_null(), other.is_null()) {
            (true, _) => false,
            (false, true) => true,
            (false, false) => self.sql_gt(other),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

pub type Row = BTreeMap<String, Value>;

pub fn row<I, K>(pairs: I) -> Row
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

fn cell<'a>(row: &'a Row, column: &str) -> &'a Value {
    const NULL: &Value = &Value::Null;
    row.get(column).unwrap_or(NULL)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    GetTable,
    CreateTable,
    Merge,
    Truncate,
}

impl Operation {
    fn of(statement: &Statement) -> Self {
        match statement {
            Statement::Merge(_) => Self::Merge,
            Statement::Truncate(_) => Self::Truncate,
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryTable {
    schema: Schema,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    tables: Mutex<HashMap<TableRef, MemoryTable>>,
    failures: Mutex<Vec<(Operation, String)>>,
    executed: Mutex<Vec<Statement>>,
    creates: AtomicUsize,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) a table holding `rows`, bypassing `create_count`.
    pub async fn seed_table(&self, table: &TableRef, schema: Schema, rows: Vec<Row>) {
        self.tables
            .lock()
            .await
            .insert(table.clone(), MemoryTable { schema, rows });
    }

    pub async fn append_rows(&self, table: &TableRef, rows: Vec<Row>) -> Result<(), WarehouseError> {
        let mut tables = self.tables.lock().await;
        let existing = tables
            .get_mut(table)
            .ok_or_else(|| WarehouseError::NotFound(table.to_string()))?;
        existing.rows.extend(rows);
        Ok(())
    }

    pub async fn rows(&self, table: &TableRef) -> Option<Vec<Row>> {
        self.tables.lock().await.get(table).map(|t| t.rows.clone())
    }

    pub async fn table_schema(&self, table: &TableRef) -> Option<Schema> {
        self.tables.lock().await.get(table).map(|t| t.schema.clone())
    }

    /// Make the next call of `operation` fail with `message`.
    pub async fn fail_next(&self, operation: Operation, message: impl Into<String>) {
        self.failures.lock().await.push((operation, message.into()));
    }

    /// Statements that completed successfully, in order.
    pub async fn executed(&self) -> Vec<Statement> {
        self.executed.lock().await.clone()
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(AtomicOrdering::SeqCst)
    }

    async fn injected_failure(&self, operation: Operation) -> Option<String> {
        let mut failures = self.failures.lock().await;
        let idx = failures.iter().position(|(op, _)| *op == operation)?;
        Some(failures.remove(idx).1)
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get_table(&self, table: &TableRef) -> Result<TableLookup, WarehouseError> {
        if let Some(message) = self.injected_failure(Operation::GetTable).await {
            return Err(WarehouseError::Api { status: 500, message });
        }
        Ok(if self.tables.lock().await.contains_key(table) {
            TableLookup::Found
        } else {
            TableLookup::NotFound
        })
    }

    async fn create_table(&self, table: &TableRef, schema: &Schema) -> Result<(), WarehouseError> {
        if let Some(message) = self.injected_failure(Operation::CreateTable).await {
            return Err(WarehouseError::Api { status: 500, message });
        }
        let mut tables = self.tables.lock().await;
        if tables.contains_key(table) {
            return Err(WarehouseError::Api {
                status: 409,
                message: format!("Already Exists: Table {table}"),
            });
        }
        tables.insert(
            table.clone(),
            MemoryTable {
                schema: schema.clone(),
                rows: Vec::new(),
            },
        );
        self.creates.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }

    async fn execute(&self, statement: &Statement) -> Result<QueryOutcome, WarehouseError> {
        if let Some(message) = self.injected_failure(Operation::of(statement)).await {
            return Err(WarehouseError::Execution(message));
        }
        let mut tables = self.tables.lock().await;
        let affected = match statement {
            Statement::Merge(merge) => apply_merge(&mut tables, merge)?,
            Statement::Truncate(table) => {
                let existing = tables
                    .get_mut(table)
                    .ok_or_else(|| WarehouseError::NotFound(table.to_string()))?;
                existing.rows.clear();
                0
            }
        };
        drop(tables);
        self.executed.lock().await.push(statement.clone());
        Ok(QueryOutcome {
            job_id: None,
            affected_rows: Some(affected),
        })
    }
}

fn require_columns<'a>(
    table: &TableRef,
    schema: &Schema,
    columns: impl IntoIterator<Item = &'a String>,
) -> Result<(), WarehouseError> {
    for column in columns {
        if !schema.contains(column) {
            return Err(WarehouseError::Execution(format!(
                "Unrecognized name: {column} in {table}"
            )));
        }
    }
    Ok(())
}

/// Rows surviving `PARTITION BY .. ORDER BY order_by DESC` + `ROW_NUMBER() = 1`.
/// NULL keys group together; on equal `order_by` values the earliest row wins.
fn latest_per_key(rows: &[Row], partition_by: &[String], order_by: &str) -> Vec<Row> {
    let mut winners: Vec<(Vec<Value>, Row)> = Vec::new();
    for row in rows {
        let key = partition_by
            .iter()
            .map(|c| cell(row, c).clone())
            .collect::<Vec<_>>();
        match winners.iter_mut().find(|(k, _)| *k == key) {
            Some((_, winner)) => {
                if cell(row, order_by).sorts_before_desc(cell(winner, order_by)) {
                    *winner = row.clone();
                }
            }
            None => winners.push((key, row.clone())),
        }
    }
    winners.into_iter().map(|(_, row)| row).collect()
}

fn apply_merge(
    tables: &mut HashMap<TableRef, MemoryTable>,
    merge: &MergeStatement,
) -> Result<u64, WarehouseError> {
    let source_ref = merge.source.table();
    let source = tables
        .get(source_ref)
        .ok_or_else(|| WarehouseError::NotFound(source_ref.to_string()))?;
    let target = tables
        .get(&merge.target)
        .ok_or_else(|| WarehouseError::NotFound(merge.target.to_string()))?;

    let referenced = merge
        .match_columns
        .iter()
        .chain(&merge.update_columns)
        .chain(&merge.insert_columns)
        .chain(&merge.matched_guard)
        .collect::<Vec<_>>();
    require_columns(&merge.target, &target.schema, referenced.iter().copied())?;
    require_columns(source_ref, &source.schema, referenced.iter().copied())?;

    let source_rows = match &merge.source {
        MergeSource::Table(_) => source.rows.clone(),
        MergeSource::LatestPerKey {
            partition_by,
            order_by,
            ..
        } => {
            require_columns(source_ref, &source.schema, partition_by.iter().chain([order_by]))?;
            latest_per_key(&source.rows, partition_by, order_by)
        }
    };

    let mut rows = target.rows.clone();
    let mut matched_by: Vec<Option<usize>> = vec![None; rows.len()];
    let mut inserts = Vec::new();

    for (si, src) in source_rows.iter().enumerate() {
        let mut matched = false;
        for (ti, dst) in rows.iter().enumerate() {
            let is_match = merge
                .match_columns
                .iter()
                .all(|c| cell(src, c).sql_eq(cell(dst, c)));
            if !is_match {
                continue;
            }
            matched = true;
            if merge.update_columns.is_empty() {
                continue;
            }
            if matched_by[ti].is_some() {
                return Err(WarehouseError::Execution(
                    "UPDATE/MERGE must match at most one source row for each target row".into(),
                ));
            }
            matched_by[ti] = Some(si);
        }
        if !matched {
            inserts.push(si);
        }
    }

    let mut affected = 0u64;
    for (ti, si) in matched_by.into_iter().enumerate() {
        let Some(si) = si else { continue };
        let src = &source_rows[si];
        let dst = &mut rows[ti];
        if let Some(guard) = &merge.matched_guard {
            if !cell(src, guard).sql_gt(cell(dst, guard)) {
                continue;
            }
        }
        for column in &merge.update_columns {
            dst.insert(column.clone(), cell(src, column).clone());
        }
        affected += 1;
    }

    let target_columns = target
        .schema
        .column_names()
        .map(str::to_string)
        .collect::<Vec<_>>();
    for si in inserts {
        let src = &source_rows[si];
        let mut new_row: Row = target_columns
            .iter()
            .map(|c| (c.clone(), Value::Null))
            .collect();
        for column in &merge.insert_columns {
            new_row.insert(column.clone(), cell(src, column).clone());
        }
        rows.push(new_row);
        affected += 1;
    }

    if let Some(target) = tables.get_mut(&merge.target) {
        target.rows = rows;
    }
    Ok(affected)
}
