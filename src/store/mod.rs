//! Store Drivers
//!
//! The migrator talks to all three databases through the [`StoreDriver`]
//! trait: the legacy SQLite row store, the legacy DuckDB vector store, and
//! the unified DuckDB target. Drivers own their connection handling; the
//! core only sees rows of [`SqlValue`]s.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod duck;
pub mod sqlite;

pub use duck::DuckStore;
pub use sqlite::SqliteStore;

/// 16-byte signature at the start of every SQLite database file.
pub const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";
/// 4-byte tag identifying DuckDB files; found at header offset 8, with
/// offset 0 accepted for pre-release files.
pub const DUCKDB_MAGIC: &[u8; 4] = b"DUCK";

/// Which of the three stores a file or driver belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    RowStore,
    VectorStore,
    Unified,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::RowStore => "row_store",
            StoreKind::VectorStore => "vector_store",
            StoreKind::Unified => "unified",
        }
    }

    /// Directory name used for this kind inside a backup set.
    pub fn backup_subdir(&self) -> &'static str {
        match self {
            StoreKind::RowStore => "row",
            StoreKind::VectorStore => "vector",
            StoreKind::Unified => "unified",
        }
    }
}

/// A single dynamically-typed SQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => SqlValue::Null,
        }
    }
}

static NULL_VALUE: SqlValue = SqlValue::Null;

/// One result row. Columns are addressed by position; every query in this
/// crate uses an explicit column list, so positions are stable.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> &SqlValue {
        self.values.get(index).unwrap_or(&NULL_VALUE)
    }

    pub fn as_text(&self, index: usize) -> StoreResult<&str> {
        match self.get(index) {
            SqlValue::Text(s) => Ok(s.as_str()),
            other => Err(StoreError::Decode(format!(
                "column {} is {:?}, expected text",
                index, other
            ))),
        }
    }

    pub fn as_i64(&self, index: usize) -> StoreResult<i64> {
        match self.get(index) {
            SqlValue::Integer(v) => Ok(*v),
            other => Err(StoreError::Decode(format!(
                "column {} is {:?}, expected integer",
                index, other
            ))),
        }
    }

    pub fn as_f64(&self, index: usize) -> StoreResult<f64> {
        match self.get(index) {
            SqlValue::Real(v) => Ok(*v),
            SqlValue::Integer(v) => Ok(*v as f64),
            other => Err(StoreError::Decode(format!(
                "column {} is {:?}, expected real",
                index, other
            ))),
        }
    }

    pub fn as_blob(&self, index: usize) -> StoreResult<&[u8]> {
        match self.get(index) {
            SqlValue::Blob(b) => Ok(b.as_slice()),
            other => Err(StoreError::Decode(format!(
                "column {} is {:?}, expected blob",
                index, other
            ))),
        }
    }

    pub fn opt_text(&self, index: usize) -> Option<&str> {
        match self.get(index) {
            SqlValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn opt_i64(&self, index: usize) -> Option<i64> {
        match self.get(index) {
            SqlValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn opt_f64(&self, index: usize) -> Option<f64> {
        match self.get(index) {
            SqlValue::Real(v) => Some(*v),
            SqlValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn is_null(&self, index: usize) -> bool {
        matches!(self.get(index), SqlValue::Null)
    }
}

/// A buffered streaming cursor: rows are fetched once and handed out in
/// batches of the requested size.
#[derive(Debug)]
pub struct RowCursor {
    chunks: VecDeque<Vec<Row>>,
}

impl RowCursor {
    pub fn from_rows(rows: Vec<Row>, batch_size: usize) -> Self {
        let size = batch_size.max(1);
        let mut chunks = VecDeque::new();
        let mut rows = rows;
        while !rows.is_empty() {
            let rest = rows.split_off(rows.len().min(size));
            chunks.push_back(rows);
            rows = rest;
        }
        Self { chunks }
    }

    pub fn next_batch(&mut self) -> Option<Vec<Row>> {
        self.chunks.pop_front()
    }

    pub fn remaining_batches(&self) -> usize {
        self.chunks.len()
    }
}

/// Driver-level error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open {path}: {message}")]
    Open { path: PathBuf, message: String },

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Statement failed: {0}")]
    Exec(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Row decode failed: {0}")]
    Decode(String),

    #[error("Store is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for driver operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// The contract every store implementation satisfies. Opening is done by the
/// per-engine constructors; everything after that goes through this trait.
#[async_trait]
pub trait StoreDriver: Send + Sync {
    fn kind(&self) -> StoreKind;

    fn path(&self) -> &Path;

    /// Execute one or more statements without parameters (DDL, pragmas).
    async fn exec(&self, sql: &str) -> StoreResult<()>;

    /// Execute a single parameterized statement; returns affected rows.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> StoreResult<u64>;

    /// Run a query and collect all rows.
    async fn query(&self, sql: &str, params: &[SqlValue]) -> StoreResult<Vec<Row>>;

    /// Run a query and hand the rows back in batches.
    async fn cursor(
        &self,
        sql: &str,
        params: &[SqlValue],
        batch_size: usize,
    ) -> StoreResult<RowCursor> {
        let rows = self.query(sql, params).await?;
        Ok(RowCursor::from_rows(rows, batch_size))
    }

    async fn begin(&self) -> StoreResult<()>;

    async fn commit(&self) -> StoreResult<()>;

    async fn rollback_tx(&self) -> StoreResult<()>;

    /// Trivial liveness query; used for file validity probes.
    async fn ping(&self) -> StoreResult<()>;

    async fn close(&self) -> StoreResult<()>;
}

/// Open the appropriate driver for a store kind.
pub async fn open_store(
    kind: StoreKind,
    path: &Path,
    readonly: bool,
) -> StoreResult<Box<dyn StoreDriver>> {
    match kind {
        StoreKind::RowStore => Ok(Box::new(SqliteStore::open(path, kind, readonly).await?)),
        StoreKind::VectorStore | StoreKind::Unified => {
            Ok(Box::new(DuckStore::open(path, kind, readonly)?))
        }
    }
}

/// Scalar convenience on top of [`StoreDriver::query`].
pub async fn query_scalar_i64(
    store: &dyn StoreDriver,
    sql: &str,
    params: &[SqlValue],
) -> StoreResult<i64> {
    let rows = store.query(sql, params).await?;
    match rows.first() {
        Some(row) => row.as_i64(0),
        None => Err(StoreError::Query(format!("no rows returned for: {}", sql))),
    }
}
