//! DuckDB driver.
//!
//! Backs both the legacy vector store (opened read-only) and the unified
//! target. The connection is synchronous; operations are short-lived and
//! never hold the lock across an await point.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use duckdb::types::Value;
use duckdb::{params_from_iter, AccessMode, Config, Connection};

use super::{Row, SqlValue, StoreDriver, StoreError, StoreKind, StoreResult};

pub struct DuckStore {
    conn: Mutex<Option<Connection>>,
    path: PathBuf,
    kind: StoreKind,
}

impl DuckStore {
    pub fn open(path: &Path, kind: StoreKind, readonly: bool) -> StoreResult<Self> {
        let conn = if readonly {
            let config = Config::default()
                .access_mode(AccessMode::ReadOnly)
                .map_err(|e| StoreError::Open {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })?;
            Connection::open_with_flags(path, config)
        } else {
            Connection::open(path)
        }
        .map_err(|e| StoreError::Open {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path: path.to_path_buf(),
            kind,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn to_duck(value: &SqlValue) -> Value {
        match value {
            SqlValue::Null => Value::Null,
            SqlValue::Integer(v) => Value::BigInt(*v),
            SqlValue::Real(v) => Value::Double(*v),
            SqlValue::Text(v) => Value::Text(v.clone()),
            SqlValue::Blob(v) => Value::Blob(v.clone()),
        }
    }

    fn from_duck(value: Value) -> SqlValue {
        match value {
            Value::Null => SqlValue::Null,
            Value::Boolean(v) => SqlValue::Integer(v as i64),
            Value::TinyInt(v) => SqlValue::Integer(v as i64),
            Value::SmallInt(v) => SqlValue::Integer(v as i64),
            Value::Int(v) => SqlValue::Integer(v as i64),
            Value::BigInt(v) => SqlValue::Integer(v),
            Value::UTinyInt(v) => SqlValue::Integer(v as i64),
            Value::USmallInt(v) => SqlValue::Integer(v as i64),
            Value::UInt(v) => SqlValue::Integer(v as i64),
            Value::UBigInt(v) => SqlValue::Integer(v as i64),
            Value::Float(v) => SqlValue::Real(v as f64),
            Value::Double(v) => SqlValue::Real(v),
            Value::Text(v) => SqlValue::Text(v),
            Value::Blob(v) => SqlValue::Blob(v),
            other => SqlValue::Text(format!("{:?}", other)),
        }
    }
}

#[async_trait]
impl StoreDriver for DuckStore {
    fn kind(&self) -> StoreKind {
        self.kind
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn exec(&self, sql: &str) -> StoreResult<()> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        conn.execute_batch(sql)
            .map_err(|e| StoreError::Exec(e.to_string()))
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> StoreResult<u64> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        let values: Vec<Value> = params.iter().map(Self::to_duck).collect();
        let affected = conn
            .execute(sql, params_from_iter(values))
            .map_err(|e| StoreError::Exec(e.to_string()))?;
        Ok(affected as u64)
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> StoreResult<Vec<Row>> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        let values: Vec<Value> = params.iter().map(Self::to_duck).collect();

        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let mapped = stmt
            .query_map(params_from_iter(values), |row| {
                let mut decoded = Vec::new();
                let mut index = 0;
                loop {
                    match row.get::<usize, Value>(index) {
                        Ok(value) => decoded.push(DuckStore::from_duck(value)),
                        Err(duckdb::Error::InvalidColumnIndex(_)) => break,
                        Err(e) => return Err(e),
                    }
                    index += 1;
                }
                Ok(Row::new(decoded))
            })
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let mut rows = Vec::new();
        for row in mapped {
            rows.push(row.map_err(|e| StoreError::Query(e.to_string()))?);
        }
        Ok(rows)
    }

    async fn begin(&self) -> StoreResult<()> {
        self.exec("BEGIN TRANSACTION")
            .await
            .map_err(|e| StoreError::Transaction(e.to_string()))
    }

    async fn commit(&self) -> StoreResult<()> {
        self.exec("COMMIT")
            .await
            .map_err(|e| StoreError::Transaction(e.to_string()))
    }

    async fn rollback_tx(&self) -> StoreResult<()> {
        self.exec("ROLLBACK")
            .await
            .map_err(|e| StoreError::Transaction(e.to_string()))
    }

    async fn ping(&self) -> StoreResult<()> {
        self.query("SELECT 1", &[]).await.map(|_| ())
    }

    async fn close(&self) -> StoreResult<()> {
        let mut guard = self.lock();
        guard.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_typed_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.duckdb");
        let store = DuckStore::open(&path, StoreKind::Unified, false).unwrap();

        store
            .exec("CREATE TABLE t (id VARCHAR PRIMARY KEY, n BIGINT, r DOUBLE, b BLOB)")
            .await
            .unwrap();
        store
            .execute(
                "INSERT INTO t (id, n, r, b) VALUES (?, ?, ?, ?)",
                &[
                    SqlValue::Text("a".into()),
                    SqlValue::Integer(42),
                    SqlValue::Real(1.5),
                    SqlValue::Blob(vec![9, 8]),
                ],
            )
            .await
            .unwrap();

        let rows = store
            .query("SELECT id, n, r, b FROM t ORDER BY id", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].as_text(0).unwrap(), "a");
        assert_eq!(rows[0].as_i64(1).unwrap(), 42);
        assert_eq!(rows[0].as_f64(2).unwrap(), 1.5);
        assert_eq!(rows[0].as_blob(3).unwrap(), &[9, 8]);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.duckdb");
        {
            let store = DuckStore::open(&path, StoreKind::VectorStore, false).unwrap();
            store.exec("CREATE TABLE t (id VARCHAR)").await.unwrap();
            store.close().await.unwrap();
        }

        let store = DuckStore::open(&path, StoreKind::VectorStore, true).unwrap();
        let result = store.exec("INSERT INTO t VALUES ('x')").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn transaction_rollback_discards_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tx.duckdb");
        let store = DuckStore::open(&path, StoreKind::Unified, false).unwrap();
        store.exec("CREATE TABLE t (id VARCHAR)").await.unwrap();

        store.begin().await.unwrap();
        store
            .execute("INSERT INTO t (id) VALUES (?)", &[SqlValue::Text("x".into())])
            .await
            .unwrap();
        store.rollback_tx().await.unwrap();

        let rows = store.query("SELECT COUNT(*) FROM t", &[]).await.unwrap();
        assert_eq!(rows[0].as_i64(0).unwrap(), 0);
    }

    #[tokio::test]
    async fn fixed_size_float_arrays_are_native() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vec.duckdb");
        let store = DuckStore::open(&path, StoreKind::Unified, false).unwrap();
        store
            .exec("CREATE TABLE v (id VARCHAR, embedding FLOAT[4])")
            .await
            .unwrap();
        store
            .exec("INSERT INTO v VALUES ('a', [0.1, 0.2, 0.3, 0.4]::FLOAT[4])")
            .await
            .unwrap();

        let rows = store
            .query(
                "SELECT array_cosine_similarity(embedding, [0.1, 0.2, 0.3, 0.4]::FLOAT[4]) FROM v",
                &[],
            )
            .await
            .unwrap();
        let similarity = rows[0].as_f64(0).unwrap();
        assert!((similarity - 1.0).abs() < 1e-5);
    }
}
