//! SQLite driver over sqlx.
//!
//! Used for the legacy row store, which the migrator only ever opens
//! read-only. A single connection guarded by a mutex keeps transaction
//! statements on the same handle.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{ConnectOptions, Row as _, TypeInfo, ValueRef};
use tokio::sync::Mutex;

use super::{Row, SqlValue, StoreDriver, StoreError, StoreKind, StoreResult};

#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Option<SqliteConnection>>,
    path: PathBuf,
    kind: StoreKind,
}

impl SqliteStore {
    pub async fn open(path: &Path, kind: StoreKind, readonly: bool) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(readonly)
            .create_if_missing(!readonly);

        let conn = options.connect().await.map_err(|e| StoreError::Open {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path: path.to_path_buf(),
            kind,
        })
    }

    fn bind<'q>(
        mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
        params: &[SqlValue],
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        for param in params {
            query = match param {
                SqlValue::Null => query.bind(Option::<String>::None),
                SqlValue::Integer(v) => query.bind(*v),
                SqlValue::Real(v) => query.bind(*v),
                SqlValue::Text(v) => query.bind(v.clone()),
                SqlValue::Blob(v) => query.bind(v.clone()),
            };
        }
        query
    }

    fn decode_row(row: &SqliteRow) -> StoreResult<Row> {
        let mut values = Vec::with_capacity(row.columns().len());
        for index in 0..row.columns().len() {
            let raw = row
                .try_get_raw(index)
                .map_err(|e| StoreError::Decode(e.to_string()))?;
            let value = if raw.is_null() {
                SqlValue::Null
            } else {
                match raw.type_info().name() {
                    "INTEGER" | "BOOLEAN" => SqlValue::Integer(
                        row.try_get::<i64, _>(index)
                            .map_err(|e| StoreError::Decode(e.to_string()))?,
                    ),
                    "REAL" | "NUMERIC" => SqlValue::Real(
                        row.try_get::<f64, _>(index)
                            .map_err(|e| StoreError::Decode(e.to_string()))?,
                    ),
                    "BLOB" => SqlValue::Blob(
                        row.try_get::<Vec<u8>, _>(index)
                            .map_err(|e| StoreError::Decode(e.to_string()))?,
                    ),
                    _ => SqlValue::Text(
                        row.try_get::<String, _>(index)
                            .map_err(|e| StoreError::Decode(e.to_string()))?,
                    ),
                }
            };
            values.push(value);
        }
        Ok(Row::new(values))
    }
}

#[async_trait]
impl StoreDriver for SqliteStore {
    fn kind(&self) -> StoreKind {
        self.kind
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn exec(&self, sql: &str) -> StoreResult<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement)
                .execute(&mut *conn)
                .await
                .map_err(|e| StoreError::Exec(e.to_string()))?;
        }
        Ok(())
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> StoreResult<u64> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        let result = Self::bind(sqlx::query(sql), params)
            .execute(&mut *conn)
            .await
            .map_err(|e| StoreError::Exec(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> StoreResult<Vec<Row>> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        let rows = Self::bind(sqlx::query(sql), params)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        rows.iter().map(Self::decode_row).collect()
    }

    async fn begin(&self) -> StoreResult<()> {
        self.execute("BEGIN", &[])
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Transaction(e.to_string()))
    }

    async fn commit(&self) -> StoreResult<()> {
        self.execute("COMMIT", &[])
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Transaction(e.to_string()))
    }

    async fn rollback_tx(&self) -> StoreResult<()> {
        self.execute("ROLLBACK", &[])
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Transaction(e.to_string()))
    }

    async fn ping(&self) -> StoreResult<()> {
        self.query("SELECT 1", &[]).await.map(|_| ())
    }

    async fn close(&self) -> StoreResult<()> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            use sqlx::Connection;
            conn.close()
                .await
                .map_err(|e| StoreError::Exec(e.to_string()))?;
        }
        Ok(())
    }
}
