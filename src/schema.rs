//! Unified Store Schema
//!
//! Owns the canonical DDL, the forward-only version history, and the schema
//! validation cross-checks. All DDL is idempotent; `create_schema` may be
//! re-run at any phase boundary.

use serde::{Deserialize, Serialize};

use crate::error::{MigrationError, MigrationErrorKind, MigrationResult};
use crate::store::{query_scalar_i64, SqlValue, StoreDriver};

/// Latest schema version shipped with this build.
pub const LATEST_VERSION: i64 = 1;

/// Tables every valid unified store must contain.
pub const REQUIRED_TABLES: &[&str] = &[
    "conversations",
    "messages",
    "message_attachments",
    "knowledge_files",
    "knowledge_chunks",
    "knowledge_vectors",
    "schema_versions",
    "migration_metadata",
];

/// Indexes the validator treats as critical.
pub const CRITICAL_INDEXES: &[&str] = &[
    "idx_conversations_updated_at",
    "idx_messages_conversation_order",
    "idx_messages_created_at",
    "idx_knowledge_chunks_file",
    "idx_knowledge_vectors_file",
    "idx_knowledge_vectors_chunk",
];

/// ANN indexes per declared distance metric; created when the vss extension
/// is loadable, reported as performance warnings otherwise.
pub const VECTOR_INDEXES: &[(&str, &str)] = &[
    ("idx_vectors_cosine", "cosine"),
    ("idx_vectors_l2sq", "l2sq"),
    ("idx_vectors_ip", "ip"),
];

/// One row of the `schema_versions` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub version: i64,
    pub applied_at: i64,
    pub description: String,
    pub checksum: String,
}

/// Outcome of `validate_schema`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaReport {
    pub valid: bool,
    pub missing_tables: Vec<String>,
    pub missing_indexes: Vec<String>,
    pub foreign_key_count: i64,
    pub vector_support: bool,
    pub embedding_column: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct SchemaManager {
    dimension: usize,
}

impl SchemaManager {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// The complete core DDL, parents before children.
    pub fn core_ddl(&self) -> String {
        format!(
            r#"
CREATE TABLE IF NOT EXISTS conversations (
    conv_id     VARCHAR PRIMARY KEY,
    title       VARCHAR,
    created_at  BIGINT NOT NULL,
    updated_at  BIGINT NOT NULL,
    is_pinned   INTEGER NOT NULL DEFAULT 0,
    is_new      INTEGER NOT NULL DEFAULT 1,
    settings    JSON
);

CREATE TABLE IF NOT EXISTS messages (
    msg_id          VARCHAR PRIMARY KEY,
    conversation_id VARCHAR NOT NULL REFERENCES conversations(conv_id),
    parent_id       VARCHAR,
    role            VARCHAR NOT NULL CHECK (role IN ('user', 'assistant', 'system', 'function')),
    content         VARCHAR,
    created_at      BIGINT NOT NULL,
    order_seq       INTEGER NOT NULL CHECK (order_seq >= 0),
    token_count     INTEGER NOT NULL DEFAULT 0 CHECK (token_count >= 0),
    status          VARCHAR NOT NULL DEFAULT 'sent' CHECK (status IN ('sent', 'pending', 'error')),
    metadata        JSON,
    is_context_edge INTEGER NOT NULL DEFAULT 0,
    is_variant      INTEGER NOT NULL DEFAULT 0
);

CREATE SEQUENCE IF NOT EXISTS message_attachments_id_seq START 1;

CREATE TABLE IF NOT EXISTS message_attachments (
    id              BIGINT PRIMARY KEY DEFAULT nextval('message_attachments_id_seq'),
    message_id      VARCHAR NOT NULL REFERENCES messages(msg_id),
    attachment_type VARCHAR NOT NULL,
    attachment_data VARCHAR,
    created_at      BIGINT NOT NULL,
    metadata        JSON
);

CREATE TABLE IF NOT EXISTS knowledge_files (
    id          VARCHAR PRIMARY KEY,
    name        VARCHAR NOT NULL,
    path        VARCHAR,
    mime_type   VARCHAR,
    status      VARCHAR NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'processing', 'completed', 'error')),
    uploaded_at BIGINT NOT NULL,
    file_size   BIGINT NOT NULL DEFAULT 0 CHECK (file_size >= 0),
    metadata    JSON
);

CREATE TABLE IF NOT EXISTS knowledge_chunks (
    id          VARCHAR PRIMARY KEY,
    file_id     VARCHAR NOT NULL REFERENCES knowledge_files(id),
    chunk_index INTEGER NOT NULL CHECK (chunk_index >= 0),
    content     VARCHAR,
    status      VARCHAR,
    error       VARCHAR,
    chunk_size  INTEGER NOT NULL DEFAULT 0 CHECK (chunk_size >= 0),
    metadata    JSON
);

CREATE TABLE IF NOT EXISTS knowledge_vectors (
    id         VARCHAR PRIMARY KEY,
    file_id    VARCHAR NOT NULL REFERENCES knowledge_files(id),
    chunk_id   VARCHAR NOT NULL REFERENCES knowledge_chunks(id),
    embedding  FLOAT[{dim}] NOT NULL,
    created_at BIGINT NOT NULL,
    model_name VARCHAR NOT NULL DEFAULT 'unknown',
    metadata   JSON
);

CREATE TABLE IF NOT EXISTS schema_versions (
    version     BIGINT PRIMARY KEY,
    applied_at  BIGINT NOT NULL,
    description VARCHAR NOT NULL,
    checksum    VARCHAR NOT NULL
);

CREATE TABLE IF NOT EXISTS migration_metadata (
    key        VARCHAR PRIMARY KEY,
    value      VARCHAR,
    created_at BIGINT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_updated_at ON conversations (updated_at);
CREATE INDEX IF NOT EXISTS idx_messages_conversation_order ON messages (conversation_id, order_seq);
CREATE INDEX IF NOT EXISTS idx_messages_created_at ON messages (created_at);
CREATE INDEX IF NOT EXISTS idx_knowledge_chunks_file ON knowledge_chunks (file_id);
CREATE INDEX IF NOT EXISTS idx_knowledge_vectors_file ON knowledge_vectors (file_id);
CREATE INDEX IF NOT EXISTS idx_knowledge_vectors_chunk ON knowledge_vectors (chunk_id);
"#,
            dim = self.dimension
        )
    }

    /// Install the schema. Core DDL failures are schema mismatches; missing
    /// ANN support is downgraded to warnings (returned to the caller).
    pub async fn create_schema(&self, target: &dyn StoreDriver) -> MigrationResult<Vec<String>> {
        target.exec(&self.core_ddl()).await.map_err(|e| {
            MigrationError::new(
                MigrationErrorKind::SchemaMismatch,
                "schema:create",
                e.to_string(),
            )
        })?;

        let mut warnings = Vec::new();
        self.create_vector_indexes(target, &mut warnings).await;

        if self.current_version(target).await? < 1 {
            target
                .execute(
                    "INSERT INTO schema_versions (version, applied_at, description, checksum) \
                     VALUES (?, ?, ?, ?) ON CONFLICT DO NOTHING",
                    &[
                        SqlValue::Integer(1),
                        SqlValue::Integer(chrono::Utc::now().timestamp_millis()),
                        SqlValue::Text("initial".into()),
                        SqlValue::Text("initial_schema_v1".into()),
                    ],
                )
                .await
                .map_err(|e| {
                    MigrationError::new(
                        MigrationErrorKind::SchemaMismatch,
                        "schema:version",
                        e.to_string(),
                    )
                })?;
        }

        Ok(warnings)
    }

    /// `MAX(version)` from `schema_versions`, or 0 when absent.
    pub async fn current_version(&self, target: &dyn StoreDriver) -> MigrationResult<i64> {
        match query_scalar_i64(
            target,
            "SELECT COALESCE(MAX(version), 0) FROM schema_versions",
            &[],
        )
        .await
        {
            Ok(version) => Ok(version),
            // Table absent means the schema has never been created.
            Err(_) => Ok(0),
        }
    }

    pub async fn needs_migration(&self, target: &dyn StoreDriver) -> MigrationResult<bool> {
        Ok(self.current_version(target).await? < LATEST_VERSION)
    }

    /// Cross-check the installed schema against expectations.
    pub async fn validate_schema(&self, target: &dyn StoreDriver) -> MigrationResult<SchemaReport> {
        let mut report = SchemaReport::default();

        let tables = self.table_names(target).await?;
        for required in REQUIRED_TABLES {
            if !tables.iter().any(|t| t == required) {
                report.missing_tables.push(required.to_string());
            }
        }
        if !report.missing_tables.is_empty() {
            report
                .issues
                .push(format!("missing tables: {}", report.missing_tables.join(", ")));
        }

        report.vector_support = target
            .query(
                "SELECT array_cosine_similarity([1.0]::FLOAT[1], [1.0]::FLOAT[1])",
                &[],
            )
            .await
            .is_ok();
        if !report.vector_support {
            report
                .issues
                .push("vector distance functions are unavailable".to_string());
        }

        let indexes = self.index_names(target).await?;
        for critical in CRITICAL_INDEXES {
            if !indexes.iter().any(|i| i == critical) {
                report.missing_indexes.push(critical.to_string());
            }
        }
        if !report.missing_indexes.is_empty() {
            report.issues.push(format!(
                "missing indexes: {}",
                report.missing_indexes.join(", ")
            ));
        }
        for (ann, metric) in VECTOR_INDEXES {
            if !indexes.iter().any(|i| i == ann) {
                report
                    .warnings
                    .push(format!("vector index for {} distance is absent", metric));
            }
        }

        report.foreign_key_count = query_scalar_i64(
            target,
            "SELECT COUNT(*) FROM duckdb_constraints() WHERE constraint_type = 'FOREIGN KEY'",
            &[],
        )
        .await
        .unwrap_or(0);
        if report.foreign_key_count < 4 {
            report.issues.push(format!(
                "expected at least 4 foreign key constraints, found {}",
                report.foreign_key_count
            ));
        }

        report.embedding_column = match target
            .query(
                "SELECT data_type FROM information_schema.columns \
                 WHERE table_name = 'knowledge_vectors' AND column_name = 'embedding'",
                &[],
            )
            .await
        {
            Ok(rows) => rows
                .first()
                .and_then(|r| r.opt_text(0))
                .map(|t| t.to_uppercase().starts_with("FLOAT["))
                .unwrap_or(false),
            Err(_) => false,
        };
        if !report.embedding_column {
            report
                .issues
                .push("knowledge_vectors.embedding column is missing or mistyped".to_string());
        }

        report.valid = report.issues.is_empty();
        Ok(report)
    }

    async fn create_vector_indexes(&self, target: &dyn StoreDriver, warnings: &mut Vec<String>) {
        let loaded = match target.exec("LOAD vss").await {
            Ok(()) => true,
            Err(_) => target.exec("INSTALL vss; LOAD vss").await.is_ok(),
        };
        if !loaded {
            let note = "vss extension unavailable; vector indexes skipped".to_string();
            tracing::warn!("{}", note);
            warnings.push(note);
            return;
        }

        // HNSW persistence must be opted into for disk-backed databases.
        if let Err(e) = target
            .exec("SET hnsw_enable_experimental_persistence = true")
            .await
        {
            tracing::warn!("could not enable persistent vector indexes: {}", e);
        }

        for (name, metric) in VECTOR_INDEXES {
            let sql = format!(
                "CREATE INDEX IF NOT EXISTS {} ON knowledge_vectors USING HNSW (embedding) WITH (metric = '{}')",
                name, metric
            );
            if let Err(e) = target.exec(&sql).await {
                let note = format!("vector index {} not created: {}", name, e);
                tracing::warn!("{}", note);
                warnings.push(note);
            }
        }
    }

    async fn table_names(&self, target: &dyn StoreDriver) -> MigrationResult<Vec<String>> {
        let rows = target
            .query(
                "SELECT table_name FROM information_schema.tables WHERE table_schema = 'main'",
                &[],
            )
            .await
            .map_err(|e| {
                MigrationError::new(
                    MigrationErrorKind::SchemaMismatch,
                    "schema:tables",
                    e.to_string(),
                )
            })?;
        Ok(rows
            .iter()
            .filter_map(|r| r.opt_text(0).map(str::to_string))
            .collect())
    }

    async fn index_names(&self, target: &dyn StoreDriver) -> MigrationResult<Vec<String>> {
        let rows = target
            .query("SELECT index_name FROM duckdb_indexes()", &[])
            .await
            .map_err(|e| {
                MigrationError::new(
                    MigrationErrorKind::SchemaMismatch,
                    "schema:indexes",
                    e.to_string(),
                )
            })?;
        Ok(rows
            .iter()
            .filter_map(|r| r.opt_text(0).map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DuckStore, StoreKind};

    async fn fresh_target(dir: &tempfile::TempDir) -> DuckStore {
        DuckStore::open(&dir.path().join("unified.duckdb"), StoreKind::Unified, false).unwrap()
    }

    #[tokio::test]
    async fn create_schema_seeds_version_one() {
        let dir = tempfile::tempdir().unwrap();
        let target = fresh_target(&dir).await;
        let manager = SchemaManager::new(8);

        manager.create_schema(&target).await.unwrap();
        assert_eq!(manager.current_version(&target).await.unwrap(), 1);
        assert!(!manager.needs_migration(&target).await.unwrap());

        let rows = target
            .query(
                "SELECT version, description, checksum FROM schema_versions",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].as_i64(0).unwrap(), 1);
        assert_eq!(rows[0].as_text(1).unwrap(), "initial");
        assert_eq!(rows[0].as_text(2).unwrap(), "initial_schema_v1");
    }

    #[tokio::test]
    async fn create_schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = fresh_target(&dir).await;
        let manager = SchemaManager::new(8);

        manager.create_schema(&target).await.unwrap();
        manager.create_schema(&target).await.unwrap();

        assert_eq!(manager.current_version(&target).await.unwrap(), 1);
        let report = manager.validate_schema(&target).await.unwrap();
        assert!(report.valid, "issues: {:?}", report.issues);
    }

    #[tokio::test]
    async fn validate_reports_required_structure() {
        let dir = tempfile::tempdir().unwrap();
        let target = fresh_target(&dir).await;
        let manager = SchemaManager::new(8);
        manager.create_schema(&target).await.unwrap();

        let report = manager.validate_schema(&target).await.unwrap();
        assert!(report.valid, "issues: {:?}", report.issues);
        assert!(report.missing_tables.is_empty());
        assert!(report.missing_indexes.is_empty());
        assert!(report.vector_support);
        assert!(report.embedding_column);
        assert!(report.foreign_key_count >= 4);
    }

    #[tokio::test]
    async fn empty_target_needs_migration() {
        let dir = tempfile::tempdir().unwrap();
        let target = fresh_target(&dir).await;
        let manager = SchemaManager::new(8);

        assert_eq!(manager.current_version(&target).await.unwrap(), 0);
        assert!(manager.needs_migration(&target).await.unwrap());
    }
}
