//! End-to-end migration scenarios against real legacy fixture files.

use std::path::Path;
use std::sync::Arc;

use unistore_migrator::store::{DuckStore, SqliteStore};
use unistore_migrator::{
    MigrationOrchestrator, MigrationPhase, MigratorConfig, SqlValue, StoreDriver, StoreKind,
};

const DIM: usize = 8;

fn test_config(dir: &tempfile::TempDir) -> MigratorConfig {
    let mut config = MigratorConfig::new(dir.path());
    config.vector_dimension = DIM;
    config.batch_size = 2;
    config
}

/// Legacy row store: 3 conversations ("a", "b", "c"), 2 messages each.
async fn build_row_store(config: &MigratorConfig) {
    std::fs::create_dir_all(config.row_store_dir()).unwrap();
    let store = SqliteStore::open(
        &config.row_store_dir().join("chat.db"),
        StoreKind::RowStore,
        false,
    )
    .await
    .unwrap();

    store
        .exec(
            "CREATE TABLE conversations (convId TEXT PRIMARY KEY, title TEXT, \
             createdAt INTEGER, updatedAt INTEGER, isPinned INTEGER, isNew INTEGER, \
             systemPrompt TEXT, temperature REAL, contextLength INTEGER, maxTokens INTEGER, \
             providerId TEXT, modelId TEXT, artifacts INTEGER, enabledMcpTools TEXT)",
        )
        .await
        .unwrap();
    store
        .exec(
            "CREATE TABLE messages (msgId TEXT PRIMARY KEY, conversationId TEXT, \
             parentId TEXT, role TEXT, content TEXT, createdAt INTEGER, orderSeq INTEGER, \
             tokenCount INTEGER, status TEXT, metadata TEXT, isContextEdge INTEGER, \
             isVariant INTEGER)",
        )
        .await
        .unwrap();

    for (conv, title) in [("a", "Alpha"), ("b", "Beta"), ("c", "Gamma")] {
        store
            .execute(
                "INSERT INTO conversations (convId, title, createdAt, updatedAt, isPinned, isNew) \
                 VALUES (?, ?, 1000, 2000, 0, 1)",
                &[SqlValue::Text(conv.into()), SqlValue::Text(title.into())],
            )
            .await
            .unwrap();
        for seq in 0..2i64 {
            let role = if seq == 0 { "user" } else { "assistant" };
            store
                .execute(
                    "INSERT INTO messages (msgId, conversationId, role, content, createdAt, \
                     orderSeq, tokenCount, status) VALUES (?, ?, ?, ?, 1500, ?, 3, 'sent')",
                    &[
                        SqlValue::Text(format!("{}-m{}", conv, seq)),
                        SqlValue::Text(conv.into()),
                        SqlValue::Text(role.into()),
                        SqlValue::Text(format!("message {} of {}", seq, conv)),
                        SqlValue::Integer(seq),
                    ],
                )
                .await
                .unwrap();
        }
    }
    store.close().await.unwrap();
}

/// Legacy vector store: 3 knowledge files, 6 chunks, 6 embeddings of `DIM`
/// floats stored as bincode blobs. `bad_dimension_for` swaps one embedding
/// for a 7-float payload.
async fn build_vector_store(config: &MigratorConfig, bad_dimension_for: Option<&str>) {
    std::fs::create_dir_all(config.vector_store_dir()).unwrap();
    let store = DuckStore::open(
        &config.vector_store_dir().join("knowledge.duckdb"),
        StoreKind::VectorStore,
        false,
    )
    .unwrap();

    store
        .exec(
            "CREATE TABLE knowledge_files (id VARCHAR PRIMARY KEY, name VARCHAR, path VARCHAR, \
             mimeType VARCHAR, status VARCHAR, uploadedAt BIGINT, fileSize BIGINT, metadata VARCHAR); \
             CREATE TABLE knowledge_chunks (id VARCHAR PRIMARY KEY, fileId VARCHAR, \
             chunkIndex INTEGER, content VARCHAR, status VARCHAR, error VARCHAR, \
             chunkSize INTEGER, metadata VARCHAR); \
             CREATE TABLE knowledge_vectors (id VARCHAR PRIMARY KEY, fileId VARCHAR, \
             chunkId VARCHAR, embedding BLOB, createdAt BIGINT, modelName VARCHAR, metadata VARCHAR);",
        )
        .await
        .unwrap();

    for f in 1..=3 {
        let file_id = format!("f{}", f);
        store
            .execute(
                "INSERT INTO knowledge_files (id, name, path, mimeType, status, uploadedAt, fileSize) \
                 VALUES (?, ?, ?, 'text/plain', 'completed', 3000, 64)",
                &[
                    SqlValue::Text(file_id.clone()),
                    SqlValue::Text(format!("doc{}.txt", f)),
                    SqlValue::Text(format!("/docs/doc{}.txt", f)),
                ],
            )
            .await
            .unwrap();

        for part in 0..2i64 {
            let chunk_id = format!("f{}-c{}", f, part);
            store
                .execute(
                    "INSERT INTO knowledge_chunks (id, fileId, chunkIndex, content, status, chunkSize) \
                     VALUES (?, ?, ?, ?, 'completed', 32)",
                    &[
                        SqlValue::Text(chunk_id.clone()),
                        SqlValue::Text(file_id.clone()),
                        SqlValue::Integer(part),
                        SqlValue::Text(format!("chunk {} of file {}", part, f)),
                    ],
                )
                .await
                .unwrap();

            let vector_id = format!("f{}-v{}", f, part);
            let floats: Vec<f32> = if bad_dimension_for == Some(vector_id.as_str()) {
                vec![0.5; DIM - 1]
            } else {
                (0..DIM).map(|i| (i as f32 + f as f32) / 10.0).collect()
            };
            let blob = bincode::serialize(&floats).unwrap();
            store
                .execute(
                    "INSERT INTO knowledge_vectors (id, fileId, chunkId, embedding, createdAt, modelName) \
                     VALUES (?, ?, ?, ?, 4000, 'test-embedder')",
                    &[
                        SqlValue::Text(vector_id),
                        SqlValue::Text(file_id.clone()),
                        SqlValue::Text(chunk_id),
                        SqlValue::Blob(blob),
                    ],
                )
                .await
                .unwrap();
        }
    }
    store.close().await.unwrap();
}

async fn table_count(target: &DuckStore, table: &str) -> i64 {
    let rows = target
        .query(&format!("SELECT COUNT(*) FROM {}", table), &[])
        .await
        .unwrap();
    rows[0].as_i64(0).unwrap()
}

fn hash(path: &Path) -> String {
    unistore_migrator::backup::hash_file(path).unwrap()
}

#[tokio::test]
async fn happy_path_migrates_everything() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    build_row_store(&config).await;
    build_vector_store(&config, None).await;

    let orchestrator = MigrationOrchestrator::new(config.clone());
    let report = orchestrator.run(Arc::new(|_| {})).await.unwrap();

    assert!(report.success, "errors: {:?}", report.errors);
    assert_eq!(report.phase, MigrationPhase::Done);
    assert!(report.requires_migration);
    assert!(report.errors.is_empty());
    assert_eq!(report.rows_copied, 24);

    let target = DuckStore::open(&config.unified_path(), StoreKind::Unified, true).unwrap();
    assert_eq!(table_count(&target, "conversations").await, 3);
    assert_eq!(table_count(&target, "messages").await, 6);
    assert_eq!(table_count(&target, "knowledge_files").await, 3);
    assert_eq!(table_count(&target, "knowledge_chunks").await, 6);
    assert_eq!(table_count(&target, "knowledge_vectors").await, 6);

    let versions = target
        .query(
            "SELECT version, description, checksum FROM schema_versions",
            &[],
        )
        .await
        .unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].as_i64(0).unwrap(), 1);
    assert_eq!(versions[0].as_text(1).unwrap(), "initial");
    assert_eq!(versions[0].as_text(2).unwrap(), "initial_schema_v1");

    // Settings folded from flattened legacy columns with defaults.
    let settings = target
        .query("SELECT settings FROM conversations WHERE conv_id = 'a'", &[])
        .await
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_str(settings[0].as_text(0).unwrap()).unwrap();
    assert_eq!(parsed["provider_id"], "openai");
    assert_eq!(parsed["model_id"], "gpt-4");
    target.close().await.unwrap();

    // Legacy originals were archived out of the live directories.
    assert!(!config.row_store_dir().join("chat.db").exists());
    assert!(!config.vector_store_dir().join("knowledge.duckdb").exists());
    // The lock is gone.
    assert!(!config.lock_path().exists());
}

#[tokio::test]
async fn interrupted_copy_resumes_from_marker() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    build_row_store(&config).await;
    build_vector_store(&config, None).await;

    // Fabricate the state an interrupted run leaves behind: schema created,
    // conversations "a" and "b" committed, marker advanced to "b".
    {
        let target =
            DuckStore::open(&config.unified_path(), StoreKind::Unified, false).unwrap();
        unistore_migrator::SchemaManager::new(DIM)
            .create_schema(&target)
            .await
            .unwrap();
        target
            .exec(
                "INSERT INTO conversations (conv_id, title, created_at, updated_at) \
                 VALUES ('a', 'Alpha', 1000, 2000), ('b', 'Beta', 1000, 2000); \
                 INSERT INTO migration_metadata (key, value, created_at) \
                 VALUES ('last_copied:conversations', 'b', 0), ('phase', 'copy', 0);",
            )
            .await
            .unwrap();
        target.close().await.unwrap();
    }

    let orchestrator = MigrationOrchestrator::new(config.clone());
    let report = orchestrator.run(Arc::new(|_| {})).await.unwrap();
    assert!(report.success, "errors: {:?}", report.errors);

    let target = DuckStore::open(&config.unified_path(), StoreKind::Unified, true).unwrap();
    // Only "c" was copied on resume; nothing was duplicated.
    assert_eq!(table_count(&target, "conversations").await, 3);
    assert_eq!(table_count(&target, "messages").await, 6);
    target.close().await.unwrap();
}

#[tokio::test]
async fn corrupt_row_store_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    build_vector_store(&config, None).await;

    // Valid magic, zero-length payload.
    std::fs::create_dir_all(config.row_store_dir()).unwrap();
    let broken = config.row_store_dir().join("chat.db");
    std::fs::write(&broken, b"SQLite format 3\0").unwrap();
    let broken_hash = hash(&broken);
    let vector_path = config.vector_store_dir().join("knowledge.duckdb");
    let vector_hash = hash(&vector_path);

    let orchestrator = MigrationOrchestrator::new(config.clone());
    let report = orchestrator.run(Arc::new(|_| {})).await.unwrap();

    assert!(!report.success);
    assert_eq!(report.phase, MigrationPhase::Rollback);
    assert_eq!(report.system_state_valid, Some(true));
    // Legacy files are byte-identical to the pre-migration state.
    assert_eq!(hash(&broken), broken_hash);
    assert_eq!(hash(&vector_path), vector_hash);
    // The transient target was removed.
    assert!(!config.unified_path().exists());
    assert!(!config.lock_path().exists());
}

#[tokio::test]
async fn dimension_mismatch_rolls_back_with_user_message() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    build_row_store(&config).await;
    build_vector_store(&config, Some("f2-v1")).await;

    let row_path = config.row_store_dir().join("chat.db");
    let vector_path = config.vector_store_dir().join("knowledge.duckdb");
    let row_hash = hash(&row_path);
    let vector_hash = hash(&vector_path);

    let orchestrator = MigrationOrchestrator::new(config.clone());
    let report = orchestrator.run(Arc::new(|_| {})).await.unwrap();

    assert!(!report.success);
    assert_eq!(report.phase, MigrationPhase::Rollback);
    assert_eq!(report.system_state_valid, Some(true));
    assert!(
        report.errors.iter().any(|e| e.contains("dimension")),
        "errors: {:?}",
        report.errors
    );
    // Final state is pre-migration.
    assert_eq!(hash(&row_path), row_hash);
    assert_eq!(hash(&vector_path), vector_hash);
    assert!(!config.unified_path().exists());
}

#[tokio::test]
async fn cancellation_during_copy_restores_legacy_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    build_row_store(&config).await;
    build_vector_store(&config, None).await;

    let row_path = config.row_store_dir().join("chat.db");
    let vector_path = config.vector_store_dir().join("knowledge.duckdb");
    let row_hash = hash(&row_path);
    let vector_hash = hash(&vector_path);

    let orchestrator = MigrationOrchestrator::new(config.clone());
    let cancel = orchestrator.cancel_token();
    let report = orchestrator
        .run(Arc::new(move |progress| {
            if progress.phase == MigrationPhase::Copy && progress.current_step.contains("messages")
            {
                cancel.cancel();
            }
        }))
        .await
        .unwrap();

    assert!(!report.success);
    assert_eq!(report.phase, MigrationPhase::Rollback);
    assert!(
        report.errors.iter().any(|e| e.contains("cancelled")),
        "errors: {:?}",
        report.errors
    );
    // Byte-identical restoration.
    assert_eq!(hash(&row_path), row_hash);
    assert_eq!(hash(&vector_path), vector_hash);
    assert!(!config.lock_path().exists());
}

#[tokio::test]
async fn dry_run_leaves_everything_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.dry_run = true;
    build_row_store(&config).await;
    build_vector_store(&config, None).await;

    let orchestrator = MigrationOrchestrator::new(config.clone());
    let report = orchestrator.run(Arc::new(|_| {})).await.unwrap();

    assert!(report.success, "errors: {:?}", report.errors);
    assert_eq!(report.rows_copied, 24);
    // No unified store, legacy files untouched.
    assert!(!config.unified_path().exists());
    assert!(config.row_store_dir().join("chat.db").exists());
    assert!(config.vector_store_dir().join("knowledge.duckdb").exists());
}
