//! Copy Engine
//!
//! Drains the legacy stores table-by-table into the unified target in
//! primary-key order. Every batch is one target transaction that also
//! advances the `last_copied:<table>` marker, so an interrupted run resumes
//! exactly where the last committed batch ended.

use std::collections::BTreeMap;
use std::time::Instant;

use serde_json::json;

use crate::classify::{classify, ErrorContext};
use crate::error::{MigrationError, MigrationResult};
use crate::progress::{CancelToken, MigrationPhase, ProgressReporter};
use crate::settings::MigratorConfig;
use crate::store::{query_scalar_i64, Row, SqlValue, StoreDriver};

/// Topological copy order honoring foreign keys.
pub const COPY_ORDER: &[&str] = &[
    "conversations",
    "messages",
    "message_attachments",
    "knowledge_files",
    "knowledge_chunks",
    "knowledge_vectors",
];

const MESSAGE_ROLES: &[&str] = &["user", "assistant", "system", "function"];
const MESSAGE_STATUSES: &[&str] = &["sent", "pending", "error"];
const FILE_STATUSES: &[&str] = &["pending", "processing", "completed", "error"];

/// Per-run copy statistics, keyed by target table.
#[derive(Debug, Clone, Default)]
pub struct CopyStats {
    pub copied: BTreeMap<String, u64>,
    pub skipped: BTreeMap<String, u64>,
    pub batches: u64,
}

impl CopyStats {
    pub fn total_copied(&self) -> u64 {
        self.copied.values().sum()
    }

    pub fn total_skipped(&self) -> u64 {
        self.skipped.values().sum()
    }
}

/// How a copy run ended. Cancellation is observed between batches only.
#[derive(Debug)]
pub enum CopyOutcome {
    Completed(CopyStats),
    Cancelled(CopyStats),
}

/// Primary-key ordering discipline for a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PkKind {
    Text,
    Integer,
}

#[derive(Debug, Clone, PartialEq)]
enum PkValue {
    Text(String),
    Integer(i64),
}

impl PkValue {
    fn as_sql(&self) -> SqlValue {
        match self {
            PkValue::Text(s) => SqlValue::Text(s.clone()),
            PkValue::Integer(i) => SqlValue::Integer(*i),
        }
    }

    fn marker(&self) -> String {
        match self {
            PkValue::Text(s) => s.clone(),
            PkValue::Integer(i) => i.to_string(),
        }
    }
}

/// One translated source row ready for insertion.
struct TranslatedRow {
    params: Vec<SqlValue>,
    /// Per-row statement override (embedding literals); default otherwise.
    insert_sql: Option<String>,
}

struct TableJob<'a> {
    target_table: &'static str,
    source_table: &'static str,
    source: &'a dyn StoreDriver,
    pk_kind: PkKind,
    select_sql: String,
    insert_sql: &'static str,
}

pub struct CopyEngine<'a> {
    config: &'a MigratorConfig,
    target: &'a dyn StoreDriver,
    cancel: CancelToken,
    deadline: Option<(Instant, std::time::Duration)>,
}

impl<'a> CopyEngine<'a> {
    pub fn new(config: &'a MigratorConfig, target: &'a dyn StoreDriver, cancel: CancelToken) -> Self {
        Self {
            config,
            target,
            cancel,
            deadline: None,
        }
    }

    /// Arm the soft deadline for this run.
    pub fn with_deadline(mut self, started: Instant, limit: std::time::Duration) -> Self {
        self.deadline = Some((started, limit));
        self
    }

    /// Copy every table from the available sources in topological order.
    pub async fn copy_all(
        &self,
        row_source: Option<&dyn StoreDriver>,
        vector_source: Option<&dyn StoreDriver>,
        reporter: &mut ProgressReporter,
    ) -> MigrationResult<CopyOutcome> {
        let mut stats = CopyStats::default();
        let mut jobs: Vec<TableJob<'_>> = Vec::new();

        if let Some(source) = row_source {
            jobs.push(TableJob {
                target_table: "conversations",
                source_table: "conversations",
                source,
                pk_kind: PkKind::Text,
                select_sql: "SELECT convId, title, createdAt, updatedAt, isPinned, isNew, \
                             systemPrompt, temperature, contextLength, maxTokens, providerId, \
                             modelId, artifacts, enabledMcpTools \
                             FROM conversations WHERE convId > ? ORDER BY convId"
                    .to_string(),
                insert_sql: "INSERT INTO conversations \
                             (conv_id, title, created_at, updated_at, is_pinned, is_new, settings) \
                             VALUES (?, ?, ?, ?, ?, ?, ?)",
            });
            jobs.push(TableJob {
                target_table: "messages",
                source_table: "messages",
                source,
                pk_kind: PkKind::Text,
                select_sql: "SELECT msgId, conversationId, parentId, role, content, createdAt, \
                             orderSeq, tokenCount, status, metadata, isContextEdge, isVariant \
                             FROM messages WHERE msgId > ? ORDER BY msgId"
                    .to_string(),
                insert_sql: "INSERT INTO messages \
                             (msg_id, conversation_id, parent_id, role, content, created_at, \
                              order_seq, token_count, status, metadata, is_context_edge, is_variant) \
                             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            });
            jobs.push(TableJob {
                target_table: "message_attachments",
                source_table: "message_attachments",
                source,
                pk_kind: PkKind::Integer,
                select_sql: "SELECT id, messageId, attachmentType, attachmentData, createdAt, \
                             metadata FROM message_attachments WHERE id > ? ORDER BY id"
                    .to_string(),
                insert_sql: "INSERT INTO message_attachments \
                             (id, message_id, attachment_type, attachment_data, created_at, metadata) \
                             VALUES (?, ?, ?, ?, ?, ?)",
            });
        }

        if let Some(source) = vector_source {
            jobs.push(TableJob {
                target_table: "knowledge_files",
                source_table: "knowledge_files",
                source,
                pk_kind: PkKind::Text,
                select_sql: "SELECT id, name, path, mimeType, status, uploadedAt, fileSize, \
                             metadata FROM knowledge_files WHERE id > ? ORDER BY id"
                    .to_string(),
                insert_sql: "INSERT INTO knowledge_files \
                             (id, name, path, mime_type, status, uploaded_at, file_size, metadata) \
                             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            });
            jobs.push(TableJob {
                target_table: "knowledge_chunks",
                source_table: "knowledge_chunks",
                source,
                pk_kind: PkKind::Text,
                select_sql: "SELECT id, fileId, chunkIndex, content, status, error, chunkSize, \
                             metadata FROM knowledge_chunks WHERE id > ? ORDER BY id"
                    .to_string(),
                insert_sql: "INSERT INTO knowledge_chunks \
                             (id, file_id, chunk_index, content, status, error, chunk_size, metadata) \
                             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            });
            jobs.push(TableJob {
                target_table: "knowledge_vectors",
                source_table: "knowledge_vectors",
                source,
                pk_kind: PkKind::Text,
                select_sql: "SELECT id, fileId, chunkId, embedding, createdAt, modelName, metadata \
                             FROM knowledge_vectors WHERE id > ? ORDER BY id"
                    .to_string(),
                insert_sql: "",
            });
        }

        let total_jobs = jobs.len().max(1);
        for (index, job) in jobs.iter().enumerate() {
            if !self.source_has_table(job).await? {
                tracing::debug!(
                    "source table {} absent; nothing to copy",
                    job.source_table
                );
                continue;
            }

            let base = index as f32 / total_jobs as f32 * 100.0;
            reporter.emit(format!("copying {}", job.target_table), base);

            let cancelled = self.copy_table(job, &mut stats, reporter, base).await?;
            if cancelled {
                tracing::warn!("copy cancelled after table {}", job.target_table);
                return Ok(CopyOutcome::Cancelled(stats));
            }
        }

        reporter.emit("copy complete", 100.0);
        Ok(CopyOutcome::Completed(stats))
    }

    /// Copy a single table. Returns true if cancellation was observed.
    async fn copy_table(
        &self,
        job: &TableJob<'_>,
        stats: &mut CopyStats,
        reporter: &mut ProgressReporter,
        base_percentage: f32,
    ) -> MigrationResult<bool> {
        let ctx = ErrorContext::new(MigrationPhase::Copy, format!("copy:{}", job.target_table));
        let total = self.source_row_count(job).await.unwrap_or(0);
        let mut marker = self.read_marker(job).await?;
        let mut copied_this_run: u64 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(true);
            }
            self.check_deadline(job.target_table)?;

            let select = format!("{} LIMIT {}", job.select_sql, self.config.batch_size);
            let rows = job
                .source
                .query(&select, &[marker.as_sql()])
                .await
                .map_err(|e| classify(&e.to_string(), &ctx))?;
            if rows.is_empty() {
                break;
            }

            let mut batch: Vec<TranslatedRow> = Vec::with_capacity(rows.len());
            let mut batch_skipped: Vec<PkValue> = Vec::new();
            for row in &rows {
                match self.translate(job.target_table, row) {
                    Ok(translated) => batch.push(translated),
                    Err(e) if self.config.skip_bad_rows => {
                        let pk = self.row_pk(job, row);
                        tracing::warn!(
                            "skipping {} row {}: {}",
                            job.target_table,
                            pk.marker(),
                            e.raw
                        );
                        reporter.record_warning(format!(
                            "skipped {} row {}",
                            job.target_table,
                            pk.marker()
                        ));
                        batch_skipped.push(pk);
                    }
                    Err(e) => return Err(e),
                }
            }

            let last_pk = self
                .row_pk(job, rows.last().unwrap_or(&Row::new(Vec::new())))
                .marker();

            self.write_batch(job, &batch, &batch_skipped, &last_pk, &ctx)
                .await?;

            copied_this_run += batch.len() as u64;
            *stats.copied.entry(job.target_table.to_string()).or_insert(0) += batch.len() as u64;
            *stats.skipped.entry(job.target_table.to_string()).or_insert(0) +=
                batch_skipped.len() as u64;
            stats.batches += 1;
            marker = match job.pk_kind {
                PkKind::Text => PkValue::Text(last_pk.clone()),
                PkKind::Integer => PkValue::Integer(last_pk.parse().unwrap_or(i64::MIN)),
            };

            let fraction = if total > 0 {
                (copied_this_run as f32 / total as f32).min(1.0)
            } else {
                1.0
            };
            reporter.emit(
                format!("{}: {} rows", job.target_table, copied_this_run),
                base_percentage + fraction * (100.0 / COPY_ORDER.len() as f32),
            );
        }

        Ok(false)
    }

    /// One batch, one target transaction, marker update included.
    async fn write_batch(
        &self,
        job: &TableJob<'_>,
        batch: &[TranslatedRow],
        skipped: &[PkValue],
        last_pk: &str,
        ctx: &ErrorContext,
    ) -> MigrationResult<()> {
        self.target
            .begin()
            .await
            .map_err(|e| classify(&e.to_string(), ctx))?;

        let result: MigrationResult<()> = async {
            for row in batch {
                let sql = row.insert_sql.as_deref().unwrap_or(job.insert_sql);
                self.target
                    .execute(sql, &row.params)
                    .await
                    .map_err(|e| classify(&e.to_string(), ctx))?;
            }
            for pk in skipped {
                self.set_metadata(
                    &format!("skipped:{}:{}", job.target_table, pk.marker()),
                    "1",
                )
                .await
                .map_err(|e| classify(&e.to_string(), ctx))?;
            }
            self.set_metadata(&format!("last_copied:{}", job.target_table), last_pk)
                .await
                .map_err(|e| classify(&e.to_string(), ctx))?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => self
                .target
                .commit()
                .await
                .map_err(|e| classify(&e.to_string(), ctx)),
            Err(e) => {
                if let Err(rollback_err) = self.target.rollback_tx().await {
                    tracing::error!("batch rollback failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    fn translate(&self, table: &str, row: &Row) -> MigrationResult<TranslatedRow> {
        match table {
            "conversations" => self.translate_conversation(row),
            "messages" => self.translate_message(row),
            "message_attachments" => self.translate_attachment(row),
            "knowledge_files" => self.translate_knowledge_file(row),
            "knowledge_chunks" => self.translate_knowledge_chunk(row),
            "knowledge_vectors" => self.translate_knowledge_vector(row),
            other => Err(MigrationError::validation(
                "copy",
                format!("unknown copy table {}", other),
            )),
        }
    }

    /// Legacy conversations flatten their settings across columns; the
    /// target folds them into one JSON value, filling defaults.
    fn translate_conversation(&self, row: &Row) -> MigrationResult<TranslatedRow> {
        let conv_id = required_text(row, 0, "conversations", "convId")?;
        let settings = json!({
            "system_prompt": row.opt_text(6).unwrap_or(""),
            "temperature": row.opt_f64(7).unwrap_or(0.7),
            "context_length": row.opt_i64(8).unwrap_or(4000),
            "max_tokens": row.opt_i64(9).unwrap_or(2000),
            "provider_id": row.opt_text(10).unwrap_or("openai"),
            "model_id": row.opt_text(11).unwrap_or("gpt-4"),
            "artifacts": row.opt_i64(12).unwrap_or(0),
            "enabled_mcp_tools": row
                .opt_text(13)
                .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
                .unwrap_or_else(|| json!([])),
        });

        Ok(TranslatedRow {
            params: vec![
                SqlValue::Text(conv_id.to_string()),
                opt_text_value(row, 1),
                SqlValue::Integer(row.opt_i64(2).unwrap_or(0)),
                SqlValue::Integer(row.opt_i64(3).unwrap_or(0)),
                SqlValue::Integer(row.opt_i64(4).unwrap_or(0)),
                SqlValue::Integer(row.opt_i64(5).unwrap_or(0)),
                SqlValue::Text(settings.to_string()),
            ],
            insert_sql: None,
        })
    }

    fn translate_message(&self, row: &Row) -> MigrationResult<TranslatedRow> {
        let msg_id = required_text(row, 0, "messages", "msgId")?;
        let conversation_id = required_text(row, 1, "messages", "conversationId")?;

        let role = row.opt_text(3).unwrap_or("");
        if !MESSAGE_ROLES.contains(&role) {
            return Err(MigrationError::validation(
                "copy:messages",
                format!("message {} has unknown role '{}'", msg_id, role),
            ));
        }

        let status = match row.opt_text(8) {
            None => "sent".to_string(),
            Some(s) if MESSAGE_STATUSES.contains(&s) => s.to_string(),
            Some(s) => {
                return Err(MigrationError::validation(
                    "copy:messages",
                    format!("message {} has unknown status '{}'", msg_id, s),
                ))
            }
        };

        Ok(TranslatedRow {
            params: vec![
                SqlValue::Text(msg_id.to_string()),
                SqlValue::Text(conversation_id.to_string()),
                opt_text_value(row, 2),
                SqlValue::Text(role.to_string()),
                opt_text_value(row, 4),
                SqlValue::Integer(row.opt_i64(5).unwrap_or(0)),
                SqlValue::Integer(row.opt_i64(6).unwrap_or(0)),
                SqlValue::Integer(row.opt_i64(7).unwrap_or(0)),
                SqlValue::Text(status),
                opt_text_value(row, 9),
                SqlValue::Integer(row.opt_i64(10).unwrap_or(0)),
                SqlValue::Integer(row.opt_i64(11).unwrap_or(0)),
            ],
            insert_sql: None,
        })
    }

    fn translate_attachment(&self, row: &Row) -> MigrationResult<TranslatedRow> {
        let id = row.as_i64(0).map_err(|e| {
            MigrationError::validation("copy:message_attachments", e.to_string())
        })?;
        let message_id = required_text(row, 1, "message_attachments", "messageId")?;

        Ok(TranslatedRow {
            params: vec![
                SqlValue::Integer(id),
                SqlValue::Text(message_id.to_string()),
                SqlValue::Text(row.opt_text(2).unwrap_or("unknown").to_string()),
                opt_text_value(row, 3),
                SqlValue::Integer(row.opt_i64(4).unwrap_or(0)),
                opt_text_value(row, 5),
            ],
            insert_sql: None,
        })
    }

    fn translate_knowledge_file(&self, row: &Row) -> MigrationResult<TranslatedRow> {
        let id = required_text(row, 0, "knowledge_files", "id")?;
        let status = match row.opt_text(4) {
            None => "pending".to_string(),
            Some(s) if FILE_STATUSES.contains(&s) => s.to_string(),
            Some(s) => {
                return Err(MigrationError::validation(
                    "copy:knowledge_files",
                    format!("knowledge file {} has unknown status '{}'", id, s),
                ))
            }
        };

        Ok(TranslatedRow {
            params: vec![
                SqlValue::Text(id.to_string()),
                SqlValue::Text(row.opt_text(1).unwrap_or("unnamed").to_string()),
                opt_text_value(row, 2),
                opt_text_value(row, 3),
                SqlValue::Text(status),
                SqlValue::Integer(row.opt_i64(5).unwrap_or(0)),
                SqlValue::Integer(row.opt_i64(6).unwrap_or(0).max(0)),
                opt_text_value(row, 7),
            ],
            insert_sql: None,
        })
    }

    fn translate_knowledge_chunk(&self, row: &Row) -> MigrationResult<TranslatedRow> {
        let id = required_text(row, 0, "knowledge_chunks", "id")?;
        let file_id = required_text(row, 1, "knowledge_chunks", "fileId")?;

        Ok(TranslatedRow {
            params: vec![
                SqlValue::Text(id.to_string()),
                SqlValue::Text(file_id.to_string()),
                SqlValue::Integer(row.opt_i64(2).unwrap_or(0).max(0)),
                opt_text_value(row, 3),
                opt_text_value(row, 4),
                opt_text_value(row, 5),
                SqlValue::Integer(row.opt_i64(6).unwrap_or(0).max(0)),
                opt_text_value(row, 7),
            ],
            insert_sql: None,
        })
    }

    /// Embeddings arrive as bincode blobs of `Vec<f32>` and leave as native
    /// fixed-size float arrays. Dimension is enforced here, before insert.
    fn translate_knowledge_vector(&self, row: &Row) -> MigrationResult<TranslatedRow> {
        let id = required_text(row, 0, "knowledge_vectors", "id")?;
        let file_id = required_text(row, 1, "knowledge_vectors", "fileId")?;
        let chunk_id = required_text(row, 2, "knowledge_vectors", "chunkId")?;

        let blob = row.as_blob(3).map_err(|e| {
            MigrationError::validation(
                "copy:knowledge_vectors",
                format!("vector {} embedding is not a blob: {}", id, e),
            )
        })?;
        let embedding: Vec<f32> = bincode::deserialize(blob).map_err(|e| {
            MigrationError::corrupted(
                "copy:knowledge_vectors",
                format!("vector {} embedding blob is undecodable: {}", id, e),
            )
        })?;

        let dimension = self.config.vector_dimension;
        if embedding.len() != dimension {
            return Err(MigrationError::validation(
                "copy:knowledge_vectors",
                format!(
                    "vector {} has dimension {} where {} was expected",
                    id,
                    embedding.len(),
                    dimension
                ),
            )
            .with_user_message(format!(
                "A knowledge embedding has the wrong dimension ({} instead of {}). \
                 Your original files will be restored.",
                embedding.len(),
                dimension
            )));
        }
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(MigrationError::validation(
                "copy:knowledge_vectors",
                format!("vector {} contains non-finite values", id),
            ));
        }

        let literal = embedding
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let insert_sql = format!(
            "INSERT INTO knowledge_vectors \
             (id, file_id, chunk_id, embedding, created_at, model_name, metadata) \
             VALUES (?, ?, ?, [{}]::FLOAT[{}], ?, ?, ?)",
            literal, dimension
        );

        Ok(TranslatedRow {
            params: vec![
                SqlValue::Text(id.to_string()),
                SqlValue::Text(file_id.to_string()),
                SqlValue::Text(chunk_id.to_string()),
                SqlValue::Integer(row.opt_i64(4).unwrap_or(0)),
                SqlValue::Text(row.opt_text(5).unwrap_or("unknown").to_string()),
                opt_text_value(row, 6),
            ],
            insert_sql: Some(insert_sql),
        })
    }

    fn row_pk(&self, job: &TableJob<'_>, row: &Row) -> PkValue {
        match job.pk_kind {
            PkKind::Text => PkValue::Text(row.opt_text(0).unwrap_or("").to_string()),
            PkKind::Integer => PkValue::Integer(row.opt_i64(0).unwrap_or(i64::MIN)),
        }
    }

    async fn read_marker(&self, job: &TableJob<'_>) -> MigrationResult<PkValue> {
        let ctx = ErrorContext::new(MigrationPhase::Copy, format!("copy:{}", job.target_table));
        let rows = self
            .target
            .query(
                "SELECT value FROM migration_metadata WHERE key = ?",
                &[SqlValue::Text(format!("last_copied:{}", job.target_table))],
            )
            .await
            .map_err(|e| classify(&e.to_string(), &ctx))?;

        let stored = rows.first().and_then(|r| r.opt_text(0));
        Ok(match (job.pk_kind, stored) {
            (PkKind::Text, Some(value)) => PkValue::Text(value.to_string()),
            (PkKind::Text, None) => PkValue::Text(String::new()),
            (PkKind::Integer, Some(value)) => {
                PkValue::Integer(value.parse().unwrap_or(i64::MIN))
            }
            (PkKind::Integer, None) => PkValue::Integer(i64::MIN),
        })
    }

    async fn set_metadata(&self, key: &str, value: &str) -> Result<(), crate::store::StoreError> {
        self.target
            .execute(
                "INSERT OR REPLACE INTO migration_metadata (key, value, created_at) VALUES (?, ?, ?)",
                &[
                    SqlValue::Text(key.to_string()),
                    SqlValue::Text(value.to_string()),
                    SqlValue::Integer(chrono::Utc::now().timestamp_millis()),
                ],
            )
            .await
            .map(|_| ())
    }

    async fn source_has_table(&self, job: &TableJob<'_>) -> MigrationResult<bool> {
        let ctx = ErrorContext::new(MigrationPhase::Copy, format!("copy:{}", job.target_table));
        let sql = match job.source.kind() {
            crate::store::StoreKind::RowStore => {
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?"
            }
            _ => {
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = 'main' AND table_name = ?"
            }
        };
        let count = query_scalar_i64(job.source, sql, &[SqlValue::Text(job.source_table.into())])
            .await
            .map_err(|e| classify(&e.to_string(), &ctx))?;
        Ok(count > 0)
    }

    async fn source_row_count(&self, job: &TableJob<'_>) -> MigrationResult<i64> {
        let ctx = ErrorContext::new(MigrationPhase::Copy, format!("copy:{}", job.target_table));
        query_scalar_i64(
            job.source,
            &format!("SELECT COUNT(*) FROM {}", job.source_table),
            &[],
        )
        .await
        .map_err(|e| classify(&e.to_string(), &ctx))
    }

    fn check_deadline(&self, table: &str) -> MigrationResult<()> {
        if let Some((started, limit)) = self.deadline {
            if started.elapsed() > limit {
                return Err(MigrationError::timeout(
                    format!("copy:{}", table),
                    format!("copy exceeded its {}s deadline", limit.as_secs()),
                ));
            }
        }
        Ok(())
    }
}

fn required_text<'r>(
    row: &'r Row,
    index: usize,
    table: &str,
    column: &str,
) -> MigrationResult<&'r str> {
    match row.opt_text(index) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(MigrationError::validation(
            format!("copy:{}", table),
            format!("{}.{} is empty or missing", table, column),
        )),
    }
}

fn opt_text_value(row: &Row, index: usize) -> SqlValue {
    match row.opt_text(index) {
        Some(value) => SqlValue::Text(value.to_string()),
        None => SqlValue::Null,
    }
}
