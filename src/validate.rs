//! Post-Copy Validation
//!
//! Read-only rules over the unified store, grouped into structure, data,
//! relationship, and performance categories. Structure, data, and
//! relationship failures are errors and fail the phase; performance
//! findings are warnings only.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::classify::ValidationScope;
use crate::error::{MigrationError, MigrationResult};
use crate::progress::{CancelToken, ProgressReporter};
use crate::schema::{SchemaManager, LATEST_VERSION, VECTOR_INDEXES};
use crate::store::{query_scalar_i64, StoreDriver};

/// Result of one validation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub name: String,
    pub category: String,
    pub passed: bool,
    pub is_error: bool,
    pub message: String,
    pub details: Option<String>,
    pub affected_records: Option<i64>,
    pub suggested_action: Option<String>,
}

impl RuleOutcome {
    fn pass(name: &str, category: ValidationScope, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            category: category_name(category).to_string(),
            passed: true,
            is_error: false,
            message: message.into(),
            details: None,
            affected_records: None,
            suggested_action: None,
        }
    }

    fn fail(name: &str, category: ValidationScope, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            category: category_name(category).to_string(),
            passed: false,
            is_error: category != ValidationScope::Performance,
            message: message.into(),
            details: None,
            affected_records: None,
            suggested_action: None,
        }
    }

    fn with_affected(mut self, count: i64) -> Self {
        self.affected_records = Some(count);
        self
    }

    fn with_action(mut self, action: impl Into<String>) -> Self {
        self.suggested_action = Some(action.into());
        self
    }
}

fn category_name(scope: ValidationScope) -> &'static str {
    match scope {
        ValidationScope::Structure => "structure",
        ValidationScope::Data => "data",
        ValidationScope::Relationships => "relationships",
        ValidationScope::Performance => "performance",
    }
}

/// The full validation report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub outcomes: Vec<RuleOutcome>,
    pub passed: bool,
}

impl ValidationReport {
    pub fn failures(&self) -> impl Iterator<Item = &RuleOutcome> {
        self.outcomes.iter().filter(|o| !o.passed && o.is_error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &RuleOutcome> {
        self.outcomes.iter().filter(|o| !o.passed && !o.is_error)
    }

    /// The scope of the first failing error rule, for the classifier.
    pub fn first_failure_scope(&self) -> Option<ValidationScope> {
        self.failures().next().map(|o| match o.category.as_str() {
            "structure" => ValidationScope::Structure,
            "relationships" => ValidationScope::Relationships,
            "performance" => ValidationScope::Performance,
            _ => ValidationScope::Data,
        })
    }
}

/// How a validation run ended.
#[derive(Debug)]
pub enum ValidationOutcome {
    Completed(ValidationReport),
    Cancelled,
}

pub struct Validator<'a> {
    target: &'a dyn StoreDriver,
    dimension: usize,
    cancel: CancelToken,
    deadline: Option<(Instant, std::time::Duration)>,
}

impl<'a> Validator<'a> {
    pub fn new(target: &'a dyn StoreDriver, dimension: usize, cancel: CancelToken) -> Self {
        Self {
            target,
            dimension,
            cancel,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, started: Instant, limit: std::time::Duration) -> Self {
        self.deadline = Some((started, limit));
        self
    }

    /// Run every rule, polling cancellation between rules.
    pub async fn run(&self, reporter: &mut ProgressReporter) -> MigrationResult<ValidationOutcome> {
        let mut report = ValidationReport::default();

        let rules = [
            "schema_structure",
            "schema_version",
            "conversation_data",
            "message_data",
            "knowledge_data",
            "vector_data_integrity",
            "orphaned_rows",
            "foreign_keys",
            "message_parent_cycles",
            "vector_indexes",
            "query_plans",
        ];

        for (index, name) in rules.iter().enumerate() {
            if self.cancel.is_cancelled() {
                tracing::warn!("validation cancelled before rule {}", name);
                return Ok(ValidationOutcome::Cancelled);
            }
            self.check_deadline(name)?;

            let percentage = index as f32 / rules.len() as f32 * 100.0;
            reporter.emit(format!("rule {}", name), percentage);

            let mut outcomes = match *name {
                "schema_structure" => self.rule_schema_structure().await?,
                "schema_version" => self.rule_schema_version().await?,
                "conversation_data" => self.rule_conversation_data().await?,
                "message_data" => self.rule_message_data().await?,
                "knowledge_data" => self.rule_knowledge_data().await?,
                "vector_data_integrity" => self.rule_vector_data_integrity().await?,
                "orphaned_rows" => self.rule_orphaned_rows().await?,
                "foreign_keys" => self.rule_foreign_keys().await?,
                "message_parent_cycles" => self.rule_message_parent_cycles().await?,
                "vector_indexes" => self.rule_vector_indexes().await?,
                _ => self.rule_query_plans().await?,
            };
            for outcome in &outcomes {
                if !outcome.passed {
                    if outcome.is_error {
                        tracing::error!("validation rule {} failed: {}", name, outcome.message);
                    } else {
                        tracing::warn!("validation rule {}: {}", name, outcome.message);
                        reporter.record_warning(outcome.message.clone());
                    }
                }
            }
            report.outcomes.append(&mut outcomes);
        }

        let all_passed = report.failures().next().is_none();
        report.passed = all_passed;
        reporter.emit("validation complete", 100.0);
        Ok(ValidationOutcome::Completed(report))
    }

    async fn rule_schema_structure(&self) -> MigrationResult<Vec<RuleOutcome>> {
        let schema = SchemaManager::new(self.dimension)
            .validate_schema(self.target)
            .await?;
        let mut outcomes = Vec::new();

        if schema.missing_tables.is_empty() {
            outcomes.push(RuleOutcome::pass(
                "required_tables",
                ValidationScope::Structure,
                "all required tables present",
            ));
        } else {
            outcomes.push(
                RuleOutcome::fail(
                    "required_tables",
                    ValidationScope::Structure,
                    format!("missing tables: {}", schema.missing_tables.join(", ")),
                )
                .with_action("re-run schema creation"),
            );
        }

        if schema.vector_support && schema.embedding_column {
            outcomes.push(RuleOutcome::pass(
                "vector_support",
                ValidationScope::Structure,
                "vector column and distance functions available",
            ));
        } else {
            outcomes.push(RuleOutcome::fail(
                "vector_support",
                ValidationScope::Structure,
                "vector support is missing from the target store",
            ));
        }

        if schema.missing_indexes.is_empty() {
            outcomes.push(RuleOutcome::pass(
                "critical_indexes",
                ValidationScope::Structure,
                "critical indexes present",
            ));
        } else {
            outcomes.push(RuleOutcome::fail(
                "critical_indexes",
                ValidationScope::Structure,
                format!("missing indexes: {}", schema.missing_indexes.join(", ")),
            ));
        }

        Ok(outcomes)
    }

    async fn rule_schema_version(&self) -> MigrationResult<Vec<RuleOutcome>> {
        let version = SchemaManager::new(self.dimension)
            .current_version(self.target)
            .await?;
        Ok(vec![if version == LATEST_VERSION {
            RuleOutcome::pass(
                "schema_version",
                ValidationScope::Structure,
                format!("schema version {}", version),
            )
        } else {
            RuleOutcome::fail(
                "schema_version",
                ValidationScope::Structure,
                format!("schema version {} does not match latest {}", version, LATEST_VERSION),
            )
        }])
    }

    async fn rule_conversation_data(&self) -> MigrationResult<Vec<RuleOutcome>> {
        let mut outcomes = Vec::new();

        let empty_ids = self
            .count("SELECT COUNT(*) FROM conversations WHERE conv_id = ''")
            .await?;
        outcomes.push(if empty_ids == 0 {
            RuleOutcome::pass("conversation_ids", ValidationScope::Data, "conversation IDs non-empty")
        } else {
            RuleOutcome::fail(
                "conversation_ids",
                ValidationScope::Data,
                format!("{} conversations have empty IDs", empty_ids),
            )
            .with_affected(empty_ids)
        });

        let clock_skew = self
            .count("SELECT COUNT(*) FROM conversations WHERE updated_at < created_at")
            .await?;
        outcomes.push(if clock_skew == 0 {
            RuleOutcome::pass(
                "conversation_timestamps",
                ValidationScope::Data,
                "conversation timestamps are ordered",
            )
        } else {
            RuleOutcome::fail(
                "conversation_timestamps",
                ValidationScope::Data,
                format!("{} conversations have updated_at before created_at", clock_skew),
            )
            .with_affected(clock_skew)
        });

        Ok(outcomes)
    }

    async fn rule_message_data(&self) -> MigrationResult<Vec<RuleOutcome>> {
        let mut outcomes = Vec::new();

        let negative_seq = self
            .count("SELECT COUNT(*) FROM messages WHERE order_seq < 0")
            .await?;
        outcomes.push(if negative_seq == 0 {
            RuleOutcome::pass("message_order", ValidationScope::Data, "order_seq values valid")
        } else {
            RuleOutcome::fail(
                "message_order",
                ValidationScope::Data,
                format!("{} messages have negative order_seq", negative_seq),
            )
            .with_affected(negative_seq)
        });

        let bad_roles = self
            .count(
                "SELECT COUNT(*) FROM messages \
                 WHERE role NOT IN ('user', 'assistant', 'system', 'function')",
            )
            .await?;
        outcomes.push(if bad_roles == 0 {
            RuleOutcome::pass("message_roles", ValidationScope::Data, "all roles in enum")
        } else {
            RuleOutcome::fail(
                "message_roles",
                ValidationScope::Data,
                format!("{} messages have roles outside the enum", bad_roles),
            )
            .with_affected(bad_roles)
        });

        Ok(outcomes)
    }

    async fn rule_knowledge_data(&self) -> MigrationResult<Vec<RuleOutcome>> {
        let mut outcomes = Vec::new();

        let bad_status = self
            .count(
                "SELECT COUNT(*) FROM knowledge_files \
                 WHERE status NOT IN ('pending', 'processing', 'completed', 'error')",
            )
            .await?;
        outcomes.push(if bad_status == 0 {
            RuleOutcome::pass("file_status", ValidationScope::Data, "file statuses in enum")
        } else {
            RuleOutcome::fail(
                "file_status",
                ValidationScope::Data,
                format!("{} knowledge files have invalid status", bad_status),
            )
            .with_affected(bad_status)
        });

        let empty_chunks = self
            .count(
                "SELECT COUNT(*) FROM knowledge_chunks \
                 WHERE content IS NULL OR content = ''",
            )
            .await?;
        outcomes.push(if empty_chunks == 0 {
            RuleOutcome::pass("chunk_content", ValidationScope::Data, "chunk content non-empty")
        } else {
            RuleOutcome::fail(
                "chunk_content",
                ValidationScope::Data,
                format!("{} knowledge chunks have empty content", empty_chunks),
            )
            .with_affected(empty_chunks)
            .with_action("re-process the affected source files after migration")
        });

        Ok(outcomes)
    }

    async fn rule_vector_data_integrity(&self) -> MigrationResult<Vec<RuleOutcome>> {
        let declared = self
            .target
            .query(
                "SELECT data_type FROM information_schema.columns \
                 WHERE table_name = 'knowledge_vectors' AND column_name = 'embedding'",
                &[],
            )
            .await
            .map_err(|e| MigrationError::validation("validate:vectors", e.to_string()))?;

        let expected = format!("FLOAT[{}]", self.dimension);
        let actual = declared
            .first()
            .and_then(|r| r.opt_text(0))
            .unwrap_or("")
            .to_uppercase();

        Ok(vec![if actual == expected {
            RuleOutcome::pass(
                "vector_data_integrity",
                ValidationScope::Data,
                format!("embeddings are fixed {}-dimensional vectors", self.dimension),
            )
        } else {
            RuleOutcome::fail(
                "vector_data_integrity",
                ValidationScope::Data,
                format!(
                    "embedding column is '{}', expected '{}'",
                    actual, expected
                ),
            )
        }])
    }

    async fn rule_orphaned_rows(&self) -> MigrationResult<Vec<RuleOutcome>> {
        let checks = [
            (
                "orphaned_messages",
                "SELECT COUNT(*) FROM messages m \
                 LEFT JOIN conversations c ON m.conversation_id = c.conv_id \
                 WHERE c.conv_id IS NULL",
            ),
            (
                "orphaned_chunks",
                "SELECT COUNT(*) FROM knowledge_chunks k \
                 LEFT JOIN knowledge_files f ON k.file_id = f.id \
                 WHERE f.id IS NULL",
            ),
            (
                "orphaned_vectors",
                "SELECT COUNT(*) FROM knowledge_vectors v \
                 LEFT JOIN knowledge_chunks k ON v.chunk_id = k.id \
                 WHERE k.id IS NULL",
            ),
        ];

        let mut outcomes = Vec::new();
        for (name, sql) in checks {
            let orphans = self.count(sql).await?;
            outcomes.push(if orphans == 0 {
                RuleOutcome::pass(name, ValidationScope::Relationships, "no orphaned rows")
            } else {
                RuleOutcome::fail(
                    name,
                    ValidationScope::Relationships,
                    format!("{} orphaned rows", orphans),
                )
                .with_affected(orphans)
            });
        }
        Ok(outcomes)
    }

    async fn rule_foreign_keys(&self) -> MigrationResult<Vec<RuleOutcome>> {
        let count = query_scalar_i64(
            self.target,
            "SELECT COUNT(*) FROM duckdb_constraints() WHERE constraint_type = 'FOREIGN KEY'",
            &[],
        )
        .await
        .unwrap_or(0);

        Ok(vec![if count >= 4 {
            RuleOutcome::pass(
                "foreign_keys",
                ValidationScope::Relationships,
                format!("{} foreign key constraints", count),
            )
        } else {
            RuleOutcome::fail(
                "foreign_keys",
                ValidationScope::Relationships,
                format!("only {} foreign key constraints, expected at least 4", count),
            )
        }])
    }

    /// `messages.parent_id` may form a chain but never a cycle. The walk is
    /// bounded per conversation by its message count.
    async fn rule_message_parent_cycles(&self) -> MigrationResult<Vec<RuleOutcome>> {
        let rows = self
            .target
            .query(
                "SELECT conversation_id, msg_id, parent_id FROM messages ORDER BY conversation_id",
                &[],
            )
            .await
            .map_err(|e| MigrationError::validation("validate:cycles", e.to_string()))?;

        let mut by_conversation: HashMap<String, HashMap<String, Option<String>>> = HashMap::new();
        for row in &rows {
            let conv = row.opt_text(0).unwrap_or("").to_string();
            let msg = row.opt_text(1).unwrap_or("").to_string();
            let parent = row.opt_text(2).map(str::to_string);
            by_conversation.entry(conv).or_default().insert(msg, parent);
        }

        let mut cycles = 0i64;
        for (conversation, parents) in &by_conversation {
            let bound = parents.len();
            for start in parents.keys() {
                let mut current = Some(start.clone());
                let mut steps = 0;
                while let Some(node) = current {
                    if steps > bound {
                        tracing::error!(
                            "parent cycle detected in conversation {} starting at {}",
                            conversation,
                            start
                        );
                        cycles += 1;
                        break;
                    }
                    steps += 1;
                    current = parents.get(&node).cloned().flatten();
                }
            }
        }

        Ok(vec![if cycles == 0 {
            RuleOutcome::pass(
                "message_parent_cycles",
                ValidationScope::Relationships,
                "no parent cycles",
            )
        } else {
            RuleOutcome::fail(
                "message_parent_cycles",
                ValidationScope::Relationships,
                format!("{} parent chains form cycles", cycles),
            )
            .with_affected(cycles)
        }])
    }

    async fn rule_vector_indexes(&self) -> MigrationResult<Vec<RuleOutcome>> {
        let rows = self
            .target
            .query("SELECT index_name FROM duckdb_indexes()", &[])
            .await
            .map_err(|e| MigrationError::validation("validate:indexes", e.to_string()))?;
        let names: Vec<String> = rows
            .iter()
            .filter_map(|r| r.opt_text(0).map(str::to_string))
            .collect();

        let missing: Vec<&str> = VECTOR_INDEXES
            .iter()
            .filter(|(name, _)| !names.iter().any(|n| n == name))
            .map(|(_, metric)| *metric)
            .collect();

        Ok(vec![if missing.is_empty() {
            RuleOutcome::pass(
                "vector_indexes",
                ValidationScope::Performance,
                "ANN indexes present for all declared distances",
            )
        } else {
            RuleOutcome::fail(
                "vector_indexes",
                ValidationScope::Performance,
                format!("ANN indexes missing for: {}", missing.join(", ")),
            )
            .with_action("install the vss extension and re-create vector indexes")
        }])
    }

    async fn rule_query_plans(&self) -> MigrationResult<Vec<RuleOutcome>> {
        let plan = self
            .target
            .query(
                "EXPLAIN SELECT msg_id FROM messages WHERE conversation_id = 'probe' ORDER BY order_seq",
                &[],
            )
            .await;

        Ok(vec![match plan {
            Ok(rows) => {
                let text = rows
                    .iter()
                    .flat_map(|r| (0..r.len()).filter_map(|i| r.opt_text(i)))
                    .collect::<Vec<_>>()
                    .join("\n")
                    .to_uppercase();
                if text.contains("INDEX") {
                    RuleOutcome::pass(
                        "query_plans",
                        ValidationScope::Performance,
                        "conversation scan uses an index",
                    )
                } else {
                    RuleOutcome::fail(
                        "query_plans",
                        ValidationScope::Performance,
                        "conversation scan does not report index usage",
                    )
                }
            }
            Err(e) => RuleOutcome::fail(
                "query_plans",
                ValidationScope::Performance,
                format!("could not explain representative query: {}", e),
            ),
        }])
    }

    async fn count(&self, sql: &str) -> MigrationResult<i64> {
        query_scalar_i64(self.target, sql, &[])
            .await
            .map_err(|e| MigrationError::validation("validate", e.to_string()))
    }

    fn check_deadline(&self, rule: &str) -> MigrationResult<()> {
        if let Some((started, limit)) = self.deadline {
            if started.elapsed() > limit {
                return Err(MigrationError::timeout(
                    format!("validate:{}", rule),
                    format!("validation exceeded its {}s deadline", limit.as_secs()),
                ));
            }
        }
        Ok(())
    }
}
