//! Migration Phases and Progress Reporting
//!
//! Progress is delivered through a caller-supplied callback. The callback
//! must be fast and non-throwing; it is invoked synchronously at suspension
//! points, so a slow callback delays the next batch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// The orchestrator's states. Phase transitions are the only checkpoint
/// boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Init,
    Detect,
    Preflight,
    Backup,
    Schema,
    Copy,
    Validate,
    Finalize,
    Rollback,
    Done,
    Aborted,
}

impl MigrationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationPhase::Init => "init",
            MigrationPhase::Detect => "detect",
            MigrationPhase::Preflight => "preflight",
            MigrationPhase::Backup => "backup",
            MigrationPhase::Schema => "schema",
            MigrationPhase::Copy => "copy",
            MigrationPhase::Validate => "validate",
            MigrationPhase::Finalize => "finalize",
            MigrationPhase::Rollback => "rollback",
            MigrationPhase::Done => "done",
            MigrationPhase::Aborted => "aborted",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "init" => Some(MigrationPhase::Init),
            "detect" => Some(MigrationPhase::Detect),
            "preflight" => Some(MigrationPhase::Preflight),
            "backup" => Some(MigrationPhase::Backup),
            "schema" => Some(MigrationPhase::Schema),
            "copy" => Some(MigrationPhase::Copy),
            "validate" => Some(MigrationPhase::Validate),
            "finalize" => Some(MigrationPhase::Finalize),
            "rollback" => Some(MigrationPhase::Rollback),
            "done" => Some(MigrationPhase::Done),
            "aborted" => Some(MigrationPhase::Aborted),
            _ => None,
        }
    }
}

/// A progress snapshot delivered to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationProgress {
    pub phase: MigrationPhase,
    pub current_step: String,
    /// Completion of the current phase, 0..=100.
    pub percentage: f32,
    /// Milliseconds since the epoch when the run started.
    pub start_time: i64,
    /// Estimated seconds remaining for the phase, when computable.
    pub eta_seconds: Option<u64>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Callback signature for progress delivery.
pub type ProgressCallback = Arc<dyn Fn(MigrationProgress) + Send + Sync>;

/// Cooperative cancellation flag, polled between batches, rules, and
/// restorations. Mid-batch cancellation is not offered.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Emits progress snapshots for the current phase.
pub struct ProgressReporter {
    callback: ProgressCallback,
    phase: MigrationPhase,
    phase_started: Instant,
    run_started_ms: i64,
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl ProgressReporter {
    pub fn new(callback: ProgressCallback) -> Self {
        Self {
            callback,
            phase: MigrationPhase::Init,
            phase_started: Instant::now(),
            run_started_ms: chrono::Utc::now().timestamp_millis(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// A reporter that discards everything; handy in tests.
    pub fn sink() -> Self {
        Self::new(Arc::new(|_| {}))
    }

    pub fn enter_phase(&mut self, phase: MigrationPhase) {
        self.phase = phase;
        self.phase_started = Instant::now();
        tracing::info!("entering phase {}", phase.as_str());
        self.emit(format!("{} started", phase.as_str()), 0.0);
    }

    pub fn phase(&self) -> MigrationPhase {
        self.phase
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn record_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Emit a snapshot for the current phase.
    pub fn emit(&self, step: impl Into<String>, percentage: f32) {
        let pct = percentage.clamp(0.0, 100.0);
        let eta = self.estimate_eta(pct);
        (self.callback)(MigrationProgress {
            phase: self.phase,
            current_step: step.into(),
            percentage: pct,
            start_time: self.run_started_ms,
            eta_seconds: eta,
            errors: self.errors.clone(),
            warnings: self.warnings.clone(),
        });
    }

    fn estimate_eta(&self, percentage: f32) -> Option<u64> {
        if percentage <= 0.0 || percentage >= 100.0 {
            return None;
        }
        let elapsed = self.phase_started.elapsed();
        let total = elapsed.as_secs_f64() * 100.0 / percentage as f64;
        let remaining = total - elapsed.as_secs_f64();
        if remaining.is_finite() && remaining > 0.0 {
            Some(Duration::from_secs_f64(remaining).as_secs())
        } else {
            None
        }
    }
}
