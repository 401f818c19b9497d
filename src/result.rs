use crate::instance::Instance;
use crate::status::ExecutionStatus;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

fn unix_secs<S: Serializer>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    serializer.serialize_u64(secs)
}

fn duration_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Per-target outcome record. Created when the worker picks the target up and
/// finalized exactly once before it is sent to the collector.
///
/// The `metadata` map is owned by this record alone. Workers never publish it
/// to each other and installers must hand over freshly allocated maps, so two
/// results can never alias the same identity token.
#[derive(Debug, Serialize)]
pub struct ExecutionResult {
    pub instance: Instance,
    pub status: ExecutionStatus,
    pub validation_err: Option<String>,
    pub installation_err: Option<String>,
    pub tagging_err: Option<String>,
    /// Installer-observed facts about this target (detected OS, issued or
    /// preserved certname, ...).
    pub metadata: HashMap<String, String>,
    #[serde(serialize_with = "unix_secs")]
    pub start_time: SystemTime,
    #[serde(serialize_with = "unix_secs")]
    pub end_time: SystemTime,
    #[serde(serialize_with = "duration_secs")]
    pub duration: Duration,
}

impl ExecutionResult {
    /// Fresh record for a target a worker has just picked up.
    pub fn new(instance: Instance) -> Self {
        let now = SystemTime::now();
        Self {
            instance,
            status: ExecutionStatus::Running,
            validation_err: None,
            installation_err: None,
            tagging_err: None,
            metadata: HashMap::new(),
            start_time: now,
            end_time: now,
            duration: Duration::ZERO,
        }
    }

    /// Zero-duration record for a target that was canceled before it ever
    /// started (e.g. while waiting for a concurrency permit).
    pub fn cancelled(instance: Instance) -> Self {
        let mut result = Self::new(instance);
        result.status = ExecutionStatus::Cancelled;
        result
    }

    /// Set the terminal status and capture timing. Must be called exactly
    /// once per record.
    pub fn finalize(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.end_time = SystemTime::now();
        self.duration = self
            .end_time
            .duration_since(self.start_time)
            .unwrap_or_default();
    }

    /// Primary error under the validation > installation > tagging priority.
    pub fn get_error(&self) -> Option<&str> {
        self.validation_err
            .as_deref()
            .or(self.installation_err.as_deref())
            .or(self.tagging_err.as_deref())
    }
}

/// Run summary. Owned by the result collector; workers never touch it.
#[derive(Debug, Serialize)]
pub struct AggregatedResult {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub canceled: usize,
    /// Per-target records in arrival (completion) order, not input order.
    pub results: Vec<ExecutionResult>,
    #[serde(serialize_with = "unix_secs")]
    pub start_time: SystemTime,
    #[serde(serialize_with = "unix_secs")]
    pub end_time: SystemTime,
    #[serde(serialize_with = "duration_secs")]
    pub total_time: Duration,
}

impl AggregatedResult {
    pub fn new() -> Self {
        let now = SystemTime::now();
        Self {
            total: 0,
            success: 0,
            failed: 0,
            skipped: 0,
            canceled: 0,
            results: Vec::new(),
            start_time: now,
            end_time: now,
            total_time: Duration::ZERO,
        }
    }

    /// Record one target outcome, bumping exactly one status counter.
    pub fn add(&mut self, result: ExecutionResult) {
        match result.status {
            ExecutionStatus::Success => self.success += 1,
            ExecutionStatus::Failed => self.failed += 1,
            ExecutionStatus::Skipped => self.skipped += 1,
            ExecutionStatus::Cancelled => self.canceled += 1,
            ExecutionStatus::Pending | ExecutionStatus::Running => {
                // A worker finalizes every record; a non-terminal status here
                // is a bug, but the counter partition must stay accurate.
                warn!(
                    instance = %result.instance,
                    status = %result.status,
                    "non-terminal result reached the aggregator; counting as failed"
                );
                self.failed += 1;
            }
        }
        self.total += 1;
        self.results.push(result);
    }

    /// Capture end-of-run timing. Called once after the result channel
    /// closes.
    pub fn finalize(&mut self) {
        self.end_time = SystemTime::now();
        self.total_time = self
            .end_time
            .duration_since(self.start_time)
            .unwrap_or_default();
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        100.0 * self.success as f64 / self.total as f64
    }

    pub fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        100.0 * self.failed as f64 / self.total as f64
    }

    /// Targets that ended up `Failed`, in arrival order.
    pub fn get_failed_instances(&self) -> Vec<&Instance> {
        self.results
            .iter()
            .filter(|r| r.status == ExecutionStatus::Failed)
            .map(|r| &r.instance)
            .collect()
    }
}

impl Default for AggregatedResult {
    fn default() -> Self {
        Self::new()
    }
}
