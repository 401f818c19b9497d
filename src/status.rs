use serde::Serialize;
use std::fmt;

/// Lifecycle state of one target. Used both while a worker is driving the
/// target and in the final result record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    #[serde(rename = "Canceled")]
    Cancelled,
    Skipped,
}

impl ExecutionStatus {
    /// Stable uppercase form used in logs and reports.
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELED",
            Self::Skipped => "SKIPPED",
        }
    }

    /// Single-character marker used in report rendering.
    pub fn glyph(self) -> &'static str {
        match self {
            Self::Success => "✓",
            Self::Failed => "✗",
            Self::Cancelled => "⊘",
            Self::Skipped => "-",
            Self::Pending | Self::Running => "…",
        }
    }

    /// Whether a worker is done with the target.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
