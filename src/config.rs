use crate::installer::InstallOptions;
use tracing::warn;

/// Fallback worker fan-out bound.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Options for one orchestrated run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Worker fan-out bound. Non-positive values fall back to
    /// [`DEFAULT_CONCURRENCY`].
    pub max_concurrency: i64,
    /// Skip installer prerequisite checks (plain reachability still runs).
    pub skip_validation: bool,
    /// Skip success tagging and the failure-tagging path entirely.
    pub skip_tagging: bool,
    /// Validate and synthesize only; never execute remote commands.
    pub dry_run: bool,
    /// Free-form options handed to the installer's script synthesis.
    pub install_options: InstallOptions,
    /// When set, a target already carrying `key=value` finishes as `Skipped`
    /// without any further provider calls.
    pub skip_if_tag: Option<(String, String)>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_CONCURRENCY as i64,
            skip_validation: false,
            skip_tagging: false,
            dry_run: false,
            install_options: InstallOptions::new(),
            skip_if_tag: None,
        }
    }
}

impl RunConfig {
    /// Normalized fan-out bound.
    pub fn effective_concurrency(&self) -> usize {
        if self.max_concurrency <= 0 {
            warn!(
                requested = self.max_concurrency,
                fallback = DEFAULT_CONCURRENCY,
                "non-positive max concurrency; using the default"
            );
            DEFAULT_CONCURRENCY
        } else {
            self.max_concurrency as usize
        }
    }
}
