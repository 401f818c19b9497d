use crate::instance::Instance;
use async_trait::async_trait;
use eyre::Result;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Outcome of one remote command batch on one target.
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    pub instance_id: String,
    /// Remote exit code. Zero is success; a non-zero code is still a
    /// successful provider call.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    /// Transport-level detail when the platform reported one alongside the
    /// invocation output.
    pub error: Option<String>,
}

impl CommandResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Cloud-side operations the orchestrator needs from a target's platform.
///
/// One provider instance is shared across all workers, so every method must
/// be reentrant. Retry policy for transient transport errors belongs inside
/// the implementation; the lifecycle runs each stage once per target.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Stable provider identifier, e.g. `"aws"`.
    fn name(&self) -> &str;

    /// Succeeds when the target is online and manageable.
    async fn validate_instance(&self, ctx: &CancellationToken, instance: &Instance) -> Result<()>;

    /// Runs an ordered command sequence remotely. A non-zero remote exit code
    /// is reported through [`CommandResult::exit_code`], not as an `Err`.
    async fn execute_command(
        &self,
        ctx: &CancellationToken,
        instance: &Instance,
        commands: &[String],
        timeout: Duration,
    ) -> Result<CommandResult>;

    /// Verifies the target itself can reach `host:port`.
    async fn test_connectivity(
        &self,
        ctx: &CancellationToken,
        instance: &Instance,
        host: &str,
        port: u16,
    ) -> Result<()>;

    /// Applies key/value labels to the target. Idempotent.
    async fn tag_instance(
        &self,
        ctx: &CancellationToken,
        instance: &Instance,
        tags: &HashMap<String, String>,
    ) -> Result<()>;

    /// Whether the target already carries `key=value`.
    async fn has_tag(
        &self,
        ctx: &CancellationToken,
        instance: &Instance,
        key: &str,
        value: &str,
    ) -> Result<bool>;
}
