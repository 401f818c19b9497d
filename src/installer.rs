use crate::instance::Instance;
use crate::provider::CloudProvider;
use async_trait::async_trait;
use eyre::Result;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Free-form options handed to script synthesis. Keys are installer-defined;
/// the ones the bundled installer understands are in [`options`].
pub type InstallOptions = HashMap<String, String>;

/// Well-known [`InstallOptions`] keys.
pub mod options {
    pub const ENVIRONMENT: &str = "environment";
    pub const CERTNAME: &str = "certname";
    pub const OS: &str = "os";
}

/// Package-specific rollout logic driven by the per-target worker.
///
/// One installer instance is shared across all workers. Implementations must
/// be reentrant: nothing observed for one target may be parked in a field
/// where a concurrent worker could read it. Metadata always travels by value.
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    /// Stable installer identifier, e.g. `"puppet"`.
    fn name(&self) -> &str;

    /// Pure command synthesis for a known OS family. No I/O.
    fn generate_install_script(
        &self,
        os_type: &str,
        options: &InstallOptions,
    ) -> Result<Vec<String>>;

    /// Installer-level checks beyond plain reachability (e.g. the target can
    /// reach the configuration server).
    async fn validate_prerequisites(
        &self,
        ctx: &CancellationToken,
        instance: &Instance,
        provider: &dyn CloudProvider,
    ) -> Result<()>;

    /// Confirms the installed agent is actually functional on the target.
    async fn verify_installation(
        &self,
        ctx: &CancellationToken,
        instance: &Instance,
        provider: &dyn CloudProvider,
    ) -> Result<()>;

    /// Labels applied to a target after a successful rollout.
    fn get_success_tags(&self) -> HashMap<String, String>;

    /// Labels applied to a target after a failed rollout.
    fn get_failure_tags(&self, err: &str) -> HashMap<String, String>;

    /// Last-observed metadata. Reentrant installers return a fresh copy or an
    /// empty map; they never expose a shared mutable slot.
    fn get_install_metadata(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Optional capability: probe the target, then synthesize commands for
    /// whatever is actually running there. `Ok(None)` means the installer
    /// does not support auto-detection and the worker should fall back to
    /// [`generate_install_script`](Self::generate_install_script).
    ///
    /// The returned metadata map must be freshly allocated per call; the
    /// calling worker takes ownership of it.
    async fn generate_install_script_with_auto_detect(
        &self,
        ctx: &CancellationToken,
        instance: &Instance,
        provider: &dyn CloudProvider,
        install_options: &InstallOptions,
    ) -> Result<Option<(Vec<String>, HashMap<String, String>)>> {
        let _ = (ctx, instance, provider, install_options);
        Ok(None)
    }
}
