use crate::config::RunConfig;
use crate::error::is_canceled;
use crate::installer::{options, PackageInstaller};
use crate::instance::Instance;
use crate::provider::CloudProvider;
use crate::result::ExecutionResult;
use crate::status::ExecutionStatus;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Ceiling on one remote installation command batch.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// OS assumed when neither the inventory nor auto-detection can tell us.
const FALLBACK_OS: &str = "linux";

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Drive one target through validate → install → verify → tag and produce its
/// result record. Every path finalizes the record exactly once; nothing here
/// panics on a remote failure.
pub async fn run_target(
    ctx: &CancellationToken,
    instance: Instance,
    provider: Arc<dyn CloudProvider>,
    installer: Arc<dyn PackageInstaller>,
    config: &RunConfig,
) -> ExecutionResult {
    let mut result = ExecutionResult::new(instance);

    if ctx.is_cancelled() {
        result.finalize(ExecutionStatus::Cancelled);
        return result;
    }

    // Idempotency guard: a target that already carries the marker tag is
    // done, not a failure.
    if let Some((key, value)) = &config.skip_if_tag {
        match provider.has_tag(ctx, &result.instance, key, value).await {
            Ok(true) => {
                info!(instance = %result.instance, key = %key, value = %value, "already tagged; skipping");
                result.finalize(ExecutionStatus::Skipped);
                return result;
            }
            Ok(false) => {}
            Err(err) if is_canceled(&err) => {
                result.validation_err = Some(format!("{err:#}"));
                result.finalize(ExecutionStatus::Cancelled);
                return result;
            }
            Err(err) => {
                // The guard is best-effort; fall through to a normal run.
                warn!(instance = %result.instance, error = %err, "tag check failed; continuing");
            }
        }
    }

    // Target reachability.
    debug!(instance = %result.instance, "validating instance reachability");
    if let Err(err) = provider.validate_instance(ctx, &result.instance).await {
        let canceled = is_canceled(&err);
        result.validation_err = Some(format!("not accessible: {err:#}"));
        if canceled {
            result.finalize(ExecutionStatus::Cancelled);
            return result;
        }
        tag_failure(ctx, &provider, &installer, &result, config).await;
        result.finalize(ExecutionStatus::Failed);
        return result;
    }

    // Installer prerequisites.
    if config.skip_validation {
        debug!(instance = %result.instance, "prerequisite validation skipped");
    } else if let Err(err) = installer
        .validate_prerequisites(ctx, &result.instance, provider.as_ref())
        .await
    {
        let canceled = is_canceled(&err);
        result.validation_err = Some(format!("prerequisite validation failed: {err:#}"));
        if canceled {
            result.finalize(ExecutionStatus::Cancelled);
            return result;
        }
        tag_failure(ctx, &provider, &installer, &result, config).await;
        result.finalize(ExecutionStatus::Failed);
        return result;
    }

    // Installation and verification.
    let mut install_meta: HashMap<String, String> = HashMap::new();

    if config.dry_run {
        let assumed_os = result
            .instance
            .metadata
            .get(options::OS)
            .cloned()
            .unwrap_or_else(|| FALLBACK_OS.to_string());
        info!(
            instance = %result.instance,
            os = %assumed_os,
            installer = installer.name(),
            "dry run: simulating installation, no remote commands"
        );
        install_meta.insert(options::OS.to_string(), assumed_os);
        install_meta.insert("dry_run".to_string(), "true".to_string());
    } else {
        // Prefer the probe-based path; fall back to the inventory OS hint.
        let synthesized = match installer
            .generate_install_script_with_auto_detect(
                ctx,
                &result.instance,
                provider.as_ref(),
                &config.install_options,
            )
            .await
        {
            Ok(Some((commands, meta))) => {
                install_meta = meta;
                Ok(commands)
            }
            Ok(None) => {
                let os_type = result
                    .instance
                    .metadata
                    .get(options::OS)
                    .map(String::as_str)
                    .unwrap_or(FALLBACK_OS);
                installer.generate_install_script(os_type, &config.install_options)
            }
            Err(err) => Err(err),
        };

        let commands = match synthesized {
            Ok(commands) => commands,
            Err(err) => {
                let canceled = is_canceled(&err);
                result.metadata = install_meta;
                result.installation_err =
                    Some(format!("install script synthesis failed: {err:#}"));
                if canceled {
                    result.finalize(ExecutionStatus::Cancelled);
                    return result;
                }
                tag_failure(ctx, &provider, &installer, &result, config).await;
                result.finalize(ExecutionStatus::Failed);
                return result;
            }
        };

        info!(
            instance = %result.instance,
            commands = commands.len(),
            installer = installer.name(),
            "executing installation"
        );
        match provider
            .execute_command(ctx, &result.instance, &commands, INSTALL_TIMEOUT)
            .await
        {
            Ok(output) if output.succeeded() => {
                debug!(
                    instance = %result.instance,
                    duration_ms = output.duration.as_millis() as u64,
                    "installation commands completed"
                );
            }
            Ok(output) => {
                result.metadata = install_meta;
                result.installation_err = Some(format!(
                    "installation exited with code {}: {}",
                    output.exit_code,
                    truncate(&output.stderr, 512)
                ));
                tag_failure(ctx, &provider, &installer, &result, config).await;
                result.finalize(ExecutionStatus::Failed);
                return result;
            }
            Err(err) => {
                let canceled = is_canceled(&err);
                result.metadata = install_meta;
                result.installation_err = Some(format!("remote execution failed: {err:#}"));
                if canceled {
                    result.finalize(ExecutionStatus::Cancelled);
                    return result;
                }
                tag_failure(ctx, &provider, &installer, &result, config).await;
                result.finalize(ExecutionStatus::Failed);
                return result;
            }
        }

        // Verification failures are attributed to the install stage.
        if let Err(err) = installer
            .verify_installation(ctx, &result.instance, provider.as_ref())
            .await
        {
            let canceled = is_canceled(&err);
            result.metadata = install_meta;
            result.installation_err = Some(format!("verification failed: {err:#}"));
            if canceled {
                result.finalize(ExecutionStatus::Cancelled);
                return result;
            }
            tag_failure(ctx, &provider, &installer, &result, config).await;
            result.finalize(ExecutionStatus::Failed);
            return result;
        }
    }

    // Success tagging. Failures land in `tagging_err` but never demote the
    // status: the agent is installed whether or not the label stuck.
    if config.skip_tagging {
        debug!(instance = %result.instance, "success tagging skipped");
    } else if config.dry_run {
        info!(instance = %result.instance, "dry run: would apply success tags");
    } else {
        let tags = installer.get_success_tags();
        if let Err(err) = provider.tag_instance(ctx, &result.instance, &tags).await {
            warn!(instance = %result.instance, error = %err, "success tagging failed");
            result.tagging_err = Some(format!("tagging failed: {err:#}"));
        }
    }

    if install_meta.is_empty() {
        install_meta = installer.get_install_metadata();
    }
    result.metadata = install_meta;
    result.finalize(ExecutionStatus::Success);
    result
}

/// Best-effort failure tagging. Never changes the result's status and never
/// runs in dry-run; errors are logged only.
async fn tag_failure(
    ctx: &CancellationToken,
    provider: &Arc<dyn CloudProvider>,
    installer: &Arc<dyn PackageInstaller>,
    result: &ExecutionResult,
    config: &RunConfig,
) {
    if config.skip_tagging || config.dry_run {
        return;
    }
    let reason = result.get_error().unwrap_or("unknown failure");
    let tags = installer.get_failure_tags(reason);
    if let Err(err) = provider.tag_instance(ctx, &result.instance, &tags).await {
        warn!(instance = %result.instance, error = %err, "failure tagging failed");
    }
}
