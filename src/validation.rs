use crate::error::Canceled;
use crate::instance::Instance;
use crate::provider::CloudProvider;
use async_trait::async_trait;
use eyre::{eyre, Report, Result};
use std::fmt::Write as _;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Synthetic check name reported when the run token fired before a validator
/// could run.
pub const CANCELED_CHECK: &str = "validation_canceled";

const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one named check.
#[derive(Debug)]
pub struct ValidationResult {
    pub name: String,
    pub success: bool,
    pub message: String,
    pub error: Option<Report>,
}

impl ValidationResult {
    fn passed(name: &str, message: String) -> Self {
        Self {
            name: name.to_string(),
            success: true,
            message,
            error: None,
        }
    }

    fn failed(name: &str, message: String, error: Report) -> Self {
        Self {
            name: name.to_string(),
            success: false,
            message,
            error: Some(error),
        }
    }
}

/// One named pre-flight check against a target.
#[async_trait]
pub trait Validator: Send + Sync {
    fn name(&self) -> &str;

    async fn validate(
        &self,
        ctx: &CancellationToken,
        instance: &Instance,
        provider: &dyn CloudProvider,
    ) -> ValidationResult;
}

/// Checks the target is reachable over the provider's management channel.
pub struct InstanceReachabilityValidator;

#[async_trait]
impl Validator for InstanceReachabilityValidator {
    fn name(&self) -> &str {
        "ssm_connectivity"
    }

    async fn validate(
        &self,
        ctx: &CancellationToken,
        instance: &Instance,
        provider: &dyn CloudProvider,
    ) -> ValidationResult {
        match provider.validate_instance(ctx, instance).await {
            Ok(()) => ValidationResult::passed(
                self.name(),
                format!("instance {} is online and accessible", instance.id),
            ),
            Err(err) => ValidationResult::failed(
                self.name(),
                format!("not accessible: {err:#}"),
                err,
            ),
        }
    }
}

/// Checks the target can open a TCP connection to a dependency.
pub struct TcpConnectivityValidator {
    name: String,
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpConnectivityValidator {
    /// A zero `timeout` falls back to the 10 s default.
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            timeout: if timeout.is_zero() {
                DEFAULT_TCP_TIMEOUT
            } else {
                timeout
            },
        }
    }
}

#[async_trait]
impl Validator for TcpConnectivityValidator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(
        &self,
        ctx: &CancellationToken,
        instance: &Instance,
        provider: &dyn CloudProvider,
    ) -> ValidationResult {
        let probe = tokio::time::timeout(
            self.timeout,
            provider.test_connectivity(ctx, instance, &self.host, self.port),
        )
        .await;

        match probe {
            Ok(Ok(())) => ValidationResult::passed(
                self.name(),
                format!("Successfully connected to {}:{}", self.host, self.port),
            ),
            Ok(Err(err)) => ValidationResult::failed(
                self.name(),
                format!("Cannot reach {}:{}: {err:#}", self.host, self.port),
                err,
            ),
            Err(_) => ValidationResult::failed(
                self.name(),
                format!(
                    "Cannot reach {}:{}: probe timed out after {}s",
                    self.host,
                    self.port,
                    self.timeout.as_secs()
                ),
                eyre!("probe timed out after {}s", self.timeout.as_secs()),
            ),
        }
    }
}

/// Ordered list of checks executed as a unit.
pub struct CompositeValidator {
    validators: Vec<Box<dyn Validator>>,
    stop_on_fail: bool,
}

impl CompositeValidator {
    pub fn new(stop_on_fail: bool) -> Self {
        Self {
            validators: Vec::new(),
            stop_on_fail,
        }
    }

    pub fn add(&mut self, validator: Box<dyn Validator>) -> &mut Self {
        self.validators.push(validator);
        self
    }

    /// Run the checks in order. With `stop_on_fail`, the first failure ends
    /// the run early. A token that fires between checks yields one synthetic
    /// [`CANCELED_CHECK`] failure and stops.
    pub async fn run(
        &self,
        ctx: &CancellationToken,
        instance: &Instance,
        provider: &dyn CloudProvider,
    ) -> Vec<ValidationResult> {
        let mut results = Vec::with_capacity(self.validators.len());
        for validator in &self.validators {
            if ctx.is_cancelled() {
                results.push(ValidationResult::failed(
                    CANCELED_CHECK,
                    "validation canceled before all checks completed".to_string(),
                    Canceled.into(),
                ));
                break;
            }
            let result = validator.validate(ctx, instance, provider).await;
            debug!(
                instance = %instance,
                check = %result.name,
                success = result.success,
                "validation check finished"
            );
            let failed = !result.success;
            results.push(result);
            if failed && self.stop_on_fail {
                break;
            }
        }
        results
    }
}

/// True for empty slices and when every check passed.
pub fn all_passed(results: &[ValidationResult]) -> bool {
    results.iter().all(|r| r.success)
}

/// The failed subset, preserving order.
pub fn get_failed(results: &[ValidationResult]) -> Vec<&ValidationResult> {
    results.iter().filter(|r| !r.success).collect()
}

/// Error enumerating every failed check, or `Ok` when everything passed.
pub fn ensure_all_passed(results: &[ValidationResult]) -> Result<()> {
    let failed = get_failed(results);
    if failed.is_empty() {
        return Ok(());
    }
    let summary = failed
        .iter()
        .map(|r| format!("{}: {}", r.name, r.message))
        .collect::<Vec<_>>()
        .join("; ");
    Err(eyre!("{} validation check(s) failed: {summary}", failed.len()))
}

/// Human-readable rendering, one glyph-prefixed line per check.
pub fn format_results(results: &[ValidationResult]) -> String {
    let mut out = String::new();
    for result in results {
        let glyph = if result.success { "✓" } else { "✗" };
        let _ = writeln!(out, "  {glyph} {}: {}", result.name, result.message);
    }
    out
}

/// Prerequisite bundle for a Puppet rollout: management-channel reachability
/// plus a TCP probe of the Puppet server from the target. Runs every check
/// even when an early one fails; pair with [`ensure_all_passed`] to turn the
/// outcome into a single error enumerating the failures.
pub async fn validate_puppet_prerequisites(
    ctx: &CancellationToken,
    instance: &Instance,
    provider: &dyn CloudProvider,
    server: &str,
    port: u16,
) -> Vec<ValidationResult> {
    let mut composite = CompositeValidator::new(false);
    composite.add(Box::new(InstanceReachabilityValidator));
    composite.add(Box::new(TcpConnectivityValidator::new(
        "puppet_server_tcp",
        server,
        port,
        Duration::from_secs(5),
    )));
    composite.run(ctx, instance, provider).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passed(name: &str) -> ValidationResult {
        ValidationResult::passed(name, "ok".to_string())
    }

    fn failed(name: &str) -> ValidationResult {
        ValidationResult::failed(name, "broken".to_string(), eyre!("broken"))
    }

    #[test]
    fn all_passed_is_true_for_empty_results() {
        assert!(all_passed(&[]));
    }

    #[test]
    fn all_passed_requires_every_check_to_pass() {
        assert!(all_passed(&[passed("a"), passed("b")]));
        assert!(!all_passed(&[passed("a"), failed("b")]));
    }

    #[test]
    fn get_failed_preserves_order() {
        let results = [failed("first"), passed("mid"), failed("last")];
        let names: Vec<&str> = get_failed(&results).iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["first", "last"]);
    }

    #[test]
    fn ensure_all_passed_enumerates_every_failure() {
        let results = [failed("dns"), passed("ssm"), failed("tcp")];
        let err = ensure_all_passed(&results).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("2 validation check(s) failed"));
        assert!(message.contains("dns"));
        assert!(message.contains("tcp"));

        assert!(ensure_all_passed(&[passed("only")]).is_ok());
    }

    #[test]
    fn formatter_marks_each_line_with_a_glyph() {
        let rendered = format_results(&[passed("reachability"), failed("tcp")]);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains('✓') && lines[0].contains("reachability"));
        assert!(lines[1].contains('✗') && lines[1].contains("tcp"));
    }

    #[test]
    fn zero_tcp_timeout_falls_back_to_default() {
        let validator =
            TcpConnectivityValidator::new("probe", "puppet.internal", 8140, Duration::ZERO);
        assert_eq!(validator.timeout, DEFAULT_TCP_TIMEOUT);

        let explicit =
            TcpConnectivityValidator::new("probe", "puppet.internal", 8140, Duration::from_secs(5));
        assert_eq!(explicit.timeout, Duration::from_secs(5));
    }
}
