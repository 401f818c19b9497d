use crate::installer::{options, InstallOptions, PackageInstaller};
use crate::instance::Instance;
use crate::provider::CloudProvider;
use crate::validation::{ensure_all_passed, validate_puppet_prerequisites};
use async_trait::async_trait;
use eyre::{bail, eyre, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const PUPPET_BIN: &str = "/opt/puppetlabs/bin/puppet";
const PUPPET_CONF: &str = "/etc/puppetlabs/puppet/puppet.conf";
const DEFAULT_SERVER_PORT: u16 = 8140;
/// Timeout for the short auto-detection probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(60);
const VERIFY_TIMEOUT: Duration = Duration::from_secs(120);

/// Marker tag a successfully managed target carries; also the key checked by
/// the `--skip-installed` idempotency guard.
pub const INSTALLED_TAG: (&str, &str) = ("opsmaster:puppet", "installed");

enum OsFamily {
    Debian,
    RedHat,
}

fn os_family(os_type: &str) -> Option<OsFamily> {
    match os_type.to_lowercase().as_str() {
        "debian" | "ubuntu" => Some(OsFamily::Debian),
        "rhel" | "redhat" | "centos" | "rocky" | "almalinux" | "ol" | "amzn" | "amazon"
        | "fedora" => Some(OsFamily::RedHat),
        _ => None,
    }
}

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

/// Installs and configures the Puppet agent over a [`CloudProvider`].
///
/// Stateless by design: every call that produces metadata allocates a fresh
/// map, so one installer instance can be shared across concurrent workers.
/// In particular the detected OS and the certname for a target only ever
/// live in that target's own result record.
#[derive(Debug, Clone)]
pub struct PuppetInstaller {
    server: String,
    port: u16,
    environment: Option<String>,
    /// Appended to generated certnames so they group under the fleet domain.
    certname_domain: String,
}

impl PuppetInstaller {
    pub fn new(server: impl Into<String>, port: u16, environment: Option<String>) -> Self {
        let server = server.into();
        let certname_domain = server
            .split_once('.')
            .map(|(_, domain)| domain.to_string())
            .unwrap_or_else(|| "local".to_string());
        Self {
            server,
            port: if port == 0 { DEFAULT_SERVER_PORT } else { port },
            environment,
            certname_domain,
        }
    }

    /// Certname issued when no previous installation left one behind.
    fn certname_for(&self, instance: &Instance) -> String {
        format!("{}.{}", instance.id.to_lowercase(), self.certname_domain)
    }

    fn config_commands(&self, certname: &str, environment: Option<&str>) -> Vec<String> {
        let mut commands = vec![
            format!(
                "{PUPPET_BIN} config set server {} --section main",
                self.server
            ),
            format!(
                "{PUPPET_BIN} config set serverport {} --section main",
                self.port
            ),
            format!("{PUPPET_BIN} config set certname {certname} --section main"),
        ];
        if let Some(environment) = environment {
            commands.push(format!(
                "{PUPPET_BIN} config set environment {environment} --section agent"
            ));
        }
        commands.push("systemctl enable puppet".to_string());
        commands.push("systemctl restart puppet".to_string());
        commands
    }
}

#[async_trait]
impl PackageInstaller for PuppetInstaller {
    fn name(&self) -> &str {
        "puppet"
    }

    fn generate_install_script(
        &self,
        os_type: &str,
        install_options: &InstallOptions,
    ) -> Result<Vec<String>> {
        let family = os_family(os_type).ok_or_else(|| {
            eyre!("unsupported OS type '{os_type}' for puppet agent installation")
        })?;

        let mut commands = match family {
            OsFamily::Debian => vec![
                "export DEBIAN_FRONTEND=noninteractive".to_string(),
                "wget -q https://apt.puppet.com/puppet7-release-$(lsb_release -cs).deb -O /tmp/puppet7-release.deb".to_string(),
                "dpkg -i /tmp/puppet7-release.deb".to_string(),
                "apt-get update -qq".to_string(),
                "apt-get install -y puppet-agent".to_string(),
            ],
            OsFamily::RedHat => vec![
                "rpm -Uvh --force https://yum.puppet.com/puppet7-release-el-$(rpm -E '%{rhel}').noarch.rpm".to_string(),
                "yum install -y puppet-agent".to_string(),
            ],
        };

        let certname = install_options
            .get(options::CERTNAME)
            .map(String::as_str)
            // Pure synthesis has no instance at hand; the agent's FQDN is the
            // conventional certname when none was chosen upstream.
            .unwrap_or("$(hostname -f)");
        let environment = install_options
            .get(options::ENVIRONMENT)
            .map(String::as_str)
            .or(self.environment.as_deref());
        commands.extend(self.config_commands(certname, environment));
        Ok(commands)
    }

    async fn validate_prerequisites(
        &self,
        ctx: &CancellationToken,
        instance: &Instance,
        provider: &dyn CloudProvider,
    ) -> Result<()> {
        let results =
            validate_puppet_prerequisites(ctx, instance, provider, &self.server, self.port).await;
        ensure_all_passed(&results)
    }

    async fn verify_installation(
        &self,
        ctx: &CancellationToken,
        instance: &Instance,
        provider: &dyn CloudProvider,
    ) -> Result<()> {
        let commands = vec![format!("{PUPPET_BIN} --version")];
        let output = provider
            .execute_command(ctx, instance, &commands, VERIFY_TIMEOUT)
            .await?;
        if !output.succeeded() {
            bail!(
                "puppet agent not functional on {} (exit {}): {}",
                instance.id,
                output.exit_code,
                truncate(&output.stderr, 256)
            );
        }
        debug!(
            instance = %instance,
            version = %output.stdout.trim(),
            "puppet agent verified"
        );
        Ok(())
    }

    fn get_success_tags(&self) -> HashMap<String, String> {
        HashMap::from([
            (INSTALLED_TAG.0.to_string(), INSTALLED_TAG.1.to_string()),
            ("opsmaster:puppet-server".to_string(), self.server.clone()),
        ])
    }

    fn get_failure_tags(&self, err: &str) -> HashMap<String, String> {
        HashMap::from([
            (INSTALLED_TAG.0.to_string(), "install-failed".to_string()),
            // EC2 tag values cap at 256 characters.
            ("opsmaster:puppet-error".to_string(), truncate(err, 200)),
        ])
    }

    async fn generate_install_script_with_auto_detect(
        &self,
        ctx: &CancellationToken,
        instance: &Instance,
        provider: &dyn CloudProvider,
        install_options: &InstallOptions,
    ) -> Result<Option<(Vec<String>, HashMap<String, String>)>> {
        // One probe answers both questions: which OS family, and did a
        // previous installation already issue a certname we must preserve.
        let probe = vec![
            ". /etc/os-release 2>/dev/null && echo \"OS_ID=${ID}\" || true".to_string(),
            format!(
                "test -f {PUPPET_CONF} && echo \"CERTNAME=$({PUPPET_BIN} config print certname --section main 2>/dev/null)\" || true"
            ),
        ];
        let output = provider
            .execute_command(ctx, instance, &probe, PROBE_TIMEOUT)
            .await?;

        let mut os_id = String::new();
        let mut existing_certname: Option<String> = None;
        for line in output.stdout.lines() {
            if let Some(value) = line.trim().strip_prefix("OS_ID=") {
                os_id = value.trim_matches('"').to_string();
            } else if let Some(value) = line.trim().strip_prefix("CERTNAME=") {
                let value = value.trim();
                if !value.is_empty() {
                    existing_certname = Some(value.to_string());
                }
            }
        }
        if os_id.is_empty() {
            bail!(
                "could not detect OS on {}: probe returned no OS id (exit {}, stderr: {})",
                instance.id,
                output.exit_code,
                truncate(&output.stderr, 256)
            );
        }

        let preserved = existing_certname.is_some();
        let certname = existing_certname.unwrap_or_else(|| self.certname_for(instance));
        info!(
            instance = %instance,
            os = %os_id,
            certname = %certname,
            preserved,
            "auto-detected installation parameters"
        );

        let mut effective = install_options.clone();
        effective.insert(options::CERTNAME.to_string(), certname.clone());
        let commands = self.generate_install_script(&os_id, &effective)?;

        // Freshly allocated per call; the calling worker owns it.
        let mut metadata = HashMap::new();
        metadata.insert(options::OS.to_string(), os_id);
        metadata.insert(options::CERTNAME.to_string(), certname);
        metadata.insert("certname_preserved".to_string(), preserved.to_string());
        Ok(Some((commands, metadata)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installer() -> PuppetInstaller {
        PuppetInstaller::new("puppet.ops.internal", 8140, Some("production".to_string()))
    }

    #[test]
    fn debian_script_uses_apt_and_configures_the_agent() {
        let script = installer()
            .generate_install_script("ubuntu", &InstallOptions::new())
            .unwrap();
        assert!(script.iter().any(|c| c.contains("apt-get install -y puppet-agent")));
        assert!(script
            .iter()
            .any(|c| c.contains("config set server puppet.ops.internal")));
        assert!(script.iter().any(|c| c.contains("config set serverport 8140")));
        assert!(script
            .iter()
            .any(|c| c.contains("config set environment production")));
        assert!(script.iter().any(|c| c.contains("systemctl enable puppet")));
    }

    #[test]
    fn rhel_script_uses_yum() {
        let script = installer()
            .generate_install_script("amzn", &InstallOptions::new())
            .unwrap();
        assert!(script.iter().any(|c| c.contains("yum install -y puppet-agent")));
        assert!(!script.iter().any(|c| c.contains("apt-get")));
    }

    #[test]
    fn unknown_os_is_an_error() {
        let err = installer()
            .generate_install_script("windows", &InstallOptions::new())
            .unwrap_err();
        assert!(err.to_string().contains("unsupported OS type 'windows'"));
    }

    #[test]
    fn options_override_certname_and_environment() {
        let mut opts = InstallOptions::new();
        opts.insert(options::CERTNAME.to_string(), "web-01.ops.internal".to_string());
        opts.insert(options::ENVIRONMENT.to_string(), "staging".to_string());
        let script = installer().generate_install_script("debian", &opts).unwrap();
        assert!(script
            .iter()
            .any(|c| c.contains("config set certname web-01.ops.internal")));
        assert!(script
            .iter()
            .any(|c| c.contains("config set environment staging")));
    }

    #[test]
    fn generated_certnames_follow_the_server_domain() {
        let instance = Instance::new("aws", "123", "us-east-1", "i-0ABC123");
        assert_eq!(
            installer().certname_for(&instance),
            "i-0abc123.ops.internal"
        );
    }

    #[test]
    fn zero_port_falls_back_to_the_puppet_default() {
        let installer = PuppetInstaller::new("puppet.local", 0, None);
        assert_eq!(installer.port, DEFAULT_SERVER_PORT);
    }

    #[test]
    fn failure_tags_truncate_long_errors() {
        let long_error = "x".repeat(500);
        let tags = installer().get_failure_tags(&long_error);
        let value = tags.get("opsmaster:puppet-error").unwrap();
        assert!(value.len() <= 203);
        assert!(value.ends_with("..."));
        assert_eq!(
            tags.get(INSTALLED_TAG.0).map(String::as_str),
            Some("install-failed")
        );
    }

    #[test]
    fn success_tags_carry_the_marker_pair() {
        let tags = installer().get_success_tags();
        assert_eq!(
            tags.get(INSTALLED_TAG.0).map(String::as_str),
            Some(INSTALLED_TAG.1)
        );
    }
}
