#![allow(dead_code)]

use async_trait::async_trait;
use eyre::{bail, Result};
use opsmaster::installer::{InstallOptions, PackageInstaller};
use opsmaster::instance::Instance;
use opsmaster::provider::{CloudProvider, CommandResult};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Scripted in-memory provider. Behavior is configured up front; every call
/// is counted so tests can assert on exactly what the orchestrator touched.
#[derive(Default)]
pub struct MockProvider {
    /// Instance ids whose reachability check fails.
    pub unreachable: HashSet<String>,
    /// Artificial latency injected into validate / execute / tag calls.
    pub call_delay: Duration,
    /// Remote exit code returned by every `execute_command`.
    pub exec_exit_code: i32,
    /// When true, `tag_instance` fails.
    pub fail_tagging: bool,
    /// Pre-applied `(instance_id, key, value)` labels answered by `has_tag`.
    pub existing_tags: HashSet<(String, String, String)>,

    pub validate_calls: AtomicUsize,
    pub execute_calls: AtomicUsize,
    pub connectivity_calls: AtomicUsize,
    pub has_tag_calls: AtomicUsize,
    /// `(instance_id, tags)` per `tag_instance` call, in call order.
    pub tag_calls: Mutex<Vec<(String, HashMap<String, String>)>>,

    pub in_flight: AtomicUsize,
    /// High-water mark of simultaneous `execute_command` calls.
    pub max_in_flight: AtomicUsize,
}

impl MockProvider {
    pub fn tagged_instances(&self) -> Vec<(String, HashMap<String, String>)> {
        self.tag_calls.lock().unwrap().clone()
    }

    async fn simulate_latency(&self) {
        if !self.call_delay.is_zero() {
            tokio::time::sleep(self.call_delay).await;
        }
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn validate_instance(&self, _ctx: &CancellationToken, instance: &Instance) -> Result<()> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if self.unreachable.contains(&instance.id) {
            bail!("SSM agent offline on {}", instance.id);
        }
        Ok(())
    }

    async fn execute_command(
        &self,
        _ctx: &CancellationToken,
        instance: &Instance,
        _commands: &[String],
        _timeout: Duration,
    ) -> Result<CommandResult> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        self.simulate_latency().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        Ok(CommandResult {
            instance_id: instance.id.clone(),
            exit_code: self.exec_exit_code,
            stdout: "ok".to_string(),
            stderr: if self.exec_exit_code == 0 {
                String::new()
            } else {
                "remote command failed".to_string()
            },
            duration: self.call_delay,
            error: None,
        })
    }

    async fn test_connectivity(
        &self,
        _ctx: &CancellationToken,
        _instance: &Instance,
        _host: &str,
        _port: u16,
    ) -> Result<()> {
        self.connectivity_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn tag_instance(
        &self,
        _ctx: &CancellationToken,
        instance: &Instance,
        tags: &HashMap<String, String>,
    ) -> Result<()> {
        self.simulate_latency().await;
        if self.fail_tagging {
            bail!("tagging API rejected the request for {}", instance.id);
        }
        self.tag_calls
            .lock()
            .unwrap()
            .push((instance.id.clone(), tags.clone()));
        Ok(())
    }

    async fn has_tag(
        &self,
        _ctx: &CancellationToken,
        instance: &Instance,
        key: &str,
        value: &str,
    ) -> Result<bool> {
        self.has_tag_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.existing_tags.contains(&(
            instance.id.clone(),
            key.to_string(),
            value.to_string(),
        )))
    }
}

/// Scripted installer. With `auto_detect` enabled it issues a unique certname
/// per call inside a freshly allocated metadata map, which is exactly what
/// the metadata race tests need to observe.
#[derive(Default)]
pub struct MockInstaller {
    pub auto_detect: bool,
    /// Instance ids whose prerequisite check fails.
    pub fail_prereq: HashSet<String>,
    pub fail_verify: bool,

    pub prereq_calls: AtomicUsize,
    pub verify_calls: AtomicUsize,
    certname_counter: AtomicUsize,
}

#[async_trait]
impl PackageInstaller for MockInstaller {
    fn name(&self) -> &str {
        "mock"
    }

    fn generate_install_script(
        &self,
        _os_type: &str,
        _install_options: &InstallOptions,
    ) -> Result<Vec<String>> {
        Ok(vec!["echo install".to_string()])
    }

    async fn validate_prerequisites(
        &self,
        _ctx: &CancellationToken,
        instance: &Instance,
        _provider: &dyn CloudProvider,
    ) -> Result<()> {
        self.prereq_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_prereq.contains(&instance.id) {
            bail!("prerequisite check failed for {}", instance.id);
        }
        Ok(())
    }

    async fn verify_installation(
        &self,
        _ctx: &CancellationToken,
        instance: &Instance,
        _provider: &dyn CloudProvider,
    ) -> Result<()> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_verify {
            bail!("agent missing on {} after installation", instance.id);
        }
        Ok(())
    }

    fn get_success_tags(&self) -> HashMap<String, String> {
        HashMap::from([("mock:installed".to_string(), "true".to_string())])
    }

    fn get_failure_tags(&self, _err: &str) -> HashMap<String, String> {
        HashMap::from([("mock:installed".to_string(), "failed".to_string())])
    }

    async fn generate_install_script_with_auto_detect(
        &self,
        _ctx: &CancellationToken,
        instance: &Instance,
        _provider: &dyn CloudProvider,
        _install_options: &InstallOptions,
    ) -> Result<Option<(Vec<String>, HashMap<String, String>)>> {
        if !self.auto_detect {
            return Ok(None);
        }
        let serial = self.certname_counter.fetch_add(1, Ordering::SeqCst);
        let mut metadata = HashMap::new();
        metadata.insert("os".to_string(), "ubuntu".to_string());
        metadata.insert(
            "certname".to_string(),
            format!("{}-{serial:04}.mock.local", instance.id),
        );
        metadata.insert("certname_preserved".to_string(), "false".to_string());
        Ok(Some((vec!["echo install".to_string()], metadata)))
    }
}

/// `i-test000`, `i-test001`, ... in one account and region.
pub fn instances(count: usize) -> Vec<Instance> {
    (0..count)
        .map(|ordinal| {
            Instance::new(
                "aws",
                "123456789012",
                "us-east-1",
                format!("i-test{ordinal:03}"),
            )
        })
        .collect()
}

/// Ordinal back out of an `i-testNNN` id.
pub fn ordinal_of(id: &str) -> usize {
    id.trim_start_matches("i-test").parse().expect("test id")
}
