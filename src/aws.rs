use crate::error::Canceled;
use crate::instance::Instance;
use crate::provider::{CloudProvider, CommandResult};
use crate::retry::{retry, EC2_POLICY, NETWORK_POLICY, SSM_POLICY};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::types::{Filter, Tag};
use aws_sdk_ssm::types::{CommandInvocationStatus, InstanceInformationStringFilter, PingStatus};
use eyre::{bail, eyre, Report, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// SSM document used for remote shell execution.
const RUN_SHELL_SCRIPT: &str = "AWS-RunShellScript";
/// Poll interval while waiting for a command invocation to finish.
const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// SSM rejects `executionTimeout` values below 30 seconds.
const MIN_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

fn sdk_err<E, R>(context: &str, err: aws_sdk_ssm::error::SdkError<E, R>) -> Report
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    eyre!(
        "{context}: {}",
        aws_sdk_ssm::error::DisplayErrorContext(&err)
    )
}

#[derive(Clone)]
struct RegionClients {
    ssm: aws_sdk_ssm::Client,
    ec2: aws_sdk_ec2::Client,
}

/// AWS implementation of [`CloudProvider`]: SSM for management-channel checks
/// and remote execution, EC2 for tagging. Clients are built lazily and cached
/// per region so one provider instance can serve a multi-region inventory.
pub struct AwsProvider {
    profile: Option<String>,
    clients: Mutex<HashMap<String, RegionClients>>,
}

impl AwsProvider {
    pub fn new(profile: Option<String>) -> Self {
        Self {
            profile,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn clients_for(&self, region: &str) -> RegionClients {
        let mut cache = self.clients.lock().await;
        if let Some(clients) = cache.get(region) {
            return clients.clone();
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()));
        if let Some(profile) = &self.profile {
            loader = loader.profile_name(profile);
        }
        let config = loader.load().await;
        let clients = RegionClients {
            ssm: aws_sdk_ssm::Client::new(&config),
            ec2: aws_sdk_ec2::Client::new(&config),
        };
        cache.insert(region.to_string(), clients.clone());
        clients
    }
}

#[async_trait]
impl CloudProvider for AwsProvider {
    fn name(&self) -> &str {
        "aws"
    }

    async fn validate_instance(&self, ctx: &CancellationToken, instance: &Instance) -> Result<()> {
        let clients = self.clients_for(&instance.region).await;
        retry(ctx, &SSM_POLICY, "ssm:DescribeInstanceInformation", || {
            let ssm = clients.ssm.clone();
            let id = instance.id.clone();
            async move {
                let filter = InstanceInformationStringFilter::builder()
                    .key("InstanceIds")
                    .values(&id)
                    .build()?;
                let output = ssm
                    .describe_instance_information()
                    .filters(filter)
                    .send()
                    .await
                    .map_err(|err| sdk_err("describe instance information", err))?;

                let online = output.instance_information_list().iter().any(|info| {
                    info.instance_id() == Some(id.as_str())
                        && matches!(info.ping_status(), Some(&PingStatus::Online))
                });
                if online {
                    Ok(())
                } else {
                    Err(eyre!(
                        "instance {id} is not managed by SSM or its agent is offline"
                    ))
                }
            }
        })
        .await
    }

    async fn execute_command(
        &self,
        ctx: &CancellationToken,
        instance: &Instance,
        commands: &[String],
        timeout: Duration,
    ) -> Result<CommandResult> {
        let clients = self.clients_for(&instance.region).await;
        let started = Instant::now();
        let execution_timeout = timeout.max(MIN_EXECUTION_TIMEOUT);

        let command_id = retry(ctx, &SSM_POLICY, "ssm:SendCommand", || {
            let ssm = clients.ssm.clone();
            let id = instance.id.clone();
            let commands = commands.to_vec();
            let timeout_secs = execution_timeout.as_secs().to_string();
            async move {
                let output = ssm
                    .send_command()
                    .instance_ids(&id)
                    .document_name(RUN_SHELL_SCRIPT)
                    .parameters("commands", commands)
                    .parameters("executionTimeout", vec![timeout_secs])
                    .send()
                    .await
                    .map_err(|err| sdk_err("send command", err))?;
                output
                    .command()
                    .and_then(|command| command.command_id())
                    .map(str::to_string)
                    .ok_or_else(|| eyre!("SSM returned no command id for instance {id}"))
            }
        })
        .await?;

        debug!(
            instance = %instance,
            command_id = %command_id,
            commands = commands.len(),
            "command submitted; waiting for completion"
        );

        // Poll until the invocation reaches a terminal status, honoring both
        // the caller's timeout and the run token.
        let deadline = Instant::now() + timeout;
        loop {
            if ctx.is_cancelled() {
                return Err(Canceled.into());
            }

            let invocation = clients
                .ssm
                .get_command_invocation()
                .command_id(&command_id)
                .instance_id(&instance.id)
                .send()
                .await;

            match invocation {
                Ok(output) => match output.status() {
                    Some(CommandInvocationStatus::Success)
                    | Some(CommandInvocationStatus::Failed) => {
                        return Ok(CommandResult {
                            instance_id: instance.id.clone(),
                            exit_code: output.response_code(),
                            stdout: output.standard_output_content().unwrap_or_default().to_string(),
                            stderr: output.standard_error_content().unwrap_or_default().to_string(),
                            duration: started.elapsed(),
                            error: None,
                        });
                    }
                    Some(CommandInvocationStatus::Cancelled)
                    | Some(CommandInvocationStatus::Cancelling) => {
                        bail!(
                            "command {command_id} on {} was canceled on the SSM side",
                            instance.id
                        );
                    }
                    Some(CommandInvocationStatus::TimedOut) => {
                        bail!(
                            "command {command_id} on {} timed out remotely",
                            instance.id
                        );
                    }
                    // Pending / InProgress / Delayed: keep polling.
                    _ => {}
                },
                Err(err) => {
                    // InvocationDoesNotExist right after SendCommand is the
                    // normal propagation lag; keep polling until the deadline.
                    debug!(
                        instance = %instance,
                        command_id = %command_id,
                        error = %aws_sdk_ssm::error::DisplayErrorContext(&err),
                        "invocation not ready yet"
                    );
                }
            }

            if Instant::now() >= deadline {
                bail!(
                    "timed out after {}s waiting for command {command_id} on {}",
                    timeout.as_secs(),
                    instance.id
                );
            }
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = ctx.cancelled() => return Err(Canceled.into()),
            }
        }
    }

    async fn test_connectivity(
        &self,
        ctx: &CancellationToken,
        instance: &Instance,
        host: &str,
        port: u16,
    ) -> Result<()> {
        let probe = vec![format!(
            "timeout 5 bash -c 'cat < /dev/null > /dev/tcp/{host}/{port}'"
        )];
        retry(ctx, &NETWORK_POLICY, "tcp probe", || async {
            let output = self
                .execute_command(ctx, instance, &probe, Duration::from_secs(30))
                .await?;
            if output.succeeded() {
                Ok(())
            } else {
                Err(eyre!(
                    "{host}:{port} is not reachable from {} (exit {})",
                    instance.id,
                    output.exit_code
                ))
            }
        })
        .await
    }

    async fn tag_instance(
        &self,
        ctx: &CancellationToken,
        instance: &Instance,
        tags: &HashMap<String, String>,
    ) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        let clients = self.clients_for(&instance.region).await;
        retry(ctx, &EC2_POLICY, "ec2:CreateTags", || {
            let ec2 = clients.ec2.clone();
            let id = instance.id.clone();
            let tags = tags.clone();
            async move {
                let mut request = ec2.create_tags().resources(id);
                for (key, value) in &tags {
                    request = request.tags(Tag::builder().key(key).value(value).build());
                }
                request
                    .send()
                    .await
                    .map_err(|err| sdk_err("create tags", err))?;
                Ok(())
            }
        })
        .await
    }

    async fn has_tag(
        &self,
        ctx: &CancellationToken,
        instance: &Instance,
        key: &str,
        value: &str,
    ) -> Result<bool> {
        let clients = self.clients_for(&instance.region).await;
        retry(ctx, &EC2_POLICY, "ec2:DescribeTags", || {
            let ec2 = clients.ec2.clone();
            let id = instance.id.clone();
            let key = key.to_string();
            let value = value.to_string();
            async move {
                let output = ec2
                    .describe_tags()
                    .filters(Filter::builder().name("resource-id").values(id).build())
                    .filters(Filter::builder().name("key").values(&key).build())
                    .send()
                    .await
                    .map_err(|err| sdk_err("describe tags", err))?;
                Ok(output
                    .tags()
                    .iter()
                    .any(|tag| tag.key() == Some(key.as_str()) && tag.value() == Some(value.as_str())))
            }
        })
        .await
    }
}
