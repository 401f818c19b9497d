use crate::config::RunConfig;
use crate::installer::PackageInstaller;
use crate::instance::Instance;
use crate::provider::CloudProvider;
use crate::result::{AggregatedResult, ExecutionResult};
use crate::worker;
use eyre::{eyre, Result};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Fans one worker per instance out under a concurrency bound and collects
/// the per-target results into the run aggregate.
///
/// The aggregate is owned by a single collector task; workers only ever send
/// finalized records over the channel. The semaphore is the sole shared
/// coordination primitive between workers.
pub struct ParallelExecutor {
    provider: Arc<dyn CloudProvider>,
    installer: Arc<dyn PackageInstaller>,
    config: RunConfig,
}

impl ParallelExecutor {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        installer: Arc<dyn PackageInstaller>,
        config: RunConfig,
    ) -> Self {
        Self {
            provider,
            installer,
            config,
        }
    }

    /// Run every instance to a terminal status.
    ///
    /// Individual target failures land in the aggregate and never abort the
    /// run; only an empty input is an error here. Callers decide their exit
    /// status from the aggregate's counters.
    pub async fn execute(
        &self,
        ctx: &CancellationToken,
        instances: Vec<Instance>,
    ) -> Result<AggregatedResult> {
        if instances.is_empty() {
            return Err(eyre!("no instances to execute"));
        }

        let concurrency = self.config.effective_concurrency();
        let total = instances.len();
        info!(
            total,
            concurrency,
            provider = self.provider.name(),
            installer = self.installer.name(),
            dry_run = self.config.dry_run,
            "starting parallel execution"
        );

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let (tx, mut rx) = mpsc::channel::<ExecutionResult>(total);
        let started = Instant::now();

        let collector = tokio::spawn(async move {
            let mut aggregate = AggregatedResult::new();
            let mut processed = 0usize;
            while let Some(result) = rx.recv().await {
                processed += 1;
                info!(
                    processed,
                    total,
                    instance = %result.instance,
                    status = %result.status,
                    elapsed_s = started.elapsed().as_secs(),
                    "target finished"
                );
                aggregate.add(result);
            }
            aggregate
        });

        let mut handles = Vec::with_capacity(total);
        for instance in instances {
            let ctx = ctx.clone();
            let semaphore = Arc::clone(&semaphore);
            let provider = Arc::clone(&self.provider);
            let installer = Arc::clone(&self.installer);
            let config = self.config.clone();
            let tx = tx.clone();

            handles.push(tokio::spawn(async move {
                let result = tokio::select! {
                    biased;
                    _ = ctx.cancelled() => {
                        // Canceled before a permit freed up: the target never
                        // started, so no provider call is attempted.
                        ExecutionResult::cancelled(instance)
                    }
                    permit = semaphore.clone().acquire_owned() => {
                        let _permit = permit.expect("run semaphore closed");
                        worker::run_target(&ctx, instance, provider, installer, &config).await
                    }
                };
                if tx.send(result).await.is_err() {
                    error!("result collector dropped before all workers finished");
                }
            }));
        }
        drop(tx);

        for join in join_all(handles).await {
            if let Err(err) = join {
                error!(error = %err, "worker task panicked or was aborted");
            }
        }

        let mut aggregate = collector
            .await
            .map_err(|err| eyre!("result collector failed: {err}"))?;
        aggregate.finalize();

        info!(
            total = aggregate.total,
            success = aggregate.success,
            failed = aggregate.failed,
            skipped = aggregate.skipped,
            canceled = aggregate.canceled,
            elapsed_s = started.elapsed().as_secs(),
            "execution complete"
        );
        Ok(aggregate)
    }
}
