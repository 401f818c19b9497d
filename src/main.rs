use clap::{Args, Parser, Subcommand};
use eyre::{eyre, Result};
use opsmaster::aws::AwsProvider;
use opsmaster::config::RunConfig;
use opsmaster::executor::ParallelExecutor;
use opsmaster::installer::{options, InstallOptions};
use opsmaster::inventory;
use opsmaster::puppet::{PuppetInstaller, INSTALLED_TAG};
use opsmaster::report;
use opsmaster::validation::{all_passed, format_results, validate_puppet_prerequisites};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(
    name = "opsmaster",
    version,
    about = "Fleet-wide configuration-agent rollout over cloud VMs"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install a configuration agent on every inventory target.
    Install {
        #[command(subcommand)]
        package: InstallPackage,
    },
    /// Run prerequisite validation only; touches nothing.
    Validate(ValidateArgs),
}

#[derive(Subcommand, Debug)]
enum InstallPackage {
    /// Puppet agent via the target's native package manager.
    Puppet(InstallArgs),
}

#[derive(Args, Debug)]
struct InstallArgs {
    /// Inventory CSV: cloud,account,region,id plus free-form columns.
    #[arg(long)]
    inventory: PathBuf,

    /// Puppet server the agents will report to.
    #[arg(long, env = "OPSMASTER_PUPPET_SERVER")]
    server: String,

    /// Puppet server port.
    #[arg(long, default_value_t = 8140)]
    port: u16,

    /// Agent environment to pin.
    #[arg(long)]
    environment: Option<String>,

    /// Max targets driven concurrently. Values <= 0 fall back to 10.
    #[arg(long, default_value_t = 10)]
    concurrency: i64,

    /// Skip installer prerequisite validation.
    #[arg(long)]
    skip_validation: bool,

    /// Skip success tagging and the failure-tagging path.
    #[arg(long)]
    skip_tagging: bool,

    /// Skip targets that already carry the installer's success tag.
    #[arg(long)]
    skip_installed: bool,

    /// Validate and synthesize only; never execute remote commands.
    #[arg(long)]
    dry_run: bool,

    /// Shared AWS credentials profile.
    #[arg(long, env = "AWS_PROFILE")]
    profile: Option<String>,

    /// Extra installer options as key=value (repeatable).
    #[arg(long = "option", value_name = "KEY=VALUE")]
    options: Vec<String>,

    /// Emit the aggregate report as JSON instead of text.
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    /// Inventory CSV: cloud,account,region,id plus free-form columns.
    #[arg(long)]
    inventory: PathBuf,

    /// Puppet server the targets must be able to reach.
    #[arg(long, env = "OPSMASTER_PUPPET_SERVER")]
    server: String,

    /// Puppet server port.
    #[arg(long, default_value_t = 8140)]
    port: u16,

    /// Shared AWS credentials profile.
    #[arg(long, env = "AWS_PROFILE")]
    profile: Option<String>,
}

fn parse_options(raw: &[String]) -> Result<InstallOptions> {
    let mut parsed = InstallOptions::new();
    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| eyre!("invalid --option '{entry}', expected KEY=VALUE"))?;
        parsed.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // One token for the whole run; the first Ctrl-C cancels it and every
    // in-flight worker winds down through its current stage.
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; canceling in-flight targets");
            signal_token.cancel();
        }
    });

    match cli.command {
        Command::Install {
            package: InstallPackage::Puppet(args),
        } => run_install(cancel, args).await,
        Command::Validate(args) => run_validate(cancel, args).await,
    }
}

async fn run_install(cancel: CancellationToken, args: InstallArgs) -> Result<ExitCode> {
    let instances = inventory::load_inventory(&args.inventory)?;

    let installer = Arc::new(PuppetInstaller::new(
        args.server.clone(),
        args.port,
        args.environment.clone(),
    ));
    let provider = Arc::new(AwsProvider::new(args.profile.clone()));

    let mut install_options = parse_options(&args.options)?;
    if let Some(environment) = &args.environment {
        install_options
            .entry(options::ENVIRONMENT.to_string())
            .or_insert_with(|| environment.clone());
    }

    let config = RunConfig {
        max_concurrency: args.concurrency,
        skip_validation: args.skip_validation,
        skip_tagging: args.skip_tagging,
        dry_run: args.dry_run,
        install_options,
        skip_if_tag: args
            .skip_installed
            .then(|| (INSTALLED_TAG.0.to_string(), INSTALLED_TAG.1.to_string())),
    };

    let executor = ParallelExecutor::new(provider, installer, config);
    let aggregate = executor.execute(&cancel, instances).await?;

    if args.json {
        println!("{}", report::render_json(&aggregate)?);
    } else {
        print!("{}", report::render_text(&aggregate));
    }

    if cancel.is_cancelled() || aggregate.canceled > 0 {
        return Ok(ExitCode::from(130));
    }
    if aggregate.failed > 0 {
        return Ok(ExitCode::from(1));
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_validate(cancel: CancellationToken, args: ValidateArgs) -> Result<ExitCode> {
    let instances = inventory::load_inventory(&args.inventory)?;
    let provider = AwsProvider::new(args.profile.clone());

    let mut any_failed = false;
    for instance in &instances {
        if cancel.is_cancelled() {
            tracing::warn!("validation canceled; remaining targets not checked");
            break;
        }
        let results =
            validate_puppet_prerequisites(&cancel, instance, &provider, &args.server, args.port)
                .await;
        println!("{}:", instance.identity());
        print!("{}", format_results(&results));
        any_failed |= !all_passed(&results);
    }

    Ok(if any_failed {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}
