use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};

use devstack::config::StackConfig;
use devstack::contract::{CargoContractBuilder, ContractBuilder};
use devstack::stack::{ShutdownReason, StackBinaryDownloader, StackOrchestrator};

#[derive(Parser)]
#[clap(version, about = "Local development stack harness")]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the local stack and keep it running until interrupted
    Run(RunArgs),
    /// Compile a contract and collect its artifacts
    Build(BuildArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    #[clap(flatten)]
    stack: StackConfig,
    /// JSON file to load the stack configuration from
    #[clap(long)]
    config_file: Option<String>,
    /// Write the current configuration to --config-file and exit
    #[clap(long)]
    generate_config_template: bool,
}

#[derive(clap::Args)]
struct BuildArgs {
    /// Contract name, a directory under --contracts-dir
    contract: String,
    #[clap(long)]
    release: bool,
    #[clap(long, default_value = "contracts")]
    contracts_dir: PathBuf,
    #[clap(long, default_value = "artifacts")]
    artifacts_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Run(args) => run(args).await,
        Command::Build(args) => build(args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = args.stack;
    if let Some(path) = args.config_file.as_ref() {
        if args.generate_config_template {
            if Path::new(path).exists() {
                eprintln!("Config file already exists at {}", path);
                return Ok(());
            }

            let mut file = File::create(path).context("Error while creating config file")?;
            let json = serde_json::to_string_pretty(&config)
                .context("Error while serializing config file")?;
            file.write_all(json.as_bytes())
                .context("Error while writing config file")?;
            println!("Config file template generated at {}", path);
            return Ok(());
        }

        let file = File::open(path).context("Error while opening config file")?;
        config = serde_json::from_reader(file).context("Error while reading config file")?;
    } else if args.generate_config_template {
        eprintln!("Provided config file path is required to generate the template with --config-file");
        return Ok(());
    }

    config.validate().context("Invalid stack configuration")?;

    if let Some(version) = config.stack_version.as_deref() {
        StackBinaryDownloader::from_config(&config)
            .download(version)
            .await
            .with_context(|| format!("Unable to provision stack binaries {}", version))?;
    }

    let orchestrator = StackOrchestrator::from_config(&config);
    orchestrator
        .launch()
        .await
        .context("Unable to start the stack")?;
    info!("Stack started, node RPC at {}", config.node_rpc_url());

    match orchestrator.run_until_shutdown(config.time_limit()).await {
        ShutdownReason::ProcessExited(exit) => {
            error!("Stack stopped after {} exited", exit.role);
            anyhow::bail!("{} exited unexpectedly (code {:?})", exit.role, exit.code)
        }
        reason => {
            info!("Stack stopped ({:?})", reason);
            Ok(())
        }
    }
}

async fn build(args: BuildArgs) -> Result<()> {
    let builder = CargoContractBuilder::new(args.contracts_dir, args.artifacts_dir);
    let dir = builder
        .build(&args.contract, args.release)
        .await
        .with_context(|| format!("Unable to build contract {}", args.contract))?;
    println!("Artifacts written to {}", dir.display());
    Ok(())
}
