/*
* Proxmox Provider Command Line Interface
* ---------------------------------------
* The orchestrator normally drives the steps. This CLI is for the rest of us: poking
* a cluster from a laptop, replaying a stuck request, or checking why a storage
* selector refuses to match anything (spoiler: it's the quotes).
*
* proxmox-provider
* ├── provision       run the five steps locally, persisting state as we go
* ├── deprovision     stop + delete the VM recorded in a state file
* ├── image-name      which ISO file a schematic/version pair caches to
* └── check-selector  evaluate a storage selector against a live node
*
* Ctrl-C cancels whatever is in flight. The state file is written after every step
* invocation, so a rerun picks up exactly where the last one stopped.
*/

pub mod local;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::settings::DEFAULT_IMAGE_FACTORY_URL;
use crate::config::Settings;
use crate::core::image::{image_file_name, image_url};
use crate::core::storage_selector::{compile, pick_from};
use crate::core::{Provisioner, StepResult};
use crate::errors::SelectionError;
use crate::predicate::ExprParser;
use crate::proxmox::{ProxmoxApi, ProxmoxClient};

use self::local::{load_state, save_state, LocalRequest};

#[derive(Parser)]
#[command(name = "proxmox-provider")]
#[command(about = "Provisions Talos machines as Proxmox VE virtual machines", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML or TOML settings file, PROXMOX_* env vars override it
    #[arg(short, long, value_name = "CONFIG", global = true)]
    config_file: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
}

impl Cli {
    pub fn verbose(&self) -> bool {
        self.verbose
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the provisioning steps for a request file
    Provision {
        #[arg(short, long, value_name = "YAML")]
        request: PathBuf,
        #[arg(short, long, value_name = "JSON")]
        state: PathBuf,
    },
    /// Stop and delete the VM recorded in a state file
    Deprovision {
        #[arg(short, long, value_name = "JSON")]
        state: PathBuf,
        #[arg(long, default_value = "local")]
        request_id: String,
    },
    /// Print the cached ISO file name for a schematic and Talos version
    ImageName {
        #[arg(long)]
        schematic: String,
        #[arg(long)]
        talos_version: String,
        #[arg(long, default_value = DEFAULT_IMAGE_FACTORY_URL)]
        factory: String,
    },
    /// Evaluate a storage selector against the storages of a node
    CheckSelector {
        selector: String,
        #[arg(short, long)]
        node: String,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::ImageName {
            schematic,
            talos_version,
            factory,
        } => {
            let url = image_url(&factory, &schematic, &talos_version)?;
            println!("{} {}", "file:".bold(), image_file_name(&url));
            println!("{} {}", "url: ".bold(), url);
            Ok(())
        }
        Commands::Provision { request, state } => {
            let settings = Settings::new(cli.config_file.as_deref())?;
            let request = LocalRequest::load(&request, &settings.provisioning.image_factory_url)?;
            let provisioner = Provisioner::new(ProxmoxClient::new(&settings.proxmox)?, settings.provisioning);
            provision(&provisioner, &request, &state, &interrupt_token()).await
        }
        Commands::Deprovision { state, request_id } => {
            let settings = Settings::new(cli.config_file.as_deref())?;
            let provisioner = Provisioner::new(ProxmoxClient::new(&settings.proxmox)?, settings.provisioning);
            let machine = load_state(&state)?;

            provisioner
                .deprovision(&machine, &request_id, &interrupt_token())
                .await?;

            println!("{} VM {} removed", "✓".green(), machine.vmid);
            Ok(())
        }
        Commands::CheckSelector { selector, node } => {
            let settings = Settings::new(cli.config_file.as_deref())?;
            let client = ProxmoxClient::new(&settings.proxmox)?;
            check_selector(&client, &selector, &node).await
        }
    }
}

/// Cancelled on the first Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, cancelling");
            child.cancel();
        }
    });

    token
}

/// Runs every step until it continues, sleeping through retries and
/// persisting the state after each invocation.
pub async fn provision<A: ProxmoxApi>(
    provisioner: &Provisioner<A>,
    request: &LocalRequest,
    state_path: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut state = load_state(state_path)?;

    for step in provisioner.steps() {
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => bail!("interrupted during {step}"),
                result = provisioner.run_step(*step, request, &mut state) => result,
            };
            save_state(state_path, &state)?;

            match result {
                StepResult::Continue => {
                    println!("{} {}", "✓".green(), step);
                    break;
                }
                StepResult::RetryAfter(delay) => {
                    println!("{} {} (retry in {:?})", "…".yellow(), step, delay);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => bail!("interrupted during {step}"),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                StepResult::Fail(err) => {
                    println!("{} {}: {}", "✗".red(), step, err);
                    return Err(err).with_context(|| format!("step {step} failed"));
                }
            }
        }
    }

    println!(
        "{} VM {} is running on {}",
        "✓".green().bold(),
        state.vmid,
        state.node
    );
    Ok(())
}

async fn check_selector<A: ProxmoxApi>(api: &A, selector: &str, node: &str) -> Result<()> {
    let predicate = compile(&ExprParser, selector)?;
    let pools = api
        .storages(node)
        .await
        .with_context(|| format!("failed to list storages on {node}"))?;

    println!("{}", format!("Storages on {node}:").as_str().bold());

    for pool in &pools {
        let verdict = match pick_from(predicate.as_ref(), selector, node, std::slice::from_ref(pool)) {
            Ok(_) => "match".green(),
            Err(SelectionError::NoStorageMatch { .. }) => "no match".normal(),
            Err(err) => format!("error: {err}").as_str().red(),
        };
        println!(
            "- {} ({}, {} bytes free) [{}]",
            pool.storage, pool.storage_type, pool.avail, verdict
        );
    }

    // same answer syncVM would get
    match pick_from(predicate.as_ref(), selector, node, &pools) {
        Ok(pool) => println!("{} selected {}", "✓".green(), pool.storage),
        Err(err) => println!("{} {}", "✗".red(), err),
    }

    Ok(())
}
