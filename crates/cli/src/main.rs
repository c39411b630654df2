//! Host-side command line driver for the Updraft update engine.
//!
//! Every command prints JSON on stdout; logs go to stderr.

mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use updraft_core::UpdateId;
use updraft_core::config::NetworkType;
use updraft_engine::{LaunchDescriptor, UpdateEngine, metrics};
use updraft_signer::{KeyPair, ManifestSigner};

/// Environment variable holding a secret signing key for `sign --env`.
const SIGNING_KEY_ENV: &str = "UPDRAFT_SIGNING_KEY";

#[derive(Parser)]
#[command(name = "updraft")]
#[command(about = "Host-side driver for the Updraft update engine")]
#[command(version)]
struct Cli {
    /// Engine config file path
    #[arg(short, long, env = "UPDRAFT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Print engine metrics to stderr when the command finishes
    #[arg(long, global = true, default_value_t = false)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Engine(EngineCommands),
    /// Generate a manifest signing key pair
    Keygen {
        /// Key id placed in signature headers (e.g., "main-2024")
        #[arg(short, long)]
        name: String,
        /// Output file for the secret key
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Sign a manifest body and print the signature header value
    Sign {
        /// Manifest JSON file, signed byte for byte
        manifest: PathBuf,
        #[command(flatten)]
        key: SigningKeyArgs,
    },
}

/// Commands that open the update engine.
#[derive(Subcommand)]
enum EngineCommands {
    /// Run the startup flow and print the launch descriptor
    Launch {
        /// Network the host is on, checked against check_automatically
        #[arg(long, value_enum, default_value_t = Network::Unknown)]
        network: Network,
    },
    /// Check the remote source and download a newer update
    Check,
    /// Report how a launched update behaved
    Report {
        /// Update id from the launch descriptor
        update_id: UpdateId,
        #[command(flatten)]
        outcome: OutcomeArgs,
    },
    /// Delete superseded updates and unreferenced assets
    Reap,
    /// Show engine state and stored updates
    Status,
    /// Print and clear recorded diagnostics
    Diagnostics,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct OutcomeArgs {
    /// The update started and is healthy
    #[arg(long)]
    succeeded: bool,
    /// The update crashed
    #[arg(long)]
    failed: bool,
    /// The update never became healthy
    #[arg(long)]
    timed_out: bool,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct SigningKeyArgs {
    /// Path to secret key file
    #[arg(short, long)]
    file: Option<PathBuf>,
    /// Secret key value directly
    #[arg(short, long)]
    value: Option<String>,
    /// Read secret key from UPDRAFT_SIGNING_KEY env var
    #[arg(short, long)]
    env: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Network {
    Wifi,
    Cellular,
    Offline,
    Unknown,
}

impl From<Network> for NetworkType {
    fn from(network: Network) -> Self {
        match network {
            Network::Wifi => NetworkType::Wifi,
            Network::Cellular => NetworkType::Cellular,
            Network::Offline => NetworkType::Offline,
            Network::Unknown => NetworkType::Unknown,
        }
    }
}

#[derive(Serialize)]
struct CheckOutput {
    /// Newly ready update, if the check produced one.
    update_id: Option<UpdateId>,
}

#[derive(Serialize)]
struct ReportOutput {
    update_id: UpdateId,
    outcome: &'static str,
    /// Replacement launch when the failure triggered crash recovery.
    relaunch: Option<LaunchDescriptor>,
}

#[derive(Serialize)]
struct KeygenOutput {
    key_id: String,
    /// Absent when the secret was written to a file.
    secret_key: Option<String>,
    public_key: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let Cli {
        config,
        print_metrics,
        command,
    } = Cli::parse();

    let result = match command {
        Commands::Keygen { name, output } => handle_keygen(&name, output.as_deref()).await,
        Commands::Sign { manifest, key } => handle_sign(&manifest, key).await,
        Commands::Engine(command) => handle_engine_command(command, config.as_deref()).await,
    };

    if print_metrics {
        let text = metrics::gather_text().context("failed to render metrics")?;
        eprint!("{text}");
    }

    result
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{json}");
    Ok(())
}

async fn handle_engine_command(command: EngineCommands, config_path: Option<&Path>) -> Result<()> {
    let engine_config = config::load_engine_config(config_path)?;
    let engine = UpdateEngine::open(engine_config)
        .await
        .context("failed to open update engine")?;

    let result = run_engine_command(&engine, command).await;
    engine.shutdown().await;
    result
}

async fn run_engine_command(engine: &UpdateEngine, command: EngineCommands) -> Result<()> {
    match command {
        EngineCommands::Launch { network } => {
            let descriptor = engine
                .start(network.into())
                .await
                .context("failed to launch an update")?;
            print_json(&descriptor)?;
            // Let a startup download finish so the next launch can use it.
            engine.wait_for_background_tasks().await;
        }
        EngineCommands::Check => {
            let update_id = engine
                .check_for_update()
                .await
                .context("update check failed")?;
            print_json(&CheckOutput { update_id })?;
        }
        EngineCommands::Report { update_id, outcome } => {
            let (label, relaunch) = if outcome.succeeded {
                ("succeeded", engine.report_launch_outcome(update_id, true).await)
            } else if outcome.failed {
                ("failed", engine.report_launch_outcome(update_id, false).await)
            } else {
                ("timed_out", engine.report_launch_timed_out(update_id).await)
            };
            let relaunch = relaunch
                .with_context(|| format!("failed to report launch of {update_id}"))?;
            print_json(&ReportOutput {
                update_id,
                outcome: label,
                relaunch,
            })?;
            engine.wait_for_background_tasks().await;
        }
        EngineCommands::Reap => {
            let report = engine.reap().await.context("reap failed")?;
            print_json(&report)?;
        }
        EngineCommands::Status => {
            let status = engine.status().await.context("failed to read status")?;
            print_json(&status)?;
        }
        EngineCommands::Diagnostics => {
            let log = engine
                .consume_diagnostics()
                .await
                .context("failed to read diagnostics")?;
            print_json(&log)?;
        }
    }
    Ok(())
}

async fn handle_keygen(name: &str, output: Option<&Path>) -> Result<()> {
    let keypair = KeyPair::generate(name);
    let secret_key = keypair.secret_key_string();

    let secret_key = match output {
        Some(path) => {
            tokio::fs::write(path, format!("{secret_key}\n"))
                .await
                .with_context(|| format!("failed to write key to {}", path.display()))?;
            restrict_permissions(path).await?;
            tracing::info!(path = %path.display(), "Secret key written");
            None
        }
        None => Some(secret_key),
    };

    print_json(&KeygenOutput {
        key_id: keypair.key_id.clone(),
        secret_key,
        public_key: keypair.public_key_string(),
    })
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    tokio::fs::set_permissions(path, perms)
        .await
        .with_context(|| format!("failed to restrict permissions on {}", path.display()))
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

async fn handle_sign(manifest: &Path, key: SigningKeyArgs) -> Result<()> {
    let secret_key = read_secret_key(key).await?;
    let signer = ManifestSigner::from_secret_key_string(secret_key.trim())
        .context("failed to parse secret key")?;

    let body = tokio::fs::read(manifest)
        .await
        .with_context(|| format!("failed to read manifest: {}", manifest.display()))?;
    updraft_core::Manifest::from_json(&body)
        .with_context(|| format!("{} is not a valid manifest", manifest.display()))?;

    println!("{}", signer.sign(&body));
    Ok(())
}

async fn read_secret_key(key: SigningKeyArgs) -> Result<String> {
    if let Some(path) = key.file {
        tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read key file: {}", path.display()))
    } else if let Some(value) = key.value {
        Ok(value)
    } else if key.env {
        std::env::var(SIGNING_KEY_ENV)
            .with_context(|| format!("{SIGNING_KEY_ENV} environment variable not set"))
    } else {
        anyhow::bail!("one of --file, --value, or --env is required");
    }
}
