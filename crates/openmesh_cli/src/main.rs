//! OpenMesh CLI
//!
//! Validates control plane configuration and runs seeded simulations.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use openmesh_scheduler::MeshConfig;
use openmesh_sim::{FailureModel, SimConfig, SimReport, Simulation};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "openmesh")]
#[command(about = "OpenMesh - decentralized compute scheduling control plane", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a config file and print the effective config
    CheckConfig {
        /// Path to TOML config
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Run the control plane against simulated nodes
    Simulate {
        /// Path to TOML config
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Nodes to register
        #[arg(long, default_value_t = 4)]
        nodes: usize,
        /// Jobs to submit
        #[arg(long, default_value_t = 20)]
        jobs: usize,
        /// Seed for every random draw
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Ticks to run at most
        #[arg(long, default_value_t = 600)]
        ticks: u64,
        /// Disable failure injection
        #[arg(long)]
        reliable: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("openmesh=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> Result<MeshConfig> {
    match path {
        Some(path) => MeshConfig::load(path)
            .wrap_err_with(|| format!("failed to load config from {}", path.display())),
        None => Ok(MeshConfig::default()),
    }
}

fn check_config(path: &Path) -> Result<String> {
    let config = load_config(Some(path))?;
    Ok(serde_json::to_string_pretty(&config)?)
}

async fn simulate(mesh: MeshConfig, sim: SimConfig) -> Result<SimReport> {
    let mut simulation = Simulation::start(mesh, sim)
        .await
        .wrap_err("failed to start simulation")?;
    Ok(simulation.run().await)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Commands::CheckConfig { config } => {
            println!("{}", check_config(&config)?);
            Ok(())
        }
        Commands::Simulate {
            config,
            nodes,
            jobs,
            seed,
            ticks,
            reliable,
        } => {
            let mesh = load_config(config.as_deref())?;
            let mut sim = SimConfig::new(seed)
                .with_nodes(nodes)
                .with_jobs(jobs)
                .with_max_ticks(ticks);
            if reliable {
                sim = sim.with_failures(FailureModel::reliable());
            }
            let report = simulate(mesh, sim).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}
