//! Flight surety node binary

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use surety_core::NodeConfig;
use surety_crypto::keys::{derive_account, PublicKeyInfo};
use surety_escrow::{compute_genesis_hash, GenesisConfig};
use surety_node::{RuntimeBuilder, Simulation};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "surety-node")]
#[command(about = "Flight Surety - flight-delay insurance ledger")]
#[command(version)]
struct Cli {
    /// Log filter, overrides the configured level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the oracle simulation end to end
    Simulate {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Genesis file path
        #[arg(short, long)]
        genesis: Option<PathBuf>,
    },

    /// Write a default node configuration
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Generate a devnet genesis configuration
    Genesis {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// Deployment name
        #[arg(long, default_value = "Flight Surety Devnet")]
        chain_name: String,
    },

    /// Print the derived identities used by the simulation
    Keygen {
        /// Account role, e.g. owner, airline, oracle, passenger
        #[arg(long, default_value = "oracle")]
        label: String,

        /// Number of accounts
        #[arg(long, default_value = "1")]
        count: u64,
    },
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<NodeConfig> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)?;
            Ok(NodeConfig::from_json(&content)?)
        }
        None => Ok(NodeConfig::default()),
    }
}

fn devnet_genesis(config: &NodeConfig) -> GenesisConfig {
    let owner = derive_account("owner", 0).address();
    let airline = derive_account("airline", 0).address();
    GenesisConfig::devnet(&owner)
        .with_first_airline(&airline)
        .with_surety(config.surety.clone())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate { config, genesis } => {
            let node_config = load_config(config.as_ref())?;
            init_logging(cli.log_level.as_deref().unwrap_or(&node_config.log_level))?;

            info!("Starting {}...", node_config.name);

            let genesis_config = match genesis {
                Some(path) => {
                    let content = std::fs::read_to_string(&path)?;
                    GenesisConfig::from_json(&content)?
                }
                None => devnet_genesis(&node_config),
            };
            let airline = genesis_config
                .parse_first_airline()?
                .ok_or_else(|| anyhow::anyhow!("genesis must name a first airline"))?;

            let simulation = node_config.simulation.clone();
            let (runtime, events) = RuntimeBuilder::new()
                .config(node_config)
                .genesis(&genesis_config)
                .build()?;
            let owner = runtime.initialize_genesis(genesis_config).await?;
            info!("Ledger owner: {}", owner);
            info!("Authorized caller: {}", runtime.app_address());

            let report = Simulation::new(&runtime, events, simulation)
                .run(&airline)
                .await?;

            for flight in &report.flights {
                let state = if flight.is_open { "open" } else { "closed" };
                println!("{:<8} {:<30} {}", flight.code, flight.status.to_string(), state);
            }
            for (passenger, amount) in &report.withdrawn {
                println!("withdrawn {} -> {}", amount, passenger);
            }
            println!("escrow balance: {}", report.escrow_balance);
            println!("events: {}", report.events);
            println!("state root: {}", runtime.state_root().await);
        }

        Commands::Config { output } => {
            let config = NodeConfig::default();
            std::fs::write(&output, config.to_json()?)?;
            println!("Node configuration saved to: {}", output.display());
        }

        Commands::Genesis { output, chain_name } => {
            let genesis = GenesisConfig {
                chain_name,
                ..devnet_genesis(&NodeConfig::default())
            };
            std::fs::write(&output, genesis.to_json()?)?;
            println!("Genesis configuration saved to: {}", output.display());
            println!("Genesis hash: {}", compute_genesis_hash(&genesis)?);
        }

        Commands::Keygen { label, count } => {
            let accounts: Vec<PublicKeyInfo> = (0..count)
                .map(|i| PublicKeyInfo::from(&derive_account(&label, i)))
                .collect();
            println!("{}", serde_json::to_string_pretty(&accounts)?);
        }
    }

    Ok(())
}
