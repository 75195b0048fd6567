//! Operator CLI (§6): start/stop the control plane process, trigger an
//! out-of-band pricing backfill, list active agents, and reload the
//! scorer. Talks straight to the Store rather than through the HTTP API,
//! the way an operator script runs against the same database the
//! service uses.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use fleet_control_plane::config::{AppConfig, StoreConfig};
use fleet_control_plane::model::AgentStatus;
use fleet_control_plane::pricing::PricingPipeline;
use fleet_control_plane::store::{PgStore, Store};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "controlplane-cli", version, about = "Operator surface for the fleet control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the control plane server as a background process
    Start(StartArgs),

    /// Stop a running control plane process by pid file
    Stop(StopArgs),

    /// Run one pricing consolidation pass immediately
    BackfillPrices,

    /// List agents for a tenant
    ListAgents(ListAgentsArgs),

    /// Reload the live decision scorer
    ReloadScorer,
}

#[derive(Args, Debug)]
struct StartArgs {
    /// Path to the binary to launch (defaults to the one on PATH)
    #[arg(long, default_value = "fleet-control-plane")]
    bin: String,

    /// Where to write the pid file
    #[arg(long, default_value = "controlplane.pid")]
    pid_file: PathBuf,
}

#[derive(Args, Debug)]
struct StopArgs {
    #[arg(long, default_value = "controlplane.pid")]
    pid_file: PathBuf,
}

#[derive(Args, Debug)]
struct ListAgentsArgs {
    #[arg(long)]
    tenant_id: Uuid,

    /// Only show agents currently online
    #[arg(long)]
    online_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();
    let cli = Cli::parse();

    match cli.command {
        Command::Start(args) => start(args),
        Command::Stop(args) => stop(args),
        Command::BackfillPrices => backfill_prices().await,
        Command::ListAgents(args) => list_agents(args).await,
        Command::ReloadScorer => reload_scorer(),
    }
}

fn start(args: StartArgs) -> anyhow::Result<()> {
    let child = std::process::Command::new(&args.bin).spawn()?;
    std::fs::write(&args.pid_file, child.id().to_string())?;
    println!("started {} (pid {})", args.bin, child.id());
    Ok(())
}

fn stop(args: StopArgs) -> anyhow::Result<()> {
    let pid: i32 = std::fs::read_to_string(&args.pid_file)?.trim().parse()?;
    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid, libc::SIGTERM) };
        if result != 0 {
            anyhow::bail!("failed to signal pid {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        anyhow::bail!("stop is only implemented for unix targets");
    }
    std::fs::remove_file(&args.pid_file).ok();
    println!("stopped pid {pid}");
    Ok(())
}

async fn backfill_prices() -> anyhow::Result<()> {
    let config = AppConfig::from_env();
    let store_config = StoreConfig::from_env()?;
    let store = Arc::new(PgStore::connect(&store_config.database_url).await?);
    let pipeline = PricingPipeline::new(store, config.pricing);
    match pipeline.run().await? {
        Some(run_id) => println!("consolidation run {run_id} complete"),
        None => println!("a consolidation run was already in progress, skipped"),
    }
    Ok(())
}

async fn list_agents(args: ListAgentsArgs) -> anyhow::Result<()> {
    let store_config = StoreConfig::from_env()?;
    let store = PgStore::connect(&store_config.database_url).await?;
    let agents = store.list_agents(args.tenant_id).await?;
    for agent in agents {
        if args.online_only && agent.status != AgentStatus::Online {
            continue;
        }
        println!(
            "{}\t{}\t{:?}\t{}/{}\tmode={:?}",
            agent.agent_id, agent.logical_id, agent.status, agent.region, agent.az, agent.mode
        );
    }
    Ok(())
}

fn reload_scorer() -> anyhow::Result<()> {
    // TODO: wire an admin RPC so this can hot-reload the scorer in the
    // already-running process (DecisionEngineHarness::reload_scorer);
    // today this only takes effect on the next process start.
    println!("scorer will be reloaded from SCORER_ARTIFACT_PATH on next process start");
    Ok(())
}
