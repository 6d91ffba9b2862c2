use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use registry::{EnvironmentDirectory, Registry, RegistryConfig};

/// The Fulcrum registry: authoritative directory, id assignment,
/// liveness, and shutdown intents for the whole fleet.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(flatten)]
    log: cli_common::LogArgs,

    #[clap(flatten)]
    bus: cli_common::BusArgs,

    /// Backing file of the environment directory.
    #[clap(
        long = "environments",
        env = "FULCRUM_ENVIRONMENTS",
        default_value = "environments.json"
    )]
    environments: std::path::PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    cli_common::init_logging(&args.log);
    tracing::info!(?args, "starting the registry");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cli_common::worker_threads())
        .enable_all()
        .build()?;

    let result = runtime.block_on(async_main(args));
    runtime.shutdown_timeout(Duration::from_secs(5));
    result
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let bus = args
        .bus
        .connect("registry")
        .await
        .context("failed to connect the bus")?;

    let environments = EnvironmentDirectory::load(&args.environments)
        .context("failed to load the environment directory")?;

    let config = RegistryConfig {
        environments_path: Some(args.environments.clone()),
        ..RegistryConfig::default()
    };
    let registry = Registry::new(bus, config, environments);
    let _subscriptions = registry.install();

    let mut scheduler = service::tick::Scheduler::new();
    registry.register_ticks(&mut scheduler);
    let ticks = scheduler.spawn();

    // A restarted registry rebuilds its directory from the fleet before
    // it starts answering queries with authority.
    registry
        .announce_restart()
        .await
        .context("failed to broadcast the re-registration request")?;
    tracing::info!("registry is serving");

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for the interrupt signal")?;
    tracing::info!("interrupt received, registry exiting");
    ticks.abort();
    Ok(())
}
