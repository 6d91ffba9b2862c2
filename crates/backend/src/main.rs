use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use backend::{BackendConfig, BackendDrain, LocalWorlds, SlotOrchestrator};
use clap::Parser;
use service::shutdown::ShutdownOrchestrator;
use service::{Context, DirectoryView, Environment, RegistrationConfig, ServiceIdentity};

/// A Fulcrum game backend: registers with the registry, advertises its
/// slot families, and serves provision commands.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(flatten)]
    log: cli_common::LogArgs,

    #[clap(flatten)]
    bus: cli_common::BusArgs,

    /// Slot-family configuration file.
    #[clap(long = "config", env = "FULCRUM_BACKEND_CONFIG", default_value = "backend.json")]
    config: std::path::PathBuf,

    /// Address players are transferred to, `host:port`.
    #[clap(long = "address", env = "FULCRUM_ADDRESS", default_value = "127.0.0.1:25001")]
    address: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    cli_common::init_logging(&args.log);
    tracing::info!(?args, "starting a backend");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cli_common::worker_threads())
        .enable_all()
        .build()?;

    let result = runtime.block_on(async_main(args));
    runtime.shutdown_timeout(Duration::from_secs(5));
    result
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let environment = Environment::load_default().context("failed to read the ENVIRONMENT file")?;
    let config = BackendConfig::load(&args.config).context("failed to load the backend config")?;

    let address = match &environment.ip_override {
        Some(ip) => match args.address.rsplit_once(':') {
            Some((_host, port)) => format!("{ip}:{port}"),
            None => args.address.clone(),
        },
        None => args.address.clone(),
    };
    tracing::info!(descriptor = %environment.descriptor, %address, "resolved environment");

    let identity = ServiceIdentity::generate(
        models::ServiceRole::Server,
        &config.id_family,
        address,
        env!("CARGO_PKG_VERSION"),
    );
    let bus = args
        .bus
        .connect(identity.temp_id.as_str())
        .await
        .context("failed to connect the bus")?;

    let ctx = Context::new(bus, identity);
    let _directory_feeds = DirectoryView::install(&ctx);

    let orchestrator = SlotOrchestrator::new(ctx.clone(), config, Arc::new(LocalWorlds));
    let advertised = orchestrator.advertised();

    let initial_families = advertised.read().unwrap().clone();
    service::register(&ctx, &initial_families, &RegistrationConfig::default())
        .await
        .context("registration failed, cannot boot")?;

    let _slot_subscriptions = orchestrator.install();
    orchestrator.advertise_all();
    let _reregister = service::install_reregister_responder(&ctx, advertised);

    let mut scheduler = service::tick::Scheduler::new();
    service::register_heartbeat(&mut scheduler, &ctx, orchestrator.clone());
    orchestrator.register_ticks(&mut scheduler);
    let ticks = scheduler.spawn();

    let (exit_tx, mut exit_rx) = tokio::sync::mpsc::channel(1);
    let (_shutdown, _intent_subscription) = ShutdownOrchestrator::install(
        &ctx,
        Arc::new(BackendDrain(orchestrator.clone())),
        exit_tx,
    );

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to wait for the interrupt signal")?;
            tracing::info!("interrupt received, backend exiting");
        }
        _ = exit_rx.recv() => {
            tracing::info!("drain complete, backend exiting");
        }
    }
    ticks.abort();
    Ok(())
}
