use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use proxy::{BusPlayerTransport, ProxyDrain, RouteDispatcher};
use service::shutdown::ShutdownOrchestrator;
use service::{Context, DirectoryView, Environment, LoadSampler, RegistrationConfig, ServiceIdentity};

/// A Fulcrum edge proxy: terminates player connections and routes them
/// onto backends picked from the registry's broadcast directory.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(flatten)]
    log: cli_common::LogArgs,

    #[clap(flatten)]
    bus: cli_common::BusArgs,

    /// Address players connect to, `host:port`.
    #[clap(long = "address", env = "FULCRUM_ADDRESS", default_value = "0.0.0.0:25565")]
    address: String,

    /// Player capacity reported in heartbeats.
    #[clap(long = "max-players", env = "FULCRUM_MAX_PLAYERS", default_value = "500")]
    max_players: u32,
}

struct ProxySampler {
    dispatcher: Arc<RouteDispatcher>,
    max_players: u32,
}

impl LoadSampler for ProxySampler {
    fn sample(&self) -> (models::ServiceStatus, models::LoadMetrics) {
        let load = models::LoadMetrics {
            player_count: self.dispatcher.connected_players().len() as u32,
            max_players: self.max_players,
            tps: 20.0,
            response_time: 0,
        };
        (models::ServiceStatus::Available, load)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    cli_common::init_logging(&args.log);
    tracing::info!(?args, "starting a proxy");

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
    let address = match &environment.ip_override {
        Some(ip) => match args.address.rsplit_once(':') {
            Some((_host, port)) => format!("{ip}:{port}"),
            None => args.address.clone(),
        },
        None => args.address.clone(),
    };
    tracing::info!(descriptor = %environment.descriptor, %address, "resolved environment");

    let identity = ServiceIdentity::generate(
        models::ServiceRole::Proxy,
        "proxy",
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

    service::register(&ctx, &Default::default(), &RegistrationConfig::default())
        .await
        .context("registration failed, cannot boot")?;

    let transport = Arc::new(BusPlayerTransport { ctx: ctx.clone() });
    let dispatcher = RouteDispatcher::new(ctx.clone(), transport);
    let _slot_watch = dispatcher.install();
    let _reregister = service::install_reregister_responder(&ctx, Default::default());

    // Directed channels for this proxy: transfer commands pass through to
    // the connection layer, and the request inbox only logs (no peer has
    // a request a proxy answers).
    let id = ctx.permanent_id().expect("registered above");
    let _direct = ctx.bus.subscribe(
        &models::channels::direct(models::ServiceRole::Proxy, &id),
        bus::handler(|envelope| async move {
            match envelope.message() {
                Ok(envelope::Message::PlayerRouteCommand(command)) => tracing::info!(
                    player = %command.player_id,
                    target = %command.target_address,
                    slot = ?command.slot_id,
                    "handing the player to the connection layer"
                ),
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "dropping an undecodable direct message"),
            }
        }),
    );
    let _inbox = ctx.bus.subscribe(
        &models::channels::request(&id),
        bus::handler(|envelope| async move {
            tracing::debug!(
                message_type = %envelope.message_type,
                sender = %envelope.sender_id,
                "ignoring a request this proxy does not serve"
            );
        }),
    );

    let mut scheduler = service::tick::Scheduler::new();
    service::register_heartbeat(
        &mut scheduler,
        &ctx,
        Arc::new(ProxySampler {
            dispatcher: dispatcher.clone(),
            max_players: args.max_players,
        }),
    );
    let ticks = scheduler.spawn();

    let (exit_tx, mut exit_rx) = tokio::sync::mpsc::channel(1);
    let (_shutdown, _intent_subscription) =
        ShutdownOrchestrator::install(&ctx, Arc::new(ProxyDrain(dispatcher.clone())), exit_tx);

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to wait for the interrupt signal")?;
            tracing::info!("interrupt received, proxy exiting");
        }
        _ = exit_rx.recv() => {
            tracing::info!("drain complete, proxy exiting");
        }
    }
    ticks.abort();
    Ok(())
}
