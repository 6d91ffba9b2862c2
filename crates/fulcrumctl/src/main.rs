//! Operator CLI for the Fulcrum control plane.
//!
//! Exit codes: 0 on success, 1 on an invalid target, 2 on a timeout.

use std::collections::BTreeSet;
use std::time::Duration;

use clap::Parser;
use envelope::Message;
use models::channels;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[clap(author, version, about = "Operator CLI for the Fulcrum control plane", long_about = None)]
struct Fulcrumctl {
    #[clap(flatten)]
    log: cli_common::LogArgs,

    #[clap(flatten)]
    bus: cli_common::BusArgs,

    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
#[clap(rename_all = "kebab-case")]
enum Subcommand {
    /// Print the current directory and slot map.
    Runtimeinfo {
        /// Emit raw JSON instead of tables.
        #[clap(long)]
        json: bool,
    },
    /// Issue a shutdown intent against one or more services.
    Shutdown {
        /// Comma-separated permanent ids to drain.
        #[clap(long = "targets", required = true, value_delimiter = ',')]
        targets: Vec<String>,
        /// Countdown before eviction begins.
        #[clap(long = "seconds", default_value = "30")]
        seconds: u64,
        #[clap(long)]
        force: bool,
    },
}

enum CtlError {
    InvalidTarget(String),
    Timeout,
    Other(anyhow::Error),
}

impl From<anyhow::Error> for CtlError {
    fn from(err: anyhow::Error) -> Self {
        CtlError::Other(err)
    }
}

impl From<bus::Error> for CtlError {
    fn from(err: bus::Error) -> Self {
        match err {
            bus::Error::Timeout { .. } => CtlError::Timeout,
            other => CtlError::Other(other.into()),
        }
    }
}

fn main() {
    let args = Fulcrumctl::parse();
    cli_common::init_logging(&args.log);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build the runtime");

    let result = runtime.block_on(run(args));
    runtime.shutdown_timeout(Duration::from_secs(1));

    let code = match result {
        Ok(()) => 0,
        Err(CtlError::InvalidTarget(target)) => {
            eprintln!("invalid target: {target}");
            1
        }
        Err(CtlError::Timeout) => {
            eprintln!("the registry did not answer in time");
            2
        }
        Err(CtlError::Other(err)) => {
            eprintln!("error: {err:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(args: Fulcrumctl) -> Result<(), CtlError> {
    let sender = format!("fulcrum-limbo-{}", uuid::Uuid::new_v4());
    let bus = args
        .bus
        .connect(&sender)
        .await
        .map_err(CtlError::Other)?;

    match args.subcommand {
        Subcommand::Runtimeinfo { json } => runtimeinfo(&bus, json).await,
        Subcommand::Shutdown {
            targets,
            seconds,
            force,
        } => shutdown(&bus, targets, seconds, force).await,
    }
}

async fn runtimeinfo(bus: &bus::Bus, json: bool) -> Result<(), CtlError> {
    let response = bus
        .request(
            None,
            channels::RUNTIME_INFO,
            &Message::RuntimeInfoRequest(models::RuntimeInfoRequest::default()),
            REQUEST_TIMEOUT,
        )
        .await?;

    let Ok(Message::RuntimeInfoResponse(info)) = response.message() else {
        return Err(CtlError::Other(anyhow::anyhow!(
            "unexpected response {:?}",
            response.message_type
        )));
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&info).expect("runtime info always serializes")
        );
        return Ok(());
    }

    println!(
        "{:<10} {:<8} {:<12} {:<22} {:>9} {:>6}",
        "ID", "ROLE", "STATUS", "ADDRESS", "PLAYERS", "TPS"
    );
    for record in &info.directory {
        println!(
            "{:<10} {:<8} {:<12} {:<22} {:>4}/{:<4} {:>6.1}",
            record.id,
            record.role,
            format!("{:?}", record.status).to_lowercase(),
            record.address,
            record.load.player_count,
            record.load.max_players,
            record.load.tps,
        );
    }

    if info.slots.is_empty() {
        println!("\nno active slots");
        return Ok(());
    }
    println!(
        "\n{:<10} {:<14} {:<12} {:<10} {:<12} {:>9}",
        "SERVER", "SLOT", "FAMILY", "VARIANT", "STATE", "OCCUPANTS"
    );
    for (server, slots) in &info.slots {
        for slot in slots {
            println!(
                "{:<10} {:<14} {:<12} {:<10} {:<12} {:>9}",
                server,
                slot.slot_id,
                slot.family_id,
                slot.variant_id,
                format!("{:?}", slot.state).to_lowercase(),
                slot.occupants.len(),
            );
        }
    }
    Ok(())
}

async fn shutdown(
    bus: &bus::Bus,
    targets: Vec<String>,
    seconds: u64,
    force: bool,
) -> Result<(), CtlError> {
    let targets: BTreeSet<models::ServiceId> =
        targets.iter().map(|target| target.as_str().into()).collect();

    let response = bus
        .request(
            None,
            channels::SHUTDOWN_REQUEST,
            &Message::ShutdownRequest(models::ShutdownRequest {
                targets: targets.clone(),
                countdown_seconds: seconds,
                force,
            }),
            REQUEST_TIMEOUT,
        )
        .await?;

    let Ok(Message::ShutdownResponse(outcome)) = response.message() else {
        return Err(CtlError::Other(anyhow::anyhow!(
            "unexpected response {:?}",
            response.message_type
        )));
    };

    if outcome.success {
        let intent_id = outcome
            .intent_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "<none>".to_string());
        println!(
            "intent {intent_id} issued: draining {} in {seconds}s",
            targets
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(())
    } else {
        let reason = outcome.reason.unwrap_or_else(|| "unspecified".to_string());
        match reason.strip_prefix("unknown target ") {
            Some(target) => Err(CtlError::InvalidTarget(target.to_string())),
            None => Err(CtlError::Other(anyhow::anyhow!(reason))),
        }
    }
}
