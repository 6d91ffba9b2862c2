//! Plumbing shared by every Fulcrum binary: logging arguments, bus
//! connection arguments, and the worker-pool sizing rule.

mod logging;

pub use logging::{init_logging, LogArgs, LogFormat, LogLevel};

/// Bus endpoint arguments shared by every binary.
#[derive(Debug, clap::Args)]
pub struct BusArgs {
    /// Redis endpoint of the production bus. Omit it to run on the
    /// process-local in-memory bus.
    #[clap(long = "bus.redis-url", env = "FULCRUM_REDIS_URL", global = true)]
    pub redis_url: Option<String>,
}

impl BusArgs {
    pub async fn connect(&self, sender_id: &str) -> anyhow::Result<bus::Bus> {
        let mut config = bus::BusConfig::new(sender_id);
        if let Some(url) = &self.redis_url {
            config = config.with_redis(url.clone());
        }
        Ok(bus::Bus::connect(config).await?)
    }
}

/// Worker pool size for the async runtime: `max(4, 2 * cores)`.
pub fn worker_threads() -> usize {
    let cores = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(2);
    std::cmp::max(4, 2 * cores)
}
