use std::sync::Arc;
use std::time::Duration;

use envelope::Message;
use models::{channels, LoadMetrics, ServiceStatus};

use crate::tick::Scheduler;
use crate::Context;

/// `T_hb`: the fixed heartbeat interval. The registry's staleness
/// thresholds are multiples of it.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Source of the load figures a heartbeat carries. Backends report slot
/// occupancy, proxies report connection counts.
pub trait LoadSampler: Send + Sync + 'static {
    fn sample(&self) -> (ServiceStatus, LoadMetrics);
}

/// Register the heartbeat emitter on the shared scheduler. Publish
/// failures are logged, never propagated; the registry's reaper treats a
/// silent service as stale on its own clock.
pub fn register_heartbeat(scheduler: &mut Scheduler, ctx: &Context, sampler: Arc<dyn LoadSampler>) {
    let bus = ctx.bus.clone();
    let identity = ctx.identity.clone();

    scheduler.register("heartbeat", HEARTBEAT_INTERVAL, move || {
        let bus = bus.clone();
        let identity = identity.clone();
        let sampler = sampler.clone();
        async move {
            let (id, role) = {
                let identity = identity.read().unwrap();
                (identity.permanent_id.clone(), identity.role)
            };
            // Nothing to report until registration has assigned an id.
            let Some(id) = id else { return };
            let Some(channel) = channels::heartbeat(role) else { return };

            let (status, load) = sampler.sample();
            let message = Message::Heartbeat(models::Heartbeat {
                id,
                status,
                load,
                timestamp: models::now_ms(),
            });
            if let Err(err) = bus.publish(channel, &message) {
                tracing::warn!(error = %err, "failed to publish a heartbeat");
            }
        }
    });
}
