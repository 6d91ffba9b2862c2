//! One periodic scheduler per process. Components register their tick
//! callbacks with a period; a single task fans the ticks out, in place of
//! a thread per timer.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;

type TickFn = Box<dyn FnMut() -> BoxFuture<'static, ()> + Send>;

struct Emitter {
    name: &'static str,
    period: Duration,
    tick: TickFn,
}

#[derive(Default)]
pub struct Scheduler {
    emitters: Vec<Emitter>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tick callback invoked every `period`, starting one
    /// period from scheduler start.
    pub fn register<F, Fut>(&mut self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        assert!(!period.is_zero(), "tick period must be non-zero");
        self.emitters.push(Emitter {
            name,
            period,
            tick: Box::new(move || -> BoxFuture<'static, ()> { Box::pin(tick()) }),
        });
    }

    /// Consume the scheduler and drive all registered emitters until the
    /// task is dropped.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(run(self.emitters))
    }
}

async fn run(mut emitters: Vec<Emitter>) {
    if emitters.is_empty() {
        return;
    }
    let start = Instant::now();
    let mut deadlines: Vec<Instant> = emitters.iter().map(|e| start + e.period).collect();

    loop {
        let (index, deadline) = deadlines
            .iter()
            .copied()
            .enumerate()
            .min_by_key(|(_, deadline)| *deadline)
            .expect("at least one emitter is registered");

        tokio::time::sleep_until(deadline).await;

        let emitter = &mut emitters[index];
        let started = Instant::now();
        (emitter.tick)().await;
        let elapsed = started.elapsed();
        if elapsed > emitter.period {
            tracing::warn!(emitter = emitter.name, ?elapsed, "tick overran its period");
        }

        // Fixed cadence: an overrunning tick fires again immediately
        // rather than drifting.
        deadlines[index] = deadline + emitter.period;
    }
}
