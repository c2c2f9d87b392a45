//! `upcall-cli` -- concurrent producer/consumer exerciser for the dispatch engine.
//!
//! Spawns producer tasks that submit operations and wait for them, and a pool
//! of stand-in service agents that answer with random latency, occasionally
//! failing or never answering. Optionally restarts the agent pool mid-run to
//! exercise reissue. Prints the outcome tally and engine counters as JSON.
//!
//! Log level comes from `RUST_LOG` (default `upcall_core=info`).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upcall_core::{
    AgentGroup, DispatchError, Disposition, Engine, EngineConfig, ReaperLoop, ServiceHandler, Tag,
    Timeout,
};

#[derive(Debug, Parser)]
#[command(name = "upcall-cli", about = "Stress the upcall dispatch engine")]
struct Args {
    /// JSON engine config; flags below override its fields.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Concurrent submitting tasks.
    #[arg(long, default_value_t = 8)]
    producers: usize,

    /// Operations submitted by each producer.
    #[arg(long, default_value_t = 200)]
    ops: usize,

    /// Service agent tasks.
    #[arg(long, default_value_t = 4)]
    agents: usize,

    /// Per-operation deadline in milliseconds.
    #[arg(long, default_value_t = 500)]
    timeout_ms: u64,

    /// Probability that an agent never answers a request.
    #[arg(long, default_value_t = 0.05)]
    drop_rate: f64,

    /// Probability that an agent answers with a failure.
    #[arg(long, default_value_t = 0.02)]
    fail_rate: f64,

    /// Upper bound of the random service latency in milliseconds.
    #[arg(long, default_value_t = 20)]
    max_latency_ms: u64,

    /// Restart the agent pool after this many milliseconds.
    #[arg(long)]
    restart_after_ms: Option<u64>,

    /// In-progress table bucket count.
    #[arg(long)]
    buckets: Option<usize>,

    /// Pending queue capacity (unbounded when absent).
    #[arg(long)]
    capacity: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Upcall {
    producer: usize,
    seq: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Downcall {
    producer: usize,
    seq: usize,
}

struct StressAgent {
    drop_rate: f64,
    fail_rate: f64,
    max_latency: Duration,
}

#[async_trait]
impl ServiceHandler<Upcall, Downcall> for StressAgent {
    async fn service(&self, _tag: Tag, request: &Upcall) -> Disposition<Downcall> {
        // ThreadRng is not Send; finish with it before the first await.
        let (latency, roll) = {
            let mut rng = rand::thread_rng();
            let max_ms = self.max_latency.as_millis() as u64;
            (
                Duration::from_millis(rng.gen_range(0..=max_ms)),
                rng.gen_range(0.0..1.0),
            )
        };
        tokio::time::sleep(latency).await;

        if roll < self.drop_rate {
            Disposition::NoReply
        } else if roll < self.drop_rate + self.fail_rate {
            Disposition::Fail(format!("injected failure for seq {}", request.seq))
        } else {
            Disposition::Reply(Downcall {
                producer: request.producer,
                seq: request.seq,
            })
        }
    }
}

#[derive(Debug, Default, Serialize)]
struct Tally {
    serviced: u64,
    mismatched: u64,
    failed: u64,
    timed_out: u64,
    cancelled: u64,
    purged: u64,
    rejected: u64,
}

impl Tally {
    fn record(&mut self, expected: &Upcall, result: Result<Downcall, DispatchError>) {
        match result {
            Ok(response) if response.producer == expected.producer && response.seq == expected.seq => {
                self.serviced += 1
            }
            Ok(_) => self.mismatched += 1,
            Err(DispatchError::Service(_)) => self.failed += 1,
            Err(DispatchError::TimedOut) => self.timed_out += 1,
            Err(DispatchError::Cancelled) => self.cancelled += 1,
            Err(DispatchError::Purged) => self.purged += 1,
            Err(_) => self.rejected += 1,
        }
    }

    fn merge(&mut self, other: Tally) {
        self.serviced += other.serviced;
        self.mismatched += other.mismatched;
        self.failed += other.failed;
        self.timed_out += other.timed_out;
        self.cancelled += other.cancelled;
        self.purged += other.purged;
        self.rejected += other.rejected;
    }

    fn total(&self) -> u64 {
        self.serviced
            + self.mismatched
            + self.failed
            + self.timed_out
            + self.cancelled
            + self.purged
            + self.rejected
    }
}

fn load_config(args: &Args) -> Result<EngineConfig, String> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| format!("read {}: {e}", path.display()))?;
            serde_json::from_str(&raw).map_err(|e| format!("parse {}: {e}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    if let Some(buckets) = args.buckets {
        config.hash_table_size = buckets;
    }
    if args.capacity.is_some() {
        config.pending_capacity = args.capacity;
    }
    Ok(config)
}

async fn produce(
    engine: Arc<Engine<Upcall, Downcall>>,
    producer: usize,
    ops: usize,
    timeout: Duration,
) -> Tally {
    let mut tally = Tally::default();
    for seq in 0..ops {
        let request = Upcall { producer, seq };
        match engine.submit(request.clone(), Timeout::After(timeout)) {
            Ok(handle) => {
                let result = engine.wait(&handle).await;
                handle.release();
                tally.record(&request, result);
            }
            Err(e) => {
                tracing::debug!(producer, seq, error = %e, "submit rejected");
                tally.rejected += 1;
            }
        }
    }
    tally
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "upcall_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let engine = match Engine::<Upcall, Downcall>::new(config) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            tracing::error!(error = %e, "engine failed to start");
            return ExitCode::FAILURE;
        }
    };

    let handler: Arc<dyn ServiceHandler<Upcall, Downcall>> = Arc::new(StressAgent {
        drop_rate: args.drop_rate,
        fail_rate: args.fail_rate,
        max_latency: Duration::from_millis(args.max_latency_ms),
    });
    let reaper = ReaperLoop::spawn(Arc::clone(&engine));
    let mut agents = AgentGroup::spawn(args.agents, Arc::clone(&engine), Arc::clone(&handler));

    let timeout = Duration::from_millis(args.timeout_ms);
    let producers: Vec<_> = (0..args.producers)
        .map(|producer| tokio::spawn(produce(Arc::clone(&engine), producer, args.ops, timeout)))
        .collect();

    if let Some(after) = args.restart_after_ms {
        tokio::time::sleep(Duration::from_millis(after)).await;
        tracing::info!("restarting service agents");
        agents.shutdown_and_join().await;
        let report = engine.reissue_in_progress();
        tracing::info!(requeued = report.requeued, purged = report.purged, "agents restarted");
        agents = AgentGroup::spawn(args.agents, Arc::clone(&engine), Arc::clone(&handler));
    }

    let mut tally = Tally::default();
    for producer in producers {
        match producer.await {
            Ok(part) => tally.merge(part),
            Err(e) => tracing::error!(error = %e, "producer task failed"),
        }
    }

    let purge = engine.shutdown();
    agents.shutdown_and_join().await;
    reaper.stop().await;

    let counts = engine.counts();
    let expected = (args.producers * args.ops) as u64;
    let healthy = counts.pending == 0
        && counts.in_progress == 0
        && tally.mismatched == 0
        && tally.total() == expected;

    let summary = serde_json::json!({
        "submitted": expected,
        "outcomes": tally,
        "purge": { "pending": purge.pending, "in_progress": purge.in_progress },
        "engine": counts,
    });
    match serde_json::to_string_pretty(&summary) {
        Ok(text) => println!("{text}"),
        Err(e) => tracing::error!(error = %e, "failed to encode summary"),
    }

    if !healthy {
        tracing::error!("engine left work behind or delivered mismatched responses");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
