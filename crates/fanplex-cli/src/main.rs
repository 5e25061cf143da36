//! fanplex
//!
//! Soak runner for merge and split sessions: spins up synthetic producers and
//! consumers, runs one session, and reports what every side observed.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use fanplex_cli::soak::{self, MergePlan, SplitPlan};
use fanplex_core::config::load_config;
use fanplex_core::tracing_init::init_tracing;
use fanplex_core::{Config, Overflow, QueuePolicy};

#[derive(Parser, Debug)]
#[command(name = "fanplex")]
#[command(version, about = "fanplex - dynamic fan-in/fan-out soak runner")]
struct Cli {
    /// Explicit JSON config file, applied over global and project settings
    #[arg(long, global = true, env = "FANPLEX_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Merge several producers into one consumer
    Merge {
        /// Number of producers
        #[arg(long, default_value_t = 4)]
        inputs: usize,

        /// Values sent by each producer
        #[arg(long, default_value_t = 10_000)]
        items: u64,

        /// Bound the merged output (unbounded when omitted)
        #[arg(long)]
        output_capacity: Option<usize>,

        /// Drain the merged output instead of reading it
        #[arg(long)]
        discard: bool,
    },
    /// Broadcast one producer to several consumers
    Split {
        /// Number of outputs
        #[arg(long, default_value_t = 4)]
        outputs: usize,

        /// Values sent by the producer
        #[arg(long, default_value_t = 10_000)]
        items: u64,

        /// Outputs that are never read
        #[arg(long, default_value_t = 0)]
        stalled: usize,

        /// Bound each output's delivery queue (unbounded when omitted)
        #[arg(long)]
        queue_capacity: Option<usize>,

        /// What to do when a bounded queue is full
        #[arg(long, value_parser = ["drop-newest", "detach"])]
        overflow: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let project_dir = std::env::current_dir()?;
    let mut config = load_config(Some(&project_dir), cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    if cli.log_json {
        config.log.json = true;
    }
    init_tracing(&config.log)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting fanplex");

    let ok = match cli.command {
        Command::Merge {
            inputs,
            items,
            output_capacity,
            discard,
        } => {
            if output_capacity.is_some() {
                config.merge.output_capacity = output_capacity;
            }
            config.validate()?;

            let plan = MergePlan {
                inputs,
                items,
                discard,
            };
            let report = soak::run_merge(&plan, config.merge).await?;
            print_report(&report);
            report.is_ok()
        }
        Command::Split {
            outputs,
            items,
            stalled,
            queue_capacity,
            overflow,
        } => {
            let overflow = overflow.map(|o| o.parse::<Overflow>()).transpose()?;
            apply_queue_overrides(&mut config, queue_capacity, overflow)?;
            config.validate()?;

            let plan = SplitPlan {
                outputs,
                items,
                stalled,
            };
            let report = soak::run_split(&plan, config.split).await?;
            print_report(&report);
            report.is_ok()
        }
    };

    if !ok {
        anyhow::bail!("soak run did not observe every value");
    }
    Ok(())
}

fn apply_queue_overrides(
    config: &mut Config,
    capacity: Option<usize>,
    overflow: Option<Overflow>,
) -> anyhow::Result<()> {
    let current = config.split.queue;
    config.split.queue = match (capacity.or(current.capacity()), overflow) {
        (None, Some(_)) => {
            anyhow::bail!("--overflow needs a bounded split queue (pass --queue-capacity)")
        }
        (None, None) => QueuePolicy::Unbounded,
        (Some(capacity), overflow) => QueuePolicy::Bounded {
            capacity,
            overflow: overflow.or(current.overflow()).unwrap_or_default(),
        },
    };
    Ok(())
}

#[allow(clippy::print_stdout)]
fn print_report(report: &impl std::fmt::Display) {
    println!("{report}");
}
