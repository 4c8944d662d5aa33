mod chaos;
mod earbud;
mod events;
mod handover;
mod profiles;
mod reconnect;
mod scenario;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use earbud::StackFaults;
use events::{emit, EventStarted};
use tws_topology::{HandoverReason, TopologyConfig};

#[derive(Parser)]
#[command(name = "tws-sim", about = "Two-node simulator for the TWS earbud topology")]
struct Cli {
    /// Bytes of participant state per peer frame.
    #[arg(long, default_value = "64")]
    chunk_size: usize,

    /// Upper bound on simulated service latency in ms.
    #[arg(long, default_value = "5")]
    latency: u64,

    /// Probability that a handset page fails.
    #[arg(long, default_value = "0.0")]
    page_failure: f64,

    /// Also append the JSONL output to this file.
    #[arg(long)]
    jsonl: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// One earbud, no peer: repeated handset link loss and reconnect.
    Reconnect {
        /// Number of link-loss cycles.
        #[arg(long, default_value = "5")]
        cycles: u32,
    },

    /// Bounce the primary role between the earbuds while streaming.
    Handover {
        /// Number of handovers.
        #[arg(long, default_value = "4")]
        count: u32,
        #[arg(long, value_enum, default_value = "battery")]
        reason: Reason,
    },

    /// Random faults against a connected pair, then an ownership check.
    Chaos {
        /// Number of injected faults.
        #[arg(long, default_value = "30")]
        rounds: u32,
        /// RNG seed (random when omitted).
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Reason {
    InCase,
    OutOfEar,
    Battery,
    VoiceQuality,
    Rssi,
    LinkQuality,
    External,
}

impl From<Reason> for HandoverReason {
    fn from(reason: Reason) -> Self {
        match reason {
            Reason::InCase => HandoverReason::InCase,
            Reason::OutOfEar => HandoverReason::OutOfEar,
            Reason::Battery => HandoverReason::BatteryLevel,
            Reason::VoiceQuality => HandoverReason::VoiceQuality,
            Reason::Rssi => HandoverReason::Rssi,
            Reason::LinkQuality => HandoverReason::LinkQuality,
            Reason::External => HandoverReason::External,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Some(path) = &cli.jsonl {
        events::init_jsonl_file(path)?;
    }

    let config = TopologyConfig::from_env().marshal_chunk_size(cli.chunk_size);
    let faults = StackFaults {
        page_failure: cli.page_failure,
        max_latency: Duration::from_millis(cli.latency),
    };

    eprintln!("tws-sim v{}", env!("CARGO_PKG_VERSION"));

    let report = match cli.command {
        Command::Reconnect { cycles } => {
            emit(&EventStarted::new("reconnect", None));
            reconnect::run(config, faults, cycles).await?
        }
        Command::Handover { count, reason } => {
            emit(&EventStarted::new("handover", None));
            handover::run(config, faults, count, reason.into()).await?
        }
        Command::Chaos { rounds, seed } => {
            let seed = seed.unwrap_or_else(rand::random);
            eprintln!("seed: {seed}");
            emit(&EventStarted::new("chaos", Some(seed)));
            chaos::run(config, faults, rounds, seed).await?
        }
    };

    report.print_summary();
    emit(&report);
    if !report.success() {
        std::process::exit(1);
    }
    Ok(())
}
