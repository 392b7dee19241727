//! Convoy Simulator CLI
//!
//! Runs the seeded demo scenario, logs what the convoys do and saves
//! snapshots along the way.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use convoy_domain::CostType;
use convoy_persistence::{
    FileSnapshotRepository, MemorySnapshotRepository, ReadStrategy, SnapshotRecord,
    SnapshotRepository, TieredSnapshotRepository, WriteStrategy, open_tiered,
};
use convoy_simulator::scenario::Scenario;
use convoy_simulator::{SimConfig, SimulationSnapshot, TracingSink};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type Repo = TieredSnapshotRepository<MemorySnapshotRepository, FileSnapshotRepository>;

#[derive(Parser, Debug)]
#[command(name = "convoy-simulator")]
#[command(about = "Run the convoy interlocking demo scenario")]
struct Args {
    /// Ticks to simulate
    #[arg(short, long, default_value = "4096")]
    ticks: u64,

    /// Seed for cargo and bus speeds
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Freight trains on the rail loop
    #[arg(long, default_value = "3")]
    trains: usize,

    /// Buses on the road
    #[arg(long, default_value = "3")]
    buses: usize,

    /// Run name snapshots are stored under
    #[arg(long, default_value = "demo")]
    name: String,

    /// Directory for snapshots (no saving when absent)
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Save every N ticks
    #[arg(long, default_value = "1024")]
    save_every: u64,

    /// How snapshot reads use the in-process cache
    #[arg(long, value_enum, default_value_t = ReadMode::CacheFirst)]
    read_strategy: ReadMode,

    /// How snapshot saves use the in-process cache
    #[arg(long, value_enum, default_value_t = WriteMode::WriteThrough)]
    write_strategy: WriteMode,

    /// Continue from the latest snapshot of this run
    #[arg(long)]
    resume: bool,

    /// Wall-clock delay per tick in milliseconds
    #[arg(long, default_value = "0")]
    tick_ms: u64,

    /// Scan for reservation and lane breaches after every tick
    #[arg(long)]
    check_invariants: bool,

    /// Log as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ReadMode {
    CacheFirst,
    StoreOnly,
}

impl From<ReadMode> for ReadStrategy {
    fn from(mode: ReadMode) -> Self {
        match mode {
            ReadMode::CacheFirst => Self::CacheFirst,
            ReadMode::StoreOnly => Self::StoreOnly,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum WriteMode {
    WriteThrough,
    WriteAround,
}

impl From<WriteMode> for WriteStrategy {
    fn from(mode: WriteMode) -> Self {
        match mode {
            WriteMode::WriteThrough => Self::WriteThrough,
            WriteMode::WriteAround => Self::WriteAround,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::from_default_env().add_directive("convoy_simulator=info".parse()?);
    if args.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = SimConfig::from_env();
    let repo = match &args.save_dir {
        Some(dir) => {
            Some(open_tiered(dir, args.read_strategy.into(), args.write_strategy.into()).await?)
        }
        None => None,
    };

    let mut scenario = match (&repo, args.resume) {
        (Some(repo), true) => match repo.latest(&args.name).await? {
            Some(record) => {
                info!(snapshot_id = %record.id(), tick = record.meta.tick, "Resuming");
                let snapshot = SimulationSnapshot::from_json(record.body)?;
                Scenario::resume(config, snapshot, args.seed)?
            }
            None => {
                warn!(name = %args.name, "No snapshot to resume, starting fresh");
                Scenario::build(config, args.seed, args.trains, args.buses)?
            }
        },
        _ => Scenario::build(config, args.seed, args.trains, args.buses)?,
    };

    info!(
        ticks = args.ticks,
        seed = args.seed,
        convoys = scenario.convoys.len(),
        "Starting simulation"
    );

    let mut sink = TracingSink;
    for _ in 0..args.ticks {
        scenario.step();
        scenario.sim.flush_events(&mut sink);

        if args.check_invariants {
            for violation in scenario.sim.check_invariants() {
                warn!(tick = scenario.sim.tick(), %violation, "Invariant violated");
            }
        }

        if let Some(repo) = &repo {
            if args.save_every > 0 && scenario.sim.tick() % args.save_every == 0 {
                save(repo, &args.name, &scenario).await?;
            }
        }

        if args.tick_ms > 0 {
            sleep(Duration::from_millis(args.tick_ms)).await;
        }
    }

    if let Some(repo) = &repo {
        save(repo, &args.name, &scenario).await?;
    }

    print_summary(&scenario);
    Ok(())
}

async fn save(repo: &Repo, name: &str, scenario: &Scenario) -> Result<()> {
    let tick = scenario.sim.tick();
    let body = scenario.sim.snapshot().to_json()?;
    let record = SnapshotRecord::new(name, tick, body);
    repo.save(&record).await?;
    info!(snapshot_id = %record.id(), tick, "Snapshot saved");
    Ok(())
}

fn print_summary(scenario: &Scenario) {
    println!();
    println!(
        "{:<12} {:<14} {:<28} {:>8} {:>10} {:>10}",
        "CONVOY", "NAME", "STATE", "CARGO", "DISTANCE", "PROFIT"
    );
    for (id, cnv) in scenario.sim.convoys() {
        println!(
            "{:<12} {:<14} {:<28} {:>8} {:>10} {:>10}",
            id.to_string(),
            cnv.name,
            cnv.state.to_string(),
            cnv.cargo(),
            cnv.total_distance_traveled,
            cnv.finance.total(CostType::Profit),
        );
    }
    println!("\nSimulated {} ticks, month {}", scenario.sim.tick(), scenario.sim.month());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_flags_parse() {
        let args = Args::try_parse_from([
            "convoy-simulator",
            "--read-strategy",
            "store-only",
            "--write-strategy",
            "write-around",
        ])
        .unwrap();
        assert_eq!(ReadStrategy::from(args.read_strategy), ReadStrategy::StoreOnly);
        assert_eq!(WriteStrategy::from(args.write_strategy), WriteStrategy::WriteAround);
    }

    #[test]
    fn test_strategy_flags_default() {
        let args = Args::try_parse_from(["convoy-simulator"]).unwrap();
        assert_eq!(ReadStrategy::from(args.read_strategy), ReadStrategy::CacheFirst);
        assert_eq!(WriteStrategy::from(args.write_strategy), WriteStrategy::WriteThrough);
    }
}
