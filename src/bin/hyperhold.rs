//! Hyperhold operator CLI
//!
//! Drives the secondary tier against an in-memory primary store and device,
//! and inspects configuration.
//!
//! # Examples
//!
//! ```bash
//! # Simulate 8 groups writing 512 pages each, with all caches enabled
//! hyperhold simulate --groups 8 --pages 512 --cache-level 7
//!
//! # Print the effective configuration
//! hyperhold --config tier.toml config
//! ```

use clap::{Args, Parser, Subcommand};
use dashmap::DashMap;
use hyperhold::error::Error;
use hyperhold::tier::{
    ExtentId, ExtentPages, FaultIn, GroupId, Manager, MemoryStore, ObjectFlags, ObjectId, PrimaryStore, Scenario,
    Shrinker, PAGE_SIZE,
};
use hyperhold::TierConfig;
use rayon::prelude::*;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Hyperhold - compressed secondary storage tier
#[derive(Parser, Debug)]
#[command(name = "hyperhold")]
#[command(version = hyperhold::VERSION)]
#[command(about = "Hyperhold - compressed secondary storage tier", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Tier configuration file (TOML)
    #[arg(long, global = true, env = "HYPERHOLD_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for daily rolling log files
    #[arg(long, global = true, env = "HYPERHOLD_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a write/fault/pressure workload and print statistics
    Simulate(SimulateArgs),

    /// Print the effective configuration as TOML
    Config,

    /// Show version
    Version,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Number of groups writing concurrently
    #[arg(long, default_value = "4")]
    groups: u16,

    /// Pages written per group
    #[arg(long, default_value = "256")]
    pages: u32,

    /// Cache level bitmask (1 = fault_out, 2 = batch_out, 4 = reclaim_in)
    #[arg(long)]
    cache_level: Option<u32>,

    /// Fault back every n-th page
    #[arg(long, default_value = "3")]
    fault_every: u32,

    /// Pages requested from the shrinker at the end
    #[arg(long, default_value = "64")]
    pressure: u64,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli)?;

    let config = TierConfig::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Simulate(args) => simulate_command(config, args),
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Commands::Version => {
            println!("hyperhold {}", hyperhold::VERSION);
            Ok(())
        }
    }
}

/// Console output plus an optional daily rolling file
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    let file_layer = match &cli.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "hyperhold.log");
            Some(fmt::layer().with_writer(appender).with_ansi(false))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(file_layer)
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

/// Deterministic, compressible page content
fn page_for(obj: u32) -> Vec<u8> {
    (0..PAGE_SIZE as u32)
        .map(|i| ((i / 64).wrapping_mul(obj | 1) % 251) as u8)
        .collect()
}

struct Workload<'a> {
    mgr: &'a Manager<MemoryStore>,
    device: &'a DashMap<ExtentId, ExtentPages>,
    mismatches: &'a AtomicU64,
}

impl Workload<'_> {
    /// Write the group's pages, then push them into the tier
    fn reclaim(&self, group: GroupId, objects: &[u32]) -> hyperhold::error::Result<usize> {
        for &obj in objects {
            self.mgr.write_page(ObjectId(obj), group, &page_for(obj))?;
        }
        let mut extents = 0;
        loop {
            let io = match self.mgr.create(group) {
                Ok(io) => io,
                Err(Error::NoEligibleObjects(_)) => break,
                Err(Error::OutOfSpace(_)) => {
                    warn!(group = group.0, "Tier full, stopping reclaim");
                    break;
                }
                Err(e) => return Err(e),
            };
            self.device.insert(io.extent(), io.pages().clone());
            self.mgr.register(io, true)?;
            extents += 1;
        }
        Ok(extents)
    }

    /// Fault selected objects back one at a time
    fn fault(&self, objects: &[u32], every: u32) -> hyperhold::error::Result<()> {
        for &obj in objects.iter().filter(|&&o| every > 0 && o % every == 0) {
            let id = ObjectId(obj);
            let Some(addr) = self.in_tier(id)? else { continue };

            match self.mgr.find_by_extent_id(addr) {
                Ok(FaultIn::Cached(ext)) => self.mgr.cache_out(id, Some(ext))?,
                Ok(FaultIn::Io(mut io)) => match self.device.get(&io.extent()) {
                    Some(pages) => {
                        let ext = io.extent();
                        *io.pages_mut() = pages.clone();
                        drop(pages);
                        self.mgr.destroy(io, Scenario::FaultOut)?;
                        // Admitted to the cache: the entry is pinned for us.
                        if self.in_tier(id)?.is_some() {
                            self.mgr.cache_out(id, Some(ext))?;
                        }
                    }
                    None => self.mgr.exception(Scenario::FaultOut, io)?,
                },
                Err(e) if e.is_busy() || e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
            self.verify(obj)?;
        }
        Ok(())
    }

    /// Pull the rest of the group back, extent by extent
    fn batch_out(&self, group: GroupId) -> hyperhold::error::Result<usize> {
        let mut extents = 0;
        while let Ok(mut io) = self.mgr.find_by_group(group) {
            match self.device.get(&io.extent()) {
                Some(pages) => {
                    *io.pages_mut() = pages.clone();
                    drop(pages);
                    self.mgr.destroy(io, Scenario::BatchOut)?;
                }
                None => {
                    self.mgr.exception(Scenario::BatchOut, io)?;
                    break;
                }
            }
            extents += 1;
        }
        Ok(extents)
    }

    /// Tier address of `obj`, if it currently lives in the tier
    fn in_tier(&self, obj: ObjectId) -> hyperhold::error::Result<Option<u64>> {
        self.mgr
            .store()
            .with_object(obj, |m| m.flags.contains(ObjectFlags::IN_TIER).then_some(m.handle))
    }

    fn verify(&self, obj: u32) -> hyperhold::error::Result<()> {
        match self.mgr.read_page(ObjectId(obj)) {
            Ok(page) if page == page_for(obj) => {}
            Ok(_) => {
                self.mismatches.fetch_add(1, Ordering::Relaxed);
                warn!(obj, "Page content mismatch");
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

fn simulate_command(mut config: TierConfig, args: SimulateArgs) -> anyhow::Result<()> {
    let needed = args.groups as u32 * args.pages;
    if config.area.nr_objects < needed {
        config.area.nr_objects = needed;
    }
    if config.area.nr_groups <= args.groups as u32 {
        config.area.nr_groups = args.groups as u32 + 1;
    }
    config.validate()?;

    let store = Arc::new(MemoryStore::new(config.area.nr_objects));
    let mgr = Manager::new(config, store)?;
    if let Some(level) = args.cache_level {
        mgr.set_cache_level(level)?;
    }

    let groups: Vec<GroupId> = (1..=args.groups).map(GroupId).collect();
    for &group in &groups {
        mgr.attach_group(group)?;
    }

    info!(groups = args.groups, pages = args.pages, "Simulation starting");
    let device = DashMap::new();
    let mismatches = AtomicU64::new(0);
    let workload = Workload {
        mgr: &mgr,
        device: &device,
        mismatches: &mismatches,
    };

    groups.par_iter().try_for_each(|&group| -> hyperhold::error::Result<()> {
        let base = (group.0 as u32 - 1) * args.pages;
        let objects: Vec<u32> = (base..base + args.pages).collect();
        let written = workload.reclaim(group, &objects)?;
        workload.fault(&objects, args.fault_every)?;
        let batched = workload.batch_out(group)?;
        info!(group = group.0, written, batched, "Group workload finished");
        Ok(())
    })?;

    let freed = mgr.scan(args.pressure);
    info!(requested = args.pressure, freed, remaining = mgr.count(), "Pressure applied");

    println!("{}", serde_json::to_string_pretty(&mgr.stats())?);
    eprint!("{}", mgr.cache_state());

    let mismatches = mismatches.load(Ordering::Relaxed);
    if mismatches > 0 {
        anyhow::bail!("{} pages read back with wrong content", mismatches);
    }
    Ok(())
}
