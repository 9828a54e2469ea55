use clap::Parser;
use color_eyre::eyre::{self, WrapErr};
use simtsim::config::{Config, SchedulingOptions};
use simtsim::memory::FixedLatency;
use simtsim::work_scheduler::WorkDescriptor;
use simtsim::workgroup::Dim;
use simtsim::xlat::Descriptor;
use simtsim::Simulator;
use std::path::PathBuf;

#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser, Debug, Clone)]
#[clap(
    version = option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"),
    about = "cycle-level simulation of a SIMT accelerator control core",
)]
pub struct Options {
    #[clap(long = "config", help = "simulator config (yaml)")]
    pub config: Option<PathBuf>,
    #[clap(long = "kernel", help = "kernel launch descriptor (json)")]
    pub kernel: PathBuf,
    #[clap(long = "memory", help = "initial bulk memory words (json array)")]
    pub memory: Option<PathBuf>,
    #[clap(long = "dim", help = "override the thread space, e.g. 64,1")]
    pub dim: Option<Dim>,
    #[clap(long = "cycle-limit", help = "maximum number of compute cycles")]
    pub cycle_limit: Option<u64>,
    #[clap(long = "options", help = "comma separated scheduling options")]
    pub options: Option<SchedulingOptions>,
    #[clap(long = "stats", help = "output stats file (json)")]
    pub stats: Option<PathBuf>,
}

/// Number of words needed to back every buffer.
fn required_words(buffers: &[Descriptor]) -> usize {
    buffers
        .iter()
        .filter(|buffer| buffer.valid)
        .map(|buffer| buffer.base as usize + buffer.len())
        .max()
        .unwrap_or(0)
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let start = std::time::Instant::now();
    let options = Options::parse();

    let mut config: Config = match &options.config {
        Some(path) => {
            let reader = std::fs::File::open(path)
                .wrap_err_with(|| format!("failed to open config {}", path.display()))?;
            serde_yaml::from_reader(reader)?
        }
        None => Config::default(),
    };
    if let Some(cycle_limit) = options.cycle_limit {
        config.cycle_limit = Some(cycle_limit);
    }
    if let Some(extra) = options.options {
        for option in extra.iter() {
            config.options.set(option, true);
        }
    }

    let reader = std::fs::File::open(&options.kernel)
        .wrap_err_with(|| format!("failed to open kernel {}", options.kernel.display()))?;
    let mut kernel: WorkDescriptor = serde_json::from_reader(reader)?;
    if let Some(dim) = options.dim {
        kernel.thread_space = dim;
    }

    let initial: Vec<u32> = match &options.memory {
        Some(path) => {
            let reader = std::fs::File::open(path)
                .wrap_err_with(|| format!("failed to open memory {}", path.display()))?;
            serde_json::from_reader(reader)
                .wrap_err_with(|| format!("failed to parse memory {}", path.display()))?
        }
        None => Vec::new(),
    };
    let bulk_words = required_words(&kernel.bulk_buffers).max(initial.len());
    let scratchpad_words = required_words(&kernel.scratchpad_buffers);
    let mut engine = FixedLatency::new(&config, bulk_words, scratchpad_words);
    engine.bulk_memory_mut()[..initial.len()].copy_from_slice(&initial);

    let mut sim = Simulator::new(config, engine)?;
    sim.launch(kernel)?;
    let stats = sim.run_to_completion()?;

    match &options.stats {
        Some(path) => {
            let writer = std::fs::File::create(path)
                .wrap_err_with(|| format!("failed to create {}", path.display()))?;
            serde_json::to_writer_pretty(writer, &stats)?;
        }
        None => println!("{}", serde_json::to_string_pretty(&stats)?),
    }
    eprintln!("simulated {} cycles in {:?}", stats.sim.cycles, start.elapsed());
    Ok(())
}
