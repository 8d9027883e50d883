//! Command-line parsing for `hmmc`.
//!
//! Argument parsing and command dispatch stay separate from the cache, queue
//! and fitting code: this module only describes the CLI surface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::domain::{Library, Surrogate};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "hmmc", version, about = "Fitted-HMM cache and distributed fitting jobs")]
pub struct Cli {
    /// Log filter level (error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "info")]
    pub log_level: tracing::Level,

    #[command(flatten)]
    pub dirs: DirArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a worker: lease jobs, fit models, store them in the cache.
    Worker(WorkerArgs),
    /// Enqueue fitting jobs for every uncached key of a parameter sweep.
    Enqueue(EnqueueArgs),
    /// Resolve a parameter sweep and print per-experiment entropy statistics.
    Sweep(SweepArgs),
    /// Show queue and cache status.
    Status,
    /// Return stale leases (crashed workers) to the pending queue.
    Reclaim(ReclaimArgs),
    /// Print one cached model.
    Show(ShowArgs),
    /// Write synthetic spike CSVs into the data directory.
    Demo(DemoArgs),
}

/// Storage locations and the retry budget.
///
/// Every flag falls back to an environment variable (a `.env` file is read)
/// and then to a built-in default.
#[derive(Debug, Clone, Default, Args)]
pub struct DirArgs {
    /// Model cache directory [env: HMM_CACHE_DIR] [default: .hmm/cache].
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Job queue directory [env: HMM_QUEUE_DIR] [default: .hmm/queue].
    #[arg(long, global = true, value_name = "DIR")]
    pub queue_dir: Option<PathBuf>,

    /// Spike CSV directory, `<source>/<experiment>.csv` [env: HMM_DATA_DIR] [default: data].
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Per-experiment metrics JSON directory [env: HMM_METRICS_DIR] [default: metrics].
    #[arg(long, global = true, value_name = "DIR")]
    pub metrics_dir: Option<PathBuf>,

    /// Fit attempts per job before it is abandoned [env: HMM_MAX_ATTEMPTS] [default: 3].
    #[arg(long, global = true)]
    pub max_attempts: Option<u32>,
}

/// Which models a sweep covers.
#[derive(Debug, Clone, Args)]
pub struct KeyArgs {
    /// Data source (subdirectory of the data dir).
    #[arg(short = 's', long, default_value = "A")]
    pub source: String,

    /// Experiment name glob (`*` and `?`).
    #[arg(short = 'e', long, default_value = "*")]
    pub experiments: String,

    /// Raster bin size in ms.
    #[arg(short = 'b', long, default_value_t = 30)]
    pub bin_size: u32,

    /// Smallest hidden-state count.
    #[arg(long, default_value_t = 10)]
    pub states_min: u32,

    /// Largest hidden-state count (inclusive).
    #[arg(long, default_value_t = 20)]
    pub states_max: u32,

    /// `real`, `shuffle` or `circshift`.
    #[arg(long, default_value = "real")]
    pub surrogate: Surrogate,

    /// Fitting library.
    #[arg(long, value_enum, default_value_t = Library::Default)]
    pub library: Library,
}

#[derive(Debug, Clone, Args)]
pub struct WorkerArgs {
    /// Seconds to sleep when the queue is empty.
    #[arg(long, default_value_t = 5.0)]
    pub poll: f64,

    /// Stop after this many jobs.
    #[arg(long)]
    pub max_jobs: Option<usize>,

    /// Exit as soon as the queue is empty instead of polling.
    #[arg(long)]
    pub exit_when_empty: bool,

    /// Base seed for reproducible fits (combined with key and attempt).
    #[arg(long)]
    pub seed: Option<u64>,

    /// Maximum EM iterations per fit.
    #[arg(long, default_value_t = 200)]
    pub max_iter: usize,
}

#[derive(Debug, Clone, Args)]
pub struct EnqueueArgs {
    #[command(flatten)]
    pub keys: KeyArgs,

    /// Log every EM iteration in the worker that fits these jobs.
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/// How a sweep obtains models that are not cached yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SweepMode {
    /// Only use cached models; report the rest as missing.
    Cached,
    /// Fit missing models in this process on a thread pool.
    Compute,
    /// Enqueue missing models for workers and poll the cache.
    Queue,
}

#[derive(Debug, Clone, Args)]
pub struct SweepArgs {
    #[command(flatten)]
    pub keys: KeyArgs,

    #[arg(long, value_enum, default_value_t = SweepMode::Cached)]
    pub mode: SweepMode,

    /// Thread pool size for `--mode compute`.
    #[arg(short = 'j', long, default_value_t = 4)]
    pub jobs: usize,

    /// Seconds to wait for workers in `--mode queue` (0 = do not wait).
    #[arg(long, default_value_t = 0.0)]
    pub wait: f64,

    /// Seconds between cache polls while waiting.
    #[arg(long, default_value_t = 5.0)]
    pub poll: f64,

    /// Burst threshold in multiples of the population-count RMS.
    #[arg(long, default_value_t = 4.0)]
    pub burst_rms: f64,

    /// Bins before each burst peak in the entropy window.
    #[arg(long, default_value_t = 10)]
    pub margin_before: usize,

    /// Bins after each burst peak in the entropy window.
    #[arg(long, default_value_t = 20)]
    pub margin_after: usize,

    /// Export entropy profiles to CSV.
    #[arg(long)]
    pub export: Option<PathBuf>,

    #[arg(short = 'v', long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Args)]
pub struct ReclaimArgs {
    /// Reclaim leases older than this many minutes.
    #[arg(long, default_value_t = 60)]
    pub older_than_min: i64,
}

#[derive(Debug, Clone, Args)]
pub struct ShowArgs {
    #[arg(short = 's', long, default_value = "A")]
    pub source: String,

    #[arg(short = 'e', long)]
    pub experiment: String,

    #[arg(short = 'b', long, default_value_t = 30)]
    pub bin_size: u32,

    #[arg(short = 'k', long)]
    pub n_states: u32,

    #[arg(long, default_value = "real")]
    pub surrogate: Surrogate,

    #[arg(long, value_enum, default_value_t = Library::Default)]
    pub library: Library,
}

#[derive(Debug, Clone, Args)]
pub struct DemoArgs {
    #[arg(short = 's', long, default_value = "A")]
    pub source: String,

    /// Experiment names to generate.
    #[arg(short = 'e', long, value_delimiter = ',', default_value = "e1,e2")]
    pub experiments: Vec<String>,

    #[arg(long, default_value_t = 12)]
    pub units: usize,

    /// Recording length in seconds.
    #[arg(long, default_value_t = 30.0)]
    pub duration: f64,

    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_defaults() {
        let cli = Cli::parse_from(["hmmc", "sweep"]);
        let Command::Sweep(args) = cli.command else {
            panic!("expected sweep");
        };
        assert_eq!(args.keys.bin_size, 30);
        assert_eq!((args.keys.states_min, args.keys.states_max), (10, 20));
        assert_eq!(args.keys.surrogate, Surrogate::Real);
        assert_eq!(args.keys.library, Library::Default);
        assert_eq!(args.mode, SweepMode::Cached);
        assert_eq!(cli.log_level, tracing::Level::INFO);
    }

    #[test]
    fn global_dirs_after_subcommand() {
        let cli = Cli::parse_from([
            "hmmc",
            "worker",
            "--cache-dir",
            "/tmp/c",
            "--max-attempts",
            "5",
            "--exit-when-empty",
        ]);
        assert_eq!(cli.dirs.cache_dir, Some(PathBuf::from("/tmp/c")));
        assert_eq!(cli.dirs.max_attempts, Some(5));
        assert!(matches!(cli.command, Command::Worker(ref w) if w.exit_when_empty));
    }

    #[test]
    fn surrogate_and_library_parse() {
        let cli = Cli::parse_from(["hmmc", "enqueue", "--surrogate", "shuffle", "--library", "viterbi", "-v"]);
        let Command::Enqueue(args) = cli.command else {
            panic!("expected enqueue");
        };
        assert_eq!(args.keys.surrogate, Surrogate::Named("shuffle".into()));
        assert_eq!(args.keys.library, Library::Viterbi);
        assert!(args.verbose);
    }

    #[test]
    fn demo_experiment_list() {
        let cli = Cli::parse_from(["hmmc", "demo", "-e", "x1,x2,x3"]);
        let Command::Demo(args) = cli.command else {
            panic!("expected demo");
        };
        assert_eq!(args.experiments, vec!["x1", "x2", "x3"]);
    }
}
