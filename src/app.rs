//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - parses CLI arguments and resolves settings (flags, `.env`, defaults)
//! - initializes logging
//! - opens the filesystem cache and queue
//! - dispatches to the worker loop, sweeps, and status commands

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use crate::cache::{FsModelCache, ModelCache};
use crate::cli::{Command, DemoArgs, DirArgs, EnqueueArgs, KeyArgs, ReclaimArgs, ShowArgs, SweepArgs, SweepMode, WorkerArgs};
use crate::data::{BurstOptions, CsvRasterProvider, SyntheticConfig, SyntheticRasterProvider};
use crate::domain::{ModelKey, RetryPolicy};
use crate::error::AppError;
use crate::fit::{FitOptions, HmmFitter};
use crate::handle::ModelHandle;
use crate::models::EntropyOptions;
use crate::queue::{FsJobQueue, JobQueue};
use crate::worker::{Worker, WorkerLimits};

pub mod pipeline;

use pipeline::{Acquire, KeyGrid, SweepConfig};

/// Resolved storage locations and retry budget.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub cache_dir: PathBuf,
    pub queue_dir: PathBuf,
    pub data_dir: PathBuf,
    pub metrics_dir: PathBuf,
    pub policy: RetryPolicy,
}

impl Settings {
    /// Resolve each setting from its flag, then `env(NAME)`, then the default.
    pub fn resolve(flags: &DirArgs, env: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let dir = |flag: &Option<PathBuf>, name: &str, default: &str| -> PathBuf {
            flag.clone()
                .or_else(|| env(name).filter(|v| !v.trim().is_empty()).map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(default))
        };

        let max_attempts = match flags.max_attempts {
            Some(n) => n,
            None => match env("HMM_MAX_ATTEMPTS") {
                Some(raw) => raw
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| AppError::new(2, format!("Invalid HMM_MAX_ATTEMPTS '{raw}'.")))?,
                None => RetryPolicy::DEFAULT_MAX_ATTEMPTS,
            },
        };
        if max_attempts == 0 {
            return Err(AppError::new(2, "max attempts must be at least 1."));
        }

        Ok(Self {
            cache_dir: dir(&flags.cache_dir, "HMM_CACHE_DIR", ".hmm/cache"),
            queue_dir: dir(&flags.queue_dir, "HMM_QUEUE_DIR", ".hmm/queue"),
            data_dir: dir(&flags.data_dir, "HMM_DATA_DIR", "data"),
            metrics_dir: dir(&flags.metrics_dir, "HMM_METRICS_DIR", "metrics"),
            policy: RetryPolicy::new(max_attempts),
        })
    }

    /// Resolve against the process environment after loading `.env`.
    pub fn from_env(flags: &DirArgs) -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        Self::resolve(flags, |name| std::env::var(name).ok())
    }

    fn open_cache(&self) -> Result<Arc<FsModelCache>, AppError> {
        Ok(Arc::new(FsModelCache::open(&self.cache_dir)?))
    }

    fn open_queue(&self) -> Result<FsJobQueue, AppError> {
        Ok(FsJobQueue::open(&self.queue_dir, self.policy)?)
    }
}

/// Entry point for the `hmmc` binary.
pub fn run() -> Result<(), AppError> {
    let cli = crate::cli::Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::from_env(&cli.dirs)?;
    tracing::debug!(?settings, "settings resolved");

    match cli.command {
        Command::Worker(args) => handle_worker(&settings, args),
        Command::Enqueue(args) => handle_enqueue(&settings, args),
        Command::Sweep(args) => handle_sweep(&settings, args),
        Command::Status => handle_status(&settings),
        Command::Reclaim(args) => handle_reclaim(&settings, args),
        Command::Show(args) => handle_show(&settings, args),
        Command::Demo(args) => handle_demo(&settings, args),
    }
}

fn handle_worker(settings: &Settings, args: WorkerArgs) -> Result<(), AppError> {
    let cache = settings.open_cache()?;
    let queue = settings.open_queue()?;
    let provider = CsvRasterProvider::new(&settings.data_dir);
    let fitter = HmmFitter::new(FitOptions {
        max_iter: args.max_iter,
        seed: args.seed,
        ..FitOptions::default()
    });

    let summary = Worker::new(&queue, cache.as_ref(), &fitter, &provider)
        .with_poll_interval(seconds(args.poll, "--poll")?)
        .run(WorkerLimits {
            max_jobs: args.max_jobs,
            exit_when_empty: args.exit_when_empty,
        });
    println!("{}", crate::report::format_worker_summary(&summary));
    Ok(())
}

fn handle_enqueue(settings: &Settings, args: EnqueueArgs) -> Result<(), AppError> {
    let handle = model_handle(settings)?;
    let queue = settings.open_queue()?;
    let provider = CsvRasterProvider::new(&settings.data_dir);
    let grid = key_grid(&args.keys)?;

    let (keys, ids) = pipeline::enqueue_sweep(&provider, &handle, &queue, &grid, args.verbose)?;
    println!(
        "Enqueued {} of {} models ({} already cached).",
        ids.len(),
        keys.len(),
        keys.len() - ids.len()
    );
    Ok(())
}

fn handle_sweep(settings: &Settings, args: SweepArgs) -> Result<(), AppError> {
    let handle = model_handle(settings)?.with_verbose(args.verbose);
    let provider = CsvRasterProvider::new(&settings.data_dir);

    let acquire = match args.mode {
        SweepMode::Cached => Acquire::CachedOnly,
        SweepMode::Compute => Acquire::Compute { jobs: args.jobs.max(1) },
        SweepMode::Queue => Acquire::Queue {
            wait: seconds(args.wait, "--wait")?,
            poll: seconds(args.poll, "--poll")?,
        },
    };
    let queue = match args.mode {
        SweepMode::Queue => Some(settings.open_queue()?),
        _ => None,
    };
    if !(args.burst_rms.is_finite() && args.burst_rms > 0.0) {
        return Err(AppError::new(2, "--burst-rms must be > 0."));
    }

    let config = SweepConfig {
        grid: key_grid(&args.keys)?,
        acquire,
        entropy: EntropyOptions {
            bursts: BurstOptions {
                rms_factor: args.burst_rms,
                margins: (-(args.margin_before as isize), args.margin_after as isize),
            },
            ..EntropyOptions::default()
        },
        metrics_dir: settings.metrics_dir.clone(),
        verbose: args.verbose,
    };

    let out = pipeline::run_sweep(
        &config,
        &provider,
        &handle,
        queue.as_ref().map(|q| q as &dyn JobQueue),
    )?;
    print!("{}", crate::report::format_sweep_summary(&out.summaries));
    if !out.enqueued.is_empty() {
        println!("Enqueued {} missing models.", out.enqueued.len());
    }

    if let Some(path) = &args.export {
        let rows: Vec<_> = out.profiles.iter().map(|p| p.as_row()).collect();
        crate::io::export::write_entropy_csv(path, &rows)?;
        println!("Wrote {} entropy profiles to {}", rows.len(), path.display());
    }
    Ok(())
}

fn handle_status(settings: &Settings) -> Result<(), AppError> {
    let queue = settings.open_queue()?;
    let cache = settings.open_cache()?;

    let snapshot = queue.snapshot()?;
    print!("{}", crate::report::format_queue_status(&snapshot, queue.policy()));
    println!("Cache: {} models in {}", cache.keys()?.len(), cache.root().display());
    Ok(())
}

fn handle_reclaim(settings: &Settings, args: ReclaimArgs) -> Result<(), AppError> {
    if args.older_than_min < 0 {
        return Err(AppError::new(2, "--older-than-min must be >= 0."));
    }
    let queue = settings.open_queue()?;
    let n = queue.reclaim_stale(chrono::Duration::minutes(args.older_than_min))?;
    println!("Reclaimed {n} stale leases.");
    Ok(())
}

fn handle_show(settings: &Settings, args: ShowArgs) -> Result<(), AppError> {
    let key = ModelKey::new(
        args.source,
        args.experiment,
        args.bin_size,
        args.n_states,
        args.surrogate,
        args.library,
    )?;
    let handle = model_handle(settings)?;
    match handle.get_or_none(&key) {
        Some(model) => {
            print!("{}", crate::report::format_model(&model));
            Ok(())
        }
        None => Err(AppError::new(
            3,
            crate::report::format_missing_model(key.experiment(), key.n_states()),
        )),
    }
}

fn handle_demo(settings: &Settings, args: DemoArgs) -> Result<(), AppError> {
    let provider = SyntheticRasterProvider::new(SyntheticConfig {
        experiments: args.experiments.clone(),
        n_units: args.units,
        duration_ms: args.duration * 1000.0,
        seed: args.seed,
        ..SyntheticConfig::default()
    })?;
    let csv = CsvRasterProvider::new(&settings.data_dir);

    for exp in &args.experiments {
        let spikes = provider.spikes(&args.source, exp)?;
        let path = csv.path_for(&args.source, exp)?;
        crate::io::export::write_spike_csv(&path, &spikes)?;
        println!("Wrote {} spikes to {}", spikes.len(), path.display());
    }
    Ok(())
}

fn model_handle(settings: &Settings) -> Result<ModelHandle, AppError> {
    let cache = settings.open_cache()?;
    let fitter = HmmFitter::new(FitOptions::default());
    Ok(ModelHandle::new(cache, Arc::new(fitter), settings.policy))
}

fn key_grid(args: &KeyArgs) -> Result<KeyGrid, AppError> {
    if args.states_min > args.states_max {
        return Err(AppError::new(
            2,
            format!("--states-min ({}) exceeds --states-max ({}).", args.states_min, args.states_max),
        ));
    }
    Ok(KeyGrid {
        source: args.source.clone(),
        experiments: args.experiments.clone(),
        bin_size_ms: args.bin_size,
        states: (args.states_min..=args.states_max).collect(),
        surrogate: args.surrogate.clone(),
        library: args.library,
    })
}

fn seconds(value: f64, flag: &str) -> Result<Duration, AppError> {
    if !(value.is_finite() && value >= 0.0) {
        return Err(AppError::new(2, format!("{flag} must be a non-negative number of seconds.")));
    }
    Ok(Duration::from_secs_f64(value))
}
