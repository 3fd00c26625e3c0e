//! storage-smoke: exercise one storage backend end to end.
//!
//! Enters a storage supplier for the configured mode, runs a small
//! deterministic study against it and prints the best trial as JSON. The
//! temporary file of file-backed modes is gone when the process exits.
//!
//! Run:
//! ```bash
//! # in-memory (default)
//! cargo run -p storage-smoke
//!
//! # relational storage behind the read cache, with heartbeats and JSON logs
//! STORAGE_MODE=cached_sqlite HEARTBEAT_INTERVAL=60 LOG_FORMAT=json \
//!   cargo run -p storage-smoke
//! ```
//!
//! Configuration: See `config.rs` for all environment variables.

mod config;

use domain::heartbeat::fail_stale_trials;
use domain::{CoreError, Distribution, FrozenTrial, StudyDirection, StudyStorage, TrialState};
use storage_testing::{StorageHandle, StorageSupplier};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const OPTIMIZERS: [&str; 3] = ["sgd", "adam", "rmsprop"];

fn main() {
    // Load and validate config first (fail fast on misconfiguration)
    let cfg = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    init_tracing(&cfg);
    info!(mode = %cfg.storage_mode, n_trials = cfg.n_trials, "starting smoke run");

    let supplier = StorageSupplier::new(cfg.storage_mode, cfg.supplier_options());
    let best = supplier.scope(|storage| run_study(storage, cfg.n_trials));
    match best {
        Ok(Ok(trial)) => {
            let report = serde_json::json!({
                "mode": cfg.storage_mode.as_str(),
                "number": trial.number,
                "value": trial.value(),
                "params": trial.external_params(),
            });
            println!("{}", report);
        }
        Ok(Err(e)) | Err(e) => {
            error!(error = %e, "smoke run failed");
            std::process::exit(1);
        }
    }
}

fn init_tracing(cfg: &config::Config) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match cfg.log_format {
        config::LogFormat::Json => {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_timer(fmt::time::SystemTime)
                        .with_writer(std::io::stderr),
                )
                .init();
        }
        config::LogFormat::Pretty => {
            registry
                .with(
                    fmt::layer()
                        .pretty()
                        .with_target(true)
                        .with_writer(std::io::stderr),
                )
                .init();
        }
    }
}

/// Grid over `x` and a cycling categorical choice; minimizes a shifted
/// parabola with a per-optimizer offset.
fn run_study(storage: &StorageHandle, n_trials: u64) -> Result<FrozenTrial, CoreError> {
    let study_name = format!("smoke-{}", storage.mode());
    let study_id = storage.create_new_study(&[StudyDirection::Minimize], Some(&study_name))?;
    storage.set_study_user_attr(study_id, "n_trials", serde_json::json!(n_trials))?;

    let x_dist = Distribution::float(-10.0, 10.0);
    let opt_dist = Distribution::categorical(
        OPTIMIZERS.iter().map(|o| serde_json::json!(o)).collect(),
    );

    for i in 0..n_trials {
        let trial_id = storage.create_new_trial(study_id, None)?;
        if let Some(heartbeat) = storage.as_heartbeat() {
            if heartbeat.is_heartbeat_enabled() {
                heartbeat.record_heartbeat(trial_id)?;
            }
        }

        let x = if n_trials > 1 {
            -10.0 + 20.0 * i as f64 / (n_trials - 1) as f64
        } else {
            0.0
        };
        let opt = (i % OPTIMIZERS.len() as u64) as f64;
        storage.set_trial_param(trial_id, "x", x, &x_dist)?;
        storage.set_trial_param(trial_id, "optimizer", opt, &opt_dist)?;

        let value = (x - 2.0).powi(2) + opt;
        for step in 0..3u64 {
            let partial = value * (3 - step) as f64;
            storage.set_trial_intermediate_value(trial_id, step, partial)?;
        }
        storage.set_trial_state_values(trial_id, TrialState::Complete, Some(&[value]))?;
        debug!(number = i, value, "trial complete");
    }

    if let Some(heartbeat) = storage.as_heartbeat() {
        let failed = fail_stale_trials(heartbeat, study_id)?;
        info!(failed = failed.len(), "checked for stale trials");
    }

    let n_complete = storage.get_n_trials(study_id, Some(&[TrialState::Complete]))?;
    info!(study = %study_name, n_complete, "study finished");
    storage.get_best_trial(study_id)
}
