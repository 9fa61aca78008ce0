use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::config::{load_optimization_config, Metric};
use crate::context::AppContext;
use crate::optimizer::GridOptimizer;
use anyhow::Result;
use log::{info, warn};
use std::path::Path;

pub fn run(app: &AppContext, config_path: &Path, output_dir: &Path, fresh: bool) -> Result<()> {
    info!(
        "Received optimize command for {} -> {}",
        config_path.display(),
        output_dir.display()
    );
    let config = load_optimization_config(config_path)?;
    let engine = app.engine()?;
    let prices = app.price_store();
    if let Some(dir) = app.data_dir() {
        info!("Benchmark prices read from {}", dir.display());
    }

    let mut checkpoints = FileCheckpointStore::in_dir(output_dir);
    if fresh {
        info!("--fresh given; discarding {}", checkpoints.path().display());
        checkpoints.clear()?;
    }

    let outcome = GridOptimizer::new(&engine, prices.as_ref(), &mut checkpoints)
        .with_progress(true)
        .search(&config, output_dir)?;

    if let Some(warning) = &outcome.warning {
        warn!("{}", warning);
    }
    let failed = outcome.failed_runs();
    info!(
        "Grid search finished: {} run(s), {} failed, {} skipped via checkpoint",
        outcome.runs.len(),
        failed,
        outcome.status.skipped_runs
    );
    if let Some(best) = outcome.summary.select_best(Metric::CalmarRatio) {
        info!(
            "Best Calmar: run {} on {} [{}]",
            best.run_id,
            best.symbol_set,
            best.parameters.signature()
        );
    }
    Ok(())
}
