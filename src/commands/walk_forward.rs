use crate::config::load_walk_forward_config;
use crate::context::AppContext;
use crate::walkforward::WalkForwardOptimizer;
use anyhow::Result;
use log::{info, warn};
use std::path::Path;

pub fn run(app: &AppContext, config_path: &Path, output_dir: &Path) -> Result<()> {
    info!(
        "Received walk-forward command for {} -> {}",
        config_path.display(),
        output_dir.display()
    );
    let config = load_walk_forward_config(config_path)?;
    let engine = app.engine()?;
    let prices = app.price_store();

    let outcome = WalkForwardOptimizer::new(&engine, prices.as_ref())
        .with_progress(true)
        .run(&config, output_dir)?;

    for (window_id, reason) in &outcome.failures {
        warn!("Window {} skipped: {}", window_id, reason);
    }
    let summary = &outcome.stitched.summary;
    info!(
        "Walk-forward complete: {}/{} window(s), {} trade(s), total return {:.2}%, CAGR {:.2}%, \
         max drawdown {:.2}%",
        summary.windows_succeeded,
        summary.windows_attempted,
        summary.total_trades,
        summary.total_return * 100.0,
        summary.annualized_return * 100.0,
        summary.max_drawdown * 100.0
    );
    Ok(())
}
