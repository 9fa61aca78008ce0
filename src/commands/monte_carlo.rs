use crate::monte_carlo::{
    read_trade_returns, simulate, write_report, MonteCarloConfig, MONTE_CARLO_FILE,
};
use anyhow::{Context, Result};
use log::info;
use std::fs;
use std::path::Path;

pub fn run(returns_path: &Path, output_dir: &Path, config: &MonteCarloConfig) -> Result<()> {
    let returns = read_trade_returns(returns_path)?;
    info!(
        "Resampling {} trade return(s) from {}",
        returns.len(),
        returns_path.display()
    );
    let report = simulate(&returns, config)?;

    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;
    let path = output_dir.join(MONTE_CARLO_FILE);
    write_report(&path, &report)?;
    info!(
        "5th/50th/95th percentile final equity: {:.2} / {:.2} / {:.2}; written to {}",
        report.final_equity_p5,
        report.final_equity_p50,
        report.final_equity_p95,
        path.display()
    );
    Ok(())
}
