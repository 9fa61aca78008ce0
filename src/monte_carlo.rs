use crate::performance::PerformanceCalculator;
use crate::stitcher::TradeReturnRow;
use anyhow::{anyhow, Context, Result};
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::path::Path;

pub const MONTE_CARLO_FILE: &str = "monte_carlo.json";
pub const DEFAULT_SIMULATIONS: usize = 1_000;
pub const DEFAULT_SEED: u64 = 42;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MonteCarloConfig {
    pub simulations: usize,
    pub seed: u64,
    pub initial_capital: f64,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            simulations: DEFAULT_SIMULATIONS,
            seed: DEFAULT_SEED,
            initial_capital: 10_000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonteCarloReport {
    pub config: MonteCarloConfig,
    pub trades: usize,
    pub final_equity_p5: f64,
    pub final_equity_p50: f64,
    pub final_equity_p95: f64,
    pub median_max_drawdown: f64,
    /// Drawdown exceeded by only 5% of paths (a negative fraction).
    pub max_drawdown_p95: f64,
    pub probability_of_loss: f64,
}

pub fn read_trade_returns(path: &Path) -> Result<Vec<f64>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open trade returns {}", path.display()))?;
    let mut returns = Vec::new();
    for row in reader.deserialize::<TradeReturnRow>() {
        let row = row.with_context(|| format!("Malformed row in {}", path.display()))?;
        returns.push(row.trade_return);
    }
    Ok(returns)
}

/// Bootstrap the trade sequence with replacement, compounding each path.
pub fn simulate(returns: &[f64], config: &MonteCarloConfig) -> Result<MonteCarloReport> {
    if returns.is_empty() {
        return Err(anyhow!("no trade returns to resample"));
    }
    if config.simulations == 0 {
        return Err(anyhow!("simulation count must be positive"));
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut finals = Vec::with_capacity(config.simulations);
    let mut drawdowns = Vec::with_capacity(config.simulations);
    let mut path = Vec::with_capacity(returns.len() + 1);

    for _ in 0..config.simulations {
        path.clear();
        let mut equity = config.initial_capital;
        path.push(equity);
        for _ in 0..returns.len() {
            equity *= 1.0 + returns[rng.gen_range(0..returns.len())];
            path.push(equity);
        }
        finals.push(equity);
        drawdowns.push(PerformanceCalculator::max_drawdown_of(path.iter().copied()));
    }

    let losses = finals
        .iter()
        .filter(|value| **value < config.initial_capital)
        .count();
    let percentile = |values: &[f64], pct: f64| {
        PerformanceCalculator::percentile(values, pct).unwrap_or(f64::NAN)
    };
    let report = MonteCarloReport {
        config: *config,
        trades: returns.len(),
        final_equity_p5: percentile(&finals, 5.0),
        final_equity_p50: percentile(&finals, 50.0),
        final_equity_p95: percentile(&finals, 95.0),
        median_max_drawdown: percentile(&drawdowns, 50.0),
        max_drawdown_p95: percentile(&drawdowns, 5.0),
        probability_of_loss: losses as f64 / config.simulations as f64,
    };
    info!(
        "Monte Carlo over {} path(s) of {} trade(s): median final equity {:.2}, P(loss) {:.1}%",
        config.simulations,
        returns.len(),
        report.final_equity_p50,
        report.probability_of_loss * 100.0
    );
    Ok(report)
}

pub fn write_report(path: &Path, report: &MonteCarloReport) -> Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(report)?)
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_reproduces_the_report() {
        let returns = [0.05, -0.02, 0.03, -0.04, 0.01];
        let config = MonteCarloConfig {
            simulations: 200,
            ..Default::default()
        };
        let first = simulate(&returns, &config).unwrap();
        let second = simulate(&returns, &config).unwrap();
        assert_eq!(first, second);
        assert!(first.final_equity_p5 <= first.final_equity_p50);
        assert!(first.final_equity_p50 <= first.final_equity_p95);
        assert!(first.max_drawdown_p95 <= first.median_max_drawdown);
    }

    #[test]
    fn all_winning_trades_never_lose() {
        let config = MonteCarloConfig {
            simulations: 50,
            ..Default::default()
        };
        let report = simulate(&[0.01, 0.02], &config).unwrap();
        assert_eq!(report.probability_of_loss, 0.0);
        assert_eq!(report.median_max_drawdown, 0.0);
        assert!(report.final_equity_p5 > config.initial_capital);
    }

    #[test]
    fn empty_feed_is_an_error() {
        assert!(simulate(&[], &MonteCarloConfig::default()).is_err());
    }

    #[test]
    fn reads_walk_forward_return_feed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wf_trade_returns.csv");
        std::fs::write(
            &path,
            "sequence,exit_date,window_id,trade_return\n\
             1,2020-01-10,1,0.02\n\
             2,2020-02-10,1,-0.01\n",
        )
        .unwrap();
        assert_eq!(read_trade_returns(&path).unwrap(), vec![0.02, -0.01]);
    }
}
