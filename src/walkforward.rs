use crate::backtester::{BacktestEngine, BacktestRequest};
use crate::checkpoint::FileCheckpointStore;
use crate::config::{years_to_months, WalkForwardConfig, WalkForwardSettings};
use crate::data_context::PriceStore;
use crate::error::OptimizerError;
use crate::models::{TaggedTransaction, Window, WindowResult};
use crate::optimizer::GridOptimizer;
use crate::stitcher::{self, read_transactions, StitchedResult};
use anyhow::{Context, Result};
use chrono::{Months, NaiveDate};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

/// Slide a fixed IS/OOS frame across the configured span.
///
/// Both halves are half-open: IS covers `[is_start, is_end)` and OOS covers
/// `[oos_start, oos_end)` with `oos_start == is_end`. A window is emitted only
/// when its OOS end stays on or before the total end date. Window `k` starts
/// `k` slides after the total start date, so month-end starts do not drift.
pub fn generate_windows(settings: &WalkForwardSettings) -> Result<Vec<Window>> {
    let in_sample = settings.in_sample_span();
    let out_of_sample = settings.out_of_sample_span();
    let slide_months = settings.slide_months();
    if slide_months == 0 {
        let reason = "slide size resolves to zero months".to_string();
        return Err(OptimizerError::Window(reason).into());
    }

    let mut windows = Vec::new();
    for k in 0u32.. {
        let Some(cursor) = k
            .checked_mul(slide_months)
            .and_then(|months| settings.start_date.checked_add_months(Months::new(months)))
        else {
            break;
        };
        let Some(is_end) = cursor.checked_add_months(in_sample) else {
            break;
        };
        let Some(oos_end) = is_end.checked_add_months(out_of_sample) else {
            break;
        };
        if oos_end > settings.end_date {
            break;
        }
        windows.push(Window {
            id: windows.len() as u32 + 1,
            is_start: cursor,
            is_end,
            oos_start: is_end,
            oos_end,
        });
    }

    if windows.is_empty() {
        let window_months = years_to_months(settings.in_sample_years)
            + years_to_months(settings.out_of_sample_years);
        return Err(OptimizerError::Window(format!(
            "{} to {} is too short for one {}-month window",
            settings.start_date, settings.end_date, window_months
        ))
        .into());
    }
    Ok(windows)
}

#[derive(Debug)]
pub struct WalkForwardOutcome {
    pub windows: Vec<Window>,
    pub results: Vec<WindowResult>,
    pub failures: Vec<(u32, String)>,
    pub stitched: StitchedResult,
}

/// Nested optimise-then-test cycle over every window, followed by stitching.
pub struct WalkForwardOptimizer<'a> {
    engine: &'a dyn BacktestEngine,
    prices: &'a dyn PriceStore,
    show_progress: bool,
}

impl<'a> WalkForwardOptimizer<'a> {
    pub fn new(engine: &'a dyn BacktestEngine, prices: &'a dyn PriceStore) -> Self {
        Self {
            engine,
            prices,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn run(&self, config: &WalkForwardConfig, output_dir: &Path) -> Result<WalkForwardOutcome> {
        let windows = generate_windows(&config.schedule)?;
        info!(
            "Walk-forward over {} window(s) from {} to {} (selection metric: {})",
            windows.len(),
            config.schedule.start_date,
            config.schedule.end_date,
            config.schedule.selection_metric.column()
        );
        fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;

        let mut results = Vec::new();
        let mut failures = Vec::new();
        for window in &windows {
            info!(
                "Window {}: IS {} to {}, OOS {} to {}",
                window.id, window.is_start, window.is_end, window.oos_start, window.oos_end
            );
            match self.run_window(config, window, output_dir) {
                Ok(result) => {
                    info!(
                        "Window {} selected [{}] ({} = {:.4}); OOS return {:.2}% over {} fill(s)",
                        window.id,
                        result.selected.signature(),
                        config.schedule.selection_metric.column(),
                        result.selection_value,
                        result.oos_metrics.total_return * 100.0,
                        result.transactions.len()
                    );
                    results.push(result);
                }
                Err(err) => {
                    warn!("Skipping window {}: {}", window.id, err);
                    failures.push((window.id, err.to_string()));
                }
            }
        }

        if results.is_empty() {
            return Err(OptimizerError::AllWindowsFailed {
                attempted: windows.len(),
            }
            .into());
        }
        if !failures.is_empty() {
            warn!(
                "{} of {} window(s) failed; stitching the remaining {}",
                failures.len(),
                windows.len(),
                results.len()
            );
        }

        let stitched = stitcher::stitch(
            &results,
            windows.len(),
            config.optimization.backtest.initial_capital,
        );
        stitcher::write_outputs(
            output_dir,
            &results,
            &stitched,
            config.schedule.selection_metric.column(),
            &config.optimization.parameter_names(),
        )?;

        Ok(WalkForwardOutcome {
            windows,
            results,
            failures,
            stitched,
        })
    }

    fn run_window(
        &self,
        config: &WalkForwardConfig,
        window: &Window,
        output_dir: &Path,
    ) -> std::result::Result<WindowResult, OptimizerError> {
        let window_dir = window_dir(output_dir, window.id);
        let optimization_dir = window_dir.join("optimization");
        let optimization_failed = |reason: String| OptimizerError::Optimization {
            window_id: window.id,
            reason,
        };
        let testing_failed = |reason: String| OptimizerError::Testing {
            window_id: window.id,
            reason,
        };

        // Engine ranges are inclusive; each half stops the day before its end.
        let is_last = last_day(window.is_end).map_err(optimization_failed)?;
        let in_sample = config
            .optimization
            .with_date_range(window.is_start, is_last);
        let mut checkpoints = FileCheckpointStore::in_dir(&optimization_dir);
        let search = GridOptimizer::new(self.engine, self.prices, &mut checkpoints)
            .with_progress(self.show_progress)
            .search(&in_sample, &optimization_dir)
            .map_err(|err| optimization_failed(format!("{:#}", err)))?;

        let metric = config.schedule.selection_metric;
        let best = search
            .summary
            .select_best(metric)
            .ok_or_else(|| optimization_failed("no valid rows to select from".to_string()))?;
        let selection_value = best.metric(metric).unwrap_or(f64::NAN);
        let selected = best.parameters.clone();
        let symbol_set = config
            .optimization
            .symbol_sets
            .iter()
            .find(|set| set.name == best.symbol_set)
            .ok_or_else(|| {
                optimization_failed(format!("selected unknown symbol set {}", best.symbol_set))
            })?;

        let oos_last = last_day(window.oos_end).map_err(testing_failed)?;
        let out_of_sample = config
            .optimization
            .with_date_range(window.oos_start, oos_last);
        let request = BacktestRequest::merge(&out_of_sample, symbol_set, &selected);
        let oos_dir = window_dir.join("oos");
        let oos_metrics = self
            .engine
            .run(&request, &oos_dir)
            .map_err(|err| testing_failed(format!("{:#}", err)))?;
        let ledger = read_transactions(&oos_metrics.trades_path)
            .map_err(|err| testing_failed(format!("{:#}", err)))?;

        let signature = selected.signature();
        let transactions = ledger
            .into_iter()
            .filter(|transaction| in_range(transaction.date, window.oos_start, window.oos_end))
            .map(|transaction| TaggedTransaction {
                window_id: window.id,
                parameters: signature.clone(),
                transaction,
            })
            .collect();

        Ok(WindowResult {
            window: *window,
            symbol_set: symbol_set.name.clone(),
            selected,
            selection_value,
            transactions,
            oos_metrics,
        })
    }
}

pub fn window_dir(output_dir: &Path, window_id: u32) -> PathBuf {
    output_dir.join(format!("window_{:02}", window_id))
}

/// Half-open `[start, end)`.
fn in_range(date: NaiveDate, start: NaiveDate, end: NaiveDate) -> bool {
    date >= start && date < end
}

fn last_day(exclusive_end: NaiveDate) -> std::result::Result<NaiveDate, String> {
    exclusive_end
        .pred_opt()
        .ok_or_else(|| format!("no day precedes {}", exclusive_end))
}
