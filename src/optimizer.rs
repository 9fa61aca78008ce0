use crate::backtester::{BacktestEngine, BacktestRequest};
use crate::baseline::{calculate_baseline, BaselineResult};
use crate::checkpoint::CheckpointStore;
use crate::combinations::generate_combinations;
use crate::config::OptimizationConfig;
use crate::data_context::PriceStore;
use crate::error::OptimizerError;
use crate::models::{format_run_id, RunOutcome, RunResult, RunSpecification};
use crate::optimizer_status::{OptimizerStatus, OptimizerStatusSnapshot};
use crate::summary::SummaryTable;
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

pub const PARAMETER_MAP_FILE: &str = "parameter_map.csv";
pub const SUMMARY_FILE: &str = "summary.csv";
pub const RUNS_DIR: &str = "runs";

#[derive(Debug)]
pub struct GridSearchOutcome {
    pub runs: Vec<RunResult>,
    pub baseline: Option<BaselineResult>,
    pub summary: SummaryTable,
    pub warning: Option<String>,
    pub status: OptimizerStatusSnapshot,
}

impl GridSearchOutcome {
    pub fn failed_runs(&self) -> usize {
        self.runs.iter().filter(|run| run.error().is_some()).count()
    }
}

/// Sequential grid search over every combination of one configuration.
pub struct GridOptimizer<'a> {
    engine: &'a dyn BacktestEngine,
    prices: &'a dyn PriceStore,
    checkpoints: &'a mut dyn CheckpointStore,
    status: OptimizerStatus,
    show_progress: bool,
}

impl<'a> GridOptimizer<'a> {
    pub fn new(
        engine: &'a dyn BacktestEngine,
        prices: &'a dyn PriceStore,
        checkpoints: &'a mut dyn CheckpointStore,
    ) -> Self {
        Self {
            engine,
            prices,
            checkpoints,
            status: OptimizerStatus::new(),
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Generate, execute, and summarise the full grid under `output_dir`.
    pub fn search(
        &mut self,
        config: &OptimizationConfig,
        output_dir: &Path,
    ) -> Result<GridSearchOutcome> {
        self.status.set_phase("Generating combinations");
        let combinations = generate_combinations(config);
        if combinations.runs.is_empty() {
            return Err(OptimizerError::NoRuns.into());
        }

        fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;
        write_parameter_map(
            &output_dir.join(PARAMETER_MAP_FILE),
            &combinations.runs,
            &config.parameter_names(),
        )?;

        let runs = self.execute(config, &combinations.runs, output_dir)?;

        self.status.set_phase("Calculating baseline");
        let baseline = calculate_baseline(
            self.prices,
            &config.backtest.benchmark_symbol,
            config.backtest.start_date,
            config.backtest.end_date,
            config.backtest.initial_capital,
        );

        self.status.set_phase("Writing summary");
        let summary = SummaryTable::build(&runs, baseline.as_ref(), &config.parameter_names());
        let summary_path = output_dir.join(SUMMARY_FILE);
        summary.write_csv(&summary_path)?;
        info!(
            "Summary with {} row(s) written to {}",
            summary.rows.len(),
            summary_path.display()
        );

        self.status.set_phase("Completed");
        Ok(GridSearchOutcome {
            runs,
            baseline,
            summary,
            warning: combinations.warning,
            status: self.status.snapshot(),
        })
    }

    /// Run every specification in order, skipping ids the checkpoint already holds.
    ///
    /// Skipped runs are recovered from their output directories so the result
    /// list still has one entry per specification. The checkpoint is saved
    /// every `checkpoint_interval` attempted runs, failures included, but only
    /// successful run ids are recorded in it.
    pub fn execute(
        &mut self,
        config: &OptimizationConfig,
        runs: &[RunSpecification],
        output_dir: &Path,
    ) -> Result<Vec<RunResult>> {
        if runs.is_empty() {
            return Err(OptimizerError::NoRuns.into());
        }

        let completed: HashSet<u32> = match self.checkpoints.read() {
            Ok(Some(checkpoint)) => checkpoint.completed_run_ids.into_iter().collect(),
            Ok(None) => HashSet::new(),
            Err(err) => {
                warn!("Ignoring unreadable checkpoint, starting fresh: {:#}", err);
                HashSet::new()
            }
        };
        let skipped = runs
            .iter()
            .filter(|spec| completed.contains(&spec.run_id))
            .count();
        self.status.start(runs.len(), skipped);
        self.status.set_phase("Running backtests");
        info!(
            "Running {} backtest(s) for strategy {} ({} already completed)",
            runs.len() - skipped,
            config.strategy.name,
            skipped
        );

        let pb = self.progress_bar(runs.len());
        let interval = config.checkpoint_interval.max(1);
        let mut pending = BTreeSet::new();
        let mut attempted = 0;
        let mut results = Vec::with_capacity(runs.len());

        for spec in runs {
            let run_dir = run_output_dir(output_dir, spec.run_id, runs.len());
            let request = BacktestRequest::merge(config, &spec.symbol_set, &spec.parameters);

            let outcome = if completed.contains(&spec.run_id) {
                match self.engine.recover(&request, &run_dir) {
                    Ok(metrics) => RunOutcome::Completed(metrics),
                    Err(err) => {
                        warn!(
                            "Run {} was checkpointed but its results could not be recovered: {:#}",
                            spec.run_id, err
                        );
                        RunOutcome::Failed(format!("recovery failed: {:#}", err))
                    }
                }
            } else {
                attempted += 1;
                let outcome = match self.engine.run(&request, &run_dir) {
                    Ok(metrics) => {
                        self.status.record_success(metrics.calmar_ratio);
                        pending.insert(spec.run_id);
                        RunOutcome::Completed(metrics)
                    }
                    Err(err) => {
                        self.status.record_failure();
                        warn!(
                            "Run {} ({}, {}) failed: {:#}",
                            spec.run_id,
                            spec.symbol_set.name,
                            spec.parameters.signature(),
                            err
                        );
                        RunOutcome::Failed(format!("{:#}", err))
                    }
                };
                if attempted % interval == 0 {
                    self.save_checkpoint(&mut pending);
                }
                outcome
            };

            results.push(RunResult {
                spec: spec.clone(),
                output_dir: run_dir,
                outcome,
            });
            pb.inc(1);
        }

        self.save_checkpoint(&mut pending);

        let snapshot = self.status.snapshot();
        if snapshot.failed_runs > 0 {
            pb.finish_with_message("Backtesting completed with errors");
            warn!(
                "Grid search finished with {} failed run(s) out of {}",
                snapshot.failed_runs,
                runs.len()
            );
        } else {
            pb.finish_with_message("Backtesting completed");
        }
        if let Some(best) = snapshot.best_calmar {
            info!("Best Calmar ratio this session: {:.4}", best);
        }

        if let Err(err) = self.checkpoints.clear() {
            warn!("Failed to remove checkpoint after completion: {:#}", err);
        }
        Ok(results)
    }

    fn save_checkpoint(&mut self, pending: &mut BTreeSet<u32>) {
        if pending.is_empty() {
            return;
        }
        match self.checkpoints.append(pending) {
            Ok(()) => pending.clear(),
            Err(err) => warn!(
                "Failed to save checkpoint ({} run(s) pending): {:#}",
                pending.len(),
                err
            ),
        }
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        let style = ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        pb.set_style(style);
        pb
    }
}

pub fn run_output_dir(output_dir: &Path, run_id: u32, total_runs: usize) -> PathBuf {
    output_dir
        .join(RUNS_DIR)
        .join(format_run_id(run_id, total_runs))
}

fn write_parameter_map(
    path: &Path,
    runs: &[RunSpecification],
    parameter_names: &[String],
) -> Result<()> {
    let roles: BTreeSet<&str> = runs
        .iter()
        .flat_map(|spec| spec.symbol_set.roles.keys().map(String::as_str))
        .collect();

    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut header = vec!["run_id".to_string(), "symbol_set".to_string()];
    header.extend(roles.iter().map(|role| role.to_string()));
    header.extend(parameter_names.iter().cloned());
    writer.write_record(&header)?;

    for spec in runs {
        let mut record = vec![
            format_run_id(spec.run_id, runs.len()),
            spec.symbol_set.name.clone(),
        ];
        record.extend(
            roles
                .iter()
                .map(|role| spec.symbol_set.symbol(role).unwrap_or_default().to_string()),
        );
        record.extend(parameter_names.iter().map(|name| {
            spec.parameters
                .get(name)
                .map(|value| value.to_string())
                .unwrap_or_default()
        }));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::config::BacktestSettings;
    use crate::data_context::StaticPriceStore;
    use crate::models::{BacktestMetrics, ParamValue, SymbolSet};
    use crate::strategy::describe_strategy;
    use anyhow::anyhow;
    use chrono::NaiveDate;
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    struct ScriptedEngine {
        fail_on: Vec<i64>,
        calls: RefCell<Vec<PathBuf>>,
    }

    impl ScriptedEngine {
        fn new(fail_on: Vec<i64>) -> Self {
            Self {
                fail_on,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl BacktestEngine for ScriptedEngine {
        fn run(&self, request: &BacktestRequest, output_dir: &Path) -> Result<BacktestMetrics> {
            self.calls.borrow_mut().push(output_dir.to_path_buf());
            let sma = match request.parameters.get("sma_period") {
                Some(ParamValue::Int(value)) => *value,
                _ => 0,
            };
            if self.fail_on.contains(&sma) {
                return Err(anyhow!("engine rejected sma_period={}", sma));
            }
            Ok(metrics(sma as f64 / 1000.0))
        }

        fn recover(&self, _: &BacktestRequest, _: &Path) -> Result<BacktestMetrics> {
            Ok(metrics(0.0))
        }
    }

    fn metrics(total_return: f64) -> BacktestMetrics {
        BacktestMetrics {
            final_value: 10_000.0 * (1.0 + total_return),
            total_return,
            annualized_return: total_return,
            sharpe_ratio: 1.0,
            sortino_ratio: 1.0,
            calmar_ratio: total_return * 2.0,
            max_drawdown: -0.1,
            win_rate: 0.5,
            total_trades: 4,
            trades_path: PathBuf::from("trades.csv"),
            equity_path: None,
        }
    }

    fn config(checkpoint_interval: usize) -> OptimizationConfig {
        OptimizationConfig {
            strategy: describe_strategy("leveraged_trend").unwrap(),
            symbol_sets: vec![SymbolSet {
                name: "nasdaq".to_string(),
                roles: BTreeMap::from([
                    ("signal".to_string(), "QQQ".to_string()),
                    ("bull".to_string(), "TQQQ".to_string()),
                ]),
            }],
            backtest: BacktestSettings {
                start_date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
                end_date: NaiveDate::from_ymd_opt(2021, 1, 1).unwrap(),
                initial_capital: 10_000.0,
                commission: 0.0,
                slippage: 0.0,
                benchmark_symbol: "SPY".to_string(),
                extra: BTreeMap::new(),
            },
            parameter_grid: vec![(
                "sma_period".to_string(),
                vec![
                    ParamValue::Int(100),
                    ParamValue::Int(150),
                    ParamValue::Int(200),
                    ParamValue::Int(250),
                ],
            )],
            combination_warning_threshold: 1_000,
            checkpoint_interval,
        }
    }

    #[test]
    fn failed_run_does_not_abort_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine::new(vec![150]);
        let prices = StaticPriceStore::new();
        let mut store = MemoryCheckpointStore::new();
        let outcome = GridOptimizer::new(&engine, &prices, &mut store)
            .search(&config(10), dir.path())
            .unwrap();

        assert_eq!(outcome.runs.len(), 4);
        assert_eq!(outcome.failed_runs(), 1);
        assert!(outcome.runs[1]
            .error()
            .unwrap()
            .contains("sma_period=150"));
        assert!(outcome.baseline.is_none());
        assert!(dir.path().join(SUMMARY_FILE).exists());
        assert!(dir.path().join(PARAMETER_MAP_FILE).exists());
        assert_eq!(outcome.status.failed_runs, 1);
        assert_eq!(outcome.status.completed_runs, 3);
    }

    #[test]
    fn resume_skips_checkpointed_ids() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine::new(Vec::new());
        let prices = StaticPriceStore::new();
        let mut store = MemoryCheckpointStore::with_completed([1, 2]);
        let results = {
            let mut optimizer = GridOptimizer::new(&engine, &prices, &mut store);
            let config = config(10);
            let runs = generate_combinations(&config).runs;
            optimizer.execute(&config, &runs, dir.path()).unwrap()
        };

        let calls = engine.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].ends_with("runs/0003"));
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|result| result.metrics().is_some()));
        assert!(store.read().unwrap().is_none());
    }

    #[derive(Default)]
    struct RecordingStore {
        saved: Vec<BTreeSet<u32>>,
    }

    impl CheckpointStore for RecordingStore {
        fn read(&self) -> Result<Option<crate::checkpoint::Checkpoint>> {
            Ok(None)
        }
        fn append(&mut self, run_ids: &BTreeSet<u32>) -> Result<()> {
            self.saved.push(run_ids.clone());
            Ok(())
        }
        fn clear(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn saved_batches(fail_on: Vec<i64>, checkpoint_interval: usize) -> Vec<Vec<u32>> {
        let dir = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine::new(fail_on);
        let prices = StaticPriceStore::new();
        let mut store = RecordingStore::default();
        {
            let mut optimizer = GridOptimizer::new(&engine, &prices, &mut store);
            let config = config(checkpoint_interval);
            let runs = generate_combinations(&config).runs;
            optimizer.execute(&config, &runs, dir.path()).unwrap();
        }
        store
            .saved
            .iter()
            .map(|ids| ids.iter().copied().collect())
            .collect()
    }

    #[test]
    fn checkpoint_is_written_every_interval_and_only_for_successes() {
        assert_eq!(saved_batches(vec![200], 2), vec![vec![1, 2], vec![4]]);
    }

    #[test]
    fn failed_runs_still_advance_the_checkpoint_interval() {
        // Runs 1 and 2 fail; run 3 completes the first interval of three.
        assert_eq!(saved_batches(vec![100, 150], 3), vec![vec![3], vec![4]]);
    }

    #[test]
    fn interval_of_only_failures_writes_nothing() {
        assert_eq!(saved_batches(vec![100, 150], 2), vec![vec![3, 4]]);
    }
}
