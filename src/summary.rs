use crate::baseline::BaselineResult;
use crate::config::Metric;
use crate::models::{
    format_run_id, BacktestMetrics, ParamValue, ParameterAssignment, RunOutcome, RunResult,
    BASELINE_LABEL, BASELINE_RUN_ID,
};
use anyhow::{anyhow, Context, Result};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};

pub const NOT_APPLICABLE: &str = "N/A";

const IDENTITY_COLUMNS: &[&str] = &[
    "run_id",
    "symbol_set",
    "status",
    "error",
    "output_dir",
    "equity_path",
];
const METRIC_COLUMNS: &[&str] = &[
    "final_value",
    "total_return",
    "annualized_return",
    "max_drawdown",
    "sharpe_ratio",
    "sortino_ratio",
    "calmar_ratio",
    "win_rate",
    "total_trades",
];
const ALPHA_COLUMN: &str = "alpha";
const BENCHMARK_COLUMN: &str = "benchmark_total_return";

/// Candidate rows are ordered by this metric, best first.
pub const RANKING_METRIC: Metric = Metric::CalmarRatio;

/// Candidate total return relative to the benchmark's, in decimal form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Alpha {
    Value(f64),
    NotApplicable,
}

impl Alpha {
    /// A zero (or missing) benchmark return yields `NotApplicable`, never a division.
    pub fn compute(candidate_total_return: f64, benchmark_total_return: Option<f64>) -> Self {
        match benchmark_total_return {
            Some(benchmark) if benchmark != 0.0 && benchmark.is_finite() => {
                let ratio = candidate_total_return / benchmark;
                if ratio.is_finite() {
                    Alpha::Value(ratio)
                } else {
                    Alpha::NotApplicable
                }
            }
            _ => Alpha::NotApplicable,
        }
    }

    pub fn value(self) -> Option<f64> {
        match self {
            Alpha::Value(value) => Some(value),
            Alpha::NotApplicable => None,
        }
    }

    fn parse(raw: &str) -> Self {
        raw.trim()
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .map(Alpha::Value)
            .unwrap_or(Alpha::NotApplicable)
    }
}

impl fmt::Display for Alpha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alpha::Value(value) => write!(f, "{}", value),
            Alpha::NotApplicable => write!(f, "{}", NOT_APPLICABLE),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
    Ok,
    Failed,
    Baseline,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowStatus::Ok => "ok",
            RowStatus::Failed => "failed",
            RowStatus::Baseline => "baseline",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ok" => Ok(RowStatus::Ok),
            "failed" => Ok(RowStatus::Failed),
            "baseline" => Ok(RowStatus::Baseline),
            other => Err(anyhow!("Unknown row status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RowMetrics {
    pub final_value: f64,
    pub total_return: f64,
    pub annualized_return: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub win_rate: f64,
    pub total_trades: u32,
}

impl RowMetrics {
    pub fn metric(&self, metric: Metric) -> f64 {
        match metric {
            Metric::FinalValue => self.final_value,
            Metric::TotalReturn => self.total_return,
            Metric::AnnualizedReturn => self.annualized_return,
            Metric::SharpeRatio => self.sharpe_ratio,
            Metric::SortinoRatio => self.sortino_ratio,
            Metric::CalmarRatio => self.calmar_ratio,
            Metric::MaxDrawdown => self.max_drawdown,
            Metric::WinRate => self.win_rate,
        }
    }

    fn values(&self) -> [String; 9] {
        [
            self.final_value.to_string(),
            self.total_return.to_string(),
            self.annualized_return.to_string(),
            self.max_drawdown.to_string(),
            self.sharpe_ratio.to_string(),
            self.sortino_ratio.to_string(),
            self.calmar_ratio.to_string(),
            self.win_rate.to_string(),
            self.total_trades.to_string(),
        ]
    }
}

impl From<&BacktestMetrics> for RowMetrics {
    fn from(metrics: &BacktestMetrics) -> Self {
        Self {
            final_value: metrics.final_value,
            total_return: metrics.total_return,
            annualized_return: metrics.annualized_return,
            max_drawdown: metrics.max_drawdown,
            sharpe_ratio: metrics.sharpe_ratio,
            sortino_ratio: metrics.sortino_ratio,
            calmar_ratio: metrics.calmar_ratio,
            win_rate: metrics.win_rate,
            total_trades: metrics.total_trades,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    pub run_id: u32,
    pub symbol_set: String,
    pub status: RowStatus,
    pub error: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub equity_path: Option<PathBuf>,
    pub metrics: Option<RowMetrics>,
    pub alpha: Alpha,
    pub parameters: ParameterAssignment,
}

impl SummaryRow {
    pub fn is_baseline(&self) -> bool {
        self.status == RowStatus::Baseline
    }

    /// Metric value, or `None` for placeholder rows (failed or non-finite).
    pub fn metric(&self, metric: Metric) -> Option<f64> {
        self.metrics
            .as_ref()
            .map(|metrics| metrics.metric(metric))
            .filter(|value| value.is_finite())
    }
}

/// Ranked comparison table of one grid search.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryTable {
    pub rows: Vec<SummaryRow>,
    pub parameter_names: Vec<String>,
    pub benchmark_total_return: Option<f64>,
}

impl SummaryTable {
    pub fn build(
        results: &[RunResult],
        baseline: Option<&BaselineResult>,
        parameter_names: &[String],
    ) -> Self {
        let benchmark_total_return = baseline.map(|baseline| baseline.performance.total_return);
        let mut rows = Vec::with_capacity(results.len() + 1);

        if let Some(baseline) = baseline {
            let performance = &baseline.performance;
            rows.push(SummaryRow {
                run_id: BASELINE_RUN_ID,
                symbol_set: BASELINE_LABEL.to_string(),
                status: RowStatus::Baseline,
                error: None,
                output_dir: None,
                equity_path: None,
                metrics: Some(RowMetrics {
                    final_value: performance.final_value,
                    total_return: performance.total_return,
                    annualized_return: performance.annualized_return,
                    max_drawdown: performance.max_drawdown,
                    sharpe_ratio: performance.sharpe_ratio,
                    sortino_ratio: performance.sortino_ratio,
                    calmar_ratio: performance.calmar_ratio,
                    win_rate: 0.0,
                    total_trades: 1,
                }),
                alpha: Alpha::compute(performance.total_return, benchmark_total_return),
                parameters: ParameterAssignment::default(),
            });
        }

        for result in results {
            let (status, error, metrics, equity_path) = match &result.outcome {
                RunOutcome::Completed(metrics) => (
                    RowStatus::Ok,
                    None,
                    Some(RowMetrics::from(metrics)),
                    metrics.equity_path.clone(),
                ),
                RunOutcome::Failed(error) => (RowStatus::Failed, Some(error.clone()), None, None),
            };
            let alpha = metrics
                .map(|metrics| Alpha::compute(metrics.total_return, benchmark_total_return))
                .unwrap_or(Alpha::NotApplicable);

            rows.push(SummaryRow {
                run_id: result.spec.run_id,
                symbol_set: result.spec.symbol_set.name.clone(),
                status,
                error,
                output_dir: Some(result.output_dir.clone()),
                equity_path,
                metrics,
                alpha,
                parameters: result.spec.parameters.clone(),
            });
        }

        let first_candidate = usize::from(baseline.is_some());
        rank(&mut rows[first_candidate..], RANKING_METRIC);

        Self {
            rows,
            parameter_names: parameter_names.to_vec(),
            benchmark_total_return,
        }
    }

    pub fn candidates(&self) -> impl Iterator<Item = &SummaryRow> {
        self.rows.iter().filter(|row| !row.is_baseline())
    }

    /// Best non-placeholder candidate by `metric`; ties keep the earlier run.
    pub fn select_best(&self, metric: Metric) -> Option<&SummaryRow> {
        let mut best: Option<(&SummaryRow, f64)> = None;
        for row in self.candidates() {
            let Some(value) = row.metric(metric) else {
                continue;
            };
            let score = metric.score(value);
            let better = best
                .map(|(_, best_score)| {
                    score.partial_cmp(&best_score).unwrap_or(Ordering::Equal) == Ordering::Greater
                })
                .unwrap_or(true);
            if better {
                best = Some((row, score));
            }
        }
        best.map(|(row, _)| row)
    }

    pub fn headers(&self) -> Vec<String> {
        let mut headers: Vec<String> = IDENTITY_COLUMNS
            .iter()
            .chain(METRIC_COLUMNS.iter())
            .map(|column| column.to_string())
            .collect();
        headers.push(ALPHA_COLUMN.to_string());
        if self.benchmark_total_return.is_some() {
            headers.push(BENCHMARK_COLUMN.to_string());
        }
        headers.extend(self.parameter_names.iter().cloned());
        headers
    }

    fn record(&self, row: &SummaryRow) -> Vec<String> {
        let total_runs = self.candidates().count();
        let mut record = vec![
            format_run_id(row.run_id, total_runs),
            row.symbol_set.clone(),
            row.status.as_str().to_string(),
            row.error.clone().unwrap_or_default(),
            path_field(row.output_dir.as_deref()),
            path_field(row.equity_path.as_deref()),
        ];
        match &row.metrics {
            Some(metrics) => record.extend(metrics.values()),
            None => record.extend(METRIC_COLUMNS.iter().map(|_| String::new())),
        }
        record.push(row.alpha.to_string());
        if let Some(benchmark) = self.benchmark_total_return {
            record.push(benchmark.to_string());
        }
        for name in &self.parameter_names {
            record.push(
                row.parameters
                    .get(name)
                    .map(|value| value.to_string())
                    .unwrap_or_default(),
            );
        }
        record
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        writer.write_record(self.headers())?;
        for row in &self.rows {
            writer.write_record(self.record(row))?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Load a summary previously written by [`SummaryTable::write_csv`].
    pub fn read_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("Failed to open summary {}", path.display()))?;
        let headers = reader.headers()?.clone();
        let index = |name: &str| headers.iter().position(|header| header == name);
        let required = |name: &str| {
            index(name).ok_or_else(|| anyhow!("{} is missing column {}", path.display(), name))
        };

        let run_id_idx = required("run_id")?;
        let symbol_set_idx = required("symbol_set")?;
        let status_idx = required("status")?;
        let error_idx = index("error");
        let output_dir_idx = index("output_dir");
        let equity_path_idx = index("equity_path");
        let alpha_idx = required(ALPHA_COLUMN)?;
        let metric_idx = METRIC_COLUMNS
            .iter()
            .map(|column| required(*column))
            .collect::<Result<Vec<_>>>()?;
        let benchmark_idx = index(BENCHMARK_COLUMN);
        let parameter_columns: Vec<(usize, String)> = headers
            .iter()
            .enumerate()
            .filter(|(_, header)| {
                !IDENTITY_COLUMNS.contains(header)
                    && !METRIC_COLUMNS.contains(header)
                    && *header != ALPHA_COLUMN
                    && *header != BENCHMARK_COLUMN
            })
            .map(|(idx, header)| (idx, header.to_string()))
            .collect();

        let mut rows = Vec::new();
        let mut benchmark_total_return = None;
        for (line, record) in reader.records().enumerate() {
            let record = record
                .with_context(|| format!("Malformed row {} in {}", line + 2, path.display()))?;
            let field = |idx: usize| record.get(idx).unwrap_or_default().trim();
            let optional = |idx: Option<usize>| {
                idx.map(|idx| field(idx))
                    .filter(|value| !value.is_empty())
                    .map(str::to_string)
            };

            let run_id = field(run_id_idx)
                .parse::<u32>()
                .with_context(|| format!("Invalid run id on row {}", line + 2))?;
            let status = RowStatus::parse(field(status_idx))?;
            let metrics = if status == RowStatus::Failed {
                None
            } else {
                let parse = |idx: usize| field(metric_idx[idx]).parse::<f64>().unwrap_or(f64::NAN);
                Some(RowMetrics {
                    final_value: parse(0),
                    total_return: parse(1),
                    annualized_return: parse(2),
                    max_drawdown: parse(3),
                    sharpe_ratio: parse(4),
                    sortino_ratio: parse(5),
                    calmar_ratio: parse(6),
                    win_rate: parse(7),
                    total_trades: field(metric_idx[8]).parse::<u32>().unwrap_or(0),
                })
            };
            if benchmark_total_return.is_none() {
                benchmark_total_return = benchmark_idx
                    .and_then(|idx| field(idx).parse::<f64>().ok())
                    .filter(|value| value.is_finite());
            }

            let parameters = ParameterAssignment(
                parameter_columns
                    .iter()
                    .filter(|(idx, _)| !field(*idx).is_empty())
                    .map(|(idx, name)| (name.clone(), ParamValue::from_field(field(*idx))))
                    .collect(),
            );

            rows.push(SummaryRow {
                run_id,
                symbol_set: field(symbol_set_idx).to_string(),
                status,
                error: optional(error_idx),
                output_dir: optional(output_dir_idx).map(PathBuf::from),
                equity_path: optional(equity_path_idx).map(PathBuf::from),
                metrics,
                alpha: Alpha::parse(field(alpha_idx)),
                parameters,
            });
        }

        Ok(Self {
            rows,
            parameter_names: parameter_columns.into_iter().map(|(_, name)| name).collect(),
            benchmark_total_return,
        })
    }
}

/// Best score first; placeholder rows last; equal scores by run id.
fn rank(rows: &mut [SummaryRow], metric: Metric) {
    rows.sort_by(|a, b| {
        let score = |row: &SummaryRow| row.metric(metric).map(|value| metric.score(value));
        let by_score = match (score(a), score(b)) {
            (Some(left), Some(right)) => right.partial_cmp(&left).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_score.then(a.run_id.cmp(&b.run_id))
    });
}

fn path_field(path: Option<&Path>) -> String {
    path.map(|path| path.display().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PerformanceSummary, RunSpecification, SymbolSet};
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn metrics(total_return: f64, calmar_ratio: f64) -> BacktestMetrics {
        BacktestMetrics {
            final_value: 10_000.0 * (1.0 + total_return),
            total_return,
            annualized_return: total_return / 2.0,
            sharpe_ratio: 1.0,
            sortino_ratio: 1.2,
            calmar_ratio,
            max_drawdown: -0.2,
            win_rate: 0.5,
            total_trades: 10,
            trades_path: PathBuf::from("trades.csv"),
            equity_path: Some(PathBuf::from("equity.csv")),
        }
    }

    fn result(run_id: u32, outcome: RunOutcome) -> RunResult {
        RunResult {
            spec: RunSpecification {
                run_id,
                symbol_set: SymbolSet {
                    name: "nasdaq".to_string(),
                    roles: BTreeMap::new(),
                },
                parameters: ParameterAssignment(vec![(
                    "sma_period".to_string(),
                    ParamValue::Int(100 + run_id as i64),
                )]),
            },
            output_dir: PathBuf::from(format!("runs/{:04}", run_id)),
            outcome,
        }
    }

    fn baseline(total_return: f64) -> BaselineResult {
        BaselineResult {
            symbol: "SPY".to_string(),
            start_date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2021, 1, 1).unwrap(),
            observations: 252,
            performance: PerformanceSummary {
                final_value: 10_000.0 * (1.0 + total_return),
                total_return,
                ..Default::default()
            },
        }
    }

    #[test]
    fn alpha_is_ratio_of_total_returns() {
        let results = vec![result(1, RunOutcome::Completed(metrics(0.30, 1.0)))];
        let names = vec!["sma_period".to_string()];
        let table = SummaryTable::build(&results, Some(&baseline(0.20)), &names);

        assert_eq!(table.rows.len(), 2);
        assert!(table.rows[0].is_baseline());
        assert_eq!(table.rows[0].alpha, Alpha::Value(1.0));
        let alpha = table.rows[1].alpha.value().unwrap();
        assert!((alpha - 1.5).abs() < 1e-9);
    }

    #[test]
    fn zero_benchmark_return_makes_alpha_not_applicable() {
        let results = vec![
            result(1, RunOutcome::Completed(metrics(0.30, 1.0))),
            result(2, RunOutcome::Completed(metrics(-0.10, 0.2))),
        ];
        let names = vec!["sma_period".to_string()];
        let table = SummaryTable::build(&results, Some(&baseline(0.0)), &names);
        assert!(table
            .rows
            .iter()
            .all(|row| row.alpha == Alpha::NotApplicable));
    }

    #[test]
    fn column_order_ends_with_parameters() {
        let results = vec![result(1, RunOutcome::Completed(metrics(0.1, 1.0)))];
        let names = vec!["sma_period".to_string()];

        let with_baseline = SummaryTable::build(&results, Some(&baseline(0.1)), &names);
        let headers = with_baseline.headers();
        assert_eq!(headers.first().map(String::as_str), Some("run_id"));
        assert_eq!(headers.last().map(String::as_str), Some("sma_period"));
        let alpha_pos = headers.iter().position(|h| h == "alpha").unwrap();
        let calmar_pos = headers.iter().position(|h| h == "calmar_ratio").unwrap();
        assert!(calmar_pos < alpha_pos);
        assert_eq!(headers[alpha_pos + 1], "benchmark_total_return");

        let without_baseline = SummaryTable::build(&results, None, &names);
        assert!(!without_baseline
            .headers()
            .contains(&"benchmark_total_return".to_string()));
        assert_eq!(without_baseline.rows[0].alpha, Alpha::NotApplicable);
    }

    #[test]
    fn failed_rows_keep_their_error_and_are_skipped_by_selection() {
        let results = vec![
            result(1, RunOutcome::Failed("engine crashed".to_string())),
            result(2, RunOutcome::Completed(metrics(0.1, 0.5))),
            result(3, RunOutcome::Completed(metrics(0.2, 0.9))),
            result(4, RunOutcome::Completed(metrics(0.3, f64::NAN))),
        ];
        let names = vec!["sma_period".to_string()];
        let table = SummaryTable::build(&results, Some(&baseline(0.05)), &names);

        let failed = table.rows.iter().find(|row| row.run_id == 1).unwrap();
        assert_eq!(failed.error.as_deref(), Some("engine crashed"));
        let best = table.select_best(Metric::CalmarRatio).unwrap();
        assert_eq!(best.run_id, 3);
    }

    #[test]
    fn candidates_are_ranked_by_calmar_with_placeholders_last() {
        let results = vec![
            result(1, RunOutcome::Failed("engine crashed".to_string())),
            result(2, RunOutcome::Completed(metrics(0.1, 0.5))),
            result(3, RunOutcome::Completed(metrics(0.2, 0.9))),
            result(4, RunOutcome::Completed(metrics(0.3, f64::NAN))),
            result(5, RunOutcome::Completed(metrics(0.4, 0.9))),
            result(6, RunOutcome::Completed(metrics(-0.1, -0.3))),
        ];
        let names = vec!["sma_period".to_string()];

        let table = SummaryTable::build(&results, Some(&baseline(0.05)), &names);
        let order: Vec<u32> = table.rows.iter().map(|row| row.run_id).collect();
        assert_eq!(order, vec![BASELINE_RUN_ID, 3, 5, 2, 6, 1, 4]);

        let without_baseline = SummaryTable::build(&results, None, &names);
        let order: Vec<u32> = without_baseline.rows.iter().map(|row| row.run_id).collect();
        assert_eq!(order, vec![3, 5, 2, 6, 1, 4]);
    }

    #[test]
    fn run_id_width_ignores_the_baseline_row() {
        let results: Vec<RunResult> = (1..=9_999)
            .map(|run_id| result(run_id, RunOutcome::Failed("skipped".to_string())))
            .collect();
        let table = SummaryTable::build(&results, Some(&baseline(0.1)), &[]);
        assert_eq!(table.rows.len(), 10_000);

        let first = table.rows.iter().find(|row| row.run_id == 1).unwrap();
        assert_eq!(table.record(first)[0], "0001");
        assert_eq!(table.record(&table.rows[0])[0], "0000");
    }

    #[test]
    fn csv_round_trip_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.csv");
        let results = vec![
            result(1, RunOutcome::Completed(metrics(0.25, 1.1))),
            result(2, RunOutcome::Failed("boom".to_string())),
        ];
        let names = vec!["sma_period".to_string()];
        let table = SummaryTable::build(&results, Some(&baseline(0.1)), &names);
        table.write_csv(&path).unwrap();

        let loaded = SummaryTable::read_csv(&path).unwrap();
        assert_eq!(loaded.parameter_names, names);
        assert_eq!(loaded.rows.len(), 3);
        assert_eq!(loaded.benchmark_total_return, Some(0.1));
        assert_eq!(loaded.rows[1].metrics, table.rows[1].metrics);
        assert_eq!(loaded.rows[1].parameters, table.rows[1].parameters);
        assert_eq!(loaded.rows[2].status, RowStatus::Failed);
        assert_eq!(loaded.rows[2].error.as_deref(), Some("boom"));
        assert!(loaded.rows[2].parameters.get("sma_period").is_some());
    }
}
