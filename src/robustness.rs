use crate::config::Metric;
use crate::models::ParameterAssignment;
use crate::param_utils::{is_neighbor, resolve_plateau_parameters};
use crate::performance::PerformanceCalculator;
use crate::strategy::PlateauParameter;
use crate::summary::{RowStatus, SummaryRow, SummaryTable};
use crate::verdict::{classify, Verdict, VerdictInputs};
use anyhow::{anyhow, Context, Result};
use chrono::{Datelike, NaiveDate};
use log::{info, warn};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

pub const ROBUSTNESS_FILE: &str = "robustness_summary.csv";
pub const DEFAULT_PERCENTILE: f64 = 80.0;
pub const DEFAULT_BENCHMARK_ANNUAL_RETURN: f64 = 0.10;
pub const PLATEAU_PASS_SCORE: f64 = 70.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StressWindow {
    pub label: &'static str,
    pub start: (i32, u32, u32),
    pub end: (i32, u32, u32),
    /// Passes when the window return is strictly above this.
    pub threshold: f64,
}

impl StressWindow {
    fn start_date(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.start.0, self.start.1, self.start.2)
    }

    fn end_date(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.end.0, self.end.1, self.end.2)
    }
}

pub const STRESS_WINDOWS: [StressWindow; 3] = [
    StressWindow {
        label: "stress_2018_volmageddon",
        start: (2018, 1, 26),
        end: (2018, 2, 9),
        threshold: -0.15,
    },
    StressWindow {
        label: "stress_2020_crash",
        start: (2020, 2, 19),
        end: (2020, 3, 23),
        threshold: -0.30,
    },
    StressWindow {
        label: "stress_2022_bear",
        start: (2022, 1, 3),
        end: (2022, 10, 12),
        threshold: -0.25,
    },
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalyzerOptions {
    pub metric: Metric,
    pub percentile: f64,
    pub benchmark_annual_return: f64,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        Self {
            metric: Metric::CalmarRatio,
            percentile: DEFAULT_PERCENTILE,
            benchmark_annual_return: DEFAULT_BENCHMARK_ANNUAL_RETURN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlateauBasis {
    Neighbors,
    Fallback,
}

impl PlateauBasis {
    pub fn as_str(self) -> &'static str {
        match self {
            PlateauBasis::Neighbors => "neighbors",
            PlateauBasis::Fallback => "fallback",
        }
    }
}

/// Retained rows sharing one parameter assignment, across symbol sets.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub id: usize,
    pub parameters: ParameterAssignment,
    pub members: Vec<SummaryRow>,
    pub mean_return: f64,
    pub mean_drawdown: f64,
    pub plateau_score: f64,
    pub plateau_basis: PlateauBasis,
}

impl Cluster {
    /// Member with the highest Sharpe ratio; the earliest wins ties.
    pub fn representative(&self) -> Option<&SummaryRow> {
        let mut best: Option<&SummaryRow> = None;
        for member in &self.members {
            let sharpe = member.metric(Metric::SharpeRatio).unwrap_or(f64::NEG_INFINITY);
            let current = best
                .and_then(|row| row.metric(Metric::SharpeRatio))
                .unwrap_or(f64::NEG_INFINITY);
            if best.is_none() || sharpe > current {
                best = Some(member);
            }
        }
        best
    }

    pub fn plateau_pass(&self) -> bool {
        self.plateau_score >= PLATEAU_PASS_SCORE
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageA {
    pub threshold: f64,
    pub retained: usize,
    pub clusters: Vec<Cluster>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StressResult {
    pub window: StressWindow,
    /// `None` when the equity series has no observation inside the window.
    pub window_return: Option<f64>,
    pub observed_days: usize,
}

impl StressResult {
    pub fn passed(&self) -> bool {
        self.window_return
            .map(|value| value > self.window.threshold)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EquityScan {
    pub stress: Vec<StressResult>,
    pub years_observed: usize,
    pub years_beating_benchmark: usize,
}

impl EquityScan {
    pub fn stress_pass(&self) -> bool {
        self.stress.iter().all(StressResult::passed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterReport {
    pub cluster: Cluster,
    pub representative_run_id: u32,
    pub representative_symbol_set: String,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub alpha: Option<f64>,
    pub scan: EquityScan,
    pub verdict: Verdict,
}

/// Percentile filter and parameter clustering over the candidate rows.
pub fn stage_a(
    table: &SummaryTable,
    declared_plateau: &[PlateauParameter],
    options: &AnalyzerOptions,
) -> Result<StageA> {
    let population: Vec<&SummaryRow> = table
        .candidates()
        .filter(|row| row.status == RowStatus::Ok)
        .collect();
    let values: Vec<f64> = population
        .iter()
        .filter_map(|row| row.metric(options.metric))
        .map(|value| options.metric.score(value))
        .collect();
    let threshold = PerformanceCalculator::percentile(&values, options.percentile)
        .ok_or_else(|| anyhow!("no successful runs with a finite {}", options.metric.column()))?;

    let retained: Vec<&SummaryRow> = population
        .iter()
        .copied()
        .filter(|row| {
            row.metric(options.metric)
                .map(|value| options.metric.score(value) >= threshold)
                .unwrap_or(false)
        })
        .collect();
    info!(
        "Stage A: {} of {} run(s) at or above the {:.0}th percentile of {} ({:.4})",
        retained.len(),
        population.len(),
        options.percentile,
        options.metric.column(),
        threshold
    );

    let bands = resolve_plateau_parameters(declared_plateau, &table.parameter_names);
    if bands.is_none() {
        warn!("No plateau parameters found in the grid; plateau scores fall back to 100");
    }

    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<SummaryRow>> = HashMap::new();
    for row in &retained {
        let signature = row.parameters.signature();
        if !groups.contains_key(&signature) {
            order.push(signature.clone());
        }
        groups.entry(signature).or_default().push((*row).clone());
    }

    let mut clusters = Vec::with_capacity(order.len());
    for (idx, signature) in order.iter().enumerate() {
        let Some(members) = groups.remove(signature) else {
            continue;
        };
        let returns: Vec<f64> = members
            .iter()
            .filter_map(|row| row.metric(Metric::TotalReturn))
            .collect();
        let drawdowns: Vec<f64> = members
            .iter()
            .filter_map(|row| row.metric(Metric::MaxDrawdown))
            .collect();
        let mean_return = PerformanceCalculator::average(&returns);
        let (plateau_score, plateau_basis) = match &bands {
            Some(bands) => (
                plateau_score(&members, &population, bands, mean_return),
                PlateauBasis::Neighbors,
            ),
            None => (100.0, PlateauBasis::Fallback),
        };

        clusters.push(Cluster {
            id: idx + 1,
            parameters: members[0].parameters.clone(),
            mean_return,
            mean_drawdown: PerformanceCalculator::average(&drawdowns),
            plateau_score,
            plateau_basis,
            members,
        });
    }

    Ok(StageA {
        threshold,
        retained: retained.len(),
        clusters,
    })
}

/// 100 x neighbor mean return / cluster mean return, clamped to [0, 100].
fn plateau_score(
    members: &[SummaryRow],
    population: &[&SummaryRow],
    bands: &[PlateauParameter],
    cluster_mean: f64,
) -> f64 {
    if cluster_mean <= 0.0 || !cluster_mean.is_finite() {
        return 0.0;
    }

    let member_means: Vec<f64> = members
        .iter()
        .map(|member| {
            let neighbors: Vec<f64> = population
                .iter()
                .filter(|row| row.run_id != member.run_id)
                .filter(|row| is_neighbor(&member.parameters, &row.parameters, bands))
                .filter_map(|row| row.metric(Metric::TotalReturn))
                .collect();
            if neighbors.is_empty() {
                member.metric(Metric::TotalReturn).unwrap_or(0.0)
            } else {
                PerformanceCalculator::average(&neighbors)
            }
        })
        .collect();
    let neighbor_mean = PerformanceCalculator::average(&member_means);

    (100.0 * neighbor_mean / cluster_mean).clamp(0.0, 100.0)
}

/// Stream a `date,value` equity file once, computing stress returns and the
/// yearly benchmark count without holding the series in memory.
pub fn scan_equity(path: &Path, benchmark_annual_return: f64) -> Result<EquityScan> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open equity series {}", path.display()))?;
    let headers = reader.headers()?.clone();
    let date_idx = headers
        .iter()
        .position(|header| header.eq_ignore_ascii_case("date"))
        .ok_or_else(|| anyhow!("{} has no date column", path.display()))?;
    let value_idx = headers
        .iter()
        .position(|header| {
            header.eq_ignore_ascii_case("value") || header.eq_ignore_ascii_case("equity")
        })
        .ok_or_else(|| anyhow!("{} has no value column", path.display()))?;

    let windows: Vec<(StressWindow, NaiveDate, NaiveDate)> = STRESS_WINDOWS
        .iter()
        .filter_map(|window| Some((*window, window.start_date()?, window.end_date()?)))
        .collect();
    let mut first_in_window: Vec<Option<f64>> = vec![None; windows.len()];
    let mut last_in_window: Vec<Option<f64>> = vec![None; windows.len()];
    let mut days_in_window = vec![0usize; windows.len()];

    let mut year_bounds: BTreeMap<i32, (f64, f64)> = BTreeMap::new();

    let mut record = csv::StringRecord::new();
    while reader.read_record(&mut record)? {
        let raw_date = record.get(date_idx).unwrap_or_default().trim();
        let Ok(date) = NaiveDate::parse_from_str(raw_date, "%Y-%m-%d") else {
            warn!("Skipping equity row with unparseable date '{}'", raw_date);
            continue;
        };
        let Some(value) = record
            .get(value_idx)
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .filter(|value| value.is_finite())
        else {
            continue;
        };

        for (idx, (_, start, end)) in windows.iter().enumerate() {
            if date >= *start && date <= *end {
                first_in_window[idx].get_or_insert(value);
                last_in_window[idx] = Some(value);
                days_in_window[idx] += 1;
            }
        }
        year_bounds
            .entry(date.year())
            .and_modify(|(_, last)| *last = value)
            .or_insert((value, value));
    }

    let stress = windows
        .iter()
        .enumerate()
        .map(|(idx, (window, _, _))| {
            let window_return = match (first_in_window[idx], last_in_window[idx]) {
                (Some(first), Some(last)) if first > 0.0 => Some(last / first - 1.0),
                _ => None,
            };
            StressResult {
                window: *window,
                window_return,
                observed_days: days_in_window[idx],
            }
        })
        .collect();

    let mut years_beating_benchmark = 0;
    let mut previous_close: Option<f64> = None;
    for (first, last) in year_bounds.values() {
        let base = previous_close.unwrap_or(*first);
        if base > 0.0 && last / base - 1.0 > benchmark_annual_return {
            years_beating_benchmark += 1;
        }
        previous_close = Some(*last);
    }

    Ok(EquityScan {
        stress,
        years_observed: year_bounds.len(),
        years_beating_benchmark,
    })
}

fn failed_scan() -> EquityScan {
    EquityScan {
        stress: STRESS_WINDOWS
            .iter()
            .map(|window| StressResult {
                window: *window,
                window_return: None,
                observed_days: 0,
            })
            .collect(),
        years_observed: 0,
        years_beating_benchmark: 0,
    }
}

/// Deep dive over the representative of each cluster, one at a time in cluster order.
pub fn stage_b(clusters: Vec<Cluster>, options: &AnalyzerOptions) -> Vec<ClusterReport> {
    let mut reports = Vec::with_capacity(clusters.len());
    for cluster in clusters {
        let Some(representative) = cluster.representative().cloned() else {
            continue;
        };
        let scan = match representative.equity_path.as_deref() {
            Some(path) => match scan_equity(path, options.benchmark_annual_return) {
                Ok(scan) => scan,
                Err(err) => {
                    warn!(
                        "Cluster {}: equity series unavailable, stress tests fail: {:#}",
                        cluster.id, err
                    );
                    failed_scan()
                }
            },
            None => {
                warn!(
                    "Cluster {}: run {} has no equity series, stress tests fail",
                    cluster.id, representative.run_id
                );
                failed_scan()
            }
        };

        let max_drawdown = representative.metric(Metric::MaxDrawdown).unwrap_or(-1.0);
        let alpha = representative.alpha.value();
        let verdict = classify(&VerdictInputs {
            alpha,
            max_drawdown,
            stress_pass: scan.stress_pass(),
            plateau_pass: cluster.plateau_pass(),
        });
        info!(
            "Cluster {} [{}]: plateau {:.1} ({}), stress {}, verdict {}",
            cluster.id,
            cluster.parameters.signature(),
            cluster.plateau_score,
            cluster.plateau_basis.as_str(),
            if scan.stress_pass() { "pass" } else { "fail" },
            verdict
        );

        reports.push(ClusterReport {
            representative_run_id: representative.run_id,
            representative_symbol_set: representative.symbol_set.clone(),
            sharpe_ratio: representative.metric(Metric::SharpeRatio).unwrap_or(f64::NAN),
            max_drawdown,
            alpha,
            scan,
            verdict,
            cluster,
        });
    }
    reports
}

pub fn analyze(
    table: &SummaryTable,
    declared_plateau: &[PlateauParameter],
    options: &AnalyzerOptions,
) -> Result<Vec<ClusterReport>> {
    let stage_a = stage_a(table, declared_plateau, options)?;
    info!(
        "Stage A produced {} cluster(s) from {} retained run(s)",
        stage_a.clusters.len(),
        stage_a.retained
    );
    Ok(stage_b(stage_a.clusters, options))
}

pub fn write_reports(
    path: &Path,
    reports: &[ClusterReport],
    parameter_names: &[String],
) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut header: Vec<String> = [
        "cluster_id",
        "members",
        "representative_run_id",
        "symbol_set",
        "mean_total_return",
        "mean_max_drawdown",
        "sharpe_ratio",
        "max_drawdown",
        "alpha",
        "plateau_score",
        "plateau_basis",
    ]
    .iter()
    .map(|column| column.to_string())
    .collect();
    for window in STRESS_WINDOWS.iter() {
        header.push(window.label.to_string());
    }
    header.extend(
        ["stress_pass", "years_observed", "years_beating_benchmark", "verdict"]
            .iter()
            .map(|column| column.to_string()),
    );
    header.extend(parameter_names.iter().cloned());
    writer.write_record(&header)?;

    for report in reports {
        let cluster = &report.cluster;
        let mut record = vec![
            cluster.id.to_string(),
            cluster.members.len().to_string(),
            report.representative_run_id.to_string(),
            report.representative_symbol_set.clone(),
            cluster.mean_return.to_string(),
            cluster.mean_drawdown.to_string(),
            report.sharpe_ratio.to_string(),
            report.max_drawdown.to_string(),
            report
                .alpha
                .map(|alpha| alpha.to_string())
                .unwrap_or_else(|| crate::summary::NOT_APPLICABLE.to_string()),
            format!("{:.2}", cluster.plateau_score),
            cluster.plateau_basis.as_str().to_string(),
        ];
        for stress in &report.scan.stress {
            record.push(
                stress
                    .window_return
                    .map(|value| value.to_string())
                    .unwrap_or_else(|| "no data".to_string()),
            );
        }
        record.push(report.scan.stress_pass().to_string());
        record.push(report.scan.years_observed.to_string());
        record.push(report.scan.years_beating_benchmark.to_string());
        record.push(report.verdict.label().to_string());
        record.extend(parameter_names.iter().map(|name| {
            cluster
                .parameters
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
    use crate::models::ParamValue;
    use crate::summary::{Alpha, RowMetrics};
    use std::fmt::Write as _;
    use std::path::PathBuf;

    fn row(run_id: u32, sma: i64, total_return: f64, calmar: f64, sharpe: f64) -> SummaryRow {
        SummaryRow {
            run_id,
            symbol_set: format!("set{}", run_id % 2),
            status: RowStatus::Ok,
            error: None,
            output_dir: None,
            equity_path: None,
            metrics: Some(RowMetrics {
                final_value: 10_000.0 * (1.0 + total_return),
                total_return,
                annualized_return: total_return / 3.0,
                max_drawdown: -0.2,
                sharpe_ratio: sharpe,
                sortino_ratio: sharpe,
                calmar_ratio: calmar,
                win_rate: 0.5,
                total_trades: 10,
            }),
            alpha: Alpha::Value(total_return / 0.5),
            parameters: ParameterAssignment(vec![(
                "sma_period".to_string(),
                ParamValue::Int(sma),
            )]),
        }
    }

    fn table(rows: Vec<SummaryRow>) -> SummaryTable {
        SummaryTable {
            rows,
            parameter_names: vec!["sma_period".to_string()],
            benchmark_total_return: Some(0.5),
        }
    }

    fn bands() -> Vec<PlateauParameter> {
        vec![PlateauParameter {
            name: "sma_period".to_string(),
            tolerance: 0.25,
        }]
    }

    #[test]
    fn percentile_filter_keeps_top_rows_and_clusters_by_parameters() {
        let rows = (1..=10)
            .map(|id| row(id, 100 + (id as i64 % 5) * 10, 0.1 * id as f64, id as f64, 1.0))
            .collect();
        let stage = stage_a(&table(rows), &bands(), &AnalyzerOptions::default()).unwrap();

        // calmar 1..=10, 80th percentile = 8.2
        assert!((stage.threshold - 8.2).abs() < 1e-9);
        assert_eq!(stage.retained, 2);
        assert_eq!(stage.clusters.len(), 2);
        assert_eq!(stage.clusters[0].members[0].run_id, 9);
        assert_eq!(stage.clusters[0].id, 1);
    }

    #[test]
    fn identical_parameters_share_a_cluster_across_symbol_sets() {
        let rows = vec![
            row(1, 200, 0.5, 2.0, 1.0),
            row(2, 200, 0.6, 2.0, 1.5),
            row(3, 100, 0.1, 0.1, 0.5),
        ];
        let options = AnalyzerOptions {
            percentile: 50.0,
            ..Default::default()
        };
        let stage = stage_a(&table(rows), &bands(), &options).unwrap();
        assert_eq!(stage.clusters.len(), 1);
        let cluster = &stage.clusters[0];
        assert_eq!(cluster.members.len(), 2);
        assert_eq!(cluster.representative().unwrap().run_id, 2);
        assert!((cluster.mean_return - 0.55).abs() < 1e-9);
    }

    #[test]
    fn plateau_score_compares_neighbors_with_cluster() {
        // Cluster sma=200 returns 0.4; neighbor sma=220 (within 25%) returns 0.2.
        let rows = vec![
            row(1, 200, 0.4, 3.0, 1.0),
            row(2, 220, 0.2, 1.0, 1.0),
            row(3, 400, 0.9, 0.5, 1.0),
        ];
        let options = AnalyzerOptions {
            percentile: 100.0,
            ..Default::default()
        };
        let stage = stage_a(&table(rows), &bands(), &options).unwrap();
        let cluster = &stage.clusters[0];
        assert_eq!(cluster.plateau_basis, PlateauBasis::Neighbors);
        assert!((cluster.plateau_score - 50.0).abs() < 1e-9);
        assert!(!cluster.plateau_pass());
    }

    #[test]
    fn missing_plateau_parameters_fall_back_to_full_score() {
        let mut rows = vec![row(1, 200, 0.4, 3.0, 1.0)];
        rows[0].parameters =
            ParameterAssignment(vec![("lookback".to_string(), ParamValue::Int(3))]);
        let mut summary = table(rows);
        summary.parameter_names = vec!["lookback".to_string()];

        let stage = stage_a(&summary, &[], &AnalyzerOptions::default()).unwrap();
        assert_eq!(stage.clusters[0].plateau_basis, PlateauBasis::Fallback);
        assert!((stage.clusters[0].plateau_score - 100.0).abs() < 1e-9);
    }

    fn write_equity(path: &Path, points: &[(&str, f64)]) {
        let mut text = String::from("date,value\n");
        for (date, value) in points {
            writeln!(text, "{},{}", date, value).unwrap();
        }
        std::fs::write(path, text).unwrap();
    }

    #[test]
    fn stress_window_without_observations_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("equity.csv");
        write_equity(
            &path,
            &[
                ("2019-12-31", 100.0),
                ("2020-02-19", 100.0),
                ("2020-03-23", 80.0),
                ("2020-12-31", 120.0),
                ("2022-01-03", 120.0),
                ("2022-10-12", 108.0),
                ("2022-12-30", 110.0),
            ],
        );

        let scan = scan_equity(&path, 0.10).unwrap();
        assert_eq!(scan.stress[0].observed_days, 0);
        assert!(!scan.stress[0].passed());
        assert!((scan.stress[1].window_return.unwrap() + 0.2).abs() < 1e-9);
        assert!(scan.stress[1].passed());
        assert!((scan.stress[2].window_return.unwrap() + 0.1).abs() < 1e-9);
        assert!(!scan.stress_pass());

        // 2019: flat, 2020: +20%, 2022: -8.3%
        assert_eq!(scan.years_observed, 3);
        assert_eq!(scan.years_beating_benchmark, 1);
    }

    #[test]
    fn stage_b_classifies_each_representative() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("equity.csv");
        write_equity(
            &path,
            &[
                ("2018-01-26", 100.0),
                ("2018-02-09", 95.0),
                ("2020-02-19", 100.0),
                ("2020-03-23", 85.0),
                ("2022-01-03", 100.0),
                ("2022-10-12", 90.0),
            ],
        );
        let mut member = row(1, 200, 0.9, 3.0, 1.2);
        member.equity_path = Some(PathBuf::from(&path));
        let cluster = Cluster {
            id: 1,
            parameters: member.parameters.clone(),
            members: vec![member],
            mean_return: 0.9,
            mean_drawdown: -0.2,
            plateau_score: 85.0,
            plateau_basis: PlateauBasis::Neighbors,
        };

        let reports = stage_b(vec![cluster], &AnalyzerOptions::default());
        assert_eq!(reports.len(), 1);
        assert!(reports[0].scan.stress_pass());
        // alpha 1.8, drawdown -20%, stress and plateau pass
        assert_eq!(reports[0].verdict, Verdict::TitanConfig);
    }
}
