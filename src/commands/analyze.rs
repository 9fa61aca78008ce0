use crate::config::Metric;
use crate::robustness::{analyze, write_reports, AnalyzerOptions, ROBUSTNESS_FILE};
use crate::strategy::describe_strategy;
use crate::summary::SummaryTable;
use crate::verdict::Verdict;
use anyhow::{Context, Result};
use log::{info, warn};
use std::fs;
use std::path::Path;

pub fn run(
    summary_path: &Path,
    output_dir: &Path,
    strategy: Option<&str>,
    metric: Metric,
    benchmark_annual_return: f64,
) -> Result<()> {
    let table = SummaryTable::read_csv(summary_path)?;
    info!(
        "Analyzing {} row(s) from {}",
        table.rows.len(),
        summary_path.display()
    );

    let declared = match strategy {
        Some(name) => match describe_strategy(name) {
            Some(descriptor) => descriptor.plateau_parameters,
            None => {
                warn!("Unknown strategy {}; using parameter-name hints for plateau", name);
                Vec::new()
            }
        },
        None => Vec::new(),
    };
    let options = AnalyzerOptions {
        metric,
        benchmark_annual_return,
        ..Default::default()
    };

    let reports = analyze(&table, &declared, &options)?;
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;
    let path = output_dir.join(ROBUSTNESS_FILE);
    write_reports(&path, &reports, &table.parameter_names)?;

    let titans = reports
        .iter()
        .filter(|report| report.verdict == Verdict::TitanConfig)
        .count();
    info!(
        "{} cluster(s) classified, {} TITAN CONFIG; written to {}",
        reports.len(),
        titans,
        path.display()
    );
    Ok(())
}
