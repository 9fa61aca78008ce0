use crate::config::OptimizationConfig;
use crate::models::{BacktestMetrics, ParamValue, ParameterAssignment, SymbolSet};
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use log::debug;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub const REQUEST_FILE: &str = "request.json";
pub const METRICS_FILE: &str = "metrics.json";
const MAX_STDERR_CHARS: usize = 2048;

/// Fully merged configuration handed to the backtest engine for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestRequest {
    pub strategy: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: f64,
    pub commission: f64,
    pub slippage: f64,
    pub benchmark_symbol: String,
    pub settings: BTreeMap<String, String>,
    pub symbols: BTreeMap<String, String>,
    pub parameters: BTreeMap<String, ParamValue>,
}

impl BacktestRequest {
    /// Merge base settings with one combination, forwarding only the roles and
    /// parameters the strategy declares.
    pub fn merge(
        config: &OptimizationConfig,
        symbol_set: &SymbolSet,
        parameters: &ParameterAssignment,
    ) -> Self {
        let strategy = &config.strategy;
        let symbols = symbol_set
            .roles
            .iter()
            .filter(|(role, _)| strategy.accepts_role(role))
            .map(|(role, symbol)| (role.clone(), symbol.clone()))
            .collect();
        let parameters = parameters
            .iter()
            .filter(|(name, _)| strategy.accepts_parameter(name))
            .cloned()
            .collect();

        Self {
            strategy: strategy.name.clone(),
            start_date: config.backtest.start_date,
            end_date: config.backtest.end_date,
            initial_capital: config.backtest.initial_capital,
            commission: config.backtest.commission,
            slippage: config.backtest.slippage,
            benchmark_symbol: config.backtest.benchmark_symbol.clone(),
            settings: config.backtest.extra.clone(),
            symbols,
            parameters,
        }
    }
}

/// The external engine that turns a request into performance series.
///
/// Calls are blocking and are never issued concurrently by this crate.
pub trait BacktestEngine {
    fn run(&self, request: &BacktestRequest, output_dir: &Path) -> Result<BacktestMetrics>;

    /// Re-read metrics of a run finished in an earlier session.
    fn recover(&self, _request: &BacktestRequest, output_dir: &Path) -> Result<BacktestMetrics> {
        Err(anyhow!(
            "engine cannot recover prior results from {}",
            output_dir.display()
        ))
    }
}

/// Runs an external program per backtest.
///
/// The program is invoked as `<program> [args..] --request <file> --output <dir>`
/// and must leave a `metrics.json` in the output directory.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a whitespace-separated command line such as `python3 run_backtest.py`.
    pub fn from_command_line(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| anyhow!("backtest engine command must not be empty"))?;
        Ok(Self::new(program, parts.collect()))
    }
}

impl BacktestEngine for CommandEngine {
    fn run(&self, request: &BacktestRequest, output_dir: &Path) -> Result<BacktestMetrics> {
        fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;
        let request_path = output_dir.join(REQUEST_FILE);
        let payload = serde_json::to_string_pretty(request)?;
        fs::write(&request_path, payload)
            .with_context(|| format!("Failed to write {}", request_path.display()))?;

        debug!(
            "Running {} {:?} for {}",
            self.program,
            self.args,
            output_dir.display()
        );
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg("--request")
            .arg(&request_path)
            .arg("--output")
            .arg(output_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Failed to spawn backtest engine {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "backtest engine exited with {}: {}",
                output.status,
                truncate_for_log(stderr.trim(), MAX_STDERR_CHARS)
            ));
        }

        read_metrics(output_dir)
    }

    fn recover(&self, _request: &BacktestRequest, output_dir: &Path) -> Result<BacktestMetrics> {
        read_metrics(output_dir)
    }
}

/// Load `metrics.json`, resolving relative ledger paths against `output_dir`.
pub fn read_metrics(output_dir: &Path) -> Result<BacktestMetrics> {
    let metrics_path = output_dir.join(METRICS_FILE);
    let text = fs::read_to_string(&metrics_path)
        .with_context(|| format!("Failed to read {}", metrics_path.display()))?;
    let mut metrics: BacktestMetrics = serde_json::from_str(&text)
        .with_context(|| format!("Malformed metrics in {}", metrics_path.display()))?;
    metrics.trades_path = resolve_relative(output_dir, &metrics.trades_path);
    metrics.equity_path = metrics
        .equity_path
        .as_ref()
        .map(|path| resolve_relative(output_dir, path));
    Ok(metrics)
}

fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let truncated: String = value.chars().take(max_chars).collect();
    format!("{}...", truncated)
}
