use anyhow::anyhow;
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Run id reserved for the synthetic buy-and-hold row of a summary table.
pub const BASELINE_RUN_ID: u32 = 0;
pub const BASELINE_LABEL: &str = "BASELINE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(value) => Some(*value as f64),
            ParamValue::Float(value) if value.is_finite() => Some(*value),
            _ => None,
        }
    }

    /// Parse a value read back from a delimited text column.
    pub fn from_field(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "true" => return ParamValue::Bool(true),
            "false" => return ParamValue::Bool(false),
            _ => {}
        }
        if let Ok(value) = trimmed.parse::<i64>() {
            return ParamValue::Int(value);
        }
        if let Ok(value) = trimmed.parse::<f64>() {
            return ParamValue::Float(value);
        }
        ParamValue::Text(trimmed.to_string())
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(value) => write!(f, "{}", value),
            ParamValue::Int(value) => write!(f, "{}", value),
            ParamValue::Float(value) => write!(f, "{}", value),
            ParamValue::Text(value) => write!(f, "{}", value),
        }
    }
}

/// Ordered parameter assignment; order follows the configured grid.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParameterAssignment(pub Vec<(String, ParamValue)>);

impl ParameterAssignment {
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, ParamValue)> {
        self.0.iter()
    }

    /// Stable textual key of the full value tuple, used for clustering.
    pub fn signature(&self) -> String {
        self.0
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join(";")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolSet {
    pub name: String,
    pub roles: BTreeMap<String, String>,
}

impl SymbolSet {
    pub fn symbol(&self, role: &str) -> Option<&str> {
        self.roles.get(role).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSpecification {
    pub run_id: u32,
    pub symbol_set: SymbolSet,
    pub parameters: ParameterAssignment,
}

/// Zero-padded run id, at least four digits wide.
pub fn format_run_id(run_id: u32, total_runs: usize) -> String {
    let width = total_runs.to_string().len().max(4);
    format!("{:0width$}", run_id, width = width)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub final_value: f64,
    pub total_return: f64,
    pub annualized_return: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    /// Negative fraction, e.g. -0.18 for an 18% peak-to-trough loss.
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub total_trades: u32,
    pub trades_path: PathBuf,
    #[serde(default)]
    pub equity_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(BacktestMetrics),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub spec: RunSpecification,
    pub output_dir: PathBuf,
    pub outcome: RunOutcome,
}

impl RunResult {
    pub fn metrics(&self) -> Option<&BacktestMetrics> {
        match &self.outcome {
            RunOutcome::Completed(metrics) => Some(metrics),
            RunOutcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            RunOutcome::Completed(_) => None,
            RunOutcome::Failed(error) => Some(error.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TradeAction {
    Buy,
    Sell,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
        }
    }
}

impl FromStr for TradeAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(TradeAction::Buy),
            "sell" => Ok(TradeAction::Sell),
            other => Err(anyhow!("Unknown trade action '{}'", other)),
        }
    }
}

impl<'de> Deserialize<'de> for TradeAction {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        TradeAction::from_str(&raw).map_err(serde::de::Error::custom)
    }
}

/// One row of the raw transaction ledger written by the backtest engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub date: NaiveDate,
    pub symbol: String,
    pub action: TradeAction,
    pub price: f64,
    pub quantity: f64,
    #[serde(default)]
    pub commission: f64,
    /// Portfolio value immediately after the transaction.
    pub portfolio_value: f64,
}

/// A ledger transaction tagged with the walk-forward window that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedTransaction {
    pub window_id: u32,
    pub parameters: String,
    pub transaction: Transaction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompleteTrade {
    pub window_id: u32,
    pub symbol: String,
    pub entry_date: NaiveDate,
    pub entry_price: f64,
    pub exit_date: NaiveDate,
    pub exit_price: f64,
    pub quantity: f64,
    pub trade_return: f64,
    pub total_commission: f64,
    pub parameters: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub id: u32,
    pub is_start: NaiveDate,
    pub is_end: NaiveDate,
    pub oos_start: NaiveDate,
    pub oos_end: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowResult {
    pub window: Window,
    pub symbol_set: String,
    pub selected: ParameterAssignment,
    pub selection_value: f64,
    pub transactions: Vec<TaggedTransaction>,
    pub oos_metrics: BacktestMetrics,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub final_value: f64,
    pub total_return: f64,
    pub annualized_return: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
}
