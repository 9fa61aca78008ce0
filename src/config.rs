use crate::error::OptimizerError;
use crate::models::{ParamValue, SymbolSet};
use crate::strategy::{describe_strategy, StrategyDescriptor};
use anyhow::{Context, Result};
use chrono::{Months, NaiveDate};
use log::{info, warn};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

pub const DEFAULT_COMBINATION_WARNING_THRESHOLD: usize = 1_000;
pub const DEFAULT_CHECKPOINT_INTERVAL: usize = 10;
pub const DEFAULT_BENCHMARK_SYMBOL: &str = "SPY";

const RESERVED_BACKTEST_KEYS: &[&str] = &[
    "start_date",
    "end_date",
    "initial_capital",
    "commission",
    "slippage",
    "benchmark_symbol",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    FinalValue,
    TotalReturn,
    AnnualizedReturn,
    SharpeRatio,
    SortinoRatio,
    CalmarRatio,
    MaxDrawdown,
    WinRate,
}

impl Metric {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "final_value" => Ok(Self::FinalValue),
            "total_return" => Ok(Self::TotalReturn),
            "annualized_return" | "cagr" => Ok(Self::AnnualizedReturn),
            "sharpe" | "sharpe_ratio" => Ok(Self::SharpeRatio),
            "sortino" | "sortino_ratio" => Ok(Self::SortinoRatio),
            "calmar" | "calmar_ratio" => Ok(Self::CalmarRatio),
            "max_drawdown" => Ok(Self::MaxDrawdown),
            "win_rate" => Ok(Self::WinRate),
            other => Err(OptimizerError::config(
                "selection_metric",
                format!("unknown metric '{}'", other),
            )
            .into()),
        }
    }

    /// Column name used in summary tables.
    pub fn column(self) -> &'static str {
        match self {
            Self::FinalValue => "final_value",
            Self::TotalReturn => "total_return",
            Self::AnnualizedReturn => "annualized_return",
            Self::SharpeRatio => "sharpe_ratio",
            Self::SortinoRatio => "sortino_ratio",
            Self::CalmarRatio => "calmar_ratio",
            Self::MaxDrawdown => "max_drawdown",
            Self::WinRate => "win_rate",
        }
    }

    /// Drawdown-like metrics are selected by smallest magnitude.
    pub fn is_drawdown_like(self) -> bool {
        matches!(self, Self::MaxDrawdown)
    }

    /// Score where larger is always better; non-finite values rank last.
    pub fn score(self, value: f64) -> f64 {
        if !value.is_finite() {
            return f64::NEG_INFINITY;
        }
        if self.is_drawdown_like() {
            -value.abs()
        } else {
            value
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestSettings {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: f64,
    pub commission: f64,
    pub slippage: f64,
    pub benchmark_symbol: String,
    /// Strategy-specific settings such as `volatility_symbol`.
    pub extra: BTreeMap<String, String>,
}

/// Validated grid-search configuration. Never mutated after loading.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationConfig {
    pub strategy: StrategyDescriptor,
    pub symbol_sets: Vec<SymbolSet>,
    pub backtest: BacktestSettings,
    pub parameter_grid: Vec<(String, Vec<ParamValue>)>,
    pub combination_warning_threshold: usize,
    pub checkpoint_interval: usize,
}

impl OptimizationConfig {
    /// Copy of this configuration scoped to a different date range.
    pub fn with_date_range(&self, start_date: NaiveDate, end_date: NaiveDate) -> Self {
        let mut scoped = self.clone();
        scoped.backtest.start_date = start_date;
        scoped.backtest.end_date = end_date;
        scoped
    }

    pub fn parameter_names(&self) -> Vec<String> {
        self.parameter_grid
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn combination_count(&self) -> usize {
        self.symbol_sets.len()
            * self
                .parameter_grid
                .iter()
                .map(|(_, values)| values.len())
                .product::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalkForwardSettings {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub window_years: f64,
    pub in_sample_years: f64,
    pub out_of_sample_years: f64,
    pub slide_years: f64,
    pub selection_metric: Metric,
}

impl WalkForwardSettings {
    pub fn in_sample_span(&self) -> Months {
        Months::new(years_to_months(self.in_sample_years))
    }

    pub fn out_of_sample_span(&self) -> Months {
        Months::new(years_to_months(self.out_of_sample_years))
    }

    /// Whole months between consecutive window starts.
    pub fn slide_months(&self) -> u32 {
        years_to_months(self.slide_years)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalkForwardConfig {
    pub optimization: OptimizationConfig,
    pub schedule: WalkForwardSettings,
}

/// Fractional years resolve to whole calendar months.
pub fn years_to_months(years: f64) -> u32 {
    if !years.is_finite() || years <= 0.0 {
        return 0;
    }
    (years * 12.0).round() as u32
}

pub fn load_optimization_config(path: &Path) -> Result<OptimizationConfig> {
    let document = read_document(path)?;
    let config = parse_optimization_config(&document)?;
    info!(
        "Loaded configuration for strategy {} with {} symbol set(s) and {} parameter(s)",
        config.strategy.name,
        config.symbol_sets.len(),
        config.parameter_grid.len()
    );
    Ok(config)
}

pub fn load_walk_forward_config(path: &Path) -> Result<WalkForwardConfig> {
    let document = read_document(path)?;
    parse_walk_forward_config(&document)
}

/// Read a YAML or JSON document; `.json` files are parsed as JSON.
pub fn read_document(path: &Path) -> Result<Value> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let document = if is_json {
        serde_json::from_str::<Value>(&text).map_err(|err| {
            OptimizerError::config("<document>", format!("invalid JSON: {}", err))
        })?
    } else {
        serde_yaml::from_str::<Value>(&text).map_err(|err| {
            OptimizerError::config("<document>", format!("invalid YAML: {}", err))
        })?
    };
    Ok(document)
}

pub fn parse_optimization_config(document: &Value) -> Result<OptimizationConfig> {
    let root = document
        .as_object()
        .ok_or_else(|| OptimizerError::config("<document>", "top level must be a mapping"))?;

    for key in ["strategy", "symbol_sets", "backtest", "parameters"] {
        require_field(root, key, key)?;
    }

    let strategy_name = require_str(root, "strategy", "strategy")?;
    let strategy = resolve_strategy(strategy_name, root.get("capabilities"))?;
    let symbol_sets =
        parse_symbol_sets(require_field(root, "symbol_sets", "symbol_sets")?, &strategy)?;
    let backtest = parse_backtest(require_field(root, "backtest", "backtest")?, &strategy)?;
    let parameter_grid =
        parse_parameter_grid(require_field(root, "parameters", "parameters")?, &strategy)?;

    let combination_warning_threshold = optional_usize(
        root,
        "combination_warning_threshold",
        DEFAULT_COMBINATION_WARNING_THRESHOLD,
        1,
    )?;
    let checkpoint_interval =
        optional_usize(root, "checkpoint_interval", DEFAULT_CHECKPOINT_INTERVAL, 1)?;

    Ok(OptimizationConfig {
        strategy,
        symbol_sets,
        backtest,
        parameter_grid,
        combination_warning_threshold,
        checkpoint_interval,
    })
}

pub fn parse_walk_forward_config(document: &Value) -> Result<WalkForwardConfig> {
    let optimization = parse_optimization_config(document)?;
    let root = document
        .as_object()
        .ok_or_else(|| OptimizerError::config("<document>", "top level must be a mapping"))?;
    let block = require_field(root, "walk_forward", "walk_forward")?
        .as_object()
        .ok_or_else(|| OptimizerError::config("walk_forward", "must be a mapping"))?;

    let start_date = match block.get("start_date") {
        Some(_) => require_date(block, "start_date", "walk_forward.start_date")?,
        None => optimization.backtest.start_date,
    };
    let end_date = match block.get("end_date") {
        Some(_) => require_date(block, "end_date", "walk_forward.end_date")?,
        None => optimization.backtest.end_date,
    };
    if start_date >= end_date {
        return Err(OptimizerError::config(
            "walk_forward.start_date",
            format!("must be before end date ({} >= {})", start_date, end_date),
        )
        .into());
    }

    let window_years = require_f64(
        block,
        "window_years",
        "walk_forward.window_years",
        Some(0.0),
        None,
    )?;
    let in_sample_years = require_f64(
        block,
        "in_sample_years",
        "walk_forward.in_sample_years",
        Some(0.0),
        None,
    )?;
    let out_of_sample_years = require_f64(
        block,
        "out_of_sample_years",
        "walk_forward.out_of_sample_years",
        Some(0.0),
        None,
    )?;
    let slide_years = require_f64(block, "slide_years", "walk_forward.slide_years", None, None)?;

    if slide_years <= 0.0 {
        return Err(OptimizerError::config(
            "walk_forward.slide_years",
            format!("must be strictly positive (value: {})", slide_years),
        )
        .into());
    }
    if (in_sample_years + out_of_sample_years - window_years).abs() > 1e-9 {
        return Err(OptimizerError::config(
            "walk_forward.window_years",
            format!(
                "in-sample ({}) + out-of-sample ({}) must equal window size ({})",
                in_sample_years, out_of_sample_years, window_years
            ),
        )
        .into());
    }
    for (field, years) in [
        ("walk_forward.in_sample_years", in_sample_years),
        ("walk_forward.out_of_sample_years", out_of_sample_years),
        ("walk_forward.slide_years", slide_years),
    ] {
        if years_to_months(years) == 0 {
            return Err(OptimizerError::config(
                field,
                format!("{} years is shorter than one month", years),
            )
            .into());
        }
    }

    let selection_metric = match block.get("selection_metric") {
        Some(_) => Metric::parse(require_str(
            block,
            "selection_metric",
            "walk_forward.selection_metric",
        )?)?,
        None => Metric::CalmarRatio,
    };

    Ok(WalkForwardConfig {
        optimization,
        schedule: WalkForwardSettings {
            start_date,
            end_date,
            window_years,
            in_sample_years,
            out_of_sample_years,
            slide_years,
            selection_metric,
        },
    })
}

fn resolve_strategy(name: &str, capabilities: Option<&Value>) -> Result<StrategyDescriptor> {
    if let Some(raw) = capabilities {
        let mut raw = raw.clone();
        if let Some(obj) = raw.as_object_mut() {
            obj.entry("name".to_string())
                .or_insert_with(|| Value::String(name.to_string()));
        }
        let descriptor: StrategyDescriptor = serde_json::from_value(raw).map_err(|err| {
            OptimizerError::config("capabilities", format!("invalid descriptor: {}", err))
        })?;
        if descriptor.name != name {
            return Err(OptimizerError::config(
                "capabilities.name",
                format!("'{}' does not match strategy '{}'", descriptor.name, name),
            )
            .into());
        }
        return Ok(descriptor);
    }

    describe_strategy(name).ok_or_else(|| {
        OptimizerError::config(
            "strategy",
            format!(
                "unknown strategy '{}' and no capabilities block was provided",
                name
            ),
        )
        .into()
    })
}

fn parse_symbol_sets(raw: &Value, strategy: &StrategyDescriptor) -> Result<Vec<SymbolSet>> {
    let entries = raw
        .as_array()
        .ok_or_else(|| OptimizerError::config("symbol_sets", "must be a list"))?;
    if entries.is_empty() {
        return Err(
            OptimizerError::config("symbol_sets", "at least one symbol set is required").into(),
        );
    }

    let mut seen_names = HashSet::new();
    let mut symbol_sets = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.iter().enumerate() {
        let path = format!("symbol_sets[{}]", idx);
        let obj = entry
            .as_object()
            .ok_or_else(|| OptimizerError::config(path.clone(), "must be a mapping"))?;
        let name = require_str(obj, "name", &format!("{}.name", path))?.to_string();
        if !seen_names.insert(name.clone()) {
            return Err(OptimizerError::config(
                format!("{}.name", path),
                format!("duplicate symbol set name '{}'", name),
            )
            .into());
        }

        let mut roles = BTreeMap::new();
        for (role, value) in obj {
            if role == "name" {
                continue;
            }
            let symbol = value
                .as_str()
                .map(str::trim)
                .filter(|symbol| !symbol.is_empty())
                .ok_or_else(|| {
                    OptimizerError::config(
                        format!("{}.{}", path, role),
                        "instrument must be a non-empty string",
                    )
                })?;
            if !strategy.accepts_role(role) {
                warn!(
                    "Symbol set {} declares role '{}' not accepted by strategy {}; \
                     it will not be forwarded",
                    name, role, strategy.name
                );
            }
            roles.insert(role.clone(), symbol.to_string());
        }

        for required in &strategy.required_roles {
            if !roles.contains_key(required) {
                return Err(OptimizerError::config(
                    format!("{}.{}", path, required),
                    format!("strategy {} requires this role", strategy.name),
                )
                .into());
            }
        }

        symbol_sets.push(SymbolSet { name, roles });
    }

    Ok(symbol_sets)
}

fn parse_backtest(raw: &Value, strategy: &StrategyDescriptor) -> Result<BacktestSettings> {
    let obj = raw
        .as_object()
        .ok_or_else(|| OptimizerError::config("backtest", "must be a mapping"))?;

    let start_date = require_date(obj, "start_date", "backtest.start_date")?;
    let end_date = require_date(obj, "end_date", "backtest.end_date")?;
    if start_date >= end_date {
        return Err(OptimizerError::config(
            "backtest.start_date",
            format!("must be before end date ({} >= {})", start_date, end_date),
        )
        .into());
    }

    let initial_capital = require_f64(
        obj,
        "initial_capital",
        "backtest.initial_capital",
        Some(0.0),
        None,
    )?;
    if initial_capital <= 0.0 {
        return Err(OptimizerError::config(
            "backtest.initial_capital",
            "must be strictly positive",
        )
        .into());
    }
    let commission = optional_f64(obj, "commission", "backtest.commission", 0.0)?;
    let slippage = optional_f64(obj, "slippage", "backtest.slippage", 0.0)?;
    let benchmark_symbol = match obj.get("benchmark_symbol") {
        Some(_) => {
            require_str(obj, "benchmark_symbol", "backtest.benchmark_symbol")?.to_string()
        }
        None => DEFAULT_BENCHMARK_SYMBOL.to_string(),
    };

    let mut extra = BTreeMap::new();
    for (key, value) in obj {
        if RESERVED_BACKTEST_KEYS.contains(&key.as_str()) {
            continue;
        }
        let rendered = match value {
            Value::String(text) => text.trim().to_string(),
            Value::Number(number) => number.to_string(),
            Value::Bool(flag) => flag.to_string(),
            _ => {
                return Err(OptimizerError::config(
                    format!("backtest.{}", key),
                    "must be a scalar value",
                )
                .into())
            }
        };
        extra.insert(key.clone(), rendered);
    }

    for required in &strategy.required_settings {
        let present = extra
            .get(required)
            .map(|value| !value.is_empty())
            .unwrap_or(false);
        if !present {
            return Err(OptimizerError::config(
                format!("backtest.{}", required),
                format!("strategy {} requires this setting", strategy.name),
            )
            .into());
        }
    }

    Ok(BacktestSettings {
        start_date,
        end_date,
        initial_capital,
        commission,
        slippage,
        benchmark_symbol,
        extra,
    })
}

fn parse_parameter_grid(
    raw: &Value,
    strategy: &StrategyDescriptor,
) -> Result<Vec<(String, Vec<ParamValue>)>> {
    let obj = raw.as_object().ok_or_else(|| {
        OptimizerError::config("parameters", "must be a mapping of name to value list")
    })?;
    if obj.is_empty() {
        return Err(
            OptimizerError::config("parameters", "at least one parameter is required").into(),
        );
    }

    let mut grid = Vec::with_capacity(obj.len());
    for (name, values) in obj {
        let path = format!("parameters.{}", name);
        if !strategy.accepts_parameter(name) {
            return Err(OptimizerError::config(
                path,
                format!("strategy {} does not accept this parameter", strategy.name),
            )
            .into());
        }
        let list = values.as_array().ok_or_else(|| {
            OptimizerError::config(path.clone(), "values must be a list, not a scalar")
        })?;
        if list.is_empty() {
            return Err(OptimizerError::config(path, "value list must not be empty").into());
        }
        let mut parsed = Vec::with_capacity(list.len());
        for (idx, value) in list.iter().enumerate() {
            parsed.push(param_value(value).ok_or_else(|| {
                OptimizerError::config(format!("{}[{}]", path, idx), "must be a scalar value")
            })?);
        }
        grid.push((name.clone(), parsed));
    }

    Ok(grid)
}

fn param_value(value: &Value) -> Option<ParamValue> {
    match value {
        Value::Bool(flag) => Some(ParamValue::Bool(*flag)),
        Value::Number(number) => number
            .as_i64()
            .map(ParamValue::Int)
            .or_else(|| number.as_f64().map(ParamValue::Float)),
        Value::String(text) => Some(ParamValue::Text(text.clone())),
        _ => None,
    }
}

fn require_field<'a>(obj: &'a Map<String, Value>, key: &str, path: &str) -> Result<&'a Value> {
    obj.get(key)
        .filter(|value| !value.is_null())
        .ok_or_else(|| OptimizerError::config(path, "missing required field").into())
}

fn require_str<'a>(obj: &'a Map<String, Value>, key: &str, path: &str) -> Result<&'a str> {
    require_field(obj, key, path)?
        .as_str()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| OptimizerError::config(path, "must be a non-empty string").into())
}

fn require_date(obj: &Map<String, Value>, key: &str, path: &str) -> Result<NaiveDate> {
    let raw = require_str(obj, key, path)?;
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
        OptimizerError::config(
            path,
            format!("must be a date in YYYY-MM-DD format (value: {})", raw),
        )
        .into()
    })
}

fn require_f64(
    obj: &Map<String, Value>,
    key: &str,
    path: &str,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let value = require_field(obj, key, path)?
        .as_f64()
        .ok_or_else(|| OptimizerError::config(path, "must be a number"))?;
    if !value.is_finite() {
        return Err(
            OptimizerError::config(path, format!("must be finite (value: {})", value)).into(),
        );
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(OptimizerError::config(
                path,
                format!("must be >= {} (value: {})", min_value, value),
            )
            .into());
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(OptimizerError::config(
                path,
                format!("must be <= {} (value: {})", max_value, value),
            )
            .into());
        }
    }
    Ok(value)
}

fn optional_f64(obj: &Map<String, Value>, key: &str, path: &str, default: f64) -> Result<f64> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(_) => require_f64(obj, key, path, Some(0.0), None),
    }
}

fn optional_usize(
    obj: &Map<String, Value>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => {
            let parsed = value
                .as_u64()
                .ok_or_else(|| OptimizerError::config(key, "must be a non-negative integer"))?;
            if (parsed as usize) < min {
                return Err(OptimizerError::config(
                    key,
                    format!("must be >= {} (value: {})", min, parsed),
                )
                .into());
            }
            Ok(parsed as usize)
        }
    }
}
