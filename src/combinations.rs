use crate::config::OptimizationConfig;
use crate::models::{ParamValue, ParameterAssignment, RunSpecification};
use log::{info, warn};

#[derive(Debug, Clone)]
pub struct CombinationSet {
    pub runs: Vec<RunSpecification>,
    /// Advisory message when the count exceeds the configured threshold.
    pub warning: Option<String>,
}

/// Cartesian product of the parameter grid, repeated once per symbol set.
///
/// Symbol-set order is outermost, then grid order with the last parameter
/// varying fastest. Run ids are dense and start at 1.
pub fn generate_combinations(config: &OptimizationConfig) -> CombinationSet {
    let grid = parameter_product(&config.parameter_grid);
    let mut runs = Vec::with_capacity(config.symbol_sets.len() * grid.len());
    let mut next_id = 1u32;

    for symbol_set in &config.symbol_sets {
        for parameters in &grid {
            runs.push(RunSpecification {
                run_id: next_id,
                symbol_set: symbol_set.clone(),
                parameters: parameters.clone(),
            });
            next_id += 1;
        }
    }

    let warning = if runs.len() > config.combination_warning_threshold {
        let message = format!(
            "{} combinations exceed the warning threshold of {}; continuing anyway",
            runs.len(),
            config.combination_warning_threshold
        );
        warn!("{}", message);
        Some(message)
    } else {
        None
    };

    info!(
        "Generated {} combination(s) across {} symbol set(s)",
        runs.len(),
        config.symbol_sets.len()
    );

    CombinationSet { runs, warning }
}

fn parameter_product(grid: &[(String, Vec<ParamValue>)]) -> Vec<ParameterAssignment> {
    if grid.iter().any(|(_, values)| values.is_empty()) {
        return Vec::new();
    }

    let mut indices = vec![0usize; grid.len()];
    let mut product = Vec::new();
    loop {
        product.push(ParameterAssignment(
            grid.iter()
                .zip(indices.iter())
                .map(|((name, values), &idx)| (name.clone(), values[idx].clone()))
                .collect(),
        ));

        // Odometer increment, rightmost position first.
        let mut position = grid.len();
        loop {
            if position == 0 {
                return product;
            }
            position -= 1;
            indices[position] += 1;
            if indices[position] < grid[position].1.len() {
                break;
            }
            indices[position] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BacktestSettings, OptimizationConfig};
    use crate::models::SymbolSet;
    use crate::strategy::describe_strategy;
    use chrono::NaiveDate;
    use std::collections::{BTreeMap, HashSet};

    fn config(
        sets: usize,
        grid: Vec<(String, Vec<ParamValue>)>,
        threshold: usize,
    ) -> OptimizationConfig {
        OptimizationConfig {
            strategy: describe_strategy("leveraged_trend").unwrap(),
            symbol_sets: (0..sets)
                .map(|idx| SymbolSet {
                    name: format!("set{}", idx),
                    roles: BTreeMap::from([
                        ("signal".to_string(), "QQQ".to_string()),
                        ("bull".to_string(), "TQQQ".to_string()),
                    ]),
                })
                .collect(),
            backtest: BacktestSettings {
                start_date: NaiveDate::from_ymd_opt(2015, 1, 1).unwrap(),
                end_date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
                initial_capital: 10_000.0,
                commission: 0.0,
                slippage: 0.0,
                benchmark_symbol: "SPY".to_string(),
                extra: BTreeMap::new(),
            },
            parameter_grid: grid,
            combination_warning_threshold: threshold,
            checkpoint_interval: 10,
        }
    }

    fn grid() -> Vec<(String, Vec<ParamValue>)> {
        vec![
            (
                "sma_period".to_string(),
                vec![ParamValue::Int(100), ParamValue::Int(150), ParamValue::Int(200)],
            ),
            (
                "band_threshold".to_string(),
                vec![ParamValue::Float(0.01), ParamValue::Float(0.02)],
            ),
            ("rsi_exit".to_string(), vec![ParamValue::Int(80)]),
        ]
    }

    #[test]
    fn produces_full_product_with_unique_dense_ids() {
        let set = generate_combinations(&config(2, grid(), 1_000));
        assert_eq!(set.runs.len(), 2 * 3 * 2 * 1);
        let ids: HashSet<u32> = set.runs.iter().map(|run| run.run_id).collect();
        assert_eq!(ids.len(), set.runs.len());
        assert_eq!(set.runs.first().unwrap().run_id, 1);
        assert_eq!(set.runs.last().unwrap().run_id, 12);
        assert!(set.warning.is_none());
    }

    #[test]
    fn preserves_symbol_set_then_grid_order() {
        let set = generate_combinations(&config(2, grid(), 1_000));
        assert!(set.runs[..6].iter().all(|run| run.symbol_set.name == "set0"));
        assert!(set.runs[6..].iter().all(|run| run.symbol_set.name == "set1"));
        assert_eq!(
            set.runs[0].parameters.signature(),
            "sma_period=100;band_threshold=0.01;rsi_exit=80"
        );
        assert_eq!(
            set.runs[1].parameters.signature(),
            "sma_period=100;band_threshold=0.02;rsi_exit=80"
        );
        assert_eq!(
            set.runs[2].parameters.signature(),
            "sma_period=150;band_threshold=0.01;rsi_exit=80"
        );
    }

    #[test]
    fn threshold_is_advisory() {
        let set = generate_combinations(&config(1, grid(), 3));
        assert_eq!(set.runs.len(), 6);
        assert!(set.warning.is_some());
    }
}
