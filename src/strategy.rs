use serde::{Deserialize, Serialize};

/// Relative tolerance applied when a plateau parameter does not declare one.
pub const DEFAULT_PLATEAU_TOLERANCE: f64 = 0.25;

fn default_plateau_tolerance() -> f64 {
    DEFAULT_PLATEAU_TOLERANCE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateauParameter {
    pub name: String,
    /// Relative band around the member's value, e.g. 0.25 for +/-25%.
    #[serde(default = "default_plateau_tolerance")]
    pub tolerance: f64,
}

/// Declared contract of a strategy: which parameters and symbol roles the
/// backtest engine accepts for it. Resolved once when configuration loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDescriptor {
    pub name: String,
    pub parameters: Vec<String>,
    pub required_roles: Vec<String>,
    #[serde(default)]
    pub optional_roles: Vec<String>,
    /// Backtest settings that must be present, e.g. `volatility_symbol`.
    #[serde(default)]
    pub required_settings: Vec<String>,
    /// The two most trend-sensitive parameters, used for plateau scoring.
    #[serde(default)]
    pub plateau_parameters: Vec<PlateauParameter>,
}

impl StrategyDescriptor {
    pub fn accepts_parameter(&self, name: &str) -> bool {
        self.parameters.iter().any(|param| param == name)
    }

    pub fn accepts_role(&self, role: &str) -> bool {
        self.required_roles.iter().any(|r| r == role)
            || self.optional_roles.iter().any(|r| r == role)
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn plateau(values: &[(&str, f64)]) -> Vec<PlateauParameter> {
    values
        .iter()
        .map(|(name, tolerance)| PlateauParameter {
            name: name.to_string(),
            tolerance: *tolerance,
        })
        .collect()
}

/// Look up a built-in strategy descriptor by name.
pub fn describe_strategy(name: &str) -> Option<StrategyDescriptor> {
    let descriptor = match name {
        "leveraged_trend" => StrategyDescriptor {
            name: name.to_string(),
            parameters: strings(&[
                "sma_period",
                "band_threshold",
                "rsi_period",
                "rsi_exit",
                "stop_loss",
            ]),
            required_roles: strings(&["signal", "bull"]),
            optional_roles: strings(&["defensive", "hedge", "bond"]),
            required_settings: Vec::new(),
            plateau_parameters: plateau(&[("sma_period", 0.25), ("band_threshold", 0.5)]),
        },
        "volatility_regime" => StrategyDescriptor {
            name: name.to_string(),
            parameters: strings(&[
                "sma_period",
                "vol_lookback",
                "vol_threshold",
                "rebalance_days",
            ]),
            required_roles: strings(&["signal", "bull", "defensive"]),
            optional_roles: strings(&["bond", "hedge"]),
            required_settings: strings(&["volatility_symbol"]),
            plateau_parameters: plateau(&[("sma_period", 0.25), ("vol_threshold", 0.25)]),
        },
        "dual_momentum" => StrategyDescriptor {
            name: name.to_string(),
            parameters: strings(&["lookback_months", "top_n", "abs_momentum_threshold"]),
            required_roles: strings(&["signal", "bull", "defensive"]),
            optional_roles: strings(&["bond"]),
            required_settings: Vec::new(),
            plateau_parameters: plateau(&[
                ("lookback_months", 0.34),
                ("abs_momentum_threshold", 0.5),
            ]),
        },
        "buy_and_hold" => StrategyDescriptor {
            name: name.to_string(),
            parameters: strings(&["rebalance_days"]),
            required_roles: strings(&["signal"]),
            optional_roles: Vec::new(),
            required_settings: Vec::new(),
            plateau_parameters: Vec::new(),
        },
        _ => return None,
    };
    Some(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_declares_roles_and_parameters() {
        let descriptor = describe_strategy("volatility_regime").expect("known strategy");
        assert!(descriptor.accepts_parameter("vol_threshold"));
        assert!(!descriptor.accepts_parameter("rsi_exit"));
        assert!(descriptor.accepts_role("bond"));
        assert!(!descriptor.accepts_role("cash"));
        assert_eq!(descriptor.required_settings, vec!["volatility_symbol"]);
        assert_eq!(descriptor.plateau_parameters.len(), 2);
    }

    #[test]
    fn unknown_strategy_has_no_descriptor() {
        assert!(describe_strategy("does_not_exist").is_none());
    }
}
