use crate::models::{EquityPoint, PerformanceSummary};
use chrono::NaiveDate;
use statrs::statistics::Statistics;
use std::cmp::Ordering;

const TRADING_DAYS_PER_YEAR: f64 = 252.0;
const RISK_FREE_RATE: f64 = 0.02;

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    /// Metrics of a daily equity series, matching what the engine reports for candidates.
    pub fn calculate_performance(
        equity: &[EquityPoint],
        initial_capital: f64,
    ) -> PerformanceSummary {
        let Some(last) = equity.last() else {
            return PerformanceSummary {
                final_value: initial_capital,
                ..Default::default()
            };
        };

        let final_value = if last.value.is_finite() {
            last.value
        } else {
            initial_capital
        };
        let total_return = if initial_capital > 0.0 {
            final_value / initial_capital - 1.0
        } else {
            0.0
        };
        let annualized_return = Self::calculate_cagr(
            initial_capital,
            final_value,
            equity[0].date,
            last.date,
        );
        let returns = Self::period_returns(equity);
        let sharpe_ratio = Self::calculate_sharpe_ratio(&returns);
        let sortino_ratio = Self::calculate_sortino_ratio(&returns);
        let max_drawdown = Self::calculate_max_drawdown(equity);
        let calmar_ratio = Self::calculate_calmar_ratio(annualized_return, max_drawdown);

        PerformanceSummary {
            final_value,
            total_return,
            annualized_return,
            max_drawdown,
            sharpe_ratio,
            sortino_ratio,
            calmar_ratio,
        }
    }

    pub fn calculate_cagr(
        initial_capital: f64,
        final_value: f64,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> f64 {
        if initial_capital <= 0.0 || !final_value.is_finite() {
            return 0.0;
        }

        if end_date <= start_date {
            return 0.0;
        }

        let years = (end_date - start_date).num_days() as f64 / 365.25;
        if years <= 0.0 {
            return 0.0;
        }

        let total_return_ratio = final_value / initial_capital;
        if total_return_ratio <= 0.0 {
            return -1.0;
        }

        total_return_ratio.powf(1.0 / years) - 1.0
    }

    pub fn period_returns(equity: &[EquityPoint]) -> Vec<f64> {
        equity
            .windows(2)
            .map(|window| {
                let prev_value = window[0].value;
                let curr_value = window[1].value;
                if prev_value > 0.0 {
                    (curr_value - prev_value) / prev_value
                } else {
                    0.0
                }
            })
            .collect()
    }

    pub fn calculate_sharpe_ratio(returns: &[f64]) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }

        let mean_return = returns.mean();
        let std_dev = returns.std_dev();

        if std_dev == 0.0 || !std_dev.is_finite() {
            return 0.0;
        }

        let annualized_return = mean_return * TRADING_DAYS_PER_YEAR;
        let annualized_volatility = std_dev * TRADING_DAYS_PER_YEAR.sqrt();

        (annualized_return - RISK_FREE_RATE) / annualized_volatility
    }

    /// Same as Sharpe, but only downside deviation counts as risk.
    pub fn calculate_sortino_ratio(returns: &[f64]) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }

        let downside_sq: f64 = returns
            .iter()
            .filter(|value| **value < 0.0)
            .map(|value| value * value)
            .sum();
        let downside_dev = (downside_sq / returns.len() as f64).sqrt();
        if downside_dev == 0.0 || !downside_dev.is_finite() {
            return 0.0;
        }

        let annualized_return = returns.mean() * TRADING_DAYS_PER_YEAR;
        let annualized_downside = downside_dev * TRADING_DAYS_PER_YEAR.sqrt();

        (annualized_return - RISK_FREE_RATE) / annualized_downside
    }

    pub fn calculate_calmar_ratio(cagr: f64, max_drawdown: f64) -> f64 {
        if !cagr.is_finite() || !max_drawdown.is_finite() {
            return 0.0;
        }

        let drawdown_ratio = max_drawdown.abs();
        if drawdown_ratio <= f64::EPSILON {
            return 0.0;
        }

        cagr / drawdown_ratio
    }

    /// Largest peak-to-trough decline as a negative fraction (0.0 when none).
    pub fn calculate_max_drawdown(equity: &[EquityPoint]) -> f64 {
        Self::max_drawdown_of(equity.iter().map(|point| point.value))
    }

    pub fn max_drawdown_of<I>(values: I) -> f64
    where
        I: IntoIterator<Item = f64>,
    {
        let mut peak_value = f64::NEG_INFINITY;
        let mut max_drawdown = 0.0_f64;

        for value in values {
            if !value.is_finite() {
                continue;
            }
            if value > peak_value {
                peak_value = value;
            } else if peak_value > 0.0 {
                let drawdown = value / peak_value - 1.0;
                if drawdown < max_drawdown {
                    max_drawdown = drawdown;
                }
            }
        }

        max_drawdown
    }

    pub fn average(values: &[f64]) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;

        for value in values.iter().copied() {
            if value.is_finite() {
                sum += value;
                count += 1;
            }
        }

        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    /// Percentile with linear interpolation between closest ranks (`pct` in 0..=100).
    pub fn percentile(values: &[f64], pct: f64) -> Option<f64> {
        let mut filtered: Vec<f64> = values
            .iter()
            .copied()
            .filter(|value| value.is_finite())
            .collect();

        if filtered.is_empty() {
            return None;
        }

        filtered.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        let rank = (pct.clamp(0.0, 100.0) / 100.0) * (filtered.len() - 1) as f64;
        let lower = rank.floor() as usize;
        let upper = rank.ceil() as usize;
        let weight = rank - lower as f64;

        Some(filtered[lower] + (filtered[upper] - filtered[lower]) * weight)
    }
}
