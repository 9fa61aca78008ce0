use crate::data_context::PriceStore;
use crate::models::{EquityPoint, PerformanceSummary};
use crate::performance::PerformanceCalculator;
use chrono::NaiveDate;
use log::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct BaselineResult {
    pub symbol: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub observations: usize,
    pub performance: PerformanceSummary,
}

/// Buy-and-hold reference over the same range candidates are evaluated on.
///
/// Returns `None` when fewer than two prices are available or the store cannot
/// provide the series; callers treat that as "no baseline".
pub fn calculate_baseline(
    store: &dyn PriceStore,
    symbol: &str,
    start_date: NaiveDate,
    end_date: NaiveDate,
    initial_capital: f64,
) -> Option<BaselineResult> {
    let closes = match store.closes(symbol, start_date, end_date) {
        Ok(closes) => closes,
        Err(err) => {
            warn!("Baseline {} unavailable: {:#}", symbol, err);
            return None;
        }
    };

    if closes.len() < 2 {
        warn!(
            "Baseline {} has {} price observation(s) between {} and {}; skipping baseline",
            symbol,
            closes.len(),
            start_date,
            end_date
        );
        return None;
    }

    let equity = buy_and_hold_equity(&closes, initial_capital);
    let performance = PerformanceCalculator::calculate_performance(&equity, initial_capital);
    info!(
        "Baseline {} buy-and-hold: total return {:.2}%, CAGR {:.2}%, max drawdown {:.2}%",
        symbol,
        performance.total_return * 100.0,
        performance.annualized_return * 100.0,
        performance.max_drawdown * 100.0
    );

    Some(BaselineResult {
        symbol: symbol.to_string(),
        start_date,
        end_date,
        observations: closes.len(),
        performance,
    })
}

fn buy_and_hold_equity(closes: &[EquityPoint], initial_capital: f64) -> Vec<EquityPoint> {
    let first_close = closes[0].value;
    let shares = initial_capital / first_close;
    closes
        .iter()
        .map(|point| EquityPoint {
            date: point.date,
            value: shares * point.value,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_context::StaticPriceStore;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn builds_buy_and_hold_reference() {
        let mut store = StaticPriceStore::new();
        store.insert(
            "SPY",
            vec![
                EquityPoint { date: date(2020, 1, 2), value: 100.0 },
                EquityPoint { date: date(2020, 6, 1), value: 80.0 },
                EquityPoint { date: date(2020, 12, 31), value: 110.0 },
            ],
        );

        let baseline =
            calculate_baseline(&store, "SPY", date(2020, 1, 1), date(2020, 12, 31), 10_000.0)
                .expect("baseline");
        assert_eq!(baseline.observations, 3);
        assert!((baseline.performance.final_value - 11_000.0).abs() < 1e-9);
        assert!((baseline.performance.total_return - 0.10).abs() < 1e-9);
        assert!((baseline.performance.max_drawdown + 0.20).abs() < 1e-9);
    }

    #[test]
    fn single_observation_means_no_baseline() {
        let mut store = StaticPriceStore::new();
        store.insert(
            "SPY",
            vec![EquityPoint { date: date(2020, 1, 2), value: 100.0 }],
        );
        assert!(
            calculate_baseline(&store, "SPY", date(2020, 1, 1), date(2020, 12, 31), 10_000.0)
                .is_none()
        );
        assert!(
            calculate_baseline(&store, "QQQ", date(2020, 1, 1), date(2020, 12, 31), 10_000.0)
                .is_none()
        );
    }
}
