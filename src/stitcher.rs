use crate::models::{CompleteTrade, TaggedTransaction, TradeAction, Transaction, WindowResult};
use crate::performance::PerformanceCalculator;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;

pub const TRADES_FILE: &str = "wf_trades.csv";
pub const PARAMETERS_FILE: &str = "wf_parameters.csv";
pub const EQUITY_FILE: &str = "wf_equity.csv";
pub const TRADE_RETURNS_FILE: &str = "wf_trade_returns.csv";
pub const SUMMARY_FILE: &str = "walk_forward_summary.json";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PairedTrades {
    pub trades: Vec<CompleteTrade>,
    pub unclosed_entries: usize,
    pub orphan_exits: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EquityRow {
    pub sequence: usize,
    pub date: NaiveDate,
    pub equity: f64,
}

/// One line of the per-trade return feed consumed by the Monte Carlo resampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeReturnRow {
    pub sequence: usize,
    pub exit_date: NaiveDate,
    pub window_id: u32,
    pub trade_return: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StitchedSummary {
    pub initial_capital: f64,
    pub final_equity: f64,
    pub total_return: f64,
    pub annualized_return: f64,
    pub max_drawdown: f64,
    pub total_trades: usize,
    pub win_rate: f64,
    pub unclosed_entries: usize,
    pub orphan_exits: usize,
    pub windows_attempted: usize,
    pub windows_succeeded: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StitchedResult {
    pub paired: PairedTrades,
    pub equity: Vec<EquityRow>,
    pub summary: StitchedSummary,
}

/// Read a raw transaction ledger (`date,symbol,action,price,quantity,commission,portfolio_value`).
pub fn read_transactions(path: &Path) -> Result<Vec<Transaction>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open trade ledger {}", path.display()))?;
    let mut transactions = Vec::new();
    for (idx, row) in reader.deserialize::<Transaction>().enumerate() {
        let transaction = row
            .with_context(|| format!("Malformed ledger row {} in {}", idx + 2, path.display()))?;
        transactions.push(transaction);
    }
    Ok(transactions)
}

/// Match exits to the oldest open entry of the same instrument.
///
/// Return is measured on portfolio value right after the entry versus right
/// after the exit. Entries never closed and exits with nothing open are
/// dropped and counted.
pub fn pair_trades(stream: &[TaggedTransaction]) -> PairedTrades {
    let mut open: HashMap<&str, VecDeque<&TaggedTransaction>> = HashMap::new();
    let mut paired = PairedTrades::default();

    for event in stream {
        let symbol = event.transaction.symbol.as_str();
        match event.transaction.action {
            TradeAction::Buy => open.entry(symbol).or_default().push_back(event),
            TradeAction::Sell => {
                let Some(entry) = open.get_mut(symbol).and_then(VecDeque::pop_front) else {
                    paired.orphan_exits += 1;
                    continue;
                };
                paired.trades.push(complete_trade(entry, event));
            }
        }
    }

    paired.unclosed_entries = open.values().map(VecDeque::len).sum();
    if paired.unclosed_entries > 0 {
        warn!(
            "{} entr{} left open at the end of the stream; excluded from completed trades",
            paired.unclosed_entries,
            if paired.unclosed_entries == 1 { "y" } else { "ies" }
        );
    }
    if paired.orphan_exits > 0 {
        warn!(
            "{} exit(s) had no open entry for their instrument and were dropped",
            paired.orphan_exits
        );
    }
    paired
}

fn complete_trade(entry: &TaggedTransaction, exit: &TaggedTransaction) -> CompleteTrade {
    let entry_value = entry.transaction.portfolio_value;
    let exit_value = exit.transaction.portfolio_value;
    let mut trade_return = (exit_value - entry_value) / entry_value;
    if !trade_return.is_finite() {
        warn!(
            "Trade on {} exiting {} has unusable portfolio values ({} -> {}); return set to 0",
            exit.transaction.symbol, exit.transaction.date, entry_value, exit_value
        );
        trade_return = 0.0;
    }

    CompleteTrade {
        window_id: exit.window_id,
        symbol: exit.transaction.symbol.clone(),
        entry_date: entry.transaction.date,
        entry_price: entry.transaction.price,
        exit_date: exit.transaction.date,
        exit_price: exit.transaction.price,
        quantity: entry.transaction.quantity,
        trade_return,
        total_commission: entry.transaction.commission + exit.transaction.commission,
        parameters: entry.parameters.clone(),
    }
}

/// Compound completed trades from `initial_capital` in exit-date order.
///
/// Trades sharing an exit date keep their stream order.
pub fn stitch_equity(trades: &[CompleteTrade], initial_capital: f64) -> Vec<EquityRow> {
    let mut ordered: Vec<&CompleteTrade> = trades.iter().collect();
    ordered.sort_by_key(|trade| trade.exit_date);

    let mut equity = initial_capital;
    ordered
        .into_iter()
        .enumerate()
        .map(|(idx, trade)| {
            equity *= 1.0 + trade.trade_return;
            EquityRow {
                sequence: idx + 1,
                date: trade.exit_date,
                equity,
            }
        })
        .collect()
}

pub fn stitch(
    results: &[WindowResult],
    windows_attempted: usize,
    initial_capital: f64,
) -> StitchedResult {
    let stream: Vec<TaggedTransaction> = results
        .iter()
        .flat_map(|result| result.transactions.iter().cloned())
        .collect();
    let paired = pair_trades(&stream);
    let equity = stitch_equity(&paired.trades, initial_capital);

    let final_equity = equity.last().map(|row| row.equity).unwrap_or(initial_capital);
    let total_return = if initial_capital > 0.0 {
        final_equity / initial_capital - 1.0
    } else {
        0.0
    };
    let first_date = paired.trades.iter().map(|trade| trade.entry_date).min();
    let last_date = equity.last().map(|row| row.date);
    let annualized_return = match (first_date, last_date) {
        (Some(start), Some(end)) => {
            PerformanceCalculator::calculate_cagr(initial_capital, final_equity, start, end)
        }
        _ => 0.0,
    };
    let max_drawdown = PerformanceCalculator::max_drawdown_of(
        std::iter::once(initial_capital).chain(equity.iter().map(|row| row.equity)),
    );
    let winners = paired
        .trades
        .iter()
        .filter(|trade| trade.trade_return > 0.0)
        .count();
    let win_rate = if paired.trades.is_empty() {
        0.0
    } else {
        winners as f64 / paired.trades.len() as f64
    };

    let summary = StitchedSummary {
        initial_capital,
        final_equity,
        total_return,
        annualized_return,
        max_drawdown,
        total_trades: paired.trades.len(),
        win_rate,
        unclosed_entries: paired.unclosed_entries,
        orphan_exits: paired.orphan_exits,
        windows_attempted,
        windows_succeeded: results.len(),
    };
    info!(
        "Stitched {} out-of-sample trade(s): final equity {:.2} ({:+.2}%), max drawdown {:.2}%",
        summary.total_trades,
        final_equity,
        total_return * 100.0,
        max_drawdown * 100.0
    );

    StitchedResult {
        paired,
        equity,
        summary,
    }
}

/// Write the walk-forward ledger, parameter log, equity curve, return feed and summary.
pub fn write_outputs(
    output_dir: &Path,
    results: &[WindowResult],
    stitched: &StitchedResult,
    selection_metric: &str,
    parameter_names: &[String],
) -> Result<()> {
    let path = output_dir.join(TRADES_FILE);
    let mut writer = csv::Writer::from_path(&path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for trade in &stitched.paired.trades {
        writer.serialize(trade)?;
    }
    if stitched.paired.trades.is_empty() {
        writer.write_record([
            "window_id",
            "symbol",
            "entry_date",
            "entry_price",
            "exit_date",
            "exit_price",
            "quantity",
            "trade_return",
            "total_commission",
            "parameters",
        ])?;
    }
    writer.flush()?;

    write_parameter_log(
        &output_dir.join(PARAMETERS_FILE),
        results,
        selection_metric,
        parameter_names,
    )?;

    let path = output_dir.join(EQUITY_FILE);
    let mut writer = csv::Writer::from_path(&path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(["sequence", "date", "equity"])?;
    for row in &stitched.equity {
        writer.write_record([
            row.sequence.to_string(),
            row.date.format("%Y-%m-%d").to_string(),
            row.equity.to_string(),
        ])?;
    }
    writer.flush()?;

    let path = output_dir.join(TRADE_RETURNS_FILE);
    let mut writer = csv::Writer::from_path(&path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(["sequence", "exit_date", "window_id", "trade_return"])?;
    let mut ordered: Vec<&CompleteTrade> = stitched.paired.trades.iter().collect();
    ordered.sort_by_key(|trade| trade.exit_date);
    for (idx, trade) in ordered.into_iter().enumerate() {
        writer.serialize(TradeReturnRow {
            sequence: idx + 1,
            exit_date: trade.exit_date,
            window_id: trade.window_id,
            trade_return: trade.trade_return,
        })?;
    }
    writer.flush()?;

    let path = output_dir.join(SUMMARY_FILE);
    std::fs::write(&path, serde_json::to_string_pretty(&stitched.summary)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn write_parameter_log(
    path: &Path,
    results: &[WindowResult],
    selection_metric: &str,
    parameter_names: &[String],
) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut header: Vec<String> = [
        "window_id",
        "is_start",
        "is_end",
        "oos_start",
        "oos_end",
        "symbol_set",
        "selection_metric",
        "selection_value",
        "oos_total_return",
        "oos_trades",
    ]
    .iter()
    .map(|column| column.to_string())
    .collect();
    header.extend(parameter_names.iter().cloned());
    writer.write_record(&header)?;

    for result in results {
        let window = &result.window;
        let mut record = vec![
            window.id.to_string(),
            window.is_start.to_string(),
            window.is_end.to_string(),
            window.oos_start.to_string(),
            window.oos_end.to_string(),
            result.symbol_set.clone(),
            selection_metric.to_string(),
            result.selection_value.to_string(),
            result.oos_metrics.total_return.to_string(),
            result.oos_metrics.total_trades.to_string(),
        ];
        record.extend(parameter_names.iter().map(|name| {
            result
                .selected
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

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn event(
        window_id: u32,
        day: NaiveDate,
        symbol: &str,
        action: TradeAction,
        portfolio_value: f64,
    ) -> TaggedTransaction {
        TaggedTransaction {
            window_id,
            parameters: "sma_period=200".to_string(),
            transaction: Transaction {
                date: day,
                symbol: symbol.to_string(),
                action,
                price: 100.0,
                quantity: 10.0,
                commission: 1.0,
                portfolio_value,
            },
        }
    }

    fn trade(exit_date: NaiveDate, trade_return: f64) -> CompleteTrade {
        CompleteTrade {
            window_id: 1,
            symbol: "TQQQ".to_string(),
            entry_date: date(2020, 1, 1),
            entry_price: 100.0,
            exit_date,
            exit_price: 100.0 * (1.0 + trade_return),
            quantity: 1.0,
            trade_return,
            total_commission: 0.0,
            parameters: String::new(),
        }
    }

    #[test]
    fn buy_then_sell_produces_one_trade() {
        let stream = vec![
            event(1, date(2020, 1, 2), "TQQQ", TradeAction::Buy, 10_000.0),
            event(1, date(2020, 2, 3), "TQQQ", TradeAction::Sell, 10_500.0),
        ];
        let paired = pair_trades(&stream);

        assert_eq!(paired.trades.len(), 1);
        assert_eq!(paired.unclosed_entries, 0);
        let trade = &paired.trades[0];
        assert!((trade.trade_return - 0.05).abs() < 1e-12);
        assert!((trade.total_commission - 2.0).abs() < 1e-12);
        assert_eq!(trade.entry_date, date(2020, 1, 2));
        assert_eq!(trade.exit_date, date(2020, 2, 3));
    }

    #[test]
    fn trailing_entry_is_counted_as_unclosed() {
        let stream = vec![event(1, date(2020, 1, 2), "TQQQ", TradeAction::Buy, 10_000.0)];
        let paired = pair_trades(&stream);
        assert!(paired.trades.is_empty());
        assert_eq!(paired.unclosed_entries, 1);
    }

    #[test]
    fn exits_match_oldest_entry_per_symbol() {
        let stream = vec![
            event(1, date(2020, 1, 2), "TQQQ", TradeAction::Buy, 10_000.0),
            event(1, date(2020, 1, 3), "TMF", TradeAction::Buy, 10_100.0),
            event(1, date(2020, 1, 6), "TQQQ", TradeAction::Buy, 10_200.0),
            event(1, date(2020, 1, 9), "TQQQ", TradeAction::Sell, 11_000.0),
            event(1, date(2020, 1, 10), "SQQQ", TradeAction::Sell, 11_000.0),
        ];
        let paired = pair_trades(&stream);

        assert_eq!(paired.trades.len(), 1);
        assert_eq!(paired.trades[0].entry_date, date(2020, 1, 2));
        assert!((paired.trades[0].trade_return - 0.1).abs() < 1e-12);
        assert_eq!(paired.unclosed_entries, 2);
        assert_eq!(paired.orphan_exits, 1);
    }

    #[test]
    fn compounding_ignores_pre_sort_order() {
        let later = trade(date(2020, 6, 1), 0.01);
        let earlier = trade(date(2020, 3, 1), 0.02);
        let equity = stitch_equity(&[later, earlier], 10_000.0);

        assert_eq!(equity.len(), 2);
        assert_eq!(equity[0].date, date(2020, 3, 1));
        assert!((equity[1].equity - 10_000.0 * 1.02 * 1.01).abs() < 1e-6);
    }

    #[test]
    fn equal_exit_dates_keep_stream_order() {
        let mut first = trade(date(2020, 3, 1), 0.5);
        first.symbol = "FIRST".to_string();
        let mut second = trade(date(2020, 3, 1), -0.5);
        second.symbol = "SECOND".to_string();
        let equity = stitch_equity(&[first, second], 100.0);
        assert!((equity[0].equity - 150.0).abs() < 1e-9);
        assert!((equity[1].equity - 75.0).abs() < 1e-9);
    }

    #[test]
    fn reads_ledger_with_lowercase_actions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.csv");
        std::fs::write(
            &path,
            "date,symbol,action,price,quantity,commission,portfolio_value\n\
             2020-01-02,TQQQ,buy,50.0,20,1.0,9999.0\n\
             2020-01-09,TQQQ,SELL,55.0,20,1.0,10098.0\n",
        )
        .unwrap();

        let transactions = read_transactions(&path).unwrap();
        assert_eq!(transactions.len(), 2);
        assert_eq!(transactions[0].action, TradeAction::Buy);
        assert_eq!(transactions[1].action, TradeAction::Sell);
        assert!((transactions[1].portfolio_value - 10_098.0).abs() < 1e-9);
    }
}
