use crate::models::EquityPoint;
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Read-only access to daily closing prices.
pub trait PriceStore {
    /// Closes for `symbol` within `[start, end]`, sorted by date.
    fn closes(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<EquityPoint>>;
}

/// Price history stored as one `<SYMBOL>.csv` file per instrument.
///
/// Files need a `date` column and a `close` column; `adj_close` wins when present.
pub struct CsvPriceStore {
    data_dir: PathBuf,
}

impl CsvPriceStore {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, symbol: &str) -> PathBuf {
        let file_name = symbol.trim().replace(['/', '\\', '^'], "_");
        self.data_dir.join(format!("{}.csv", file_name))
    }
}

impl PriceStore for CsvPriceStore {
    fn closes(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<EquityPoint>> {
        let path = self.path_for(symbol);
        let mut reader = csv::Reader::from_path(&path)
            .with_context(|| format!("Failed to open price history {}", path.display()))?;

        let headers = reader.headers()?.clone();
        let column = |name: &str| {
            headers
                .iter()
                .position(|header| header.trim().eq_ignore_ascii_case(name))
        };
        let date_idx = column("date")
            .ok_or_else(|| anyhow!("{} has no date column", path.display()))?;
        let close_idx = column("adj_close")
            .or_else(|| column("close"))
            .ok_or_else(|| anyhow!("{} has no close column", path.display()))?;

        let mut points = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record.with_context(|| {
                format!("Malformed row {} in {}", line + 2, path.display())
            })?;
            let raw_date = record.get(date_idx).unwrap_or_default().trim();
            // Accept both plain dates and timestamps with a date prefix.
            let date_part = raw_date.get(..10).unwrap_or(raw_date);
            let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").with_context(|| {
                format!("Invalid date '{}' in {}", raw_date, path.display())
            })?;
            if date < start || date > end {
                continue;
            }
            let Ok(value) = record.get(close_idx).unwrap_or_default().trim().parse::<f64>() else {
                continue;
            };
            if value.is_finite() && value > 0.0 {
                points.push(EquityPoint { date, value });
            }
        }

        points.sort_by_key(|point| point.date);
        Ok(points)
    }
}

/// In-memory price store, mostly for programmatic use and tests.
#[derive(Default)]
pub struct StaticPriceStore {
    series: HashMap<String, Vec<EquityPoint>>,
}

impl StaticPriceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: &str, mut points: Vec<EquityPoint>) {
        points.sort_by_key(|point| point.date);
        self.series.insert(symbol.to_string(), points);
    }
}

impl PriceStore for StaticPriceStore {
    fn closes(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<EquityPoint>> {
        let points = self
            .series
            .get(symbol)
            .ok_or_else(|| anyhow!("No price history for {}", symbol))?;
        Ok(points
            .iter()
            .filter(|point| point.date >= start && point.date <= end)
            .copied()
            .collect())
    }
}
