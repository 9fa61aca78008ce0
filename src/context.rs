use crate::backtester::CommandEngine;
use crate::data_context::{CsvPriceStore, PriceStore, StaticPriceStore};
use anyhow::Result;
use log::warn;
use std::path::{Path, PathBuf};

/// Collaborators shared by the commands: the backtest engine and the price store.
#[derive(Clone, Debug, Default)]
pub struct AppContext {
    engine_command: Option<String>,
    data_dir: Option<PathBuf>,
}

impl AppContext {
    pub fn new(engine_command: Option<String>, data_dir: Option<PathBuf>) -> Self {
        Self {
            engine_command,
            data_dir,
        }
    }

    pub fn engine(&self) -> Result<CommandEngine> {
        let command = self.engine_command.as_deref().unwrap_or_default();
        CommandEngine::from_command_line(command)
    }

    /// Without a data directory no baseline can be computed; grid searches then
    /// report alpha as not applicable.
    pub fn price_store(&self) -> Box<dyn PriceStore> {
        match self.data_dir.as_deref() {
            Some(dir) => Box::new(CsvPriceStore::new(dir)),
            None => {
                warn!("No --data-dir given; benchmark baseline will be unavailable");
                Box::new(StaticPriceStore::new())
            }
        }
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn missing_engine_command_is_an_error() {
        assert!(AppContext::default().engine().is_err());
        assert!(AppContext::new(Some("python3 run.py".to_string()), None)
            .engine()
            .is_ok());
    }

    #[test]
    fn store_without_data_dir_has_no_prices() {
        let store = AppContext::default().price_store();
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2021, 1, 1).unwrap();
        let closes = store.closes("SPY", start, end).unwrap_or_default();
        assert!(closes.is_empty());
    }
}
