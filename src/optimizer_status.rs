use std::sync::{Arc, Mutex};

/// Shared progress of a grid search, readable while the run is in flight.
#[derive(Clone, Default)]
pub struct OptimizerStatus {
    inner: Arc<Mutex<OptimizerStatusData>>,
}

#[derive(Default)]
struct OptimizerStatusData {
    phase: String,
    total_runs: usize,
    completed_runs: usize,
    failed_runs: usize,
    skipped_runs: usize,
    best_calmar: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OptimizerStatusSnapshot {
    pub phase: String,
    pub total_runs: usize,
    pub completed_runs: usize,
    pub failed_runs: usize,
    pub skipped_runs: usize,
    pub best_calmar: Option<f64>,
}

impl OptimizerStatus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(OptimizerStatusData {
                phase: "Initializing".to_string(),
                ..Default::default()
            })),
        }
    }

    pub fn set_phase<S: Into<String>>(&self, phase: S) {
        if let Ok(mut data) = self.inner.lock() {
            data.phase = phase.into();
        }
    }

    pub fn start(&self, total_runs: usize, skipped_runs: usize) {
        if let Ok(mut data) = self.inner.lock() {
            data.total_runs = total_runs;
            data.skipped_runs = skipped_runs;
            data.completed_runs = 0;
            data.failed_runs = 0;
            data.best_calmar = None;
        }
    }

    pub fn record_success(&self, calmar_ratio: f64) {
        if let Ok(mut data) = self.inner.lock() {
            data.completed_runs += 1;
            if calmar_ratio.is_finite()
                && data
                    .best_calmar
                    .map(|best| calmar_ratio > best)
                    .unwrap_or(true)
            {
                data.best_calmar = Some(calmar_ratio);
            }
        }
    }

    pub fn record_failure(&self) {
        if let Ok(mut data) = self.inner.lock() {
            data.failed_runs += 1;
        }
    }

    pub fn snapshot(&self) -> OptimizerStatusSnapshot {
        if let Ok(data) = self.inner.lock() {
            OptimizerStatusSnapshot {
                phase: data.phase.clone(),
                total_runs: data.total_runs,
                completed_runs: data.completed_runs,
                failed_runs: data.failed_runs,
                skipped_runs: data.skipped_runs,
                best_calmar: data.best_calmar,
            }
        } else {
            OptimizerStatusSnapshot {
                phase: "Status unavailable".to_string(),
                total_runs: 0,
                completed_runs: 0,
                failed_runs: 0,
                skipped_runs: 0,
                best_calmar: None,
            }
        }
    }
}
