use thiserror::Error;

/// Failures that callers are expected to tell apart.
///
/// Hard failures (configuration, zero usable windows or runs, every window
/// failing) surface through `anyhow::Error` and can be recovered with
/// `downcast_ref::<OptimizerError>()`. Window-level variants are caught by the
/// walk-forward loop and only logged.
#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error("configuration error in `{field}`: {reason}")]
    Config { field: String, reason: String },

    #[error("window calculation error: {0}")]
    Window(String),

    #[error("optimization failed for window {window_id}: {reason}")]
    Optimization { window_id: u32, reason: String },

    #[error("out-of-sample test failed for window {window_id}: {reason}")]
    Testing { window_id: u32, reason: String },

    #[error("all {attempted} walk-forward windows failed")]
    AllWindowsFailed { attempted: usize },

    #[error("no runs were generated for the configured grid")]
    NoRuns,
}

impl OptimizerError {
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        OptimizerError::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
