pub mod backtester;
pub mod baseline;
pub mod checkpoint;
pub mod combinations;
pub mod commands;
pub mod config;
pub mod context;
pub mod data_context;
pub mod error;
pub mod models;
pub mod monte_carlo;
pub mod optimizer;
pub mod optimizer_status;
pub mod param_utils;
pub mod performance;
pub mod robustness;
pub mod stitcher;
pub mod strategy;
pub mod summary;
pub mod verdict;
pub mod walkforward;
