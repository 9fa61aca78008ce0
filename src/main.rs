use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use robustopt::{
    commands::{analyze, monte_carlo, optimize, walk_forward},
    config::Metric,
    context::AppContext,
    monte_carlo::{MonteCarloConfig, DEFAULT_SEED, DEFAULT_SIMULATIONS},
    robustness::DEFAULT_BENCHMARK_ANNUAL_RETURN,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "robustopt")]
#[command(about = "Parameter optimization and robustness validation for strategy backtests")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every parameter combination of a configuration (resumes from checkpoint)
    Optimize {
        /// Configuration document (.yaml, .yml or .json)
        config: PathBuf,
        /// Output directory for runs, summary and checkpoint
        #[arg(short, long, value_name = "DIR")]
        output: PathBuf,
        /// Backtest engine command line, e.g. "python3 run_backtest.py"
        #[arg(long, value_name = "CMD")]
        engine: String,
        /// Directory with <SYMBOL>.csv price files for the benchmark baseline
        #[arg(long = "data-dir", value_name = "DIR")]
        data_dir: Option<PathBuf>,
        /// Ignore and delete any existing checkpoint
        #[arg(long)]
        fresh: bool,
    },
    /// Re-optimize in-sample and validate out-of-sample across sliding windows
    WalkForward {
        /// Configuration document with a walk_forward block
        config: PathBuf,
        #[arg(short, long, value_name = "DIR")]
        output: PathBuf,
        #[arg(long, value_name = "CMD")]
        engine: String,
        #[arg(long = "data-dir", value_name = "DIR")]
        data_dir: Option<PathBuf>,
    },
    /// Filter, cluster, stress-test and classify the runs of a summary CSV
    Analyze {
        /// summary.csv written by `optimize`
        summary: PathBuf,
        #[arg(short, long, value_name = "DIR")]
        output: PathBuf,
        /// Strategy name, used to look up its plateau parameters
        #[arg(long)]
        strategy: Option<String>,
        /// Ranking metric for the percentile filter
        #[arg(long, default_value = "calmar_ratio")]
        metric: String,
        /// Annual return a year must beat to count as consistent
        #[arg(long, default_value_t = DEFAULT_BENCHMARK_ANNUAL_RETURN)]
        benchmark_annual_return: f64,
    },
    /// Bootstrap the walk-forward trade return feed
    MonteCarlo {
        /// wf_trade_returns.csv written by `walk-forward`
        returns: PathBuf,
        #[arg(short, long, value_name = "DIR")]
        output: PathBuf,
        #[arg(long, default_value_t = DEFAULT_SIMULATIONS)]
        simulations: usize,
        #[arg(long, default_value_t = DEFAULT_SEED)]
        seed: u64,
        #[arg(long, default_value_t = 10_000.0)]
        initial_capital: f64,
    },
}

fn main() -> Result<()> {
    let Cli { command } = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting robustopt. Backtest results are not a promise of future returns.");

    match command {
        Commands::Optimize {
            config,
            output,
            engine,
            data_dir,
            fresh,
        } => {
            let app = AppContext::new(Some(engine), data_dir);
            optimize::run(&app, &config, &output, fresh)?;
        }
        Commands::WalkForward {
            config,
            output,
            engine,
            data_dir,
        } => {
            let app = AppContext::new(Some(engine), data_dir);
            walk_forward::run(&app, &config, &output)?;
        }
        Commands::Analyze {
            summary,
            output,
            strategy,
            metric,
            benchmark_annual_return,
        } => {
            let metric = Metric::parse(&metric)?;
            analyze::run(
                &summary,
                &output,
                strategy.as_deref(),
                metric,
                benchmark_annual_return,
            )?;
        }
        Commands::MonteCarlo {
            returns,
            output,
            simulations,
            seed,
            initial_capital,
        } => {
            let config = MonteCarloConfig {
                simulations,
                seed,
                initial_capital,
            };
            monte_carlo::run(&returns, &output, &config)?;
        }
    }

    Ok(())
}
