mod config;
mod database;
mod disk;
mod errors;
mod extractors;
mod models;
mod pipeline;
mod predictor;
mod schema;
mod sequence;
mod storage;
mod utils;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Config;
use crate::pipeline::Pipeline;


/// Parallel ETL for public genome and metagenome archives
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the pipeline configuration file
    #[arg(default_value = "etl_config.yaml")]
    config: PathBuf,
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to read configuration {}: {err}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = std::fs::create_dir_all(&config.paths.logs) {
        eprintln!("failed to create log directory {}: {err}", config.paths.logs.display());
        return ExitCode::FAILURE;
    }

    // log to stderr and to a rotating file under paths.logs
    let file_appender = tracing_appender::rolling::daily(&config.paths.logs, "pipeline.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(false),
        )
        .init();

    let mut pipeline = match Pipeline::new(config) {
        Ok(pipeline) => pipeline,
        Err(err) => {
            error!(%err, "Pipeline initialization failed");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = pipeline.run() {
        error!(%err, "Pipeline failed");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
