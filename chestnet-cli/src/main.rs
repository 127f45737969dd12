//! chestnet — train ChestNet-S on ChestMNIST and record the run in MLflow.
//!
//! Everything comes from configuration (`chestnet.toml`, `CHESTNET_*`
//! environment variables, `.env`); the binary takes no arguments.

use anyhow::Context;
use chestnet_ml::{
    ChestDataModule, ChestNetS, DataModule, TrackingSession, TrainingRunner, load_config,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Train the chest X-ray classifier and log the run to the tracking server.
#[derive(Parser, Debug)]
#[command(name = "chestnet", version, about, long_about = None)]
struct Cli {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let _cli = Cli::parse();

    // Human-readable layer for stderr, RUST_LOG or info
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    // JSON file layer for structured logging
    let log_dir = directories::ProjectDirs::from("dev", "chestnet", "chestnet")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "chestnet.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let config = load_config(Some(&workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let config = Arc::new(config);

    let session = TrackingSession::connect(
        &config.paths.mlflow_tracking_uri,
        Duration::from_secs(config.tracking.request_timeout_secs),
    )
    .context("connecting to tracking backend")?;
    tracing::info!(
        tracking_uri = %config.paths.mlflow_tracking_uri,
        backend = session.backend().name(),
        "Tracking backend ready"
    );

    let training = &config.training;
    let dataset = config.paths.dataset_path();
    let data = ChestDataModule::load(&dataset, training.batch_size, training.seed)
        .with_context(|| format!("loading dataset {}", dataset.display()))?;
    if data.num_classes() != training.num_classes {
        anyhow::bail!(
            "dataset has {} labels per image but training.num_classes is {}",
            data.num_classes(),
            training.num_classes
        );
    }

    let mut model = ChestNetS::new(
        data.num_features(),
        data.num_classes(),
        training.learning_rate,
        training.weight_decay,
        training.seed,
    )?;

    let runner = TrainingRunner::new(config.clone(), Arc::new(session));
    let summary = runner.run(&mut model, &data).await?;

    println!("Run {} {}", summary.run_id, summary.status.as_str());
    println!(
        "  epochs: {} (best {:?}, early stop: {})",
        summary.training.epochs_completed, summary.training.best_epoch, summary.training.stopped_early
    );
    println!(
        "  test loss: {:.4} over {} samples",
        summary.test.test_loss, summary.test.num_samples
    );
    if let Some(version) = &summary.model_version {
        println!("  registered {} v{}", version.name, version.version);
    }
    Ok(())
}
