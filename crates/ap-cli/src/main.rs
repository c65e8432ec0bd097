// AutoPipe command-line runner
// Usage: autopipe <train.csv> <validation.csv> [config.json]

mod loader;

use std::sync::Arc;

use anyhow::Context;
use ap_engine::standard_context;
use ap_search::{AutoMlExperiment, LoggingObserver, SearchConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn load_config(path: Option<String>) -> anyhow::Result<SearchConfig> {
    let path = path.or_else(|| std::env::var("AUTOPIPE_CONFIG").ok());
    match path {
        Some(path) => SearchConfig::from_json_file(&path)
            .with_context(|| format!("failed to load search config from {path}")),
        None => {
            warn!("No search config given; using defaults");
            Ok(SearchConfig::default())
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(train_path), Some(valid_path)) = (args.next(), args.next()) else {
        anyhow::bail!("usage: autopipe <train.csv> <validation.csv> [config.json]");
    };
    let config = load_config(args.next())?;

    let train = loader::load_csv(&train_path)
        .with_context(|| format!("failed to load training data {train_path}"))?
        .into_handle();
    let valid = loader::load_csv(&valid_path)
        .with_context(|| format!("failed to load validation data {valid_path}"))?
        .into_handle();

    let context = standard_context(config.task, config.roles());
    let experiment = AutoMlExperiment::new(config).add_observer(Arc::new(LoggingObserver));
    let result = experiment.fit(context, train, valid)?;

    match result.best() {
        Some(best) => info!(
            "Best pipeline: {} ({:.6})",
            best,
            best.metric_value().unwrap_or(f64::NAN)
        ),
        None => warn!("No pipeline completed successfully"),
    }
    println!("{}", serde_json::to_string_pretty(&result.records())?);
    Ok(())
}
