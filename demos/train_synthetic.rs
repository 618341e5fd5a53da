//! Train a linear embedder to align synthetic stacks.
//!
//! Run with: cargo run --example train_synthetic [-- config.toml]

use cycle_align::core::{ExperimentConfig, Trainer};
use cycle_align::nn::StackPairDataset;
use cycle_align::utils::save_json;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ExperimentConfig::from_file(path)?,
        None => ExperimentConfig::for_synthetic_stacks(),
    };

    let mut dataset = StackPairDataset::new(
        config.stack_size,
        config.input_dim,
        2,
        3,
        0.05,
        config.seed.unwrap_or(0),
    )?;
    let mut trainer = Trainer::new(config)?;
    let metrics = trainer.fit(&mut dataset)?;

    println!("{}", metrics.summary());
    for (name, history) in &metrics.custom_metrics {
        if let Some(last) = history.last() {
            println!("{name}: {last:.3}");
        }
    }
    save_json(&metrics, "train_synthetic_metrics.json")?;
    save_json(trainer.embedder(), "train_synthetic_embedder.json")?;
    Ok(())
}
