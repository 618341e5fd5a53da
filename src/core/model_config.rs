//! Loss and experiment configuration
//!
//! Configuration is parsed and validated once, then passed by reference.
//! An experiment file looks like:
//!
//! ```toml
//! stack_size = 16
//! input_dim = 12
//! embedding_dim = 4
//! num_epochs = 30
//! batches_per_epoch = 8
//! accuracy_metrics = ["cycle", "alignment"]
//!
//! [loss]
//! metric = "squared-euclidean"
//! temperature = 1.0
//!
//! [optimizer]
//! kind = "adam"
//! learning_rate = 0.01
//! schedule = { boundaries = [100, 200], values = [0.01, 0.005, 0.001] }
//! ```

use super::metric::Metric;
use super::similarity::check_temperature;
use crate::{CycleAlignError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Metric and temperature of the cycle-consistency loss
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    /// Row comparison metric
    pub metric: Metric,
    /// Softmax temperature, strictly positive
    pub temperature: f64,
}

impl LossConfig {
    /// Create a validated loss configuration
    pub fn new(metric: Metric, temperature: f64) -> Result<Self> {
        let config = LossConfig { metric, temperature };
        config.validate()?;
        Ok(config)
    }

    /// Parse the metric from its name, then validate
    pub fn from_names(metric: &str, temperature: f64) -> Result<Self> {
        Self::new(metric.parse()?, temperature)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        check_temperature(self.temperature)
    }
}

impl Default for LossConfig {
    fn default() -> Self {
        LossConfig {
            metric: Metric::SquaredEuclidean,
            temperature: 1.0,
        }
    }
}

/// Optimizer family
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    /// Plain stochastic gradient descent
    Sgd,
    /// Adam with default moment decay
    Adam,
}

/// Piecewise-constant learning-rate schedule.
///
/// `values[k]` applies from `boundaries[k - 1]` (inclusive) up to
/// `boundaries[k]` (exclusive).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PiecewiseSchedule {
    /// Step indices where the value changes, strictly increasing
    pub boundaries: Vec<usize>,
    /// One more value than boundaries
    pub values: Vec<f64>,
}

impl PiecewiseSchedule {
    /// Value in effect at `step`
    pub fn value_at(&self, step: usize) -> f64 {
        let k = self.boundaries.partition_point(|&b| b <= step);
        self.values[k]
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.values.len() != self.boundaries.len() + 1 {
            return Err(CycleAlignError::InvalidConfiguration(format!(
                "schedule needs {} values for {} boundaries, got {}",
                self.boundaries.len() + 1,
                self.boundaries.len(),
                self.values.len()
            )));
        }
        if self.boundaries.windows(2).any(|w| w[0] >= w[1]) {
            return Err(CycleAlignError::InvalidConfiguration(format!(
                "schedule boundaries must be strictly increasing, got {:?}",
                self.boundaries
            )));
        }
        if let Some(v) = self.values.iter().find(|v| !(**v > 0.0 && v.is_finite())) {
            return Err(CycleAlignError::InvalidConfiguration(format!(
                "schedule learning rate must be positive, got {v}"
            )));
        }
        Ok(())
    }
}

/// Optimizer selection and learning rate
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Optimizer family
    pub kind: OptimizerKind,
    /// Base learning rate, used when no schedule is given
    pub learning_rate: f64,
    /// Optional piecewise schedule overriding `learning_rate`
    #[serde(default)]
    pub schedule: Option<PiecewiseSchedule>,
}

impl OptimizerConfig {
    /// Learning rate at optimizer step `step`
    pub fn learning_rate_at(&self, step: usize) -> f64 {
        match &self.schedule {
            Some(schedule) => schedule.value_at(step),
            None => self.learning_rate,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(CycleAlignError::InvalidConfiguration(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if let Some(schedule) = &self.schedule {
            schedule.validate()?;
        }
        Ok(())
    }
}

/// Accuracy reported after each epoch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccuracyMetric {
    /// Hard nearest neighbour of the hard nearest neighbour is the row itself
    Cycle,
    /// Row argmax of the soft assignment hits the true counterpart
    Alignment,
}

impl AccuracyMetric {
    /// Key used in [`TrainingMetrics`](crate::core::TrainingMetrics)
    pub fn name(self) -> &'static str {
        match self {
            AccuracyMetric::Cycle => "cycle_accuracy",
            AccuracyMetric::Alignment => "alignment_accuracy",
        }
    }
}

fn default_symmetric() -> bool {
    true
}

fn default_batches_per_epoch() -> usize {
    8
}

/// Full training experiment configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Loss metric and temperature
    pub loss: LossConfig,
    /// Rows per stack
    pub stack_size: usize,
    /// Raw sample dimension fed to the embedder
    pub input_dim: usize,
    /// Embedding dimension
    pub embedding_dim: usize,
    /// Optimizer
    pub optimizer: OptimizerConfig,
    /// Number of epochs
    pub num_epochs: usize,
    /// Optimizer steps per epoch
    #[serde(default = "default_batches_per_epoch")]
    pub batches_per_epoch: usize,
    /// Stack pairs per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Sum the loss over both directions
    #[serde(default = "default_symmetric")]
    pub symmetric: bool,
    /// Accuracies reported per epoch
    #[serde(default)]
    pub accuracy_metrics: Vec<AccuracyMetric>,
    /// Random seed for initialization and data
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_batch_size() -> usize {
    4
}

impl ExperimentConfig {
    /// Config for the synthetic latent/nuisance stack task
    pub fn for_synthetic_stacks() -> Self {
        ExperimentConfig {
            loss: LossConfig {
                metric: Metric::SquaredEuclidean,
                temperature: 1.0,
            },
            stack_size: 16,
            input_dim: 12,
            embedding_dim: 4,
            optimizer: OptimizerConfig {
                kind: OptimizerKind::Adam,
                learning_rate: 0.01,
                schedule: None,
            },
            num_epochs: 30,
            batches_per_epoch: default_batches_per_epoch(),
            batch_size: default_batch_size(),
            symmetric: true,
            accuracy_metrics: vec![AccuracyMetric::Cycle, AccuracyMetric::Alignment],
            seed: Some(42),
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(contents: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&contents),
            Some("json") => Self::from_json_str(&contents),
            other => Err(CycleAlignError::InvalidConfiguration(format!(
                "unsupported config extension {:?} for '{}'",
                other,
                path.display()
            ))),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.loss.validate()?;
        self.optimizer.validate()?;

        let positive = [
            ("stack_size", self.stack_size),
            ("input_dim", self.input_dim),
            ("embedding_dim", self.embedding_dim),
            ("num_epochs", self.num_epochs),
            ("batches_per_epoch", self.batches_per_epoch),
            ("batch_size", self.batch_size),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(CycleAlignError::InvalidConfiguration(format!(
                    "{field} must be positive"
                )));
            }
        }
        Ok(())
    }
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self::for_synthetic_stacks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let mut config = ExperimentConfig::default();
        assert!(config.validate().is_ok());

        config.stack_size = 0;
        assert!(config.validate().is_err());

        config.stack_size = 8;
        config.loss.temperature = 0.0;
        assert!(config.validate().is_err());

        config.loss.temperature = 0.5;
        config.optimizer.learning_rate = -0.001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_loss_config_rejects_bad_values() {
        assert!(LossConfig::from_names("cosine", 0.1).is_ok());
        assert!(matches!(
            LossConfig::from_names("manhattan-typo", 1.0),
            Err(CycleAlignError::InvalidConfiguration(_))
        ));
        let err = LossConfig::new(Metric::Euclidean, -2.0).unwrap_err();
        assert!(err.to_string().contains("-2"));
    }

    #[test]
    fn test_piecewise_schedule() {
        let schedule = PiecewiseSchedule {
            boundaries: vec![10, 20],
            values: vec![1.0, 0.5, 0.1],
        };
        assert!(schedule.validate().is_ok());
        assert_eq!(schedule.value_at(0), 1.0);
        assert_eq!(schedule.value_at(9), 1.0);
        assert_eq!(schedule.value_at(10), 0.5);
        assert_eq!(schedule.value_at(19), 0.5);
        assert_eq!(schedule.value_at(1000), 0.1);

        let bad = PiecewiseSchedule {
            boundaries: vec![20, 10],
            values: vec![1.0, 0.5, 0.1],
        };
        assert!(bad.validate().is_err());
        let short = PiecewiseSchedule {
            boundaries: vec![10],
            values: vec![1.0],
        };
        assert!(short.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_from_document() {
        let doc = r#"
            stack_size = 8
            input_dim = 6
            embedding_dim = 3
            num_epochs = 5
            accuracy_metrics = ["cycle"]

            [loss]
            metric = "cosine"
            temperature = 0.1

            [optimizer]
            kind = "sgd"
            learning_rate = 0.1
            schedule = { boundaries = [3], values = [0.1, 0.01] }
        "#;
        let config = ExperimentConfig::from_toml_str(doc).unwrap();
        assert_eq!(config.loss.metric, Metric::Cosine);
        assert_eq!(config.optimizer.kind, OptimizerKind::Sgd);
        assert_eq!(config.optimizer.learning_rate_at(5), 0.01);
        assert_eq!(config.batches_per_epoch, 8);
        assert!(config.symmetric);
        assert_eq!(config.accuracy_metrics, vec![AccuracyMetric::Cycle]);
    }

    #[test]
    fn test_unknown_metric_fails_at_parse_time() {
        let doc = r#"
            stack_size = 8
            input_dim = 6
            embedding_dim = 3
            num_epochs = 5

            [loss]
            metric = "hamming"
            temperature = 1.0

            [optimizer]
            kind = "adam"
            learning_rate = 0.1
        "#;
        assert!(matches!(
            ExperimentConfig::from_toml_str(doc),
            Err(CycleAlignError::TomlError(_))
        ));
    }

    #[test]
    fn test_json_and_file_loading() {
        let config = ExperimentConfig::for_synthetic_stacks();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(ExperimentConfig::from_json_str(&json).unwrap(), config);

        let path = std::env::temp_dir().join("cycle_align_config_test.yaml");
        std::fs::write(&path, "stack_size: 1").unwrap();
        assert!(matches!(
            ExperimentConfig::from_file(&path),
            Err(CycleAlignError::InvalidConfiguration(_))
        ));
        std::fs::remove_file(path).ok();
    }
}
