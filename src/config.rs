use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::DataError;

// ---------------------------------------------------------------------------
// Preprocessing / loader configuration
// ---------------------------------------------------------------------------

/// Knobs controlling how the raw dataset is turned into minibatches.
///
/// Every field has a default, so a JSON file only needs the values that
/// differ:
///
/// ```json
/// { "batch_size": 32, "seed": 7, "crop": 0, "time_bins_sum": [2, 3, 4] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Samples per minibatch.
    pub batch_size: usize,
    /// Seed for the train/validation split and all shuffling.
    /// `None` draws from the OS.
    pub seed: Option<u64>,
    /// Fraction of the best-observed images considered for validation
    /// (half of the top `train_frac / 2` share is sampled).
    pub train_frac: f64,
    /// Keep every n-th pixel after cropping.
    pub subsample: usize,
    /// Pixels removed from each image border before subsampling.
    pub crop: usize,
    /// Time bins summed into a single response. `None` keeps the time axis.
    pub time_bins_sum: Option<Vec<usize>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: 64,
            seed: None,
            train_frac: 0.8,
            subsample: 1,
            crop: 65,
            // 40ms..110ms after image onset
            time_bins_sum: Some((0..7).collect()),
        }
    }
}

impl Config {
    /// Read a config from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = serde_json::from_str(&text).context("parsing config JSON")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DataError> {
        if self.batch_size == 0 {
            return Err(DataError::InvalidConfig("batch_size must be at least 1".into()));
        }
        if self.subsample == 0 {
            return Err(DataError::InvalidConfig("subsample must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.train_frac) {
            return Err(DataError::InvalidConfig(format!(
                "train_frac must lie in [0, 1], got {}",
                self.train_frac
            )));
        }
        if matches!(&self.time_bins_sum, Some(bins) if bins.is_empty()) {
            return Err(DataError::InvalidConfig(
                "time_bins_sum must list at least one bin (use null to keep all)".into(),
            ));
        }
        Ok(())
    }
}
