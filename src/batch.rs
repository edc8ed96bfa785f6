//! Minibatch iteration over a prepared split.
//!
//! ```text
//!  CsrfData ──split()──▶ SplitData ──BatchLoader::new──▶ epoch() ──▶ Batch, Batch, ...
//! ```

use std::path::Path;

use anyhow::Context;
use ndarray::{Array4, ArrayD, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::data::dataset::{CsrfData, SplitData};
use crate::data::loader;
use crate::data::preprocess::{valid_fraction, ImageStats};
use crate::data::split::Split;
use crate::error::{DataError, Result};

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// One minibatch, row-aligned across its three tensors.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// `(batch, channels, height, width)`
    pub images: Array4<f32>,
    pub responses: ArrayD<f32>,
    /// 1.0 where the response is real, 0.0 where it was missing.
    pub valid: ArrayD<f32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.images.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// BatchLoader
// ---------------------------------------------------------------------------

/// Serves a split as minibatches, reshuffling at the start of every epoch.
#[derive(Debug, Clone)]
pub struct BatchLoader {
    images: Array4<f32>,
    responses: ArrayD<f32>,
    valid: ArrayD<f32>,
    batch_size: usize,
    shuffle: bool,
    order: Vec<usize>,
    rng: StdRng,
}

impl BatchLoader {
    /// Images are moved to channel-first layout, validity to 0/1 floats.
    pub fn new(data: SplitData, batch_size: usize, shuffle: bool, seed: u64) -> Result<Self> {
        if batch_size == 0 {
            return Err(DataError::InvalidConfig("batch_size must be at least 1".into()));
        }
        let n = data.len();
        log::debug!(
            "batch loader over {n} samples, {:.1}% valid responses",
            100.0 * valid_fraction(&data.valid)
        );
        let images = data
            .images
            .permuted_axes([0, 3, 1, 2])
            .as_standard_layout()
            .into_owned();
        let valid = data.valid.mapv(|v| if v { 1.0 } else { 0.0 });

        Ok(Self {
            images,
            responses: data.responses,
            valid,
            batch_size,
            shuffle,
            order: (0..n).collect(),
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batches per epoch; the last one may be short.
    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    /// `(channels, height, width)` of a single sample.
    pub fn image_shape(&self) -> (usize, usize, usize) {
        let s = self.images.shape();
        (s[1], s[2], s[3])
    }

    pub fn response_shape(&self) -> &[usize] {
        &self.responses.shape()[1..]
    }

    pub fn valid_fraction(&self) -> f64 {
        if self.valid.is_empty() {
            return 0.0;
        }
        self.valid.sum() as f64 / self.valid.len() as f64
    }

    /// Start a new pass over the data.
    pub fn epoch(&mut self) -> Batches<'_> {
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
        Batches {
            loader: self,
            position: 0,
        }
    }

    fn batch(&self, indices: &[usize]) -> Batch {
        Batch {
            images: self.images.select(Axis(0), indices),
            responses: self.responses.select(Axis(0), indices),
            valid: self.valid.select(Axis(0), indices),
        }
    }
}

/// Iterator over one epoch of a [`BatchLoader`].
pub struct Batches<'a> {
    loader: &'a BatchLoader,
    position: usize,
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        let order = &self.loader.order;
        if self.position >= order.len() {
            return None;
        }
        let end = (self.position + self.loader.batch_size).min(order.len());
        let batch = self.loader.batch(&order[self.position..end]);
        self.position = end;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self
            .loader
            .len()
            .saturating_sub(self.position)
            .div_ceil(self.loader.batch_size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Batches<'_> {}

// ---------------------------------------------------------------------------
// The three loaders together
// ---------------------------------------------------------------------------

/// Train, validation and test loaders built from one recording.
#[derive(Debug, Clone)]
pub struct CsrfLoaders {
    pub train: BatchLoader,
    pub validation: BatchLoader,
    pub test: BatchLoader,
    image_stats: ImageStats,
}

impl CsrfLoaders {
    /// Wrap every split of `data` in a shuffling loader.
    pub fn from_data(data: &CsrfData, batch_size: usize, seed: u64) -> Result<Self> {
        let loader = |split: Split, offset: u64| {
            BatchLoader::new(data.split(split), batch_size, true, seed.wrapping_add(offset))
        };
        Ok(Self {
            train: loader(Split::Train, 1)?,
            validation: loader(Split::Validation, 2)?,
            test: loader(Split::Test, 3)?,
            image_stats: data.image_stats(),
        })
    }

    pub fn get(&self, split: Split) -> &BatchLoader {
        match split {
            Split::Train => &self.train,
            Split::Validation => &self.validation,
            Split::Test => &self.test,
        }
    }

    pub fn get_mut(&mut self, split: Split) -> &mut BatchLoader {
        match split {
            Split::Train => &mut self.train,
            Split::Validation => &mut self.validation,
            Split::Test => &mut self.test,
        }
    }

    pub fn summary(&self) -> DatasetSummary {
        let (channels, height, width) = self.test.image_shape();
        DatasetSummary {
            image_shape: [channels, height, width],
            response_shape: self.test.response_shape().to_vec(),
            image_mean: self.image_stats.mean,
            image_std: self.image_stats.std,
            splits: Split::ALL
                .iter()
                .map(|&split| {
                    let loader = self.get(split);
                    SplitSummary {
                        split,
                        samples: loader.len(),
                        batches: loader.num_batches(),
                        valid_fraction: loader.valid_fraction(),
                    }
                })
                .collect(),
        }
    }
}

/// Load a recording, preprocess it and build the three loaders.
///
/// `config.seed` drives the validation split and every shuffle; without
/// one, a random seed is drawn and logged.
pub fn csrf_v1(data_path: &Path, image_path: Option<&Path>, config: &Config) -> anyhow::Result<CsrfLoaders> {
    config.validate()?;
    let seed = config.seed.unwrap_or_else(|| {
        let seed = rand::random();
        log::warn!("no seed configured, using {seed}");
        seed
    });
    let config = Config {
        seed: Some(seed),
        ..config.clone()
    };

    let raw = loader::load_dataset(data_path, image_path)?;
    let data = CsrfData::new(raw, &config).context("preprocessing CSRF data")?;
    Ok(CsrfLoaders::from_data(&data, config.batch_size, seed)?)
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitSummary {
    pub split: Split,
    pub samples: usize,
    pub batches: usize,
    pub valid_fraction: f64,
}

/// Shapes and sizes of a prepared dataset, suitable for JSON output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSummary {
    /// `[channels, height, width]`
    pub image_shape: [usize; 3],
    /// Per-sample response shape.
    pub response_shape: Vec<usize>,
    pub image_mean: f64,
    pub image_std: f64,
    pub splits: Vec<SplitSummary>,
}
