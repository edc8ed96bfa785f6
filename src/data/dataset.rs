use ndarray::{Array3, Array4, ArrayD, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::model::RawDataset;
use super::preprocess::{self, ImageStats};
use super::split::{validation_split, Split};
use crate::config::Config;
use crate::error::Result;

// ---------------------------------------------------------------------------
// SplitData – what a single partition hands to a loader
// ---------------------------------------------------------------------------

/// Images, responses and validity mask for one split, row-aligned.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitData {
    /// `(n, height, width, channels)`, z-scored.
    pub images: Array4<f32>,
    /// `(n, neurons)` after time-bin aggregation, `(n, neurons, time_bins)`
    /// without. Missing values are zero.
    pub responses: ArrayD<f32>,
    /// Same shape as `responses`; `false` where a value was missing.
    pub valid: ArrayD<bool>,
}

impl SplitData {
    pub fn len(&self) -> usize {
        self.images.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn select(&self, indices: &[usize]) -> SplitData {
        SplitData {
            images: self.images.select(Axis(0), indices),
            responses: self.responses.select(Axis(0), indices),
            valid: self.valid.select(Axis(0), indices),
        }
    }
}

// ---------------------------------------------------------------------------
// CsrfData – the preprocessed dataset
// ---------------------------------------------------------------------------

/// The preprocessed dataset: cropped, z-scored images, aggregated
/// responses and the train/validation/test partition.
///
/// Training data is served in a per-epoch random order (see
/// [`CsrfData::next_epoch`]); validation and test data in fixed order.
#[derive(Debug, Clone)]
pub struct CsrfData {
    subject_ids: ArrayD<i64>,
    session_ids: ArrayD<i64>,
    session_unit_response_link: ArrayD<i64>,
    repetitions_test: ArrayD<i64>,

    train: SplitData,
    validation: SplitData,
    test: SplitData,

    /// Row of `images_train` in the raw file for each training/validation row.
    train_indices: Vec<usize>,
    validation_indices: Vec<usize>,

    train_perm: Vec<usize>,
    image_stats: ImageStats,
    rng: StdRng,
}

impl CsrfData {
    /// Run the full preprocessing pipeline over a loaded record.
    pub fn new(raw: RawDataset, config: &Config) -> Result<Self> {
        config.validate()?;
        raw.validate()?;

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let valid_train = preprocess::validity_mask(&raw.responses_train);
        let valid_test = preprocess::validity_mask(&raw.responses_test);

        let images_train = preprocess::crop_and_subsample(&raw.images_train, config.crop, config.subsample)?;
        let images_test = preprocess::crop_and_subsample(&raw.images_test, config.crop, config.subsample)?;

        let image_stats = ImageStats::compute(&[&images_train, &images_test])?;
        log::debug!(
            "image statistics over train+test: mean {:.4}, std {:.4}",
            image_stats.mean,
            image_stats.std
        );
        let images_train = image_stats.normalize(&images_train);
        let images_test = image_stats.normalize(&images_test);

        let (train_indices, validation_indices) =
            validation_split(&valid_train, config.train_frac, &mut rng)?;

        let bins = config.time_bins_sum.as_deref();
        let full_train = aggregate(images_train, &raw.responses_train, &valid_train, bins)?;
        let test = aggregate(images_test, &raw.responses_test, &valid_test, bins)?;

        let train = full_train.select(&train_indices);
        let validation = full_train.select(&validation_indices);

        let mut train_perm: Vec<usize> = (0..train.len()).collect();
        train_perm.shuffle(&mut rng);

        log::info!(
            "prepared CSRF data: {} train / {} validation / {} test images, {} neurons, images {:?}",
            train.len(),
            validation.len(),
            test.len(),
            raw.num_neurons(),
            &train.images.shape()[1..3],
        );

        Ok(Self {
            subject_ids: raw.subject_ids,
            session_ids: raw.session_ids,
            session_unit_response_link: raw.session_unit_response_link,
            repetitions_test: raw.repetitions_test,
            train,
            validation,
            test,
            train_indices,
            validation_indices,
            train_perm,
            image_stats,
            rng,
        })
    }

    /// Training data in the current epoch's order.
    pub fn train(&self) -> SplitData {
        self.train.select(&self.train_perm)
    }

    pub fn validation(&self) -> SplitData {
        self.validation.clone()
    }

    pub fn test(&self) -> SplitData {
        self.test.clone()
    }

    pub fn split(&self, split: Split) -> SplitData {
        match split {
            Split::Train => self.train(),
            Split::Validation => self.validation(),
            Split::Test => self.test(),
        }
    }

    /// Draw a fresh random order for the training data.
    pub fn next_epoch(&mut self) {
        self.train_perm.shuffle(&mut self.rng);
    }

    /// `(height, width)` of the preprocessed images.
    pub fn image_dimensions(&self) -> (usize, usize) {
        let shape = self.test.images.shape();
        (shape[1], shape[2])
    }

    pub fn num_channels(&self) -> usize {
        self.test.images.len_of(Axis(3))
    }

    pub fn num_neurons(&self) -> usize {
        self.test.responses.len_of(Axis(1))
    }

    pub fn image_stats(&self) -> ImageStats {
        self.image_stats
    }

    /// Raw `images_train` rows assigned to training, in split order.
    pub fn train_indices(&self) -> &[usize] {
        &self.train_indices
    }

    /// Raw `images_train` rows assigned to validation.
    pub fn validation_indices(&self) -> &[usize] {
        &self.validation_indices
    }

    /// Current epoch order over the training rows.
    pub fn train_permutation(&self) -> &[usize] {
        &self.train_perm
    }

    pub fn subject_ids(&self) -> &ArrayD<i64> {
        &self.subject_ids
    }

    pub fn session_ids(&self) -> &ArrayD<i64> {
        &self.session_ids
    }

    pub fn session_unit_response_link(&self) -> &ArrayD<i64> {
        &self.session_unit_response_link
    }

    pub fn repetitions_test(&self) -> &ArrayD<i64> {
        &self.repetitions_test
    }
}

/// Optionally sum time bins, then zero out missing responses.
fn aggregate(
    images: Array4<f32>,
    responses: &Array3<f32>,
    valid: &Array3<bool>,
    bins: Option<&[usize]>,
) -> Result<SplitData> {
    let (mut responses, valid) = match bins {
        Some(bins) => preprocess::sum_time_bins(responses, valid, bins)?,
        None => (responses.clone().into_dyn(), valid.clone().into_dyn()),
    };
    preprocess::zero_missing(&mut responses);
    Ok(SplitData {
        images,
        responses,
        valid,
    })
}
