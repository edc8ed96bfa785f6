use std::collections::HashSet;
use std::fmt;

use ndarray::Array3;
use rand::seq::{index, SliceRandom};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::preprocess::neurons_per_image;
use crate::error::{DataError, Result};

/// Which partition of the dataset a view or loader serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Validation, Split::Test];
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Validation => write!(f, "validation"),
            Split::Test => write!(f, "test"),
        }
    }
}

/// Partition the training images into a training and a validation set.
///
/// Images are ranked by how many neurons responded validly in the first
/// time bin. Of the best-observed `floor(train_frac / 2 * n)` images, half
/// are drawn at random into validation; everything else is training data,
/// returned in random order. Validation therefore favours stimuli seen by
/// many neurons.
///
/// Returns `(train_indices, validation_indices)`.
pub fn validation_split<R: Rng + ?Sized>(
    valid: &Array3<bool>,
    train_frac: f64,
    rng: &mut R,
) -> Result<(Vec<usize>, Vec<usize>)> {
    if !(0.0..=1.0).contains(&train_frac) {
        return Err(DataError::InvalidConfig(format!(
            "train_frac must lie in [0, 1], got {train_frac}"
        )));
    }

    let counts = neurons_per_image(valid);
    let num_images = counts.len();

    // ascending, ties keep index order
    let mut ranked: Vec<usize> = (0..num_images).collect();
    ranked.sort_by_key(|&i| counts[i]);

    let num_top = (train_frac / 2.0 * num_images as f64).floor() as usize;
    let top = &ranked[num_images - num_top..];

    let val_idx: Vec<usize> = index::sample(rng, top.len(), top.len() / 2)
        .into_iter()
        .map(|i| top[i])
        .collect();

    let in_val: HashSet<usize> = val_idx.iter().copied().collect();
    let mut train_idx: Vec<usize> = ranked.into_iter().filter(|i| !in_val.contains(i)).collect();
    train_idx.shuffle(rng);

    log::debug!(
        "validation split: {} train / {} validation images ({} candidates)",
        train_idx.len(),
        val_idx.len(),
        num_top
    );
    Ok((train_idx, val_idx))
}
