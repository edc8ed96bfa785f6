use ndarray::{s, Array3, Array4, ArrayD, Axis};

use crate::error::{DataError, Result};

// ---------------------------------------------------------------------------
// Spatial cropping / subsampling
// ---------------------------------------------------------------------------

/// Remove `crop` pixels from every border, then keep every `subsample`-th
/// pixel along height and width. `crop == 0` keeps the full extent.
pub fn crop_and_subsample(images: &Array4<f32>, crop: usize, subsample: usize) -> Result<Array4<f32>> {
    if subsample == 0 {
        return Err(DataError::InvalidConfig("subsample must be at least 1".into()));
    }
    let (height, width) = (images.len_of(Axis(1)), images.len_of(Axis(2)));
    for len in [height, width] {
        if crop > 0 && 2 * crop >= len {
            return Err(DataError::CropTooLarge { crop, len });
        }
    }

    let step = subsample as isize;
    let view = images.slice(s![
        ..,
        crop..height - crop;step,
        crop..width - crop;step,
        ..
    ]);
    Ok(view.to_owned())
}

// ---------------------------------------------------------------------------
// Image z-scoring
// ---------------------------------------------------------------------------

/// Pixel statistics shared by every split.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageStats {
    pub mean: f64,
    /// Population standard deviation (no Bessel correction).
    pub std: f64,
}

impl ImageStats {
    /// Mean and standard deviation over every pixel of all `sets` together.
    pub fn compute(sets: &[&Array4<f32>]) -> Result<Self> {
        let count: usize = sets.iter().map(|a| a.len()).sum();
        if count == 0 {
            return Err(DataError::DegenerateImages(f64::NAN));
        }
        let n = count as f64;

        let sum: f64 = sets.iter().flat_map(|a| a.iter()).map(|&v| f64::from(v)).sum();
        let mean = sum / n;
        let sq: f64 = sets
            .iter()
            .flat_map(|a| a.iter())
            .map(|&v| (f64::from(v) - mean).powi(2))
            .sum();
        let std = (sq / n).sqrt();

        if !std.is_finite() || std == 0.0 {
            return Err(DataError::DegenerateImages(std));
        }
        Ok(Self { mean, std })
    }

    pub fn normalize(&self, images: &Array4<f32>) -> Array4<f32> {
        let (mean, std) = (self.mean, self.std);
        images.mapv(|v| ((f64::from(v) - mean) / std) as f32)
    }
}

// ---------------------------------------------------------------------------
// Responses: validity and time-bin aggregation
// ---------------------------------------------------------------------------

/// `true` wherever a response was recorded.
pub fn validity_mask(responses: &Array3<f32>) -> Array3<bool> {
    responses.mapv(|v| !v.is_nan())
}

/// Sum responses over the chosen time bins, dropping the time axis.
///
/// The returned mask is `true` only where every selected bin was valid.
/// Missing values propagate into the sum as NaN.
pub fn sum_time_bins(
    responses: &Array3<f32>,
    valid: &Array3<bool>,
    bins: &[usize],
) -> Result<(ArrayD<f32>, ArrayD<bool>)> {
    if bins.is_empty() {
        return Err(DataError::InvalidConfig("no time bins selected".into()));
    }
    let available = responses.len_of(Axis(2));
    if let Some(&bin) = bins.iter().find(|&&b| b >= available) {
        return Err(DataError::TimeBinOutOfRange { bin, available });
    }

    let selected = responses.select(Axis(2), bins);
    let summed = selected.sum_axis(Axis(2));

    let selected_valid = valid.select(Axis(2), bins);
    let all_valid = selected_valid.map_axis(Axis(2), |bins| bins.iter().all(|&v| v));

    Ok((summed.into_dyn(), all_valid.into_dyn()))
}

/// Replace NaN responses by zero. Validity masks stay authoritative.
pub fn zero_missing(responses: &mut ArrayD<f32>) {
    responses.mapv_inplace(|v| if v.is_nan() { 0.0 } else { v });
}

/// Fraction of `true` entries in a mask (0 for an empty mask).
pub fn valid_fraction(valid: &ArrayD<bool>) -> f64 {
    if valid.is_empty() {
        return 0.0;
    }
    let n_valid = valid.iter().filter(|&&v| v).count();
    n_valid as f64 / valid.len() as f64
}

/// Number of neurons with a valid response in time bin 0, per image.
pub fn neurons_per_image(valid: &Array3<bool>) -> Vec<usize> {
    if valid.len_of(Axis(2)) == 0 {
        return vec![0; valid.len_of(Axis(0))];
    }
    valid
        .index_axis(Axis(2), 0)
        .map_axis(Axis(1), |neurons| neurons.iter().filter(|&&v| v).count())
        .to_vec()
}
