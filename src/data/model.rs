use std::collections::BTreeMap;

use ndarray::{Array3, Array4, ArrayD, Axis, Ix3, Ix4};

use crate::error::{DataError, Result};

// ---------------------------------------------------------------------------
// Key names of the serialized record
// ---------------------------------------------------------------------------

pub const SUBJECT_IDS: &str = "subject_ids";
pub const SESSION_IDS: &str = "session_ids";
pub const SESSION_UNIT_RESPONSE_LINK: &str = "session_unit_response_link";
pub const REPETITIONS_TEST: &str = "repetitions_test";
pub const RESPONSES_TRAIN: &str = "responses_train";
pub const RESPONSES_TEST: &str = "responses_test";
pub const IMAGES_TRAIN: &str = "images_train";
pub const IMAGES_TEST: &str = "images_test";

/// Keys holding stimulus images. These may live in a separate file.
pub const IMAGE_KEYS: [&str; 2] = [IMAGES_TRAIN, IMAGES_TEST];

/// Keys holding identifiers and counts rather than measurements.
pub const INTEGER_KEYS: [&str; 4] = [
    SUBJECT_IDS,
    SESSION_IDS,
    SESSION_UNIT_RESPONSE_LINK,
    REPETITIONS_TEST,
];

/// Every array decoded from a file, by key, widened to `f64`.
/// Integer and boolean arrays survive the widening exactly; NaN marks a
/// missing value.
pub type ArrayMap = BTreeMap<String, ArrayD<f64>>;

// ---------------------------------------------------------------------------
// RawDataset – one recording as stored on disk
// ---------------------------------------------------------------------------

/// The unprocessed record: identifiers, responses with NaN for missing
/// values, and stimulus images.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDataset {
    pub subject_ids: ArrayD<i64>,
    pub session_ids: ArrayD<i64>,
    pub session_unit_response_link: ArrayD<i64>,
    pub repetitions_test: ArrayD<i64>,
    /// `(images, neurons, time_bins)`
    pub responses_train: Array3<f32>,
    /// `(images, neurons, time_bins)`
    pub responses_test: Array3<f32>,
    /// `(images, height, width, channels)`
    pub images_train: Array4<f32>,
    /// `(images, height, width, channels)`
    pub images_test: Array4<f32>,
}

impl RawDataset {
    /// Assemble a dataset from decoded arrays and check its shapes.
    pub fn from_arrays(mut arrays: ArrayMap) -> Result<Self> {
        let mut take = |key: &str| arrays.remove(key).ok_or_else(|| DataError::MissingKey(key.into()));

        let raw = RawDataset {
            subject_ids: to_integers(SUBJECT_IDS, take(SUBJECT_IDS)?)?,
            session_ids: to_integers(SESSION_IDS, take(SESSION_IDS)?)?,
            session_unit_response_link: to_integers(
                SESSION_UNIT_RESPONSE_LINK,
                take(SESSION_UNIT_RESPONSE_LINK)?,
            )?,
            repetitions_test: to_integers(REPETITIONS_TEST, take(REPETITIONS_TEST)?)?,
            responses_train: to_responses(RESPONSES_TRAIN, take(RESPONSES_TRAIN)?)?,
            responses_test: to_responses(RESPONSES_TEST, take(RESPONSES_TEST)?)?,
            images_train: to_images(IMAGES_TRAIN, take(IMAGES_TRAIN)?)?,
            images_test: to_images(IMAGES_TEST, take(IMAGES_TEST)?)?,
        };
        raw.validate()?;
        Ok(raw)
    }

    /// Check that the response and image arrays describe the same stimuli.
    pub fn validate(&self) -> Result<()> {
        let pairs = [
            ("train", &self.responses_train, &self.images_train),
            ("test", &self.responses_test, &self.images_test),
        ];
        for (split, responses, images) in pairs {
            if responses.len_of(Axis(0)) != images.len_of(Axis(0)) {
                return Err(DataError::ShapeMismatch(format!(
                    "{split}: {} response rows but {} images",
                    responses.len_of(Axis(0)),
                    images.len_of(Axis(0))
                )));
            }
        }

        let (train, test) = (self.responses_train.shape(), self.responses_test.shape());
        if train[1..] != test[1..] {
            return Err(DataError::ShapeMismatch(format!(
                "train responses are {train:?} but test responses are {test:?} (neurons and time bins must agree)"
            )));
        }
        if train[1] == 0 || train[2] == 0 {
            return Err(DataError::ShapeMismatch(format!(
                "responses need at least one neuron and one time bin, got {train:?}"
            )));
        }

        let (train, test) = (self.images_train.shape(), self.images_test.shape());
        if train[1..] != test[1..] {
            return Err(DataError::ShapeMismatch(format!(
                "train images are {train:?} but test images are {test:?}"
            )));
        }
        Ok(())
    }

    pub fn num_train_images(&self) -> usize {
        self.images_train.len_of(Axis(0))
    }

    pub fn num_test_images(&self) -> usize {
        self.images_test.len_of(Axis(0))
    }

    pub fn num_neurons(&self) -> usize {
        self.responses_train.len_of(Axis(1))
    }

    pub fn num_time_bins(&self) -> usize {
        self.responses_train.len_of(Axis(2))
    }

    /// Inverse of [`RawDataset::from_arrays`].
    pub fn to_arrays(&self) -> ArrayMap {
        let widen_int = |a: &ArrayD<i64>| a.mapv(|v| v as f64);
        let widen_f32 = |a: ArrayD<f32>| a.mapv(f64::from);

        let mut arrays = ArrayMap::new();
        arrays.insert(SUBJECT_IDS.into(), widen_int(&self.subject_ids));
        arrays.insert(SESSION_IDS.into(), widen_int(&self.session_ids));
        arrays.insert(
            SESSION_UNIT_RESPONSE_LINK.into(),
            widen_int(&self.session_unit_response_link),
        );
        arrays.insert(REPETITIONS_TEST.into(), widen_int(&self.repetitions_test));
        arrays.insert(RESPONSES_TRAIN.into(), widen_f32(self.responses_train.clone().into_dyn()));
        arrays.insert(RESPONSES_TEST.into(), widen_f32(self.responses_test.clone().into_dyn()));
        arrays.insert(IMAGES_TRAIN.into(), widen_f32(self.images_train.clone().into_dyn()));
        arrays.insert(IMAGES_TEST.into(), widen_f32(self.images_test.clone().into_dyn()));
        arrays
    }
}

// -- conversions --

fn to_integers(key: &str, array: ArrayD<f64>) -> Result<ArrayD<i64>> {
    // `i64::MAX as f64` rounds up to 2^63, which is already out of range.
    let in_range = i64::MIN as f64..i64::MAX as f64;
    if let Some(&bad) = array
        .iter()
        .find(|v| !v.is_finite() || v.fract() != 0.0 || !in_range.contains(*v))
    {
        return Err(DataError::NotInteger {
            key: key.into(),
            value: bad,
        });
    }
    Ok(array.mapv(|v| v as i64))
}

fn to_responses(key: &str, array: ArrayD<f64>) -> Result<Array3<f32>> {
    let ndim = array.ndim();
    array
        .mapv(|v| v as f32)
        .into_dimensionality::<Ix3>()
        .map_err(|_| DataError::Dimensionality {
            key: key.into(),
            expected: "3 (images, neurons, time_bins)".into(),
            found: ndim,
        })
}

/// Images come as `(n, h, w)` or `(n, h, w, c)`; the former gains a
/// single channel axis.
fn to_images(key: &str, array: ArrayD<f64>) -> Result<Array4<f32>> {
    let array = array.mapv(|v| v as f32);
    let array = match array.ndim() {
        3 => array.insert_axis(Axis(3)),
        _ => array,
    };
    let ndim = array.ndim();
    array
        .into_dimensionality::<Ix4>()
        .map_err(|_| DataError::Dimensionality {
            key: key.into(),
            expected: "3 or 4 (images, height, width[, channels])".into(),
            found: ndim,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn};

    fn arrays(n_train: usize, n_test: usize) -> ArrayMap {
        let mut map = ArrayMap::new();
        for key in [SUBJECT_IDS, SESSION_IDS, REPETITIONS_TEST] {
            map.insert(key.into(), Array::from_elem(IxDyn(&[3]), 1.0));
        }
        map.insert(SESSION_UNIT_RESPONSE_LINK.into(), Array::zeros(IxDyn(&[3, 2])));
        map.insert(RESPONSES_TRAIN.into(), Array::zeros(IxDyn(&[n_train, 3, 4])));
        map.insert(RESPONSES_TEST.into(), Array::zeros(IxDyn(&[n_test, 3, 4])));
        map.insert(IMAGES_TRAIN.into(), Array::zeros(IxDyn(&[n_train, 8, 8])));
        map.insert(IMAGES_TEST.into(), Array::zeros(IxDyn(&[n_test, 8, 8])));
        map
    }

    #[test]
    fn grayscale_images_gain_channel_axis() {
        let raw = RawDataset::from_arrays(arrays(5, 2)).unwrap();
        assert_eq!(raw.images_train.shape(), &[5, 8, 8, 1]);
        assert_eq!(raw.num_neurons(), 3);
        assert_eq!(raw.num_time_bins(), 4);
    }

    #[test]
    fn missing_key_is_reported() {
        let mut map = arrays(5, 2);
        map.remove(REPETITIONS_TEST);
        assert_eq!(
            RawDataset::from_arrays(map),
            Err(DataError::MissingKey(REPETITIONS_TEST.into()))
        );
    }

    #[test]
    fn response_image_count_mismatch() {
        let mut map = arrays(5, 2);
        map.insert(IMAGES_TRAIN.into(), Array::zeros(IxDyn(&[4, 8, 8])));
        assert!(matches!(
            RawDataset::from_arrays(map),
            Err(DataError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn fractional_ids_are_rejected() {
        let mut map = arrays(5, 2);
        map.insert(SUBJECT_IDS.into(), Array::from_elem(IxDyn(&[2]), 1.5));
        assert!(matches!(
            RawDataset::from_arrays(map),
            Err(DataError::NotInteger { .. })
        ));
    }

    #[test]
    fn out_of_range_ids_are_rejected() {
        let mut map = arrays(5, 2);
        map.insert(SESSION_IDS.into(), Array::from_elem(IxDyn(&[2]), 1e20));
        assert!(matches!(
            RawDataset::from_arrays(map),
            Err(DataError::NotInteger { value, .. }) if value == 1e20
        ));
    }

    #[test]
    fn responses_must_be_three_dimensional() {
        let mut map = arrays(5, 2);
        map.insert(RESPONSES_TRAIN.into(), Array::zeros(IxDyn(&[5, 3])));
        assert!(matches!(
            RawDataset::from_arrays(map),
            Err(DataError::Dimensionality { found: 2, .. })
        ));
    }

    #[test]
    fn arrays_round_trip() {
        let raw = RawDataset::from_arrays(arrays(5, 2)).unwrap();
        let again = RawDataset::from_arrays(raw.to_arrays()).unwrap();
        assert_eq!(raw, again);
    }
}
