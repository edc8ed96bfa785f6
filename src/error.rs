use thiserror::Error;

/// Typed failures raised while validating or preprocessing a dataset.
///
/// File-level problems (I/O, malformed archives) are reported through
/// `anyhow` with context by [`crate::data::loader`]; everything that can go
/// wrong once the arrays are in memory ends up here.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DataError {
    #[error("missing key '{0}'")]
    MissingKey(String),

    #[error("'{key}' has {found} dimensions, expected {expected}")]
    Dimensionality {
        key: String,
        expected: String,
        found: usize,
    },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("'{key}' contains non-integer value {value}")]
    NotInteger { key: String, value: f64 },

    #[error("crop of {crop} pixels leaves nothing of an axis of length {len}")]
    CropTooLarge { crop: usize, len: usize },

    #[error("image standard deviation is {0}; cannot z-score")]
    DegenerateImages(f64),

    #[error("time bin {bin} out of range (responses have {available} bins)")]
    TimeBinOutOfRange { bin: usize, available: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, DataError>;
