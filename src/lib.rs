//! Loader and preprocessing pipeline for the CSRF V1 dataset: stimulus
//! images and neural responses, cropped, z-scored, split into
//! train/validation/test and served as shuffled minibatches.

pub mod batch;
pub mod config;
pub mod data;
pub mod error;

pub use batch::{csrf_v1, Batch, BatchLoader, CsrfLoaders, DatasetSummary};
pub use config::Config;
pub use data::dataset::{CsrfData, SplitData};
pub use data::split::Split;
pub use error::DataError;
