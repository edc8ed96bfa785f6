//! Data layer: raw record, loading, preprocessing and splitting.
//!
//! Architecture:
//! ```text
//!  .npz / .json / .pickle
//!        │
//!        ▼
//!   ┌──────────┐
//!   │  loader   │  parse file(s) → RawDataset
//!   └──────────┘
//!        │
//!        ▼
//!   ┌────────────┐
//!   │ preprocess  │  crop, subsample, z-score, sum time bins
//!   │ split       │  train / validation by response coverage
//!   └────────────┘
//!        │
//!        ▼
//!   ┌──────────┐
//!   │ CsrfData  │  SplitData per Split
//!   └──────────┘
//! ```

pub mod dataset;
pub mod loader;
pub mod model;
pub mod preprocess;
pub mod split;
pub mod synthetic;
