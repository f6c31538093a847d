//! On-disk inputs and intermediate products.
//!
//! - `weather`: per-day station tables
//! - `labels`: per-day, per-policy labeled-pair files
//! - `dataset`: the cumulative feature dataset

pub mod dataset;
pub mod labels;
pub mod weather;

pub use dataset::{load_dataset, Dataset, DatasetWriter};
pub use labels::{read_labels, LabelFile, LabelStore};
pub use weather::{read_weather_csv, weather_path};
