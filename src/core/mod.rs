//! Core data model of the pipeline.
//!
//! This module contains:
//! - Day, image, observation and labeled-pair types
//! - Temporal alignment of images to observations
//! - Feature rows and their fixed column schema

pub mod features;
pub mod types;
pub mod windowing;

// Re-export commonly used types
pub use features::{assemble, AssemblyError, EmbeddingCache, FeatureRow, FeatureSchema};
pub use types::{DayId, ImageRecord, LabeledPair, ScalarWeather, WeatherObservation};
pub use windowing::{align, AlignmentPolicy, AlignmentWindow};
