//! Rain nowcasting from a ground-level sky camera and a weather station.
//!
//! Images captured every few minutes are paired with the station's
//! 10-minute observations, reduced to feature rows (an image embedding plus
//! temperature and humidity, with precipitation as the target) and used to
//! train a dual-head network that predicts whether it will rain and how much.
//!
//! # Architecture
//!
//! ```text
//! images/YYYYMMDD/*.jpg ─┐
//!                        ├─▶ align ─▶ labels/{A,B}_model_YYYYMMDD.csv
//! weather/YYYYMMDD.csv ──┘                  │
//!                                           ▼
//!                      embed + assemble ─▶ features.csv ─▶ train ─▶ model.json
//!                                                                      │
//!                               current image + weather ─▶ predict ◀───┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use rain_nowcast::{DualHeadModel, MultiHorizonPredictor, ScalarWeather, ThumbnailEmbedder};
//! use std::path::Path;
//!
//! let model = DualHeadModel::load(Path::new("model.json")).expect("model");
//! let embedder = ThumbnailEmbedder::default();
//! let predictor = MultiHorizonPredictor::new(&model, &embedder);
//! for forecast in predictor
//!     .predict_horizons(Path::new("now.jpg"), ScalarWeather::new(24.5, 88.0), &[5, 10, 15])
//!     .expect("forecast")
//! {
//!     println!("{forecast}");
//! }
//! ```

pub mod config;
pub mod core;
pub mod embedding;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod predict;
pub mod store;
pub mod summary;

// Re-export key types at crate root for convenience
pub use config::Config;
pub use core::{align, AlignmentPolicy, DayId, FeatureRow, FeatureSchema, ImageRecord, LabeledPair, ScalarWeather};
pub use embedding::{EmbeddingProvider, ThumbnailEmbedder, ThumbnailSize};
pub use error::{
    ConfigError, DatasetError, EmbeddingError, IngestionError, ModelError, PipelineError, SchemaMismatchError,
};
pub use model::{AdapterSpec, DualHeadModel, EvaluationReport, TrainingConfig};
pub use predict::{HorizonForecast, MultiHorizonPredictor};
pub use summary::RunSummary;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
