//! Multi-horizon forecasts from the current image and weather.

use crate::core::types::ScalarWeather;
use crate::embedding::EmbeddingProvider;
use crate::error::PipelineError;
use crate::model::DualHeadModel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Score at or above which rain is reported as expected.
pub const RAIN_PROBABILITY_THRESHOLD: f64 = 0.5;

/// Forecast horizons used when none are configured, in minutes.
pub const DEFAULT_HORIZONS: [u32; 6] = [5, 10, 15, 20, 25, 30];

/// Forecast for one horizon.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HorizonForecast {
    pub horizon_minutes: u32,
    pub rain_probability: f64,
    pub rain_mm: f64,
    pub rain_expected: bool,
}

impl fmt::Display for HorizonForecast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.rain_expected { "rain" } else { "no rain" };
        write!(
            f,
            "+{:>2} min: {:<7} p={:.2}  ~{:.2} mm",
            self.horizon_minutes, verdict, self.rain_probability, self.rain_mm
        )
    }
}

/// Applies a model once per horizon.
///
/// Only one still image is available at inference time, so every horizon
/// sees the same embedding and scalars.
pub struct MultiHorizonPredictor<'a> {
    model: &'a DualHeadModel,
    embedder: &'a dyn EmbeddingProvider,
    threshold: f64,
}

impl<'a> MultiHorizonPredictor<'a> {
    pub fn new(model: &'a DualHeadModel, embedder: &'a dyn EmbeddingProvider) -> Self {
        Self {
            model,
            embedder,
            threshold: RAIN_PROBABILITY_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Embed `image` and forecast each horizon.
    pub fn predict_horizons(
        &self,
        image: &Path,
        weather: ScalarWeather,
        horizons: &[u32],
    ) -> Result<Vec<HorizonForecast>, PipelineError> {
        let embedding = self.embedder.embed(image)?;
        self.predict_embedding(&embedding, weather, horizons)
    }

    /// Forecast from an embedding already in hand.
    ///
    /// Horizons come back sorted ascending with duplicates collapsed.
    pub fn predict_embedding(
        &self,
        embedding: &[f32],
        weather: ScalarWeather,
        horizons: &[u32],
    ) -> Result<Vec<HorizonForecast>, PipelineError> {
        let mut horizons = horizons.to_vec();
        horizons.sort_unstable();
        horizons.dedup();

        horizons
            .into_iter()
            .map(|horizon_minutes| -> Result<HorizonForecast, PipelineError> {
                let prediction = self.model.predict(embedding, weather.to_array())?;
                let rain_probability = prediction.rain_probability.clamp(0.0, 1.0);
                Ok(HorizonForecast {
                    horizon_minutes,
                    rain_probability,
                    rain_mm: prediction.rain_mm,
                    rain_expected: rain_probability >= self.threshold,
                })
            })
            .collect()
    }
}
