//! The dual-head rain model.
//!
//! A [`DualHeadModel`] bundles everything inference needs: the input adapter,
//! the scalar standardization fitted at training time, and the network
//! weights. It is built by [`training::train`] and persisted with
//! [`DualHeadModel::save`].

pub mod adapter;
pub mod artifact;
pub mod evaluate;
pub mod network;
pub mod training;

pub use adapter::{AdapterSpec, GridAdapter, InputAdapter};
pub use evaluate::{evaluate, ConfusionMatrix, EvaluationReport};
pub use network::Network;
pub use training::{train, TrainingConfig, TrainingReport};

use crate::core::features::{FeatureRow, FeatureSchema};
use crate::error::ModelError;
use ndarray::Axis;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

/// Standardization of `[temperature, humidity]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalarScaler {
    pub mean: [f32; 2],
    pub std: [f32; 2],
}

impl ScalarScaler {
    pub fn identity() -> Self {
        Self {
            mean: [0.0; 2],
            std: [1.0; 2],
        }
    }

    /// Fit mean and population standard deviation per column. A constant
    /// column keeps a unit deviation.
    pub fn fit<'a>(rows: impl IntoIterator<Item = &'a FeatureRow>) -> Self {
        let (temperature, humidity): (Vec<f64>, Vec<f64>) = rows
            .into_iter()
            .map(|r| {
                let [t, h] = r.scalars();
                (t as f64, h as f64)
            })
            .unzip();
        if temperature.is_empty() {
            return Self::identity();
        }

        let stats = |values: &[f64]| {
            let mean = values.iter().mean();
            let std = values.iter().population_std_dev();
            let std = if std.is_finite() && std > f64::EPSILON { std } else { 1.0 };
            (mean as f32, std as f32)
        };
        let (t_mean, t_std) = stats(&temperature);
        let (h_mean, h_std) = stats(&humidity);

        Self {
            mean: [t_mean, h_mean],
            std: [t_std, h_std],
        }
    }

    pub fn apply(&self, scalars: [f32; 2]) -> [f32; 2] {
        [
            (scalars[0] - self.mean[0]) / self.std[0],
            (scalars[1] - self.mean[1]) / self.std[1],
        ]
    }
}

/// Output of one inference call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Classification score in `[0, 1]`
    pub rain_probability: f64,
    /// Regression estimate of precipitation in mm
    pub rain_mm: f64,
}

/// Trained model: adapter + scaler + network.
#[derive(Debug)]
pub struct DualHeadModel {
    adapter: Box<dyn InputAdapter>,
    scaler: ScalarScaler,
    network: Network,
    report: Option<TrainingReport>,
}

impl DualHeadModel {
    /// Assemble a model. The adapter must produce a single time step.
    pub fn new(adapter: Box<dyn InputAdapter>, scaler: ScalarScaler, network: Network) -> Result<Self, ModelError> {
        let shape = adapter.shape();
        if shape[0] != 1 {
            return Err(ModelError::UnsupportedShape { found: shape });
        }
        Ok(Self {
            adapter,
            scaler,
            network,
            report: None,
        })
    }

    pub fn with_report(mut self, report: TrainingReport) -> Self {
        self.report = Some(report);
        self
    }

    pub fn adapter(&self) -> &dyn InputAdapter {
        self.adapter.as_ref()
    }

    pub fn scaler(&self) -> &ScalarScaler {
        &self.scaler
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn report(&self) -> Option<&TrainingReport> {
        self.report.as_ref()
    }

    /// Embedding width this model was trained on.
    pub fn embedding_width(&self) -> usize {
        self.adapter.input_len()
    }

    /// Dataset layout this model consumes.
    pub fn schema(&self) -> FeatureSchema {
        FeatureSchema::new(self.embedding_width())
    }

    /// Score one embedding with its raw `[temperature, humidity]`.
    ///
    /// Non-finite inputs are rejected rather than propagated into the scores.
    pub fn predict(&self, embedding: &[f32], scalars: [f32; 2]) -> Result<Prediction, ModelError> {
        for (field, value) in [("temperature", scalars[0]), ("humidity", scalars[1])] {
            if !value.is_finite() {
                return Err(ModelError::NonFiniteInput { field, value });
            }
        }
        if let Some(&value) = embedding.iter().find(|v| !v.is_finite()) {
            return Err(ModelError::NonFiniteInput {
                field: "embedding",
                value,
            });
        }

        let spatial = self.adapter.adapt(embedding)?;
        let output = self
            .network
            .predict(spatial.index_axis(Axis(0), 0), self.scaler.apply(scalars));
        Ok(Prediction {
            rain_probability: (output.probability() as f64).clamp(0.0, 1.0),
            rain_mm: output.rain_mm as f64,
        })
    }

    pub fn predict_row(&self, row: &FeatureRow) -> Result<Prediction, ModelError> {
        self.predict(row.embedding(), row.scalars())
    }

    pub fn predict_batch(&self, rows: &[FeatureRow]) -> Result<Vec<Prediction>, ModelError> {
        rows.iter().map(|row| self.predict_row(row)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ScalarWeather;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn row(temperature: f64, humidity: f64) -> FeatureRow {
        FeatureRow::new(Arc::from(vec![0.5f32; 8]), ScalarWeather::new(temperature, humidity), 0.0)
    }

    #[test]
    fn test_scaler_standardizes() {
        let rows = vec![row(10.0, 50.0), row(20.0, 50.0), row(30.0, 50.0)];
        let scaler = ScalarScaler::fit(&rows);
        assert!((scaler.mean[0] - 20.0).abs() < 1e-5);
        // Constant humidity keeps unit deviation.
        assert_eq!(scaler.std[1], 1.0);

        let [t, h] = scaler.apply([30.0, 50.0]);
        assert!((t - 1.224_744_9).abs() < 1e-4);
        assert_eq!(h, 0.0);
    }

    #[test]
    fn test_scaler_of_nothing_is_identity() {
        assert_eq!(ScalarScaler::fit(&Vec::<FeatureRow>::new()), ScalarScaler::identity());
    }

    #[test]
    fn test_predict_checks_embedding_width() {
        let mut rng = StdRng::seed_from_u64(42);
        let adapter = GridAdapter::new(2, 4);
        let model = DualHeadModel::new(Box::new(adapter), ScalarScaler::identity(), Network::new(1, 2, &[4], &mut rng))
            .unwrap();

        let ok = model.predict(&[0.1; 8], [20.0, 60.0]).unwrap();
        assert!((0.0..=1.0).contains(&ok.rain_probability));

        let err = model.predict(&[0.1; 10], [20.0, 60.0]).unwrap_err();
        assert!(matches!(err, ModelError::Schema(_)));
        assert_eq!(model.schema().width(), 8 + 5);
    }

    #[test]
    fn test_predict_rejects_non_finite_inputs() {
        let mut rng = StdRng::seed_from_u64(42);
        let model = DualHeadModel::new(
            Box::new(GridAdapter::new(2, 4)),
            ScalarScaler::identity(),
            Network::new(1, 2, &[4], &mut rng),
        )
        .unwrap();

        let err = model.predict(&[0.1; 8], [f32::NAN, 60.0]).unwrap_err();
        assert!(matches!(err, ModelError::NonFiniteInput { field: "temperature", .. }));

        let err = model.predict(&[0.1; 8], [20.0, f32::INFINITY]).unwrap_err();
        assert!(matches!(err, ModelError::NonFiniteInput { field: "humidity", .. }));

        let mut embedding = [0.1; 8];
        embedding[3] = f32::NAN;
        let err = model.predict(&embedding, [20.0, 60.0]).unwrap_err();
        assert!(matches!(err, ModelError::NonFiniteInput { field: "embedding", .. }));
    }
}
