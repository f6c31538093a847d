//! Hold-out metrics for both heads.

use super::{DualHeadModel, Prediction};
use crate::core::features::FeatureRow;
use crate::error::ModelError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Binary confusion matrix; positive means "rain".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub true_positive: usize,
    pub false_positive: usize,
    pub true_negative: usize,
    pub false_negative: usize,
}

impl ConfusionMatrix {
    pub fn record(&mut self, predicted: bool, actual: bool) {
        match (predicted, actual) {
            (true, true) => self.true_positive += 1,
            (true, false) => self.false_positive += 1,
            (false, false) => self.true_negative += 1,
            (false, true) => self.false_negative += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.true_positive + self.false_positive + self.true_negative + self.false_negative
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.true_positive + self.true_negative, self.total())
    }

    pub fn precision(&self) -> f64 {
        ratio(self.true_positive, self.true_positive + self.false_positive)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.true_positive, self.true_positive + self.false_negative)
    }

    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }
}

/// Zero when the denominator is zero.
fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Metrics over an evaluation set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub rows: usize,
    pub threshold: f64,
    pub confusion: ConfusionMatrix,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Mean absolute error of the rain amount, mm
    pub mae: f64,
    /// Mean squared error of the rain amount, mm²
    pub mse: f64,
}

impl EvaluationReport {
    /// Score predictions against the rows they were made for.
    pub fn from_predictions(rows: &[FeatureRow], predictions: &[Prediction], threshold: f64) -> Self {
        let mut confusion = ConfusionMatrix::default();
        let mut abs_err = 0.0;
        let mut sq_err = 0.0;

        for (row, prediction) in rows.iter().zip(predictions) {
            confusion.record(prediction.rain_probability >= threshold, row.label() == 1);
            let err = prediction.rain_mm - row.precipitation_mm() as f64;
            abs_err += err.abs();
            sq_err += err * err;
        }

        let n = rows.len().min(predictions.len());
        let denom = n.max(1) as f64;
        Self {
            rows: n,
            threshold,
            confusion,
            accuracy: confusion.accuracy(),
            precision: confusion.precision(),
            recall: confusion.recall(),
            f1: confusion.f1(),
            mae: abs_err / denom,
            mse: sq_err / denom,
        }
    }
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.confusion;
        writeln!(f, "Evaluation over {} rows (threshold {:.2})", self.rows, self.threshold)?;
        writeln!(f, "  Confusion matrix   pred dry   pred rain")?;
        writeln!(f, "    actual dry      {:>8}   {:>9}", c.true_negative, c.false_positive)?;
        writeln!(f, "    actual rain     {:>8}   {:>9}", c.false_negative, c.true_positive)?;
        writeln!(f, "  Accuracy:  {:.4}", self.accuracy)?;
        writeln!(f, "  Precision: {:.4}", self.precision)?;
        writeln!(f, "  Recall:    {:.4}", self.recall)?;
        writeln!(f, "  F1:        {:.4}", self.f1)?;
        writeln!(f, "  MAE:       {:.4} mm", self.mae)?;
        write!(f, "  MSE:       {:.4} mm²", self.mse)
    }
}

/// Predict every row and score the results.
pub fn evaluate(model: &DualHeadModel, rows: &[FeatureRow], threshold: f64) -> Result<EvaluationReport, ModelError> {
    let predictions = model.predict_batch(rows)?;
    Ok(EvaluationReport::from_predictions(rows, &predictions, threshold))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ScalarWeather;
    use std::sync::Arc;

    fn row(precipitation: f64) -> FeatureRow {
        FeatureRow::new(Arc::from(vec![0.0f32; 2]), ScalarWeather::new(20.0, 60.0), precipitation)
    }

    fn prediction(p: f64, mm: f64) -> Prediction {
        Prediction {
            rain_probability: p,
            rain_mm: mm,
        }
    }

    #[test]
    fn test_report_metrics() {
        let rows = vec![row(1.0), row(0.0), row(2.0), row(0.0)];
        let predictions = vec![
            prediction(0.9, 1.5),
            prediction(0.6, 0.0),
            prediction(0.2, 1.0),
            prediction(0.5, 0.5),
        ];

        let report = EvaluationReport::from_predictions(&rows, &predictions, 0.5);
        assert_eq!(
            report.confusion,
            ConfusionMatrix {
                true_positive: 1,
                false_positive: 2,
                true_negative: 0,
                false_negative: 1,
            }
        );
        assert!((report.accuracy - 0.25).abs() < 1e-12);
        assert!((report.precision - 1.0 / 3.0).abs() < 1e-12);
        assert!((report.recall - 0.5).abs() < 1e-12);
        assert!((report.f1 - 0.4).abs() < 1e-12);
        assert!((report.mae - 0.5).abs() < 1e-12);
        assert!((report.mse - 0.375).abs() < 1e-12);
    }

    #[test]
    fn test_empty_set_has_zero_metrics() {
        let report = EvaluationReport::from_predictions(&[], &[], 0.5);
        assert_eq!(report.rows, 0);
        assert_eq!(report.accuracy, 0.0);
        assert_eq!(report.f1, 0.0);
        assert_eq!(report.mse, 0.0);
    }

    #[test]
    fn test_display_lists_metrics() {
        let report = EvaluationReport::from_predictions(&[row(1.0)], &[prediction(0.7, 1.0)], 0.5);
        let text = report.to_string();
        assert!(text.contains("Accuracy:  1.0000"));
        assert!(text.contains("MAE:       0.0000 mm"));
    }
}
