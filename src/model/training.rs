//! Training of the dual-head model.
//!
//! Mini-batch Adam on the summed loss of both heads (binary cross-entropy on
//! the rain logit, squared error on the rain amount), with early stopping on
//! validation loss and restoration of the best epoch's weights.

use super::network::{binary_cross_entropy, squared_error, Network};
use super::{DualHeadModel, InputAdapter, ScalarScaler};
use crate::core::features::FeatureRow;
use crate::error::{ModelError, SchemaMismatchError};
use ndarray::{Array3, ArrayD, Axis, Zip};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Fewest rows that still leave one row on each side of the split.
pub const MIN_TRAINING_ROWS: usize = 2;

/// Training hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Seed for the split, weight init and batch shuffling
    pub seed: u64,
    /// Share of rows held out for validation
    pub validation_fraction: f64,
    pub max_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// Non-improving epochs tolerated before stopping
    pub patience: usize,
    /// Smallest validation-loss decrease that counts as improvement
    pub min_delta: f32,
    /// Feature maps in the convolutional cell
    pub conv_filters: usize,
    pub hidden_units: Vec<usize>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            validation_fraction: 0.2,
            max_epochs: 50,
            batch_size: 32,
            learning_rate: 1e-3,
            patience: 5,
            min_delta: 0.0,
            conv_filters: 8,
            hidden_units: vec![64, 32],
        }
    }
}

/// Row indices of each partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
}

/// Seeded shuffle split; the validation side gets `ceil(n * fraction)` rows.
pub fn train_validation_split(n: usize, fraction: f64, seed: u64) -> Split {
    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let validation_len = ((n as f64) * fraction.clamp(0.0, 1.0)).ceil() as usize;
    let validation_len = validation_len.min(n);
    let train = indices.split_off(validation_len);
    Split {
        train,
        validation: indices,
    }
}

/// What the stopping rule decided after an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochOutcome {
    Improved,
    NoImprovement,
    Stop,
}

/// Stops after `patience` consecutive epochs without improvement.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f32,
    best: Option<f32>,
    best_epoch: usize,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f32) -> Self {
        Self {
            patience,
            min_delta,
            best: None,
            best_epoch: 0,
            wait: 0,
        }
    }

    pub fn observe(&mut self, epoch: usize, loss: f32) -> EpochOutcome {
        let improved = match self.best {
            None => loss.is_finite(),
            Some(best) => loss < best - self.min_delta,
        };

        if improved {
            self.best = Some(loss);
            self.best_epoch = epoch;
            self.wait = 0;
            return EpochOutcome::Improved;
        }

        self.wait += 1;
        if self.wait >= self.patience {
            EpochOutcome::Stop
        } else {
            EpochOutcome::NoImprovement
        }
    }

    pub fn best(&self) -> Option<f32> {
        self.best
    }

    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }
}

/// Adam optimizer over [`Network::parameters_mut`].
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    steps: i32,
    first_moment: Vec<ArrayD<f32>>,
    second_moment: Vec<ArrayD<f32>>,
}

impl Adam {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            steps: 0,
            first_moment: Vec::new(),
            second_moment: Vec::new(),
        }
    }

    /// Apply one update from accumulated gradients.
    pub fn step(&mut self, network: &mut Network, gradients: &Network) {
        let gradients = gradients.parameters();
        if self.first_moment.is_empty() {
            self.first_moment = gradients.iter().map(|g| ArrayD::zeros(g.raw_dim())).collect();
            self.second_moment = gradients.iter().map(|g| ArrayD::zeros(g.raw_dim())).collect();
        }

        self.steps += 1;
        let (b1, b2, eps) = (self.beta1, self.beta2, self.epsilon);
        let lr = self.learning_rate * (1.0 - b2.powi(self.steps)).sqrt() / (1.0 - b1.powi(self.steps));

        let moments = self.first_moment.iter_mut().zip(self.second_moment.iter_mut());
        for ((param, grad), (m, v)) in network.parameters_mut().into_iter().zip(gradients).zip(moments) {
            Zip::from(param)
                .and(&grad)
                .and(m)
                .and(v)
                .for_each(|p, &g, m, v| {
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    *p -= lr * *m / (v.sqrt() + eps);
                });
        }
    }
}

/// Losses of one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f32,
    pub val_loss: f32,
    pub val_class_loss: f32,
    pub val_reg_loss: f32,
}

/// Outcome of a training run, stored alongside the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub seed: u64,
    pub validation_fraction: f64,
    pub train_rows: usize,
    pub validation_rows: usize,
    pub epochs_run: usize,
    /// Epoch whose weights were kept (1-based; 0 if none improved)
    pub best_epoch: usize,
    pub best_val_loss: Option<f32>,
    pub stopped_early: bool,
    #[serde(skip, default)]
    pub history: Vec<EpochMetrics>,
}

/// A row prepared for the network.
struct Sample {
    spatial: Array3<f32>,
    scalars: [f32; 2],
    label: f32,
    rain_mm: f32,
}

impl Sample {
    fn prepare(row: &FeatureRow, adapter: &dyn InputAdapter, scaler: &ScalarScaler) -> Result<Self, SchemaMismatchError> {
        Ok(Self {
            spatial: adapter.adapt(row.embedding())?.index_axis_move(Axis(0), 0),
            scalars: scaler.apply(row.scalars()),
            label: row.label() as f32,
            rain_mm: row.precipitation_mm(),
        })
    }
}

/// Mean classification and regression loss over `indices`.
fn validation_loss(network: &Network, samples: &[Sample], indices: &[usize]) -> (f32, f32) {
    let mut class_loss = 0.0;
    let mut reg_loss = 0.0;
    for &idx in indices {
        let sample = &samples[idx];
        let out = network.predict(sample.spatial.view(), sample.scalars);
        class_loss += binary_cross_entropy(out.probability(), sample.label);
        reg_loss += squared_error(out.rain_mm, sample.rain_mm);
    }
    let n = indices.len().max(1) as f32;
    (class_loss / n, reg_loss / n)
}

/// Train a model on `rows`.
pub fn train(rows: &[FeatureRow], adapter: Box<dyn InputAdapter>, config: &TrainingConfig) -> Result<DualHeadModel, ModelError> {
    if rows.len() < MIN_TRAINING_ROWS {
        return Err(ModelError::InsufficientData {
            rows: rows.len(),
            required: MIN_TRAINING_ROWS,
        });
    }

    let shape = adapter.shape();
    if shape[0] != 1 {
        return Err(ModelError::UnsupportedShape { found: shape });
    }

    let split = train_validation_split(rows.len(), config.validation_fraction, config.seed);
    if split.train.is_empty() || split.validation.is_empty() {
        return Err(ModelError::InsufficientData {
            rows: rows.len(),
            required: MIN_TRAINING_ROWS,
        });
    }

    let scaler = ScalarScaler::fit(split.train.iter().map(|&i| &rows[i]));
    let samples = rows
        .iter()
        .map(|row| Sample::prepare(row, adapter.as_ref(), &scaler))
        .collect::<Result<Vec<_>, _>>()?;

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut network = Network::new(shape[3], config.conv_filters, &config.hidden_units, &mut rng);
    let mut best = network.clone();
    let mut optimizer = Adam::new(config.learning_rate);
    let mut stopping = EarlyStopping::new(config.patience, config.min_delta);

    info!(
        "Training on {} rows, validating on {} ({} parameters)",
        split.train.len(),
        split.validation.len(),
        network.parameter_count()
    );

    let mut order = split.train.clone();
    let mut history = Vec::new();
    let mut stopped_early = false;
    let batch_size = config.batch_size.max(1);

    for epoch in 1..=config.max_epochs {
        order.shuffle(&mut rng);

        let mut train_loss = 0.0;
        for batch in order.chunks(batch_size) {
            let scale = 1.0 / batch.len() as f32;
            let mut gradients = network.zeros_like();
            for &idx in batch {
                let sample = &samples[idx];
                let (out, trace) = network.forward(sample.spatial.view(), sample.scalars);
                let probability = out.probability();
                train_loss += binary_cross_entropy(probability, sample.label)
                    + squared_error(out.rain_mm, sample.rain_mm);
                network.backward(
                    sample.spatial.view(),
                    &trace,
                    (probability - sample.label) * scale,
                    2.0 * (out.rain_mm - sample.rain_mm) * scale,
                    &mut gradients,
                );
            }
            optimizer.step(&mut network, &gradients);
        }
        let train_loss = train_loss / order.len() as f32;

        let (val_class_loss, val_reg_loss) = validation_loss(&network, &samples, &split.validation);
        let val_loss = val_class_loss + val_reg_loss;
        info!(
            "Epoch {}/{}: train_loss={:.4}, val_loss={:.4} (class={:.4}, reg={:.4})",
            epoch, config.max_epochs, train_loss, val_loss, val_class_loss, val_reg_loss
        );
        history.push(EpochMetrics {
            epoch,
            train_loss,
            val_loss,
            val_class_loss,
            val_reg_loss,
        });

        match stopping.observe(epoch, val_loss) {
            EpochOutcome::Improved => {
                debug!("New best model at epoch {}", epoch);
                best = network.clone();
            }
            EpochOutcome::NoImprovement => {}
            EpochOutcome::Stop => {
                info!("Early stopping at epoch {}", epoch);
                stopped_early = true;
                break;
            }
        }
    }

    let report = TrainingReport {
        seed: config.seed,
        validation_fraction: config.validation_fraction,
        train_rows: split.train.len(),
        validation_rows: split.validation.len(),
        epochs_run: history.len(),
        best_epoch: stopping.best_epoch(),
        best_val_loss: stopping.best(),
        stopped_early,
        history,
    };
    info!(
        "Training completed. Restored epoch {} (val_loss={:?})",
        report.best_epoch, report.best_val_loss
    );

    Ok(DualHeadModel::new(adapter, scaler, best)?.with_report(report))
}
