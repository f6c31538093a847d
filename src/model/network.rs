//! Dual-head network: convolutional gate cell, pooled and joined with the
//! scalar weather features, then a dense trunk feeding two heads.
//!
//! ```text
//! grid (H, W, C) ──conv gate cell──▶ (F, H, W) ──avg pool──▶ F ─┐
//!                                                               ├─▶ dense … ─┬─▶ rain logit
//! scalars (temperature, humidity) ──────────────────────────────┘            └─▶ rain mm
//! ```
//!
//! The cell is one step of a convolutional LSTM started from a zero state,
//! so the forget gate and the recurrent kernels drop out:
//! `c = σ(i) ⊙ relu(g)`, `h = σ(o) ⊙ relu(c)`.

use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView1, ArrayView3, ArrayViewD, ArrayViewMutD, Axis};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Side of the square convolution kernels.
pub const KERNEL_SIZE: usize = 3;

/// Probabilities are clipped to `[EPSILON, 1 - EPSILON]` inside the log loss.
pub const EPSILON: f32 = 1e-7;

const PAD: usize = KERNEL_SIZE / 2;

/// Activation functions used by the dense layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    Linear,
}

impl Activation {
    pub fn apply(&self, z: f32) -> f32 {
        match self {
            Activation::Relu => z.max(0.0),
            Activation::Linear => z,
        }
    }

    pub fn derivative(&self, z: f32) -> f32 {
        match self {
            Activation::Relu => step(z),
            Activation::Linear => 1.0,
        }
    }
}

pub fn sigmoid(z: f32) -> f32 {
    1.0 / (1.0 + (-z).exp())
}

fn step(z: f32) -> f32 {
    if z > 0.0 {
        1.0
    } else {
        0.0
    }
}

/// Glorot-uniform distribution for a layer with the given fan-in and fan-out.
fn glorot_uniform(fan_in: usize, fan_out: usize) -> Uniform<f32> {
    let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
    Uniform::new_inclusive(-limit, limit)
}

/// Binary cross-entropy of one prediction.
pub fn binary_cross_entropy(probability: f32, target: f32) -> f32 {
    let p = probability.clamp(EPSILON, 1.0 - EPSILON);
    -(target * p.ln() + (1.0 - target) * (1.0 - p).ln())
}

pub fn squared_error(prediction: f32, target: f32) -> f32 {
    (prediction - target).powi(2)
}

/// Fully connected layer; weights are `(outputs, inputs)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dense {
    weights: Array2<f32>,
    bias: Array1<f32>,
    activation: Activation,
}

impl Dense {
    pub fn new<R: Rng + ?Sized>(inputs: usize, outputs: usize, activation: Activation, rng: &mut R) -> Self {
        let dist = glorot_uniform(inputs, outputs);
        Self {
            weights: Array2::from_shape_fn((outputs, inputs), |_| dist.sample(&mut *rng)),
            bias: Array1::zeros(outputs),
            activation,
        }
    }

    fn zeros_like(&self) -> Self {
        Self {
            weights: Array2::zeros(self.weights.raw_dim()),
            bias: Array1::zeros(self.bias.raw_dim()),
            activation: self.activation,
        }
    }

    pub fn inputs(&self) -> usize {
        self.weights.ncols()
    }

    pub fn outputs(&self) -> usize {
        self.weights.nrows()
    }

    /// Returns (pre-activation, activation).
    fn forward(&self, input: &Array1<f32>) -> (Array1<f32>, Array1<f32>) {
        let pre = self.weights.dot(input) + &self.bias;
        let out = pre.mapv(|z| self.activation.apply(z));
        (pre, out)
    }

    /// Accumulate parameter gradients into `grads` and return the gradient
    /// with respect to `input`.
    fn backward(
        &self,
        input: &Array1<f32>,
        pre: &Array1<f32>,
        grad_out: &Array1<f32>,
        grads: &mut Dense,
    ) -> Array1<f32> {
        let delta = grad_out * &pre.mapv(|z| self.activation.derivative(z));
        let outer = delta
            .view()
            .insert_axis(Axis(1))
            .dot(&input.view().insert_axis(Axis(0)));
        grads.weights += &outer;
        grads.bias += &delta;
        self.weights.t().dot(&delta)
    }
}

/// Same-padded 3×3 convolution; kernel is `(filters, channels, 3, 3)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conv2d {
    kernel: Array4<f32>,
    bias: Array1<f32>,
}

/// Input index hit by kernel tap `k` at output position `pos`, if inside.
fn tap(pos: usize, k: usize, len: usize) -> Option<usize> {
    let p = pos + k;
    if p < PAD || p - PAD >= len {
        None
    } else {
        Some(p - PAD)
    }
}

impl Conv2d {
    fn new<R: Rng + ?Sized>(channels: usize, filters: usize, rng: &mut R) -> Self {
        let area = KERNEL_SIZE * KERNEL_SIZE;
        let dist = glorot_uniform(channels * area, filters * area);
        Self {
            kernel: Array4::from_shape_fn((filters, channels, KERNEL_SIZE, KERNEL_SIZE), |_| dist.sample(&mut *rng)),
            bias: Array1::zeros(filters),
        }
    }

    fn zeros_like(&self) -> Self {
        Self {
            kernel: Array4::zeros(self.kernel.raw_dim()),
            bias: Array1::zeros(self.bias.raw_dim()),
        }
    }

    fn filters(&self) -> usize {
        self.kernel.dim().0
    }

    /// `input` is `(rows, cols, channels)`; output is `(filters, rows, cols)`.
    fn forward(&self, input: ArrayView3<'_, f32>) -> Array3<f32> {
        let (rows, cols, channels) = input.dim();
        let filters = self.filters();
        let mut out = Array3::<f32>::zeros((filters, rows, cols));

        for f in 0..filters {
            for y in 0..rows {
                for x in 0..cols {
                    let mut acc = self.bias[f];
                    for ky in 0..KERNEL_SIZE {
                        let Some(iy) = tap(y, ky, rows) else { continue };
                        for kx in 0..KERNEL_SIZE {
                            let Some(ix) = tap(x, kx, cols) else { continue };
                            for c in 0..channels {
                                acc += self.kernel[[f, c, ky, kx]] * input[[iy, ix, c]];
                            }
                        }
                    }
                    out[[f, y, x]] = acc;
                }
            }
        }
        out
    }

    /// Accumulate kernel and bias gradients for a pre-activation gradient `delta`.
    fn accumulate(&self, input: ArrayView3<'_, f32>, delta: &Array3<f32>, grads: &mut Conv2d) {
        let (rows, cols, channels) = input.dim();
        for f in 0..self.filters() {
            for y in 0..rows {
                for x in 0..cols {
                    let d = delta[[f, y, x]];
                    if d == 0.0 {
                        continue;
                    }
                    grads.bias[f] += d;
                    for ky in 0..KERNEL_SIZE {
                        let Some(iy) = tap(y, ky, rows) else { continue };
                        for kx in 0..KERNEL_SIZE {
                            let Some(ix) = tap(x, kx, cols) else { continue };
                            for c in 0..channels {
                                grads.kernel[[f, c, ky, kx]] += d * input[[iy, ix, c]];
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Single-step convolutional LSTM cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvGateCell {
    input_gate: Conv2d,
    candidate: Conv2d,
    output_gate: Conv2d,
}

/// Intermediate maps kept from the forward pass.
#[derive(Debug, Clone)]
struct CellTrace {
    input_gate: Array3<f32>,
    candidate_pre: Array3<f32>,
    candidate: Array3<f32>,
    output_gate: Array3<f32>,
    cell: Array3<f32>,
}

impl ConvGateCell {
    fn new<R: Rng + ?Sized>(channels: usize, filters: usize, rng: &mut R) -> Self {
        Self {
            input_gate: Conv2d::new(channels, filters, rng),
            candidate: Conv2d::new(channels, filters, rng),
            output_gate: Conv2d::new(channels, filters, rng),
        }
    }

    fn zeros_like(&self) -> Self {
        Self {
            input_gate: self.input_gate.zeros_like(),
            candidate: self.candidate.zeros_like(),
            output_gate: self.output_gate.zeros_like(),
        }
    }

    pub fn filters(&self) -> usize {
        self.input_gate.filters()
    }

    fn gates(&self) -> [&Conv2d; 3] {
        [&self.input_gate, &self.candidate, &self.output_gate]
    }

    fn gates_mut(&mut self) -> [&mut Conv2d; 3] {
        [&mut self.input_gate, &mut self.candidate, &mut self.output_gate]
    }

    /// Returns the globally average-pooled hidden state, one value per filter.
    fn forward(&self, input: ArrayView3<'_, f32>) -> (Array1<f32>, CellTrace) {
        let input_gate = self.input_gate.forward(input).mapv(sigmoid);
        let candidate_pre = self.candidate.forward(input);
        let candidate = candidate_pre.mapv(|z| z.max(0.0));
        let output_gate = self.output_gate.forward(input).mapv(sigmoid);
        let cell = &input_gate * &candidate;
        let hidden = &output_gate * &cell.mapv(|v| v.max(0.0));

        let (_, rows, cols) = hidden.dim();
        let area = (rows * cols).max(1) as f32;
        let pooled = hidden.sum_axis(Axis(2)).sum_axis(Axis(1)) / area;

        let trace = CellTrace {
            input_gate,
            candidate_pre,
            candidate,
            output_gate,
            cell,
        };
        (pooled, trace)
    }

    fn backward(&self, input: ArrayView3<'_, f32>, trace: &CellTrace, d_pooled: ArrayView1<'_, f32>, grads: &mut ConvGateCell) {
        let (_, rows, cols) = trace.cell.dim();
        let area = (rows * cols).max(1) as f32;
        let d_hidden = Array3::from_shape_fn(trace.cell.raw_dim(), |(f, _, _)| d_pooled[f] / area);

        let d_output = &d_hidden * &trace.cell.mapv(|v| v.max(0.0));
        let d_cell = &d_hidden * &trace.output_gate * &trace.cell.mapv(step);

        let dz_input = &d_cell * &trace.candidate * &trace.input_gate.mapv(|s| s * (1.0 - s));
        let dz_candidate = &d_cell * &trace.input_gate * &trace.candidate_pre.mapv(step);
        let dz_output = d_output * &trace.output_gate.mapv(|s| s * (1.0 - s));

        self.input_gate.accumulate(input, &dz_input, &mut grads.input_gate);
        self.candidate.accumulate(input, &dz_candidate, &mut grads.candidate);
        self.output_gate.accumulate(input, &dz_output, &mut grads.output_gate);
    }
}

/// Raw outputs of both heads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadOutput {
    pub logit: f32,
    pub rain_mm: f32,
}

impl HeadOutput {
    pub fn probability(&self) -> f32 {
        sigmoid(self.logit)
    }
}

/// Everything the backward pass needs from one forward pass.
#[derive(Debug, Clone)]
pub struct Trace {
    cell: CellTrace,
    /// Input of each hidden layer, then the input shared by both heads
    activations: Vec<Array1<f32>>,
    hidden_pre: Vec<Array1<f32>>,
    class_pre: Array1<f32>,
    reg_pre: Array1<f32>,
}

/// The full dual-head network. Also used as its own gradient container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    cell: ConvGateCell,
    hidden: Vec<Dense>,
    class_head: Dense,
    reg_head: Dense,
}

impl Network {
    /// Number of scalar features joined after pooling.
    pub const SCALARS: usize = 2;

    pub fn new<R: Rng + ?Sized>(channels: usize, filters: usize, hidden_units: &[usize], rng: &mut R) -> Self {
        let cell = ConvGateCell::new(channels, filters, rng);

        let mut hidden = Vec::with_capacity(hidden_units.len());
        let mut width = filters + Self::SCALARS;
        for &units in hidden_units {
            hidden.push(Dense::new(width, units, Activation::Relu, rng));
            width = units;
        }

        Self {
            cell,
            hidden,
            class_head: Dense::new(width, 1, Activation::Linear, rng),
            reg_head: Dense::new(width, 1, Activation::Linear, rng),
        }
    }

    /// A network of the same shape with every parameter zero.
    pub fn zeros_like(&self) -> Self {
        Self {
            cell: self.cell.zeros_like(),
            hidden: self.hidden.iter().map(Dense::zeros_like).collect(),
            class_head: self.class_head.zeros_like(),
            reg_head: self.reg_head.zeros_like(),
        }
    }

    pub fn filters(&self) -> usize {
        self.cell.filters()
    }

    pub fn hidden_units(&self) -> Vec<usize> {
        self.hidden.iter().map(Dense::outputs).collect()
    }

    /// `spatial` is one time step, `(rows, cols, channels)`; `scalars` are
    /// already standardized.
    pub fn forward(&self, spatial: ArrayView3<'_, f32>, scalars: [f32; 2]) -> (HeadOutput, Trace) {
        let (pooled, cell) = self.cell.forward(spatial);

        let filters = pooled.len();
        let mut current = Array1::<f32>::zeros(filters + Self::SCALARS);
        current.slice_mut(s![..filters]).assign(&pooled);
        current[filters] = scalars[0];
        current[filters + 1] = scalars[1];

        let mut activations = Vec::with_capacity(self.hidden.len() + 1);
        let mut hidden_pre = Vec::with_capacity(self.hidden.len());
        for layer in &self.hidden {
            let (pre, out) = layer.forward(&current);
            activations.push(std::mem::replace(&mut current, out));
            hidden_pre.push(pre);
        }

        let (class_pre, _) = self.class_head.forward(&current);
        let (reg_pre, _) = self.reg_head.forward(&current);
        activations.push(current);

        let output = HeadOutput {
            logit: class_pre[0],
            rain_mm: reg_pre[0],
        };
        let trace = Trace {
            cell,
            activations,
            hidden_pre,
            class_pre,
            reg_pre,
        };
        (output, trace)
    }

    pub fn predict(&self, spatial: ArrayView3<'_, f32>, scalars: [f32; 2]) -> HeadOutput {
        self.forward(spatial, scalars).0
    }

    /// Backpropagate output gradients (with respect to the logit and the rain
    /// estimate) and accumulate parameter gradients into `grads`.
    pub fn backward(&self, spatial: ArrayView3<'_, f32>, trace: &Trace, d_logit: f32, d_rain: f32, grads: &mut Network) {
        let head_input = &trace.activations[self.hidden.len()];
        let mut grad = self.class_head.backward(
            head_input,
            &trace.class_pre,
            &Array1::from_elem(1, d_logit),
            &mut grads.class_head,
        );
        grad += &self.reg_head.backward(
            head_input,
            &trace.reg_pre,
            &Array1::from_elem(1, d_rain),
            &mut grads.reg_head,
        );

        for (idx, layer) in self.hidden.iter().enumerate().rev() {
            grad = layer.backward(&trace.activations[idx], &trace.hidden_pre[idx], &grad, &mut grads.hidden[idx]);
        }

        let filters = self.cell.filters();
        self.cell
            .backward(spatial, &trace.cell, grad.slice(s![..filters]), &mut grads.cell);
    }

    /// All parameter tensors in a fixed order.
    pub fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        let mut params = Vec::new();
        for conv in self.cell.gates() {
            params.push(conv.kernel.view().into_dyn());
            params.push(conv.bias.view().into_dyn());
        }
        for dense in self.hidden.iter().chain([&self.class_head, &self.reg_head]) {
            params.push(dense.weights.view().into_dyn());
            params.push(dense.bias.view().into_dyn());
        }
        params
    }

    /// Mutable views in the same order as [`Network::parameters`].
    pub fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        let mut params = Vec::new();
        for conv in self.cell.gates_mut() {
            params.push(conv.kernel.view_mut().into_dyn());
            params.push(conv.bias.view_mut().into_dyn());
        }
        for dense in self
            .hidden
            .iter_mut()
            .chain([&mut self.class_head, &mut self.reg_head])
        {
            params.push(dense.weights.view_mut().into_dyn());
            params.push(dense.bias.view_mut().into_dyn());
        }
        params
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }
}
