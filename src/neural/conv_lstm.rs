// projeto: genretrain
// file: src/neural/conv_lstm.rs
// Convolutional front-end + LSTM over the note axis, trained with Adam

use log::{debug, info};
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::neural::metrics::{accuracy, AccuracyHistory, Evaluation};
use crate::neural::utils::{
    glorot_uniform, outer, random_normal, relu, sigmoid, softmax, truncated_normal, Optimizer,
    OptimizerKind, TrainingError,
};
use crate::neural::windowing::SequenceSet;

const EPSILON: f64 = 1e-10;
const INIT_STDDEV: f64 = 0.05;
const INIT_BIAS: f64 = 0.05;
const FORGET_BIAS: f64 = 1.0;
const PROJECTION_STDDEV: f64 = 1.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConvLayerConfig {
    pub filter_size: usize,
    pub num_filters: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvLstmConfig {
    pub conv_layers: Vec<ConvLayerConfig>,
    pub lstm_hidden: usize,
    /// Linear map of the last hidden state to `n_classes` values before the
    /// fully connected layers.
    pub lstm_projection: bool,
    pub fc_hidden: usize,
    pub learning_rate: f64,
    pub optimizer: OptimizerKind,
    pub iterations: usize,
    pub batch_size: usize,
    pub display_step: usize,
}

impl Default for ConvLstmConfig {
    fn default() -> Self {
        ConvLstmConfig {
            conv_layers: vec![
                ConvLayerConfig { filter_size: 50, num_filters: 32 },
                ConvLayerConfig { filter_size: 20, num_filters: 64 },
                ConvLayerConfig { filter_size: 5, num_filters: 128 },
            ],
            lstm_hidden: 1000,
            lstm_projection: true,
            fc_hidden: 256,
            learning_rate: 1e-4,
            optimizer: OptimizerKind::Adam,
            iterations: 2000,
            batch_size: 50,
            display_step: 100,
        }
    }
}

impl ConvLstmConfig {
    pub fn validate(&self) -> Result<(), TrainingError> {
        if self.conv_layers.is_empty() {
            return Err(TrainingError::ModelConfiguration(
                "at least one convolution layer is required".to_string(),
            ));
        }
        if self
            .conv_layers
            .iter()
            .any(|l| l.filter_size == 0 || l.num_filters == 0)
        {
            return Err(TrainingError::ModelConfiguration(
                "convolution layers need positive filter sizes and counts".to_string(),
            ));
        }
        if self.lstm_hidden == 0 || self.fc_hidden == 0 {
            return Err(TrainingError::ModelConfiguration(
                "lstm_hidden and fc_hidden must be positive".to_string(),
            ));
        }
        if self.batch_size == 0 || self.display_step == 0 || self.learning_rate <= 0.0 {
            return Err(TrainingError::ModelConfiguration(
                "batch_size, display_step and learning_rate must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvParams {
    /// `(out_channels, in_channels, k, k)`
    pub kernels: Array4<f64>,
    pub bias: Array1<f64>,
}

/// Gates stacked as input, forget, cell, output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LstmParams {
    /// `(4 * hidden, input)`
    pub w: Array2<f64>,
    /// `(4 * hidden, hidden)`
    pub u: Array2<f64>,
    pub b: Array1<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearParams {
    /// `(outputs, inputs)`
    pub w: Array2<f64>,
    pub b: Array1<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvLstmParams {
    /// `[tracks, notes, values per note]`
    pub input_shape: [usize; 3],
    pub n_classes: usize,
    pub conv: Vec<ConvParams>,
    pub lstm: LstmParams,
    #[serde(default)]
    pub projection: Option<LinearParams>,
    pub fc1: LinearParams,
    pub fc2: LinearParams,
}

impl ConvLstmParams {
    fn accumulate(&mut self, other: &ConvLstmParams) {
        for (a, b) in self.conv.iter_mut().zip(&other.conv) {
            a.kernels += &b.kernels;
            a.bias += &b.bias;
        }
        self.lstm.w += &other.lstm.w;
        self.lstm.u += &other.lstm.u;
        self.lstm.b += &other.lstm.b;
        if let (Some(a), Some(b)) = (self.projection.as_mut(), other.projection.as_ref()) {
            a.w += &b.w;
            a.b += &b.b;
        }
        self.fc1.w += &other.fc1.w;
        self.fc1.b += &other.fc1.b;
        self.fc2.w += &other.fc2.w;
        self.fc2.b += &other.fc2.b;
    }

    fn scale(&mut self, factor: f64) {
        for c in &mut self.conv {
            c.kernels *= factor;
            c.bias *= factor;
        }
        self.lstm.w *= factor;
        self.lstm.u *= factor;
        self.lstm.b *= factor;
        if let Some(proj) = self.projection.as_mut() {
            proj.w *= factor;
            proj.b *= factor;
        }
        self.fc1.w *= factor;
        self.fc1.b *= factor;
        self.fc2.w *= factor;
        self.fc2.b *= factor;
    }

    fn validate(&self) -> Result<(), TrainingError> {
        let [tracks, _, width] = self.input_shape;
        let mut channels = tracks;
        for (l, conv) in self.conv.iter().enumerate() {
            let (out, input, kh, kw) = conv.kernels.dim();
            if input != channels || kh != kw || conv.bias.len() != out {
                return Err(TrainingError::Shape(format!(
                    "conv layer {} has kernels {:?} for {} input channels",
                    l,
                    conv.kernels.dim(),
                    channels
                )));
            }
            channels = out;
        }
        let hidden = self.lstm.u.ncols();
        let lstm_ok = self.lstm.w.dim() == (4 * hidden, channels * width)
            && self.lstm.u.nrows() == 4 * hidden
            && self.lstm.b.len() == 4 * hidden;
        let head_inputs = match &self.projection {
            Some(proj) if proj.w.dim() == (self.n_classes, hidden) && proj.b.len() == self.n_classes => {
                self.n_classes
            }
            Some(_) => {
                return Err(TrainingError::Shape(format!(
                    "projection must map {} hidden units to {} classes",
                    hidden, self.n_classes
                )));
            }
            None => hidden,
        };
        let fc_ok = self.fc1.w.ncols() == head_inputs
            && self.fc1.b.len() == self.fc1.w.nrows()
            && self.fc2.w.dim() == (self.n_classes, self.fc1.w.nrows())
            && self.fc2.b.len() == self.n_classes;
        if self.conv.is_empty() || !lstm_ok || !fc_ok {
            return Err(TrainingError::Shape(
                "recurrent or fully connected weights do not match the network layout".to_string(),
            ));
        }
        Ok(())
    }
}

struct LstmCache {
    /// Activated gates per step, `(steps, 4 * hidden)`.
    gates: Array2<f64>,
    /// Cell states, row 0 is the initial state.
    cells: Array2<f64>,
    /// Hidden states, row 0 is the initial state.
    hidden: Array2<f64>,
}

struct SampleCache {
    /// `activations[0]` is the input, `activations[l + 1]` the ReLU output of conv layer `l`.
    activations: Vec<Array3<f64>>,
    sequence: Array2<f64>,
    lstm: LstmCache,
    /// Input of `fc1`: the projected or the raw last hidden state.
    head_in: Array1<f64>,
    fc1_out: Array1<f64>,
    probs: Array1<f64>,
}

struct SampleGradients {
    grads: ConvLstmParams,
    loss: f64,
    correct: usize,
}

/// Stride-1 convolution with SAME zero padding (top/left padding `(k - 1) / 2`).
fn conv_forward(x: &Array3<f64>, p: &ConvParams) -> Array3<f64> {
    let (c_in, h, w) = x.dim();
    let (c_out, _, k, _) = p.kernels.dim();
    let pad = (k - 1) / 2;
    let mut y = Array3::zeros((c_out, h, w));

    for o in 0..c_out {
        for i in 0..h {
            let (di_lo, di_hi) = (pad.saturating_sub(i), k.min(h + pad - i));
            for j in 0..w {
                let (dj_lo, dj_hi) = (pad.saturating_sub(j), k.min(w + pad - j));
                let mut acc = p.bias[o];
                for c in 0..c_in {
                    for di in di_lo..di_hi {
                        for dj in dj_lo..dj_hi {
                            acc += p.kernels[[o, c, di, dj]] * x[[c, i + di - pad, j + dj - pad]];
                        }
                    }
                }
                y[[o, i, j]] = acc;
            }
        }
    }
    y
}

/// Gradients of a convolution given the gradient of its pre-activation output.
fn conv_backward(
    x: &Array3<f64>,
    dz: &Array3<f64>,
    p: &ConvParams,
    input_grad: bool,
) -> (ConvParams, Option<Array3<f64>>) {
    let (c_in, h, w) = x.dim();
    let (c_out, _, k, _) = p.kernels.dim();
    let pad = (k - 1) / 2;
    let mut dk = Array4::zeros(p.kernels.raw_dim());
    let db = dz.sum_axis(Axis(2)).sum_axis(Axis(1));
    let mut dx = input_grad.then(|| Array3::zeros(x.raw_dim()));

    for o in 0..c_out {
        for i in 0..h {
            let (di_lo, di_hi) = (pad.saturating_sub(i), k.min(h + pad - i));
            for j in 0..w {
                let g = dz[[o, i, j]];
                if g == 0.0 {
                    continue;
                }
                let (dj_lo, dj_hi) = (pad.saturating_sub(j), k.min(w + pad - j));
                for c in 0..c_in {
                    for di in di_lo..di_hi {
                        for dj in dj_lo..dj_hi {
                            let (xi, xj) = (i + di - pad, j + dj - pad);
                            dk[[o, c, di, dj]] += g * x[[c, xi, xj]];
                            if let Some(dx) = dx.as_mut() {
                                dx[[c, xi, xj]] += g * p.kernels[[o, c, di, dj]];
                            }
                        }
                    }
                }
            }
        }
    }
    (ConvParams { kernels: dk, bias: db }, dx)
}

/// Row `t` of the sequence is row `t` of every channel, flattened channel-major.
fn to_sequence(a: &Array3<f64>) -> Array2<f64> {
    let (c, h, w) = a.dim();
    Array2::from_shape_fn((h, c * w), |(t, f)| a[[f / w, t, f % w]])
}

fn lstm_forward(p: &LstmParams, seq: &Array2<f64>) -> LstmCache {
    let n = p.u.ncols();
    let steps = seq.nrows();
    let mut cache = LstmCache {
        gates: Array2::zeros((steps, 4 * n)),
        cells: Array2::zeros((steps + 1, n)),
        hidden: Array2::zeros((steps + 1, n)),
    };

    for t in 0..steps {
        let mut gates = p.w.dot(&seq.row(t)) + p.u.dot(&cache.hidden.row(t)) + &p.b;
        gates.slice_mut(s![..2 * n]).mapv_inplace(sigmoid);
        gates.slice_mut(s![2 * n..3 * n]).mapv_inplace(f64::tanh);
        gates.slice_mut(s![3 * n..]).mapv_inplace(sigmoid);

        let (i, f) = (gates.slice(s![..n]), gates.slice(s![n..2 * n]));
        let (g, o) = (gates.slice(s![2 * n..3 * n]), gates.slice(s![3 * n..]));
        let c = &f * &cache.cells.row(t) + &i * &g;
        let h = &o * &c.mapv(f64::tanh);

        cache.cells.row_mut(t + 1).assign(&c);
        cache.hidden.row_mut(t + 1).assign(&h);
        cache.gates.row_mut(t).assign(&gates);
    }
    cache
}

/// BPTT from the gradient of the last hidden state.
fn lstm_backward(
    p: &LstmParams,
    seq: &Array2<f64>,
    cache: &LstmCache,
    dh_last: Array1<f64>,
) -> (LstmParams, Array2<f64>) {
    let n = p.u.ncols();
    let steps = seq.nrows();
    let mut dz_all = Array2::zeros((steps, 4 * n));
    let mut dseq = Array2::zeros(seq.raw_dim());
    let mut dh = dh_last;
    let mut dc = Array1::<f64>::zeros(n);

    for t in (0..steps).rev() {
        let gates = cache.gates.row(t);
        let (i, f) = (gates.slice(s![..n]), gates.slice(s![n..2 * n]));
        let (g, o) = (gates.slice(s![2 * n..3 * n]), gates.slice(s![3 * n..]));
        let tanh_c = cache.cells.row(t + 1).mapv(f64::tanh);

        let d_o = &dh * &tanh_c;
        dc = dc + &dh * &o * &tanh_c.mapv(|v| 1.0 - v * v);
        let d_i = &dc * &g;
        let d_f = &dc * &cache.cells.row(t);
        let d_g = &dc * &i;

        {
            let mut dz = dz_all.row_mut(t);
            dz.slice_mut(s![..n]).assign(&(d_i * &i.mapv(|v| v * (1.0 - v))));
            dz.slice_mut(s![n..2 * n]).assign(&(d_f * &f.mapv(|v| v * (1.0 - v))));
            dz.slice_mut(s![2 * n..3 * n]).assign(&(d_g * &g.mapv(|v| 1.0 - v * v)));
            dz.slice_mut(s![3 * n..]).assign(&(d_o * &o.mapv(|v| v * (1.0 - v))));
        }

        let dz = dz_all.row(t);
        dseq.row_mut(t).assign(&p.w.t().dot(&dz));
        dh = p.u.t().dot(&dz);
        dc = &dc * &f;
    }

    let grads = LstmParams {
        w: dz_all.t().dot(seq),
        u: dz_all.t().dot(&cache.hidden.slice(s![..steps, ..])),
        b: dz_all.sum_axis(Axis(0)),
    };
    (grads, dseq)
}

#[derive(Debug, Clone)]
pub struct ConvLstmNetwork {
    params: ConvLstmParams,
}

impl ConvLstmNetwork {
    pub fn new(
        input_shape: [usize; 3],
        config: &ConvLstmConfig,
        n_classes: usize,
        rng: &mut StdRng,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        let [tracks, notes, width] = input_shape;
        if tracks == 0 || notes == 0 || width == 0 || n_classes < 2 {
            return Err(TrainingError::ModelConfiguration(format!(
                "invalid input shape {:?} or class count {}",
                input_shape, n_classes
            )));
        }

        let mut conv = Vec::with_capacity(config.conv_layers.len());
        let mut channels = tracks;
        for layer in &config.conv_layers {
            let (k, out) = (layer.filter_size, layer.num_filters);
            let values = truncated_normal(out * channels * k * k, INIT_STDDEV, rng)?;
            conv.push(ConvParams {
                kernels: Array4::from_shape_vec((out, channels, k, k), values)?,
                bias: Array1::from_elem(out, INIT_BIAS),
            });
            channels = out;
        }

        let hidden = config.lstm_hidden;
        let mut lstm_bias = Array1::zeros(4 * hidden);
        lstm_bias.slice_mut(s![hidden..2 * hidden]).fill(FORGET_BIAS);
        let lstm = LstmParams {
            w: glorot_uniform(4 * hidden, channels * width, rng)?,
            u: glorot_uniform(4 * hidden, hidden, rng)?,
            b: lstm_bias,
        };

        let linear = |outputs: usize, inputs: usize, rng: &mut StdRng| -> Result<LinearParams, TrainingError> {
            let values = truncated_normal(outputs * inputs, INIT_STDDEV, rng)?;
            Ok(LinearParams {
                w: Array2::from_shape_vec((outputs, inputs), values)?,
                b: Array1::from_elem(outputs, INIT_BIAS),
            })
        };
        let projection = if config.lstm_projection {
            Some(LinearParams {
                w: Array2::from_shape_vec((n_classes, hidden), random_normal(n_classes * hidden, PROJECTION_STDDEV, rng)?)?,
                b: Array1::from(random_normal(n_classes, PROJECTION_STDDEV, rng)?),
            })
        } else {
            None
        };
        let head_inputs = if config.lstm_projection { n_classes } else { hidden };
        let fc1 = linear(config.fc_hidden, head_inputs, rng)?;
        let fc2 = linear(n_classes, config.fc_hidden, rng)?;

        Ok(ConvLstmNetwork {
            params: ConvLstmParams {
                input_shape,
                n_classes,
                conv,
                lstm,
                projection,
                fc1,
                fc2,
            },
        })
    }

    pub fn from_params(params: ConvLstmParams) -> Result<Self, TrainingError> {
        params.validate()?;
        Ok(ConvLstmNetwork { params })
    }

    pub fn params(&self) -> &ConvLstmParams {
        &self.params
    }

    pub fn input_shape(&self) -> [usize; 3] {
        self.params.input_shape
    }

    pub fn num_parameters(&self) -> usize {
        let p = &self.params;
        p.conv.iter().map(|c| c.kernels.len() + c.bias.len()).sum::<usize>()
            + p.lstm.w.len()
            + p.lstm.u.len()
            + p.lstm.b.len()
            + p.projection.as_ref().map_or(0, |proj| proj.w.len() + proj.b.len())
            + p.fc1.w.len()
            + p.fc1.b.len()
            + p.fc2.w.len()
            + p.fc2.b.len()
    }

    fn check_batch(&self, x: &Array4<f64>, labels: Option<&[usize]>) -> Result<(), TrainingError> {
        let (n, tracks, notes, width) = x.dim();
        if [tracks, notes, width] != self.params.input_shape {
            return Err(TrainingError::Shape(format!(
                "network expects samples of shape {:?}, got {:?}",
                self.params.input_shape,
                [tracks, notes, width]
            )));
        }
        if let Some(labels) = labels {
            if labels.len() != n {
                return Err(TrainingError::Shape(format!("{} samples but {} labels", n, labels.len())));
            }
            if let Some(&bad) = labels.iter().find(|&&l| l >= self.params.n_classes) {
                return Err(TrainingError::DataProcessing(format!(
                    "label {} out of range for {} classes",
                    bad, self.params.n_classes
                )));
            }
        }
        Ok(())
    }

    fn forward_sample(&self, x: ArrayView3<f64>) -> SampleCache {
        let p = &self.params;
        let mut activations = Vec::with_capacity(p.conv.len() + 1);
        activations.push(x.to_owned());
        for layer in &p.conv {
            let z = conv_forward(&activations[activations.len() - 1], layer);
            activations.push(z.mapv(relu));
        }

        let sequence = to_sequence(&activations[activations.len() - 1]);
        let lstm = lstm_forward(&p.lstm, &sequence);
        let h_last = lstm.hidden.row(sequence.nrows());
        let head_in = match &p.projection {
            Some(proj) => proj.w.dot(&h_last) + &proj.b,
            None => h_last.to_owned(),
        };

        let fc1_out = (p.fc1.w.dot(&head_in) + &p.fc1.b).mapv(relu);
        let logits = p.fc2.w.dot(&fc1_out) + &p.fc2.b;
        let probs = softmax(logits.view());

        SampleCache {
            activations,
            sequence,
            lstm,
            head_in,
            fc1_out,
            probs,
        }
    }

    fn sample_gradients(&self, x: ArrayView3<f64>, label: usize) -> SampleGradients {
        let p = &self.params;
        let cache = self.forward_sample(x);
        let steps = cache.sequence.nrows();

        let mut dlogits = cache.probs.clone();
        dlogits[label] -= 1.0;
        let fc2 = LinearParams {
            w: outer(dlogits.view(), cache.fc1_out.view()),
            b: dlogits.clone(),
        };

        let mut dz1 = p.fc2.w.t().dot(&dlogits);
        dz1.zip_mut_with(&cache.fc1_out, |d, &a| {
            if a <= 0.0 {
                *d = 0.0;
            }
        });
        let fc1 = LinearParams {
            w: outer(dz1.view(), cache.head_in.view()),
            b: dz1.clone(),
        };

        let dhead = p.fc1.w.t().dot(&dz1);
        let h_last = cache.lstm.hidden.row(steps);
        let (projection, dh_last) = match &p.projection {
            Some(proj) => {
                let grads = LinearParams {
                    w: outer(dhead.view(), h_last),
                    b: dhead.clone(),
                };
                (Some(grads), proj.w.t().dot(&dhead))
            }
            None => (None, dhead),
        };
        let (lstm, dseq) = lstm_backward(&p.lstm, &cache.sequence, &cache.lstm, dh_last);

        let last = &cache.activations[p.conv.len()];
        let (_, _, width) = last.dim();
        let mut da = Array3::from_shape_fn(last.raw_dim(), |(c, t, w)| dseq[[t, c * width + w]]);

        let mut conv = Vec::with_capacity(p.conv.len());
        for l in (0..p.conv.len()).rev() {
            da.zip_mut_with(&cache.activations[l + 1], |d, &a| {
                if a <= 0.0 {
                    *d = 0.0;
                }
            });
            let (grads, dx) = conv_backward(&cache.activations[l], &da, &p.conv[l], l > 0);
            conv.push(grads);
            if let Some(dx) = dx {
                da = dx;
            }
        }
        conv.reverse();

        SampleGradients {
            grads: ConvLstmParams {
                input_shape: p.input_shape,
                n_classes: p.n_classes,
                conv,
                lstm,
                projection,
                fc1,
                fc2,
            },
            loss: -cache.probs[label].max(EPSILON).ln(),
            correct: usize::from(argmax_index(&cache.probs) == label),
        }
    }

    /// Mean gradients over `batch`, computed per sample in parallel.
    fn batch_gradients(
        &self,
        x: &Array4<f64>,
        labels: &[usize],
        batch: &[usize],
    ) -> Result<SampleGradients, TrainingError> {
        let mut total = batch
            .par_iter()
            .map(|&i| self.sample_gradients(x.index_axis(Axis(0), i), labels[i]))
            .reduce_with(|mut acc, item| {
                acc.grads.accumulate(&item.grads);
                acc.loss += item.loss;
                acc.correct += item.correct;
                acc
            })
            .ok_or_else(|| TrainingError::Training("empty batch".to_string()))?;

        let n = batch.len() as f64;
        total.grads.scale(1.0 / n);
        total.loss /= n;
        Ok(total)
    }

    fn apply_gradients(&mut self, grads: &ConvLstmParams, optimizer: &mut Optimizer) -> Result<(), TrainingError> {
        optimizer.begin_step();
        for (l, (layer, g)) in self.params.conv.iter_mut().zip(&grads.conv).enumerate() {
            optimizer.update(&format!("conv{}.kernels", l), &mut layer.kernels, &g.kernels)?;
            optimizer.update(&format!("conv{}.bias", l), &mut layer.bias, &g.bias)?;
        }
        optimizer.update("lstm.w", &mut self.params.lstm.w, &grads.lstm.w)?;
        optimizer.update("lstm.u", &mut self.params.lstm.u, &grads.lstm.u)?;
        optimizer.update("lstm.b", &mut self.params.lstm.b, &grads.lstm.b)?;
        if let (Some(proj), Some(g)) = (self.params.projection.as_mut(), grads.projection.as_ref()) {
            optimizer.update("projection.w", &mut proj.w, &g.w)?;
            optimizer.update("projection.b", &mut proj.b, &g.b)?;
        }
        optimizer.update("fc1.w", &mut self.params.fc1.w, &grads.fc1.w)?;
        optimizer.update("fc1.b", &mut self.params.fc1.b, &grads.fc1.b)?;
        optimizer.update("fc2.w", &mut self.params.fc2.w, &grads.fc2.w)?;
        optimizer.update("fc2.b", &mut self.params.fc2.b, &grads.fc2.b)?;
        Ok(())
    }

    /// One optimizer step on the given sample indices. Returns the batch
    /// loss and accuracy measured before the update.
    pub fn train_step(
        &mut self,
        x: &Array4<f64>,
        labels: &[usize],
        batch: &[usize],
        optimizer: &mut Optimizer,
    ) -> Result<Evaluation, TrainingError> {
        self.check_batch(x, Some(labels))?;
        if let Some(&bad) = batch.iter().find(|&&i| i >= labels.len()) {
            return Err(TrainingError::Training(format!("sample index {} out of range", bad)));
        }
        let result = self.batch_gradients(x, labels, batch)?;
        self.apply_gradients(&result.grads, optimizer)?;
        Ok(Evaluation {
            loss: result.loss,
            accuracy: result.correct as f64 / batch.len() as f64,
        })
    }

    /// Class probabilities, one row per sample.
    pub fn predict(&self, x: &Array4<f64>) -> Result<Array2<f64>, TrainingError> {
        self.check_batch(x, None)?;
        let rows: Vec<Array1<f64>> = (0..x.len_of(Axis(0)))
            .into_par_iter()
            .map(|i| self.forward_sample(x.index_axis(Axis(0), i)).probs)
            .collect();

        let mut out = Array2::zeros((rows.len(), self.params.n_classes));
        for (i, row) in rows.iter().enumerate() {
            out.row_mut(i).assign(row);
        }
        Ok(out)
    }

    pub fn evaluate(&self, x: &Array4<f64>, labels: &[usize]) -> Result<Evaluation, TrainingError> {
        self.check_batch(x, Some(labels))?;
        if labels.is_empty() {
            return Ok(Evaluation::default());
        }
        let probs = self.predict(x)?;
        let loss = probs
            .rows()
            .into_iter()
            .zip(labels)
            .map(|(row, &l)| -row[l].max(EPSILON).ln())
            .sum::<f64>()
            / labels.len() as f64;
        Ok(Evaluation {
            loss,
            accuracy: accuracy(&probs, labels)?,
        })
    }
}

fn argmax_index(probs: &Array1<f64>) -> usize {
    probs
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, &p)| if p > best.1 { (i, p) } else { best })
        .0
}

/// Runs `iterations` optimizer steps on batches drawn with replacement.
/// Every `display_step` iterations the batch accuracy and the test accuracy
/// are logged and recorded.
pub fn train(
    network: &mut ConvLstmNetwork,
    train_set: &SequenceSet,
    test_set: &SequenceSet,
    config: &ConvLstmConfig,
    rng: &mut StdRng,
) -> Result<(AccuracyHistory, Evaluation), TrainingError> {
    config.validate()?;
    if train_set.is_empty() || test_set.is_empty() {
        return Err(TrainingError::Training(format!(
            "need windows in both splits, got {} train and {} test",
            train_set.len(),
            test_set.len()
        )));
    }

    let mut optimizer = Optimizer::new(config.optimizer, config.learning_rate);
    let mut history = AccuracyHistory::new();
    info!(
        "🧠 Conv+LSTM network: {} parameters, input {:?}, {} iterations x batch {}",
        network.num_parameters(),
        network.input_shape(),
        config.iterations,
        config.batch_size
    );

    for step in 1..=config.iterations {
        let batch: Vec<usize> = (0..config.batch_size)
            .map(|_| rng.random_range(0..train_set.len()))
            .collect();
        let eval = network.train_step(&train_set.x, &train_set.labels, &batch, &mut optimizer)?;
        if !eval.loss.is_finite() {
            return Err(TrainingError::Training(format!("loss diverged at iteration {}", step)));
        }
        debug!("iteration {}: batch loss {:.4} acc {:.3}", step, eval.loss, eval.accuracy);

        if step % config.display_step == 0 {
            let test = network.evaluate(&test_set.x, &test_set.labels)?;
            history.push(step, eval.accuracy, test.accuracy);
            info!(
                "📈 Iter {}/{}: minibatch loss {:.4} acc {:.3} | test acc {:.3}",
                step, config.iterations, eval.loss, eval.accuracy, test.accuracy
            );
        }
    }

    let final_eval = network.evaluate(&test_set.x, &test_set.labels)?;
    info!("✅ Testing accuracy: {:.3}", final_eval.accuracy);
    Ok((history, final_eval))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::utils::seeded_rng;
    use rand_distr::{Distribution, Uniform};

    fn tiny_config() -> ConvLstmConfig {
        ConvLstmConfig {
            conv_layers: vec![
                ConvLayerConfig { filter_size: 3, num_filters: 2 },
                ConvLayerConfig { filter_size: 2, num_filters: 2 },
            ],
            lstm_hidden: 4,
            lstm_projection: true,
            fc_hidden: 5,
            learning_rate: 0.01,
            optimizer: OptimizerKind::Adam,
            iterations: 40,
            batch_size: 8,
            display_step: 10,
        }
    }

    fn entry<'a>(p: &'a mut ConvLstmParams, name: &str) -> &'a mut f64 {
        match name {
            "fc2.w" => &mut p.fc2.w[[0, 1]],
            "fc2.b" => &mut p.fc2.b[2],
            "fc1.w" => &mut p.fc1.w[[3, 2]],
            "fc1.b" => &mut p.fc1.b[1],
            "lstm.w" => &mut p.lstm.w[[3, 1]],
            "lstm.u" => &mut p.lstm.u[[9, 2]],
            "lstm.b" => &mut p.lstm.b[5],
            "projection.w" => &mut p.projection.as_mut().unwrap().w[[2, 3]],
            "projection.b" => &mut p.projection.as_mut().unwrap().b[1],
            "conv0.kernels" => &mut p.conv[0].kernels[[1, 0, 1, 1]],
            "conv0.bias" => &mut p.conv[0].bias[1],
            "conv1.kernels" => &mut p.conv[1].kernels[[0, 1, 0, 1]],
            "conv1.bias" => &mut p.conv[1].bias[0],
            other => panic!("unknown parameter {}", other),
        }
    }

    fn sample_loss(net: &ConvLstmNetwork, x: &Array3<f64>, label: usize) -> f64 {
        -net.forward_sample(x.view()).probs[label].ln()
    }

    #[test]
    fn test_conv_same_padding_keeps_shape() {
        let x = Array3::from_shape_fn((1, 4, 3), |(_, i, j)| (i * 3 + j) as f64);
        let p = ConvParams {
            kernels: Array4::from_elem((1, 1, 2, 2), 1.0),
            bias: Array1::zeros(1),
        };
        let y = conv_forward(&x, &p);
        assert_eq!(y.dim(), (1, 4, 3));
        // even kernel: no top/left padding, zero row/column below/right
        assert_eq!(y[[0, 0, 0]], 0.0 + 1.0 + 3.0 + 4.0);
        assert_eq!(y[[0, 3, 2]], 11.0);
    }

    fn check_gradients(config: &ConvLstmConfig, names: &[&str]) {
        let mut rng = seeded_rng(Some(5));
        let mut net = ConvLstmNetwork::new([2, 6, 3], config, 3, &mut rng).unwrap();
        for layer in &mut net.params.conv {
            layer.kernels *= 10.0;
        }
        net.params.fc1.w *= 10.0;
        net.params.fc2.w *= 10.0;

        let noise = Uniform::new(-1.0, 1.0).unwrap();
        let x = Array3::from_shape_fn((2, 6, 3), |_| noise.sample(&mut rng));
        let label = 1;

        let mut analytic = net.sample_gradients(x.view(), label).grads;
        let eps = 1e-6;
        for &name in names {
            let mut plus = net.clone();
            *entry(&mut plus.params, name) += eps;
            let mut minus = net.clone();
            *entry(&mut minus.params, name) -= eps;
            let numeric = (sample_loss(&plus, &x, label) - sample_loss(&minus, &x, label)) / (2.0 * eps);
            let exact = *entry(&mut analytic, name);
            assert!(
                (numeric - exact).abs() < 1e-5 * (1.0 + numeric.abs()),
                "{}: numeric {} analytic {}",
                name,
                numeric,
                exact
            );
        }
    }

    const SHARED: [&str; 11] = [
        "fc2.w", "fc2.b", "fc1.w", "fc1.b", "lstm.w", "lstm.u", "lstm.b",
        "conv0.kernels", "conv0.bias", "conv1.kernels", "conv1.bias",
    ];

    #[test]
    fn test_gradients_match_finite_differences() {
        let mut names = SHARED.to_vec();
        names.extend(["projection.w", "projection.b"]);
        check_gradients(&tiny_config(), &names);
    }

    #[test]
    fn test_gradients_without_projection() {
        let config = ConvLstmConfig {
            lstm_projection: false,
            ..tiny_config()
        };
        check_gradients(&config, &SHARED);
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut rng = seeded_rng(Some(11));
        let noise = Uniform::new(-0.2, 0.2).unwrap();
        let n = 24;
        let labels: Vec<usize> = (0..n).map(|i| i % 2).collect();
        let x = Array4::from_shape_fn((n, 2, 6, 3), |(i, _, _, _)| {
            let level = if labels[i] == 0 { 1.0 } else { -1.0 };
            level + noise.sample(&mut rng)
        });
        let set = SequenceSet {
            x,
            labels,
            song_indices: (0..n).collect(),
            placeholder_tracks: 0,
        };

        let config = tiny_config();
        let mut net = ConvLstmNetwork::new([2, 6, 3], &config, 2, &mut rng).unwrap();
        let before = net.evaluate(&set.x, &set.labels).unwrap();
        let (history, after) = train(&mut net, &set, &set, &config, &mut rng).unwrap();

        assert_eq!(history.len(), 4);
        assert!(after.loss < before.loss, "loss {} -> {}", before.loss, after.loss);
    }

    #[test]
    fn test_shape_checks() {
        let mut rng = seeded_rng(Some(2));
        let net = ConvLstmNetwork::new([2, 6, 3], &tiny_config(), 2, &mut rng).unwrap();
        assert_eq!(net.predict(&Array4::zeros((3, 2, 6, 3))).unwrap().dim(), (3, 2));
        assert!(net.predict(&Array4::zeros((3, 3, 6, 3))).is_err());
        assert!(net.evaluate(&Array4::zeros((1, 2, 6, 3)), &[2]).is_err());

        let mut params = net.params().clone();
        params.lstm.u = Array2::zeros((16, 3));
        assert!(ConvLstmNetwork::from_params(params).is_err());
        assert!(ConvLstmNetwork::from_params(net.params().clone()).is_ok());
    }

    #[test]
    fn test_default_layout() {
        let mut rng = seeded_rng(Some(3));
        let config = ConvLstmConfig {
            lstm_hidden: 8,
            ..ConvLstmConfig::default()
        };
        let net = ConvLstmNetwork::new([3, 64, 3], &config, 2, &mut rng).unwrap();
        let p = net.params();
        assert_eq!(p.conv[0].kernels.dim(), (32, 3, 50, 50));
        assert_eq!(p.conv[2].kernels.dim(), (128, 64, 5, 5));
        assert_eq!(p.lstm.w.dim(), (32, 128 * 3));
        assert_eq!(p.lstm.b[8], 1.0);
        let projection = p.projection.as_ref().unwrap();
        assert_eq!(projection.w.dim(), (2, 8));
        assert_eq!(p.fc1.w.dim(), (256, 2));
        assert_eq!(p.fc2.w.dim(), (2, 256));

        let plain = ConvLstmConfig {
            lstm_projection: false,
            ..config
        };
        let net = ConvLstmNetwork::new([3, 64, 3], &plain, 2, &mut rng).unwrap();
        assert!(net.params().projection.is_none());
        assert_eq!(net.params().fc1.w.dim(), (256, 8));
    }

    #[test]
    fn test_projection_shape_is_validated() {
        let mut rng = seeded_rng(Some(8));
        let net = ConvLstmNetwork::new([2, 6, 3], &tiny_config(), 2, &mut rng).unwrap();
        let mut params = net.params().clone();
        params.projection = None;
        // fc1 still expects the projected width
        assert!(ConvLstmNetwork::from_params(params).is_err());
    }
}
