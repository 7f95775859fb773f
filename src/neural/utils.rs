// projeto: genretrain
// file: src/neural/utils.rs
// Error handling, activations, optimizers and scaling shared by both pipelines

use std::collections::HashMap;

use ndarray::{Array, Array1, Array2, ArrayView1, Axis, Dimension, ShapeError};
use ndarray_stats::QuantileExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Uniform};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML error: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error("MIDI error: {0}")]
    Midi(#[from] midly::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Invalid value '{value}' for feature '{feature}' of song '{song}' in {file}")]
    FeatureParse {
        file: String,
        song: String,
        feature: String,
        value: String,
    },

    #[error("Data processing error: {0}")]
    DataProcessing(String),

    #[error("Model configuration error: {0}")]
    ModelConfiguration(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Plot error: {0}")]
    Plot(String),
}

impl From<ShapeError> for TrainingError {
    fn from(err: ShapeError) -> Self {
        TrainingError::Shape(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for TrainingError {
    fn from(err: bincode::error::EncodeError) -> Self {
        TrainingError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for TrainingError {
    fn from(err: bincode::error::DecodeError) -> Self {
        TrainingError::Serialization(err.to_string())
    }
}

/// Seeded generator when a seed is configured, OS entropy otherwise.
pub fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

pub fn relu(x: f64) -> f64 {
    x.max(0.0)
}

pub fn softmax(z: ArrayView1<f64>) -> Array1<f64> {
    let max = z.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
    let exp = z.mapv(|v| (v - max).exp());
    let sum = exp.sum();
    exp / sum
}

pub fn softmax_rows(z: &Array2<f64>) -> Array2<f64> {
    let mut out = z.clone();
    for mut row in out.rows_mut() {
        let probs = softmax(row.view());
        row.assign(&probs);
    }
    out
}

pub fn argmax(row: ArrayView1<f64>) -> Result<usize, TrainingError> {
    row.argmax()
        .map_err(|e| TrainingError::Training(format!("cannot rank model output: {}", e)))
}

/// Keras-style `to_categorical`.
pub fn one_hot(labels: &[usize], n_classes: usize) -> Result<Array2<f64>, TrainingError> {
    let mut out = Array2::zeros((labels.len(), n_classes));
    for (row, &label) in labels.iter().enumerate() {
        if label >= n_classes {
            return Err(TrainingError::DataProcessing(format!(
                "label {} out of range for {} classes",
                label, n_classes
            )));
        }
        out[[row, label]] = 1.0;
    }
    Ok(out)
}

pub fn outer(a: ArrayView1<f64>, b: ArrayView1<f64>) -> Array2<f64> {
    let column = a.insert_axis(Axis(1));
    let row = b.insert_axis(Axis(0));
    column.dot(&row)
}

/// Glorot/Xavier uniform initialisation, `limit = sqrt(6 / (fan_in + fan_out))`.
pub fn glorot_uniform(rows: usize, cols: usize, rng: &mut StdRng) -> Result<Array2<f64>, TrainingError> {
    let limit = (6.0 / (rows + cols).max(1) as f64).sqrt();
    let dist = Uniform::new_inclusive(-limit, limit)
        .map_err(|e| TrainingError::ModelConfiguration(e.to_string()))?;
    Ok(Array2::from_shape_fn((rows, cols), |_| dist.sample(rng)))
}

pub fn random_normal(len: usize, stddev: f64, rng: &mut StdRng) -> Result<Vec<f64>, TrainingError> {
    let normal = Normal::new(0.0, stddev)
        .map_err(|e| TrainingError::ModelConfiguration(e.to_string()))?;
    Ok((0..len).map(|_| normal.sample(rng)).collect())
}

/// Normal samples redrawn until they fall within two standard deviations.
pub fn truncated_normal(len: usize, stddev: f64, rng: &mut StdRng) -> Result<Vec<f64>, TrainingError> {
    let normal = Normal::new(0.0, stddev)
        .map_err(|e| TrainingError::ModelConfiguration(e.to_string()))?;
    let bound = 2.0 * stddev;
    Ok((0..len)
        .map(|_| loop {
            let v = normal.sample(rng);
            if v.abs() <= bound {
                break v;
            }
        })
        .collect())
}

/// Per-column standardisation (zero mean, unit population variance).
/// Columns with no spread are only centred.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StandardScaler {
    pub mean: Array1<f64>,
    pub scale: Array1<f64>,
}

impl StandardScaler {
    pub fn fit(data: &Array2<f64>) -> Result<Self, TrainingError> {
        let mean = data.mean_axis(Axis(0)).ok_or_else(|| {
            TrainingError::DataProcessing("cannot standardize an empty matrix".to_string())
        })?;
        let scale = data
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s < 1e-12 { 1.0 } else { s });
        Ok(StandardScaler { mean, scale })
    }

    pub fn transform(&self, data: &Array2<f64>) -> Result<Array2<f64>, TrainingError> {
        if data.ncols() != self.mean.len() {
            return Err(TrainingError::Shape(format!(
                "scaler fitted on {} features, got {}",
                self.mean.len(),
                data.ncols()
            )));
        }
        Ok((data - &self.mean) / &self.scale)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

#[derive(Debug, Clone)]
pub struct AdamOptimizer {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub t: usize,
    m: HashMap<String, Vec<f64>>,
    v: HashMap<String, Vec<f64>>,
}

impl AdamOptimizer {
    pub fn new(learning_rate: f64, beta1: f64, beta2: f64, epsilon: f64) -> Self {
        AdamOptimizer {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            t: 0,
            m: HashMap::new(),
            v: HashMap::new(),
        }
    }

    fn update<D: Dimension>(&mut self, key: &str, param: &mut Array<f64, D>, grad: &Array<f64, D>) {
        let (lr, beta1, beta2, eps) = (self.learning_rate, self.beta1, self.beta2, self.epsilon);
        let t = self.t.max(1) as i32;
        let bias1 = 1.0 - beta1.powi(t);
        let bias2 = 1.0 - beta2.powi(t);

        let m = self
            .m
            .entry(key.to_string())
            .or_insert_with(|| vec![0.0; grad.len()]);
        let v = self
            .v
            .entry(key.to_string())
            .or_insert_with(|| vec![0.0; grad.len()]);

        for (i, (p, &g)) in param.iter_mut().zip(grad.iter()).enumerate() {
            m[i] = beta1 * m[i] + (1.0 - beta1) * g;
            v[i] = beta2 * v[i] + (1.0 - beta2) * g * g;
            let m_hat = m[i] / bias1;
            let v_hat = v[i] / bias2;
            *p -= lr * m_hat / (v_hat.sqrt() + eps);
        }
    }
}

#[derive(Debug, Clone)]
pub enum Optimizer {
    Sgd { learning_rate: f64 },
    Adam(AdamOptimizer),
}

impl Optimizer {
    pub fn new(kind: OptimizerKind, learning_rate: f64) -> Self {
        match kind {
            OptimizerKind::Sgd => Optimizer::Sgd { learning_rate },
            OptimizerKind::Adam => Optimizer::Adam(AdamOptimizer::new(learning_rate, 0.9, 0.999, 1e-8)),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Optimizer::Sgd { learning_rate } => *learning_rate,
            Optimizer::Adam(adam) => adam.learning_rate,
        }
    }

    /// Marks the start of one parameter update (one minibatch).
    pub fn begin_step(&mut self) {
        if let Optimizer::Adam(adam) = self {
            adam.t += 1;
        }
    }

    pub fn update<D: Dimension>(
        &mut self,
        key: &str,
        param: &mut Array<f64, D>,
        grad: &Array<f64, D>,
    ) -> Result<(), TrainingError> {
        if param.shape() != grad.shape() {
            return Err(TrainingError::Shape(format!(
                "gradient for '{}' has shape {:?}, parameter has {:?}",
                key,
                grad.shape(),
                param.shape()
            )));
        }
        match self {
            Optimizer::Sgd { learning_rate } => param.scaled_add(-*learning_rate, grad),
            Optimizer::Adam(adam) => adam.update(key, param, grad),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};

    #[test]
    fn test_sigmoid_is_stable_for_large_inputs() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-12);
        assert!(sigmoid(800.0) <= 1.0);
        assert!(sigmoid(-800.0) >= 0.0);
        assert!(!sigmoid(-800.0).is_nan());
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let z = array![[1.0, 2.0, 3.0], [1000.0, 1000.0, 1000.0]];
        let p = softmax_rows(&z);
        for row in p.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-12);
        }
        assert!((p[[1, 0]] - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(argmax(p.row(0)).unwrap(), 2);
    }

    #[test]
    fn test_argmax_rejects_nan() {
        let row = array![0.1, f64::NAN, 0.3];
        assert!(argmax(row.view()).is_err());
    }

    #[test]
    fn test_outer() {
        let a = array![1.0, 2.0];
        let b = array![3.0, 4.0, 5.0];
        assert_eq!(outer(a.view(), b.view()), array![[3.0, 4.0, 5.0], [6.0, 8.0, 10.0]]);
    }

    #[test]
    fn test_one_hot() {
        let encoded = one_hot(&[0, 2, 1], 3).unwrap();
        assert_eq!(encoded, array![[1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]]);
        assert!(one_hot(&[3], 3).is_err());
    }

    #[test]
    fn test_standard_scaler() {
        let data = array![[1.0, 5.0], [3.0, 5.0], [5.0, 5.0]];
        let scaler = StandardScaler::fit(&data).unwrap();
        let scaled = scaler.transform(&data).unwrap();

        let mean = scaled.mean_axis(Axis(0)).unwrap();
        assert!(mean.iter().all(|m| m.abs() < 1e-12));
        assert!((scaled.column(0).std(0.0) - 1.0).abs() < 1e-12);
        // constant column is centred, not divided by zero
        assert!(scaled.column(1).iter().all(|&v| v == 0.0));

        assert!(scaler.transform(&array![[1.0, 2.0, 3.0]]).is_err());
    }

    #[test]
    fn test_truncated_normal_bounds() {
        let mut rng = seeded_rng(Some(7));
        let values = truncated_normal(1000, 0.05, &mut rng).unwrap();
        assert_eq!(values.len(), 1000);
        assert!(values.iter().all(|v| v.abs() <= 0.1));
    }

    #[test]
    fn test_sgd_step() {
        let mut opt = Optimizer::new(OptimizerKind::Sgd, 0.5);
        let mut param = array![1.0, 2.0];
        opt.begin_step();
        opt.update("p", &mut param, &array![2.0, -2.0]).unwrap();
        assert_eq!(param, array![0.0, 3.0]);
    }

    #[test]
    fn test_adam_first_step_moves_by_learning_rate() {
        let mut opt = Optimizer::new(OptimizerKind::Adam, 0.01);
        let mut param = Array1::from_vec(vec![1.0, 1.0]);
        opt.begin_step();
        opt.update("p", &mut param, &array![4.0, -0.5]).unwrap();
        assert!((param[0] - 0.99).abs() < 1e-6);
        assert!((param[1] - 1.01).abs() < 1e-6);
    }

    #[test]
    fn test_update_rejects_mismatched_shapes() {
        let mut opt = Optimizer::new(OptimizerKind::Sgd, 0.1);
        let mut param = array![1.0, 2.0];
        assert!(opt.update("p", &mut param, &array![1.0]).is_err());
    }
}
