// projeto: genretrain
// file: src/neural/dense.rs
// Rede densa (MLP) para classificação a partir dos vetores de features

use log::{debug, info};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::neural::features::TrainTest;
use crate::neural::metrics::{accuracy, count_correct, AccuracyHistory, Evaluation};
use crate::neural::utils::{
    glorot_uniform, one_hot, relu, sigmoid, softmax_rows, Optimizer, OptimizerKind, TrainingError,
};

const EPSILON: f64 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputActivation {
    /// Independent sigmoids, normalised to sum to one inside the loss.
    #[default]
    Sigmoid,
    Softmax,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DenseConfig {
    pub hidden_layers: Vec<usize>,
    pub dropout: f64,
    pub learning_rate: f64,
    pub optimizer: OptimizerKind,
    pub rounds: usize,
    pub epochs_per_round: usize,
    pub batch_size: usize,
    pub output: OutputActivation,
}

impl Default for DenseConfig {
    fn default() -> Self {
        DenseConfig {
            hidden_layers: vec![600, 600, 600, 300],
            dropout: 0.6,
            learning_rate: 0.001,
            optimizer: OptimizerKind::Sgd,
            rounds: 50,
            epochs_per_round: 50,
            batch_size: 100,
            output: OutputActivation::Sigmoid,
        }
    }
}

impl DenseConfig {
    pub fn validate(&self) -> Result<(), TrainingError> {
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(TrainingError::ModelConfiguration(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.hidden_layers.contains(&0) {
            return Err(TrainingError::ModelConfiguration(
                "hidden layers must have at least one unit".to_string(),
            ));
        }
        if self.batch_size == 0 || self.learning_rate <= 0.0 {
            return Err(TrainingError::ModelConfiguration(
                "batch_size and learning_rate must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseLayerParams {
    /// `(inputs, outputs)`
    pub w: Array2<f64>,
    pub b: Array1<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseParams {
    pub input_dim: usize,
    pub n_classes: usize,
    pub dropout: f64,
    pub output: OutputActivation,
    pub layers: Vec<DenseLayerParams>,
}

struct ForwardCache {
    inputs: Vec<Array2<f64>>,
    pre_activations: Vec<Array2<f64>>,
    masks: Vec<Option<Array2<f64>>>,
    output: Array2<f64>,
}

#[derive(Debug, Clone)]
pub struct DenseNetwork {
    params: DenseParams,
}

impl DenseNetwork {
    pub fn new(
        input_dim: usize,
        config: &DenseConfig,
        n_classes: usize,
        rng: &mut StdRng,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        if input_dim == 0 || n_classes < 2 {
            return Err(TrainingError::ModelConfiguration(format!(
                "need input_dim > 0 and at least 2 classes, got {} and {}",
                input_dim, n_classes
            )));
        }

        let mut sizes = vec![input_dim];
        sizes.extend(&config.hidden_layers);
        sizes.push(n_classes);

        let layers = sizes
            .windows(2)
            .map(|pair| {
                Ok(DenseLayerParams {
                    w: glorot_uniform(pair[0], pair[1], rng)?,
                    b: Array1::zeros(pair[1]),
                })
            })
            .collect::<Result<Vec<_>, TrainingError>>()?;

        Ok(DenseNetwork {
            params: DenseParams {
                input_dim,
                n_classes,
                dropout: config.dropout,
                output: config.output,
                layers,
            },
        })
    }

    pub fn from_params(params: DenseParams) -> Result<Self, TrainingError> {
        let mut expected_in = params.input_dim;
        for (i, layer) in params.layers.iter().enumerate() {
            if layer.w.nrows() != expected_in || layer.b.len() != layer.w.ncols() {
                return Err(TrainingError::Shape(format!(
                    "dense layer {} has weights {:?} and bias {}, expected {} inputs",
                    i,
                    layer.w.dim(),
                    layer.b.len(),
                    expected_in
                )));
            }
            expected_in = layer.w.ncols();
        }
        if params.layers.is_empty() || expected_in != params.n_classes {
            return Err(TrainingError::Shape(format!(
                "dense network ends with {} outputs, expected {}",
                expected_in, params.n_classes
            )));
        }
        Ok(DenseNetwork { params })
    }

    pub fn params(&self) -> &DenseParams {
        &self.params
    }

    pub fn num_parameters(&self) -> usize {
        self.params.layers.iter().map(|l| l.w.len() + l.b.len()).sum()
    }

    fn check_input(&self, x: &Array2<f64>, labels: Option<&[usize]>) -> Result<(), TrainingError> {
        if x.ncols() != self.params.input_dim {
            return Err(TrainingError::Shape(format!(
                "network expects {} features, got {}",
                self.params.input_dim,
                x.ncols()
            )));
        }
        if let Some(labels) = labels {
            if labels.len() != x.nrows() {
                return Err(TrainingError::Shape(format!(
                    "{} rows but {} labels",
                    x.nrows(),
                    labels.len()
                )));
            }
        }
        Ok(())
    }

    /// Dropout is only applied when a generator is supplied.
    fn forward(&self, x: &Array2<f64>, mut rng: Option<&mut StdRng>) -> ForwardCache {
        let last = self.params.layers.len() - 1;
        let keep = 1.0 - self.params.dropout;
        let mut cache = ForwardCache {
            inputs: Vec::with_capacity(last + 1),
            pre_activations: Vec::with_capacity(last),
            masks: Vec::with_capacity(last),
            output: Array2::zeros((0, 0)),
        };

        let mut a = x.clone();
        for (i, layer) in self.params.layers.iter().enumerate() {
            let z = a.dot(&layer.w) + &layer.b;
            cache.inputs.push(a);
            if i == last {
                cache.output = match self.params.output {
                    OutputActivation::Sigmoid => z.mapv(sigmoid),
                    OutputActivation::Softmax => softmax_rows(&z),
                };
                break;
            }

            let mut activated = z.mapv(relu);
            let mask = match rng.as_deref_mut() {
                Some(rng) if self.params.dropout > 0.0 => {
                    let mask = Array2::from_shape_fn(z.raw_dim(), |_| {
                        if rng.random::<f64>() < keep { 1.0 / keep } else { 0.0 }
                    });
                    activated *= &mask;
                    Some(mask)
                }
                _ => None,
            };
            cache.pre_activations.push(z);
            cache.masks.push(mask);
            a = activated;
        }
        cache
    }

    /// Mean categorical cross-entropy over the rows.
    fn loss(&self, output: &Array2<f64>, targets: &Array2<f64>) -> f64 {
        let mut total = 0.0;
        for (row, target) in output.rows().into_iter().zip(targets.rows()) {
            let norm = match self.params.output {
                OutputActivation::Sigmoid => row.sum().max(EPSILON),
                OutputActivation::Softmax => 1.0,
            };
            for (&p, &t) in row.iter().zip(target.iter()) {
                if t > 0.0 {
                    total -= t * (p / norm).clamp(EPSILON, 1.0 - EPSILON).ln();
                }
            }
        }
        total / output.nrows().max(1) as f64
    }

    fn output_delta(&self, output: &Array2<f64>, targets: &Array2<f64>) -> Array2<f64> {
        let n = output.nrows().max(1) as f64;
        match self.params.output {
            OutputActivation::Softmax => (output - targets) / n,
            OutputActivation::Sigmoid => {
                let mut delta = Array2::zeros(output.raw_dim());
                for ((mut d, s), t) in delta.rows_mut().into_iter().zip(output.rows()).zip(targets.rows()) {
                    let total = s.sum().max(EPSILON);
                    let t_sum = t.sum();
                    for k in 0..s.len() {
                        d[k] = (1.0 - s[k]) * (s[k] * t_sum / total - t[k]) / n;
                    }
                }
                delta
            }
        }
    }

    fn gradients(&self, cache: &ForwardCache, targets: &Array2<f64>) -> Vec<(Array2<f64>, Array1<f64>)> {
        let n_layers = self.params.layers.len();
        let mut grads = Vec::with_capacity(n_layers);
        let mut delta = self.output_delta(&cache.output, targets);

        for i in (0..n_layers).rev() {
            let dw = cache.inputs[i].t().dot(&delta);
            let db = delta.sum_axis(Axis(0));
            if i > 0 {
                let mut next = delta.dot(&self.params.layers[i].w.t());
                next.zip_mut_with(&cache.pre_activations[i - 1], |d, &z| {
                    if z <= 0.0 {
                        *d = 0.0;
                    }
                });
                if let Some(mask) = &cache.masks[i - 1] {
                    next *= mask;
                }
                delta = next;
            }
            grads.push((dw, db));
        }
        grads.reverse();
        grads
    }

    pub fn predict(&self, x: &Array2<f64>) -> Result<Array2<f64>, TrainingError> {
        self.check_input(x, None)?;
        Ok(self.forward(x, None).output)
    }

    pub fn evaluate(&self, x: &Array2<f64>, labels: &[usize]) -> Result<Evaluation, TrainingError> {
        self.check_input(x, Some(labels))?;
        if labels.is_empty() {
            return Ok(Evaluation::default());
        }
        let targets = one_hot(labels, self.params.n_classes)?;
        let output = self.forward(x, None).output;
        Ok(Evaluation {
            loss: self.loss(&output, &targets),
            accuracy: accuracy(&output, labels)?,
        })
    }

    /// One pass over shuffled minibatches. Returns the loss and accuracy seen
    /// during training (with dropout active).
    pub fn fit_epoch(
        &mut self,
        x: &Array2<f64>,
        labels: &[usize],
        batch_size: usize,
        optimizer: &mut Optimizer,
        rng: &mut StdRng,
    ) -> Result<Evaluation, TrainingError> {
        self.check_input(x, Some(labels))?;
        if labels.is_empty() {
            return Err(TrainingError::Training("empty training set".to_string()));
        }
        let targets = one_hot(labels, self.params.n_classes)?;

        let mut indices: Vec<usize> = (0..labels.len()).collect();
        indices.shuffle(rng);

        let mut loss_sum = 0.0;
        let mut correct = 0;
        for chunk in indices.chunks(batch_size.max(1)) {
            let xb = x.select(Axis(0), chunk);
            let tb = targets.select(Axis(0), chunk);
            let batch_labels: Vec<usize> = chunk.iter().map(|&i| labels[i]).collect();

            let cache = self.forward(&xb, Some(&mut *rng));
            loss_sum += self.loss(&cache.output, &tb) * chunk.len() as f64;
            correct += count_correct(&cache.output, &batch_labels)?;

            let grads = self.gradients(&cache, &tb);
            optimizer.begin_step();
            for (i, (layer, (dw, db))) in self.params.layers.iter_mut().zip(grads).enumerate() {
                optimizer.update(&format!("dense{}.w", i), &mut layer.w, &dw)?;
                optimizer.update(&format!("dense{}.b", i), &mut layer.b, &db)?;
            }
        }

        let n = labels.len() as f64;
        Ok(Evaluation {
            loss: loss_sum / n,
            accuracy: correct as f64 / n,
        })
    }
}

/// Trains for `rounds` x `epochs_per_round` epochs. After each round the last
/// epoch's training accuracy and the test accuracy are recorded.
pub fn train(
    network: &mut DenseNetwork,
    data: &TrainTest,
    config: &DenseConfig,
    rng: &mut StdRng,
) -> Result<(AccuracyHistory, Evaluation), TrainingError> {
    config.validate()?;
    let mut optimizer = Optimizer::new(config.optimizer, config.learning_rate);
    let mut history = AccuracyHistory::new();

    info!(
        "🧠 Dense network: {} parameters, {} rounds x {} epochs, batch {}, {:?} lr {}",
        network.num_parameters(),
        config.rounds,
        config.epochs_per_round,
        config.batch_size,
        config.optimizer,
        optimizer.learning_rate()
    );

    for round in 1..=config.rounds {
        let mut last = Evaluation::default();
        for epoch in 1..=config.epochs_per_round {
            last = network.fit_epoch(&data.x_train, &data.y_train, config.batch_size, &mut optimizer, rng)?;
            debug!(
                "round {} epoch {}: loss {:.4} acc {:.4}",
                round, epoch, last.loss, last.accuracy
            );
        }
        if !last.loss.is_finite() {
            return Err(TrainingError::Training(format!("loss diverged in round {}", round)));
        }

        let test = network.evaluate(&data.x_test, &data.y_test)?;
        history.push(round, last.accuracy, test.accuracy);
        info!(
            "📈 Round {}/{}: train loss {:.4} acc {:.4} | test loss {:.4} acc {:.4}",
            round, config.rounds, last.loss, last.accuracy, test.loss, test.accuracy
        );
    }

    let final_eval = network.evaluate(&data.x_test, &data.y_test)?;
    info!("✅ Test accuracy: {:.3}", final_eval.accuracy);
    Ok((history, final_eval))
}
