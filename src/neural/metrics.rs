// projeto: genretrain
// file: src/neural/metrics.rs
// Accuracy, confusion matrix and per-round accuracy history

use std::fs;
use std::path::Path;

use log::info;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::neural::utils::{argmax, TrainingError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: f64,
}

pub fn predicted_classes(probs: &Array2<f64>) -> Result<Vec<usize>, TrainingError> {
    probs.rows().into_iter().map(argmax).collect()
}

pub fn count_correct(probs: &Array2<f64>, labels: &[usize]) -> Result<usize, TrainingError> {
    if probs.nrows() != labels.len() {
        return Err(TrainingError::Shape(format!(
            "{} predictions for {} labels",
            probs.nrows(),
            labels.len()
        )));
    }
    let predicted = predicted_classes(probs)?;
    Ok(predicted.iter().zip(labels).filter(|(p, l)| p == l).count())
}

/// Fraction of rows whose highest probability is the true class.
pub fn accuracy(probs: &Array2<f64>, labels: &[usize]) -> Result<f64, TrainingError> {
    if labels.is_empty() {
        return Ok(0.0);
    }
    Ok(count_correct(probs, labels)? as f64 / labels.len() as f64)
}

/// Rows are true classes, columns predicted classes.
pub fn confusion_matrix(
    predicted: &[usize],
    labels: &[usize],
    n_classes: usize,
) -> Result<Array2<usize>, TrainingError> {
    let mut matrix = Array2::zeros((n_classes, n_classes));
    for (&p, &l) in predicted.iter().zip(labels) {
        if p >= n_classes || l >= n_classes {
            return Err(TrainingError::DataProcessing(format!(
                "class index out of range: predicted {}, label {}",
                p, l
            )));
        }
        matrix[[l, p]] += 1;
    }
    Ok(matrix)
}

pub fn log_confusion(matrix: &Array2<usize>, class_names: &[String]) {
    info!("📊 Confusion matrix (rows = true, cols = predicted)");
    for (i, row) in matrix.rows().into_iter().enumerate() {
        let name = class_names.get(i).map(String::as_str).unwrap_or("?");
        let cells: Vec<String> = row.iter().map(|c| format!("{:>5}", c)).collect();
        info!("   {:<16} {}", name, cells.join(" "));
    }
}

#[derive(Debug, Serialize)]
struct HistoryRow {
    step: usize,
    train_accuracy: f64,
    test_accuracy: f64,
}

#[derive(Debug, Clone, Default)]
pub struct AccuracyHistory {
    pub steps: Vec<usize>,
    pub train: Vec<f64>,
    pub test: Vec<f64>,
}

impl AccuracyHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: usize, train: f64, test: f64) {
        self.steps.push(step);
        self.train.push(train);
        self.test.push(test);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn save_to_csv<P: AsRef<Path>>(&self, path: P) -> Result<(), TrainingError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        for ((&step, &train_accuracy), &test_accuracy) in self.steps.iter().zip(&self.train).zip(&self.test) {
            writer.serialize(HistoryRow {
                step,
                train_accuracy,
                test_accuracy,
            })?;
        }
        writer.flush()?;
        Ok(())
    }
}
