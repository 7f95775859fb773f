// projeto: genretrain
// file: src/neural/features.rs
// Leitura dos arquivos XML de features (jSymbolic2) e montagem da matriz de treino

use std::fs;
use std::path::Path;

use log::{debug, info};
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use roxmltree::{Document, Node, ParsingOptions};

use crate::neural::utils::{StandardScaler, TrainingError};

/// Songs of one feature file, all labelled with the same class.
#[derive(Debug, Clone)]
pub struct ParsedClass {
    pub source: String,
    pub class: usize,
    pub song_ids: Vec<String>,
    pub feature_names: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

#[derive(Debug, Clone)]
pub struct FeatureSet {
    pub x: Array2<f64>,
    pub labels: Vec<usize>,
    pub song_ids: Vec<String>,
    pub feature_names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TrainTest {
    pub x_train: Array2<f64>,
    pub x_test: Array2<f64>,
    pub y_train: Vec<usize>,
    pub y_test: Vec<usize>,
}

fn element_children<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|n| n.is_element())
}

fn node_text(node: Node) -> String {
    node.descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect::<String>()
        .trim()
        .to_string()
}

/// Parses a decimal written with either ',' or '.' as separator.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    raw.trim()
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

/// Parses one jSymbolic2 feature file.
///
/// The first child of the root is a header, every other child is a song.
/// The first child of a song is its identifier; each following child is a
/// feature whose first child is the name and second child the value.
pub fn parse_feature_xml(text: &str, class: usize, source: &str) -> Result<ParsedClass, TrainingError> {
    let options = ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    };
    let doc = Document::parse_with_options(text, options)?;

    let mut parsed = ParsedClass {
        source: source.to_string(),
        class,
        song_ids: Vec::new(),
        feature_names: Vec::new(),
        rows: Vec::new(),
    };

    for song in element_children(doc.root_element()).skip(1) {
        let mut children = element_children(song);
        let song_id = children.next().map(node_text).unwrap_or_default();

        let mut names = Vec::new();
        let mut row = Vec::new();
        for feature in children {
            let mut parts = element_children(feature);
            let name = parts.next().map(node_text).unwrap_or_default();
            let raw = parts.next().map(node_text).unwrap_or_default();

            let value = parse_decimal(&raw).ok_or_else(|| TrainingError::FeatureParse {
                file: source.to_string(),
                song: song_id.clone(),
                feature: name.clone(),
                value: raw.clone(),
            })?;
            names.push(name);
            row.push(value);
        }

        if parsed.rows.is_empty() {
            parsed.feature_names = names;
        } else if row.len() != parsed.feature_names.len() {
            return Err(TrainingError::DataProcessing(format!(
                "song '{}' in {} has {} features, expected {}",
                song_id,
                source,
                row.len(),
                parsed.feature_names.len()
            )));
        }

        parsed.song_ids.push(song_id);
        parsed.rows.push(row);
    }

    debug!(
        "{}: {} songs, {} features",
        source,
        parsed.rows.len(),
        parsed.feature_names.len()
    );
    Ok(parsed)
}

pub fn load_feature_file<P: AsRef<Path>>(path: P, class: usize) -> Result<ParsedClass, TrainingError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    parse_feature_xml(&text, class, &path.display().to_string())
}

/// `found` must list the `expected` features in the same order.
fn check_names(expected: &[String], found: &[String], source: &str) -> Result<(), TrainingError> {
    if found.len() != expected.len() {
        return Err(TrainingError::DataProcessing(format!(
            "{} has {} features, expected {}",
            source,
            found.len(),
            expected.len()
        )));
    }
    if let Some((i, (want, got))) = expected.iter().zip(found).enumerate().find(|(_, (a, b))| a != b) {
        return Err(TrainingError::DataProcessing(format!(
            "{}: feature {} is '{}', expected '{}'",
            source, i, got, want
        )));
    }
    Ok(())
}

/// Concatenates the classes, in order, into one design matrix.
pub fn assemble(classes: Vec<ParsedClass>) -> Result<FeatureSet, TrainingError> {
    let width = classes
        .iter()
        .find(|c| !c.rows.is_empty())
        .map(|c| c.feature_names.len())
        .ok_or_else(|| TrainingError::DataProcessing("no songs found in any feature file".to_string()))?;

    let mut feature_names = Vec::new();
    let mut values = Vec::new();
    let mut labels = Vec::new();
    let mut song_ids = Vec::new();

    for class in classes {
        if class.rows.is_empty() {
            continue;
        }
        if class.feature_names.len() != width {
            return Err(TrainingError::DataProcessing(format!(
                "{} has {} features per song, expected {}",
                class.source,
                class.feature_names.len(),
                width
            )));
        }
        if feature_names.is_empty() {
            feature_names = class.feature_names.clone();
        } else {
            check_names(&feature_names, &class.feature_names, &class.source)?;
        }
        info!("📂 {}: {} songs (class {})", class.source, class.rows.len(), class.class);
        for (id, row) in class.song_ids.into_iter().zip(class.rows) {
            values.extend(row);
            labels.push(class.class);
            song_ids.push(id);
        }
    }

    let x = Array2::from_shape_vec((labels.len(), width), values)?;
    Ok(FeatureSet {
        x,
        labels,
        song_ids,
        feature_names,
    })
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.x.ncols()
    }

    /// Fails unless the columns are exactly `expected`, in order.
    pub fn check_feature_names(&self, expected: &[String], source: &str) -> Result<(), TrainingError> {
        check_names(expected, &self.feature_names, source)
    }

    /// Fits a scaler on the whole matrix and applies it in place.
    pub fn standardize(&mut self) -> Result<StandardScaler, TrainingError> {
        let scaler = StandardScaler::fit(&self.x)?;
        self.x = scaler.transform(&self.x)?;
        Ok(scaler)
    }

    /// Random permutation; the first `floor(ratio * n)` rows go to training.
    pub fn split(&self, ratio: f64, rng: &mut StdRng) -> Result<TrainTest, TrainingError> {
        if !(ratio > 0.0 && ratio < 1.0) {
            return Err(TrainingError::ModelConfiguration(format!(
                "train ratio must be in (0, 1), got {}",
                ratio
            )));
        }

        let n = self.len();
        let cut = (ratio * n as f64).floor() as usize;
        if cut == 0 || cut == n {
            return Err(TrainingError::DataProcessing(format!(
                "{} songs cannot be split with ratio {}",
                n, ratio
            )));
        }

        let mut indices: Vec<usize> = (0..n).collect();
        indices.shuffle(rng);
        let (train_idx, test_idx) = indices.split_at(cut);

        Ok(TrainTest {
            x_train: self.x.select(Axis(0), train_idx),
            x_test: self.x.select(Axis(0), test_idx),
            y_train: train_idx.iter().map(|&i| self.labels[i]).collect(),
            y_test: test_idx.iter().map(|&i| self.labels[i]).collect(),
        })
    }
}
