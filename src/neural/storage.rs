// projeto: genretrain
// file: src/neural/storage.rs
// Model checkpoints on disk (bincode or JSON), named by test accuracy

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::info;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::neural::utils::{StandardScaler, TrainingError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointFormat {
    #[default]
    Bincode,
    Json,
}

impl CheckpointFormat {
    pub fn extension(self) -> &'static str {
        match self {
            CheckpointFormat::Bincode => "bin",
            CheckpointFormat::Json => "json",
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, TrainingError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("bin") => Ok(CheckpointFormat::Bincode),
            Some("json") => Ok(CheckpointFormat::Json),
            _ => Err(TrainingError::Serialization(format!(
                "cannot infer checkpoint format of {}",
                path.display()
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Dense,
    ConvLstm,
}

/// Everything needed to rebuild a trained model and reuse its preprocessing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint<P, C> {
    pub kind: ModelKind,
    pub created_at: DateTime<Utc>,
    pub accuracy: f64,
    pub class_names: Vec<String>,
    pub scaler: Option<StandardScaler>,
    /// Column names the model was trained on, in order.
    pub feature_names: Vec<String>,
    pub config: C,
    pub params: P,
}

impl<P, C> Checkpoint<P, C> {
    pub fn new(kind: ModelKind, accuracy: f64, class_names: Vec<String>, config: C, params: P) -> Self {
        Checkpoint {
            kind,
            created_at: Utc::now(),
            accuracy,
            class_names,
            scaler: None,
            feature_names: Vec::new(),
            config,
            params,
        }
    }

    pub fn with_scaler(mut self, scaler: StandardScaler) -> Self {
        self.scaler = Some(scaler);
        self
    }

    pub fn with_feature_names(mut self, names: Vec<String>) -> Self {
        self.feature_names = names;
        self
    }
}

/// Leading field of every checkpoint.
#[derive(Deserialize)]
struct CheckpointHeader {
    kind: ModelKind,
}

/// `<prefix>_<accuracy with 3 decimals>.<ext>`
pub fn checkpoint_file_name(prefix: &str, accuracy: f64, format: CheckpointFormat) -> String {
    format!("{}_{:.3}.{}", prefix, accuracy, format.extension())
}

pub fn save_checkpoint<P: Serialize, C: Serialize>(
    dir: &Path,
    prefix: &str,
    checkpoint: &Checkpoint<P, C>,
    format: CheckpointFormat,
) -> Result<PathBuf, TrainingError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(checkpoint_file_name(prefix, checkpoint.accuracy, format));

    let bytes = match format {
        CheckpointFormat::Bincode => bincode::serde::encode_to_vec(checkpoint, bincode::config::standard())?,
        CheckpointFormat::Json => serde_json::to_vec_pretty(checkpoint)?,
    };
    fs::write(&path, bytes)?;

    info!("💾 Model saved to {}", path.display());
    Ok(path)
}

fn decode<T: DeserializeOwned>(bytes: &[u8], format: CheckpointFormat) -> Result<T, TrainingError> {
    match format {
        CheckpointFormat::Bincode => {
            let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
            Ok(value)
        }
        CheckpointFormat::Json => Ok(serde_json::from_slice(bytes)?),
    }
}

/// Reads only the model kind of a checkpoint.
pub fn checkpoint_kind(path: &Path) -> Result<ModelKind, TrainingError> {
    let format = CheckpointFormat::from_path(path)?;
    let header: CheckpointHeader = decode(&fs::read(path)?, format)?;
    Ok(header.kind)
}

/// Loads a checkpoint, failing early when it holds another kind of model.
pub fn load_checkpoint<P: DeserializeOwned, C: DeserializeOwned>(
    path: &Path,
    expected: ModelKind,
) -> Result<Checkpoint<P, C>, TrainingError> {
    let format = CheckpointFormat::from_path(path)?;
    let bytes = fs::read(path)?;
    let header: CheckpointHeader = decode(&bytes, format)?;
    if header.kind != expected {
        return Err(TrainingError::ModelConfiguration(format!(
            "{} holds a {:?} model, expected {:?}",
            path.display(),
            header.kind,
            expected
        )));
    }
    decode(&bytes, format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::dense::{DenseConfig, DenseNetwork, DenseParams};
    use crate::neural::utils::seeded_rng;
    use ndarray::{array, Array2};

    #[test]
    fn test_file_name_uses_three_decimals() {
        assert_eq!(
            checkpoint_file_name("dense_xml_ledzep_random", 0.87654, CheckpointFormat::Bincode),
            "dense_xml_ledzep_random_0.877.bin"
        );
        assert_eq!(checkpoint_file_name("m", 1.0, CheckpointFormat::Json), "m_1.000.json");
    }

    #[test]
    fn test_round_trip_preserves_predictions() {
        let mut rng = seeded_rng(Some(4));
        let config = DenseConfig {
            hidden_layers: vec![6, 4],
            ..DenseConfig::default()
        };
        let net = DenseNetwork::new(3, &config, 2, &mut rng).unwrap();
        let scaler = StandardScaler {
            mean: array![1.0, 2.0, 3.0],
            scale: array![1.0, 0.5, 2.0],
        };
        let x = Array2::from_shape_fn((4, 3), |(i, j)| (i + j) as f64 * 0.3);
        let expected = net.predict(&x).unwrap();

        let dir = tempfile::tempdir().unwrap();
        for format in [CheckpointFormat::Bincode, CheckpointFormat::Json] {
            let checkpoint = Checkpoint::new(
                ModelKind::Dense,
                0.75,
                vec!["ledzep".to_string(), "random".to_string()],
                config.clone(),
                net.params().clone(),
            )
            .with_scaler(scaler.clone())
            .with_feature_names(vec!["A".into(), "B".into(), "C".into()]);
            let path = save_checkpoint(dir.path(), "dense", &checkpoint, format).unwrap();
            assert!(path.ends_with(format!("dense_0.750.{}", format.extension())));

            assert_eq!(checkpoint_kind(&path).unwrap(), ModelKind::Dense);
            let loaded: Checkpoint<DenseParams, DenseConfig> = load_checkpoint(&path, ModelKind::Dense).unwrap();
            assert_eq!(loaded.kind, ModelKind::Dense);
            assert_eq!(loaded.class_names, checkpoint.class_names);
            assert_eq!(loaded.scaler, Some(scaler.clone()));
            assert_eq!(loaded.feature_names, vec!["A", "B", "C"]);
            assert_eq!(loaded.config.hidden_layers, vec![6, 4]);

            let restored = DenseNetwork::from_params(loaded.params).unwrap();
            let predicted = restored.predict(&x).unwrap();
            assert!(predicted.iter().zip(&expected).all(|(a, b)| (a - b).abs() < 1e-12));
        }
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let result: Result<Checkpoint<DenseParams, DenseConfig>, _> =
            load_checkpoint(Path::new("model.h5"), ModelKind::Dense);
        assert!(matches!(result, Err(TrainingError::Serialization(_))));
    }

    #[test]
    fn test_other_model_kind_is_rejected_before_decoding() {
        let dir = tempfile::tempdir().unwrap();
        for format in [CheckpointFormat::Bincode, CheckpointFormat::Json] {
            let checkpoint = Checkpoint::new(ModelKind::ConvLstm, 0.5, vec!["a".into()], 7u32, vec![1.0f64, 2.0]);
            let path = save_checkpoint(dir.path(), "conv", &checkpoint, format).unwrap();

            assert_eq!(checkpoint_kind(&path).unwrap(), ModelKind::ConvLstm);
            let result: Result<Checkpoint<DenseParams, DenseConfig>, _> = load_checkpoint(&path, ModelKind::Dense);
            match result {
                Err(TrainingError::ModelConfiguration(msg)) => assert!(msg.contains("ConvLstm"), "{}", msg),
                other => panic!("expected a kind mismatch, got {:?}", other.map(|c| c.kind)),
            }
        }
    }
}
