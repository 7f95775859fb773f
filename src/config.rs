// projeto: genretrain
// file: src/config.rs
// Configuração do sistema (config.toml)

use std::fs;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::neural::conv_lstm::ConvLstmConfig;
use crate::neural::dense::DenseConfig;
use crate::neural::storage::CheckpointFormat;
use crate::neural::utils::TrainingError;
use crate::neural::windowing::WindowConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub features: FeaturesConfig,
    pub dense: DenseConfig,
    pub sequences: SequencesConfig,
    pub conv_lstm: ConvLstmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: String,
    pub plots_dir: String,
    pub history_dir: String,
    pub checkpoint_format: CheckpointFormat,
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            models_dir: "models".to_string(),
            plots_dir: "plot".to_string(),
            history_dir: "history".to_string(),
            checkpoint_format: CheckpointFormat::Bincode,
        }
    }
}

/// One jSymbolic2 feature file; its position in the list is its label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureClass {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    pub tag: String,
    pub train_ratio: f64,
    pub seed: Option<u64>,
    pub classes: Vec<FeatureClass>,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        FeaturesConfig {
            tag: "ledzep_random".to_string(),
            train_ratio: 0.8,
            seed: None,
            classes: vec![
                FeatureClass {
                    name: "ledzep".to_string(),
                    path: "jSymbolic2/features/extracted_feature_led_zep124.xml".to_string(),
                },
                FeatureClass {
                    name: "random".to_string(),
                    path: "jSymbolic2/features/extracted_feature_random_feat.xml".to_string(),
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencesConfig {
    pub tag: String,
    /// Holds `train/<class>/` and `test/<class>/`.
    pub corpus_dir: String,
    pub classes: Vec<String>,
    pub seed: Option<u64>,
    pub window: WindowConfig,
}

impl Default for SequencesConfig {
    fn default() -> Self {
        SequencesConfig {
            tag: "ledzep_random".to_string(),
            corpus_dir: "dataset".to_string(),
            classes: vec!["ledzep".to_string(), "random".to_string()],
            seed: None,
            window: WindowConfig::default(),
        }
    }
}

impl AppConfig {
    /// Reads `path` when it exists, otherwise writes and returns the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let config: AppConfig = toml::from_str(&content)?;
            info!("⚙️ Configuração carregada de: {}", path.display());
            Ok(config)
        } else {
            info!("📄 {} não encontrado. Criando padrão...", path.display());
            let config = AppConfig::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), TrainingError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| TrainingError::Serialization(e.to_string()))?;
        fs::write(path.as_ref(), content)?;
        info!("💾 Configuração salva em: {}", path.as_ref().display());
        Ok(())
    }

    /// Checks the sections used by the `features` and `predict` runs.
    pub fn validate_features(&self) -> Result<(), TrainingError> {
        if self.features.classes.len() < 2 || self.features.classes.len() > 4 {
            return Err(TrainingError::ModelConfiguration(format!(
                "feature pipeline needs 2 to 4 classes, got {}",
                self.features.classes.len()
            )));
        }
        if !(self.features.train_ratio > 0.0 && self.features.train_ratio < 1.0) {
            return Err(TrainingError::ModelConfiguration(format!(
                "train_ratio must be in (0, 1), got {}",
                self.features.train_ratio
            )));
        }
        self.dense.validate()
    }

    /// Checks the sections used by the `sequences` run.
    pub fn validate_sequences(&self) -> Result<(), TrainingError> {
        if self.sequences.classes.len() < 2 {
            return Err(TrainingError::ModelConfiguration(
                "sequence pipeline needs at least 2 classes".to_string(),
            ));
        }
        self.conv_lstm.validate()?;
        self.sequences.window.validate()
    }
}
