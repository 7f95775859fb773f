// projeto: genretrain
// file: src/neural/mod.rs
// Module declarations for the genre/artist classifiers

pub mod utils;      // Error type, activations, optimizers and scaling
pub mod features;   // jSymbolic2 XML feature files -> design matrix
pub mod notes;      // Notes, tracks and songs (MIDI / JSON)
pub mod windowing;  // Songs -> fixed-size note windows
pub mod metrics;    // Accuracy, confusion matrix, history
pub mod dense;      // Dense network for feature vectors
pub mod conv_lstm;  // Convolution + LSTM network for note windows
pub mod storage;    // Checkpoints on disk
pub mod plot;       // Accuracy plots

pub use conv_lstm::{ConvLstmConfig, ConvLstmNetwork};
pub use dense::{DenseConfig, DenseNetwork};
pub use utils::TrainingError;
