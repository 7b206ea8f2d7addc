// projeto: finoexport
// file: src/neural/mod.rs
// Module declarations for the forecaster export pipeline

pub mod utils;    // Error type and atomic file writes
pub mod config;   // Size table, policies and TOML configuration
pub mod model;    // Encoder/decoder LSTM and the decoding loop
pub mod storage;  // Checkpoint loading and architecture validation
pub mod data;     // Vocabulary, scaler and synthetic inputs
pub mod onnx;     // ONNX protobuf messages
pub mod graph;    // ONNX graph construction and export
pub mod verify;   // Graph interpreter and fidelity check
pub mod metrics;  // Fidelity reports, sidecar config and run summary

// Re-export commonly used items for convenience
pub use config::{ExportConfig, MissingFilePolicy, ModelSize};
pub use storage::ParameterStore;
pub use utils::ExportError;
