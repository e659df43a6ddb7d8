//! Typed errors for each pipeline stage.
//!
//! Stage glue and the CLI wrap these in `anyhow` with added context.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("No time column found (expected 'time' or 'datetime'). Found columns: {found:?}")]
    MissingTimeColumn { found: Vec<String> },

    #[error("Both 'time' and 'datetime' columns are present; keep exactly one")]
    AmbiguousTimeColumn,

    #[error("Target column '{expected}' is missing. Found columns: {found:?}")]
    MissingTargetColumn {
        expected: &'static str,
        found: Vec<String>,
    },

    #[error("Failed to read CSV file {path}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("No usable rows in the CSV ({dropped} dropped for missing or malformed values)")]
    NoUsableRows { dropped: usize },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {field} {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Error, PartialEq)]
pub enum ScalerError {
    #[error("Scaler has not been fitted")]
    NotFitted,

    #[error("Scaler fitted on {expected} columns, got {actual}")]
    ColumnMismatch { expected: usize, actual: usize },

    #[error("Cannot fit scaler on an empty feature matrix")]
    Empty,
}

#[derive(Debug, Error, PartialEq)]
pub enum SequenceError {
    #[error("Window size must be positive")]
    ZeroWindow,

    #[error("Feature rows ({features}) and labels ({labels}) differ in length")]
    LengthMismatch { features: usize, labels: usize },
}

#[derive(Debug, Error, PartialEq)]
pub enum TrainError {
    #[error(
        "Not enough samples to split: {total} sequences gives {train} for training and {validation} for validation"
    )]
    NotEnoughSamples {
        total: usize,
        train: usize,
        validation: usize,
    },

    #[error("Input has {actual} features per step, model expects {expected}")]
    FeatureMismatch { expected: usize, actual: usize },

    #[error("Label {label} is out of range for {num_classes} classes")]
    LabelOutOfRange { label: usize, num_classes: usize },

    #[error("Training diverged: loss became {0} at epoch {1}")]
    Diverged(f32, usize),
}

#[derive(Debug, Error, PartialEq)]
pub enum ExportError {
    #[error("Operation '{op}' has no int8 kernel: {reason}")]
    UnsupportedOp { op: String, reason: &'static str },

    #[error("No calibration samples available")]
    NoCalibrationData,

    #[error("Calibration produced a non-finite range for {0}")]
    NonFiniteRange(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum ArtifactError {
    #[error("Not a weather-nn artifact (bad magic)")]
    BadMagic,

    #[error("Unsupported artifact version {0}")]
    UnsupportedVersion(u16),

    #[error("Artifact truncated at byte {0}")]
    Truncated(usize),

    #[error("Cannot decode artifact body: {0}")]
    Decode(String),

    #[error("Cannot encode artifact body: {0}")]
    Encode(String),

    #[error("Inconsistent layer {index}: {reason}")]
    Malformed { index: usize, reason: String },

    #[error("Input has {actual} values, model expects {expected}")]
    InputShape { expected: usize, actual: usize },
}
