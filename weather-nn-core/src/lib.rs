//! Core library for the `weather-nn` CLI.
//!
//! This crate defines:
//! - Configuration loading and validation
//! - CSV loading with WMO code bucketing and month encoding
//! - Scaling, windowing and the train/validation split
//! - A 1-D convolutional classifier trained with Adam
//! - int8 post-training quantization and the device artifact
//!
//! It is used by `weather-nn-cli`, but can also be reused by other binaries.

pub mod category;
pub mod config;
pub mod curves;
pub mod dataset;
pub mod error;
pub mod export;
pub mod model;
pub mod pipeline;
pub mod scaler;
pub mod sequence;
pub mod train;

pub use category::{CodeMapping, NUM_CLASSES, WeatherCategory};
pub use config::PipelineConfig;
pub use dataset::{Dataset, load_dataset};
pub use export::QuantizedModel;
pub use model::{Activation, ConvClassifier};
pub use pipeline::{LabelFile, PipelineReport};
pub use scaler::MinMaxScaler;
pub use sequence::{SequenceSet, make_sequences};
pub use train::{Trainer, TrainingHistory};
