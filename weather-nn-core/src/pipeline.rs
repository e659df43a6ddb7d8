//! End-to-end run: load, scale, window, split, train, export.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use ndarray::s;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    category::{CodeMapping, WeatherCategory},
    config::PipelineConfig,
    curves::write_history_json,
    dataset::{Dataset, load_dataset},
    error::TrainError,
    export::{self, ExportReport, QuantizedModel},
    model::ConvClassifier,
    scaler::MinMaxScaler,
    sequence::{SequenceSet, make_sequences},
    train::{
        Evaluation, Trainer, TrainingHistory, chronological_split_point, evaluate,
        train_validation_split,
    },
};

/// Scaled, windowed and split data plus the scaler that produced it.
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub dataset: Dataset,
    pub scaler: MinMaxScaler,
    pub train: SequenceSet,
    pub validation: SequenceSet,
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub rows: usize,
    pub dropped_rows: usize,
    pub feature_names: Vec<String>,
    pub mapping: CodeMapping,
    pub train_samples: usize,
    pub validation_samples: usize,
    pub num_parameters: usize,
    pub history: TrainingHistory,
    pub evaluation: Evaluation,
    pub model_path: PathBuf,
    pub export: ExportReport,
    /// Share of validation windows where int8 and float predictions match.
    pub agreement: f32,
    pub labels_path: Option<PathBuf>,
    pub header_path: Option<PathBuf>,
}

/// Contents of `<model>.labels.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelFile {
    /// Category name per output index.
    pub labels: Vec<String>,
    /// Observed WMO code to category name.
    pub codes: BTreeMap<i64, String>,
}

impl LabelFile {
    pub fn new(mapping: &CodeMapping) -> Self {
        Self {
            labels: WeatherCategory::all()
                .iter()
                .map(|c| c.as_str().to_string())
                .collect(),
            codes: mapping
                .iter()
                .map(|(code, c)| (code, c.as_str().to_string()))
                .collect(),
        }
    }

    /// `model.wxq` -> `model.labels.json`
    pub fn path_for(model_path: &Path) -> PathBuf {
        model_path.with_extension("labels.json")
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize labels")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write labels file: {}", path.display()))
    }
}

/// Scale, window and split a loaded dataset.
///
/// By default the scaler sees every row before the shuffled split. With
/// `strict_split` rows are split chronologically and the scaler is fitted
/// on the training rows only.
pub fn prepare(dataset: Dataset, config: &PipelineConfig) -> Result<PreparedData> {
    let window = config.data.window_size;
    let split = config.train.validation_split;
    let mut scaler = MinMaxScaler::new();

    let (train, validation) = if config.train.strict_split {
        let point = chronological_split_point(dataset.len(), split);
        let train_rows = dataset.features.slice(s![..point, ..]);
        let val_rows = dataset.features.slice(s![point.., ..]);

        scaler.fit(train_rows).context("Failed to fit scaler")?;
        let train_scaled = scaler.transform(train_rows)?;
        let val_scaled = scaler.transform(val_rows)?;
        let train = make_sequences(train_scaled.view(), &dataset.labels[..point], window)?;
        let validation = make_sequences(val_scaled.view(), &dataset.labels[point..], window)?;
        if train.is_empty() || validation.is_empty() {
            return Err(TrainError::NotEnoughSamples {
                total: train.len() + validation.len(),
                train: train.len(),
                validation: validation.len(),
            }
            .into());
        }
        (train, validation)
    } else {
        let scaled = scaler
            .fit_transform(dataset.features.view())
            .context("Failed to fit scaler")?;
        let sequences = make_sequences(scaled.view(), &dataset.labels, window)?;
        train_validation_split(&sequences, split, config.train.seed)?
    };

    info!(
        train = train.len(),
        validation = validation.len(),
        strict = config.train.strict_split,
        "sequences ready"
    );
    Ok(PreparedData {
        dataset,
        scaler,
        train,
        validation,
    })
}

/// Train a fresh model on prepared data.
pub fn train_model(
    data: &PreparedData,
    config: &PipelineConfig,
) -> Result<(ConvClassifier, TrainingHistory)> {
    let mut model = ConvClassifier::new(
        &config.model,
        config.data.window_size,
        data.dataset.num_features(),
        data.dataset.num_classes,
        config.train.seed,
    );
    info!(parameters = model.num_parameters(), "model built");

    let history = Trainer::new(config.train.clone(), config.model.learning_rate)
        .fit(&mut model, &data.train, &data.validation)
        .context("Training failed")?;
    Ok((model, history))
}

/// Full run driven by `config`.
pub fn run(config: &PipelineConfig) -> Result<PipelineReport> {
    config.validate()?;

    let dataset = load_dataset(&config.data.path)
        .with_context(|| format!("Failed to load {}", config.data.path.display()))?;
    if dataset.dropped_rows > 0 {
        warn!(dropped = dataset.dropped_rows, "rows with missing values were dropped");
    }
    info!("weather code mapping:\n{}", dataset.mapping.render_table());
    let rows = dataset.len();
    let data = prepare(dataset, config)?;

    let (model, history) = train_model(&data, config)?;
    let evaluation = evaluate(&model, &data.validation, config.train.batch_size);
    info!(
        val_loss = evaluation.loss,
        val_accuracy = evaluation.accuracy,
        "final validation"
    );

    let export_cfg = &config.export;
    let (quantized, export_report) = export::export_model(
        &model,
        data.train.inputs.view(),
        export_cfg.calibration_samples,
        &data.scaler,
        &export_cfg.model_path,
    )?;
    let agreement = export::agreement(&model, &quantized, &data.validation)
        .context("Failed to run quantized model")?;
    info!(agreement, "int8 vs float agreement on validation set");

    let labels_path = if export_cfg.write_labels {
        let path = LabelFile::path_for(&export_cfg.model_path);
        LabelFile::new(&data.dataset.mapping).write(&path)?;
        Some(path)
    } else {
        None
    };

    let header_path = match &export_cfg.c_header_path {
        Some(path) => {
            write_header(&quantized, path)?;
            Some(path.clone())
        }
        None => None,
    };

    if let Some(path) = &config.train.history_path {
        write_history_json(&history, path)?;
    }

    Ok(PipelineReport {
        rows,
        dropped_rows: data.dataset.dropped_rows,
        feature_names: data.dataset.feature_names.clone(),
        mapping: data.dataset.mapping.clone(),
        train_samples: data.train.len(),
        validation_samples: data.validation.len(),
        num_parameters: model.num_parameters(),
        history,
        evaluation,
        model_path: export_cfg.model_path.clone(),
        export: export_report,
        agreement,
        labels_path,
        header_path,
    })
}

fn write_header(quantized: &QuantizedModel, path: &Path) -> Result<()> {
    let bytes = quantized
        .to_bytes()
        .context("Failed to encode model artifact")?;
    export::write_c_header(&bytes, path)
}
