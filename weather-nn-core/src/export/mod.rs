//! Post-training int8 quantization and artifact export.
//!
//! Activation ranges are calibrated by running sample windows through the
//! float model one at a time. Every layer then gets an integer kernel; a
//! layer without one aborts the export.

pub mod artifact;
pub mod header;
pub mod quantize;

use std::{fs, path::Path};

use anyhow::{Context, Result};
use ndarray::{Array1, Array2, ArrayView3, Axis, s};
use tracing::{debug, info};

pub use artifact::{QuantLayer, QuantLinear, QuantizedModel};
pub use quantize::QuantParams;

use crate::{
    error::{ArtifactError, ExportError},
    model::{Activation, ConvClassifier, LayerKind},
    scaler::MinMaxScaler,
    sequence::SequenceSet,
};
use quantize::{RangeObserver, SOFTMAX_OUTPUT, quantize_bias, quantize_weights};

/// Observed float ranges of every quantized tensor.
#[derive(Debug, Clone, Default)]
pub struct Calibration {
    pub samples: usize,
    pub input: RangeObserver,
    pub conv1: RangeObserver,
    pub conv2: RangeObserver,
    pub pooled: RangeObserver,
    pub hidden: RangeObserver,
    pub logits: RangeObserver,
}

impl Calibration {
    fn observers(&self) -> [(&'static str, &RangeObserver); 6] {
        [
            ("input", &self.input),
            ("conv1d_1", &self.conv1),
            ("conv1d_2", &self.conv2),
            ("global_average_pool1d", &self.pooled),
            ("dense_1", &self.hidden),
            ("dense_2", &self.logits),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct ExportReport {
    pub bytes: usize,
    pub size_kb: f64,
    pub calibration_samples: usize,
}

/// Fail on any layer that has no int8 kernel.
pub fn check_graph(graph: &[LayerKind]) -> Result<(), ExportError> {
    let last = graph.len().saturating_sub(1);
    for (i, layer) in graph.iter().enumerate() {
        match layer {
            LayerKind::Conv1d {
                activation: Activation::Tanh,
                ..
            }
            | LayerKind::Dense {
                activation: Some(Activation::Tanh),
                ..
            } => {
                return Err(ExportError::UnsupportedOp {
                    op: layer.name(),
                    reason: "tanh has no int8 kernel",
                });
            }
            LayerKind::Softmax if i != last => {
                return Err(ExportError::UnsupportedOp {
                    op: layer.name(),
                    reason: "softmax is only supported as the output layer",
                });
            }
            _ => {}
        }
    }
    Ok(())
}

/// Run up to `limit` windows, one per pass, and record activation ranges.
pub fn calibrate(
    model: &ConvClassifier,
    windows: ArrayView3<'_, f32>,
    limit: usize,
) -> Result<Calibration, ExportError> {
    let count = windows.len_of(Axis(0)).min(limit);
    if count == 0 {
        return Err(ExportError::NoCalibrationData);
    }

    let mut calibration = Calibration {
        samples: count,
        ..Calibration::default()
    };
    for i in 0..count {
        let trace = model.forward_trace(windows.slice(s![i..i + 1, .., ..]));
        calibration.input.observe(&trace.input);
        calibration.conv1.observe(&trace.conv1);
        calibration.conv2.observe(&trace.conv2);
        calibration.pooled.observe(&trace.pooled);
        calibration.hidden.observe(&trace.hidden);
        calibration.logits.observe(&trace.logits);
    }

    for (name, observer) in calibration.observers() {
        if !observer.is_finite() {
            return Err(ExportError::NonFiniteRange(name.to_string()));
        }
        debug!(tensor = name, min = observer.min, max = observer.max, "calibrated range");
    }
    Ok(calibration)
}

fn quantize_linear(
    weights: &Array2<f32>,
    bias: &Array1<f32>,
    activation: Option<Activation>,
    input: QuantParams,
    output: QuantParams,
) -> QuantLinear {
    let (quantized, weight_scales) = quantize_weights(weights);
    QuantLinear {
        inputs: weights.nrows(),
        outputs: weights.ncols(),
        bias: quantize_bias(&bias.to_vec(), input.scale, &weight_scales),
        weights: quantized,
        weight_scales,
        output,
        relu: activation == Some(Activation::Relu),
    }
}

/// Build the integer model from the float one.
///
/// `windows` supplies calibration data (the first `limit` are used) and
/// `scaler` is embedded so raw readings can be scaled on device.
pub fn quantize_model(
    model: &ConvClassifier,
    windows: ArrayView3<'_, f32>,
    limit: usize,
    scaler: &MinMaxScaler,
) -> Result<QuantizedModel, ExportError> {
    check_graph(&model.graph())?;
    let calibration = calibrate(model, windows, limit)?;

    let input = calibration.input.params();
    let conv1_out = calibration.conv1.params();
    let conv2_out = calibration.conv2.params();
    let pooled = calibration.pooled.params();
    let hidden = calibration.hidden.params();
    let logits = calibration.logits.params();

    let layers = vec![
        QuantLayer::Conv1d {
            kernel_size: model.conv1.kernel_size,
            linear: quantize_linear(
                &model.conv1.weights,
                &model.conv1.bias,
                Some(model.conv1.activation),
                input,
                conv1_out,
            ),
        },
        QuantLayer::Conv1d {
            kernel_size: model.conv2.kernel_size,
            linear: quantize_linear(
                &model.conv2.weights,
                &model.conv2.bias,
                Some(model.conv2.activation),
                conv1_out,
                conv2_out,
            ),
        },
        QuantLayer::GlobalAveragePool1d { output: pooled },
        // Dropout is the identity at inference time.
        QuantLayer::Dense(quantize_linear(
            &model.hidden.weights,
            &model.hidden.bias,
            model.hidden.activation,
            pooled,
            hidden,
        )),
        QuantLayer::Dense(quantize_linear(
            &model.output.weights,
            &model.output.bias,
            model.output.activation,
            hidden,
            logits,
        )),
        QuantLayer::Softmax {
            output: SOFTMAX_OUTPUT,
        },
    ];

    let to_vec = |v: &Option<Array1<f32>>| v.as_ref().map(|a| a.to_vec()).unwrap_or_default();
    Ok(QuantizedModel {
        window_size: model.window_size,
        num_features: model.num_features,
        num_classes: model.num_classes,
        input,
        output: SOFTMAX_OUTPUT,
        feature_min: to_vec(&scaler.min),
        feature_max: to_vec(&scaler.max),
        layers,
    })
}

/// Quantize `model` and write the artifact to `path`.
pub fn export_model(
    model: &ConvClassifier,
    windows: ArrayView3<'_, f32>,
    limit: usize,
    scaler: &MinMaxScaler,
    path: &Path,
) -> Result<(QuantizedModel, ExportReport)> {
    let quantized =
        quantize_model(model, windows, limit, scaler).context("Failed to quantize model")?;
    let bytes = quantized
        .to_bytes()
        .context("Failed to encode model artifact")?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
    }
    fs::write(path, &bytes)
        .with_context(|| format!("Failed to write model file: {}", path.display()))?;

    let report = ExportReport {
        bytes: bytes.len(),
        size_kb: bytes.len() as f64 / 1024.0,
        calibration_samples: windows.len_of(Axis(0)).min(limit),
    };
    info!(
        path = %path.display(),
        size_kb = %format!("{:.1}", report.size_kb),
        "model saved"
    );
    Ok((quantized, report))
}

/// Write the artifact as a C array.
pub fn write_c_header(bytes: &[u8], path: &Path) -> Result<()> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let text = header::c_header(bytes, &header::symbol_name(&stem))
        .context("Failed to render C header")?;
    fs::write(path, text)
        .with_context(|| format!("Failed to write C header: {}", path.display()))?;
    info!(path = %path.display(), "C header written");
    Ok(())
}

/// Fraction of windows where the integer model picks the same class as the
/// float model.
pub fn agreement(
    model: &ConvClassifier,
    quantized: &QuantizedModel,
    set: &SequenceSet,
) -> Result<f32, ArtifactError> {
    if set.is_empty() {
        return Ok(1.0);
    }
    let float_predictions = model.predict(set.inputs.view());
    let mut matches = 0usize;
    for (window, &expected) in set.inputs.outer_iter().zip(&float_predictions) {
        let flat: Vec<f32> = window.iter().copied().collect();
        if quantized.predict(&flat)? == expected {
            matches += 1;
        }
    }
    Ok(matches as f32 / set.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ModelConfig, TrainConfig},
        train::{Trainer, train_validation_split},
    };
    use ndarray::Array3;

    fn toy_set(n: usize) -> SequenceSet {
        let inputs = Array3::from_shape_fn((n, 4, 3), |(i, t, f)| {
            let class = i % 3;
            match f {
                0 => 0.1 + 0.4 * class as f32 + 0.02 * t as f32,
                1 => 1.0 - 0.3 * class as f32,
                _ => 0.5,
            }
        });
        let labels = (0..n).map(|i| i % 3).collect();
        SequenceSet { inputs, labels }
    }

    fn small_config(activation: Activation) -> ModelConfig {
        ModelConfig {
            conv1_filters: 8,
            conv2_filters: 8,
            dense_units: 8,
            dropout: 0.1,
            activation,
            ..ModelConfig::default()
        }
    }

    fn fitted_scaler() -> MinMaxScaler {
        let mut scaler = MinMaxScaler::new();
        let data = Array2::from_shape_vec((2, 3), vec![0.0, 900.0, -5.0, 10.0, 1100.0, 35.0])
            .expect("shape");
        scaler.fit(data.view()).expect("fit");
        scaler
    }

    fn trained_model() -> (ConvClassifier, SequenceSet, SequenceSet) {
        let set = toy_set(60);
        let (train, val) = train_validation_split(&set, 0.2, 42).expect("split");
        let mut model = ConvClassifier::new(&small_config(Activation::Relu), 4, 3, 6, 42);
        let config = TrainConfig {
            epochs: 60,
            batch_size: 8,
            patience: 10,
            ..TrainConfig::default()
        };
        Trainer::new(config, 0.01)
            .fit(&mut model, &train, &val)
            .expect("fit");
        (model, train, val)
    }

    #[test]
    fn default_graph_is_exportable() {
        let model = ConvClassifier::new(&ModelConfig::default(), 4, 7, 6, 42);
        assert!(check_graph(&model.graph()).is_ok());
    }

    #[test]
    fn tanh_is_rejected() {
        let model = ConvClassifier::new(&small_config(Activation::Tanh), 4, 3, 6, 42);
        let set = toy_set(5);
        let err = quantize_model(&model, set.inputs.view(), 100, &MinMaxScaler::new()).unwrap_err();
        assert_eq!(
            err,
            ExportError::UnsupportedOp {
                op: "conv1d/tanh".to_string(),
                reason: "tanh has no int8 kernel",
            }
        );
    }

    #[test]
    fn softmax_must_be_last() {
        let graph = [LayerKind::Softmax, LayerKind::GlobalAveragePool1d];
        assert!(matches!(
            check_graph(&graph),
            Err(ExportError::UnsupportedOp { .. })
        ));
    }

    #[test]
    fn calibration_uses_at_most_limit_samples() {
        let model = ConvClassifier::new(&small_config(Activation::Relu), 4, 3, 6, 1);
        let set = toy_set(30);
        let calibration = calibrate(&model, set.inputs.view(), 10).expect("calibrate");
        assert_eq!(calibration.samples, 10);
        assert!(calibration.conv1.min >= 0.0);

        let empty = toy_set(0);
        assert_eq!(
            calibrate(&model, empty.inputs.view(), 10).unwrap_err(),
            ExportError::NoCalibrationData
        );
    }

    #[test]
    fn quantized_model_has_int8_io_and_scaler() {
        let model = ConvClassifier::new(&small_config(Activation::Relu), 4, 3, 6, 3);
        let set = toy_set(12);
        let quantized =
            quantize_model(&model, set.inputs.view(), 100, &fitted_scaler()).expect("quantize");

        assert_eq!(quantized.output, SOFTMAX_OUTPUT);
        assert_eq!(quantized.layers.len(), 6);
        assert_eq!(quantized.feature_min, vec![0.0, 900.0, -5.0]);
        assert_eq!(quantized.feature_max, vec![10.0, 1100.0, 35.0]);
        let out = quantized
            .invoke(&vec![0i8; quantized.input_len()])
            .expect("invoke");
        assert_eq!(out.len(), 6);
    }

    #[test]
    fn int8_model_agrees_with_float_model() {
        let (model, train, val) = trained_model();
        let quantized =
            quantize_model(&model, train.inputs.view(), 100, &fitted_scaler()).expect("quantize");

        let score = agreement(&model, &quantized, &val).expect("agreement");
        assert!(score >= 0.9, "agreement {score}");
    }

    #[test]
    fn export_writes_parseable_artifact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out").join("model.wxq");
        let model = ConvClassifier::new(&small_config(Activation::Relu), 4, 3, 6, 7);
        let set = toy_set(8);

        let (quantized, report) =
            export_model(&model, set.inputs.view(), 100, &fitted_scaler(), &path).expect("export");

        let bytes = fs::read(&path).expect("read artifact");
        assert_eq!(bytes.len(), report.bytes);
        assert_eq!(report.calibration_samples, 8);
        assert_eq!(QuantizedModel::from_bytes(&bytes).expect("parse"), quantized);

        let header_path = dir.path().join("model_data.h");
        write_c_header(&bytes, &header_path).expect("header");
        let text = fs::read_to_string(header_path).expect("read header");
        assert!(text.contains("const unsigned char model_data[]"));
    }
}
