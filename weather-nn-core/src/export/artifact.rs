//! Binary artifact: layout, parsing, and integer-only reference inference.
//!
//! A short fixed header followed by the model encoded with bincode:
//!
//! ```text
//! magic "WXQ8" | version u16 | QuantizedModel
//! ```
//!
//! All integers are fixed-width little-endian, including `usize` fields
//! which are written as u64.

use bincode::error::DecodeError;
use serde::{Deserialize, Serialize};

use super::quantize::{QuantParams, multiply_by_quantized_multiplier, quantize_multiplier};
use crate::error::ArtifactError;

pub const MAGIC: &[u8; 4] = b"WXQ8";
pub const VERSION: u16 = 2;

const HEADER_LEN: usize = MAGIC.len() + 2;
/// Largest body the decoder will allocate for.
const BODY_LIMIT: usize = 64 * 1024 * 1024;

fn body_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
        .with_limit::<BODY_LIMIT>()
}

/// int8 matrix-vector kernel shared by convolution and dense layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantLinear {
    pub inputs: usize,
    pub outputs: usize,
    /// `[output][input]`
    pub weights: Vec<i8>,
    pub weight_scales: Vec<f32>,
    pub bias: Vec<i32>,
    pub output: QuantParams,
    pub relu: bool,
}

impl QuantLinear {
    fn check_buffers(&self) -> Result<(), String> {
        if self.inputs.checked_mul(self.outputs) != Some(self.weights.len()) {
            return Err(format!(
                "{} weights for {}x{}",
                self.weights.len(),
                self.inputs,
                self.outputs
            ));
        }
        if self.weight_scales.len() != self.outputs || self.bias.len() != self.outputs {
            return Err(format!("per-channel data does not cover {} outputs", self.outputs));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QuantLayer {
    /// Same-padded convolution; `linear.inputs == kernel_size * in_channels`.
    Conv1d {
        kernel_size: usize,
        linear: QuantLinear,
    },
    GlobalAveragePool1d {
        output: QuantParams,
    },
    Dense(QuantLinear),
    Softmax {
        output: QuantParams,
    },
}

impl QuantLayer {
    pub fn name(&self) -> &'static str {
        match self {
            QuantLayer::Conv1d { .. } => "conv1d",
            QuantLayer::GlobalAveragePool1d { .. } => "global_average_pool1d",
            QuantLayer::Dense(_) => "dense",
            QuantLayer::Softmax { .. } => "softmax",
        }
    }

    pub fn output_params(&self) -> QuantParams {
        match self {
            QuantLayer::Conv1d { linear, .. } | QuantLayer::Dense(linear) => linear.output,
            QuantLayer::GlobalAveragePool1d { output } | QuantLayer::Softmax { output } => *output,
        }
    }
}

/// Fully quantized classifier with int8 input and output tensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedModel {
    pub window_size: usize,
    pub num_features: usize,
    pub num_classes: usize,
    pub input: QuantParams,
    pub output: QuantParams,
    /// Scaler statistics so raw sensor values can be scaled on device.
    pub feature_min: Vec<f32>,
    pub feature_max: Vec<f32>,
    pub layers: Vec<QuantLayer>,
}

impl QuantizedModel {
    pub fn input_len(&self) -> usize {
        self.window_size.saturating_mul(self.num_features)
    }

    /// Quantize an already scaled window, row-major `[step][feature]`.
    pub fn quantize_input(&self, window: &[f32]) -> Vec<i8> {
        window.iter().map(|&x| self.input.quantize(x)).collect()
    }

    pub fn dequantize_output(&self, output: &[i8]) -> Vec<f32> {
        output.iter().map(|&q| self.output.dequantize(q)).collect()
    }

    /// Run integer inference on one quantized window.
    pub fn invoke(&self, input: &[i8]) -> Result<Vec<i8>, ArtifactError> {
        if input.len() != self.input_len() {
            return Err(ArtifactError::InputShape {
                expected: self.input_len(),
                actual: input.len(),
            });
        }

        let steps = self.window_size;
        let mut current = input.to_vec();
        let mut params = self.input;
        for layer in &self.layers {
            current = match layer {
                QuantLayer::Conv1d {
                    kernel_size,
                    linear,
                } => conv1d(&current, params, steps, *kernel_size, linear),
                QuantLayer::GlobalAveragePool1d { output } => {
                    average_pool(&current, params, steps, *output)
                }
                QuantLayer::Dense(linear) => linear_forward(&current, params, linear),
                QuantLayer::Softmax { output } => softmax(&current, params, *output),
            };
            params = layer.output_params();
        }
        Ok(current)
    }

    /// Argmax class of an already scaled float window.
    pub fn predict(&self, window: &[f32]) -> Result<usize, ArtifactError> {
        let output = self.invoke(&self.quantize_input(window))?;
        Ok(output
            .iter()
            .enumerate()
            .max_by_key(|&(i, &q)| (q, std::cmp::Reverse(i)))
            .map(|(i, _)| i)
            .unwrap_or(0))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ArtifactError> {
        let body = bincode::serde::encode_to_vec(self, body_config())
            .map_err(|e| ArtifactError::Encode(e.to_string()))?;
        let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ArtifactError> {
        let magic = bytes
            .get(..MAGIC.len())
            .ok_or(ArtifactError::Truncated(bytes.len()))?;
        if magic != MAGIC {
            return Err(ArtifactError::BadMagic);
        }
        let version = bytes
            .get(MAGIC.len()..HEADER_LEN)
            .and_then(|b| <[u8; 2]>::try_from(b).ok())
            .map(u16::from_le_bytes)
            .ok_or(ArtifactError::Truncated(bytes.len()))?;
        if version != VERSION {
            return Err(ArtifactError::UnsupportedVersion(version));
        }

        let (model, read): (Self, usize) =
            bincode::serde::decode_from_slice(&bytes[HEADER_LEN..], body_config()).map_err(
                |e| match e {
                    DecodeError::UnexpectedEnd { .. } => ArtifactError::Truncated(bytes.len()),
                    other => ArtifactError::Decode(other.to_string()),
                },
            )?;
        let trailing = bytes.len() - HEADER_LEN - read;
        if trailing > 0 {
            return Err(ArtifactError::Decode(format!("{trailing} trailing bytes")));
        }
        model.check_shapes()?;
        Ok(model)
    }

    /// Each layer must consume what the previous one produces.
    fn check_shapes(&self) -> Result<(), ArtifactError> {
        let malformed = |index: usize, reason: String| ArtifactError::Malformed { index, reason };
        if self.window_size == 0 {
            return Err(malformed(0, "window size is zero".to_string()));
        }
        if self.feature_min.len() != self.num_features
            || self.feature_max.len() != self.num_features
        {
            return Err(malformed(
                0,
                format!("scaler statistics do not cover {} features", self.num_features),
            ));
        }

        let mut width = self.num_features;
        let mut pooled = false;
        for (index, layer) in self.layers.iter().enumerate() {
            match layer {
                QuantLayer::Conv1d {
                    kernel_size,
                    linear,
                } => {
                    let expected = kernel_size.checked_mul(width);
                    if pooled || *kernel_size == 0 || expected != Some(linear.inputs) {
                        return Err(malformed(
                            index,
                            format!("conv1d with kernel {kernel_size} over {width} channels"),
                        ));
                    }
                    linear.check_buffers().map_err(|reason| malformed(index, reason))?;
                    width = linear.outputs;
                }
                QuantLayer::GlobalAveragePool1d { .. } => {
                    if pooled {
                        return Err(malformed(index, "pooling twice".to_string()));
                    }
                    pooled = true;
                }
                QuantLayer::Dense(linear) => {
                    if !pooled || linear.inputs != width {
                        return Err(malformed(index, format!("dense expects {width} inputs")));
                    }
                    linear.check_buffers().map_err(|reason| malformed(index, reason))?;
                    width = linear.outputs;
                }
                QuantLayer::Softmax { .. } => {
                    if !pooled {
                        return Err(malformed(index, "softmax before pooling".to_string()));
                    }
                }
            }
        }
        if !pooled || width != self.num_classes {
            return Err(malformed(
                self.layers.len(),
                format!("output width {width} does not match {} classes", self.num_classes),
            ));
        }
        Ok(())
    }
}

/// `out[o] = requant(bias[o] + Σ (x[i] - x_zp) * w[o][i])` for one input row.
fn dot_row(row: &[i32], linear: &QuantLinear, multipliers: &[(i32, i32)], out: &mut Vec<i8>) {
    for o in 0..linear.outputs {
        let weights = &linear.weights[o * linear.inputs..(o + 1) * linear.inputs];
        let acc = row
            .iter()
            .zip(weights)
            .fold(i64::from(linear.bias[o]), |acc, (&x, &w)| {
                acc + i64::from(x) * i64::from(w)
            });
        let acc = acc.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
        let (m, shift) = multipliers[o];
        let mut q = multiply_by_quantized_multiplier(acc, m, shift) + linear.output.zero_point;
        if linear.relu {
            q = q.max(linear.output.zero_point);
        }
        out.push(q.clamp(-128, 127) as i8);
    }
}

fn multipliers(input: QuantParams, linear: &QuantLinear) -> Vec<(i32, i32)> {
    linear
        .weight_scales
        .iter()
        .map(|&ws| {
            quantize_multiplier(
                f64::from(input.scale) * f64::from(ws) / f64::from(linear.output.scale),
            )
        })
        .collect()
}

fn linear_forward(input: &[i8], params: QuantParams, linear: &QuantLinear) -> Vec<i8> {
    let row: Vec<i32> = input
        .iter()
        .map(|&q| i32::from(q) - params.zero_point)
        .collect();
    let mut out = Vec::with_capacity(linear.outputs);
    dot_row(&row, linear, &multipliers(params, linear), &mut out);
    out
}

fn conv1d(
    input: &[i8],
    params: QuantParams,
    steps: usize,
    kernel_size: usize,
    linear: &QuantLinear,
) -> Vec<i8> {
    let channels = linear.inputs / kernel_size;
    let pad = (kernel_size - 1) / 2;
    let mults = multipliers(params, linear);
    let mut out = Vec::with_capacity(steps * linear.outputs);
    // Padding taps are zero after subtracting the zero point.
    let mut patch = vec![0i32; linear.inputs];
    for t in 0..steps {
        patch.iter_mut().for_each(|v| *v = 0);
        for k in 0..kernel_size {
            let src = t as isize + k as isize - pad as isize;
            if src < 0 || src >= steps as isize {
                continue;
            }
            let src = src as usize;
            for c in 0..channels {
                patch[k * channels + c] = i32::from(input[src * channels + c]) - params.zero_point;
            }
        }
        dot_row(&patch, linear, &mults, &mut out);
    }
    out
}

fn average_pool(input: &[i8], params: QuantParams, steps: usize, output: QuantParams) -> Vec<i8> {
    let channels = input.len() / steps;
    let (m, shift) = quantize_multiplier(
        f64::from(params.scale) / (f64::from(output.scale) * steps as f64),
    );
    (0..channels)
        .map(|c| {
            let sum: i32 = (0..steps)
                .map(|t| i32::from(input[t * channels + c]) - params.zero_point)
                .sum();
            (multiply_by_quantized_multiplier(sum, m, shift) + output.zero_point).clamp(-128, 127)
                as i8
        })
        .collect()
}

/// Softmax over dequantized logits, requantized to the fixed output scale.
fn softmax(input: &[i8], params: QuantParams, output: QuantParams) -> Vec<i8> {
    let logits: Vec<f32> = input.iter().map(|&q| params.dequantize(q)).collect();
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|&e| output.quantize(e / sum)).collect()
}
