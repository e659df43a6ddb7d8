//! int8 quantization primitives.
//!
//! Activations use asymmetric per-tensor parameters; weights use symmetric
//! per-output-channel scales; biases are int32 at `input_scale * weight_scale`.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// `real = scale * (q - zero_point)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
}

/// Fixed output encoding for softmax probabilities.
pub const SOFTMAX_OUTPUT: QuantParams = QuantParams {
    scale: 1.0 / 256.0,
    zero_point: -128,
};

/// Smallest range used for a tensor that only ever held zeros.
const MIN_RANGE: f32 = 1e-6;

impl QuantParams {
    /// Parameters covering `[min, max]`, widened to contain zero so that
    /// zero padding is exact.
    pub fn from_range(min: f32, max: f32) -> Self {
        let min = min.min(0.0);
        let max = max.max(0.0);
        let range = (max - min).max(MIN_RANGE);
        let scale = range / 255.0;
        let zero_point = (-128.0 - min / scale).round().clamp(-128.0, 127.0) as i32;
        Self { scale, zero_point }
    }

    pub fn quantize(&self, x: f32) -> i8 {
        ((x / self.scale).round() as i32 + self.zero_point).clamp(-128, 127) as i8
    }

    pub fn dequantize(&self, q: i8) -> f32 {
        self.scale * (i32::from(q) - self.zero_point) as f32
    }
}

/// Split a positive real multiplier into a Q31 mantissa and a power-of-two
/// exponent: `real ≈ multiplier * 2^(shift - 31)`.
pub fn quantize_multiplier(real: f64) -> (i32, i32) {
    if real <= 0.0 || !real.is_finite() {
        return (0, 0);
    }
    let mut shift = real.log2().floor() as i32 + 1;
    let mut mantissa = real / 2f64.powi(shift);
    // Guard against log2 rounding putting the mantissa outside [0.5, 1).
    while mantissa >= 1.0 {
        mantissa /= 2.0;
        shift += 1;
    }
    while mantissa < 0.5 {
        mantissa *= 2.0;
        shift -= 1;
    }
    let mut fixed = (mantissa * (1i64 << 31) as f64).round() as i64;
    if fixed == 1i64 << 31 {
        fixed /= 2;
        shift += 1;
    }
    if shift < -31 {
        return (0, 0);
    }
    (fixed as i32, shift)
}

/// `round(x * multiplier * 2^(shift - 31))`, saturated to i32.
pub fn multiply_by_quantized_multiplier(x: i32, multiplier: i32, shift: i32) -> i32 {
    let product = i64::from(x) * i64::from(multiplier);
    let right = 31 - shift;
    let value = if right <= 0 {
        product.saturating_mul(1i64 << (-right).min(62))
    } else if right >= 63 {
        0
    } else {
        (product + (1i64 << (right - 1))) >> right
    };
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// Symmetric per-output-channel weights.
///
/// `weights` is (inputs, outputs) as stored by the float layers; the result
/// is laid out output-major (`[output][input]`) for sequential reads on
/// device.
pub fn quantize_weights(weights: &Array2<f32>) -> (Vec<i8>, Vec<f32>) {
    let (inputs, outputs) = weights.dim();
    let mut scales = Vec::with_capacity(outputs);
    let mut quantized = Vec::with_capacity(inputs * outputs);
    for column in weights.columns() {
        let max_abs = column.fold(0.0f32, |acc, &w| acc.max(w.abs()));
        let scale = if max_abs > 0.0 { max_abs / 127.0 } else { 1.0 };
        scales.push(scale);
        quantized.extend(
            column
                .iter()
                .map(|&w| (w / scale).round().clamp(-127.0, 127.0) as i8),
        );
    }
    (quantized, scales)
}

pub fn quantize_bias(bias: &[f32], input_scale: f32, weight_scales: &[f32]) -> Vec<i32> {
    bias.iter()
        .zip(weight_scales)
        .map(|(&b, &ws)| {
            let scale = f64::from(input_scale) * f64::from(ws);
            (f64::from(b) / scale)
                .round()
                .clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32
        })
        .collect()
}

/// Running min/max of a tensor during calibration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeObserver {
    pub min: f32,
    pub max: f32,
}

impl Default for RangeObserver {
    fn default() -> Self {
        Self {
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
        }
    }
}

impl RangeObserver {
    pub fn observe<'a, I: IntoIterator<Item = &'a f32>>(&mut self, values: I) {
        for &v in values {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
    }

    pub fn is_finite(&self) -> bool {
        self.min.is_finite() && self.max.is_finite()
    }

    pub fn params(&self) -> QuantParams {
        QuantParams::from_range(self.min, self.max)
    }
}
