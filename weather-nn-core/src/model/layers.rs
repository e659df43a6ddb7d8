//! Convolution and dense layers with explicit backward passes.
//!
//! Time-series activations are kept as 2-D matrices with one row per
//! (sample, step), ordered sample-major, so a convolution becomes a single
//! matrix product over the unfolded patches.

use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use ndarray_rand::RandomExt;
use ndarray_rand::rand_distr::Uniform;
use rand::Rng;

use super::Activation;

/// Gradients for one weight matrix and its bias.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerGrads {
    pub weights: Array2<f32>,
    pub bias: Array1<f32>,
}

impl LayerGrads {
    pub fn zeros_like(weights: &Array2<f32>, bias: &Array1<f32>) -> Self {
        Self {
            weights: Array2::zeros(weights.dim()),
            bias: Array1::zeros(bias.len()),
        }
    }
}

/// Glorot/Xavier uniform initialization.
fn glorot<R: Rng + ?Sized>(
    shape: (usize, usize),
    fan_in: usize,
    fan_out: usize,
    rng: &mut R,
) -> Array2<f32> {
    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
    Array2::random_using(shape, Uniform::new(-limit, limit), rng)
}

/// Same-padded 1-D convolution over the step axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Conv1d {
    /// (kernel_size * in_channels, filters); row `k * in_channels + c`.
    pub weights: Array2<f32>,
    pub bias: Array1<f32>,
    pub kernel_size: usize,
    pub in_channels: usize,
    pub activation: Activation,
}

impl Conv1d {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        filters: usize,
        kernel_size: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        let weights = glorot(
            (kernel_size * in_channels, filters),
            kernel_size * in_channels,
            kernel_size * filters,
            rng,
        );
        Self {
            weights,
            bias: Array1::zeros(filters),
            kernel_size,
            in_channels,
            activation,
        }
    }

    pub fn filters(&self) -> usize {
        self.weights.ncols()
    }

    /// Left padding for "same" output length; the remainder goes right.
    pub fn pad_left(&self) -> usize {
        (self.kernel_size - 1) / 2
    }

    /// Unfold `input` (rows = samples * steps) into one patch per row.
    /// Out-of-range taps stay zero.
    pub fn im2col(&self, input: ArrayView2<'_, f32>, steps: usize) -> Array2<f32> {
        let c = self.in_channels;
        let pad = self.pad_left() as isize;
        let mut patches = Array2::zeros((input.nrows(), self.kernel_size * c));
        for (row, mut patch) in patches.outer_iter_mut().enumerate() {
            let (sample, t) = (row / steps, row % steps);
            for k in 0..self.kernel_size {
                let src = t as isize + k as isize - pad;
                if src < 0 || src >= steps as isize {
                    continue;
                }
                let src_row = sample * steps + src as usize;
                patch
                    .slice_mut(s![k * c..(k + 1) * c])
                    .assign(&input.row(src_row));
            }
        }
        patches
    }

    /// Returns `(output, patches)`; patches are kept for the backward pass.
    pub fn forward(&self, input: ArrayView2<'_, f32>, steps: usize) -> (Array2<f32>, Array2<f32>) {
        let patches = self.im2col(input, steps);
        let mut out = patches.dot(&self.weights) + &self.bias;
        self.activation.apply(&mut out);
        (out, patches)
    }

    /// Returns `(grad_input, grads)`.
    pub fn backward(
        &self,
        patches: &Array2<f32>,
        output: &Array2<f32>,
        grad_output: &Array2<f32>,
        steps: usize,
    ) -> (Array2<f32>, LayerGrads) {
        let activation = self.activation;
        let mut delta = grad_output.clone();
        delta.zip_mut_with(output, |d, &y| *d *= activation.derivative_from_output(y));

        let grads = LayerGrads {
            weights: patches.t().dot(&delta),
            bias: delta.sum_axis(Axis(0)),
        };

        let grad_patches = delta.dot(&self.weights.t());
        let c = self.in_channels;
        let pad = self.pad_left() as isize;
        let mut grad_input = Array2::zeros((grad_patches.nrows(), c));
        for (row, patch) in grad_patches.outer_iter().enumerate() {
            let (sample, t) = (row / steps, row % steps);
            for k in 0..self.kernel_size {
                let src = t as isize + k as isize - pad;
                if src < 0 || src >= steps as isize {
                    continue;
                }
                let mut target = grad_input.row_mut(sample * steps + src as usize);
                target += &patch.slice(s![k * c..(k + 1) * c]);
            }
        }

        (grad_input, grads)
    }

    pub fn num_parameters(&self) -> usize {
        self.weights.len() + self.bias.len()
    }
}

/// Fully connected layer: `activation(x · W + b)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Dense {
    /// (inputs, units)
    pub weights: Array2<f32>,
    pub bias: Array1<f32>,
    /// `None` for raw logits.
    pub activation: Option<Activation>,
}

impl Dense {
    pub fn new<R: Rng + ?Sized>(
        inputs: usize,
        units: usize,
        activation: Option<Activation>,
        rng: &mut R,
    ) -> Self {
        Self {
            weights: glorot((inputs, units), inputs, units, rng),
            bias: Array1::zeros(units),
            activation,
        }
    }

    pub fn units(&self) -> usize {
        self.weights.ncols()
    }

    pub fn forward(&self, input: ArrayView2<'_, f32>) -> Array2<f32> {
        let mut out = input.dot(&self.weights) + &self.bias;
        if let Some(activation) = self.activation {
            activation.apply(&mut out);
        }
        out
    }

    pub fn backward(
        &self,
        input: ArrayView2<'_, f32>,
        output: &Array2<f32>,
        grad_output: &Array2<f32>,
    ) -> (Array2<f32>, LayerGrads) {
        let mut delta = grad_output.clone();
        if let Some(activation) = self.activation {
            delta.zip_mut_with(output, |d, &y| *d *= activation.derivative_from_output(y));
        }
        let grads = LayerGrads {
            weights: input.t().dot(&delta),
            bias: delta.sum_axis(Axis(0)),
        };
        (delta.dot(&self.weights.t()), grads)
    }

    pub fn num_parameters(&self) -> usize {
        self.weights.len() + self.bias.len()
    }
}

/// Mean over steps: (samples * steps, channels) -> (samples, channels).
pub fn global_average_pool(input: ArrayView2<'_, f32>, steps: usize) -> Array2<f32> {
    let samples = input.nrows() / steps;
    let mut out = Array2::zeros((samples, input.ncols()));
    for (sample, mut row) in out.outer_iter_mut().enumerate() {
        let block = input.slice(s![sample * steps..(sample + 1) * steps, ..]);
        row.assign(&block.sum_axis(Axis(0)));
        row /= steps as f32;
    }
    out
}

pub fn global_average_pool_backward(grad_output: &Array2<f32>, steps: usize) -> Array2<f32> {
    let scale = 1.0 / steps as f32;
    Array2::from_shape_fn((grad_output.nrows() * steps, grad_output.ncols()), |(row, c)| {
        grad_output[[row / steps, c]] * scale
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn identity_conv() -> Conv1d {
        // One channel in, one filter out, kernel [0, 1, 0]: output equals input.
        Conv1d {
            weights: array![[0.0f32], [1.0], [0.0]],
            bias: array![0.0],
            kernel_size: 3,
            in_channels: 1,
            activation: Activation::Relu,
        }
    }

    #[test]
    fn same_padding_keeps_length() {
        let mut rng = StdRng::seed_from_u64(1);
        let conv = Conv1d::new(3, 5, 3, Activation::Relu, &mut rng);
        let input = Array2::<f32>::ones((2 * 4, 3));
        let (out, patches) = conv.forward(input.view(), 4);

        assert_eq!(out.dim(), (8, 5));
        assert_eq!(patches.dim(), (8, 9));
        assert_eq!(conv.num_parameters(), 9 * 5 + 5);
    }

    #[test]
    fn patches_do_not_cross_samples() {
        let conv = identity_conv();
        let input = array![[1.0f32], [2.0], [3.0], [4.0]];
        let patches = conv.im2col(input.view(), 2);

        // Sample 0 = [1, 2], sample 1 = [3, 4]; edges padded with zero.
        assert_eq!(patches.row(0).to_vec(), vec![0.0, 1.0, 2.0]);
        assert_eq!(patches.row(1).to_vec(), vec![1.0, 2.0, 0.0]);
        assert_eq!(patches.row(2).to_vec(), vec![0.0, 3.0, 4.0]);
    }

    #[test]
    fn identity_kernel_passes_input_through() {
        let conv = identity_conv();
        let input = array![[1.0f32], [2.0], [3.0]];
        let (out, _) = conv.forward(input.view(), 3);
        assert_eq!(out, input);
    }

    #[test]
    fn conv_input_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(7);
        let conv = Conv1d::new(2, 3, 3, Activation::Tanh, &mut rng);
        let input = Array2::from_shape_fn((4, 2), |(r, c)| 0.1 * r as f32 - 0.2 * c as f32);
        let steps = 4;

        let loss = |x: &Array2<f32>| conv.forward(x.view(), steps).0.sum();
        let (out, patches) = conv.forward(input.view(), steps);
        let (grad_input, _) = conv.backward(&patches, &out, &Array2::ones(out.dim()), steps);

        let eps = 1e-3;
        for r in 0..4 {
            for c in 0..2 {
                let mut plus = input.clone();
                plus[[r, c]] += eps;
                let mut minus = input.clone();
                minus[[r, c]] -= eps;
                let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
                assert!(
                    (numeric - grad_input[[r, c]]).abs() < 1e-2,
                    "({r},{c}) numeric {numeric} analytic {}",
                    grad_input[[r, c]]
                );
            }
        }
    }

    #[test]
    fn dense_forward_shape() {
        let mut rng = StdRng::seed_from_u64(3);
        let dense = Dense::new(4, 3, Some(Activation::Relu), &mut rng);
        let out = dense.forward(Array2::<f32>::ones((2, 4)).view());
        assert_eq!(out.dim(), (2, 3));
        assert_eq!(dense.num_parameters(), 4 * 3 + 3);
    }

    #[test]
    fn pooling_averages_each_sample() {
        let input = array![[1.0f32, 10.0], [3.0, 30.0], [5.0, 0.0], [7.0, 0.0]];
        let pooled = global_average_pool(input.view(), 2);
        assert_eq!(pooled, array![[2.0, 20.0], [6.0, 0.0]]);

        let grad = global_average_pool_backward(&array![[2.0f32, 4.0]], 2);
        assert_eq!(grad, array![[1.0, 2.0], [1.0, 2.0]]);
    }
}
