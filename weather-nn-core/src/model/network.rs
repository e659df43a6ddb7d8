//! Conv1D -> Conv1D -> GlobalAveragePool -> Dense -> Dropout -> Dense(softmax).

use ndarray::{Array1, Array2, ArrayView1, ArrayView3, Axis};
use rand::{Rng, SeedableRng, rngs::StdRng};

use super::{
    LayerKind,
    layers::{Conv1d, Dense, LayerGrads, global_average_pool, global_average_pool_backward},
};
use crate::config::ModelConfig;

/// Probabilities are clipped to `[EPSILON, 1 - EPSILON]` inside the loss.
const EPSILON: f32 = 1e-7;

#[derive(Debug, Clone, PartialEq)]
pub struct ConvClassifier {
    pub conv1: Conv1d,
    pub conv2: Conv1d,
    pub hidden: Dense,
    pub output: Dense,
    pub dropout: f32,
    pub window_size: usize,
    pub num_features: usize,
    pub num_classes: usize,
}

/// Every intermediate activation of one inference pass.
#[derive(Debug, Clone)]
pub struct ForwardTrace {
    /// Input flattened to one row per (sample, step).
    pub input: Array2<f32>,
    pub conv1: Array2<f32>,
    pub conv2: Array2<f32>,
    pub pooled: Array2<f32>,
    pub hidden: Array2<f32>,
    pub logits: Array2<f32>,
    pub probs: Array2<f32>,
}

/// Activations kept from a training pass for backpropagation.
struct TrainCache {
    patches1: Array2<f32>,
    conv1: Array2<f32>,
    patches2: Array2<f32>,
    conv2: Array2<f32>,
    pooled: Array2<f32>,
    hidden: Array2<f32>,
    dropout_mask: Option<Array2<f32>>,
    dropped: Array2<f32>,
    logits: Array2<f32>,
    probs: Array2<f32>,
}

/// Loss and accuracy of one training batch, plus gradients in
/// `parameters_mut` order.
pub struct BatchResult {
    pub loss: f32,
    pub accuracy: f32,
    pub grads: Vec<LayerGrads>,
}

impl ConvClassifier {
    pub fn new(
        config: &ModelConfig,
        window_size: usize,
        num_features: usize,
        num_classes: usize,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let conv1 = Conv1d::new(
            num_features,
            config.conv1_filters,
            config.kernel_size,
            config.activation,
            &mut rng,
        );
        let conv2 = Conv1d::new(
            config.conv1_filters,
            config.conv2_filters,
            config.kernel_size,
            config.activation,
            &mut rng,
        );
        let hidden = Dense::new(
            config.conv2_filters,
            config.dense_units,
            Some(config.activation),
            &mut rng,
        );
        let output = Dense::new(config.dense_units, num_classes, None, &mut rng);

        Self {
            conv1,
            conv2,
            hidden,
            output,
            dropout: config.dropout,
            window_size,
            num_features,
            num_classes,
        }
    }

    /// Layer sequence as executed, including the training-only dropout.
    pub fn graph(&self) -> Vec<LayerKind> {
        vec![
            LayerKind::Conv1d {
                filters: self.conv1.filters(),
                kernel_size: self.conv1.kernel_size,
                activation: self.conv1.activation,
            },
            LayerKind::Conv1d {
                filters: self.conv2.filters(),
                kernel_size: self.conv2.kernel_size,
                activation: self.conv2.activation,
            },
            LayerKind::GlobalAveragePool1d,
            LayerKind::Dense {
                units: self.hidden.units(),
                activation: self.hidden.activation,
            },
            LayerKind::Dropout { rate: self.dropout },
            LayerKind::Dense {
                units: self.output.units(),
                activation: self.output.activation,
            },
            LayerKind::Softmax,
        ]
    }

    pub fn num_parameters(&self) -> usize {
        self.conv1.num_parameters()
            + self.conv2.num_parameters()
            + self.hidden.num_parameters()
            + self.output.num_parameters()
    }

    /// Weight/bias pairs in a fixed order shared with [`BatchResult::grads`].
    pub fn parameters_mut(&mut self) -> [(&mut Array2<f32>, &mut Array1<f32>); 4] {
        [
            (&mut self.conv1.weights, &mut self.conv1.bias),
            (&mut self.conv2.weights, &mut self.conv2.bias),
            (&mut self.hidden.weights, &mut self.hidden.bias),
            (&mut self.output.weights, &mut self.output.bias),
        ]
    }

    fn flatten_input(&self, x: ArrayView3<'_, f32>) -> Array2<f32> {
        let (samples, steps, features) = x.dim();
        Array2::from_shape_fn((samples * steps, features), |(row, c)| {
            x[[row / steps, row % steps, c]]
        })
    }

    /// Inference pass (dropout disabled) keeping every activation.
    pub fn forward_trace(&self, x: ArrayView3<'_, f32>) -> ForwardTrace {
        let steps = x.len_of(Axis(1));
        let input = self.flatten_input(x);
        let (conv1, _) = self.conv1.forward(input.view(), steps);
        let (conv2, _) = self.conv2.forward(conv1.view(), steps);
        let pooled = global_average_pool(conv2.view(), steps);
        let hidden = self.hidden.forward(pooled.view());
        let logits = self.output.forward(hidden.view());
        let probs = softmax(&logits);
        ForwardTrace {
            input,
            conv1,
            conv2,
            pooled,
            hidden,
            logits,
            probs,
        }
    }

    /// Class probabilities, one row per sample.
    pub fn predict_proba(&self, x: ArrayView3<'_, f32>) -> Array2<f32> {
        self.forward_trace(x).probs
    }

    pub fn predict(&self, x: ArrayView3<'_, f32>) -> Vec<usize> {
        self.predict_proba(x).outer_iter().map(argmax).collect()
    }

    fn forward_train<R: Rng + ?Sized>(&self, x: ArrayView3<'_, f32>, rng: &mut R) -> TrainCache {
        let steps = x.len_of(Axis(1));
        let input = self.flatten_input(x);
        let (conv1, patches1) = self.conv1.forward(input.view(), steps);
        let (conv2, patches2) = self.conv2.forward(conv1.view(), steps);
        let pooled = global_average_pool(conv2.view(), steps);
        let hidden = self.hidden.forward(pooled.view());

        // Inverted dropout: survivors are scaled so inference needs no rescale.
        let (dropout_mask, dropped) = if self.dropout > 0.0 {
            let keep = 1.0 - self.dropout;
            let mask = Array2::from_shape_fn(hidden.dim(), |_| {
                if rng.gen_bool(f64::from(keep)) { 1.0 / keep } else { 0.0 }
            });
            let dropped = &hidden * &mask;
            (Some(mask), dropped)
        } else {
            (None, hidden.clone())
        };

        let logits = self.output.forward(dropped.view());
        let probs = softmax(&logits);
        TrainCache {
            patches1,
            conv1,
            patches2,
            conv2,
            pooled,
            hidden,
            dropout_mask,
            dropped,
            logits,
            probs,
        }
    }

    /// Forward and backward pass over one batch with dropout active.
    pub fn train_batch<R: Rng + ?Sized>(
        &self,
        x: ArrayView3<'_, f32>,
        labels: &[usize],
        rng: &mut R,
    ) -> BatchResult {
        let steps = x.len_of(Axis(1));
        let cache = self.forward_train(x, rng);
        let (loss, accuracy) = loss_and_accuracy(&cache.probs, labels);

        // Softmax + cross-entropy gradient w.r.t. logits.
        let batch = labels.len() as f32;
        let mut grad_logits = cache.probs.clone();
        for (row, &label) in labels.iter().enumerate() {
            grad_logits[[row, label]] -= 1.0;
        }
        grad_logits /= batch;

        let (grad_dropped, output_grads) = self
            .output
            .backward(cache.dropped.view(), &cache.logits, &grad_logits);
        let grad_hidden = match &cache.dropout_mask {
            Some(mask) => grad_dropped * mask,
            None => grad_dropped,
        };
        let (grad_pooled, hidden_grads) = self
            .hidden
            .backward(cache.pooled.view(), &cache.hidden, &grad_hidden);
        let grad_conv2 = global_average_pool_backward(&grad_pooled, steps);
        let (grad_conv1, conv2_grads) = self
            .conv2
            .backward(&cache.patches2, &cache.conv2, &grad_conv2, steps);
        let (_, conv1_grads) = self
            .conv1
            .backward(&cache.patches1, &cache.conv1, &grad_conv1, steps);

        BatchResult {
            loss,
            accuracy,
            grads: vec![conv1_grads, conv2_grads, hidden_grads, output_grads],
        }
    }

    /// Mean loss and accuracy without dropout, evaluated in chunks.
    pub fn evaluate(
        &self,
        x: ArrayView3<'_, f32>,
        labels: &[usize],
        batch_size: usize,
    ) -> (f32, f32) {
        let n = labels.len();
        if n == 0 {
            return (f32::NAN, f32::NAN);
        }
        let mut loss_sum = 0.0f64;
        let mut correct = 0.0f64;
        let batch_size = batch_size.max(1);
        for start in (0..n).step_by(batch_size) {
            let end = (start + batch_size).min(n);
            let probs = self.predict_proba(x.slice(ndarray::s![start..end, .., ..]));
            let (loss, acc) = loss_and_accuracy(&probs, &labels[start..end]);
            let count = (end - start) as f64;
            loss_sum += f64::from(loss) * count;
            correct += f64::from(acc) * count;
        }
        ((loss_sum / n as f64) as f32, (correct / n as f64) as f32)
    }
}

/// Row-wise numerically stable softmax.
pub fn softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.outer_iter_mut() {
        let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }
    out
}

pub fn argmax(row: ArrayView1<'_, f32>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_v), (i, &v)| {
            if v > best_v { (i, v) } else { (best, best_v) }
        })
        .0
}

/// Sparse categorical cross-entropy and accuracy.
pub fn loss_and_accuracy(probs: &Array2<f32>, labels: &[usize]) -> (f32, f32) {
    let n = labels.len().max(1) as f32;
    let mut loss = 0.0f32;
    let mut correct = 0usize;
    for (row, &label) in probs.outer_iter().zip(labels) {
        let p = row[label].clamp(EPSILON, 1.0 - EPSILON);
        loss -= p.ln();
        if argmax(row) == label {
            correct += 1;
        }
    }
    (loss / n, correct as f32 / n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Activation, Adam};
    use ndarray::{Array3, array};

    fn small_config() -> ModelConfig {
        ModelConfig {
            conv1_filters: 8,
            conv2_filters: 8,
            dense_units: 8,
            dropout: 0.0,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn default_architecture_shapes() {
        let model = ConvClassifier::new(&ModelConfig::default(), 4, 7, 6, 42);
        let x = Array3::<f32>::zeros((3, 4, 7));
        let probs = model.predict_proba(x.view());

        assert_eq!(probs.dim(), (3, 6));
        for row in probs.outer_iter() {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
        let graph = model.graph();
        assert_eq!(graph.len(), 7);
        assert_eq!(
            graph[0],
            LayerKind::Conv1d {
                filters: 64,
                kernel_size: 3,
                activation: Activation::Relu
            }
        );
        assert_eq!(graph.last(), Some(&LayerKind::Softmax));
    }

    #[test]
    fn same_seed_same_weights() {
        let a = ConvClassifier::new(&small_config(), 4, 3, 6, 9);
        let b = ConvClassifier::new(&small_config(), 4, 3, 6, 9);
        let c = ConvClassifier::new(&small_config(), 4, 3, 6, 10);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let probs = softmax(&array![[1.0f32, 2.0, 3.0], [1000.0, 0.0, -1000.0]]);
        for row in probs.outer_iter() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
        assert_eq!(argmax(probs.row(0)), 2);
        assert_eq!(argmax(probs.row(1)), 0);
    }

    #[test]
    fn loss_is_finite_for_zero_probability() {
        let (loss, acc) = loss_and_accuracy(&array![[1.0f32, 0.0]], &[1]);
        assert!(loss.is_finite());
        assert_eq!(acc, 0.0);
    }

    #[test]
    fn training_steps_reduce_loss() {
        let mut model = ConvClassifier::new(&small_config(), 3, 2, 2, 5);
        // Class 1 when the first feature is high across the window.
        let x = Array3::from_shape_fn((8, 3, 2), |(i, _, f)| {
            if f == 0 { (i % 2) as f32 } else { 0.5 }
        });
        let labels: Vec<usize> = (0..8).map(|i| i % 2).collect();

        let mut rng = StdRng::seed_from_u64(0);
        let mut adam = Adam::new(0.01);
        let (initial, _) = model.evaluate(x.view(), &labels, 8);
        for _ in 0..200 {
            let result = model.train_batch(x.view(), &labels, &mut rng);
            adam.step(&mut model, &result.grads);
        }
        let (trained, accuracy) = model.evaluate(x.view(), &labels, 8);

        assert!(trained < initial, "{trained} !< {initial}");
        assert_eq!(accuracy, 1.0);
    }
}
