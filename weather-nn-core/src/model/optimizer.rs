//! Adam (Adaptive Moment Estimation)

use ndarray::{Array, Dimension, Zip};

use super::{ConvClassifier, LayerGrads};

#[derive(Debug, Clone)]
pub struct Adam {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    t: i32,
    /// First and second moments, one entry per parameter pair.
    moments: Option<(Vec<LayerGrads>, Vec<LayerGrads>)>,
}

impl Adam {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            t: 0,
            moments: None,
        }
    }

    /// Apply one update. `grads` must follow `ConvClassifier::parameters_mut`.
    pub fn step(&mut self, model: &mut ConvClassifier, grads: &[LayerGrads]) {
        self.t += 1;
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);
        let lr_t =
            self.learning_rate * (1.0 - beta2.powi(self.t)).sqrt() / (1.0 - beta1.powi(self.t));

        let (m_all, v_all) = self.moments.get_or_insert_with(|| {
            let zeros: Vec<LayerGrads> = grads
                .iter()
                .map(|g| LayerGrads::zeros_like(&g.weights, &g.bias))
                .collect();
            (zeros.clone(), zeros)
        });

        let params = model.parameters_mut();
        for (((weights, bias), grad), (m, v)) in params
            .into_iter()
            .zip(grads)
            .zip(m_all.iter_mut().zip(v_all.iter_mut()))
        {
            adam_update(
                weights,
                &grad.weights,
                &mut m.weights,
                &mut v.weights,
                beta1,
                beta2,
                epsilon,
                lr_t,
            );
            adam_update(
                bias,
                &grad.bias,
                &mut m.bias,
                &mut v.bias,
                beta1,
                beta2,
                epsilon,
                lr_t,
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn adam_update<D: Dimension>(
    param: &mut Array<f32, D>,
    grad: &Array<f32, D>,
    m: &mut Array<f32, D>,
    v: &mut Array<f32, D>,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    lr_t: f32,
) {
    Zip::from(param)
        .and(grad)
        .and(m)
        .and(v)
        .for_each(|p, &g, m, v| {
            *m = beta1 * *m + (1.0 - beta1) * g;
            *v = beta2 * *v + (1.0 - beta2) * g * g;
            *p -= lr_t * *m / (v.sqrt() + epsilon);
        });
}
