//! 1-D convolutional classifier over windows of hourly features.

pub mod layers;
pub mod network;
pub mod optimizer;

use ndarray::{Array, Dimension};
use serde::{Deserialize, Serialize};

pub use layers::{Conv1d, Dense, LayerGrads};
pub use network::ConvClassifier;
pub use optimizer::Adam;

/// Hidden-layer nonlinearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Tanh,
}

impl Activation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Activation::Relu => "relu",
            Activation::Tanh => "tanh",
        }
    }

    pub fn apply<D: Dimension>(&self, x: &mut Array<f32, D>) {
        match self {
            Activation::Relu => x.mapv_inplace(|v| v.max(0.0)),
            Activation::Tanh => x.mapv_inplace(f32::tanh),
        }
    }

    /// Derivative expressed through the activation output.
    pub fn derivative_from_output(&self, y: f32) -> f32 {
        match self {
            Activation::Relu => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::Tanh => 1.0 - y * y,
        }
    }
}

/// One step of the model graph, in execution order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LayerKind {
    Conv1d {
        filters: usize,
        kernel_size: usize,
        activation: Activation,
    },
    GlobalAveragePool1d,
    Dense {
        units: usize,
        activation: Option<Activation>,
    },
    Dropout {
        rate: f32,
    },
    Softmax,
}

impl LayerKind {
    pub fn name(&self) -> String {
        match self {
            LayerKind::Conv1d { activation, .. } => format!("conv1d/{}", activation.as_str()),
            LayerKind::GlobalAveragePool1d => "global_average_pool1d".to_string(),
            LayerKind::Dense {
                activation: Some(a),
                ..
            } => format!("dense/{}", a.as_str()),
            LayerKind::Dense { activation: None, .. } => "dense".to_string(),
            LayerKind::Dropout { .. } => "dropout".to_string(),
            LayerKind::Softmax => "softmax".to_string(),
        }
    }
}
