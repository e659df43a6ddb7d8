//! Train/validation split, mini-batch training and early stopping.

use ndarray::Axis;
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    config::TrainConfig,
    error::TrainError,
    model::{Adam, ConvClassifier},
    sequence::SequenceSet,
};

/// Metrics recorded after one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss: f32,
    pub accuracy: f32,
    pub val_loss: f32,
    pub val_accuracy: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochMetrics>,
    /// 1-based epoch whose weights were restored.
    pub best_epoch: usize,
    pub stopped_early: bool,
}

impl TrainingHistory {
    pub fn accuracy(&self) -> Vec<f32> {
        self.epochs.iter().map(|m| m.accuracy).collect()
    }

    pub fn val_accuracy(&self) -> Vec<f32> {
        self.epochs.iter().map(|m| m.val_accuracy).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub loss: f32,
    pub accuracy: f32,
}

/// Stops when `val_loss` has not improved for `patience` epochs and keeps
/// a copy of the best weights.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    pub patience: usize,
    best_loss: f32,
    best_epoch: usize,
    wait: usize,
    best_weights: Option<ConvClassifier>,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best_loss: f32::INFINITY,
            best_epoch: 0,
            wait: 0,
            best_weights: None,
        }
    }

    /// Record an epoch; returns `true` when training should stop.
    pub fn update(&mut self, epoch: usize, val_loss: f32, model: &ConvClassifier) -> bool {
        if val_loss < self.best_loss {
            self.best_loss = val_loss;
            self.best_epoch = epoch;
            self.wait = 0;
            self.best_weights = Some(model.clone());
            return false;
        }
        self.wait += 1;
        self.wait >= self.patience
    }

    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }

    /// Hand back the best snapshot, if any epoch improved.
    pub fn into_best(self) -> Option<ConvClassifier> {
        self.best_weights
    }
}

/// Shuffled split with `ceil(validation_split * n)` validation samples.
pub fn train_validation_split(
    set: &SequenceSet,
    validation_split: f64,
    seed: u64,
) -> Result<(SequenceSet, SequenceSet), TrainError> {
    let total = set.len();
    let validation = (validation_split * total as f64).ceil() as usize;
    let train = total.saturating_sub(validation);
    if train == 0 || validation == 0 {
        return Err(TrainError::NotEnoughSamples {
            total,
            train,
            validation,
        });
    }

    let mut indices: Vec<usize> = (0..total).collect();
    indices.shuffle(&mut StdRng::seed_from_u64(seed));
    let (val_idx, train_idx) = indices.split_at(validation);
    Ok((set.select(train_idx), set.select(val_idx)))
}

/// Chronological split point for `rows` rows: the first `n - ceil(split * n)`
/// rows train, the rest validate.
pub fn chronological_split_point(rows: usize, validation_split: f64) -> usize {
    let validation = (validation_split * rows as f64).ceil() as usize;
    rows.saturating_sub(validation)
}

#[derive(Debug, Clone)]
pub struct Trainer {
    config: TrainConfig,
    learning_rate: f32,
}

impl Trainer {
    pub fn new(config: TrainConfig, learning_rate: f32) -> Self {
        Self {
            config,
            learning_rate,
        }
    }

    fn check(&self, model: &ConvClassifier, set: &SequenceSet) -> Result<(), TrainError> {
        if set.num_features() != model.num_features {
            return Err(TrainError::FeatureMismatch {
                expected: model.num_features,
                actual: set.num_features(),
            });
        }
        if let Some(&label) = set.labels.iter().find(|&&l| l >= model.num_classes) {
            return Err(TrainError::LabelOutOfRange {
                label,
                num_classes: model.num_classes,
            });
        }
        Ok(())
    }

    /// Train in place; on return `model` holds the best validation weights.
    pub fn fit(
        &self,
        model: &mut ConvClassifier,
        train: &SequenceSet,
        validation: &SequenceSet,
    ) -> Result<TrainingHistory, TrainError> {
        if train.is_empty() || validation.is_empty() {
            return Err(TrainError::NotEnoughSamples {
                total: train.len() + validation.len(),
                train: train.len(),
                validation: validation.len(),
            });
        }
        self.check(model, train)?;
        self.check(model, validation)?;

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut optimizer = Adam::new(self.learning_rate);
        let mut stopper = EarlyStopping::new(self.config.patience);
        let mut history = TrainingHistory::default();
        let mut order: Vec<usize> = (0..train.len()).collect();
        let batch_size = self.config.batch_size.max(1);

        for epoch in 1..=self.config.epochs {
            order.shuffle(&mut rng);

            let mut loss_sum = 0.0f64;
            let mut acc_sum = 0.0f64;
            for chunk in order.chunks(batch_size) {
                let batch = train.inputs.select(Axis(0), chunk);
                let labels: Vec<usize> = chunk.iter().map(|&i| train.labels[i]).collect();
                let result = model.train_batch(batch.view(), &labels, &mut rng);
                if !result.loss.is_finite() {
                    return Err(TrainError::Diverged(result.loss, epoch));
                }
                optimizer.step(model, &result.grads);
                loss_sum += f64::from(result.loss) * chunk.len() as f64;
                acc_sum += f64::from(result.accuracy) * chunk.len() as f64;
            }

            let n = train.len() as f64;
            let (val_loss, val_accuracy) =
                model.evaluate(validation.inputs.view(), &validation.labels, batch_size);
            let metrics = EpochMetrics {
                epoch,
                loss: (loss_sum / n) as f32,
                accuracy: (acc_sum / n) as f32,
                val_loss,
                val_accuracy,
            };
            info!(
                epoch,
                loss = metrics.loss,
                accuracy = metrics.accuracy,
                val_loss,
                val_accuracy,
                "epoch finished"
            );
            history.epochs.push(metrics);

            if stopper.update(epoch, val_loss, model) {
                history.stopped_early = true;
                info!(
                    epoch,
                    best_epoch = stopper.best_epoch(),
                    "early stopping: val_loss did not improve for {} epochs",
                    stopper.patience
                );
                break;
            }
        }

        history.best_epoch = stopper.best_epoch();
        if let Some(best) = stopper.into_best() {
            debug!(best_epoch = history.best_epoch, "restoring best weights");
            *model = best;
        }
        Ok(history)
    }
}

pub fn evaluate(model: &ConvClassifier, set: &SequenceSet, batch_size: usize) -> Evaluation {
    let (loss, accuracy) = model.evaluate(set.inputs.view(), &set.labels, batch_size);
    Evaluation { loss, accuracy }
}
