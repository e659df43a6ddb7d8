//! Sliding-window sequence construction.

use ndarray::{Array3, ArrayView2, Axis, s};

use crate::error::SequenceError;

/// Windowed samples: `inputs` is (samples, window, features).
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceSet {
    pub inputs: Array3<f32>,
    pub labels: Vec<usize>,
}

impl SequenceSet {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn window_size(&self) -> usize {
        self.inputs.len_of(Axis(1))
    }

    pub fn num_features(&self) -> usize {
        self.inputs.len_of(Axis(2))
    }

    /// Gather samples by index, in the given order.
    pub fn select(&self, indices: &[usize]) -> SequenceSet {
        SequenceSet {
            inputs: self.inputs.select(Axis(0), indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }
}

/// Pair each run of `window_size` rows with the label of the row after it.
///
/// Yields `max(0, rows - window_size)` samples; too few rows is not an error.
pub fn make_sequences(
    features: ArrayView2<'_, f32>,
    labels: &[usize],
    window_size: usize,
) -> Result<SequenceSet, SequenceError> {
    if window_size == 0 {
        return Err(SequenceError::ZeroWindow);
    }
    if features.nrows() != labels.len() {
        return Err(SequenceError::LengthMismatch {
            features: features.nrows(),
            labels: labels.len(),
        });
    }

    let n_features = features.ncols();
    let count = labels.len().saturating_sub(window_size);
    let mut inputs = Array3::zeros((count, window_size, n_features));
    for (i, mut sample) in inputs.outer_iter_mut().enumerate() {
        sample.assign(&features.slice(s![i..i + window_size, ..]));
    }
    let labels = labels[window_size.min(labels.len())..].to_vec();

    Ok(SequenceSet { inputs, labels })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn ramp(rows: usize, cols: usize) -> Array2<f32> {
        Array2::from_shape_fn((rows, cols), |(r, c)| (r * 10 + c) as f32)
    }

    #[test]
    fn produces_rows_minus_window_samples() {
        for (rows, window) in [(10, 4), (5, 1), (4, 4), (3, 4), (0, 2)] {
            let x = ramp(rows, 3);
            let y: Vec<usize> = (0..rows).collect();
            let set = make_sequences(x.view(), &y, window).expect("sequences");
            assert_eq!(set.len(), rows.saturating_sub(window));
            assert_eq!(set.inputs.dim(), (set.len(), window, 3));
        }
    }

    #[test]
    fn label_is_row_after_window() {
        let x = ramp(8, 2);
        let y: Vec<usize> = (0..8).map(|i| i % 6).collect();
        let set = make_sequences(x.view(), &y, 3).expect("sequences");

        for i in 0..set.len() {
            assert_eq!(set.labels[i], y[i + 3]);
            assert_eq!(set.inputs[[i, 0, 0]], x[[i, 0]]);
            assert_eq!(set.inputs[[i, 2, 1]], x[[i + 2, 1]]);
        }
    }

    #[test]
    fn zero_window_is_rejected() {
        let x = ramp(3, 1);
        let err = make_sequences(x.view(), &[0, 0, 0], 0).unwrap_err();
        assert_eq!(err, SequenceError::ZeroWindow);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let x = ramp(3, 1);
        let err = make_sequences(x.view(), &[0, 0], 1).unwrap_err();
        assert!(matches!(err, SequenceError::LengthMismatch { .. }));
    }

    #[test]
    fn select_keeps_pairs_together() {
        let x = ramp(6, 1);
        let set = make_sequences(x.view(), &[0, 1, 2, 3, 4, 5], 2).expect("sequences");
        let picked = set.select(&[3, 0]);

        assert_eq!(picked.labels, vec![5, 2]);
        assert_eq!(picked.inputs[[0, 0, 0]], 30.0);
        assert_eq!(picked.inputs[[1, 0, 0]], 0.0);
    }
}
