//! Per-column min-max scaling to [0, 1].

use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::error::ScalerError;

/// Min-max scaler. Columns whose min equals max map to 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    pub min: Option<Array1<f32>>,
    pub max: Option<Array1<f32>>,
}

impl MinMaxScaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fit(&mut self, data: ArrayView2<'_, f32>) -> Result<(), ScalerError> {
        if data.nrows() == 0 {
            return Err(ScalerError::Empty);
        }
        let min = data.fold_axis(Axis(0), f32::INFINITY, |&a, &b| a.min(b));
        let max = data.fold_axis(Axis(0), f32::NEG_INFINITY, |&a, &b| a.max(b));
        self.min = Some(min);
        self.max = Some(max);
        Ok(())
    }

    pub fn is_fitted(&self) -> bool {
        self.min.is_some() && self.max.is_some()
    }

    fn params(&self, columns: usize) -> Result<(&Array1<f32>, &Array1<f32>), ScalerError> {
        let (min, max) = self
            .min
            .as_ref()
            .zip(self.max.as_ref())
            .ok_or(ScalerError::NotFitted)?;
        if min.len() != columns {
            return Err(ScalerError::ColumnMismatch {
                expected: min.len(),
                actual: columns,
            });
        }
        Ok((min, max))
    }

    pub fn transform(&self, data: ArrayView2<'_, f32>) -> Result<Array2<f32>, ScalerError> {
        let (min, max) = self.params(data.ncols())?;
        let mut out = data.to_owned();
        for mut row in out.rows_mut() {
            Zip::from(&mut row)
                .and(min)
                .and(max)
                .for_each(|x, &lo, &hi| *x = scale_value(*x, lo, hi));
        }
        Ok(out)
    }

    pub fn fit_transform(
        &mut self,
        data: ArrayView2<'_, f32>,
    ) -> Result<Array2<f32>, ScalerError> {
        self.fit(data)?;
        self.transform(data)
    }

    /// Back to the original units. Constant columns come back as their
    /// fitted value.
    pub fn inverse_transform(
        &self,
        data: ArrayView2<'_, f32>,
    ) -> Result<Array2<f32>, ScalerError> {
        let (min, max) = self.params(data.ncols())?;
        let mut out = data.to_owned();
        for mut row in out.rows_mut() {
            Zip::from(&mut row)
                .and(min)
                .and(max)
                .for_each(|x, &lo, &hi| *x = *x * (hi - lo) + lo);
        }
        Ok(out)
    }
}

fn scale_value(x: f32, lo: f32, hi: f32) -> f32 {
    let range = hi - lo;
    if range > 0.0 { (x - lo) / range } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn scales_columns_into_unit_range() {
        let data = array![[1.0f32, 10.0], [3.0, 30.0], [2.0, 20.0]];
        let mut scaler = MinMaxScaler::new();
        let scaled = scaler.fit_transform(data.view()).expect("fit");

        assert!(scaled.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(scaled[[0, 0]], 0.0);
        assert_eq!(scaled[[1, 0]], 1.0);
        assert_eq!(scaled[[2, 1]], 0.5);
    }

    #[test]
    fn constant_column_maps_to_zero() {
        let data = array![[5.0f32, 1.0], [5.0, 2.0], [5.0, 3.0]];
        let mut scaler = MinMaxScaler::new();
        let scaled = scaler.fit_transform(data.view()).expect("fit");

        for row in 0..3 {
            assert_eq!(scaled[[row, 0]], 0.0);
            assert!(!scaled[[row, 0]].is_nan());
        }
    }

    #[test]
    fn inverse_restores_original_values() {
        let data = array![[-4.0f32, 100.0], [6.0, 250.0]];
        let mut scaler = MinMaxScaler::new();
        let scaled = scaler.fit_transform(data.view()).expect("fit");
        let restored = scaler.inverse_transform(scaled.view()).expect("inverse");

        for (a, b) in restored.iter().zip(data.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn transform_requires_fit() {
        let scaler = MinMaxScaler::new();
        let err = scaler.transform(array![[1.0f32]].view()).unwrap_err();
        assert_eq!(err, ScalerError::NotFitted);
    }

    #[test]
    fn transform_checks_column_count() {
        let mut scaler = MinMaxScaler::new();
        scaler.fit(array![[1.0f32, 2.0]].view()).expect("fit");
        let err = scaler.transform(array![[1.0f32]].view()).unwrap_err();
        assert_eq!(
            err,
            ScalerError::ColumnMismatch {
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn fit_rejects_empty_matrix() {
        let mut scaler = MinMaxScaler::new();
        let empty = Array2::<f32>::zeros((0, 3));
        assert_eq!(scaler.fit(empty.view()), Err(ScalerError::Empty));
    }
}
