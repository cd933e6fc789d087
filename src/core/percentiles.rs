//! NaN-tolerant statistics over a temporal stack (observations, height, width)
//!
//! Percentiles follow NumPy's default `linear` method: for `n` valid values
//! sorted ascending, the virtual index is `(n - 1) * p / 100` and the result
//! interpolates between its floor and the next rank, using NumPy's two-sided
//! lerp so results match bit-for-bit where floating point allows.

use crate::types::{WeaveError, WeaveResult};
use ndarray::{Array2, ArrayView3, Axis};
use num_traits::Float;
use std::cmp::Ordering;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

fn check_percentiles(percentiles: &[f64]) -> WeaveResult<()> {
    for &p in percentiles {
        if !(0.0..=100.0).contains(&p) {
            return Err(WeaveError::DataInvariant(format!(
                "percentile {} outside [0, 100]",
                p
            )));
        }
    }
    Ok(())
}

/// NumPy's lerp: exact at both ends of the interval
fn lerp<A: Float>(a: A, b: A, t: A) -> A {
    let diff = b - a;
    if t >= A::from(0.5).unwrap_or_else(A::one) {
        b - diff * (A::one() - t)
    } else {
        a + diff * t
    }
}

/// Linear-interpolated percentile of values already sorted ascending
pub fn sorted_percentile<A: Float>(sorted: &[A], percentile: f64) -> Option<A> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let virtual_index = (n - 1) as f64 * (percentile / 100.0);
    let previous = virtual_index.floor().clamp(0.0, (n - 1) as f64);
    let next = (previous + 1.0).min((n - 1) as f64);
    let gamma = A::from(virtual_index - previous)?;
    Some(lerp(sorted[previous as usize], sorted[next as usize], gamma))
}

/// Non-NaN values of a column, stably sorted
fn sorted_valid<A: Float>(column: impl Iterator<Item = A>, buffer: &mut Vec<A>) {
    buffer.clear();
    buffer.extend(column.filter(|v| !v.is_nan()));
    buffer.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
}

fn row_percentiles<A: Float>(stack: &ArrayView3<A>, y: usize, percentiles: &[f64], fill: A) -> Vec<A> {
    let width = stack.len_of(Axis(2));
    let mut buffer = Vec::with_capacity(stack.len_of(Axis(0)));
    let mut row = vec![fill; percentiles.len() * width];
    for x in 0..width {
        sorted_valid(stack.slice(ndarray::s![.., y, x]).iter().copied(), &mut buffer);
        for (i, &p) in percentiles.iter().enumerate() {
            if let Some(value) = sorted_percentile(&buffer, p) {
                row[i * width + x] = value;
            }
        }
    }
    row
}

/// Per-pixel percentiles over the observation axis, ignoring NaN.
///
/// Returns one (height, width) array per requested percentile; pixels without
/// any valid observation receive `fill`.
pub fn nanpercentiles<A>(stack: ArrayView3<A>, percentiles: &[f64], fill: A) -> WeaveResult<Vec<Array2<A>>>
where
    A: Float + Send + Sync,
{
    check_percentiles(percentiles)?;
    let (_, height, width) = stack.dim();

    #[cfg(feature = "parallel")]
    let rows: Vec<Vec<A>> = (0..height)
        .into_par_iter()
        .map(|y| row_percentiles(&stack, y, percentiles, fill))
        .collect();
    #[cfg(not(feature = "parallel"))]
    let rows: Vec<Vec<A>> = (0..height)
        .map(|y| row_percentiles(&stack, y, percentiles, fill))
        .collect();

    Ok((0..percentiles.len())
        .map(|i| Array2::from_shape_fn((height, width), |(y, x)| rows[y][i * width + x]))
        .collect())
}

/// Per-pixel mean over the observation axis, ignoring NaN
pub fn nanmean<A: Float>(stack: ArrayView3<A>, fill: A) -> Array2<A> {
    let (_, height, width) = stack.dim();
    Array2::from_shape_fn((height, width), |(y, x)| {
        let (sum, count) = stack
            .slice(ndarray::s![.., y, x])
            .iter()
            .filter(|v| !v.is_nan())
            .fold((A::zero(), 0usize), |(s, c), &v| (s + v, c + 1));
        match A::from(count) {
            Some(n) if count > 0 => sum / n,
            _ => fill,
        }
    })
}

/// Per-pixel population standard deviation over the observation axis, ignoring NaN
pub fn nanstd<A: Float>(stack: ArrayView3<A>, fill: A) -> Array2<A> {
    let means = nanmean(stack.view(), fill);
    let (_, height, width) = stack.dim();
    Array2::from_shape_fn((height, width), |(y, x)| {
        let mean = means[[y, x]];
        let (sum_sq, count) = stack
            .slice(ndarray::s![.., y, x])
            .iter()
            .filter(|v| !v.is_nan())
            .fold((A::zero(), 0usize), |(s, c), &v| (s + (v - mean) * (v - mean), c + 1));
        match A::from(count) {
            Some(n) if count > 0 => (sum_sq / n).sqrt(),
            _ => fill,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array3};

    /// Straightforward linear-interpolation percentile
    fn reference(values: &[f64], p: f64) -> f64 {
        let mut v = values.to_vec();
        v.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let k = (v.len() - 1) as f64 * p / 100.0;
        let lo = k.floor() as usize;
        let hi = k.ceil() as usize;
        v[lo] + (v[hi] - v[lo]) * (k - lo as f64)
    }

    fn column(values: &[f64]) -> Array3<f64> {
        Array1::from(values.to_vec()).into_shape((values.len(), 1, 1)).unwrap()
    }

    #[test]
    fn test_matches_reference_without_nan() {
        let values = [7.0, 1.5, 3.25, 9.0, -2.0, 4.0, 4.0, 11.5];
        let stack = column(&values);
        let ps = [0.0, 25.0, 50.0, 75.0, 100.0, 13.7, 66.6, 99.1];
        let result = nanpercentiles(stack.view(), &ps, f64::NAN).unwrap();
        for (i, &p) in ps.iter().enumerate() {
            assert_abs_diff_eq!(result[i][[0, 0]], reference(&values, p), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_numpy_compatible_values() {
        // numpy.percentile([1, 2, 3, 4], [0, 10, 50, 90, 100])
        let stack = column(&[4.0, 1.0, 3.0, 2.0]);
        let result = nanpercentiles(stack.view(), &[0.0, 10.0, 50.0, 90.0, 100.0], f64::NAN).unwrap();
        let got: Vec<f64> = result.iter().map(|a| a[[0, 0]]).collect();
        assert_abs_diff_eq!(got[0], 1.0);
        assert_abs_diff_eq!(got[1], 1.3, epsilon = 1e-12);
        assert_abs_diff_eq!(got[2], 2.5);
        assert_abs_diff_eq!(got[3], 3.7, epsilon = 1e-12);
        assert_abs_diff_eq!(got[4], 4.0);
    }

    #[test]
    fn test_nan_values_are_ignored() {
        let with_nan = column(&[f64::NAN, 5.0, 1.0, f64::NAN, 3.0]);
        let without = column(&[5.0, 1.0, 3.0]);
        let ps = [10.0, 50.0, 80.0];
        let a = nanpercentiles(with_nan.view(), &ps, -1.0).unwrap();
        let b = nanpercentiles(without.view(), &ps, -1.0).unwrap();
        for i in 0..ps.len() {
            assert_eq!(a[i][[0, 0]], b[i][[0, 0]]);
        }
    }

    #[test]
    fn test_all_nan_column_gets_fill() {
        let mut stack = Array3::<f32>::from_elem((3, 2, 2), f32::NAN);
        stack[[1, 0, 1]] = 2.0;
        let result = nanpercentiles(stack.view(), &[50.0], -9999.0f32).unwrap();
        assert_eq!(result[0][[0, 0]], -9999.0);
        assert_eq!(result[0][[0, 1]], 2.0);

        let default_fill = nanpercentiles(stack.view(), &[50.0], f32::NAN).unwrap();
        assert!(default_fill[0][[1, 1]].is_nan());
    }

    #[test]
    fn test_rejects_out_of_range_percentile() {
        let stack = column(&[1.0]);
        assert!(matches!(
            nanpercentiles(stack.view(), &[101.0], f64::NAN),
            Err(WeaveError::DataInvariant(_))
        ));
        assert!(nanpercentiles(stack.view(), &[f64::NAN], f64::NAN).is_err());
    }

    #[test]
    fn test_mean_and_std() {
        let stack = column(&[2.0, f64::NAN, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_abs_diff_eq!(nanmean(stack.view(), f64::NAN)[[0, 0]], 5.0);
        assert_abs_diff_eq!(nanstd(stack.view(), f64::NAN)[[0, 0]], 2.0);
        let empty = column(&[f64::NAN, f64::NAN]);
        assert_eq!(nanmean(empty.view(), -1.0)[[0, 0]], -1.0);
        assert_eq!(nanstd(empty.view(), -1.0)[[0, 0]], -1.0);
    }
}
