//! Quantile estimation over a feature matrix.
//!
//! Quantiles use linear interpolation between order statistics: for `n`
//! sorted values and level `q`, `h = q * (n - 1)` and the result is
//! `x[floor(h)] + (h - floor(h)) * (x[floor(h) + 1] - x[floor(h)])`.

use rayon::prelude::*;
use snafu::prelude::*;

use crate::stats::columns::FeatureMatrix;

/// Quantile levels, in the order of
/// [`QUANTILE_NAMES`](crate::metadata::stats::QUANTILE_NAMES).
pub const QUANTILE_LEVELS: [f64; 5] = [0.01, 0.10, 0.50, 0.90, 0.99];

/// Errors raised while estimating quantiles.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum QuantileError {
    /// The matrix has no rows or no columns.
    #[snafu(display("Cannot compute quantiles of an empty feature matrix"))]
    Empty,

    /// Every value of one column is NaN.
    #[snafu(display("Column {column} has no comparable values"))]
    AllNan {
        /// Zero-based column (dimension) index.
        column: usize,
    },
}

/// Quantile of already sorted, NaN-free `sorted` at level `q` in `[0, 1]`.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let h = q.clamp(0.0, 1.0) * last as f64;
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(last);
    let frac = h - lo as f64;
    let base = sorted[lo];
    if frac == 0.0 {
        Some(base)
    } else {
        Some(base + frac * (sorted[hi] - base))
    }
}

/// Five quantile vectors of `matrix`, each with one entry per column.
///
/// Columns are processed in parallel; results are deterministic.
pub fn compute_quantiles(matrix: &FeatureMatrix) -> Result<[Vec<f64>; 5], QuantileError> {
    ensure!(matrix.rows() > 0 && matrix.cols() > 0, EmptySnafu);

    let per_column: Vec<[f64; 5]> = (0..matrix.cols())
        .into_par_iter()
        .map(|col| {
            let mut values: Vec<f64> = matrix.column(col).filter(|v| !v.is_nan()).collect();
            values.sort_by(f64::total_cmp);
            let mut out = [0.0; 5];
            for (slot, q) in out.iter_mut().zip(QUANTILE_LEVELS) {
                *slot = quantile_sorted(&values, q).context(AllNanSnafu { column: col })?;
            }
            Ok(out)
        })
        .collect::<Result<_, QuantileError>>()?;

    let mut levels: [Vec<f64>; 5] = Default::default();
    for column in per_column {
        for (level, v) in levels.iter_mut().zip(column) {
            level.push(v);
        }
    }
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn one_to_hundred() -> Result<(), QuantileError> {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        let matrix = FeatureMatrix::from_rows(values.iter().map(|v| vec![*v]).collect());
        let [q01, q10, q50, q90, q99] = compute_quantiles(&matrix)?;
        assert_close(q01[0], 1.99);
        assert_close(q10[0], 10.9);
        assert_close(q50[0], 50.5);
        assert_close(q90[0], 90.1);
        assert_close(q99[0], 99.01);
        Ok(())
    }

    #[test]
    fn single_row_repeats_itself() -> Result<(), QuantileError> {
        let matrix = FeatureMatrix::from_rows(vec![vec![3.0, -1.0]]);
        for level in compute_quantiles(&matrix)? {
            assert_eq!(level, vec![3.0, -1.0]);
        }
        Ok(())
    }

    #[test]
    fn columns_are_independent_and_order_free() -> Result<(), QuantileError> {
        let matrix = FeatureMatrix::from_rows(vec![
            vec![5.0, 10.0],
            vec![1.0, 30.0],
            vec![3.0, 20.0],
        ]);
        let [_, _, q50, _, _] = compute_quantiles(&matrix)?;
        assert_eq!(q50, vec![3.0, 20.0]);
        Ok(())
    }

    #[test]
    fn nan_is_skipped_but_all_nan_fails() {
        let matrix = FeatureMatrix::from_rows(vec![vec![f64::NAN, 1.0], vec![2.0, f64::NAN]]);
        let levels = compute_quantiles(&matrix);
        assert!(matches!(levels, Ok(ref l) if l[2] == vec![2.0, 1.0]));

        let all_nan = FeatureMatrix::from_rows(vec![vec![1.0, f64::NAN]]);
        assert_eq!(
            compute_quantiles(&all_nan),
            Err(QuantileError::AllNan { column: 1 })
        );
    }

    #[test]
    fn empty_matrix_is_an_error() {
        let matrix = FeatureMatrix::from_rows(Vec::new());
        assert_eq!(compute_quantiles(&matrix), Err(QuantileError::Empty));
    }

    #[test]
    fn interpolation_edges() {
        assert_eq!(quantile_sorted(&[], 0.5), None);
        assert_eq!(quantile_sorted(&[1.0, 2.0], 0.0), Some(1.0));
        assert_eq!(quantile_sorted(&[1.0, 2.0], 1.0), Some(2.0));
        assert_eq!(quantile_sorted(&[1.0, 2.0], 0.5), Some(1.5));
    }
}
