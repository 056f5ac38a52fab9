//! Conversion of Arrow columns into dense `f64` feature matrices.

use arrow::{
    array::{Array, ArrayRef, AsArray},
    compute::cast,
    datatypes::{DataType, Float64Type},
};

/// Row-major matrix with one row per frame and one column per element of
/// the feature's shape.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl FeatureMatrix {
    /// Build from equally long rows. Rows longer than the first are
    /// truncated; callers are expected to pass rectangular input.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Self {
        let cols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in &rows {
            data.extend(row.iter().copied().take(cols));
        }
        Self {
            rows: rows.len(),
            cols,
            data,
        }
    }

    /// Number of rows (frames).
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns (feature elements).
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Values of column `col`, top to bottom.
    pub fn column(&self, col: usize) -> impl Iterator<Item = f64> + '_ {
        (0..self.rows).map(move |r| self.data[r * self.cols + col])
    }

    /// Append the rows of `other`. Returns `false` (leaving `self`
    /// untouched) if the column counts differ.
    pub fn extend(&mut self, other: FeatureMatrix) -> bool {
        if self.rows == 0 {
            *self = other;
            return true;
        }
        if other.rows > 0 && other.cols != self.cols {
            return false;
        }
        self.rows += other.rows;
        self.data.extend(other.data);
        true
    }
}

/// Extract a feature matrix from one Arrow column.
///
/// Numeric and boolean columns yield one column; list columns
/// (`List`, `LargeList`, `FixedSizeList`, nested to any depth) yield one
/// column per flattened element. Null rows are skipped, null elements
/// become NaN. Returns `None` for non-numeric columns and for lists whose
/// rows differ in length.
pub fn feature_matrix(array: &ArrayRef) -> Option<FeatureMatrix> {
    if is_scalar_numeric(array.data_type()) {
        let values = cast(array, &DataType::Float64).ok()?;
        let values = values.as_primitive::<Float64Type>();
        let data: Vec<f64> = (0..values.len())
            .filter(|&i| values.is_valid(i))
            .map(|i| values.value(i))
            .collect();
        return Some(FeatureMatrix {
            rows: data.len(),
            cols: 1,
            data,
        });
    }

    let mut rows = Vec::with_capacity(array.len());
    for i in 0..array.len() {
        if array.is_null(i) {
            continue;
        }
        rows.push(flatten(&list_value(array, i)?)?);
    }
    let cols = rows.first().map_or(0, Vec::len);
    if rows.iter().any(|r| r.len() != cols) {
        return None;
    }
    Some(FeatureMatrix::from_rows(rows))
}

fn is_scalar_numeric(dt: &DataType) -> bool {
    dt.is_numeric() || matches!(dt, DataType::Boolean)
}

fn list_value(array: &ArrayRef, i: usize) -> Option<ArrayRef> {
    match array.data_type() {
        DataType::List(_) => Some(array.as_list::<i32>().value(i)),
        DataType::LargeList(_) => Some(array.as_list::<i64>().value(i)),
        DataType::FixedSizeList(_, _) => Some(array.as_fixed_size_list().value(i)),
        _ => None,
    }
}

/// Flatten one list cell into row-major values.
fn flatten(array: &ArrayRef) -> Option<Vec<f64>> {
    if is_scalar_numeric(array.data_type()) {
        let values = cast(array, &DataType::Float64).ok()?;
        let values = values.as_primitive::<Float64Type>();
        return Some(
            (0..values.len())
                .map(|i| {
                    if values.is_valid(i) {
                        values.value(i)
                    } else {
                        f64::NAN
                    }
                })
                .collect(),
        );
    }
    let mut out = Vec::new();
    for i in 0..array.len() {
        out.extend(flatten(&list_value(array, i)?)?);
    }
    Some(out)
}
