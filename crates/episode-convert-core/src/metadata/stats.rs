//! Statistics records: per-episode feature statistics and their global
//! aggregate.
//!
//! Statistic values are stored as [`StatArray`]: a flat `f64` buffer plus the
//! shape of the nested JSON list it was read from, so an image feature's
//! per-channel `[[[0.1]], [[0.2]], [[0.3]]]` round-trips with shape
//! `[3, 1, 1]`.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};
use serde_json::{Number, Value};

/// Names of the five quantile statistics, in level order.
pub const QUANTILE_NAMES: [&str; 5] = ["q01", "q10", "q50", "q90", "q99"];

/// Shaped array of statistic values.
#[derive(Debug, Clone, PartialEq)]
pub struct StatArray {
    shape: Vec<usize>,
    values: Vec<f64>,
}

impl StatArray {
    /// Build from a shape and row-major values. Returns `None` if the
    /// element count does not match the shape.
    pub fn new(shape: Vec<usize>, values: Vec<f64>) -> Option<Self> {
        let expected: usize = shape.iter().product();
        (expected == values.len()).then_some(Self { shape, values })
    }

    /// One-dimensional array.
    pub fn vector(values: Vec<f64>) -> Self {
        Self {
            shape: vec![values.len()],
            values,
        }
    }

    /// Shape of the nested representation.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Row-major values.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the array holds no elements.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// A copy of `values` shaped like `self`, if the element counts agree.
    pub fn with_shape_of(&self, values: Vec<f64>) -> Option<StatArray> {
        StatArray::new(self.shape.clone(), values)
    }

    /// Parse a nested JSON list (or a bare number).
    ///
    /// `null` entries are read as NaN since JSON cannot carry non-finite
    /// floats.
    pub fn from_json(value: &Value) -> Result<Self, String> {
        let mut shape = Vec::new();
        let mut values = Vec::new();
        collect_shape(value, &mut shape)?;
        flatten_into(value, &shape, 0, &mut values)?;
        Ok(Self { shape, values })
    }

    /// Render back into nested JSON lists.
    pub fn to_json(&self) -> Value {
        if self.shape.is_empty() {
            return self.values.first().map(|v| f64_to_json(*v)).unwrap_or(Value::Null);
        }
        let mut iter = self.values.iter().copied();
        nest(&self.shape, &mut iter)
    }
}

fn f64_to_json(v: f64) -> Value {
    Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

fn collect_shape(value: &Value, shape: &mut Vec<usize>) -> Result<(), String> {
    match value {
        Value::Array(items) => {
            shape.push(items.len());
            match items.first() {
                Some(first) => collect_shape(first, shape),
                None => Ok(()),
            }
        }
        Value::Number(_) | Value::Null => Ok(()),
        other => Err(format!("expected number or list, found {other}")),
    }
}

fn flatten_into(
    value: &Value,
    shape: &[usize],
    depth: usize,
    out: &mut Vec<f64>,
) -> Result<(), String> {
    match value {
        Value::Array(items) => {
            if depth >= shape.len() || items.len() != shape[depth] {
                return Err("ragged nested list".to_string());
            }
            for item in items {
                flatten_into(item, shape, depth + 1, out)?;
            }
            Ok(())
        }
        Value::Number(n) if depth == shape.len() => {
            let v = n
                .as_f64()
                .ok_or_else(|| format!("number {n} is not representable as f64"))?;
            out.push(v);
            Ok(())
        }
        Value::Null if depth == shape.len() => {
            out.push(f64::NAN);
            Ok(())
        }
        _ => Err("ragged nested list".to_string()),
    }
}

fn nest(shape: &[usize], iter: &mut impl Iterator<Item = f64>) -> Value {
    match shape.split_first() {
        None => iter.next().map(f64_to_json).unwrap_or(Value::Null),
        Some((&n, rest)) => Value::Array((0..n).map(|_| nest(rest, iter)).collect()),
    }
}

impl Serialize for StatArray {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StatArray {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        StatArray::from_json(&value).map_err(D::Error::custom)
    }
}

/// Counts are stored as a flat list of non-negative integers. A bare integer
/// or a nested list is accepted on input.
fn deserialize_counts<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u64>, D::Error> {
    let array = StatArray::deserialize(deserializer)?;
    array
        .values()
        .iter()
        .map(|&v| {
            if v.is_finite() && v >= 0.0 && v.fract() == 0.0 {
                Ok(v as u64)
            } else {
                Err(D::Error::custom(format!(
                    "count must be a non-negative integer, found {v}"
                )))
            }
        })
        .collect()
}

/// Statistics of one feature within one episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    /// Element-wise minimum.
    pub min: StatArray,
    /// Element-wise maximum.
    pub max: StatArray,
    /// Element-wise mean.
    pub mean: StatArray,
    /// Element-wise standard deviation.
    pub std: StatArray,
    /// Number of contributing values (one entry, or one per element).
    #[serde(deserialize_with = "deserialize_counts")]
    pub count: Vec<u64>,

    /// 1st percentile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q01: Option<StatArray>,
    /// 10th percentile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q10: Option<StatArray>,
    /// Median.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q50: Option<StatArray>,
    /// 90th percentile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q90: Option<StatArray>,
    /// 99th percentile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q99: Option<StatArray>,
}

impl FeatureStats {
    /// Check internal consistency: min/max/mean/std share one shape, counts
    /// are positive and either one entry or one per element.
    pub fn validate(&self) -> Result<(), String> {
        let shape = self.min.shape();
        for (name, arr) in [("max", &self.max), ("mean", &self.mean), ("std", &self.std)] {
            if arr.shape() != shape {
                return Err(format!(
                    "{name} has shape {:?} but min has shape {shape:?}",
                    arr.shape()
                ));
            }
        }
        if self.count.is_empty() {
            return Err("count is empty".to_string());
        }
        if self.count.contains(&0) {
            return Err("count must be positive".to_string());
        }
        if self.count.len() != 1 && self.count.len() != self.min.len() {
            return Err(format!(
                "count has {} entries but statistics have {} elements",
                self.count.len(),
                self.min.len()
            ));
        }
        Ok(())
    }

    /// Attach quantiles, replacing any existing ones.
    pub fn set_quantiles(&mut self, q: Quantiles) {
        let [q01, q10, q50, q90, q99] = q.levels;
        self.q01 = Some(q01);
        self.q10 = Some(q10);
        self.q50 = Some(q50);
        self.q90 = Some(q90);
        self.q99 = Some(q99);
    }

    /// Whether all five quantiles are present.
    pub fn has_quantiles(&self) -> bool {
        self.q01.is_some()
            && self.q10.is_some()
            && self.q50.is_some()
            && self.q90.is_some()
            && self.q99.is_some()
    }

    /// Every statistic as `(name, values)` in output column order. Counts
    /// are reported separately by [`FeatureStats::count`].
    pub fn named_arrays(&self) -> Vec<(&'static str, &StatArray)> {
        let mut out = vec![
            ("min", &self.min),
            ("max", &self.max),
            ("mean", &self.mean),
            ("std", &self.std),
        ];
        let quantiles = [&self.q01, &self.q10, &self.q50, &self.q90, &self.q99];
        for (name, q) in QUANTILE_NAMES.iter().zip(quantiles) {
            if let Some(arr) = q {
                out.push((*name, arr));
            }
        }
        out
    }
}

/// Five quantile arrays in [`QUANTILE_NAMES`] order.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantiles {
    /// `[q01, q10, q50, q90, q99]`
    pub levels: [StatArray; 5],
}

/// Statistics for every feature of one episode.
pub type EpisodeStats = BTreeMap<String, FeatureStats>;

/// Dataset-wide statistics of one feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSummary {
    /// Element-wise minimum over all episodes.
    pub min: StatArray,
    /// Element-wise maximum over all episodes.
    pub max: StatArray,
    /// Count-weighted mean of episode means.
    pub mean: StatArray,
    /// Square root of the count-weighted mean of episode variances.
    pub std: StatArray,
    /// Sum of episode counts.
    #[serde(deserialize_with = "deserialize_counts")]
    pub count: Vec<u64>,
}

/// Dataset-wide statistics keyed by feature name (`meta/stats.json`).
pub type GlobalStats = BTreeMap<String, FeatureSummary>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_arrays_round_trip_with_shape() -> Result<(), String> {
        let v = json!([[[0.25]], [[0.5]], [[0.75]]]);
        let arr = StatArray::from_json(&v)?;
        assert_eq!(arr.shape(), &[3, 1, 1]);
        assert_eq!(arr.values(), &[0.25, 0.5, 0.75]);
        assert_eq!(arr.to_json(), v);

        let scalar = StatArray::from_json(&json!(4.0))?;
        assert!(scalar.shape().is_empty());
        assert_eq!(scalar.to_json(), json!(4.0));
        Ok(())
    }

    #[test]
    fn ragged_lists_are_rejected() {
        assert!(StatArray::from_json(&json!([[1.0, 2.0], [3.0]])).is_err());
        assert!(StatArray::from_json(&json!([1.0, [2.0]])).is_err());
        assert!(StatArray::from_json(&json!("x")).is_err());
    }

    #[test]
    fn feature_stats_parse_and_validate() -> Result<(), Box<dyn std::error::Error>> {
        let stats: FeatureStats = serde_json::from_value(json!({
            "min": [0.0, 1.0], "max": [2.0, 3.0],
            "mean": [1.0, 2.0], "std": [0.5, 0.5],
            "count": [10]
        }))?;
        assert_eq!(stats.count, vec![10]);
        assert!(stats.validate().is_ok());
        assert!(!stats.has_quantiles());

        let bad: FeatureStats = serde_json::from_value(json!({
            "min": [0.0, 1.0], "max": [2.0],
            "mean": [1.0, 2.0], "std": [0.5, 0.5],
            "count": [10]
        }))?;
        assert!(bad.validate().is_err());

        let zero: FeatureStats = serde_json::from_value(json!({
            "min": [0.0], "max": [2.0], "mean": [1.0], "std": [0.5], "count": 0
        }))?;
        assert!(zero.validate().is_err());

        let negative = serde_json::from_value::<FeatureStats>(json!({
            "min": [0.0], "max": [2.0], "mean": [1.0], "std": [0.5], "count": [-1]
        }));
        assert!(negative.is_err());
        Ok(())
    }

    #[test]
    fn quantiles_serialize_after_base_stats() -> Result<(), Box<dyn std::error::Error>> {
        let mut stats: FeatureStats = serde_json::from_value(json!({
            "min": [0.0], "max": [4.0], "mean": [2.0], "std": [1.0], "count": [5]
        }))?;
        stats.set_quantiles(Quantiles {
            levels: [
                StatArray::vector(vec![0.1]),
                StatArray::vector(vec![0.5]),
                StatArray::vector(vec![2.0]),
                StatArray::vector(vec![3.5]),
                StatArray::vector(vec![3.9]),
            ],
        });
        assert!(stats.has_quantiles());

        let names: Vec<&str> = stats.named_arrays().iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            vec!["min", "max", "mean", "std", "q01", "q10", "q50", "q90", "q99"]
        );

        let value = serde_json::to_value(&stats)?;
        assert_eq!(value["q50"], json!([2.0]));
        assert_eq!(value["count"], json!([5]));
        Ok(())
    }
}
