//! Quantile augmentation of episode statistics and the dataset-wide
//! aggregate.
//!
//! Global statistics are derived only from episode statistics, never by
//! re-reading raw data:
//!
//! - `min`/`max`: element-wise extrema across episodes.
//! - `count`: element-wise sum.
//! - `mean`: `Σ(mean_i · count_i) / Σ count_i`.
//! - `std`: `sqrt(Σ(std_i² · count_i) / Σ count_i)`, the pooled
//!   within-episode variance. The between-episode spread of means is not
//!   included; [`STD_METHOD`] names this in the conversion report.

use std::collections::BTreeMap;

use log::warn;
use serde::Serialize;
use snafu::prelude::*;

use crate::metadata::{
    EpisodeStats, FeatureSpec, FeatureStats, FeatureSummary, GlobalStats, Quantiles, StatArray,
};

/// Identifier of the global `std` formula, recorded in provenance.
pub const STD_METHOD: &str = "pooled_within_episode_variance";

/// Fatal aggregation errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StatsError {
    /// Two episodes disagree on the shape of one feature's statistics.
    #[snafu(display(
        "Feature {feature:?}: episode {episode_index} has statistics shaped {found:?}, \
         expected {expected:?}"
    ))]
    ShapeMismatch {
        /// Feature name.
        feature: String,
        /// Offending episode.
        episode_index: u64,
        /// Shape established by the first episode.
        expected: Vec<usize>,
        /// Shape found.
        found: Vec<usize>,
    },
}

/// Result alias for aggregation.
pub type StatsResult<T> = Result<T, StatsError>;

/// Non-fatal finding: an episode lacks statistics for a feature that other
/// episodes report. The episode is skipped for that feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsInconsistency {
    /// Feature name.
    pub feature: String,
    /// Episode lacking the feature.
    pub episode_index: u64,
}

/// Episode statistics after quantile augmentation.
#[derive(Debug, Clone, PartialEq)]
pub struct AugmentedStats {
    /// Statistics with all five quantiles set for every feature.
    pub stats: EpisodeStats,
    /// Features whose quantiles came from the placeholder policy.
    pub placeholder_features: Vec<String>,
}

/// Attach quantiles to a copy of `stats`.
///
/// A feature with computed quantiles whose element count matches its `min`
/// gets them reshaped to that shape. A feature without usable quantiles
/// keeps quantiles it already carries, or else receives the placeholder
/// `q01 = q10 = min`, `q50 = mean`, `q90 = q99 = max`.
pub fn augment_episode_stats(
    stats: &EpisodeStats,
    quantiles: &BTreeMap<String, [Vec<f64>; 5]>,
) -> AugmentedStats {
    let mut out = stats.clone();
    let mut placeholder_features = Vec::new();

    for (feature, fs) in out.iter_mut() {
        let computed = quantiles.get(feature).and_then(|levels| reshape(&fs.min, levels));
        match computed {
            Some(q) => fs.set_quantiles(q),
            None if fs.has_quantiles() => {}
            None => {
                let q = placeholder_quantiles(fs);
                fs.set_quantiles(q);
                placeholder_features.push(feature.clone());
            }
        }
    }

    AugmentedStats {
        stats: out,
        placeholder_features,
    }
}

fn reshape(like: &StatArray, levels: &[Vec<f64>; 5]) -> Option<Quantiles> {
    let [a, b, c, d, e] = levels;
    Some(Quantiles {
        levels: [
            like.with_shape_of(a.clone())?,
            like.with_shape_of(b.clone())?,
            like.with_shape_of(c.clone())?,
            like.with_shape_of(d.clone())?,
            like.with_shape_of(e.clone())?,
        ],
    })
}

fn placeholder_quantiles(fs: &FeatureStats) -> Quantiles {
    Quantiles {
        levels: [
            fs.min.clone(),
            fs.min.clone(),
            fs.mean.clone(),
            fs.max.clone(),
            fs.max.clone(),
        ],
    }
}

/// Per-element weights of one episode's statistics.
fn weights(fs: &FeatureStats) -> Vec<f64> {
    if fs.count.len() == 1 {
        vec![fs.count[0] as f64; fs.min.len()]
    } else {
        fs.count.iter().map(|&c| c as f64).collect()
    }
}

struct Accumulator<'a> {
    shape: &'a [usize],
    min: Vec<f64>,
    max: Vec<f64>,
    weighted_mean: Vec<f64>,
    weighted_var: Vec<f64>,
    total: Vec<f64>,
    per_element_counts: bool,
}

impl<'a> Accumulator<'a> {
    fn new(first: &'a FeatureStats) -> Self {
        let n = first.min.len();
        Self {
            shape: first.min.shape(),
            min: vec![f64::INFINITY; n],
            max: vec![f64::NEG_INFINITY; n],
            weighted_mean: vec![0.0; n],
            weighted_var: vec![0.0; n],
            total: vec![0.0; n],
            per_element_counts: false,
        }
    }

    fn add(&mut self, fs: &FeatureStats) {
        let w = weights(fs);
        self.per_element_counts |= fs.count.len() != 1;
        for i in 0..self.min.len() {
            self.min[i] = self.min[i].min(fs.min.values()[i]);
            self.max[i] = self.max[i].max(fs.max.values()[i]);
            self.weighted_mean[i] += fs.mean.values()[i] * w[i];
            let s = fs.std.values()[i];
            self.weighted_var[i] += s * s * w[i];
            self.total[i] += w[i];
        }
    }

    fn finish(self) -> FeatureSummary {
        let shaped = |values: Vec<f64>| {
            StatArray::new(self.shape.to_vec(), values.clone())
                .unwrap_or_else(|| StatArray::vector(values))
        };
        let mean: Vec<f64> = self
            .weighted_mean
            .iter()
            .zip(&self.total)
            .map(|(m, t)| m / t)
            .collect();
        let std: Vec<f64> = self
            .weighted_var
            .iter()
            .zip(&self.total)
            .map(|(v, t)| (v / t).sqrt())
            .collect();
        let count: Vec<u64> = if self.per_element_counts {
            self.total.iter().map(|&t| t as u64).collect()
        } else {
            self.total.first().map(|&t| vec![t as u64]).unwrap_or_default()
        };
        FeatureSummary {
            min: shaped(self.min.clone()),
            max: shaped(self.max.clone()),
            mean: shaped(mean),
            std: shaped(std),
            count,
        }
    }
}

/// Aggregate episode statistics into dataset-wide statistics.
///
/// Each schema feature that at least one episode reports is aggregated
/// independently. Episodes lacking such a feature are skipped for it and
/// returned as [`StatsInconsistency`] findings.
pub fn aggregate_global_stats<'a>(
    stats_by_episode: &BTreeMap<u64, &'a EpisodeStats>,
    schema: &BTreeMap<String, FeatureSpec>,
) -> StatsResult<(GlobalStats, Vec<StatsInconsistency>)> {
    let mut global = GlobalStats::new();
    let mut inconsistencies = Vec::new();

    for feature in schema.keys() {
        let mut acc: Option<Accumulator<'a>> = None;
        let mut missing = Vec::new();

        for (&episode_index, &stats) in stats_by_episode {
            let Some(fs) = stats.get(feature) else {
                missing.push(episode_index);
                continue;
            };
            let acc = acc.get_or_insert_with(|| Accumulator::new(fs));
            ensure!(
                fs.min.shape() == acc.shape,
                ShapeMismatchSnafu {
                    feature: feature.clone(),
                    episode_index,
                    expected: acc.shape.to_vec(),
                    found: fs.min.shape().to_vec(),
                }
            );
            acc.add(fs);
        }

        // Features nobody reports are not inconsistencies.
        let Some(acc) = acc else { continue };

        for episode_index in missing {
            warn!("episode {episode_index} has no statistics for {feature:?}; skipped in aggregate");
            inconsistencies.push(StatsInconsistency {
                feature: feature.clone(),
                episode_index,
            });
        }
        global.insert(feature.clone(), acc.finish());
    }

    Ok((global, inconsistencies))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn fs(value: serde_json::Value) -> FeatureStats {
        serde_json::from_value(value).expect("valid feature stats")
    }

    fn schema(names: &[&str]) -> BTreeMap<String, FeatureSpec> {
        names
            .iter()
            .map(|n| {
                let spec: FeatureSpec =
                    serde_json::from_value(json!({"dtype": "float32", "shape": [1]}))
                        .expect("valid spec");
                (n.to_string(), spec)
            })
            .collect()
    }

    fn episode(features: &[(&str, FeatureStats)]) -> EpisodeStats {
        features
            .iter()
            .map(|(n, s)| (n.to_string(), s.clone()))
            .collect()
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn count_weighted_mean_and_pooled_std() -> TestResult {
        let a = episode(&[(
            "x",
            fs(json!({"min": [0.0], "max": [2.0], "mean": [1.0], "std": [1.0], "count": [10]})),
        )]);
        let b = episode(&[(
            "x",
            fs(json!({"min": [-1.0], "max": [5.0], "mean": [2.0], "std": [2.0], "count": [30]})),
        )]);
        let by_episode = BTreeMap::from([(0, &a), (1, &b)]);

        let (global, inconsistencies) = aggregate_global_stats(&by_episode, &schema(&["x"]))?;
        assert!(inconsistencies.is_empty());
        let x = &global["x"];
        assert_eq!(x.count, vec![40]);
        assert_eq!(x.min.values(), &[-1.0]);
        assert_eq!(x.max.values(), &[5.0]);
        assert_close(x.mean.values()[0], 1.75);
        // sqrt((1*10 + 4*30) / 40)
        assert_close(x.std.values()[0], (130.0f64 / 40.0).sqrt());
        Ok(())
    }

    #[test]
    fn per_element_counts_weight_each_element() -> TestResult {
        let a = episode(&[(
            "x",
            fs(json!({"min": [0.0, 0.0], "max": [1.0, 1.0], "mean": [1.0, 1.0],
                      "std": [0.0, 0.0], "count": [1, 3]})),
        )]);
        let b = episode(&[(
            "x",
            fs(json!({"min": [0.0, 0.0], "max": [3.0, 3.0], "mean": [3.0, 3.0],
                      "std": [0.0, 0.0], "count": [1]})),
        )]);
        let by_episode = BTreeMap::from([(0, &a), (1, &b)]);

        let (global, _) = aggregate_global_stats(&by_episode, &schema(&["x"]))?;
        let x = &global["x"];
        assert_eq!(x.count, vec![2, 4]);
        assert_close(x.mean.values()[0], 2.0);
        assert_close(x.mean.values()[1], 1.5);
        Ok(())
    }

    #[test]
    fn nested_shapes_are_preserved() -> TestResult {
        let a = episode(&[(
            "img",
            fs(json!({"min": [[[0.0]], [[0.0]], [[0.0]]], "max": [[[1.0]], [[1.0]], [[1.0]]],
                      "mean": [[[0.5]], [[0.4]], [[0.3]]], "std": [[[0.1]], [[0.1]], [[0.1]]],
                      "count": [100]})),
        )]);
        let by_episode = BTreeMap::from([(0, &a)]);
        let (global, _) = aggregate_global_stats(&by_episode, &schema(&["img"]))?;
        assert_eq!(global["img"].mean.shape(), &[3, 1, 1]);
        assert_eq!(
            serde_json::to_value(&global["img"].mean)?,
            json!([[[0.5]], [[0.4]], [[0.3]]])
        );
        Ok(())
    }

    #[test]
    fn missing_feature_is_skipped_and_reported() -> TestResult {
        let x = fs(json!({"min": [0.0], "max": [1.0], "mean": [0.5], "std": [0.1], "count": [4]}));
        let a = episode(&[("x", x.clone()), ("y", x.clone())]);
        let b = episode(&[("x", x.clone())]);
        let by_episode = BTreeMap::from([(0, &a), (1, &b)]);

        let (global, inconsistencies) =
            aggregate_global_stats(&by_episode, &schema(&["x", "y", "z"]))?;
        assert_eq!(global["x"].count, vec![8]);
        assert_eq!(global["y"].count, vec![4]);
        assert!(!global.contains_key("z"));
        assert_eq!(
            inconsistencies,
            vec![StatsInconsistency {
                feature: "y".to_string(),
                episode_index: 1
            }]
        );
        Ok(())
    }

    #[test]
    fn shape_mismatch_is_fatal() {
        let a = episode(&[(
            "x",
            fs(json!({"min": [0.0], "max": [1.0], "mean": [0.5], "std": [0.1], "count": [4]})),
        )]);
        let b = episode(&[(
            "x",
            fs(json!({"min": [0.0, 0.0], "max": [1.0, 1.0], "mean": [0.5, 0.5],
                      "std": [0.1, 0.1], "count": [4]})),
        )]);
        let by_episode = BTreeMap::from([(0, &a), (1, &b)]);
        let err = aggregate_global_stats(&by_episode, &schema(&["x"])).unwrap_err();
        assert!(matches!(err, StatsError::ShapeMismatch { episode_index: 1, .. }));
    }

    #[test]
    fn augmentation_uses_computed_or_placeholder_quantiles() {
        let stats = episode(&[
            (
                "action",
                fs(json!({"min": [0.0, 1.0], "max": [4.0, 5.0], "mean": [2.0, 3.0],
                          "std": [1.0, 1.0], "count": [5]})),
            ),
            (
                "camera",
                fs(json!({"min": [[[0.1]]], "max": [[[0.9]]], "mean": [[[0.5]]],
                          "std": [[[0.2]]], "count": [5]})),
            ),
        ]);
        let computed = BTreeMap::from([(
            "action".to_string(),
            [
                vec![0.1, 1.1],
                vec![0.5, 1.5],
                vec![2.0, 3.0],
                vec![3.5, 4.5],
                vec![3.9, 4.9],
            ],
        )]);

        let augmented = augment_episode_stats(&stats, &computed);
        assert_eq!(augmented.placeholder_features, vec!["camera".to_string()]);

        let action = &augmented.stats["action"];
        assert_eq!(action.q50.as_ref().map(StatArray::values), Some(&[2.0, 3.0][..]));

        let camera = &augmented.stats["camera"];
        assert_eq!(camera.q01.as_ref(), Some(&camera.min));
        assert_eq!(camera.q10.as_ref(), Some(&camera.min));
        assert_eq!(camera.q50.as_ref(), Some(&camera.mean));
        assert_eq!(camera.q90.as_ref(), Some(&camera.max));
        assert_eq!(camera.q99.as_ref(), Some(&camera.max));

        // Input is untouched.
        assert!(!stats["action"].has_quantiles());
    }

    #[test]
    fn mismatched_quantile_width_falls_back_to_placeholder() {
        let stats = episode(&[(
            "x",
            fs(json!({"min": [0.0, 1.0], "max": [4.0, 5.0], "mean": [2.0, 3.0],
                      "std": [1.0, 1.0], "count": [5]})),
        )]);
        let computed = BTreeMap::from([("x".to_string(), std::array::from_fn(|_| vec![0.0]))]);
        let augmented = augment_episode_stats(&stats, &computed);
        assert_eq!(augmented.placeholder_features, vec!["x".to_string()]);
    }
}
