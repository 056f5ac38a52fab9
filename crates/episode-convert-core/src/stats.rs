//! Statistics computed during conversion.
//!
//! - [`quantile`]: per-dimension quantiles of a feature matrix.
//! - [`columns`]: extraction of feature matrices from Arrow columns.
//! - [`aggregate`]: quantile augmentation of episode statistics and the
//!   count-weighted dataset-wide aggregate.

pub mod aggregate;
pub mod columns;
pub mod quantile;

pub use aggregate::{
    AugmentedStats, StatsError, StatsInconsistency, StatsResult, aggregate_global_stats,
    augment_episode_stats,
};
pub use columns::{FeatureMatrix, feature_matrix};
pub use quantile::{QUANTILE_LEVELS, QuantileError, compute_quantiles, quantile_sorted};
