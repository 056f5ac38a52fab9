//! Pure data model of a dataset: descriptor, episodes, tasks and statistics.
//!
//! Nothing in this module performs IO; loading lives in [`crate::loader`] and
//! writing in [`crate::convert`].

pub mod descriptor;
pub mod episodes;
pub mod stats;

pub use descriptor::{DatasetInfo, FeatureDtype, FeatureRole, FeatureSpec};
pub use episodes::{EpisodeRecord, EpisodeStatsRecord, TaskRecord, TaskVocabulary};
pub use stats::{EpisodeStats, FeatureStats, FeatureSummary, GlobalStats, Quantiles, StatArray};
