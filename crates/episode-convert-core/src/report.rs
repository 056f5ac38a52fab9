//! Provenance report written to `meta/conversion_report.json`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    consolidate::DegradedVideo, layout::FileLocator, metadata::FeatureRole,
    options::ConvertOptions, stats::StatsInconsistency,
};

/// Identifier of the quantile estimator, recorded in provenance.
pub const QUANTILE_METHOD: &str = "linear_interpolation";

/// Policy used for features whose raw values are not tabular.
pub const PLACEHOLDER_POLICY: &str = "q01=q10=min, q50=mean, q90=q99=max";

/// Summary of one conversion run.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionReport {
    /// Layout version read.
    pub source_version: String,
    /// Layout version written.
    pub target_version: String,
    /// Source root.
    pub source: String,
    /// Destination root.
    pub destination: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Options the run was started with.
    pub options: ConvertOptions,

    /// Episodes converted.
    pub total_episodes: u64,
    /// Frames converted.
    pub total_frames: u64,
    /// Tasks in the vocabulary.
    pub total_tasks: u64,
    /// Role of every feature in the schema.
    pub feature_roles: BTreeMap<String, FeatureRole>,

    /// Consolidated data files.
    pub data_files: Vec<FileLocator>,
    /// Consolidated video containers per camera stream.
    pub video_files: BTreeMap<String, Vec<FileLocator>>,
    /// Episode metadata files.
    pub episode_meta_files: Vec<FileLocator>,

    /// How per-episode quantiles were estimated.
    pub quantile_method: String,
    /// How global `std` was combined.
    pub std_method: String,
    /// What replaces quantiles that cannot be computed.
    pub placeholder_policy: String,
    /// Episodes that received placeholder quantiles, per feature.
    pub placeholder_quantiles: BTreeMap<String, Vec<u64>>,

    /// Episodes skipped while aggregating a feature.
    pub statistics_inconsistencies: Vec<StatsInconsistency>,
    /// Episodes whose footage is missing from the consolidated video.
    pub degraded_videos: Vec<DegradedVideo>,
}

impl ConversionReport {
    /// Whether every episode was converted without loss or approximation
    /// beyond the documented placeholder policy.
    pub fn is_clean(&self) -> bool {
        self.statistics_inconsistencies.is_empty() && self.degraded_videos.is_empty()
    }
}
