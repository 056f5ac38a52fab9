//! Dataset descriptor (`meta/info.json`) and feature schema.
//!
//! Only the fields the conversion reads or rewrites are typed; every other
//! top-level field is carried through verbatim in `extra`.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Dataset-wide configuration record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetInfo {
    /// Layout version tag, for example `"v2.1"`.
    pub codebase_version: String,

    /// Robot type, informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot_type: Option<String>,

    /// Total number of episodes.
    pub total_episodes: u64,

    /// Total number of frames across all episodes.
    pub total_frames: u64,

    /// Number of distinct tasks.
    #[serde(default)]
    pub total_tasks: u64,

    /// v2.1 only: number of chunk directories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u64>,

    /// v2.1: episodes per chunk directory. v3.0: files per chunk directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks_size: Option<u64>,

    /// v3.0 only: target size of one data file in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_files_size_in_mb: Option<u64>,

    /// v3.0 only: target size of one video file in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_files_size_in_mb: Option<u64>,

    /// Sampling rate in frames per second.
    pub fps: u32,

    /// Path template for tabular data files.
    pub data_path: String,

    /// Path template for video files (absent for datasets without video).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_path: Option<String>,

    /// Feature schema keyed by feature name.
    pub features: BTreeMap<String, FeatureSpec>,

    /// Every other top-level field, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DatasetInfo {
    /// Names of all video-backed features (camera streams), in name order.
    pub fn video_keys(&self) -> Vec<String> {
        self.features
            .iter()
            .filter(|(_, spec)| spec.dtype == FeatureDtype::Video)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Semantic role of `feature`, or `None` if it is not in the schema.
    pub fn role_of(&self, feature: &str) -> Option<FeatureRole> {
        self.features
            .get(feature)
            .map(|spec| FeatureRole::classify(feature, &spec.dtype))
    }
}

/// One entry of the feature schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureSpec {
    /// Element data type.
    pub dtype: FeatureDtype,

    /// Fixed shape of one frame's value.
    pub shape: Vec<usize>,

    /// Optional per-dimension names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub names: Option<Value>,

    /// Optional encoder information (video features).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
}

/// Element data type of a feature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FeatureDtype {
    /// `bool`
    Bool,
    /// `int8` .. `int64`, `uint8` .. `uint64`
    Int(String),
    /// `float16`, `float32`, `float64`
    Float(String),
    /// `string`
    String,
    /// Still image stored inline.
    Image,
    /// Opaque reference into a video container.
    Video,
    /// Any dtype this crate does not interpret, kept verbatim.
    Other(String),
}

impl FeatureDtype {
    /// Whether raw values of this dtype are numeric and can feed quantiles.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            FeatureDtype::Bool | FeatureDtype::Int(_) | FeatureDtype::Float(_)
        )
    }
}

impl From<String> for FeatureDtype {
    fn from(s: String) -> Self {
        match s.as_str() {
            "bool" => FeatureDtype::Bool,
            "string" => FeatureDtype::String,
            "image" => FeatureDtype::Image,
            "video" => FeatureDtype::Video,
            "int8" | "int16" | "int32" | "int64" | "uint8" | "uint16" | "uint32" | "uint64" => {
                FeatureDtype::Int(s)
            }
            "float16" | "float32" | "float64" => FeatureDtype::Float(s),
            _ => FeatureDtype::Other(s),
        }
    }
}

impl From<FeatureDtype> for String {
    fn from(d: FeatureDtype) -> Self {
        match d {
            FeatureDtype::Bool => "bool".to_string(),
            FeatureDtype::String => "string".to_string(),
            FeatureDtype::Image => "image".to_string(),
            FeatureDtype::Video => "video".to_string(),
            FeatureDtype::Int(s) | FeatureDtype::Float(s) | FeatureDtype::Other(s) => s,
        }
    }
}

impl fmt::Display for FeatureDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from(self.clone()))
    }
}

/// Semantic role of a feature, derived from its name and dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureRole {
    /// Camera stream or inline image.
    Video,
    /// Commanded action.
    Action,
    /// Proprioceptive state.
    State,
    /// Any other observation.
    Observation,
    /// Frame bookkeeping (`timestamp`, `index`, ...).
    Metadata,
}

impl FeatureRole {
    /// Classify a feature by dtype first, then by naming convention.
    pub fn classify(name: &str, dtype: &FeatureDtype) -> FeatureRole {
        if matches!(dtype, FeatureDtype::Video | FeatureDtype::Image) {
            FeatureRole::Video
        } else if name == "action" || name.starts_with("action.") {
            FeatureRole::Action
        } else if name.starts_with("observation.state") {
            FeatureRole::State
        } else if name.starts_with("observation.") {
            FeatureRole::Observation
        } else {
            FeatureRole::Metadata
        }
    }
}
