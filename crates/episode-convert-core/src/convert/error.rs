//! Error types for the conversion orchestrator.
//!
//! [`ConvertError`] wraps whatever a component reported; [`ErrorKind`]
//! classifies it for callers that only care about the category. A failed
//! run is reported as a [`ConversionFailure`] carrying the stage that was
//! being attempted.

use std::fmt;

use snafu::prelude::*;

use crate::{
    consolidate::{TabularError, VideoError},
    episodes_table::MetaTableError,
    loader::LoadError,
    stats::StatsError,
    storage::StorageError,
};

/// Category of a conversion problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A required source file is absent.
    MissingArtifact,
    /// A source record is unparseable or incomplete.
    MalformedRecord,
    /// Source records contradict each other.
    SchemaViolation,
    /// Episode statistics cannot be combined.
    StatisticsInconsistency,
    /// Source episode data cannot be consolidated.
    ConsolidationError,
    /// Consolidated footage is incomplete. Only ever reported, never fatal.
    DegradedArtifact,
    /// Writing the destination failed.
    Storage,
    /// The destination cannot be used.
    InvalidDestination,
}

impl ErrorKind {
    /// Whether this kind aborts a run.
    pub fn is_fatal(self) -> bool {
        !matches!(self, ErrorKind::DegradedArtifact)
    }
}

/// Errors from a conversion run.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConvertError {
    /// Loading the source metadata failed.
    #[snafu(display("{source}"))]
    Load {
        /// Underlying loader error.
        source: LoadError,
    },

    /// Tabular consolidation failed.
    #[snafu(display("{source}"))]
    Tabular {
        /// Underlying consolidation error.
        #[snafu(source(from(TabularError, Box::new)))]
        source: Box<TabularError>,
    },

    /// Video consolidation failed for a reason other than the encoder.
    #[snafu(display("Camera stream {video_key}: {source}"))]
    Video {
        /// Camera stream.
        video_key: String,
        /// Underlying consolidation error.
        source: VideoError,
    },

    /// Global statistics could not be aggregated.
    #[snafu(display("{source}"))]
    Statistics {
        /// Underlying aggregation error.
        source: StatsError,
    },

    /// Writing a metadata table failed.
    #[snafu(display("{source}"))]
    MetaTable {
        /// Underlying table error.
        source: MetaTableError,
    },

    /// Writing a metadata document failed.
    #[snafu(display("Cannot write {path}: {source}"))]
    WriteMetadata {
        /// Relative path of the document.
        path: String,
        /// Underlying storage error.
        source: StorageError,
    },

    /// Serializing a metadata document failed.
    #[snafu(display("Cannot serialize {path}: {source}"))]
    Serialize {
        /// Relative path of the document.
        path: String,
        /// Underlying serde error.
        source: serde_json::Error,
    },

    /// Inspecting or clearing the destination failed.
    #[snafu(display("Cannot prepare destination {path}: {source}"))]
    PrepareDestination {
        /// Destination root.
        path: String,
        /// Underlying storage error.
        source: StorageError,
    },

    /// The destination already holds files and overwriting was not asked for.
    #[snafu(display("Destination {path} is not empty; pass overwrite to replace it"))]
    DestinationNotEmpty {
        /// Destination root.
        path: String,
    },

    /// Source and destination overlap.
    #[snafu(display("Destination {destination} overlaps source {source_root}"))]
    OverlappingRoots {
        /// Source root.
        source_root: String,
        /// Destination root.
        destination: String,
    },
}

impl ConvertError {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvertError::Load { source } => match source {
                LoadError::MissingArtifact { .. } => ErrorKind::MissingArtifact,
                LoadError::MalformedRecord { .. } | LoadError::PathTemplate { .. } => {
                    ErrorKind::MalformedRecord
                }
                LoadError::SchemaViolation { .. } => ErrorKind::SchemaViolation,
                LoadError::Storage { .. } => ErrorKind::Storage,
            },
            ConvertError::Tabular { source } => match source.as_ref() {
                TabularError::Write { .. }
                | TabularError::Commit { .. }
                | TabularError::TargetPath { .. } => ErrorKind::Storage,
                _ => ErrorKind::ConsolidationError,
            },
            ConvertError::Video { source, .. } => match source {
                VideoError::ReadSource { .. } => ErrorKind::ConsolidationError,
                VideoError::WriteTarget { .. } | VideoError::VideoPath { .. } => {
                    ErrorKind::Storage
                }
            },
            ConvertError::Statistics { .. } => ErrorKind::StatisticsInconsistency,
            ConvertError::MetaTable { .. }
            | ConvertError::WriteMetadata { .. }
            | ConvertError::Serialize { .. }
            | ConvertError::PrepareDestination { .. } => ErrorKind::Storage,
            ConvertError::DestinationNotEmpty { .. } | ConvertError::OverlappingRoots { .. } => {
                ErrorKind::InvalidDestination
            }
        }
    }
}

/// Progress of a conversion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConversionStage {
    /// Nothing done yet.
    Init,
    /// Source metadata loaded and cross-checked.
    MetadataLoaded,
    /// Tabular data consolidated.
    DataConsolidated,
    /// Every camera stream consolidated.
    VideoConsolidated,
    /// Global statistics computed.
    StatisticsAggregated,
    /// Metadata files written, descriptor last.
    MetadataWritten,
    /// Run complete.
    Done,
}

impl ConversionStage {
    /// The stage that follows this one.
    pub fn next(self) -> ConversionStage {
        match self {
            ConversionStage::Init => ConversionStage::MetadataLoaded,
            ConversionStage::MetadataLoaded => ConversionStage::DataConsolidated,
            ConversionStage::DataConsolidated => ConversionStage::VideoConsolidated,
            ConversionStage::VideoConsolidated => ConversionStage::StatisticsAggregated,
            ConversionStage::StatisticsAggregated => ConversionStage::MetadataWritten,
            ConversionStage::MetadataWritten | ConversionStage::Done => ConversionStage::Done,
        }
    }
}

impl fmt::Display for ConversionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConversionStage::Init => "init",
            ConversionStage::MetadataLoaded => "metadata loading",
            ConversionStage::DataConsolidated => "data consolidation",
            ConversionStage::VideoConsolidated => "video consolidation",
            ConversionStage::StatisticsAggregated => "statistics aggregation",
            ConversionStage::MetadataWritten => "metadata writing",
            ConversionStage::Done => "done",
        };
        f.write_str(s)
    }
}

/// A failed conversion run.
#[derive(Debug, Snafu)]
#[snafu(display("Conversion failed during {stage}: {source}"))]
pub struct ConversionFailure {
    /// Stage being attempted when the run failed.
    pub stage: ConversionStage,
    /// What went wrong.
    pub source: ConvertError,
}

impl ConversionFailure {
    /// Category of the underlying error.
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}
