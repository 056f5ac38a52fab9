//! Conversion options.

use serde::{Deserialize, Serialize};

use crate::consolidate::FileLimits;

/// Chunking parameters of the target layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Files per `chunk-XXX` directory.
    pub chunks_size: u64,
    /// Target size of one data file, in MiB of source data.
    pub data_files_size_in_mb: u64,
    /// Target size of one video container, in MiB of source video.
    pub video_files_size_in_mb: u64,
    /// Optional hard cap on rows per data file.
    pub max_rows_per_file: Option<u64>,
    /// Episodes per episode metadata file.
    pub episodes_per_meta_file: u64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunks_size: 1000,
            data_files_size_in_mb: 200,
            video_files_size_in_mb: 200,
            max_rows_per_file: None,
            episodes_per_meta_file: 1000,
        }
    }
}

impl ChunkingConfig {
    /// File limits for the tabular consolidator.
    pub fn data_limits(&self) -> FileLimits {
        FileLimits::from_mb(
            self.data_files_size_in_mb,
            self.max_rows_per_file,
            self.chunks_size,
        )
    }

    /// File limits for the video consolidator.
    pub fn video_limits(&self) -> FileLimits {
        FileLimits::from_mb(self.video_files_size_in_mb, None, self.chunks_size)
    }
}

/// Options of one conversion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertOptions {
    /// Target chunking.
    pub chunking: ChunkingConfig,
    /// Remove an existing, non-empty destination instead of refusing it.
    pub overwrite: bool,
}
