//! Descriptor rewrite from the source layout to the target layout.

use crate::{
    layout::{TARGET_DATA_PATH_TEMPLATE, TARGET_VERSION, TARGET_VIDEO_PATH_TEMPLATE},
    metadata::DatasetInfo,
    options::ChunkingConfig,
};

/// Derive the target descriptor from the source one.
///
/// Version tag, path templates and chunking fields are replaced;
/// `total_chunks` is dropped. Features, fps and every unrecognized field are
/// kept as they are.
pub fn transform_descriptor(source: &DatasetInfo, chunking: &ChunkingConfig) -> DatasetInfo {
    let mut info = source.clone();
    info.codebase_version = TARGET_VERSION.to_string();
    info.data_path = TARGET_DATA_PATH_TEMPLATE.to_string();
    info.video_path = (!source.video_keys().is_empty())
        .then(|| TARGET_VIDEO_PATH_TEMPLATE.to_string());
    info.total_chunks = None;
    info.chunks_size = Some(chunking.chunks_size);
    info.data_files_size_in_mb = Some(chunking.data_files_size_in_mb);
    info.video_files_size_in_mb = Some(chunking.video_files_size_in_mb);
    info
}

/// `info` with totals taken from what was actually converted.
pub fn with_totals(
    mut info: DatasetInfo,
    total_episodes: u64,
    total_frames: u64,
    total_tasks: u64,
) -> DatasetInfo {
    info.total_episodes = total_episodes;
    info.total_frames = total_frames;
    info.total_tasks = total_tasks;
    info
}
