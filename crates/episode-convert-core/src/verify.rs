//! Consistency check of a converted root.
//!
//! [`verify_converted`] re-reads the target descriptor, every episode
//! metadata file and the footers of the consolidated data files, and looks
//! for data files no episode points at. Files that
//! cannot be read are errors; layout inconsistencies are collected as
//! findings in the returned [`VerifyReport`].

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use arrow::{
    array::{Array, AsArray},
    datatypes::{Float64Type, Int64Type},
    error::ArrowError,
    record_batch::RecordBatch,
};
use bytes::Bytes;
use log::{debug, info};
use parquet::{arrow::arrow_reader::ParquetRecordBatchReaderBuilder, errors::ParquetError};
use snafu::prelude::*;

use crate::{
    layout::{
        FileLocator, INFO_PATH, SOURCE_DEFAULT_CHUNKS_SIZE, TARGET_VERSION, TemplateError,
        target_data_path, target_episodes_path,
    },
    metadata::DatasetInfo,
    storage::{self, DatasetLocation, StorageError},
};

/// Tolerance when comparing timestamps of adjacent episodes.
const TIME_EPSILON: f64 = 1e-9;

/// Errors that stop verification.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum VerifyError {
    /// A file could not be read.
    #[snafu(display("Cannot read {path}: {source}"))]
    Read {
        /// Relative path.
        path: String,
        /// Underlying storage error.
        source: StorageError,
    },

    /// The descriptor is not valid JSON of the expected shape.
    #[snafu(display("Cannot parse {INFO_PATH}: {source}"))]
    Descriptor {
        /// Underlying serde error.
        source: serde_json::Error,
    },

    /// The root is not in the target layout.
    #[snafu(display("Expected codebase_version {TARGET_VERSION}, found {found:?}"))]
    Version {
        /// Version tag found.
        found: String,
    },

    /// A Parquet file could not be decoded.
    #[snafu(display("Cannot decode {path}: {source}"))]
    Decode {
        /// Relative path.
        path: String,
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// A record batch could not be read.
    #[snafu(display("Cannot read batch from {path}: {source}"))]
    Batch {
        /// Relative path.
        path: String,
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// A required episode metadata column is absent or mistyped.
    #[snafu(display("{path}: column {column} is missing or has the wrong type"))]
    Column {
        /// Relative path.
        path: String,
        /// Column name.
        column: String,
    },

    /// A target path could not be rendered.
    #[snafu(display("Cannot render target path: {source}"))]
    TargetPath {
        /// Underlying template error.
        source: TemplateError,
    },
}

/// Result alias for verification.
pub type VerifyResult<T> = Result<T, VerifyError>;

/// Outcome of a verification run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerifyReport {
    /// Episodes listed in the metadata tables.
    pub episodes: u64,
    /// Sum of episode lengths.
    pub frames: u64,
    /// Episode metadata files read.
    pub episode_meta_files: usize,
    /// Distinct data files checked.
    pub data_files: usize,
    /// Episodes without a time range, per camera stream.
    pub degraded_videos: BTreeMap<String, u64>,
    /// Inconsistencies found.
    pub problems: Vec<String>,
}

impl VerifyReport {
    /// Whether no inconsistency was found.
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct VideoCell {
    locator: FileLocator,
    time: Option<(f64, f64)>,
}

#[derive(Debug, Clone)]
struct MetaRow {
    episode_index: u64,
    length: u64,
    data: FileLocator,
    from: u64,
    to: u64,
    videos: BTreeMap<String, VideoCell>,
}

async fn read_parquet(
    location: &DatasetLocation,
    rel: &Path,
) -> VerifyResult<Vec<RecordBatch>> {
    let path = rel.display().to_string();
    let raw = storage::read_all_bytes(location, rel)
        .await
        .context(ReadSnafu { path: &path })?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(raw))
        .and_then(|b| b.build())
        .context(DecodeSnafu { path: &path })?;
    reader
        .collect::<Result<Vec<_>, _>>()
        .context(BatchSnafu { path })
}

fn ints(batch: &RecordBatch, path: &str, column: &str) -> VerifyResult<Vec<Option<u64>>> {
    let array = batch
        .column_by_name(column)
        .and_then(|c| c.as_primitive_opt::<Int64Type>())
        .context(ColumnSnafu { path, column })?;
    Ok((0..array.len())
        .map(|i| {
            (!array.is_null(i))
                .then(|| u64::try_from(array.value(i)).ok())
                .flatten()
        })
        .collect())
}

fn floats(batch: &RecordBatch, path: &str, column: &str) -> VerifyResult<Vec<Option<f64>>> {
    let array = batch
        .column_by_name(column)
        .and_then(|c| c.as_primitive_opt::<Float64Type>())
        .context(ColumnSnafu { path, column })?;
    Ok((0..array.len())
        .map(|i| (!array.is_null(i)).then(|| array.value(i)))
        .collect())
}

fn required(value: Option<u64>, path: &str, column: &str) -> VerifyResult<u64> {
    value.context(ColumnSnafu { path, column })
}

fn meta_rows(
    batch: &RecordBatch,
    path: &str,
    video_keys: &[String],
) -> VerifyResult<Vec<MetaRow>> {
    let episode_index = ints(batch, path, "episode_index")?;
    let length = ints(batch, path, "length")?;
    let chunk = ints(batch, path, "data/chunk_index")?;
    let file = ints(batch, path, "data/file_index")?;
    let from = ints(batch, path, "dataset_from_index")?;
    let to = ints(batch, path, "dataset_to_index")?;

    let mut video_columns = Vec::with_capacity(video_keys.len());
    for key in video_keys {
        video_columns.push((
            key,
            ints(batch, path, &format!("videos/{key}/chunk_index"))?,
            ints(batch, path, &format!("videos/{key}/file_index"))?,
            floats(batch, path, &format!("videos/{key}/from_timestamp"))?,
            floats(batch, path, &format!("videos/{key}/to_timestamp"))?,
        ));
    }

    let mut rows = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let mut videos = BTreeMap::new();
        for (key, v_chunk, v_file, v_from, v_to) in &video_columns {
            let locator = FileLocator {
                chunk_index: required(v_chunk[i], path, "videos/chunk_index")?,
                file_index: required(v_file[i], path, "videos/file_index")?,
            };
            let time = v_from[i].zip(v_to[i]);
            videos.insert((*key).clone(), VideoCell { locator, time });
        }
        rows.push(MetaRow {
            episode_index: required(episode_index[i], path, "episode_index")?,
            length: required(length[i], path, "length")?,
            data: FileLocator {
                chunk_index: required(chunk[i], path, "data/chunk_index")?,
                file_index: required(file[i], path, "data/file_index")?,
            },
            from: required(from[i], path, "dataset_from_index")?,
            to: required(to[i], path, "dataset_to_index")?,
            videos,
        });
    }
    Ok(rows)
}

/// Check row ranges: contiguous from zero, consistent with episode lengths.
fn check_rows(rows: &[MetaRow], problems: &mut Vec<String>) {
    let mut expected_from = 0;
    for (position, row) in rows.iter().enumerate() {
        if row.episode_index != position as u64 {
            problems.push(format!(
                "episode index {} found at position {position}",
                row.episode_index
            ));
        }
        if row.from != expected_from {
            problems.push(format!(
                "episode {}: row range starts at {}, expected {expected_from}",
                row.episode_index, row.from
            ));
        }
        if row.to < row.from || row.to - row.from != row.length {
            problems.push(format!(
                "episode {}: row range [{}, {}) does not match length {}",
                row.episode_index, row.from, row.to, row.length
            ));
        }
        expected_from = row.to;
    }
}

/// Check time ranges of one camera stream: each file starts at zero and
/// consecutive episodes in a file share their boundary. Degraded episodes
/// break the chain.
fn check_times(key: &str, rows: &[MetaRow], report: &mut VerifyReport) {
    let mut current: Option<FileLocator> = None;
    let mut previous_end: Option<f64> = None;
    for row in rows {
        let Some(cell) = row.videos.get(key) else {
            continue;
        };
        let new_file = current != Some(cell.locator);
        current = Some(cell.locator);

        let Some((from, to)) = cell.time else {
            *report.degraded_videos.entry(key.to_string()).or_default() += 1;
            previous_end = None;
            continue;
        };
        let expected = if new_file { Some(0.0) } else { previous_end };
        if let Some(expected) = expected.filter(|e| (from - e).abs() > TIME_EPSILON) {
            report.problems.push(format!(
                "{key}: episode {} starts at {from}s in {}, expected {expected}s",
                row.episode_index, cell.locator
            ));
        }
        if to < from {
            report.problems.push(format!(
                "{key}: episode {} has inverted time range [{from}, {to})",
                row.episode_index
            ));
        }
        previous_end = Some(to);
    }
}

/// Verify a converted root.
pub async fn verify_converted(location: &DatasetLocation) -> VerifyResult<VerifyReport> {
    let text = storage::read_to_string(location, Path::new(INFO_PATH))
        .await
        .context(ReadSnafu { path: INFO_PATH })?;
    let info: DatasetInfo = serde_json::from_str(&text).context(DescriptorSnafu)?;
    ensure!(
        info.codebase_version == TARGET_VERSION,
        VersionSnafu {
            found: info.codebase_version.clone(),
        }
    );
    let files_per_chunk = info.chunks_size.unwrap_or(SOURCE_DEFAULT_CHUNKS_SIZE);
    let video_keys = info.video_keys();

    let mut report = VerifyReport::default();
    let mut rows = Vec::new();
    let mut locator = FileLocator::FIRST;
    loop {
        let rel = target_episodes_path(locator).context(TargetPathSnafu)?;
        let path = rel.display().to_string();
        let present = storage::exists(location, &rel)
            .await
            .context(ReadSnafu { path: &path })?;
        if !present {
            break;
        }
        for batch in read_parquet(location, &rel).await? {
            rows.extend(meta_rows(&batch, &path, &video_keys)?);
        }
        report.episode_meta_files += 1;
        locator = locator.next(files_per_chunk);
    }
    debug!(
        "read {} episode rows from {} files",
        rows.len(),
        report.episode_meta_files
    );
    rows.sort_by_key(|r| r.episode_index);

    report.episodes = rows.len() as u64;
    report.frames = rows.iter().map(|r| r.length).sum();
    if report.episodes != info.total_episodes {
        report.problems.push(format!(
            "descriptor lists {} episodes, metadata tables hold {}",
            info.total_episodes, report.episodes
        ));
    }
    if report.frames != info.total_frames {
        report.problems.push(format!(
            "descriptor lists {} frames, episode lengths sum to {}",
            info.total_frames, report.frames
        ));
    }

    check_rows(&rows, &mut report.problems);
    for key in &video_keys {
        check_times(key, &rows, &mut report);
    }

    let mut per_file: BTreeMap<FileLocator, u64> = BTreeMap::new();
    for row in &rows {
        *per_file.entry(row.data).or_default() += row.length;
    }
    let mut referenced = BTreeSet::new();
    for (locator, expected) in &per_file {
        let rel = target_data_path(*locator).context(TargetPathSnafu)?;
        referenced.insert(rel.clone());
        let path = rel.display().to_string();
        let raw = storage::read_all_bytes(location, &rel)
            .await
            .context(ReadSnafu { path: &path })?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(raw))
            .context(DecodeSnafu { path: &path })?;
        let found = builder.metadata().file_metadata().num_rows();
        if u64::try_from(found).ok() != Some(*expected) {
            report.problems.push(format!(
                "{path}: holds {found} rows, episodes claim {expected}"
            ));
        }
    }
    report.data_files = per_file.len();

    let chunks: BTreeSet<u64> = per_file.keys().map(|l| l.chunk_index).collect();
    for chunk in chunks {
        let dir = PathBuf::from(format!("data/chunk-{chunk:03}"));
        let on_disk = storage::list_matching(location, &dir, "file-*.parquet")
            .await
            .context(ReadSnafu {
                path: dir.display().to_string(),
            })?;
        for rel in on_disk.iter().filter(|rel| !referenced.contains(*rel)) {
            report
                .problems
                .push(format!("{}: not referenced by any episode", rel.display()));
        }
    }

    info!(
        "verified {} episodes, {} frames, {} data files: {} problems",
        report.episodes,
        report.frames,
        report.data_files,
        report.problems.len()
    );
    Ok(report)
}
