//! Parquet metadata tables of the target layout: the per-episode table
//! (`meta/episodes/chunk-XXX/file-YYY.parquet`) and the task table
//! (`meta/tasks.parquet`).
//!
//! One row per episode, columns in this order:
//!
//! | column | type |
//! |---|---|
//! | `episode_index` | Int64 |
//! | `tasks` | List<Utf8> |
//! | `length` | Int64 |
//! | `data/chunk_index`, `data/file_index` | Int64 |
//! | `dataset_from_index`, `dataset_to_index` | Int64 |
//! | `videos/<key>/chunk_index`, `videos/<key>/file_index` | Int64 |
//! | `videos/<key>/from_timestamp`, `videos/<key>/to_timestamp` | Float64, null when degraded |
//! | `stats/<feature>/<stat>` | List<Float64> (flattened, row-major) |
//! | `stats/<feature>/count` | List<Int64> |
//! | `meta/episodes/chunk_index`, `meta/episodes/file_index` | Int64 |

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    sync::Arc,
};

use arrow::{
    array::{
        ArrayRef, Float64Array, Int64Array, ListArray, ListBuilder, StringArray, StringBuilder,
    },
    datatypes::{Field, Float64Type, Int64Type, Schema},
    error::ArrowError,
    record_batch::RecordBatch,
};
use parquet::{arrow::ArrowWriter, errors::ParquetError};
use snafu::prelude::*;

use crate::{
    consolidate::{EpisodeDataPlacement, EpisodeVideoPlacement},
    layout::{FileLocator, TARGET_TASKS_PATH, TemplateError, target_episodes_path},
    metadata::{EpisodeStats, TaskVocabulary, stats::QUANTILE_NAMES},
    storage::{self, DatasetLocation, StorageError},
};

/// Errors raised while writing metadata tables.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MetaTableError {
    /// Assembling the record batch failed.
    #[snafu(display("Cannot build {path}: {source}"))]
    Build {
        /// Target file.
        path: String,
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// Encoding Parquet failed.
    #[snafu(display("Cannot encode {path}: {source}"))]
    Encode {
        /// Target file.
        path: String,
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// Writing or committing the file failed.
    #[snafu(display("Cannot write {path}: {source}"))]
    Store {
        /// Target file.
        path: String,
        /// Underlying storage error.
        source: StorageError,
    },

    /// The target path could not be rendered.
    #[snafu(display("Cannot render episode metadata path: {source}"))]
    MetaPath {
        /// Underlying template error.
        source: TemplateError,
    },
}

/// Result alias for metadata table writes.
pub type MetaTableResult<T> = Result<T, MetaTableError>;

/// Everything known about one converted episode.
#[derive(Debug, Clone)]
pub struct EpisodeRow {
    /// Episode index.
    pub episode_index: u64,
    /// Task labels.
    pub tasks: Vec<String>,
    /// Frames.
    pub length: u64,
    /// Tabular placement.
    pub data: EpisodeDataPlacement,
    /// Video placement per camera stream.
    pub videos: BTreeMap<String, EpisodeVideoPlacement>,
    /// Quantile-augmented statistics.
    pub stats: EpisodeStats,
}

const BASE_STATS: [&str; 4] = ["min", "max", "mean", "std"];

fn stat_names() -> impl Iterator<Item = &'static str> {
    BASE_STATS.into_iter().chain(QUANTILE_NAMES)
}

fn int_column(values: impl Iterator<Item = u64>) -> ArrayRef {
    Arc::new(Int64Array::from_iter_values(values.map(|v| v as i64)))
}

/// Encode `batch` as Parquet at `rel_path`.
pub(crate) async fn write_parquet(
    location: &DatasetLocation,
    rel_path: &Path,
    batch: &RecordBatch,
) -> MetaTableResult<()> {
    let path = rel_path.display().to_string();
    let sink = storage::output::open_output_sink(location, rel_path)
        .await
        .context(StoreSnafu { path: &path })?;
    let mut writer =
        ArrowWriter::try_new(sink, batch.schema(), None).context(EncodeSnafu { path: &path })?;
    writer.write(batch).context(EncodeSnafu { path: &path })?;
    let sink = writer.into_inner().context(EncodeSnafu { path: &path })?;
    sink.finish().await.context(StoreSnafu { path })
}

/// Build one episode metadata batch.
///
/// `features` and `video_keys` fix the column set, so every file of a
/// dataset shares one schema even when some episodes lack a feature.
pub fn episodes_batch(
    rows: &[EpisodeRow],
    meta_locator: FileLocator,
    video_keys: &[String],
    features: &BTreeSet<String>,
) -> Result<RecordBatch, ArrowError> {
    // Nullability is fixed per column, not inferred from the rows at hand.
    let mut columns: Vec<(Field, ArrayRef)> = Vec::new();
    let mut push = |name: &str, array: ArrayRef, nullable: bool| {
        columns.push((Field::new(name, array.data_type().clone(), nullable), array));
    };

    push("episode_index", int_column(rows.iter().map(|r| r.episode_index)), false);

    let mut tasks = ListBuilder::new(StringBuilder::new());
    for row in rows {
        for task in &row.tasks {
            tasks.values().append_value(task);
        }
        tasks.append(true);
    }
    push("tasks", Arc::new(tasks.finish()), false);

    push("length", int_column(rows.iter().map(|r| r.length)), false);
    push(
        "data/chunk_index",
        int_column(rows.iter().map(|r| r.data.locator.chunk_index)),
        false,
    );
    push(
        "data/file_index",
        int_column(rows.iter().map(|r| r.data.locator.file_index)),
        false,
    );
    push(
        "dataset_from_index",
        int_column(rows.iter().map(|r| r.data.rows.from)),
        false,
    );
    push(
        "dataset_to_index",
        int_column(rows.iter().map(|r| r.data.rows.to)),
        false,
    );

    for key in video_keys {
        let placements: Vec<Option<&EpisodeVideoPlacement>> =
            rows.iter().map(|r| r.videos.get(key)).collect();
        let locator_column = |f: fn(&FileLocator) -> u64| -> ArrayRef {
            Arc::new(Int64Array::from(
                placements
                    .iter()
                    .map(|p| p.map(|p| f(&p.locator) as i64))
                    .collect::<Vec<_>>(),
            ))
        };
        push(
            &format!("videos/{key}/chunk_index"),
            locator_column(|l| l.chunk_index),
            true,
        );
        push(
            &format!("videos/{key}/file_index"),
            locator_column(|l| l.file_index),
            true,
        );
        let from: Vec<Option<f64>> = placements
            .iter()
            .map(|p| p.and_then(|p| p.time).map(|t| t.from))
            .collect();
        let to: Vec<Option<f64>> = placements
            .iter()
            .map(|p| p.and_then(|p| p.time).map(|t| t.to))
            .collect();
        push(
            &format!("videos/{key}/from_timestamp"),
            Arc::new(Float64Array::from(from)),
            true,
        );
        push(
            &format!("videos/{key}/to_timestamp"),
            Arc::new(Float64Array::from(to)),
            true,
        );
    }

    for feature in features {
        for stat in stat_names() {
            let values = rows.iter().map(|r| {
                r.stats.get(feature).and_then(|fs| {
                    fs.named_arrays()
                        .into_iter()
                        .find(|(name, _)| *name == stat)
                        .map(|(_, arr)| arr.values().iter().copied().map(Some).collect::<Vec<_>>())
                })
            });
            push(
                &format!("stats/{feature}/{stat}"),
                Arc::new(ListArray::from_iter_primitive::<Float64Type, _, _>(values)),
                true,
            );
        }
        let counts = rows.iter().map(|r| {
            r.stats
                .get(feature)
                .map(|fs| fs.count.iter().map(|&c| Some(c as i64)).collect::<Vec<_>>())
        });
        push(
            &format!("stats/{feature}/count"),
            Arc::new(ListArray::from_iter_primitive::<Int64Type, _, _>(counts)),
            true,
        );
    }

    push(
        "meta/episodes/chunk_index",
        int_column(rows.iter().map(|_| meta_locator.chunk_index)),
        false,
    );
    push(
        "meta/episodes/file_index",
        int_column(rows.iter().map(|_| meta_locator.file_index)),
        false,
    );

    let (fields, arrays): (Vec<Field>, Vec<ArrayRef>) = columns.into_iter().unzip();
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
}

/// Write the episode metadata table, `episodes_per_file` rows per file and
/// `files_per_chunk` files per chunk directory. Returns the files written.
pub async fn write_episodes_table(
    location: &DatasetLocation,
    rows: &[EpisodeRow],
    video_keys: &[String],
    episodes_per_file: u64,
    files_per_chunk: u64,
) -> MetaTableResult<Vec<FileLocator>> {
    let features: BTreeSet<String> = rows
        .iter()
        .flat_map(|r| r.stats.keys().cloned())
        .collect();

    let per_file = usize::try_from(episodes_per_file.max(1)).unwrap_or(usize::MAX);
    let mut locator = FileLocator::FIRST;
    let mut written = Vec::new();
    for group in rows.chunks(per_file) {
        let rel = target_episodes_path(locator).context(MetaPathSnafu)?;
        let batch = episodes_batch(group, locator, video_keys, &features).context(BuildSnafu {
            path: rel.display().to_string(),
        })?;
        write_parquet(location, &rel, &batch).await?;
        written.push(locator);
        locator = locator.next(files_per_chunk);
    }
    Ok(written)
}

/// Write `meta/tasks.parquet` with `task_index` and `task` columns.
pub async fn write_tasks_table(
    location: &DatasetLocation,
    tasks: &TaskVocabulary,
) -> MetaTableResult<()> {
    let index = int_column(tasks.iter().map(|(i, _)| i));
    let labels: ArrayRef = Arc::new(StringArray::from_iter_values(tasks.iter().map(|(_, t)| t)));
    let batch = RecordBatch::try_from_iter([("task_index", index), ("task", labels)]).context(
        BuildSnafu {
            path: TARGET_TASKS_PATH,
        },
    )?;
    write_parquet(location, Path::new(TARGET_TASKS_PATH), &batch).await
}
