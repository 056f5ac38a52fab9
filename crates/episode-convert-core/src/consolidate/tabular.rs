//! Tabular consolidation: many per-episode Parquet files into a few chunked
//! ones.
//!
//! Episodes are appended in the order they are given. Column order is fixed
//! by the first episode; later episodes must carry exactly the same columns
//! with the same types, in any order. Rows are never reordered, dropped or
//! deduplicated.

use std::path::{Path, PathBuf};

use arrow::{
    datatypes::{DataType, Schema, SchemaRef},
    error::ArrowError,
    record_batch::RecordBatch,
};
use bytes::Bytes;
use log::debug;
use parquet::{
    arrow::{ArrowWriter, arrow_reader::ParquetRecordBatchReaderBuilder},
    basic::Compression,
    errors::ParquetError,
    file::properties::WriterProperties,
};
use snafu::prelude::*;

use crate::{
    consolidate::cursor::{FileCursor, FileLimits, RowCursor, RowRange},
    layout::{FileLocator, TemplateError, target_data_path},
    loader::SourceEpisode,
    storage::{self, DatasetLocation, StorageError, output::OutputSink},
};

/// Errors raised while consolidating tabular data.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TabularError {
    /// A source file could not be read.
    #[snafu(display("Cannot read episode data {path}: {source}"))]
    Read {
        /// Source file.
        path: String,
        /// Underlying storage error.
        source: StorageError,
    },

    /// A source file is not valid Parquet.
    #[snafu(display("Cannot decode episode data {path}: {source}"))]
    Decode {
        /// Source file.
        path: String,
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// Batches could not be decoded or re-assembled.
    #[snafu(display("Invalid record batch in {path}: {source}"))]
    Batch {
        /// Source file.
        path: String,
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// A column of the consolidated schema is absent from an episode.
    #[snafu(display("{path} is missing column {column}"))]
    MissingColumn {
        /// Source file.
        path: String,
        /// Column name.
        column: String,
    },

    /// An episode carries a column the consolidated schema does not have.
    #[snafu(display("{path} has extra column {column}"))]
    ExtraColumn {
        /// Source file.
        path: String,
        /// Column name.
        column: String,
    },

    /// A column's type differs from the consolidated schema.
    #[snafu(display("{path}: column {column} has type {found}, expected {expected}"))]
    TypeMismatch {
        /// Source file.
        path: String,
        /// Column name.
        column: String,
        /// Type in the consolidated schema.
        expected: DataType,
        /// Type in the episode file.
        found: DataType,
    },

    /// The number of rows does not match the episode's recorded length.
    #[snafu(display("{path} holds {found} rows but episode {episode_index} has length {expected}"))]
    LengthMismatch {
        /// Source file.
        path: String,
        /// Episode index.
        episode_index: u64,
        /// Recorded length.
        expected: u64,
        /// Rows found.
        found: u64,
    },

    /// Writing a consolidated file failed.
    #[snafu(display("Cannot write {path}: {source}"))]
    Write {
        /// Target file.
        path: String,
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// Committing a consolidated file failed.
    #[snafu(display("Cannot commit {path}: {source}"))]
    Commit {
        /// Target file.
        path: String,
        /// Underlying storage error.
        source: StorageError,
    },

    /// The target path could not be rendered.
    #[snafu(display("Cannot render data path: {source}"))]
    TargetPath {
        /// Underlying template error.
        source: TemplateError,
    },
}

/// Result alias for tabular consolidation.
pub type TabularResult<T> = Result<T, TabularError>;

/// Where one episode's rows landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpisodeDataPlacement {
    /// Consolidated file holding the episode.
    pub locator: FileLocator,
    /// Global row indices of the episode.
    pub rows: RowRange,
}

/// Result of appending one episode.
#[derive(Debug)]
pub struct AppendedEpisode {
    /// Where the rows went.
    pub placement: EpisodeDataPlacement,
    /// The episode's rows, in the consolidated column order.
    pub batches: Vec<RecordBatch>,
}

/// Summary of a finished consolidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabularSummary {
    /// Every file written, in order.
    pub files: Vec<FileLocator>,
    /// Rows written.
    pub total_rows: u64,
}

struct OpenFile {
    locator: FileLocator,
    path: PathBuf,
    writer: ArrowWriter<OutputSink>,
}

/// Streams episodes into `data/chunk-XXX/file-YYY.parquet`.
pub struct TabularConsolidator {
    source: DatasetLocation,
    dest: DatasetLocation,
    limits: FileLimits,
    files: FileCursor,
    rows: RowCursor,
    schema: Option<SchemaRef>,
    open: Option<OpenFile>,
    written: Vec<FileLocator>,
}

impl TabularConsolidator {
    /// New consolidator reading from `source` and writing under `dest`.
    pub fn new(source: DatasetLocation, dest: DatasetLocation, limits: FileLimits) -> Self {
        Self {
            source,
            dest,
            limits,
            files: FileCursor::default(),
            rows: RowCursor::default(),
            schema: None,
            open: None,
            written: Vec::new(),
        }
    }

    /// Schema of the consolidated files, once the first episode is in.
    pub fn schema(&self) -> Option<&SchemaRef> {
        self.schema.as_ref()
    }

    /// Append one episode.
    pub async fn append_episode(&mut self, episode: &SourceEpisode) -> TabularResult<AppendedEpisode> {
        let rel = episode.data_path.as_path();
        let path = rel.display().to_string();

        let raw = storage::read_all_bytes(&self.source, rel)
            .await
            .context(ReadSnafu { path: &path })?;
        let source_bytes = raw.len() as u64;

        let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(raw))
            .context(DecodeSnafu { path: &path })?;
        let file_schema = builder.schema().clone();
        let schema = match &self.schema {
            Some(s) => s.clone(),
            None => {
                let s = file_schema.clone();
                self.schema = Some(s.clone());
                s
            }
        };
        let projection = align_columns(&schema, &file_schema, &path)?;

        let reader = builder.build().context(DecodeSnafu { path: &path })?;
        let mut batches = Vec::new();
        let mut found: u64 = 0;
        for batch in reader {
            let batch = batch.context(BatchSnafu { path: &path })?;
            let columns = projection.iter().map(|&i| batch.column(i).clone()).collect();
            let batch =
                RecordBatch::try_new(schema.clone(), columns).context(BatchSnafu { path: &path })?;
            found += batch.num_rows() as u64;
            batches.push(batch);
        }

        let expected = episode.record.length;
        ensure!(
            found == expected,
            LengthMismatchSnafu {
                path: &path,
                episode_index: episode.index(),
                expected,
                found,
            }
        );

        let (files, placement) = self.files.place(&self.limits, source_bytes, found);
        self.files = files;
        if placement.new_file {
            self.close_current().await?;
            self.open_file(placement.locator, &schema).await?;
        }

        if let Some(open) = self.open.as_mut() {
            for batch in &batches {
                open.writer.write(batch).context(WriteSnafu {
                    path: open.path.display().to_string(),
                })?;
            }
        }

        let (rows, range) = self.rows.advance(found);
        self.rows = rows;
        debug!(
            "episode {} -> {} rows [{}, {})",
            episode.index(),
            placement.locator,
            range.from,
            range.to
        );

        Ok(AppendedEpisode {
            placement: EpisodeDataPlacement {
                locator: placement.locator,
                rows: range,
            },
            batches,
        })
    }

    async fn open_file(&mut self, locator: FileLocator, schema: &SchemaRef) -> TabularResult<()> {
        let path = target_data_path(locator).context(TargetPathSnafu)?;
        let display = path.display().to_string();
        let sink = storage::output::open_output_sink(&self.dest, &path)
            .await
            .context(CommitSnafu { path: &display })?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let writer = ArrowWriter::try_new(sink, schema.clone(), Some(props))
            .context(WriteSnafu { path: &display })?;
        self.open = Some(OpenFile {
            locator,
            path,
            writer,
        });
        Ok(())
    }

    async fn close_current(&mut self) -> TabularResult<()> {
        let Some(open) = self.open.take() else {
            return Ok(());
        };
        let display = open.path.display().to_string();
        let sink = open
            .writer
            .into_inner()
            .context(WriteSnafu { path: &display })?;
        sink.finish().await.context(CommitSnafu { path: &display })?;
        self.written.push(open.locator);
        Ok(())
    }

    /// Close the last file and report what was written.
    pub async fn finish(mut self) -> TabularResult<TabularSummary> {
        self.close_current().await?;
        Ok(TabularSummary {
            files: self.written,
            total_rows: self.rows.position(),
        })
    }
}

/// Indices of `incoming`'s columns in `running` order.
///
/// Every running column must exist in `incoming` with the same type, and
/// `incoming` may not carry extra columns.
fn align_columns(running: &Schema, incoming: &Schema, path: &str) -> TabularResult<Vec<usize>> {
    let mut projection = Vec::with_capacity(running.fields().len());
    for field in running.fields() {
        let idx = incoming
            .index_of(field.name())
            .ok()
            .context(MissingColumnSnafu {
                path,
                column: field.name(),
            })?;
        let found = incoming.field(idx).data_type();
        ensure!(
            found == field.data_type(),
            TypeMismatchSnafu {
                path,
                column: field.name(),
                expected: field.data_type().clone(),
                found: found.clone(),
            }
        );
        projection.push(idx);
    }

    if let Some(extra) = incoming
        .fields()
        .iter()
        .find(|f| running.index_of(f.name()).is_err())
    {
        return ExtraColumnSnafu {
            path,
            column: extra.name(),
        }
        .fail();
    }

    Ok(projection)
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc};

    use arrow::{
        array::{ArrayRef, AsArray, Float32Array, Int64Array},
        datatypes::{Field, Int64Type},
    };
    use tempfile::TempDir;

    use super::*;
    use crate::metadata::EpisodeRecord;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    async fn read_data_file(
        location: &DatasetLocation,
        rel_path: &Path,
    ) -> TabularResult<Vec<RecordBatch>> {
        let path = rel_path.display().to_string();
        let raw = storage::read_all_bytes(location, rel_path)
            .await
            .context(ReadSnafu { path: &path })?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(raw))
            .and_then(|b| b.build())
            .context(DecodeSnafu { path: &path })?;
        reader
            .collect::<Result<Vec<_>, _>>()
            .context(BatchSnafu { path })
    }

    fn write_episode(root: &Path, rel: &str, batch: &RecordBatch) -> TestResult {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().ok_or("no parent")?)?;
        let file = std::fs::File::create(path)?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
        writer.write(batch)?;
        writer.close()?;
        Ok(())
    }

    fn batch(first_index: i64, rows: usize) -> Result<RecordBatch, ArrowError> {
        let index: ArrayRef = Arc::new(Int64Array::from_iter_values(
            (0..rows as i64).map(|i| first_index + i),
        ));
        let value: ArrayRef = Arc::new(Float32Array::from_iter_values(
            (0..rows).map(|i| i as f32),
        ));
        RecordBatch::try_from_iter([("index", index), ("value", value)])
    }

    fn episode(index: u64, length: u64) -> SourceEpisode {
        SourceEpisode {
            record: EpisodeRecord {
                episode_index: index,
                tasks: vec!["t".to_string()],
                length,
                extra: Default::default(),
            },
            stats: BTreeMap::new(),
            data_path: PathBuf::from(format!("src/episode_{index}.parquet")),
            video_paths: BTreeMap::new(),
        }
    }

    fn limits(max_rows: Option<u64>) -> FileLimits {
        FileLimits {
            max_bytes: u64::MAX,
            max_rows,
            files_per_chunk: 1000,
        }
    }

    #[tokio::test]
    async fn consolidates_into_contiguous_ranges() -> TestResult {
        let tmp = TempDir::new()?;
        let loc = DatasetLocation::local(tmp.path());
        write_episode(tmp.path(), "src/episode_0.parquet", &batch(0, 3)?)?;
        write_episode(tmp.path(), "src/episode_1.parquet", &batch(3, 4)?)?;
        write_episode(tmp.path(), "src/episode_2.parquet", &batch(7, 2)?)?;

        let mut tab = TabularConsolidator::new(loc.clone(), loc.clone(), limits(Some(7)));
        let a = tab.append_episode(&episode(0, 3)).await?;
        let b = tab.append_episode(&episode(1, 4)).await?;
        let c = tab.append_episode(&episode(2, 2)).await?;
        let summary = tab.finish().await?;

        assert_eq!(a.placement.rows, RowRange { from: 0, to: 3 });
        assert_eq!(b.placement.rows, RowRange { from: 3, to: 7 });
        assert_eq!(c.placement.rows, RowRange { from: 7, to: 9 });
        assert_eq!(a.placement.locator, b.placement.locator);
        assert_eq!(c.placement.locator.file_index, 1);
        assert_eq!(summary.total_rows, 9);
        assert_eq!(summary.files.len(), 2);

        let first = read_data_file(&loc, &target_data_path(FileLocator::FIRST)?).await?;
        let index: Vec<i64> = first
            .iter()
            .flat_map(|b| b.column(0).as_primitive::<Int64Type>().values().to_vec())
            .collect();
        assert_eq!(index, (0..7).collect::<Vec<_>>());
        Ok(())
    }

    #[tokio::test]
    async fn permuted_columns_are_projected() -> TestResult {
        let tmp = TempDir::new()?;
        let loc = DatasetLocation::local(tmp.path());
        write_episode(tmp.path(), "src/episode_0.parquet", &batch(0, 2)?)?;
        let b = batch(2, 2)?;
        let swapped = RecordBatch::try_from_iter([
            ("value", b.column(1).clone()),
            ("index", b.column(0).clone()),
        ])?;
        write_episode(tmp.path(), "src/episode_1.parquet", &swapped)?;

        let mut tab = TabularConsolidator::new(loc.clone(), loc.clone(), limits(None));
        tab.append_episode(&episode(0, 2)).await?;
        let appended = tab.append_episode(&episode(1, 2)).await?;
        assert_eq!(appended.batches[0].schema().field(0).name(), "index");
        tab.finish().await?;
        Ok(())
    }

    #[tokio::test]
    async fn schema_and_length_errors() -> TestResult {
        let tmp = TempDir::new()?;
        let loc = DatasetLocation::local(tmp.path());
        write_episode(tmp.path(), "src/episode_0.parquet", &batch(0, 2)?)?;
        let b = batch(2, 2)?;
        let retyped = RecordBatch::try_from_iter([
            ("index", b.column(0).clone()),
            (
                "value",
                Arc::new(Int64Array::from(vec![1, 2])) as ArrayRef,
            ),
        ])?;
        write_episode(tmp.path(), "src/episode_1.parquet", &retyped)?;
        let narrow = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("index", DataType::Int64, false)])),
            vec![b.column(0).clone()],
        )?;
        write_episode(tmp.path(), "src/episode_2.parquet", &narrow)?;

        let mut tab = TabularConsolidator::new(loc.clone(), loc.clone(), limits(None));
        assert!(matches!(
            tab.append_episode(&episode(0, 5)).await,
            Err(TabularError::LengthMismatch { found: 2, expected: 5, .. })
        ));
        tab.append_episode(&episode(0, 2)).await?;
        assert!(matches!(
            tab.append_episode(&episode(1, 2)).await,
            Err(TabularError::TypeMismatch { .. })
        ));
        assert!(matches!(
            tab.append_episode(&episode(2, 2)).await,
            Err(TabularError::MissingColumn { .. })
        ));
        assert!(matches!(
            tab.append_episode(&episode(9, 2)).await,
            Err(TabularError::Read { .. })
        ));
        Ok(())
    }
}
