//! Metadata loader for the source (v2.1) layout.
//!
//! Reads the descriptor, episode index, per-episode statistics and task
//! vocabulary, then cross-references them eagerly: every episode must have
//! exactly one statistics record, every statistics record must belong to a
//! known episode and only name features from the schema, and every episode's
//! data (and video) file must exist. All of this happens before the
//! conversion writes a single byte, so a missing or inconsistent source
//! aborts without touching the destination.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use log::{debug, warn};
use serde::de::DeserializeOwned;
use snafu::prelude::*;

use crate::{
    layout::{
        INFO_PATH, SOURCE_DATA_PATH_TEMPLATE, SOURCE_DEFAULT_CHUNKS_SIZE,
        SOURCE_EPISODES_PATH, SOURCE_EPISODES_STATS_PATH, SOURCE_TASKS_PATH,
        SOURCE_VIDEO_PATH_TEMPLATE, TemplateError, source_episode_path,
    },
    metadata::{
        DatasetInfo, EpisodeRecord, EpisodeStats, EpisodeStatsRecord, FeatureDtype, FeatureSpec,
        FeatureStats, TaskRecord, TaskVocabulary,
    },
    storage::{self, DatasetLocation, StorageError},
};

/// Errors raised while loading source metadata.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LoadError {
    /// A required source file is absent.
    #[snafu(display("Missing source artifact: {path}"))]
    MissingArtifact {
        /// Relative path of the missing file.
        path: String,
        /// Underlying storage error.
        source: StorageError,
    },

    /// A record failed to parse or lacks a required field.
    #[snafu(display("Malformed record in {path} at line {line}: {detail}"))]
    MalformedRecord {
        /// Relative path of the file holding the record.
        path: String,
        /// 1-based line number (0 for whole-document errors).
        line: usize,
        /// What is wrong.
        detail: String,
    },

    /// Records are individually valid but inconsistent with each other.
    #[snafu(display("Schema violation: {detail}"))]
    SchemaViolation {
        /// What is inconsistent.
        detail: String,
    },

    /// A descriptor path template could not be rendered.
    #[snafu(display("Invalid path template in {INFO_PATH}: {source}"))]
    PathTemplate {
        /// Underlying template error.
        source: TemplateError,
    },

    /// Any other storage failure while reading.
    #[snafu(display("Storage error while reading source metadata: {source}"))]
    Storage {
        /// Underlying storage error.
        source: StorageError,
    },
}

/// Result alias for loader operations.
pub type LoadResult<T> = Result<T, LoadError>;

/// One source episode with everything that refers to it.
#[derive(Debug, Clone)]
pub struct SourceEpisode {
    /// Episode index record.
    pub record: EpisodeRecord,
    /// Per-feature statistics for this episode.
    pub stats: EpisodeStats,
    /// Relative path of the episode's data file.
    pub data_path: PathBuf,
    /// Relative path of the episode's video file per camera stream.
    pub video_paths: BTreeMap<String, PathBuf>,
}

impl SourceEpisode {
    /// Episode index.
    pub fn index(&self) -> u64 {
        self.record.episode_index
    }
}

/// Everything the conversion needs from the source metadata directory.
#[derive(Debug, Clone)]
pub struct SourceMetadata {
    /// Source descriptor.
    pub info: DatasetInfo,
    /// Task vocabulary.
    pub tasks: TaskVocabulary,
    /// Episodes in increasing index order.
    pub episodes: Vec<SourceEpisode>,
}

impl SourceMetadata {
    /// Sum of episode lengths.
    pub fn total_frames(&self) -> u64 {
        self.episodes.iter().map(|e| e.record.length).sum()
    }
}

async fn read_required(location: &DatasetLocation, rel: &str) -> LoadResult<String> {
    match storage::read_to_string(location, Path::new(rel)).await {
        Ok(s) => Ok(s),
        Err(e) if e.is_not_found() => Err(e).context(MissingArtifactSnafu { path: rel }),
        Err(e) => Err(e).context(StorageSnafu),
    }
}

/// Parse line-delimited JSON, skipping blank lines. Returns `(line, record)`.
fn parse_jsonl<T: DeserializeOwned>(path: &str, text: &str) -> LoadResult<Vec<(usize, T)>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .map(|rec| (i + 1, rec))
                .map_err(|e| LoadError::MalformedRecord {
                    path: path.to_string(),
                    line: i + 1,
                    detail: e.to_string(),
                })
        })
        .collect()
}

fn parse_info(text: &str) -> LoadResult<DatasetInfo> {
    serde_json::from_str(text).map_err(|e| LoadError::MalformedRecord {
        path: INFO_PATH.to_string(),
        line: e.line(),
        detail: e.to_string(),
    })
}

/// Load and cross-validate the source metadata under `location`.
pub async fn load_source_metadata(location: &DatasetLocation) -> LoadResult<SourceMetadata> {
    // Existence of every metadata file is checked before any parsing.
    let info_text = read_required(location, INFO_PATH).await?;
    let episodes_text = read_required(location, SOURCE_EPISODES_PATH).await?;
    let stats_text = read_required(location, SOURCE_EPISODES_STATS_PATH).await?;
    let tasks_text = read_required(location, SOURCE_TASKS_PATH).await?;

    let info = parse_info(&info_text)?;
    let episode_lines: Vec<(usize, EpisodeRecord)> =
        parse_jsonl(SOURCE_EPISODES_PATH, &episodes_text)?;
    let stats_lines: Vec<(usize, EpisodeStatsRecord)> =
        parse_jsonl(SOURCE_EPISODES_STATS_PATH, &stats_text)?;
    let task_lines: Vec<(usize, TaskRecord)> = parse_jsonl(SOURCE_TASKS_PATH, &tasks_text)?;

    let tasks = TaskVocabulary::from_records(task_lines.into_iter().map(|(_, t)| t))
        .map_err(|e| LoadError::SchemaViolation {
            detail: format!("{SOURCE_TASKS_PATH}: {e}"),
        })?;

    let episodes = index_episodes(episode_lines, &tasks)?;
    let mut stats = index_stats(stats_lines, &info, &episodes)?;

    if info.total_episodes != episodes.len() as u64 {
        warn!(
            "descriptor declares {} episodes but {} lists {}",
            info.total_episodes,
            SOURCE_EPISODES_PATH,
            episodes.len()
        );
    }

    let chunks_size = info.chunks_size.unwrap_or(SOURCE_DEFAULT_CHUNKS_SIZE);
    let data_template = if info.data_path.is_empty() {
        SOURCE_DATA_PATH_TEMPLATE
    } else {
        info.data_path.as_str()
    };
    let video_template = info
        .video_path
        .as_deref()
        .unwrap_or(SOURCE_VIDEO_PATH_TEMPLATE);
    let video_keys = info.video_keys();

    let mut out = Vec::with_capacity(episodes.len());
    for (index, record) in episodes {
        let data_path = source_episode_path(data_template, chunks_size, index, None)
            .context(PathTemplateSnafu)?;
        ensure_file(location, &data_path).await?;

        let mut video_paths = BTreeMap::new();
        for key in &video_keys {
            let p = source_episode_path(video_template, chunks_size, index, Some(key))
                .context(PathTemplateSnafu)?;
            ensure_file(location, &p).await?;
            video_paths.insert(key.clone(), p);
        }

        // index_stats guarantees presence.
        let ep_stats = stats.remove(&index).unwrap_or_default();
        out.push(SourceEpisode {
            record,
            stats: ep_stats,
            data_path,
            video_paths,
        });
    }

    debug!(
        "loaded {} episodes, {} tasks, {} features from {location}",
        out.len(),
        tasks.len(),
        info.features.len()
    );

    Ok(SourceMetadata {
        info,
        tasks,
        episodes: out,
    })
}

async fn ensure_file(location: &DatasetLocation, rel: &Path) -> LoadResult<()> {
    match storage::file_len(location, rel).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Err(e).context(MissingArtifactSnafu {
            path: rel.display().to_string(),
        }),
        Err(e) => Err(e).context(StorageSnafu),
    }
}

/// Key episodes by index, rejecting duplicates and unknown task labels.
fn index_episodes(
    lines: Vec<(usize, EpisodeRecord)>,
    tasks: &TaskVocabulary,
) -> LoadResult<BTreeMap<u64, EpisodeRecord>> {
    let mut by_index = BTreeMap::new();
    for (line, record) in lines {
        ensure!(
            !record.tasks.is_empty(),
            MalformedRecordSnafu {
                path: SOURCE_EPISODES_PATH,
                line,
                detail: "episode has no task label",
            }
        );
        for label in &record.tasks {
            ensure!(
                tasks.index_of(label).is_some(),
                SchemaViolationSnafu {
                    detail: format!(
                        "episode {} references task {label:?} which is not in {SOURCE_TASKS_PATH}",
                        record.episode_index
                    ),
                }
            );
        }
        let index = record.episode_index;
        ensure!(
            by_index.insert(index, record).is_none(),
            SchemaViolationSnafu {
                detail: format!("episode index {index} appears more than once"),
            }
        );
    }
    Ok(by_index)
}

/// Key statistics by episode index and cross-check them against the schema
/// and the episode index.
fn index_stats(
    lines: Vec<(usize, EpisodeStatsRecord)>,
    info: &DatasetInfo,
    episodes: &BTreeMap<u64, EpisodeRecord>,
) -> LoadResult<BTreeMap<u64, EpisodeStats>> {
    let mut by_index = BTreeMap::new();
    for (line, record) in lines {
        let index = record.episode_index;
        ensure!(
            episodes.contains_key(&index),
            SchemaViolationSnafu {
                detail: format!("statistics reference unknown episode {index}"),
            }
        );
        for (feature, stats) in &record.stats {
            let spec = info.features.get(feature).context(SchemaViolationSnafu {
                detail: format!(
                    "statistics of episode {index} reference feature {feature:?} \
                     which is not in the schema"
                ),
            })?;
            stats.validate().map_err(|detail| LoadError::MalformedRecord {
                path: SOURCE_EPISODES_STATS_PATH.to_string(),
                line,
                detail: format!("feature {feature:?}: {detail}"),
            })?;
            check_declared_shape(index, feature, spec, stats)?;
        }
        ensure!(
            by_index.insert(index, record.stats).is_none(),
            SchemaViolationSnafu {
                detail: format!("statistics for episode {index} appear more than once"),
            }
        );
    }

    let missing: BTreeSet<u64> = episodes
        .keys()
        .filter(|i| !by_index.contains_key(*i))
        .copied()
        .collect();
    ensure!(
        missing.is_empty(),
        SchemaViolationSnafu {
            detail: format!("episodes without statistics: {missing:?}"),
        }
    );

    Ok(by_index)
}

/// Frame-valued features must carry statistics with one element per
/// declared value. Camera streams keep per-channel statistics and are exempt.
fn check_declared_shape(
    index: u64,
    feature: &str,
    spec: &FeatureSpec,
    stats: &FeatureStats,
) -> LoadResult<()> {
    if matches!(spec.dtype, FeatureDtype::Image | FeatureDtype::Video) {
        return Ok(());
    }
    let declared: usize = spec.shape.iter().product();
    let quantiles = [&stats.q01, &stats.q10, &stats.q50, &stats.q90, &stats.q99];
    let arrays = [&stats.min, &stats.max, &stats.mean, &stats.std]
        .into_iter()
        .chain(quantiles.into_iter().flatten());
    for arr in arrays {
        ensure!(
            arr.len() == declared,
            SchemaViolationSnafu {
                detail: format!(
                    "statistics of episode {index} give feature {feature:?} shape {:?} \
                     but the schema declares {:?}",
                    arr.shape(),
                    spec.shape
                ),
            }
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const INFO: &str = r#"{
        "codebase_version": "v2.1", "total_episodes": 2, "total_frames": 5,
        "total_tasks": 1, "chunks_size": 1000, "fps": 10,
        "data_path": "data/chunk-{episode_chunk:03d}/episode_{episode_index:06d}.parquet",
        "features": {
            "action": {"dtype": "float32", "shape": [1]}
        }
    }"#;

    const STATS_LINE: &str =
        r#""stats": {"action": {"min": [0.0], "max": [1.0], "mean": [0.5], "std": [0.1], "count": [3]}}"#;

    async fn write(tmp: &TempDir, rel: &str, contents: &str) -> TestResult {
        let location = DatasetLocation::local(tmp.path());
        storage::write_atomic(&location, Path::new(rel), contents.as_bytes()).await?;
        Ok(())
    }

    async fn write_valid_source(tmp: &TempDir) -> TestResult {
        write(tmp, INFO_PATH, INFO).await?;
        // Storage order deliberately not index order.
        write(
            tmp,
            SOURCE_EPISODES_PATH,
            "{\"episode_index\": 1, \"tasks\": [\"pick\"], \"length\": 2}\n\n\
             {\"episode_index\": 0, \"tasks\": [\"pick\"], \"length\": 3}\n",
        )
        .await?;
        write(
            tmp,
            SOURCE_EPISODES_STATS_PATH,
            &format!(
                "{{\"episode_index\": 0, {STATS_LINE}}}\n{{\"episode_index\": 1, {STATS_LINE}}}\n"
            ),
        )
        .await?;
        write(tmp, SOURCE_TASKS_PATH, "{\"task_index\": 0, \"task\": \"pick\"}\n").await?;
        write(tmp, "data/chunk-000/episode_000000.parquet", "x").await?;
        write(tmp, "data/chunk-000/episode_000001.parquet", "x").await?;
        Ok(())
    }

    #[tokio::test]
    async fn loads_and_orders_episodes() -> TestResult {
        let tmp = TempDir::new()?;
        write_valid_source(&tmp).await?;

        let meta = load_source_metadata(&DatasetLocation::local(tmp.path())).await?;
        let indices: Vec<u64> = meta.episodes.iter().map(SourceEpisode::index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(meta.total_frames(), 5);
        assert_eq!(
            meta.episodes[1].data_path,
            PathBuf::from("data/chunk-000/episode_000001.parquet")
        );
        assert!(meta.episodes[0].stats.contains_key("action"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_metadata_file_is_missing_artifact() -> TestResult {
        let tmp = TempDir::new()?;
        write_valid_source(&tmp).await?;
        std::fs::remove_file(tmp.path().join(SOURCE_TASKS_PATH))?;

        let err = load_source_metadata(&DatasetLocation::local(tmp.path()))
            .await
            .expect_err("tasks.jsonl is required");
        assert!(
            matches!(&err, LoadError::MissingArtifact { path, .. } if path == SOURCE_TASKS_PATH)
        );
        Ok(())
    }

    #[tokio::test]
    async fn missing_data_file_is_missing_artifact() -> TestResult {
        let tmp = TempDir::new()?;
        write_valid_source(&tmp).await?;
        std::fs::remove_file(tmp.path().join("data/chunk-000/episode_000001.parquet"))?;

        let err = load_source_metadata(&DatasetLocation::local(tmp.path()))
            .await
            .expect_err("episode data is required");
        assert!(matches!(err, LoadError::MissingArtifact { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_episode_index_is_schema_violation() -> TestResult {
        let tmp = TempDir::new()?;
        write_valid_source(&tmp).await?;
        write(
            &tmp,
            SOURCE_EPISODES_PATH,
            "{\"episode_index\": 0, \"tasks\": [\"pick\"], \"length\": 3}\n\
             {\"episode_index\": 0, \"tasks\": [\"pick\"], \"length\": 2}\n",
        )
        .await?;

        let err = load_source_metadata(&DatasetLocation::local(tmp.path()))
            .await
            .expect_err("duplicate index");
        assert!(matches!(err, LoadError::SchemaViolation { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn record_without_length_is_malformed() -> TestResult {
        let tmp = TempDir::new()?;
        write_valid_source(&tmp).await?;
        write(
            &tmp,
            SOURCE_EPISODES_PATH,
            "{\"episode_index\": 0, \"tasks\": [\"pick\"], \"length\": 3}\n\
             {\"episode_index\": 1, \"tasks\": [\"pick\"]}\n",
        )
        .await?;

        let err = load_source_metadata(&DatasetLocation::local(tmp.path()))
            .await
            .expect_err("length is required");
        assert!(matches!(err, LoadError::MalformedRecord { line: 2, .. }));
        Ok(())
    }

    #[tokio::test]
    async fn stats_for_unknown_feature_or_episode_are_rejected() -> TestResult {
        let tmp = TempDir::new()?;
        write_valid_source(&tmp).await?;
        write(
            &tmp,
            SOURCE_EPISODES_STATS_PATH,
            &format!(
                "{{\"episode_index\": 0, {STATS_LINE}}}\n{{\"episode_index\": 7, {STATS_LINE}}}\n"
            ),
        )
        .await?;
        let err = load_source_metadata(&DatasetLocation::local(tmp.path()))
            .await
            .expect_err("episode 7 does not exist");
        assert!(matches!(err, LoadError::SchemaViolation { .. }));

        let unknown_feature = STATS_LINE.replace("\"action\"", "\"gripper\"");
        write(
            &tmp,
            SOURCE_EPISODES_STATS_PATH,
            &format!(
                "{{\"episode_index\": 0, {STATS_LINE}}}\n{{\"episode_index\": 1, {unknown_feature}}}\n"
            ),
        )
        .await?;
        let err = load_source_metadata(&DatasetLocation::local(tmp.path()))
            .await
            .expect_err("gripper is not in the schema");
        assert!(matches!(err, LoadError::SchemaViolation { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn stats_shape_must_match_declared_shape() -> TestResult {
        let tmp = TempDir::new()?;
        write_valid_source(&tmp).await?;
        let wide = STATS_LINE
            .replace("[0.0]", "[0.0, 0.0, 0.0]")
            .replace("[1.0]", "[1.0, 1.0, 1.0]")
            .replace("[0.5]", "[0.5, 0.5, 0.5]")
            .replace("[0.1]", "[0.1, 0.1, 0.1]");
        write(
            &tmp,
            SOURCE_EPISODES_STATS_PATH,
            &format!("{{\"episode_index\": 0, {STATS_LINE}}}\n{{\"episode_index\": 1, {wide}}}\n"),
        )
        .await?;

        let err = load_source_metadata(&DatasetLocation::local(tmp.path()))
            .await
            .expect_err("action is declared with shape [1]");
        assert!(
            matches!(&err, LoadError::SchemaViolation { detail } if detail.contains("[3]")),
            "unexpected error: {err}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn episode_without_stats_is_schema_violation() -> TestResult {
        let tmp = TempDir::new()?;
        write_valid_source(&tmp).await?;
        write(
            &tmp,
            SOURCE_EPISODES_STATS_PATH,
            &format!("{{\"episode_index\": 0, {STATS_LINE}}}\n"),
        )
        .await?;

        let err = load_source_metadata(&DatasetLocation::local(tmp.path()))
            .await
            .expect_err("episode 1 has no stats");
        assert!(matches!(err, LoadError::SchemaViolation { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_task_label_is_schema_violation() -> TestResult {
        let tmp = TempDir::new()?;
        write_valid_source(&tmp).await?;
        write(
            &tmp,
            SOURCE_EPISODES_PATH,
            "{\"episode_index\": 0, \"tasks\": [\"pick\"], \"length\": 3}\n\
             {\"episode_index\": 1, \"tasks\": [\"place\"], \"length\": 2}\n",
        )
        .await?;

        let err = load_source_metadata(&DatasetLocation::local(tmp.path()))
            .await
            .expect_err("place is not a known task");
        assert!(matches!(err, LoadError::SchemaViolation { .. }));
        Ok(())
    }
}
