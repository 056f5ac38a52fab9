//! Conversion orchestrator.
//!
//! A [`Converter`] runs one source root into one destination root as a
//! linear sequence of stages:
//!
//! ```text
//! Init -> MetadataLoaded -> DataConsolidated -> VideoConsolidated
//!      -> StatisticsAggregated -> MetadataWritten -> Done
//! ```
//!
//! Each stage either completes or fails the run with a
//! [`ConversionFailure`] naming the stage that was being attempted. The
//! destination descriptor (`meta/info.json`) is written last, so a
//! destination without it is an incomplete conversion.

pub mod error;

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use arrow::record_batch::RecordBatch;
use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use snafu::prelude::*;

pub use error::{ConversionFailure, ConversionStage, ConvertError, ErrorKind};
use error::{
    DestinationNotEmptySnafu, LoadSnafu, MetaTableSnafu, OverlappingRootsSnafu,
    PrepareDestinationSnafu, SerializeSnafu, StatisticsSnafu, TabularSnafu, VideoSnafu,
    WriteMetadataSnafu,
};

use crate::{
    consolidate::{
        DegradedVideo, EpisodeDataPlacement, EpisodeVideoPlacement, FfmpegConcatenator,
        TabularConsolidator, VideoConcatenator, VideoConsolidator,
    },
    episodes_table::{EpisodeRow, write_episodes_table, write_tasks_table},
    layout::{
        CONVERSION_REPORT_PATH, FileLocator, INFO_PATH, README_PATH, SOURCE_VERSION,
        TARGET_STATS_PATH, TARGET_VERSION,
    },
    loader::{SourceMetadata, load_source_metadata},
    metadata::{DatasetInfo, EpisodeStats, GlobalStats},
    options::ConvertOptions,
    report::{ConversionReport, PLACEHOLDER_POLICY, QUANTILE_METHOD},
    stats::{
        FeatureMatrix, aggregate::STD_METHOD, aggregate_global_stats,
        augment_episode_stats, compute_quantiles, feature_matrix,
    },
    storage::{self, DatasetLocation},
    transform::{transform_descriptor, with_totals},
};

/// Result alias for single conversion steps.
pub type ConvertResult<T> = Result<T, ConvertError>;

/// One converted episode before its metadata row is written.
struct ConvertedEpisode {
    index: u64,
    tasks: Vec<String>,
    length: u64,
    data: EpisodeDataPlacement,
    stats: EpisodeStats,
    placeholders: Vec<String>,
}

struct DataOutcome {
    episodes: Vec<ConvertedEpisode>,
    files: Vec<FileLocator>,
    total_rows: u64,
}

#[derive(Default)]
struct VideoOutcome {
    placements: BTreeMap<u64, BTreeMap<String, EpisodeVideoPlacement>>,
    files: BTreeMap<String, Vec<FileLocator>>,
    degraded: Vec<DegradedVideo>,
}

/// Converts one dataset root from the source layout to the target layout.
pub struct Converter<C = FfmpegConcatenator> {
    source: DatasetLocation,
    dest: DatasetLocation,
    options: ConvertOptions,
    concatenator: C,
    stage: ConversionStage,
}

impl Converter<FfmpegConcatenator> {
    /// Converter joining videos with `ffmpeg` from `PATH`.
    pub fn new(source: DatasetLocation, dest: DatasetLocation, options: ConvertOptions) -> Self {
        Converter {
            source,
            dest,
            options,
            concatenator: FfmpegConcatenator::default(),
            stage: ConversionStage::Init,
        }
    }
}

impl<C: VideoConcatenator> Converter<C> {
    /// Use `concatenator` to join videos.
    pub fn with_concatenator<D: VideoConcatenator>(self, concatenator: D) -> Converter<D> {
        Converter {
            source: self.source,
            dest: self.dest,
            options: self.options,
            concatenator,
            stage: self.stage,
        }
    }

    /// Last completed stage.
    pub fn stage(&self) -> ConversionStage {
        self.stage
    }

    fn advance(&mut self) {
        self.stage = self.stage.next();
        info!("stage complete: {}", self.stage);
    }

    /// Run the whole conversion.
    pub async fn run(&mut self) -> Result<ConversionReport, ConversionFailure> {
        let started_at = Utc::now();
        info!("converting {} -> {}", self.source, self.dest);

        let source = self.load().await.map_err(failed_at(self.stage.next()))?;
        self.advance();

        let data = self
            .consolidate_data(&source)
            .await
            .map_err(failed_at(self.stage.next()))?;
        self.advance();

        let video = self
            .consolidate_videos(&source)
            .await
            .map_err(failed_at(self.stage.next()))?;
        self.advance();

        let (global, inconsistencies) = {
            let by_episode: BTreeMap<u64, &EpisodeStats> =
                data.episodes.iter().map(|e| (e.index, &e.stats)).collect();
            aggregate_global_stats(&by_episode, &source.info.features)
                .context(StatisticsSnafu)
                .map_err(failed_at(self.stage.next()))?
        };
        self.advance();

        let mut placeholder_quantiles: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for ep in &data.episodes {
            for feature in &ep.placeholders {
                placeholder_quantiles
                    .entry(feature.clone())
                    .or_default()
                    .push(ep.index);
            }
        }

        let mut report = ConversionReport {
            source_version: source.info.codebase_version.clone(),
            target_version: TARGET_VERSION.to_string(),
            source: self.source.to_string(),
            destination: self.dest.to_string(),
            started_at,
            finished_at: started_at,
            options: self.options,
            total_episodes: data.episodes.len() as u64,
            total_frames: data.total_rows,
            total_tasks: source.tasks.len() as u64,
            feature_roles: source
                .info
                .features
                .keys()
                .filter_map(|f| source.info.role_of(f).map(|role| (f.clone(), role)))
                .collect(),
            data_files: data.files.clone(),
            video_files: video.files.clone(),
            episode_meta_files: Vec::new(),
            quantile_method: QUANTILE_METHOD.to_string(),
            std_method: STD_METHOD.to_string(),
            placeholder_policy: PLACEHOLDER_POLICY.to_string(),
            placeholder_quantiles,
            statistics_inconsistencies: inconsistencies,
            degraded_videos: video.degraded.clone(),
        };

        self.write_metadata(&source, data, video, &global, &mut report)
            .await
            .map_err(failed_at(self.stage.next()))?;
        self.advance();

        self.advance();
        debug_assert_eq!(self.stage, ConversionStage::Done);
        if !report.is_clean() {
            warn!(
                "conversion finished with {} degraded videos and {} statistics inconsistencies",
                report.degraded_videos.len(),
                report.statistics_inconsistencies.len()
            );
        }
        Ok(report)
    }

    /// Check the destination, load the source, then clear the destination
    /// if asked to. Nothing is written before the source is fully checked.
    async fn load(&self) -> ConvertResult<SourceMetadata> {
        let dest_path = self.dest.to_string();
        let src = storage::canonical_root(&self.source)
            .await
            .context(PrepareDestinationSnafu {
                path: self.source.to_string(),
            })?;
        let dst = storage::canonical_root(&self.dest)
            .await
            .context(PrepareDestinationSnafu { path: &dest_path })?;
        ensure!(
            !(dst.starts_with(&src) || src.starts_with(&dst)),
            OverlappingRootsSnafu {
                source_root: src.display().to_string(),
                destination: dst.display().to_string(),
            }
        );

        let empty = storage::is_empty_dir(&self.dest, Path::new(""))
            .await
            .context(PrepareDestinationSnafu { path: &dest_path })?;
        ensure!(
            empty || self.options.overwrite,
            DestinationNotEmptySnafu { path: &dest_path }
        );

        let source = load_source_metadata(&self.source).await.context(LoadSnafu)?;
        if source.info.codebase_version != SOURCE_VERSION {
            warn!(
                "source declares codebase_version {:?}, converting as {SOURCE_VERSION}",
                source.info.codebase_version
            );
        }

        if !empty {
            info!("removing existing destination {dest_path}");
            storage::remove_path(&self.dest, Path::new(""))
                .await
                .context(PrepareDestinationSnafu { path: &dest_path })?;
        }

        info!(
            "loaded {} episodes ({} frames) and {} tasks",
            source.episodes.len(),
            source.total_frames(),
            source.tasks.len()
        );
        Ok(source)
    }

    async fn consolidate_data(&self, source: &SourceMetadata) -> ConvertResult<DataOutcome> {
        let mut tabular = TabularConsolidator::new(
            self.source.clone(),
            self.dest.clone(),
            self.options.chunking.data_limits(),
        );
        let mut episodes = Vec::with_capacity(source.episodes.len());

        for episode in &source.episodes {
            let appended = tabular
                .append_episode(episode)
                .await
                .context(TabularSnafu)?;

            let rows = appended.placement.rows;
            debug!(
                "episode {} ({:?}): rows {}..{} in {}",
                episode.index(),
                episode.record.task().unwrap_or_default(),
                rows.from,
                rows.to,
                appended.placement.locator
            );

            let quantiles = episode_quantiles(&source.info, &episode.stats, &appended.batches);
            let augmented = augment_episode_stats(&episode.stats, &quantiles);
            if !augmented.placeholder_features.is_empty() {
                debug!(
                    "episode {}: placeholder quantiles for {:?}",
                    episode.index(),
                    augmented.placeholder_features
                );
            }

            episodes.push(ConvertedEpisode {
                index: episode.index(),
                tasks: episode.record.tasks.clone(),
                length: episode.record.length,
                data: appended.placement,
                stats: augmented.stats,
                placeholders: augmented.placeholder_features,
            });
        }

        let summary = tabular.finish().await.context(TabularSnafu)?;
        info!(
            "wrote {} rows into {} data files",
            summary.total_rows,
            summary.files.len()
        );
        Ok(DataOutcome {
            episodes,
            files: summary.files,
            total_rows: summary.total_rows,
        })
    }

    async fn consolidate_videos(&self, source: &SourceMetadata) -> ConvertResult<VideoOutcome> {
        let mut outcome = VideoOutcome::default();

        for key in source.info.video_keys() {
            let mut video = VideoConsolidator::new(
                self.source.clone(),
                self.dest.clone(),
                key.clone(),
                source.info.fps,
                self.options.chunking.video_limits(),
                &self.concatenator,
            );
            for episode in &source.episodes {
                // The loader resolves a path for every video key.
                let Some(rel) = episode.video_paths.get(&key) else {
                    continue;
                };
                video
                    .append_episode(episode.index(), rel, episode.record.length)
                    .await
                    .context(VideoSnafu { video_key: &key })?;
            }
            let summary = video
                .finish()
                .await
                .context(VideoSnafu { video_key: &key })?;

            info!(
                "{key}: {} containers, {} degraded episodes",
                summary.files.len(),
                summary.degraded.len()
            );
            for (index, placement) in summary.placements {
                outcome
                    .placements
                    .entry(index)
                    .or_default()
                    .insert(key.clone(), placement);
            }
            outcome.files.insert(key, summary.files);
            outcome.degraded.extend(summary.degraded);
        }
        Ok(outcome)
    }

    async fn write_metadata(
        &self,
        source: &SourceMetadata,
        data: DataOutcome,
        mut video: VideoOutcome,
        global: &GlobalStats,
        report: &mut ConversionReport,
    ) -> ConvertResult<()> {
        let chunking = &self.options.chunking;

        write_tasks_table(&self.dest, &source.tasks)
            .await
            .context(MetaTableSnafu)?;

        let rows: Vec<EpisodeRow> = data
            .episodes
            .into_iter()
            .map(|ep| EpisodeRow {
                videos: video.placements.remove(&ep.index).unwrap_or_default(),
                episode_index: ep.index,
                tasks: ep.tasks,
                length: ep.length,
                data: ep.data,
                stats: ep.stats,
            })
            .collect();
        report.episode_meta_files = write_episodes_table(
            &self.dest,
            &rows,
            &source.info.video_keys(),
            chunking.episodes_per_meta_file,
            chunking.chunks_size,
        )
        .await
        .context(MetaTableSnafu)?;

        self.write_json(TARGET_STATS_PATH, global).await?;
        self.copy_readme().await?;

        report.finished_at = Utc::now();
        self.write_json(CONVERSION_REPORT_PATH, &*report).await?;

        let info = with_totals(
            transform_descriptor(&source.info, chunking),
            rows.len() as u64,
            data.total_rows,
            source.tasks.len() as u64,
        );
        self.write_descriptor(&info).await
    }

    async fn write_json(&self, rel: &str, value: &impl Serialize) -> ConvertResult<()> {
        let bytes = serde_json::to_vec_pretty(value).context(SerializeSnafu { path: rel })?;
        storage::write_atomic(&self.dest, Path::new(rel), &bytes)
            .await
            .context(WriteMetadataSnafu { path: rel })
    }

    async fn write_descriptor(&self, info: &DatasetInfo) -> ConvertResult<()> {
        self.write_json(INFO_PATH, info).await
    }

    /// Copy the dataset card, patching its embedded version tag.
    async fn copy_readme(&self) -> ConvertResult<()> {
        let rel = Path::new(README_PATH);
        let text = match storage::read_to_string(&self.source, rel).await {
            Ok(text) => text,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e).context(WriteMetadataSnafu { path: README_PATH }),
        };
        let patched = text.replace(
            &format!("\"codebase_version\": \"{SOURCE_VERSION}\""),
            &format!("\"codebase_version\": \"{TARGET_VERSION}\""),
        );
        storage::write_atomic(&self.dest, rel, patched.as_bytes())
            .await
            .context(WriteMetadataSnafu { path: README_PATH })
    }
}

fn failed_at(stage: ConversionStage) -> impl FnOnce(ConvertError) -> ConversionFailure {
    move |source| ConversionFailure { stage, source }
}

/// Quantiles of every numeric feature present in both the episode's
/// statistics and its decoded rows.
///
/// Features whose column cannot be turned into a matrix, or whose values
/// are all missing, are left out and later get placeholder quantiles.
fn episode_quantiles(
    info: &DatasetInfo,
    stats: &EpisodeStats,
    batches: &[RecordBatch],
) -> BTreeMap<String, [Vec<f64>; 5]> {
    let numeric: BTreeSet<&str> = info
        .features
        .iter()
        .filter(|(_, spec)| spec.dtype.is_numeric())
        .map(|(name, _)| name.as_str())
        .collect();

    let mut out = BTreeMap::new();
    for feature in stats.keys() {
        if !numeric.contains(feature.as_str()) {
            continue;
        }
        let Some(matrix) = collect_matrix(batches, feature) else {
            continue;
        };
        match compute_quantiles(&matrix) {
            Ok(levels) => {
                out.insert(feature.clone(), levels);
            }
            Err(e) => debug!("no quantiles for {feature:?}: {e}"),
        }
    }
    out
}

fn collect_matrix(batches: &[RecordBatch], column: &str) -> Option<FeatureMatrix> {
    let mut matrix = FeatureMatrix::from_rows(Vec::new());
    for batch in batches {
        let array = batch.column_by_name(column)?;
        if !matrix.extend(feature_matrix(array)?) {
            return None;
        }
    }
    Some(matrix)
}

/// Convert `source` into `dest` with `ffmpeg` from `PATH`.
pub async fn convert_dataset(
    source: DatasetLocation,
    dest: DatasetLocation,
    options: ConvertOptions,
) -> Result<ConversionReport, ConversionFailure> {
    Converter::new(source, dest, options).run().await
}
