//! Video consolidation: per-episode MP4 files into chunked containers, one
//! camera stream at a time.
//!
//! Consecutive episodes are grouped with the same [`FileCursor`] rule as the
//! tabular data, sized by source file length. A group of one is copied
//! verbatim. Larger groups are joined without re-encoding by a
//! [`VideoConcatenator`]. When joining fails, the group's first episode is
//! copied instead and every other episode of the group is reported as
//! degraded with no time range, so no episode ever points at footage that is
//! not there.

use std::{
    collections::BTreeMap,
    future::Future,
    io,
    path::{Path, PathBuf},
    process::Stdio,
};

use log::{debug, warn};
use serde::Serialize;
use snafu::prelude::*;
use tokio::process::Command;

use crate::{
    consolidate::cursor::{FileCursor, FileLimits, TimeCursor, TimeRange},
    layout::{FileLocator, TemplateError, target_video_path},
    storage::{self, DatasetLocation, StorageError, TempFileGuard},
};

/// Inputs of one join.
#[derive(Debug, Clone, Copy)]
pub struct ConcatRequest<'a> {
    /// Absolute path of the concat manifest listing `inputs`.
    pub manifest: &'a Path,
    /// Absolute paths of the files to join, in order.
    pub inputs: &'a [PathBuf],
    /// Absolute path of the joined file.
    pub output: &'a Path,
}

/// Why a join failed.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConcatFailure {
    /// The encoder could not be started.
    #[snafu(display("Cannot run {program}: {source}"))]
    Spawn {
        /// Program that was invoked.
        program: String,
        /// Underlying IO error.
        source: io::Error,
    },

    /// The encoder ran and reported failure.
    #[snafu(display("{program} exited with {status}: {stderr}"))]
    Exit {
        /// Program that was invoked.
        program: String,
        /// Exit status as text.
        status: String,
        /// Captured standard error.
        stderr: String,
    },
}

/// Lossless joining of video files.
pub trait VideoConcatenator {
    /// Join `request.inputs` into `request.output`.
    fn concat(
        &self,
        request: &ConcatRequest<'_>,
    ) -> impl Future<Output = Result<(), ConcatFailure>> + Send;
}

/// Joins with `ffmpeg -f concat -c copy`.
#[derive(Debug, Clone)]
pub struct FfmpegConcatenator {
    program: PathBuf,
}

impl Default for FfmpegConcatenator {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegConcatenator {
    /// Use `program` as the ffmpeg executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl VideoConcatenator for FfmpegConcatenator {
    async fn concat(&self, request: &ConcatRequest<'_>) -> Result<(), ConcatFailure> {
        let program = self.program.display().to_string();
        let output = Command::new(&self.program)
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-f", "concat", "-safe", "0", "-i"])
            .arg(request.manifest)
            .args(["-c", "copy"])
            .arg(request.output)
            .stdin(Stdio::null())
            .output()
            .await
            .context(SpawnSnafu { program: &program })?;

        ensure!(
            output.status.success(),
            ExitSnafu {
                program,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
        );
        Ok(())
    }
}

/// Fatal video consolidation errors. Encoder failures are not among them.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum VideoError {
    /// A source video could not be inspected.
    #[snafu(display("Cannot read source video {path}: {source}"))]
    ReadSource {
        /// Source file.
        path: String,
        /// Underlying storage error.
        source: StorageError,
    },

    /// Writing into the destination failed.
    #[snafu(display("Cannot write {path}: {source}"))]
    WriteTarget {
        /// Target file.
        path: String,
        /// Underlying storage error.
        source: StorageError,
    },

    /// The target path could not be rendered.
    #[snafu(display("Cannot render video path: {source}"))]
    VideoPath {
        /// Underlying template error.
        source: TemplateError,
    },
}

/// Result alias for video consolidation.
pub type VideoResult<T> = Result<T, VideoError>;

/// Where one episode's footage landed in one camera stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpisodeVideoPlacement {
    /// Container holding (or meant to hold) the episode.
    pub locator: FileLocator,
    /// Seconds from the start of the container; `None` when degraded.
    pub time: Option<TimeRange>,
}

/// An episode whose footage is missing from the consolidated output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DegradedVideo {
    /// Camera stream.
    pub video_key: String,
    /// Episode index.
    pub episode_index: u64,
    /// Container the episode was assigned to.
    pub locator: FileLocator,
    /// Why the footage is missing.
    pub reason: String,
}

/// Outcome of consolidating one camera stream.
#[derive(Debug, Clone, Default)]
pub struct VideoSummary {
    /// Placement per episode index.
    pub placements: BTreeMap<u64, EpisodeVideoPlacement>,
    /// Episodes whose footage was lost.
    pub degraded: Vec<DegradedVideo>,
    /// Containers written, in order.
    pub files: Vec<FileLocator>,
}

#[derive(Debug)]
struct Pending {
    episode_index: u64,
    source: PathBuf,
    time: TimeRange,
}

/// Consolidates one camera stream.
pub struct VideoConsolidator<'c, C> {
    source: DatasetLocation,
    dest: DatasetLocation,
    video_key: String,
    fps: u32,
    limits: FileLimits,
    concatenator: &'c C,
    files: FileCursor,
    time: TimeCursor,
    group: Vec<Pending>,
    summary: VideoSummary,
}

impl<'c, C: VideoConcatenator> VideoConsolidator<'c, C> {
    /// New consolidator for `video_key`.
    pub fn new(
        source: DatasetLocation,
        dest: DatasetLocation,
        video_key: impl Into<String>,
        fps: u32,
        limits: FileLimits,
        concatenator: &'c C,
    ) -> Self {
        Self {
            source,
            dest,
            video_key: video_key.into(),
            fps,
            limits,
            concatenator,
            files: FileCursor::default(),
            time: TimeCursor::default(),
            group: Vec::new(),
            summary: VideoSummary::default(),
        }
    }

    /// Append one episode's video of `length` frames.
    pub async fn append_episode(
        &mut self,
        episode_index: u64,
        source_rel: &Path,
        length: u64,
    ) -> VideoResult<()> {
        let bytes = storage::file_len(&self.source, source_rel)
            .await
            .context(ReadSourceSnafu {
                path: source_rel.display().to_string(),
            })?;

        let previous = self.files.locator();
        let (files, placement) = self.files.place(&self.limits, bytes, length);
        self.files = files;
        if placement.new_file {
            self.flush(previous).await?;
            self.time = TimeCursor::default();
        }

        let (time, range) = self.time.advance(length, self.fps);
        self.time = time;
        self.group.push(Pending {
            episode_index,
            source: source_rel.to_path_buf(),
            time: range,
        });
        Ok(())
    }

    /// Flush the last group and return the stream's summary.
    pub async fn finish(mut self) -> VideoResult<VideoSummary> {
        let current = self.files.locator();
        self.flush(current).await?;
        Ok(self.summary)
    }

    async fn flush(&mut self, locator: FileLocator) -> VideoResult<()> {
        let group = std::mem::take(&mut self.group);
        let Some(first) = group.first() else {
            return Ok(());
        };
        let target = target_video_path(&self.video_key, locator).context(VideoPathSnafu)?;

        if group.len() == 1 {
            self.copy(&first.source, &target).await?;
            self.record(locator, &group, None);
            return Ok(());
        }

        match self.join(&group, locator, &target).await? {
            None => {
                debug!(
                    "{}: joined {} episodes into {locator}",
                    self.video_key,
                    group.len()
                );
                self.record(locator, &group, None);
            }
            Some(failure) => {
                warn!(
                    "{}: lossless join into {locator} failed ({failure}); \
                     keeping episode {} only",
                    self.video_key, first.episode_index
                );
                let reason = format!("lossless join failed: {failure}");
                match self.copy(&first.source, &target).await {
                    Ok(()) => self.record(locator, &group, Some((1, reason))),
                    Err(copy_err) => {
                        warn!("{}: fallback copy failed: {copy_err}", self.video_key);
                        let reason = format!("{reason}; fallback copy failed: {copy_err}");
                        self.record(locator, &group, Some((0, reason)));
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Run the encoder. `Ok(Some(_))` reports an encoder failure, which is
    /// not fatal.
    async fn join(
        &self,
        group: &[Pending],
        locator: FileLocator,
        target: &Path,
    ) -> VideoResult<Option<ConcatFailure>> {
        let manifest_rel = PathBuf::from(format!(
            ".concat-{}-{:03}-{:03}.txt",
            self.video_key.replace(['/', '\\'], "_"),
            locator.chunk_index,
            locator.file_index
        ));
        let inputs: Vec<PathBuf> = group.iter().map(|p| self.source.resolve(&p.source)).collect();
        let manifest_text: String = inputs
            .iter()
            .map(|p| format!("file '{}'\n", p.display().to_string().replace('\'', r"'\''")))
            .collect();

        let manifest_abs = self.dest.resolve(&manifest_rel);
        let _manifest_guard = TempFileGuard::new(manifest_abs.clone());
        storage::write_atomic(&self.dest, &manifest_rel, manifest_text.as_bytes())
            .await
            .context(WriteTargetSnafu {
                path: manifest_rel.display().to_string(),
            })?;

        let output = self.dest.resolve(target);
        storage::create_parent_dir(&output)
            .await
            .context(WriteTargetSnafu {
                path: target.display().to_string(),
            })?;

        let request = ConcatRequest {
            manifest: &manifest_abs,
            inputs: &inputs,
            output: &output,
        };
        match self.concatenator.concat(&request).await {
            Ok(()) => Ok(None),
            Err(failure) => {
                // Drop any partial output before the fallback copy.
                storage::remove_path(&self.dest, target)
                    .await
                    .context(WriteTargetSnafu {
                        path: target.display().to_string(),
                    })?;
                Ok(Some(failure))
            }
        }
    }

    async fn copy(&self, source_rel: &Path, target: &Path) -> VideoResult<()> {
        storage::copy_file(&self.source, source_rel, &self.dest, target)
            .await
            .context(WriteTargetSnafu {
                path: target.display().to_string(),
            })?;
        Ok(())
    }

    /// Record placements for `group`. With `Some((kept, reason))`, only the
    /// first `kept` episodes keep their time range.
    fn record(&mut self, locator: FileLocator, group: &[Pending], degraded: Option<(usize, String)>) {
        let kept = degraded.as_ref().map_or(group.len(), |(k, _)| *k);
        if kept > 0 {
            self.summary.files.push(locator);
        }
        for (i, pending) in group.iter().enumerate() {
            let time = (i < kept).then_some(pending.time);
            self.summary.placements.insert(
                pending.episode_index,
                EpisodeVideoPlacement { locator, time },
            );
            if let (None, Some((_, reason))) = (time, &degraded) {
                self.summary.degraded.push(DegradedVideo {
                    video_key: self.video_key.clone(),
                    episode_index: pending.episode_index,
                    locator,
                    reason: reason.clone(),
                });
            }
        }
    }
}
