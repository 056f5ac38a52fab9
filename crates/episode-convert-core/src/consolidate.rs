//! Consolidation of per-episode artifacts into chunked files.
//!
//! - [`cursor`]: pure row, time and file bookkeeping.
//! - [`tabular`]: Parquet episodes into `data/chunk-XXX/file-YYY.parquet`.
//! - [`video`]: MP4 episodes into `videos/<key>/chunk-XXX/file-YYY.mp4`.

pub mod cursor;
pub mod tabular;
pub mod video;

pub use cursor::{FileCursor, FileLimits, Placement, RowCursor, RowRange, TimeCursor, TimeRange};
pub use tabular::{
    AppendedEpisode, EpisodeDataPlacement, TabularConsolidator, TabularError, TabularResult,
    TabularSummary,
};
pub use video::{
    ConcatFailure, ConcatRequest, DegradedVideo, EpisodeVideoPlacement, FfmpegConcatenator,
    VideoConcatenator, VideoConsolidator, VideoError, VideoResult, VideoSummary,
};
