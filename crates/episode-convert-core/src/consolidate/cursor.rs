//! Offset bookkeeping for consolidation.
//!
//! Every cursor is a small `Copy` value advanced by a pure step function that
//! returns the next cursor together with what was assigned, so the
//! orchestrator owns all running state explicitly.

use serde::Serialize;

use crate::layout::FileLocator;

/// Half-open `[from, to)` interval of global row indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RowRange {
    /// First row.
    pub from: u64,
    /// One past the last row.
    pub to: u64,
}

impl RowRange {
    /// Number of rows.
    pub fn len(&self) -> u64 {
        self.to - self.from
    }

    /// Whether the range is empty.
    pub fn is_empty(&self) -> bool {
        self.to == self.from
    }
}

/// Half-open `[from, to)` interval in seconds from the start of a video file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimeRange {
    /// Start, in seconds.
    pub from: f64,
    /// End, in seconds.
    pub to: f64,
}

/// Running global row index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowCursor {
    next: u64,
}

impl RowCursor {
    /// Assign the next `length` rows.
    pub fn advance(self, length: u64) -> (RowCursor, RowRange) {
        let range = RowRange {
            from: self.next,
            to: self.next + length,
        };
        (RowCursor { next: range.to }, range)
    }

    /// Rows assigned so far.
    pub fn position(&self) -> u64 {
        self.next
    }
}

/// Running offset inside one video file, kept in frames so that adjacent
/// ranges share their boundary exactly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeCursor {
    frames: u64,
}

impl TimeCursor {
    /// Assign the next `length` frames at `fps`.
    pub fn advance(self, length: u64, fps: u32) -> (TimeCursor, TimeRange) {
        let fps = f64::from(fps.max(1));
        let end = self.frames + length;
        let range = TimeRange {
            from: self.frames as f64 / fps,
            to: end as f64 / fps,
        };
        (TimeCursor { frames: end }, range)
    }
}

/// Limits deciding when a consolidated file is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLimits {
    /// Close the file before it would exceed this many (source) bytes.
    pub max_bytes: u64,
    /// Close the file before it would exceed this many rows.
    pub max_rows: Option<u64>,
    /// Files per chunk directory.
    pub files_per_chunk: u64,
}

impl FileLimits {
    /// Limits from a size in MiB.
    pub fn from_mb(size_in_mb: u64, max_rows: Option<u64>, files_per_chunk: u64) -> Self {
        Self {
            max_bytes: size_in_mb.saturating_mul(1024 * 1024),
            max_rows,
            files_per_chunk,
        }
    }
}

/// Where an episode landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// File receiving the episode.
    pub locator: FileLocator,
    /// Whether the episode opens a new file (the previous one is complete).
    pub new_file: bool,
}

/// Fill level of the file currently being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileCursor {
    locator: FileLocator,
    bytes: u64,
    rows: u64,
    episodes: u64,
}

impl Default for FileCursor {
    fn default() -> Self {
        Self {
            locator: FileLocator::FIRST,
            bytes: 0,
            rows: 0,
            episodes: 0,
        }
    }
}

impl FileCursor {
    /// Place one episode of `bytes` and `rows`.
    ///
    /// A non-empty file is closed when the episode would push it past a
    /// limit. Episodes are never split, so a single oversized episode still
    /// gets a file of its own.
    pub fn place(self, limits: &FileLimits, bytes: u64, rows: u64) -> (FileCursor, Placement) {
        let over_bytes = self.bytes.saturating_add(bytes) > limits.max_bytes;
        let over_rows = limits
            .max_rows
            .is_some_and(|max| self.rows.saturating_add(rows) > max);

        let new_file = self.episodes > 0 && (over_bytes || over_rows);
        let base = if new_file {
            FileCursor {
                locator: self.locator.next(limits.files_per_chunk),
                ..FileCursor::default()
            }
        } else {
            self
        };

        let next = FileCursor {
            locator: base.locator,
            bytes: base.bytes.saturating_add(bytes),
            rows: base.rows + rows,
            episodes: base.episodes + 1,
        };
        (
            next,
            Placement {
                locator: next.locator,
                new_file: new_file || self.episodes == 0,
            },
        )
    }

    /// File currently being filled.
    pub fn locator(&self) -> FileLocator {
        self.locator
    }

    /// Episodes placed in the current file.
    pub fn episodes(&self) -> u64 {
        self.episodes
    }
}
