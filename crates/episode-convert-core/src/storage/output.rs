//! Streaming output for files too large to buffer whole.
//!
//! An [`OutputSink`] writes to a temp file beside its target; [`OutputSink::finish`]
//! flushes and renames it into place. A sink dropped before `finish` leaves no
//! trace at the target path.

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};

use snafu::ResultExt;
use tokio::fs;

use crate::storage::{
    BackendError, DatasetLocation, OtherIoSnafu, StorageResult, TempFileGuard, create_parent_dir,
    join_local,
};

/// Local filesystem sink that writes to a temp file and renames on finish.
struct LocalSink {
    tmp_path: PathBuf,
    final_path: PathBuf,
    writer: io::BufWriter<std::fs::File>,
    guard: TempFileGuard,
}

impl LocalSink {
    async fn open(location: &DatasetLocation, rel_path: &Path) -> StorageResult<Self> {
        let final_path = join_local(location, rel_path);
        create_parent_dir(&final_path).await?;

        let tmp_path = final_path.with_extension("tmp");

        // Arrow writers require std::io::Write.
        let file = std::fs::File::create(&tmp_path)
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: tmp_path.display().to_string(),
            })?;

        let writer = io::BufWriter::new(file);
        let guard = TempFileGuard::new(tmp_path.clone());

        Ok(Self {
            tmp_path,
            final_path,
            writer,
            guard,
        })
    }

    async fn finish(mut self) -> StorageResult<()> {
        self.writer
            .flush()
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: self.tmp_path.display().to_string(),
            })?;

        self.writer
            .get_ref()
            .sync_all()
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: self.tmp_path.display().to_string(),
            })?;

        fs::rename(&self.tmp_path, &self.final_path)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: self.final_path.display().to_string(),
            })?;

        self.guard.disarm();
        Ok(())
    }
}

enum OutputSinkInner {
    Local(LocalSink),
}

/// A streaming output sink for writing bytes to a storage backend.
///
/// Callers obtain a sink via [`open_output_sink`] and stream bytes through its
/// `Write` implementation (for example by handing it to a Parquet
/// `ArrowWriter`). Finalization is explicit via [`OutputSink::finish`]; a sink
/// dropped without finishing leaves nothing behind at the target path.
pub struct OutputSink {
    inner: OutputSinkInner,
}

impl OutputSink {
    /// Flush, fsync, and commit to the final location.
    pub async fn finish(self) -> StorageResult<()> {
        match self.inner {
            OutputSinkInner::Local(s) => s.finish().await,
        }
    }
}

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.inner {
            OutputSinkInner::Local(s) => s.writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            OutputSinkInner::Local(s) => s.writer.flush(),
        }
    }
}

/// Open a streaming output sink at `location` + `rel_path`.
///
/// For local filesystems this writes to a temp file and renames it into
/// place on `finish()`.
pub async fn open_output_sink(
    location: &DatasetLocation,
    rel_path: &Path,
) -> StorageResult<OutputSink> {
    match location {
        DatasetLocation::Local(_) => {
            let sink = LocalSink::open(location, rel_path).await?;
            Ok(OutputSink {
                inner: OutputSinkInner::Local(sink),
            })
        }
    }
}
