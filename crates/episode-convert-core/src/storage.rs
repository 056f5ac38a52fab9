//! Storage primitives used by the conversion engine.
//!
//! This module is the only place that touches the filesystem directly. It
//! maps a dataset root (source or destination) plus a relative path to a
//! concrete location and exposes the small set of operations the engine
//! needs from an artifact store:
//!
//! - list files matching a name pattern inside a directory,
//! - read bytes / UTF-8 text,
//! - write bytes atomically (write-then-rename) or stream them through an
//!   [`output::OutputSink`],
//! - copy and delete paths.
//!
//! Only the local filesystem is supported. Higher-level modules work with
//! [`DatasetLocation`] and relative paths so a remote backend can be added
//! without touching the conversion logic.

mod error;
pub mod output;

pub use error::{BackendError, StorageError};
pub(crate) use error::{NotAFileSnafu, OtherIoSnafu};

use snafu::{Backtrace, prelude::*};
use std::{
    fmt, io,
    path::{Path, PathBuf},
};
use tokio::{fs, io::AsyncWriteExt};

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Root of a dataset tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DatasetLocation {
    /// A dataset stored on the local filesystem at the given path.
    Local(PathBuf),
}

impl DatasetLocation {
    /// Creates a new `DatasetLocation` for a local filesystem path.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        DatasetLocation::Local(root.into())
    }

    /// Absolute path of `rel` under this root.
    ///
    /// External tools (for example the video encoder) need real paths
    /// rather than root-relative ones.
    pub fn resolve(&self, rel: &Path) -> PathBuf {
        join_local(self, rel)
    }

    /// The root directory itself.
    pub fn root(&self) -> &Path {
        match self {
            DatasetLocation::Local(root) => root,
        }
    }
}

impl fmt::Display for DatasetLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetLocation::Local(root) => write!(f, "{}", root.display()),
        }
    }
}

fn join_local(location: &DatasetLocation, rel: &Path) -> PathBuf {
    match location {
        DatasetLocation::Local(root) => root.join(rel),
    }
}

/// Classify an `io::Error` on `abs` into `NotFound` or `OtherIo`.
fn map_io(abs: &Path, e: io::Error) -> StorageError {
    let path = abs.display().to_string();
    if e.kind() == io::ErrorKind::NotFound {
        StorageError::NotFound {
            path,
            source: BackendError::Local(e),
            backtrace: Backtrace::capture(),
        }
    } else {
        StorageError::OtherIo {
            path,
            source: BackendError::Local(e),
            backtrace: Backtrace::capture(),
        }
    }
}

pub(crate) async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: parent.display().to_string(),
            })?;
    }
    Ok(())
}

/// Guard that removes a temporary file on drop unless disarmed.
/// Used to ensure cleanup on error paths during atomic writes, and for
/// scratch files (such as concat manifests) that must never outlive a step.
pub(crate) struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// Disarm the guard so the file is NOT removed on drop.
    /// Call this after a successful rename.
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            // Best-effort cleanup; we are likely already handling another error.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Write `contents` to `rel_path` inside `location` using an atomic write.
///
/// The payload is written to a temporary sibling, synced, and renamed into
/// place. Parent directories are created as needed and an existing file is
/// replaced.
pub async fn write_atomic(
    location: &DatasetLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    match location {
        DatasetLocation::Local(_) => {
            let abs = join_local(location, rel_path);

            create_parent_dir(&abs).await?;

            let tmp_path = abs.with_extension("tmp");
            let mut guard = TempFileGuard::new(tmp_path.clone());

            {
                let mut file = fs::File::create(&tmp_path)
                    .await
                    .map_err(BackendError::Local)
                    .context(OtherIoSnafu {
                        path: tmp_path.display().to_string(),
                    })?;

                file.write_all(contents)
                    .await
                    .map_err(BackendError::Local)
                    .context(OtherIoSnafu {
                        path: tmp_path.display().to_string(),
                    })?;

                file.sync_all()
                    .await
                    .map_err(BackendError::Local)
                    .context(OtherIoSnafu {
                        path: tmp_path.display().to_string(),
                    })?;
            }

            fs::rename(&tmp_path, &abs)
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu {
                    path: abs.display().to_string(),
                })?;

            guard.disarm();

            Ok(())
        }
    }
}

/// Read the file at `rel_path` and return its contents as a `String`.
pub async fn read_to_string(location: &DatasetLocation, rel_path: &Path) -> StorageResult<String> {
    match location {
        DatasetLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            fs::read_to_string(&abs).await.map_err(|e| map_io(&abs, e))
        }
    }
}

/// Read the full contents of a file at `rel_path`.
pub async fn read_all_bytes(location: &DatasetLocation, rel_path: &Path) -> StorageResult<Vec<u8>> {
    match location {
        DatasetLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            fs::read(&abs).await.map_err(|e| map_io(&abs, e))
        }
    }
}

/// Whether a regular file or directory exists at `rel_path`.
pub async fn exists(location: &DatasetLocation, rel_path: &Path) -> StorageResult<bool> {
    match location {
        DatasetLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            match fs::metadata(&abs).await {
                Ok(_) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(BackendError::Local(e)).context(OtherIoSnafu {
                    path: abs.display().to_string(),
                }),
            }
        }
    }
}

/// Length in bytes of the regular file at `rel_path`.
///
/// A directory or other non-regular entry is reported as `NotAFile`.
pub async fn file_len(location: &DatasetLocation, rel_path: &Path) -> StorageResult<u64> {
    match location {
        DatasetLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            let meta = fs::metadata(&abs).await.map_err(|e| map_io(&abs, e))?;
            if !meta.is_file() {
                return NotAFileSnafu {
                    path: abs.display().to_string(),
                }
                .fail();
            }
            Ok(meta.len())
        }
    }
}

/// List regular files directly inside `rel_dir` whose names match `pattern`.
///
/// `pattern` supports `*` (any run of characters) and `?` (one character).
/// Results are relative to the location root and sorted by file name. A
/// missing directory yields an empty list.
pub async fn list_matching(
    location: &DatasetLocation,
    rel_dir: &Path,
    pattern: &str,
) -> StorageResult<Vec<PathBuf>> {
    match location {
        DatasetLocation::Local(_) => {
            let abs = join_local(location, rel_dir);
            let mut entries = match fs::read_dir(&abs).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(map_io(&abs, e)),
            };

            let mut names = Vec::new();
            while let Some(entry) = entries.next_entry().await.map_err(|e| map_io(&abs, e))? {
                let file_type = entry.file_type().await.map_err(|e| map_io(&abs, e))?;
                if !file_type.is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if wildcard_match(pattern, &name) {
                    names.push(name);
                }
            }
            names.sort();
            Ok(names.into_iter().map(|n| rel_dir.join(n)).collect())
        }
    }
}

/// Absolute, symlink-free path of the location's root.
///
/// A root that does not exist yet resolves through its nearest existing
/// ancestor, so two roots can be compared before either is created.
pub async fn canonical_root(location: &DatasetLocation) -> StorageResult<PathBuf> {
    match location {
        DatasetLocation::Local(root) => {
            let abs = std::path::absolute(root)
                .map_err(BackendError::Local)
                .context(OtherIoSnafu {
                    path: root.display().to_string(),
                })?;
            for base in abs.ancestors() {
                match fs::canonicalize(base).await {
                    Ok(canonical) => {
                        let rest = abs.strip_prefix(base).unwrap_or(Path::new(""));
                        if rest.as_os_str().is_empty() {
                            return Ok(canonical);
                        }
                        return Ok(canonical.join(rest));
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(map_io(base, e)),
                }
            }
            Ok(abs)
        }
    }
}

/// Whether `rel_dir` is missing or contains no entries at all.
pub async fn is_empty_dir(location: &DatasetLocation, rel_dir: &Path) -> StorageResult<bool> {
    match location {
        DatasetLocation::Local(_) => {
            let abs = join_local(location, rel_dir);
            let mut entries = match fs::read_dir(&abs).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
                Err(e) => return Err(map_io(&abs, e)),
            };
            Ok(entries
                .next_entry()
                .await
                .map_err(|e| map_io(&abs, e))?
                .is_none())
        }
    }
}

/// Copy a file from one location to another with write-then-rename semantics.
///
/// Returns the number of bytes copied.
pub async fn copy_file(
    from: &DatasetLocation,
    from_rel: &Path,
    to: &DatasetLocation,
    to_rel: &Path,
) -> StorageResult<u64> {
    let src = join_local(from, from_rel);
    let dst = join_local(to, to_rel);
    create_parent_dir(&dst).await?;

    let tmp_path = dst.with_extension("tmp");
    let mut guard = TempFileGuard::new(tmp_path.clone());

    let copied = fs::copy(&src, &tmp_path)
        .await
        .map_err(|e| map_io(&src, e))?;

    fs::rename(&tmp_path, &dst)
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu {
            path: dst.display().to_string(),
        })?;

    guard.disarm();
    Ok(copied)
}

/// Delete a file or a whole directory tree. Missing paths are not an error.
pub async fn remove_path(location: &DatasetLocation, rel_path: &Path) -> StorageResult<()> {
    match location {
        DatasetLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            let meta = match fs::symlink_metadata(&abs).await {
                Ok(m) => m,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(map_io(&abs, e)),
            };

            let res = if meta.is_dir() {
                fs::remove_dir_all(&abs).await
            } else {
                fs::remove_file(&abs).await
            };

            match res {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(map_io(&abs, e)),
            }
        }
    }
}

/// Match `name` against a glob-like `pattern` (`*` and `?` only).
fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();

    let (mut pi, mut ni) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ni;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ni = mark;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
