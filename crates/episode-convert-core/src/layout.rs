//! Directory and file layout conventions for both dataset versions.
//!
//! The source (v2.1) layout keeps one Parquet file per episode and one video
//! file per episode per camera; the target (v3.0) layout groups episodes into
//! `chunk-XXX/file-YYY` files. Descriptor path templates use Python
//! `str.format` placeholders (`{episode_index:06d}`), rendered here by
//! [`render_path_template`].
//!
//! ```text
//! <source_root>/                      <target_root>/
//!   meta/info.json                      meta/info.json
//!   meta/episodes.jsonl                 meta/episodes/chunk-000/file-000.parquet
//!   meta/episodes_stats.jsonl           meta/stats.json
//!   meta/tasks.jsonl                    meta/tasks.parquet
//!   data/chunk-000/episode_000000.parquet
//!                                       data/chunk-000/file-000.parquet
//!   videos/chunk-000/<key>/episode_000000.mp4
//!                                       videos/<key>/chunk-000/file-000.mp4
//! ```

use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Version tag of the source layout.
pub const SOURCE_VERSION: &str = "v2.1";
/// Version tag of the target layout.
pub const TARGET_VERSION: &str = "v3.0";

/// Dataset descriptor (both versions).
pub const INFO_PATH: &str = "meta/info.json";
/// Optional human-readable dataset card (both versions).
pub const README_PATH: &str = "README.md";

/// v2.1 episode index, one JSON record per line.
pub const SOURCE_EPISODES_PATH: &str = "meta/episodes.jsonl";
/// v2.1 per-episode statistics, one JSON record per line.
pub const SOURCE_EPISODES_STATS_PATH: &str = "meta/episodes_stats.jsonl";
/// v2.1 task vocabulary, one JSON record per line.
pub const SOURCE_TASKS_PATH: &str = "meta/tasks.jsonl";
/// v2.1 data path template used when the descriptor carries none.
pub const SOURCE_DATA_PATH_TEMPLATE: &str =
    "data/chunk-{episode_chunk:03d}/episode_{episode_index:06d}.parquet";
/// v2.1 video path template used when the descriptor carries none.
pub const SOURCE_VIDEO_PATH_TEMPLATE: &str =
    "videos/chunk-{episode_chunk:03d}/{video_key}/episode_{episode_index:06d}.mp4";
/// v2.1 default number of episodes per chunk directory.
pub const SOURCE_DEFAULT_CHUNKS_SIZE: u64 = 1000;

/// v3.0 data path template.
pub const TARGET_DATA_PATH_TEMPLATE: &str =
    "data/chunk-{chunk_index:03d}/file-{file_index:03d}.parquet";
/// v3.0 video path template.
pub const TARGET_VIDEO_PATH_TEMPLATE: &str =
    "videos/{video_key}/chunk-{chunk_index:03d}/file-{file_index:03d}.mp4";
/// v3.0 episode metadata path template.
pub const TARGET_EPISODES_PATH_TEMPLATE: &str =
    "meta/episodes/chunk-{chunk_index:03d}/file-{file_index:03d}.parquet";
/// v3.0 task vocabulary.
pub const TARGET_TASKS_PATH: &str = "meta/tasks.parquet";
/// v3.0 dataset-wide statistics.
pub const TARGET_STATS_PATH: &str = "meta/stats.json";
/// Provenance report written alongside the converted metadata.
pub const CONVERSION_REPORT_PATH: &str = "meta/conversion_report.json";

/// Coordinates of one consolidated file within its chunk group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileLocator {
    /// Chunk directory index (`chunk-XXX`).
    pub chunk_index: u64,
    /// File index within the chunk (`file-YYY`).
    pub file_index: u64,
}

impl FileLocator {
    /// The first file of the first chunk.
    pub const FIRST: FileLocator = FileLocator {
        chunk_index: 0,
        file_index: 0,
    };

    /// The locator following this one when each chunk holds
    /// `files_per_chunk` files.
    pub fn next(self, files_per_chunk: u64) -> FileLocator {
        let files_per_chunk = files_per_chunk.max(1);
        if self.file_index + 1 >= files_per_chunk {
            FileLocator {
                chunk_index: self.chunk_index + 1,
                file_index: 0,
            }
        } else {
            FileLocator {
                chunk_index: self.chunk_index,
                file_index: self.file_index + 1,
            }
        }
    }
}

impl fmt::Display for FileLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk-{:03}/file-{:03}", self.chunk_index, self.file_index)
    }
}

/// A value substituted into a path template.
#[derive(Debug, Clone, Copy)]
pub enum TemplateArg<'a> {
    /// Integer placeholder (supports `:0Nd` padding).
    Int(u64),
    /// Text placeholder (no format spec allowed).
    Text(&'a str),
}

/// Errors produced while rendering a descriptor path template.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum TemplateError {
    /// The template references a name the caller did not provide.
    #[snafu(display("Unknown placeholder {{{name}}} in path template {template:?}"))]
    UnknownPlaceholder {
        /// The full template.
        template: String,
        /// The unresolved placeholder name.
        name: String,
    },

    /// Unbalanced braces or an empty placeholder.
    #[snafu(display("Malformed path template {template:?}: {detail}"))]
    Malformed {
        /// The full template.
        template: String,
        /// What is wrong with it.
        detail: String,
    },

    /// The format spec is not `d`, `Nd` or `0Nd`, or was applied to text.
    #[snafu(display("Unsupported format spec {spec:?} for {{{name}}} in {template:?}"))]
    UnsupportedSpec {
        /// The full template.
        template: String,
        /// Placeholder name.
        name: String,
        /// The offending spec.
        spec: String,
    },
}

/// Render a Python-style path template such as
/// `data/chunk-{episode_chunk:03d}/episode_{episode_index:06d}.parquet`.
///
/// `{{` and `}}` render literal braces.
pub fn render_path_template(
    template: &str,
    args: &[(&str, TemplateArg<'_>)],
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len() + 8);
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => {
                return MalformedSnafu {
                    template,
                    detail: "unmatched '}'",
                }
                .fail();
            }
            '{' => {
                let mut body = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    body.push(c);
                }
                ensure!(
                    closed,
                    MalformedSnafu {
                        template,
                        detail: "unterminated '{'",
                    }
                );

                let (name, spec) = match body.split_once(':') {
                    Some((n, s)) => (n, Some(s)),
                    None => (body.as_str(), None),
                };
                ensure!(
                    !name.is_empty(),
                    MalformedSnafu {
                        template,
                        detail: "empty placeholder",
                    }
                );

                let arg = args
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, a)| *a)
                    .context(UnknownPlaceholderSnafu { template, name })?;

                render_arg(&mut out, template, name, spec, arg)?;
            }
            other => out.push(other),
        }
    }

    Ok(out)
}

fn render_arg(
    out: &mut String,
    template: &str,
    name: &str,
    spec: Option<&str>,
    arg: TemplateArg<'_>,
) -> Result<(), TemplateError> {
    let unsupported = || {
        UnsupportedSpecSnafu {
            template,
            name,
            spec: spec.unwrap_or_default(),
        }
        .build()
    };

    match (arg, spec) {
        (TemplateArg::Text(s), None) => out.push_str(s),
        (TemplateArg::Text(_), Some(_)) => return Err(unsupported()),
        (TemplateArg::Int(v), None) => out.push_str(&v.to_string()),
        (TemplateArg::Int(v), Some(spec)) => {
            let digits = spec.strip_suffix('d').ok_or_else(unsupported)?;
            let (zero_pad, width) = match digits.strip_prefix('0') {
                Some(rest) => (true, rest),
                None => (false, digits),
            };
            let width: usize = if width.is_empty() {
                0
            } else {
                width.parse().map_err(|_| unsupported())?
            };
            if zero_pad {
                out.push_str(&format!("{v:0width$}"));
            } else {
                out.push_str(&format!("{v:width$}"));
            }
        }
    }
    Ok(())
}

/// Relative path of the v3.0 data file at `locator`.
pub fn target_data_path(locator: FileLocator) -> Result<PathBuf, TemplateError> {
    render_locator(TARGET_DATA_PATH_TEMPLATE, locator, None)
}

/// Relative path of the v3.0 video container for `video_key` at `locator`.
pub fn target_video_path(video_key: &str, locator: FileLocator) -> Result<PathBuf, TemplateError> {
    render_locator(TARGET_VIDEO_PATH_TEMPLATE, locator, Some(video_key))
}

/// Relative path of the v3.0 episode metadata file at `locator`.
pub fn target_episodes_path(locator: FileLocator) -> Result<PathBuf, TemplateError> {
    render_locator(TARGET_EPISODES_PATH_TEMPLATE, locator, None)
}

fn render_locator(
    template: &str,
    locator: FileLocator,
    video_key: Option<&str>,
) -> Result<PathBuf, TemplateError> {
    let mut args = vec![
        ("chunk_index", TemplateArg::Int(locator.chunk_index)),
        ("file_index", TemplateArg::Int(locator.file_index)),
    ];
    if let Some(key) = video_key {
        args.push(("video_key", TemplateArg::Text(key)));
    }
    render_path_template(template, &args).map(PathBuf::from)
}

/// Relative path of one source episode file, rendered from a v2.1 template.
pub fn source_episode_path(
    template: &str,
    chunks_size: u64,
    episode_index: u64,
    video_key: Option<&str>,
) -> Result<PathBuf, TemplateError> {
    let episode_chunk = episode_index / chunks_size.max(1);
    let mut args = vec![
        ("episode_chunk", TemplateArg::Int(episode_chunk)),
        ("episode_index", TemplateArg::Int(episode_index)),
    ];
    if let Some(key) = video_key {
        args.push(("video_key", TemplateArg::Text(key)));
    }
    render_path_template(template, &args).map(PathBuf::from)
}
