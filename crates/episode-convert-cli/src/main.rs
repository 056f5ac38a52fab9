//! CLI tool for converting episodic robot datasets to the v3.0 layout.

mod error;

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use episode_convert_core::{
    ChunkingConfig, ConvertOptions, Converter, DatasetLocation, consolidate::FfmpegConcatenator,
    verify_converted,
};
use log::warn;
use snafu::{OptionExt, ResultExt, ensure};

use crate::error::{
    CliResult, ConvertSnafu, InconsistentSnafu, NoDefaultDestinationSnafu, VerifySnafu,
};

#[derive(Debug, Args)]
struct ConvertArgs {
    /// Root of the v2.1 dataset
    #[arg(long)]
    source: PathBuf,

    /// Destination root (default: `<source>_v30` next to the source)
    #[arg(long)]
    dest: Option<PathBuf>,

    /// Remove a non-empty destination instead of refusing it
    #[arg(long, default_value_t = false)]
    overwrite: bool,

    /// Program used to join videos losslessly
    #[arg(long, env = "EPISODE_CONVERT_FFMPEG", default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    /// Files per chunk directory
    #[arg(long, env = "EPISODE_CONVERT_CHUNKS_SIZE",
          default_value_t = ChunkingConfig::default().chunks_size)]
    chunks_size: u64,

    /// Target data file size in MiB
    #[arg(long, env = "EPISODE_CONVERT_DATA_FILE_SIZE_MB",
          default_value_t = ChunkingConfig::default().data_files_size_in_mb)]
    data_file_size_mb: u64,

    /// Target video file size in MiB
    #[arg(long, env = "EPISODE_CONVERT_VIDEO_FILE_SIZE_MB",
          default_value_t = ChunkingConfig::default().video_files_size_in_mb)]
    video_file_size_mb: u64,

    /// Hard cap on rows per data file
    #[arg(long, env = "EPISODE_CONVERT_MAX_ROWS_PER_FILE")]
    max_rows_per_file: Option<u64>,

    /// Episodes per episode metadata file
    #[arg(long, env = "EPISODE_CONVERT_EPISODES_PER_META_FILE",
          default_value_t = ChunkingConfig::default().episodes_per_meta_file)]
    episodes_per_meta_file: u64,

    /// Print elapsed time
    #[arg(long, default_value_t = false)]
    timing: bool,
}

impl ConvertArgs {
    fn options(&self) -> ConvertOptions {
        ConvertOptions {
            chunking: ChunkingConfig {
                chunks_size: self.chunks_size,
                data_files_size_in_mb: self.data_file_size_mb,
                video_files_size_in_mb: self.video_file_size_mb,
                max_rows_per_file: self.max_rows_per_file,
                episodes_per_meta_file: self.episodes_per_meta_file,
            },
            overwrite: self.overwrite,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Convert a v2.1 dataset root into the v3.0 layout
    Convert(ConvertArgs),

    /// Check a converted root for row and time range consistency
    Verify {
        #[arg(long)]
        root: PathBuf,
    },
}

#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

/// `<source>_v30`, next to the source root.
fn default_destination(source: &Path) -> CliResult<PathBuf> {
    let name = source
        .file_name()
        .context(NoDefaultDestinationSnafu {
            path: source.display().to_string(),
        })?
        .to_string_lossy();
    Ok(source.with_file_name(format!("{name}_v30")))
}

async fn cmd_convert(args: ConvertArgs) -> CliResult<()> {
    let start = Instant::now();
    let dest = match &args.dest {
        Some(dest) => dest.clone(),
        None => default_destination(&args.source)?,
    };

    let mut converter = Converter::new(
        DatasetLocation::local(&args.source),
        DatasetLocation::local(&dest),
        args.options(),
    )
    .with_concatenator(FfmpegConcatenator::new(&args.ffmpeg));
    let report = converter.run().await.context(ConvertSnafu)?;

    for degraded in &report.degraded_videos {
        warn!(
            "{}: episode {} has no footage in {} ({})",
            degraded.video_key, degraded.episode_index, degraded.locator, degraded.reason
        );
    }

    println!(
        "Converted {} episodes ({} frames, {} tasks) into {}",
        report.total_episodes,
        report.total_frames,
        report.total_tasks,
        dest.display()
    );
    println!(
        "Data files: {}, episode metadata files: {}, degraded videos: {}",
        report.data_files.len(),
        report.episode_meta_files.len(),
        report.degraded_videos.len()
    );
    if args.timing {
        println!("elapsed_ms: {}", start.elapsed().as_millis());
    }
    Ok(())
}

async fn cmd_verify(root: &Path) -> CliResult<()> {
    let path = root.display().to_string();
    let report = verify_converted(&DatasetLocation::local(root))
        .await
        .context(VerifySnafu { path: &path })?;

    for problem in &report.problems {
        eprintln!("problem: {problem}");
    }
    for (key, count) in &report.degraded_videos {
        println!("{key}: {count} episode(s) without footage");
    }
    ensure!(
        report.is_ok(),
        InconsistentSnafu {
            path: &path,
            problems: report.problems.len(),
        }
    );

    println!(
        "OK: {} episodes, {} frames, {} data files",
        report.episodes, report.frames, report.data_files
    );
    Ok(())
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Command::Convert(args) => cmd_convert(args).await,
        Command::Verify { root } => cmd_verify(&root).await,
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_destination_is_a_sibling() {
        let dest = default_destination(Path::new("/data/robot_set")).expect("has a name");
        assert_eq!(dest, PathBuf::from("/data/robot_set_v30"));
    }

    #[test]
    fn default_destination_needs_a_name() {
        assert!(default_destination(Path::new("/")).is_err());
    }

    #[test]
    fn flags_map_onto_options() {
        let cli = Cli::try_parse_from([
            "episode-convert",
            "convert",
            "--source",
            "/x",
            "--chunks-size",
            "5",
            "--max-rows-per-file",
            "100",
            "--overwrite",
        ])
        .expect("valid arguments");
        let Command::Convert(args) = cli.cmd else {
            panic!("expected convert");
        };
        let options = args.options();
        assert!(options.overwrite);
        assert_eq!(options.chunking.chunks_size, 5);
        assert_eq!(options.chunking.max_rows_per_file, Some(100));
        assert_eq!(options.chunking.data_files_size_in_mb, 200);
    }
}
