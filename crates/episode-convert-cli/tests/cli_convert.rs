//! Integration tests for the CLI binary.

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::TempDir;

mod common;

use common::{TestResult, write_source_dataset};

fn cli() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("episode-convert"));
    cmd.env("RUST_LOG", "warn");
    cmd
}

#[test]
fn convert_to_default_destination_then_verify() -> TestResult {
    let tmp = TempDir::new()?;
    let source = tmp.path().join("wave_set");
    write_source_dataset(&source)?;

    cli()
        .args(["convert", "--source", source.to_string_lossy().as_ref()])
        .assert()
        .success()
        .stdout(contains("Converted 2 episodes (10 frames, 1 tasks)"))
        .stdout(contains("wave_set_v30"));

    let dest = tmp.path().join("wave_set_v30");
    assert!(dest.join("meta/info.json").exists());
    assert!(dest.join("data/chunk-000/file-000.parquet").exists());
    assert!(dest.join("meta/episodes/chunk-000/file-000.parquet").exists());

    cli()
        .args(["verify", "--root", dest.to_string_lossy().as_ref()])
        .assert()
        .success()
        .stdout(contains("OK: 2 episodes, 10 frames, 1 data files"));
    Ok(())
}

#[test]
fn rerun_is_refused_without_overwrite() -> TestResult {
    let tmp = TempDir::new()?;
    let source = tmp.path().join("src");
    let dest = tmp.path().join("out");
    write_source_dataset(&source)?;
    let args = [
        "convert",
        "--source",
        source.to_str().ok_or("utf-8 path")?,
        "--dest",
        dest.to_str().ok_or("utf-8 path")?,
    ];

    cli().args(args).assert().success();
    cli()
        .args(args)
        .assert()
        .failure()
        .stderr(contains("is not empty"));
    cli().args(args).arg("--overwrite").assert().success();
    Ok(())
}

#[test]
fn row_cap_from_environment_splits_data_files() -> TestResult {
    let tmp = TempDir::new()?;
    let source = tmp.path().join("src");
    let dest = tmp.path().join("out");
    write_source_dataset(&source)?;

    cli()
        .env("EPISODE_CONVERT_MAX_ROWS_PER_FILE", "5")
        .args([
            "convert",
            "--source",
            source.to_string_lossy().as_ref(),
            "--dest",
            dest.to_string_lossy().as_ref(),
        ])
        .assert()
        .success()
        .stdout(contains("Data files: 2"));

    assert!(dest.join("data/chunk-000/file-001.parquet").exists());
    cli()
        .args(["verify", "--root", dest.to_string_lossy().as_ref()])
        .assert()
        .success();
    Ok(())
}

#[test]
fn missing_source_reports_missing_artifact() -> TestResult {
    let tmp = TempDir::new()?;
    let source = tmp.path().join("empty");
    std::fs::create_dir_all(&source)?;

    cli()
        .args(["convert", "--source", source.to_string_lossy().as_ref()])
        .assert()
        .failure()
        .stderr(contains("Missing source artifact: meta/info.json"));
    assert!(!tmp.path().join("empty_v30").exists());
    Ok(())
}

#[test]
fn verify_rejects_unconverted_root() -> TestResult {
    let tmp = TempDir::new()?;
    let source = tmp.path().join("src");
    write_source_dataset(&source)?;

    cli()
        .args(["verify", "--root", source.to_string_lossy().as_ref()])
        .assert()
        .failure()
        .stderr(contains("Expected codebase_version v3.0"));
    Ok(())
}
