//! Shared fixtures: a small v2.1 dataset and fake video encoders.
#![allow(dead_code)]

use std::{path::Path, sync::Arc};

use arrow::{
    array::{ArrayRef, FixedSizeListArray, Float32Array, Int64Array},
    datatypes::{DataType, Field},
    record_batch::RecordBatch,
};
use episode_convert_core::consolidate::{ConcatFailure, ConcatRequest, VideoConcatenator};
use parquet::arrow::ArrowWriter;
use serde_json::json;

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

pub const FPS: u32 = 10;
pub const CAMERAS: [&str; 2] = ["observation.images.front", "observation.images.wrist"];

/// `(length, declared action mean, tasks)` per episode.
pub const EPISODES: [(u64, f64, &[&str]); 3] = [
    (10, 1.0, &["pick"]),
    (30, 2.0, &["place"]),
    (20, 1.75, &["pick", "place"]),
];

pub fn total_frames() -> u64 {
    EPISODES.iter().map(|(len, _, _)| len).sum()
}

fn write(root: &Path, rel: &str, contents: impl AsRef<[u8]>) -> std::io::Result<()> {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)
}

fn jsonl(values: impl IntoIterator<Item = serde_json::Value>) -> String {
    values.into_iter().map(|v| format!("{v}\n")).collect()
}

/// Rows of one episode. `action` is `[frame, -frame]`.
pub fn episode_batch(episode: u64, first_index: u64, length: u64, task: i64) -> RecordBatch {
    let frames = 0..length as i64;
    let action_values: Vec<f32> = frames
        .clone()
        .flat_map(|f| [f as f32, -(f as f32)])
        .collect();
    let action: ArrayRef = Arc::new(
        FixedSizeListArray::try_new(
            Arc::new(Field::new("item", DataType::Float32, true)),
            2,
            Arc::new(Float32Array::from(action_values)),
            None,
        )
        .expect("valid action column"),
    );
    let timestamp: ArrayRef = Arc::new(Float32Array::from_iter_values(
        frames.clone().map(|f| f as f32 / FPS as f32),
    ));
    let frame_index: ArrayRef = Arc::new(Int64Array::from_iter_values(frames.clone()));
    let episode_index: ArrayRef = Arc::new(Int64Array::from_iter_values(
        frames.clone().map(|_| episode as i64),
    ));
    let index: ArrayRef = Arc::new(Int64Array::from_iter_values(
        frames.clone().map(|f| first_index as i64 + f),
    ));
    let task_index: ArrayRef = Arc::new(Int64Array::from_iter_values(frames.map(|_| task)));

    RecordBatch::try_from_iter([
        ("action", action),
        ("timestamp", timestamp),
        ("frame_index", frame_index),
        ("episode_index", episode_index),
        ("index", index),
        ("task_index", task_index),
    ])
    .expect("valid episode batch")
}

fn write_parquet(root: &Path, rel: &str, batch: &RecordBatch) -> TestResult {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().ok_or("no parent")?)?;
    let mut writer = ArrowWriter::try_new(std::fs::File::create(path)?, batch.schema(), None)?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

fn feature_stats(length: u64, mean: f64) -> serde_json::Value {
    let last = (length - 1) as f64;
    json!({
        "min": [0.0, -last],
        "max": [last, 0.0],
        "mean": [mean, -mean],
        "std": [0.5, 0.5],
        "count": [length]
    })
}

fn image_stats(length: u64) -> serde_json::Value {
    json!({
        "min": [[[0.0]], [[0.0]], [[0.0]]],
        "max": [[[1.0]], [[1.0]], [[1.0]]],
        "mean": [[[0.5]], [[0.4]], [[0.3]]],
        "std": [[[0.1]], [[0.1]], [[0.1]]],
        "count": [length]
    })
}

/// Write a three-episode, two-camera v2.1 dataset under `root`.
pub fn write_source_dataset(root: &Path) -> TestResult {
    write_source_dataset_with(root, true)
}

/// Like [`write_source_dataset`], optionally without camera streams.
pub fn write_source_dataset_with(root: &Path, with_video: bool) -> TestResult {
    let mut features = json!({
        "action": {"dtype": "float32", "shape": [2], "names": ["x", "y"]},
        "timestamp": {"dtype": "float32", "shape": [1]},
        "frame_index": {"dtype": "int64", "shape": [1]},
        "episode_index": {"dtype": "int64", "shape": [1]},
        "index": {"dtype": "int64", "shape": [1]},
        "task_index": {"dtype": "int64", "shape": [1]}
    });
    if with_video {
        for cam in CAMERAS {
            features[cam] = json!({"dtype": "video", "shape": [4, 4, 3]});
        }
    }
    let info = json!({
        "codebase_version": "v2.1",
        "robot_type": "test_arm",
        "total_episodes": EPISODES.len(),
        "total_frames": total_frames(),
        "total_tasks": 2,
        "total_chunks": 1,
        "chunks_size": 1000,
        "fps": FPS,
        "splits": {"train": "0:3"},
        "data_path": "data/chunk-{episode_chunk:03d}/episode_{episode_index:06d}.parquet",
        "video_path": "videos/chunk-{episode_chunk:03d}/{video_key}/episode_{episode_index:06d}.mp4",
        "features": features
    });
    write(root, "meta/info.json", serde_json::to_vec_pretty(&info)?)?;

    write(
        root,
        "meta/tasks.jsonl",
        jsonl([
            json!({"task_index": 0, "task": "pick"}),
            json!({"task_index": 1, "task": "place"}),
        ]),
    )?;

    write(
        root,
        "meta/episodes.jsonl",
        jsonl(EPISODES.iter().enumerate().map(|(i, (len, _, tasks))| {
            json!({"episode_index": i, "tasks": tasks, "length": len})
        })),
    )?;

    write(
        root,
        "meta/episodes_stats.jsonl",
        jsonl(EPISODES.iter().enumerate().map(|(i, (len, mean, _))| {
            let mut stats = json!({ "action": feature_stats(*len, *mean) });
            if with_video {
                for cam in CAMERAS {
                    stats[cam] = image_stats(*len);
                }
            }
            json!({"episode_index": i, "stats": stats})
        })),
    )?;

    write(
        root,
        "README.md",
        "# Test dataset\n\n```json\n{\n    \"codebase_version\": \"v2.1\"\n}\n```\n",
    )?;

    let mut first_index = 0;
    for (i, (len, _, tasks)) in EPISODES.iter().enumerate() {
        let task = if tasks[0] == "pick" { 0 } else { 1 };
        let batch = episode_batch(i as u64, first_index, *len, task);
        write_parquet(
            root,
            &format!("data/chunk-000/episode_{i:06}.parquet"),
            &batch,
        )?;
        first_index += len;

        if with_video {
            for cam in CAMERAS {
                write(
                    root,
                    &format!("videos/chunk-000/{cam}/episode_{i:06}.mp4"),
                    format!("<{cam}:{i}>"),
                )?;
            }
        }
    }
    Ok(())
}

/// Joins inputs by byte concatenation.
#[derive(Debug, Default)]
pub struct ByteJoin;

impl VideoConcatenator for ByteJoin {
    async fn concat(&self, request: &ConcatRequest<'_>) -> Result<(), ConcatFailure> {
        let mut joined = Vec::new();
        for input in request.inputs {
            joined.extend(tokio::fs::read(input).await.map_err(|source| {
                ConcatFailure::Spawn {
                    program: "byte-join".to_string(),
                    source,
                }
            })?);
        }
        tokio::fs::write(request.output, joined)
            .await
            .map_err(|source| ConcatFailure::Spawn {
                program: "byte-join".to_string(),
                source,
            })
    }
}

/// Fails every join with a non-zero exit.
#[derive(Debug, Default)]
pub struct FailingJoin;

impl VideoConcatenator for FailingJoin {
    async fn concat(&self, _request: &ConcatRequest<'_>) -> Result<(), ConcatFailure> {
        Err(ConcatFailure::Exit {
            program: "failing-join".to_string(),
            status: "exit status: 1".to_string(),
            stderr: "unsupported codec".to_string(),
        })
    }
}
