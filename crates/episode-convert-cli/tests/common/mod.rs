use std::{path::Path, sync::Arc};

use arrow::array::{ArrayRef, Float32Array, Int64Array};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use serde_json::json;

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// Episode lengths of the fixture dataset.
pub const LENGTHS: [u64; 2] = [4, 6];

fn write(root: &Path, rel: &str, contents: impl AsRef<[u8]>) -> TestResult {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    Ok(())
}

fn write_episode(root: &Path, episode: u64, first_index: u64, length: u64) -> TestResult {
    let rows = 0..length as i64;
    let state: ArrayRef = Arc::new(Float32Array::from_iter_values(
        rows.clone().map(|r| r as f32 * 0.5),
    ));
    let episode_index: ArrayRef = Arc::new(Int64Array::from_iter_values(
        rows.clone().map(|_| episode as i64),
    ));
    let index: ArrayRef = Arc::new(Int64Array::from_iter_values(
        rows.map(|r| first_index as i64 + r),
    ));
    let batch = RecordBatch::try_from_iter([
        ("observation.state", state),
        ("episode_index", episode_index),
        ("index", index),
    ])?;

    let path = root.join(format!("data/chunk-000/episode_{episode:06}.parquet"));
    std::fs::create_dir_all(path.parent().ok_or("no parent")?)?;
    let mut writer = ArrowWriter::try_new(std::fs::File::create(path)?, batch.schema(), None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

/// Write a two-episode v2.1 dataset without camera streams.
pub fn write_source_dataset(root: &Path) -> TestResult {
    let total: u64 = LENGTHS.iter().sum();
    let info = json!({
        "codebase_version": "v2.1",
        "total_episodes": LENGTHS.len(),
        "total_frames": total,
        "total_tasks": 1,
        "chunks_size": 1000,
        "fps": 5,
        "data_path": "data/chunk-{episode_chunk:03d}/episode_{episode_index:06d}.parquet",
        "features": {
            "observation.state": {"dtype": "float32", "shape": [1]},
            "episode_index": {"dtype": "int64", "shape": [1]},
            "index": {"dtype": "int64", "shape": [1]}
        }
    });
    write(root, "meta/info.json", serde_json::to_vec_pretty(&info)?)?;
    write(root, "meta/tasks.jsonl", "{\"task_index\": 0, \"task\": \"wave\"}\n")?;

    let mut episodes = String::new();
    let mut stats = String::new();
    let mut first_index = 0;
    for (i, &len) in LENGTHS.iter().enumerate() {
        episodes.push_str(&format!(
            "{}\n",
            json!({"episode_index": i, "tasks": ["wave"], "length": len})
        ));
        let max = (len - 1) as f64 * 0.5;
        stats.push_str(&format!(
            "{}\n",
            json!({"episode_index": i, "stats": {"observation.state": {
                "min": [0.0], "max": [max], "mean": [max / 2.0], "std": [1.0], "count": [len]
            }}})
        ));
        write_episode(root, i as u64, first_index, len)?;
        first_index += len;
    }
    write(root, "meta/episodes.jsonl", episodes)?;
    write(root, "meta/episodes_stats.jsonl", stats)?;
    Ok(())
}
