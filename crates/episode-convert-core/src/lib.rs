//! Conversion engine for episodic robot datasets.
//!
//! This crate migrates a dataset root from the v2.1 layout (one Parquet file
//! and one MP4 per episode, JSONL metadata) to the v3.0 layout (chunked
//! Parquet and MP4 files holding many episodes, Parquet episode metadata and
//! quantile-augmented statistics):
//!
//! - Typed dataset metadata and its JSONL loader (`metadata`, `loader`).
//! - Row, time and file bookkeeping plus the tabular and video consolidators
//!   (`consolidate`).
//! - Per-episode quantiles and count-weighted global statistics (`stats`).
//! - The descriptor rewrite, metadata tables and provenance report
//!   (`transform`, `episodes_table`, `report`).
//! - The staged orchestrator tying them together (`convert`) and a
//!   consistency check of converted roots (`verify`).
//!
//! All filesystem access goes through the `storage` module.
#![deny(missing_docs)]
pub mod consolidate;
pub mod convert;
pub mod episodes_table;
pub mod layout;
pub mod loader;
pub mod metadata;
pub mod options;
pub mod report;
pub mod stats;
pub mod storage;
pub mod transform;
pub mod verify;

pub use convert::{
    ConversionFailure, ConversionStage, ConvertError, Converter, ErrorKind, convert_dataset,
};
pub use options::{ChunkingConfig, ConvertOptions};
pub use report::ConversionReport;
pub use storage::DatasetLocation;
pub use verify::{VerifyError, VerifyReport, verify_converted};
