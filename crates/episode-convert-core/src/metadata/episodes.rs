//! Episode index and task vocabulary records.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::prelude::*;

use crate::metadata::stats::EpisodeStats;

/// One recorded trajectory (`meta/episodes.jsonl` line).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    /// Unique, zero-based episode index.
    pub episode_index: u64,
    /// Task labels; the first one is the episode's primary task.
    pub tasks: Vec<String>,
    /// Number of frames.
    pub length: u64,
    /// Any other field, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EpisodeRecord {
    /// The primary task label.
    pub fn task(&self) -> Option<&str> {
        self.tasks.first().map(String::as_str)
    }
}

/// `meta/episodes_stats.jsonl` line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeStatsRecord {
    /// Episode the statistics belong to.
    pub episode_index: u64,
    /// Statistics keyed by feature name.
    pub stats: EpisodeStats,
}

/// `meta/tasks.jsonl` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Dense task index.
    pub task_index: u64,
    /// Task label.
    pub task: String,
}

/// Errors raised while building a [`TaskVocabulary`].
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum TaskVocabularyError {
    /// Two entries share an index.
    #[snafu(display("Task index {task_index} is assigned to both {first:?} and {second:?}"))]
    DuplicateIndex {
        /// The shared index.
        task_index: u64,
        /// Label seen first.
        first: String,
        /// Label seen second.
        second: String,
    },

    /// The same label appears under two indices.
    #[snafu(display("Task {task:?} appears with indices {first} and {second}"))]
    DuplicateLabel {
        /// The repeated label.
        task: String,
        /// Index seen first.
        first: u64,
        /// Index seen second.
        second: u64,
    },
}

/// Bidirectional mapping between task labels and dense indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskVocabulary {
    by_index: BTreeMap<u64, String>,
    by_label: HashMap<String, u64>,
}

impl TaskVocabulary {
    /// Build from records, rejecting duplicate indices or labels.
    pub fn from_records(
        records: impl IntoIterator<Item = TaskRecord>,
    ) -> Result<Self, TaskVocabularyError> {
        let mut vocab = TaskVocabulary::default();
        for TaskRecord { task_index, task } in records {
            if let Some(first) = vocab.by_index.get(&task_index) {
                return DuplicateIndexSnafu {
                    task_index,
                    first: first.clone(),
                    second: task,
                }
                .fail();
            }
            if let Some(&first) = vocab.by_label.get(&task) {
                return DuplicateLabelSnafu {
                    task,
                    first,
                    second: task_index,
                }
                .fail();
            }
            vocab.by_label.insert(task.clone(), task_index);
            vocab.by_index.insert(task_index, task);
        }
        Ok(vocab)
    }

    /// Index of `label`.
    pub fn index_of(&self, label: &str) -> Option<u64> {
        self.by_label.get(label).copied()
    }

    /// Label at `index`.
    pub fn label_of(&self, index: u64) -> Option<&str> {
        self.by_index.get(&index).map(String::as_str)
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    /// Whether the vocabulary is empty.
    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }

    /// `(index, label)` pairs in index order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &str)> {
        self.by_index.iter().map(|(i, t)| (*i, t.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(task_index: u64, task: &str) -> TaskRecord {
        TaskRecord {
            task_index,
            task: task.to_string(),
        }
    }

    #[test]
    fn vocabulary_maps_both_ways() -> Result<(), TaskVocabularyError> {
        let vocab = TaskVocabulary::from_records([rec(1, "stack"), rec(0, "pick")])?;
        assert_eq!(vocab.len(), 2);
        assert_eq!(vocab.index_of("stack"), Some(1));
        assert_eq!(vocab.label_of(0), Some("pick"));
        let ordered: Vec<_> = vocab.iter().collect();
        assert_eq!(ordered, vec![(0, "pick"), (1, "stack")]);
        Ok(())
    }

    #[test]
    fn duplicates_are_rejected() {
        assert!(matches!(
            TaskVocabulary::from_records([rec(0, "a"), rec(0, "b")]),
            Err(TaskVocabularyError::DuplicateIndex { task_index: 0, .. })
        ));
        assert!(matches!(
            TaskVocabulary::from_records([rec(0, "a"), rec(1, "a")]),
            Err(TaskVocabularyError::DuplicateLabel { .. })
        ));
    }

    #[test]
    fn episode_record_keeps_extra_fields() -> Result<(), serde_json::Error> {
        let ep: EpisodeRecord = serde_json::from_str(
            r#"{"episode_index": 3, "tasks": ["pick"], "length": 12, "operator": "x"}"#,
        )?;
        assert_eq!(ep.task(), Some("pick"));
        assert_eq!(ep.extra["operator"], "x");

        let missing = serde_json::from_str::<EpisodeRecord>(r#"{"episode_index": 3, "tasks": []}"#);
        assert!(missing.is_err());
        Ok(())
    }
}
