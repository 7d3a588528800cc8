//! Dataset splitting and the training loop

pub mod split;
pub mod trainer;

pub use split::{split_dataset, train_test_split, DataSplits, Partition};
pub use trainer::{evaluate, train_from_file, EpochMetrics, Metrics, Trainer, TrainingReport};
