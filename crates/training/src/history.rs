//! Per-epoch metric history, the durable record resume is rebuilt from.
//!
//! The file holds one ordered series per tracked metric. The accuracy series
//! length is the number of completed epochs, and the learning-rate series
//! carries one extra leading entry (the initial rate before epoch 0); resume
//! derives its starting epoch and learning rate from exactly those two facts,
//! so the writer persists after every epoch and always atomically.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Write,
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{metrics::EpochMetrics, TrainingError};

/// Metric series tracked per epoch, training and validation variants.
pub const METRIC_SERIES: [&str; 14] = [
    "accuracy",
    "loss",
    "val_accuracy",
    "val_loss",
    "f1_score",
    "val_f1_score",
    "sensitivity",
    "val_sensitivity",
    "specificity",
    "val_specificity",
    "precision",
    "val_precision",
    "recall",
    "val_recall",
];

pub const LEARNING_RATE_SERIES: &str = "learning_rate";

/// One split's scalar results for a single epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct EpochSummary {
    pub loss: f64,
    pub metrics: EpochMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricHistory {
    series: BTreeMap<String, Vec<f64>>,
}

impl MetricHistory {
    pub fn new(initial_learning_rate: f64) -> Self {
        let mut series = BTreeMap::new();
        for name in METRIC_SERIES {
            series.insert(name.to_string(), Vec::new());
        }
        series.insert(
            LEARNING_RATE_SERIES.to_string(),
            vec![initial_learning_rate],
        );
        Self { series }
    }

    /// Appends one epoch's training and validation results plus the learning
    /// rate that was in effect during the epoch.
    pub fn record_epoch(
        &mut self,
        train: &EpochSummary,
        validation: &EpochSummary,
        learning_rate: f64,
    ) {
        let values = [
            ("accuracy", train.metrics.accuracy),
            ("loss", train.loss),
            ("val_accuracy", validation.metrics.accuracy),
            ("val_loss", validation.loss),
            ("f1_score", train.metrics.f1_score),
            ("val_f1_score", validation.metrics.f1_score),
            ("sensitivity", train.metrics.sensitivity),
            ("val_sensitivity", validation.metrics.sensitivity),
            ("specificity", train.metrics.specificity),
            ("val_specificity", validation.metrics.specificity),
            ("precision", train.metrics.precision),
            ("val_precision", validation.metrics.precision),
            ("recall", train.metrics.recall),
            ("val_recall", validation.metrics.recall),
        ];
        for (name, value) in values {
            self.series
                .entry(name.to_string())
                .or_default()
                .push(value);
        }
        self.series
            .entry(LEARNING_RATE_SERIES.to_string())
            .or_default()
            .push(learning_rate);
    }

    pub fn values(&self, name: &str) -> &[f64] {
        self.series.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Completed epochs; defined as the accuracy series length.
    pub fn epochs_completed(&self) -> usize {
        self.values("accuracy").len()
    }

    pub fn last_learning_rate(&self) -> Option<f64> {
        self.values(LEARNING_RATE_SERIES).last().copied()
    }

    /// Running maximum of recorded validation accuracy.
    pub fn max_val_accuracy(&self) -> Option<f64> {
        self.values("val_accuracy")
            .iter()
            .copied()
            .fold(None, |best, value| match best {
                Some(current) if current >= value => Some(current),
                _ => Some(value),
            })
    }

    /// Starting epoch and learning rate a resumed run must use.
    pub fn resume_point(&self) -> Result<(usize, f64), TrainingError> {
        let learning_rate = self.last_learning_rate().ok_or_else(|| {
            TrainingError::runtime("history has no learning-rate series to resume from")
        })?;
        Ok((self.epochs_completed(), learning_rate))
    }

    /// Structural consistency check applied to restored files: every metric
    /// series has one entry per epoch, and the learning-rate series leads by
    /// exactly one.
    pub fn validate(&self) -> Result<(), TrainingError> {
        let epochs = self.epochs_completed();
        for name in METRIC_SERIES {
            let len = self.values(name).len();
            if len != epochs {
                return Err(TrainingError::runtime(format!(
                    "history series '{}' has {} entries, expected {}",
                    name, len, epochs
                )));
            }
        }
        let lr_len = self.values(LEARNING_RATE_SERIES).len();
        if lr_len != epochs + 1 {
            return Err(TrainingError::runtime(format!(
                "history learning_rate series has {} entries, expected {}",
                lr_len,
                epochs + 1
            )));
        }
        Ok(())
    }

    /// Writes the history as JSON via a temporary sibling then renames it
    /// into place, so a crash mid-write leaves the previous file intact.
    pub fn save(&self, path: &Path) -> Result<(), TrainingError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    TrainingError::runtime(format!(
                        "failed to create history directory {}: {err}",
                        parent.display()
                    ))
                })?;
            }
        }
        let tmp_path = path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp_path).map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to create {}: {err}",
                    tmp_path.display()
                ))
            })?;
            let data = serde_json::to_vec_pretty(self).map_err(|err| {
                TrainingError::runtime(format!("failed to serialize history: {err}"))
            })?;
            file.write_all(&data).map_err(|err| {
                TrainingError::runtime(format!("failed to write {}: {err}", tmp_path.display()))
            })?;
            file.write_all(b"\n").map_err(|err| {
                TrainingError::runtime(format!("failed to write {}: {err}", tmp_path.display()))
            })?;
        }
        fs::rename(&tmp_path, path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to move history into place at {}: {err}",
                path.display()
            ))
        })
    }

    pub fn load(path: &Path) -> Result<Self, TrainingError> {
        let file = File::open(path).map_err(|err| {
            TrainingError::runtime(format!("failed to open history {}: {err}", path.display()))
        })?;
        let history: MetricHistory = serde_json::from_reader(file).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to parse history {}: {err}",
                path.display()
            ))
        })?;
        history.validate()?;
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::EpochMetrics;
    use tempfile::tempdir;

    fn summary(loss: f64, accuracy: f64) -> EpochSummary {
        EpochSummary {
            loss,
            metrics: EpochMetrics {
                accuracy,
                ..Default::default()
            },
        }
    }

    #[test]
    fn learning_rate_series_leads_by_one() {
        let mut history = MetricHistory::new(1e-3);
        assert_eq!(history.epochs_completed(), 0);
        assert_eq!(history.values(LEARNING_RATE_SERIES).len(), 1);

        history.record_epoch(&summary(0.5, 0.8), &summary(0.6, 0.7), 1e-3);
        assert_eq!(history.epochs_completed(), 1);
        assert_eq!(history.values(LEARNING_RATE_SERIES).len(), 2);
        assert!(history.validate().is_ok());
    }

    #[test]
    fn resume_point_reflects_recorded_epochs() -> Result<(), TrainingError> {
        let mut history = MetricHistory::new(1e-3);
        history.record_epoch(&summary(0.5, 0.8), &summary(0.6, 0.7), 1e-3);
        history.record_epoch(&summary(0.4, 0.85), &summary(0.55, 0.75), 5e-4);
        let (epoch, lr) = history.resume_point()?;
        assert_eq!(epoch, 2);
        assert_eq!(lr, 5e-4);
        Ok(())
    }

    #[test]
    fn save_load_round_trip_preserves_resume_point() -> Result<(), TrainingError> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history_90-10.json");

        let mut history = MetricHistory::new(1e-3);
        history.record_epoch(&summary(0.5, 0.8), &summary(0.6, 0.7), 1e-3);
        history.record_epoch(&summary(0.4, 0.85), &summary(0.55, 0.75), 1e-3);
        history.save(&path)?;

        let restored = MetricHistory::load(&path)?;
        assert_eq!(restored.resume_point()?, history.resume_point()?);
        assert_eq!(restored.values("val_loss"), history.values("val_loss"));
        Ok(())
    }

    #[test]
    fn corrupt_history_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(MetricHistory::load(&path).is_err());
    }

    #[test]
    fn inconsistent_series_lengths_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.json");
        // accuracy has 1 entry but val_accuracy none; learning_rate misses
        // its leading entry as well.
        let broken = r#"{"series": {"accuracy": [0.5], "learning_rate": [0.001]}}"#;
        std::fs::write(&path, broken).unwrap();
        assert!(MetricHistory::load(&path).is_err());
    }

    #[test]
    fn max_val_accuracy_tracks_running_best() {
        let mut history = MetricHistory::new(1e-3);
        assert_eq!(history.max_val_accuracy(), None);
        for acc in [0.5, 0.7, 0.6] {
            history.record_epoch(&summary(0.4, 0.9), &summary(0.5, acc), 1e-3);
        }
        assert_eq!(history.max_val_accuracy(), Some(0.7));
    }

    #[test]
    fn no_tmp_file_remains_after_save() -> Result<(), TrainingError> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.json");
        MetricHistory::new(1e-3).save(&path)?;
        assert!(path.is_file());
        assert!(!path.with_extension("json.tmp").exists());
        Ok(())
    }
}
