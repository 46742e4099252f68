//! Streaming evaluation metrics.
//!
//! Every metric accumulates confusion counts across a whole pass and only
//! divides in `result()`, so batch boundaries never skew the outcome. Counts
//! are kept per class (true/false positives and negatives from one-vs-rest
//! views of the label space) and macro-averaged; sensitivity and specificity
//! therefore diverge the way they should in the multi-class case, instead of
//! collapsing into the same exact-match ratio.

use crate::TrainingError;

const EPSILON: f64 = 1e-7;

/// Per-class one-vs-rest confusion counts over argmax predictions.
#[derive(Debug, Clone)]
pub struct ConfusionCounts {
    num_classes: usize,
    total: u64,
    true_positives: Vec<u64>,
    false_positives: Vec<u64>,
    false_negatives: Vec<u64>,
}

impl ConfusionCounts {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            total: 0,
            true_positives: vec![0; num_classes],
            false_positives: vec![0; num_classes],
            false_negatives: vec![0; num_classes],
        }
    }

    pub fn update(&mut self, y_true: &[u32], y_pred: &[u32]) {
        for (&truth, &pred) in y_true.iter().zip(y_pred.iter()) {
            let truth = truth as usize % self.num_classes.max(1);
            let pred = pred as usize % self.num_classes.max(1);
            self.total += 1;
            if truth == pred {
                self.true_positives[truth] += 1;
            } else {
                self.false_positives[pred] += 1;
                self.false_negatives[truth] += 1;
            }
        }
    }

    pub fn reset(&mut self) {
        self.total = 0;
        self.true_positives.iter_mut().for_each(|v| *v = 0);
        self.false_positives.iter_mut().for_each(|v| *v = 0);
        self.false_negatives.iter_mut().for_each(|v| *v = 0);
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    fn true_negatives(&self, class: usize) -> u64 {
        self.total
            - self.true_positives[class]
            - self.false_positives[class]
            - self.false_negatives[class]
    }

    pub fn accuracy(&self) -> f64 {
        let matches: u64 = self.true_positives.iter().sum();
        matches as f64 / (self.total as f64 + EPSILON)
    }

    fn macro_average(&self, per_class: impl Fn(usize) -> f64) -> f64 {
        if self.num_classes == 0 {
            return 0.0;
        }
        (0..self.num_classes).map(per_class).sum::<f64>() / self.num_classes as f64
    }

    pub fn precision(&self) -> f64 {
        self.macro_average(|c| {
            let tp = self.true_positives[c] as f64;
            tp / (tp + self.false_positives[c] as f64 + EPSILON)
        })
    }

    pub fn recall(&self) -> f64 {
        self.macro_average(|c| {
            let tp = self.true_positives[c] as f64;
            tp / (tp + self.false_negatives[c] as f64 + EPSILON)
        })
    }

    pub fn specificity(&self) -> f64 {
        self.macro_average(|c| {
            let tn = self.true_negatives(c) as f64;
            tn / (tn + self.false_positives[c] as f64 + EPSILON)
        })
    }

    pub fn f1(&self) -> f64 {
        self.macro_average(|c| {
            let tp = self.true_positives[c] as f64;
            let precision = tp / (tp + self.false_positives[c] as f64 + EPSILON);
            let recall = tp / (tp + self.false_negatives[c] as f64 + EPSILON);
            2.0 * precision * recall / (precision + recall + EPSILON)
        })
    }
}

/// Interface every streaming metric exposes to the evaluation loop.
pub trait StreamingMetric {
    fn update(&mut self, y_true: &[u32], y_pred: &[u32]);
    fn result(&self) -> f64;
    fn reset(&mut self);
}

macro_rules! confusion_metric {
    ($(#[$doc:meta])* $name:ident, $method:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone)]
        pub struct $name {
            counts: ConfusionCounts,
        }

        impl $name {
            pub fn new(num_classes: usize) -> Self {
                Self {
                    counts: ConfusionCounts::new(num_classes),
                }
            }
        }

        impl StreamingMetric for $name {
            fn update(&mut self, y_true: &[u32], y_pred: &[u32]) {
                self.counts.update(y_true, y_pred);
            }

            fn result(&self) -> f64 {
                self.counts.$method()
            }

            fn reset(&mut self) {
                self.counts.reset();
            }
        }
    };
}

confusion_metric!(
    /// Fraction of examples whose argmax prediction matches the label.
    Accuracy,
    accuracy
);
confusion_metric!(
    /// Macro-averaged positive predictive value.
    Precision,
    precision
);
confusion_metric!(
    /// Macro-averaged recall.
    Recall,
    recall
);
confusion_metric!(
    /// True positive rate; identical bookkeeping to recall, reported under
    /// the clinical name the history file uses.
    Sensitivity,
    recall
);
confusion_metric!(
    /// Macro-averaged true negative rate.
    Specificity,
    specificity
);
confusion_metric!(
    /// Macro-averaged harmonic mean of precision and recall.
    F1Score,
    f1
);

/// The full metric battery one evaluation pass maintains.
#[derive(Debug, Clone)]
pub struct MetricSet {
    counts: ConfusionCounts,
}

impl MetricSet {
    pub fn new(num_classes: usize) -> Result<Self, TrainingError> {
        if num_classes == 0 {
            return Err(TrainingError::initialization(
                "metrics require at least one class",
            ));
        }
        Ok(Self {
            counts: ConfusionCounts::new(num_classes),
        })
    }

    pub fn update(&mut self, y_true: &[u32], y_pred: &[u32]) -> Result<(), TrainingError> {
        if y_true.len() != y_pred.len() {
            return Err(TrainingError::runtime(format!(
                "metric update received {} labels but {} predictions",
                y_true.len(),
                y_pred.len()
            )));
        }
        self.counts.update(y_true, y_pred);
        Ok(())
    }

    pub fn reset(&mut self) {
        self.counts.reset();
    }

    pub fn examples(&self) -> u64 {
        self.counts.total()
    }

    pub fn snapshot(&self) -> EpochMetrics {
        EpochMetrics {
            accuracy: self.counts.accuracy(),
            precision: self.counts.precision(),
            recall: self.counts.recall(),
            f1_score: self.counts.f1(),
            sensitivity: self.counts.recall(),
            specificity: self.counts.specificity(),
        }
    }
}

/// Point-in-time metric values for one epoch and one data split.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpochMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub sensitivity: f64,
    pub specificity: f64,
}
