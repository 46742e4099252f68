//! Focal loss with label smoothing over per-class probabilities.

use candle_core::{Tensor, D};

use crate::TrainingError;

const PROB_CLAMP: f64 = 1e-7;

/// Focal loss as the reference training recipe uses it: smoothed one-hot
/// targets, predictions clamped away from zero and one before the log, and
/// the per-class cross-entropy term reweighted by `alpha * (1 - p)^gamma`
/// so confident correct predictions contribute little.
#[derive(Debug, Clone)]
pub struct FocalLoss {
    gamma: f64,
    alpha: f64,
    smoothing: f64,
    num_classes: usize,
}

impl FocalLoss {
    pub fn new(
        num_classes: usize,
        gamma: f64,
        alpha: f64,
        smoothing: f64,
    ) -> Result<Self, TrainingError> {
        if num_classes == 0 {
            return Err(TrainingError::initialization(
                "focal loss requires at least one class",
            ));
        }
        if gamma < 0.0 {
            return Err(TrainingError::initialization(
                "focal loss gamma must be >= 0",
            ));
        }
        if alpha <= 0.0 {
            return Err(TrainingError::initialization(
                "focal loss alpha must be greater than 0",
            ));
        }
        if !(0.0..1.0).contains(&smoothing) {
            return Err(TrainingError::initialization(
                "label smoothing must be in [0, 1) for focal loss",
            ));
        }
        Ok(Self {
            gamma,
            alpha,
            smoothing,
            num_classes,
        })
    }

    /// `predictions` are `(batch, classes)` probabilities, `targets` one-hot
    /// rows of the same shape. Returns the scalar batch-mean loss tensor plus
    /// detached batch statistics.
    pub fn compute(
        &self,
        predictions: &Tensor,
        targets: &Tensor,
    ) -> Result<LossOutput, TrainingError> {
        let (batch, classes) = predictions.dims2().map_err(to_runtime_error)?;
        if classes != self.num_classes {
            return Err(TrainingError::runtime(format!(
                "focal loss built for {} classes, predictions have {}",
                self.num_classes, classes
            )));
        }
        if targets.dims() != predictions.dims() {
            return Err(TrainingError::runtime(format!(
                "targets shape {:?} must match predictions shape {:?}",
                targets.dims(),
                predictions.dims()
            )));
        }
        if batch == 0 {
            return Err(TrainingError::runtime(
                "focal loss received an empty batch",
            ));
        }

        let smoothed = targets
            .affine(
                1.0 - self.smoothing,
                self.smoothing / self.num_classes as f64,
            )
            .map_err(to_runtime_error)?;
        let clamped = predictions
            .clamp(PROB_CLAMP, 1.0 - PROB_CLAMP)
            .map_err(to_runtime_error)?;

        let cross_entropy = smoothed
            .mul(&clamped.log().map_err(to_runtime_error)?)
            .map_err(to_runtime_error)?
            .neg()
            .map_err(to_runtime_error)?;
        let weight = clamped
            .affine(-1.0, 1.0)
            .map_err(to_runtime_error)?
            .powf(self.gamma)
            .map_err(to_runtime_error)?
            .affine(self.alpha, 0.0)
            .map_err(to_runtime_error)?;

        let per_example = weight
            .mul(&cross_entropy)
            .map_err(to_runtime_error)?
            .sum(D::Minus1)
            .map_err(to_runtime_error)?;
        let loss = per_example.mean_all().map_err(to_runtime_error)?;
        let average_loss = loss.to_vec0::<f32>().map_err(to_runtime_error)? as f64;

        let predicted = predictions.argmax(D::Minus1).map_err(to_runtime_error)?;
        let truth = targets.argmax(D::Minus1).map_err(to_runtime_error)?;
        let correct = predicted
            .eq(&truth)
            .map_err(to_runtime_error)?
            .to_dtype(candle_core::DType::F32)
            .map_err(to_runtime_error)?
            .sum_all()
            .map_err(to_runtime_error)?
            .to_vec0::<f32>()
            .map_err(to_runtime_error)?
            .round() as usize;

        Ok(LossOutput {
            loss,
            metrics: LossMetrics {
                average_loss,
                examples: batch,
                correct,
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone, Copy)]
pub struct LossMetrics {
    average_loss: f64,
    examples: usize,
    correct: usize,
}

impl LossMetrics {
    pub fn average_loss(&self) -> f64 {
        self.average_loss
    }

    pub fn examples(&self) -> usize {
        self.examples
    }

    pub fn correct(&self) -> usize {
        self.correct
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn rows(data: Vec<f32>, classes: usize) -> Tensor {
        let batch = data.len() / classes;
        Tensor::from_vec(data, (batch, classes), &Device::Cpu).unwrap()
    }

    #[test]
    fn loss_is_non_negative_for_arbitrary_predictions() -> Result<(), TrainingError> {
        let loss = FocalLoss::new(3, 2.0, 0.25, 0.1)?;
        let preds = rows(vec![0.2, 0.5, 0.3, 0.9, 0.05, 0.05, 1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0], 3);
        let targets = rows(vec![0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0], 3);
        let out = loss.compute(&preds, &targets)?;
        assert!(out.metrics.average_loss() >= 0.0);
        Ok(())
    }

    #[test]
    fn perfect_unsmoothed_prediction_is_effectively_zero() -> Result<(), TrainingError> {
        let loss = FocalLoss::new(2, 2.0, 0.25, 0.0)?;
        let preds = rows(vec![1.0, 0.0], 2);
        let targets = rows(vec![1.0, 0.0], 2);
        let out = loss.compute(&preds, &targets)?;
        // The clamp keeps the log finite; the residual is far below any
        // attainable training loss.
        assert!(out.metrics.average_loss() < 1e-6);
        Ok(())
    }

    #[test]
    fn smoothing_keeps_perfect_predictions_strictly_positive() -> Result<(), TrainingError> {
        let loss = FocalLoss::new(2, 2.0, 0.25, 0.1)?;
        let preds = rows(vec![1.0, 0.0], 2);
        let targets = rows(vec![1.0, 0.0], 2);
        let out = loss.compute(&preds, &targets)?;
        assert!(out.metrics.average_loss() > 1e-8);
        Ok(())
    }

    #[test]
    fn confident_mistakes_cost_more_than_confident_hits() -> Result<(), TrainingError> {
        let loss = FocalLoss::new(2, 2.0, 0.25, 0.1)?;
        let targets = rows(vec![1.0, 0.0], 2);
        let hit = loss.compute(&rows(vec![0.95, 0.05], 2), &targets)?;
        let miss = loss.compute(&rows(vec![0.05, 0.95], 2), &targets)?;
        assert!(miss.metrics.average_loss() > hit.metrics.average_loss());
        Ok(())
    }

    #[test]
    fn batch_accuracy_counts_argmax_matches() -> Result<(), TrainingError> {
        let loss = FocalLoss::new(2, 2.0, 0.25, 0.1)?;
        let preds = rows(vec![0.9, 0.1, 0.4, 0.6, 0.7, 0.3], 2);
        let targets = rows(vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0], 2);
        let out = loss.compute(&preds, &targets)?;
        assert_eq!(out.metrics.examples(), 3);
        assert_eq!(out.metrics.correct(), 2);
        Ok(())
    }

    #[test]
    fn class_count_mismatch_is_rejected() -> Result<(), TrainingError> {
        let loss = FocalLoss::new(4, 2.0, 0.25, 0.1)?;
        let preds = rows(vec![0.5, 0.5], 2);
        let targets = rows(vec![1.0, 0.0], 2);
        assert!(loss.compute(&preds, &targets).is_err());
        Ok(())
    }

    #[test]
    fn invalid_hyperparameters_fail_fast() {
        assert!(FocalLoss::new(0, 2.0, 0.25, 0.1).is_err());
        assert!(FocalLoss::new(3, -1.0, 0.25, 0.1).is_err());
        assert!(FocalLoss::new(3, 2.0, 0.0, 0.1).is_err());
        assert!(FocalLoss::new(3, 2.0, 0.25, 1.0).is_err());
    }
}
