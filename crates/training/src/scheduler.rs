//! Validation-loss driven learning-rate reduction and early stopping.

use crate::TrainingError;

/// Halves the learning rate after `patience` consecutive epochs without a
/// strict validation-loss improvement, never dropping below the floor and
/// never increasing.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    factor: f64,
    patience: usize,
    min_learning_rate: f64,
    best_loss: Option<f64>,
    wait: usize,
}

impl PlateauScheduler {
    pub fn new(factor: f64, patience: usize, min_learning_rate: f64) -> Result<Self, TrainingError> {
        if !(0.0 < factor && factor < 1.0) {
            return Err(TrainingError::initialization(
                "plateau factor must be in (0, 1)",
            ));
        }
        if patience == 0 {
            return Err(TrainingError::initialization(
                "plateau patience must be greater than zero",
            ));
        }
        if min_learning_rate < 0.0 {
            return Err(TrainingError::initialization(
                "minimum learning rate must be >= 0",
            ));
        }
        Ok(Self {
            factor,
            patience,
            min_learning_rate,
            best_loss: None,
            wait: 0,
        })
    }

    /// Feed one epoch's validation loss. Returns the reduced learning rate
    /// when a reduction fires, `None` otherwise.
    pub fn step(&mut self, validation_loss: f64, current_lr: f64) -> Option<f64> {
        match self.best_loss {
            Some(best) if validation_loss >= best => {
                self.wait += 1;
                if self.wait >= self.patience {
                    self.wait = 0;
                    let reduced = (current_lr * self.factor).max(self.min_learning_rate);
                    if reduced < current_lr {
                        return Some(reduced);
                    }
                }
                None
            }
            _ => {
                self.best_loss = Some(validation_loss);
                self.wait = 0;
                None
            }
        }
    }
}

/// Requests a stop after `patience` consecutive epochs without a strict
/// validation-loss improvement.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best_loss: Option<f64>,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Result<Self, TrainingError> {
        if patience == 0 {
            return Err(TrainingError::initialization(
                "early-stop patience must be greater than zero",
            ));
        }
        Ok(Self {
            patience,
            best_loss: None,
            wait: 0,
        })
    }

    /// Returns true when training should stop.
    pub fn step(&mut self, validation_loss: f64) -> bool {
        match self.best_loss {
            Some(best) if validation_loss >= best => {
                self.wait += 1;
                self.wait >= self.patience
            }
            _ => {
                self.best_loss = Some(validation_loss);
                self.wait = 0;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halves_only_after_patience_epochs_without_improvement() -> Result<(), TrainingError> {
        let mut scheduler = PlateauScheduler::new(0.5, 3, 1e-20)?;
        let lr = 1e-3;
        assert_eq!(scheduler.step(1.0, lr), None); // first observation
        assert_eq!(scheduler.step(1.1, lr), None); // stall 1
        assert_eq!(scheduler.step(1.2, lr), None); // stall 2
        assert_eq!(scheduler.step(1.05, lr), Some(5e-4)); // stall 3 fires
        Ok(())
    }

    #[test]
    fn improvement_resets_the_wait_counter() -> Result<(), TrainingError> {
        let mut scheduler = PlateauScheduler::new(0.5, 2, 1e-20)?;
        let lr = 1e-3;
        assert_eq!(scheduler.step(1.0, lr), None);
        assert_eq!(scheduler.step(1.1, lr), None); // stall 1
        assert_eq!(scheduler.step(0.9, lr), None); // improvement resets
        assert_eq!(scheduler.step(0.95, lr), None); // stall 1 again
        assert_eq!(scheduler.step(0.95, lr), Some(5e-4)); // stall 2 fires
        Ok(())
    }

    #[test]
    fn rate_is_floored_and_never_increases() -> Result<(), TrainingError> {
        let mut scheduler = PlateauScheduler::new(0.5, 1, 4e-4)?;
        let mut lr = 1e-3;
        scheduler.step(1.0, lr);
        lr = scheduler.step(1.0, lr).expect("first reduction");
        assert_eq!(lr, 5e-4);
        lr = scheduler.step(1.0, lr).expect("floored reduction");
        assert_eq!(lr, 4e-4);
        // Already at the floor: no further change is reported.
        assert_eq!(scheduler.step(1.0, lr), None);
        Ok(())
    }

    #[test]
    fn equal_loss_counts_as_stall() -> Result<(), TrainingError> {
        let mut scheduler = PlateauScheduler::new(0.5, 1, 0.0)?;
        scheduler.step(1.0, 1e-3);
        assert_eq!(scheduler.step(1.0, 1e-3), Some(5e-4));
        Ok(())
    }

    #[test]
    fn early_stop_fires_after_patience() -> Result<(), TrainingError> {
        let mut stopper = EarlyStopping::new(3)?;
        assert!(!stopper.step(1.0));
        assert!(!stopper.step(1.1));
        assert!(!stopper.step(1.2));
        assert!(stopper.step(1.3));
        Ok(())
    }

    #[test]
    fn early_stop_counter_resets_on_improvement() -> Result<(), TrainingError> {
        let mut stopper = EarlyStopping::new(2)?;
        assert!(!stopper.step(1.0));
        assert!(!stopper.step(1.1));
        assert!(!stopper.step(0.5));
        assert!(!stopper.step(0.6));
        assert!(stopper.step(0.6));
        Ok(())
    }

    #[test]
    fn invalid_construction_fails_fast() {
        assert!(PlateauScheduler::new(0.0, 3, 0.0).is_err());
        assert!(PlateauScheduler::new(1.0, 3, 0.0).is_err());
        assert!(PlateauScheduler::new(0.5, 0, 0.0).is_err());
        assert!(EarlyStopping::new(0).is_err());
    }
}
