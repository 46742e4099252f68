//! Epoch orchestration: the state machine that drives training, evaluation,
//! checkpointing, scheduling, and resume for one data split.

use std::path::PathBuf;

use candle_core::{Device, Tensor, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use model::HybridClassifier;

use crate::{
    checkpoint::{self, CheckpointKind},
    config::OptimizerConfig,
    data::BatchSource,
    history::{EpochSummary, MetricHistory},
    logging::{Logger, LoggingSettings},
    loss::FocalLoss,
    metrics::MetricSet,
    scheduler::{EarlyStopping, PlateauScheduler},
    TrainingConfig, TrainingError,
};

/// Why a run left the epoch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The configured epoch budget was exhausted.
    Completed,
    /// Validation loss stalled past the early-stop patience.
    EarlyStopped,
}

/// Orchestrator lifecycle. `Fresh` and `Resuming` are entry states; `run`
/// moves through `Running` into `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Fresh,
    Resuming,
    Running,
    Stopped(StopReason),
}

/// Outcome handed back to the caller once a run stops.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub reason: StopReason,
    pub epochs_completed: usize,
    pub final_validation: Option<EpochSummary>,
}

/// Probes CUDA, then Metal, then falls back to the CPU, seeding whichever
/// device RNG ends up selected.
pub fn select_device(seed: u64) -> Device {
    let cuda_available = candle_core::utils::cuda_is_available();
    let metal_available = candle_core::utils::metal_is_available();
    println!(
        "device detection: cuda_available={} metal_available={}",
        cuda_available, metal_available
    );

    let device = if cuda_available {
        match Device::cuda_if_available(0) {
            Ok(device) => {
                println!("device: using CUDA GPU #0");
                device
            }
            Err(err) => {
                eprintln!("cuda reported available but initialization failed: {err}");
                Device::Cpu
            }
        }
    } else if metal_available {
        match Device::new_metal(0) {
            Ok(device) => {
                println!("device: using Metal GPU #0");
                device
            }
            Err(err) => {
                eprintln!("failed to initialize metal device, falling back to CPU: {err}");
                Device::Cpu
            }
        }
    } else {
        println!("no GPU backend available; using CPU");
        Device::Cpu
    };

    if let Err(err) = device.set_seed(seed) {
        eprintln!("warning: failed to seed device RNG: {err}");
    }
    device
}

/// The "best" checkpoint is replaced only on a strict improvement over every
/// prior epoch's validation accuracy.
pub fn improves_best(prior_best: Option<f64>, current: f64) -> bool {
    match prior_best {
        Some(best) => current > best,
        None => true,
    }
}

pub struct Orchestrator {
    split: String,
    model: HybridClassifier,
    optimizer: AdamW,
    optimizer_config: OptimizerConfig,
    loss: FocalLoss,
    train_source: Box<dyn BatchSource>,
    validation_source: Box<dyn BatchSource>,
    history: MetricHistory,
    plateau: PlateauScheduler,
    early_stop: EarlyStopping,
    logger: Logger,
    artifacts_dir: PathBuf,
    max_epochs: usize,
    state: RunState,
    start_epoch: usize,
    learning_rate: f64,
}

impl Orchestrator {
    pub fn new(
        config: &TrainingConfig,
        split: &str,
        device: Device,
        train_source: Box<dyn BatchSource>,
        validation_source: Box<dyn BatchSource>,
    ) -> Result<Self, TrainingError> {
        config.validate()?;

        let model_config = config.build_model_config(device);
        let num_classes = model_config.num_classes;
        for (label, source) in [
            ("training", &train_source),
            ("validation", &validation_source),
        ] {
            if source.num_classes() != num_classes {
                return Err(TrainingError::initialization(format!(
                    "{} source serves {} classes but the model expects {}",
                    label,
                    source.num_classes(),
                    num_classes
                )));
            }
        }

        let model = HybridClassifier::new(model_config)
            .map_err(|err| TrainingError::initialization(err.to_string()))?;

        let learning_rate = config.optimizer.learning_rate;
        let optimizer = build_optimizer(&model, &config.optimizer, learning_rate)?;
        let loss = FocalLoss::new(
            num_classes,
            config.loss.gamma,
            config.loss.alpha,
            config.loss.label_smoothing,
        )?;
        let plateau = PlateauScheduler::new(
            config.schedule.plateau_factor,
            config.schedule.plateau_patience,
            config.schedule.min_learning_rate,
        )?;
        let early_stop = EarlyStopping::new(config.schedule.early_stop_patience)?;
        let logger = Logger::new(LoggingSettings::from_config(
            config.runtime.logging.enable_stdout,
            config.runtime.logging.tensorboard.clone(),
            config.runtime.logging.tensorboard_flush_every_n,
        ))?;

        Ok(Self {
            split: split.to_string(),
            model,
            optimizer,
            optimizer_config: config.optimizer.clone(),
            loss,
            train_source,
            validation_source,
            history: MetricHistory::new(learning_rate),
            plateau,
            early_stop,
            logger,
            artifacts_dir: config.runtime.artifacts_dir.clone(),
            max_epochs: config.runtime.max_epochs,
            state: RunState::Fresh,
            start_epoch: 0,
            learning_rate,
        })
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn history(&self) -> &MetricHistory {
        &self.history
    }

    pub fn history_path(&self) -> PathBuf {
        self.artifacts_dir
            .join(format!("history_{}.json", self.split))
    }

    pub fn complete_history_path(&self) -> PathBuf {
        self.artifacts_dir
            .join(format!("complete_history_{}.json", self.split))
    }

    /// Restores weights, epoch counter, history, and learning rate from the
    /// "last" checkpoint and the per-epoch history file.
    ///
    /// Both artifacts must exist and be intact; a requested resume never
    /// silently falls back to fresh training.
    pub fn resume(&mut self) -> Result<(), TrainingError> {
        self.state = RunState::Resuming;

        let history_path = self.history_path();
        if !history_path.is_file() {
            return Err(TrainingError::initialization(format!(
                "resume requested but history file {} is missing",
                history_path.display()
            )));
        }
        let history = MetricHistory::load(&history_path)?;
        let (start_epoch, learning_rate) = history.resume_point()?;

        let loaded = checkpoint::load_checkpoint(
            &self.artifacts_dir,
            CheckpointKind::Last,
            &self.split,
            &self.model.descriptor(),
        )?;
        checkpoint::apply_weights(&self.model, &loaded.weights_path)?;

        // Recompile the optimizer at the restored rate; moment estimates
        // restart, matching the reference resume semantics.
        self.optimizer = build_optimizer(&self.model, &self.optimizer_config, learning_rate)?;

        self.history = history;
        self.start_epoch = start_epoch;
        self.learning_rate = learning_rate;
        println!(
            "[{}] resuming from epoch {}, lr={:.3e}",
            self.split, start_epoch, learning_rate
        );
        Ok(())
    }

    /// Runs the epoch loop until the epoch budget is spent or early stopping
    /// fires, executing the end-of-epoch hooks in their fixed order.
    pub fn run(&mut self) -> Result<RunReport, TrainingError> {
        println!("{}", self.model.summary());
        println!(
            "[{}] training epochs {}..{} (batching via opaque sources)",
            self.split, self.start_epoch, self.max_epochs
        );
        self.state = RunState::Running;

        let mut reason = StopReason::Completed;
        let mut final_validation = None;

        for epoch in self.start_epoch..self.max_epochs {
            let train = self.run_training_pass()?;
            let validation = self.run_validation_pass()?;

            // Hook 1: append to the history and persist it durably.
            let prior_best = self.history.max_val_accuracy();
            self.history
                .record_epoch(&train, &validation, self.learning_rate);
            self.history.save(&self.history_path())?;

            // Hook 2: the "last" checkpoint is overwritten unconditionally.
            checkpoint::save_checkpoint(
                &self.artifacts_dir,
                CheckpointKind::Last,
                &self.split,
                &self.model,
            )?;

            // Hook 3: the "best" checkpoint only on strict improvement.
            if improves_best(prior_best, validation.metrics.accuracy) {
                checkpoint::save_checkpoint(
                    &self.artifacts_dir,
                    CheckpointKind::Best,
                    &self.split,
                    &self.model,
                )?;
                println!(
                    "[{}] epoch {}: new best val_accuracy {:.4}",
                    self.split, epoch, validation.metrics.accuracy
                );
            }

            self.logger
                .log_epoch(&self.split, epoch, &train, &validation, self.learning_rate);

            // Hook 4: plateau learning-rate reduction.
            if let Some(reduced) = self.plateau.step(validation.loss, self.learning_rate) {
                println!(
                    "[{}] epoch {}: reducing learning rate {:.3e} -> {:.3e}",
                    self.split, epoch, self.learning_rate, reduced
                );
                self.learning_rate = reduced;
                self.optimizer.set_learning_rate(reduced);
            }

            final_validation = Some(validation);

            // Hook 5: early stopping.
            if self.early_stop.step(validation.loss) {
                println!("[{}] epoch {}: early stopping", self.split, epoch);
                reason = StopReason::EarlyStopped;
                break;
            }
        }

        self.state = RunState::Stopped(reason);
        self.logger.flush();

        // Final full-history snapshot, independent of the per-epoch file.
        self.history.save(&self.complete_history_path())?;

        Ok(RunReport {
            reason,
            epochs_completed: self.history.epochs_completed(),
            final_validation,
        })
    }

    fn run_training_pass(&mut self) -> Result<EpochSummary, TrainingError> {
        self.train_source.reset()?;
        let mut metrics = MetricSet::new(self.train_source.num_classes())?;
        let mut loss_sum = 0.0;
        let mut examples = 0usize;

        while let Some(batch) = self.train_source.next_batch()? {
            let probabilities = self
                .model
                .forward_t(&batch.images, true)
                .map_err(to_runtime_error)?;
            let output = self.loss.compute(&probabilities, &batch.labels)?;
            self.optimizer
                .backward_step(&output.loss)
                .map_err(to_runtime_error)?;

            loss_sum += output.metrics.average_loss() * output.metrics.examples() as f64;
            examples += output.metrics.examples();
            metrics.update(&argmax_rows(&batch.labels)?, &argmax_rows(&probabilities)?)?;
        }

        if examples == 0 {
            return Err(TrainingError::runtime(
                "training pass produced no batches",
            ));
        }
        Ok(EpochSummary {
            loss: loss_sum / examples as f64,
            metrics: metrics.snapshot(),
        })
    }

    fn run_validation_pass(&mut self) -> Result<EpochSummary, TrainingError> {
        self.validation_source.reset()?;
        let mut metrics = MetricSet::new(self.validation_source.num_classes())?;
        let mut loss_sum = 0.0;
        let mut examples = 0usize;

        while let Some(batch) = self.validation_source.next_batch()? {
            let probabilities = self
                .model
                .forward_t(&batch.images, false)
                .map_err(to_runtime_error)?;
            let output = self.loss.compute(&probabilities, &batch.labels)?;

            loss_sum += output.metrics.average_loss() * output.metrics.examples() as f64;
            examples += output.metrics.examples();
            metrics.update(&argmax_rows(&batch.labels)?, &argmax_rows(&probabilities)?)?;
        }

        if examples == 0 {
            return Err(TrainingError::runtime(
                "validation pass produced no batches",
            ));
        }
        Ok(EpochSummary {
            loss: loss_sum / examples as f64,
            metrics: metrics.snapshot(),
        })
    }
}

fn build_optimizer(
    model: &HybridClassifier,
    config: &OptimizerConfig,
    learning_rate: f64,
) -> Result<AdamW, TrainingError> {
    let params = ParamsAdamW {
        lr: learning_rate,
        beta1: config.beta1,
        beta2: config.beta2,
        eps: config.epsilon,
        weight_decay: config.weight_decay,
    };
    AdamW::new(model.var_map().all_vars(), params).map_err(to_runtime_error)
}

fn argmax_rows(rows: &Tensor) -> Result<Vec<u32>, TrainingError> {
    rows.argmax(D::Minus1)
        .map_err(to_runtime_error)?
        .to_vec1::<u32>()
        .map_err(to_runtime_error)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
