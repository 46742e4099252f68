use std::{collections::HashMap, fs, path::Path};

use candle_core::{Device, Tensor};
use model::StageConfig;
use training::{
    checkpoint::{checkpoint_exists, CheckpointKind},
    config::{
        DataConfig, LoggingConfig, LossConfig, ModelSection, OptimizerConfig, RuntimeConfig,
        ScheduleConfig,
    },
    discover_shards, Orchestrator, RunState, ShardImageSource, StopReason, TrainingConfig,
};

const SPLIT: &str = "90-10";
const NUM_CLASSES: usize = 3;
const BATCH_SIZE: usize = 4;

fn write_shard(dir: &Path, name: &str, examples: usize, seed_offset: u32) {
    fs::create_dir_all(dir).unwrap();
    let images = Tensor::rand(0f32, 1f32, (examples, 3, 16, 16), &Device::Cpu).unwrap();
    let labels: Vec<u32> = (0..examples as u32)
        .map(|v| (v + seed_offset) % NUM_CLASSES as u32)
        .collect();
    let labels = Tensor::from_vec(labels, examples, &Device::Cpu).unwrap();

    let mut tensors = HashMap::new();
    tensors.insert("images".to_string(), images);
    tensors.insert("labels".to_string(), labels);
    candle_core::safetensors::save(&tensors, dir.join(name)).unwrap();
}

fn tiny_training_config(base: &Path, max_epochs: usize) -> TrainingConfig {
    TrainingConfig {
        model: ModelSection {
            num_classes: NUM_CLASSES,
            image_size: 16,
            window_size: 2,
            stem_channels: 4,
            stages: Some(vec![StageConfig::new(4, 4, 2, 0.0)]),
            head_hidden: Some(8),
            head_num_heads: Some(2),
        },
        data: DataConfig {
            root: base.join("data"),
            splits: vec![SPLIT.to_string()],
            batch_size: BATCH_SIZE,
        },
        optimizer: OptimizerConfig {
            learning_rate: 1e-2,
            ..OptimizerConfig::default()
        },
        loss: LossConfig::default(),
        schedule: ScheduleConfig::default(),
        runtime: RuntimeConfig {
            seed: 42,
            max_epochs,
            artifacts_dir: base.join("artifacts"),
            logging: LoggingConfig {
                enable_stdout: false,
                tensorboard: None,
                tensorboard_flush_every_n: 1,
            },
        },
    }
}

fn build_orchestrator(config: &TrainingConfig, device: &Device) -> Orchestrator {
    let train_dir = config.data.root.join(SPLIT).join("train");
    let test_dir = config.data.root.join(SPLIT).join("test");
    let train_source = ShardImageSource::new(
        discover_shards(&train_dir).unwrap(),
        NUM_CLASSES,
        config.data.batch_size,
        device.clone(),
        config.runtime.seed,
    )
    .unwrap();
    let validation_source = ShardImageSource::new(
        discover_shards(&test_dir).unwrap(),
        NUM_CLASSES,
        config.data.batch_size,
        device.clone(),
        config.runtime.seed + 1,
    )
    .unwrap();
    Orchestrator::new(
        config,
        SPLIT,
        device.clone(),
        Box::new(train_source),
        Box::new(validation_source),
    )
    .unwrap()
}

#[test]
fn smoke_train_checkpoint_resume() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path();
    let device = Device::Cpu;

    write_shard(&base.join("data").join(SPLIT).join("train"), "shard-0.safetensors", 8, 0);
    write_shard(&base.join("data").join(SPLIT).join("test"), "shard-0.safetensors", 6, 1);

    // Round-trip the configuration through TOML, the way the CLI loads it.
    let config_path = base.join("config.toml");
    fs::write(
        &config_path,
        toml::to_string(&tiny_training_config(base, 2)).unwrap(),
    )
    .unwrap();
    let config = TrainingConfig::load(&config_path).unwrap();

    let mut orchestrator = build_orchestrator(&config, &device);
    assert_eq!(orchestrator.state(), RunState::Fresh);
    let report = orchestrator.run().unwrap();

    assert_eq!(report.reason, StopReason::Completed);
    assert_eq!(report.epochs_completed, 2);
    assert_eq!(
        orchestrator.state(),
        RunState::Stopped(StopReason::Completed)
    );
    assert!(report.final_validation.is_some());

    let artifacts = &config.runtime.artifacts_dir;
    assert!(orchestrator.history_path().is_file());
    assert!(orchestrator.complete_history_path().is_file());
    assert!(checkpoint_exists(artifacts, CheckpointKind::Last, SPLIT));
    assert!(checkpoint_exists(artifacts, CheckpointKind::Best, SPLIT));

    let expected_lr = orchestrator.history().last_learning_rate().unwrap();

    // Resume idempotence: a fresh orchestrator reads back exactly the epoch
    // counter and learning rate the stopped run ended with.
    let mut resumed = build_orchestrator(&config, &device);
    resumed.resume().unwrap();
    assert_eq!(resumed.start_epoch(), 2);
    assert_eq!(resumed.learning_rate(), expected_lr);
    assert_eq!(resumed.history().epochs_completed(), 2);

    // The epoch budget is already spent, so the resumed run ends immediately
    // without touching the history.
    let report = resumed.run().unwrap();
    assert_eq!(report.reason, StopReason::Completed);
    assert_eq!(report.epochs_completed, 2);

    // Raising the budget trains exactly the one missing epoch.
    let extended_config = tiny_training_config(base, 3);
    let mut extended = build_orchestrator(&extended_config, &device);
    extended.resume().unwrap();
    assert_eq!(extended.start_epoch(), 2);
    let report = extended.run().unwrap();
    assert_eq!(report.epochs_completed, 3);
}

#[test]
fn resume_without_artifacts_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path();
    let device = Device::Cpu;

    write_shard(&base.join("data").join(SPLIT).join("train"), "shard-0.safetensors", 8, 0);
    write_shard(&base.join("data").join(SPLIT).join("test"), "shard-0.safetensors", 6, 1);

    let config = tiny_training_config(base, 2);
    let mut orchestrator = build_orchestrator(&config, &device);
    assert!(orchestrator.resume().is_err());
}

#[test]
fn resume_with_corrupt_history_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path();
    let device = Device::Cpu;

    write_shard(&base.join("data").join(SPLIT).join("train"), "shard-0.safetensors", 8, 0);
    write_shard(&base.join("data").join(SPLIT).join("test"), "shard-0.safetensors", 6, 1);

    let config = tiny_training_config(base, 1);
    let mut orchestrator = build_orchestrator(&config, &device);
    orchestrator.run().unwrap();

    fs::write(orchestrator.history_path(), b"{ truncated").unwrap();

    let mut resumed = build_orchestrator(&config, &device);
    assert!(resumed.resume().is_err());
}

#[test]
fn mismatched_source_classes_fail_fast() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path();
    let device = Device::Cpu;

    write_shard(&base.join("data").join(SPLIT).join("train"), "shard-0.safetensors", 8, 0);
    write_shard(&base.join("data").join(SPLIT).join("test"), "shard-0.safetensors", 6, 1);

    let config = tiny_training_config(base, 1);
    let train_dir = config.data.root.join(SPLIT).join("train");
    let test_dir = config.data.root.join(SPLIT).join("test");
    // Sources deliberately built with the wrong class count.
    let train_source = ShardImageSource::new(
        discover_shards(&train_dir).unwrap(),
        NUM_CLASSES + 2,
        BATCH_SIZE,
        device.clone(),
        1,
    )
    .unwrap();
    let validation_source = ShardImageSource::new(
        discover_shards(&test_dir).unwrap(),
        NUM_CLASSES + 2,
        BATCH_SIZE,
        device.clone(),
        2,
    )
    .unwrap();

    assert!(Orchestrator::new(
        &config,
        SPLIT,
        device,
        Box::new(train_source),
        Box::new(validation_source),
    )
    .is_err());
}
