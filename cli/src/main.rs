use std::{
    env,
    io::{self, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use training::{
    checkpoint::{checkpoint_exists, CheckpointKind},
    discover_shards, trainer::select_device, Orchestrator, ShardImageSource, StopReason,
    TrainingConfig,
};

fn parse_config_path() -> PathBuf {
    let mut path = PathBuf::from("hybridnet.toml");
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if let Some(value) = arg.strip_prefix("--config=") {
            path = PathBuf::from(value);
        } else if arg == "--config" {
            if let Some(value) = args.next() {
                path = PathBuf::from(value);
            }
        } else {
            path = PathBuf::from(arg);
        }
    }
    path
}

fn prompt_resume(split: &str) -> Result<bool> {
    print!("Found existing checkpoint for '{}'. Resume? (y/n): ", split);
    io::stdout().flush().context("failed to flush stdout")?;
    let mut answer = String::new();
    io::stdin()
        .read_line(&mut answer)
        .context("failed to read resume answer")?;
    Ok(matches!(
        answer.trim().to_lowercase().as_str(),
        "y" | "yes" | "1" | "true"
    ))
}

fn print_final_summary(split: &str, orchestrator: &Orchestrator) {
    let history = orchestrator.history();
    let last = |name: &str| history.values(name).last().copied().unwrap_or(f64::NAN);
    println!("\nFinal metrics for split '{}':", split);
    println!("Accuracy: {:.4}", last("val_accuracy"));
    println!("F1 Score: {:.4}", last("val_f1_score"));
    println!("Sensitivity: {:.4}", last("val_sensitivity"));
    println!("Specificity: {:.4}", last("val_specificity"));
    println!("Precision: {:.4}", last("val_precision"));
    println!("Recall: {:.4}", last("val_recall"));
}

fn main() -> Result<()> {
    println!("hybridnet trainer");
    println!("=================\n");

    let config_path = parse_config_path();
    let config = TrainingConfig::load(&config_path)
        .with_context(|| format!("failed to load config {}", config_path.display()))?;
    let device = select_device(config.runtime.seed);

    let splits = config.data.splits.clone();
    for split in &splits {
        println!("\nTraining model for split: {}", split);

        let resume = if checkpoint_exists(
            &config.runtime.artifacts_dir,
            CheckpointKind::Last,
            split,
        ) {
            prompt_resume(split)?
        } else {
            false
        };

        let train_dir = config.data.root.join(split).join("train");
        let test_dir = config.data.root.join(split).join("test");
        let train_source = ShardImageSource::new(
            discover_shards(&train_dir)?,
            config.model.num_classes,
            config.data.batch_size,
            device.clone(),
            config.runtime.seed,
        )?;
        let validation_source = ShardImageSource::new(
            discover_shards(&test_dir)?,
            config.model.num_classes,
            config.data.batch_size,
            device.clone(),
            config.runtime.seed + 1,
        )?;

        let mut orchestrator = Orchestrator::new(
            &config,
            split,
            device.clone(),
            Box::new(train_source),
            Box::new(validation_source),
        )?;
        if resume {
            orchestrator.resume()?;
        }

        let report = orchestrator.run()?;
        match report.reason {
            StopReason::Completed => println!(
                "Training complete after {} epochs.",
                report.epochs_completed
            ),
            StopReason::EarlyStopped => println!(
                "Training stopped early after {} epochs.",
                report.epochs_completed
            ),
        }
        print_final_summary(split, &orchestrator);
    }

    println!("\nAll training finished!");
    Ok(())
}
