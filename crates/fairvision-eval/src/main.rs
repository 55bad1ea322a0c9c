//! CLI entry point.
//!
//! Subcommands:
//!   eval   -- Score a checkpoint on a split and append the fairness report line
//!   train  -- Train a baseline or debiased model and save the best checkpoint

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use fairvision_core::{BackboneKind, EvalConfig, ModelVariant};
use fairvision_eval::config::{load_eval_config, load_train_setup, TrainSetup};
use fairvision_eval::logging::init_tracing;
use fairvision_eval::training::train;
use fairvision_eval::{evaluate, TensorDataset};
use fairvision_model::select_device;

#[derive(Parser)]
#[command(name = "fairvision", version, about = "Fairness-aware image classifier evaluation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate a checkpoint and append accuracy and fairness gaps to the log.
    Eval {
        /// YAML file with defaults for every option below.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Checkpoint directory.
        #[arg(short = 'w', long, required_unless_present = "config")]
        weights: Option<PathBuf>,

        /// Evaluation split (safetensors).
        #[arg(long)]
        data: Option<PathBuf>,

        #[arg(long)]
        batch_size: Option<usize>,

        /// Fraction of the split to evaluate, in (0, 1].
        #[arg(long = "subset-percentage")]
        subset_fraction: Option<f64>,

        /// File the report line is appended to.
        #[arg(long = "log")]
        log_path: Option<PathBuf>,

        #[arg(long)]
        gpu_id: Option<usize>,

        /// Score threshold for a positive prediction.
        #[arg(long)]
        threshold: Option<f64>,

        /// Number of protected groups.
        #[arg(long)]
        num_groups: Option<usize>,

        /// Disable the progress bar.
        #[arg(long)]
        no_progress: bool,
    },

    /// Train a model on a tensor dataset.
    Train {
        /// YAML file with `train`, `model`, and `logging` sections.
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        train_data: Option<PathBuf>,

        #[arg(long)]
        val_data: Option<PathBuf>,

        /// Checkpoint directory for the best epoch.
        #[arg(long)]
        output: Option<PathBuf>,

        #[arg(long)]
        variant: Option<VariantArg>,

        /// Embedding width.
        #[arg(long)]
        hidden_size: Option<usize>,

        /// ResNet depth of the backbone.
        #[arg(long)]
        resnet_depth: Option<usize>,

        #[arg(long)]
        lr: Option<f64>,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        max_epochs: Option<usize>,

        /// Early stopping patience (epochs without improvement).
        #[arg(long)]
        patience: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,

        /// Keep pretrained backbone weights fixed.
        #[arg(long)]
        freeze_backbone: bool,

        #[arg(long, default_value = "0")]
        gpu_id: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum VariantArg {
    Baseline,
    Debiased,
}

impl From<VariantArg> for ModelVariant {
    fn from(v: VariantArg) -> Self {
        match v {
            VariantArg::Baseline => Self::Baseline,
            VariantArg::Debiased => Self::Debiased,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Eval {
            config,
            weights,
            data,
            batch_size,
            subset_fraction,
            log_path,
            gpu_id,
            threshold,
            num_groups,
            no_progress,
        } => {
            let mut cfg = match (&config, weights.clone()) {
                (Some(path), _) => load_eval_config(path)?,
                (None, Some(weights)) => EvalConfig::new(weights),
                (None, None) => anyhow::bail!("--weights is required without --config"),
            };
            if let Some(v) = weights {
                cfg.weights = v;
            }
            if let Some(v) = data {
                cfg.data = v;
            }
            if let Some(v) = batch_size {
                cfg.batch_size = v;
            }
            if let Some(v) = subset_fraction {
                cfg.subset_fraction = v;
            }
            if let Some(v) = log_path {
                cfg.log_path = v;
            }
            if let Some(v) = gpu_id {
                cfg.gpu_id = v;
            }
            if threshold.is_some() {
                cfg.decision_threshold = threshold;
            }
            if let Some(v) = num_groups {
                cfg.num_groups = v;
            }
            if no_progress {
                cfg.show_progress = false;
            }

            init_tracing(&cfg.logging);
            let report = evaluate(cfg).context("Evaluation failed")?;
            println!("{}", report.line);
            report.summary.require_all_groups()?;
        }

        Command::Train {
            config,
            train_data,
            val_data,
            output,
            variant,
            hidden_size,
            resnet_depth,
            lr,
            batch_size,
            max_epochs,
            patience,
            seed,
            freeze_backbone,
            gpu_id,
        } => {
            let mut setup = match &config {
                Some(path) => load_train_setup(path)?,
                None => TrainSetup::default(),
            };
            let t = &mut setup.train;
            if let Some(v) = train_data {
                t.train_data = v;
            }
            if let Some(v) = val_data {
                t.val_data = v;
            }
            if let Some(v) = output {
                t.output_dir = v;
            }
            if let Some(v) = lr {
                t.lr = v;
            }
            if let Some(v) = batch_size {
                t.batch_size = v;
            }
            if let Some(v) = max_epochs {
                t.max_epochs = v;
            }
            if let Some(v) = patience {
                t.patience = v;
            }
            if let Some(v) = seed {
                t.seed = v;
            }
            if freeze_backbone {
                t.freeze_backbone = true;
            }
            if let Some(v) = variant {
                setup.model.variant = v.into();
            }
            if let Some(v) = hidden_size {
                setup.model.hidden_size = v;
            }
            if let Some(depth) = resnet_depth {
                setup.model.backbone = BackboneKind::ResNet { depth };
            }

            init_tracing(&setup.logging);
            run_training(&setup, gpu_id)?;
        }
    }

    Ok(())
}

fn run_training(setup: &TrainSetup, gpu_id: usize) -> anyhow::Result<()> {
    setup.train.validate()?;
    setup.model.validate()?;

    let device = select_device(gpu_id);
    let train_set = TensorDataset::load(&setup.train.train_data, &device)
        .with_context(|| format!("Failed to load {}", setup.train.train_data.display()))?;
    let val_set = TensorDataset::load(&setup.train.val_data, &device)
        .with_context(|| format!("Failed to load {}", setup.train.val_data.display()))?;

    let history = train(&setup.train, &setup.model, &train_set, &val_set, &device)?;
    if let Some(best) = history.iter().rev().find(|m| m.improved) {
        println!(
            "Best epoch {} (val_loss={:.4}): {}",
            best.epoch, best.val_loss, best.val_summary
        );
    }
    println!("Checkpoint saved to: {}", setup.train.output_dir.display());
    Ok(())
}
