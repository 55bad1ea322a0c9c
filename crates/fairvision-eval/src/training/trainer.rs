//! Training loop with early stopping on validation label loss.

use std::path::PathBuf;

use candle_core::{Device, Tensor, Var, D};
use candle_nn::{Optimizer, VarMap};
use fairvision_core::{FairVisionError, ModelHyperParams, Result, ScoreNormalization};
use fairvision_model::{tensor_error, Checkpoint, CheckpointMeta, CompositeModel, ForwardMode};
use serde::{Deserialize, Serialize};

use super::loss::{one_hot, task_loss};
use crate::data::{Batch, BatchSource, TensorDataset};
use crate::meter::AverageMeter;
use crate::metrics::{group_ids, DecisionRule, FairnessSummary, MetricEngine};

/// Training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Training split (safetensors tensor dataset).
    #[serde(default = "default_train_data")]
    pub train_data: PathBuf,
    /// Validation split used for early stopping.
    #[serde(default = "default_val_data")]
    pub val_data: PathBuf,
    /// Checkpoint directory receiving the best epoch.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    /// Epochs without validation improvement before stopping.
    #[serde(default = "default_patience")]
    pub patience: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Keep backbone weights fixed; only the projection, batch norm and
    /// heads are optimized.
    #[serde(default)]
    pub freeze_backbone: bool,
    /// Override for the validation decision threshold.
    #[serde(default)]
    pub decision_threshold: Option<f64>,
    /// Protected groups expected in the validation split.
    #[serde(default = "default_num_groups")]
    pub num_groups: usize,
}

fn default_train_data() -> PathBuf {
    PathBuf::from("data/train.safetensors")
}

fn default_val_data() -> PathBuf {
    PathBuf::from("data/valid.safetensors")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("runs/best")
}

fn default_lr() -> f64 {
    1e-3
}

fn default_weight_decay() -> f64 {
    1e-4
}

fn default_batch_size() -> usize {
    16
}

fn default_max_epochs() -> usize {
    20
}

fn default_patience() -> usize {
    3
}

fn default_seed() -> u64 {
    42
}

fn default_num_groups() -> usize {
    2
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            train_data: default_train_data(),
            val_data: default_val_data(),
            output_dir: default_output_dir(),
            lr: default_lr(),
            weight_decay: default_weight_decay(),
            batch_size: default_batch_size(),
            max_epochs: default_max_epochs(),
            patience: default_patience(),
            seed: default_seed(),
            freeze_backbone: false,
            decision_threshold: None,
            num_groups: default_num_groups(),
        }
    }
}

impl TrainConfig {
    /// # Errors
    ///
    /// [`FairVisionError::Config`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size < 2 {
            // Batch statistics need more than one sample.
            return Err(FairVisionError::Config(format!(
                "training batch_size must be >= 2, got {}",
                self.batch_size
            )));
        }
        if !(self.lr > 0.0) {
            return Err(FairVisionError::Config(format!("lr must be > 0, got {}", self.lr)));
        }
        if self.weight_decay < 0.0 {
            return Err(FairVisionError::Config("weight_decay must be >= 0".into()));
        }
        if self.max_epochs == 0 {
            return Err(FairVisionError::Config("max_epochs must be > 0".into()));
        }
        if let Some(t) = self.decision_threshold {
            if !(t > 0.0 && t < 1.0) {
                return Err(FairVisionError::Config(format!(
                    "decision threshold must be in (0, 1), got {t}"
                )));
            }
        }
        if self.num_groups < 2 {
            return Err(FairVisionError::Config(format!(
                "fairness metrics need at least 2 protected groups, got {}",
                self.num_groups
            )));
        }
        Ok(())
    }
}

/// Per-epoch metrics logged during training.
#[derive(Debug, Clone)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub val_summary: FairnessSummary,
    /// Validation accuracy of the adversarial head; debiased variant only.
    pub adversary_accuracy: Option<f64>,
    /// Whether this epoch produced the saved checkpoint.
    pub improved: bool,
}

/// Train `hyp.variant` on `train_set`, saving the best epoch to
/// `config.output_dir`.
///
/// # Errors
///
/// [`FairVisionError::Config`] for an invalid configuration or an empty
/// split; any model or tensor failure aborts training.
pub fn train(
    config: &TrainConfig,
    hyp: &ModelHyperParams,
    train_set: &TensorDataset,
    val_set: &TensorDataset,
    device: &Device,
) -> Result<Vec<EpochMetrics>> {
    config.validate()?;
    hyp.validate()?;
    if train_set.len() < 2 || val_set.is_empty() {
        return Err(FairVisionError::Config(format!(
            "need at least 2 training and 1 validation samples, got {} and {}",
            train_set.len(),
            val_set.len()
        )));
    }

    let varmap = VarMap::new();
    let model = CompositeModel::new_trainable(hyp, hyp.variant, &varmap, device)?;

    let vars = trainable_vars(&varmap, config.freeze_backbone)?;
    tracing::info!(
        variant = %hyp.variant,
        trainable = vars.len(),
        freeze_backbone = config.freeze_backbone,
        "Created trainable model"
    );
    let mut optimizer = candle_nn::AdamW::new(
        vars,
        candle_nn::ParamsAdamW {
            lr: config.lr,
            weight_decay: config.weight_decay,
            ..Default::default()
        },
    )
    .map_err(tensor_error("create optimizer"))?;

    let head = model.label_head();
    let rule = DecisionRule::for_head(
        head.normalization(),
        head.num_classes(),
        config.decision_threshold,
    );

    let mut source = train_set.batches(config.batch_size);
    let mut best_val_loss = f64::MAX;
    let mut patience_counter = 0usize;
    let mut history = Vec::new();

    tracing::info!(
        lr = config.lr,
        weight_decay = config.weight_decay,
        batch_size = config.batch_size,
        max_epochs = config.max_epochs,
        patience = config.patience,
        "Training"
    );

    for epoch in 0..config.max_epochs {
        source.reshuffle(config.seed, epoch);

        let mut train_loss = AverageMeter::new();
        while let Some(batch) = source.next_batch()? {
            // A single trailing sample has no batch variance.
            if batch.len() < 2 {
                continue;
            }
            let batch = to_device(batch, device)?;
            let loss = training_loss(&model, &batch, hyp)?;
            optimizer
                .backward_step(&loss)
                .map_err(tensor_error("backward step"))?;
            train_loss.update(scalar(&loss)?, batch.len());
        }

        let validation = validate(&model, val_set, config, rule, device)?;

        let improved = validation.loss < best_val_loss;
        if improved {
            best_val_loss = validation.loss;
            patience_counter = 0;
            let meta = CheckpointMeta {
                hyp: hyp.clone(),
                running_stats_ready: model.encoder().stats_ready(),
                epochs_trained: (epoch + 1) as u64,
            };
            Checkpoint::save(&config.output_dir, meta, &varmap)?;
        } else {
            patience_counter += 1;
        }

        let metrics = EpochMetrics {
            epoch: epoch + 1,
            train_loss: train_loss.avg().unwrap_or(0.0),
            val_loss: validation.loss,
            val_summary: validation.summary,
            adversary_accuracy: validation.adversary_accuracy,
            improved,
        };
        tracing::info!(
            epoch = metrics.epoch,
            train_loss = format_args!("{:.4}", metrics.train_loss),
            val_loss = format_args!("{:.4}", metrics.val_loss),
            adversary_accuracy = ?metrics.adversary_accuracy,
            improved,
            "{}",
            metrics.val_summary
        );
        history.push(metrics);

        if patience_counter >= config.patience {
            tracing::info!(
                epoch = epoch + 1,
                patience = config.patience,
                "Early stopping"
            );
            break;
        }
    }

    tracing::info!(
        best_val_loss = format_args!("{best_val_loss:.4}"),
        output = %config.output_dir.display(),
        "Training finished"
    );
    Ok(history)
}

/// Variables the optimizer may update.
///
/// Batch-norm running statistics are never optimized; backbone weights are
/// skipped when `freeze_backbone` is set.
fn trainable_vars(varmap: &VarMap, freeze_backbone: bool) -> Result<Vec<Var>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| FairVisionError::Tensor("variable map lock poisoned".into()))?;
    let mut named: Vec<(&String, &Var)> = data
        .iter()
        .filter(|(name, _)| !name.ends_with("running_mean") && !name.ends_with("running_var"))
        .filter(|(name, _)| !(freeze_backbone && name.starts_with("encoder.backbone.")))
        .collect();
    named.sort_by(|a, b| a.0.cmp(b.0));
    Ok(named.into_iter().map(|(_, var)| var.clone()).collect())
}

fn training_loss(model: &CompositeModel, batch: &Batch, hyp: &ModelHyperParams) -> Result<Tensor> {
    let embedding = model.encoder().encode(&batch.images, ForwardMode::Train)?;
    let head = model.label_head();
    let logits = head.logits(&embedding)?;
    let label_loss = task_loss(&logits, &batch.targets, head.normalization())
        .map_err(tensor_error("label loss"))?;

    let Some(adversary) = model.adversarial_head() else {
        return Ok(label_loss);
    };
    let protected = protected_targets(&batch.protected, hyp.num_protected_classes, logits.device())?;
    let adv_logits = adversary.logits(&embedding.detach())?;
    let adv_loss = task_loss(&adv_logits, &protected, ScoreNormalization::Softmax)
        .map_err(tensor_error("adversary loss"))?;
    label_loss.add(&adv_loss).map_err(tensor_error("total loss"))
}

struct Validation {
    loss: f64,
    summary: FairnessSummary,
    adversary_accuracy: Option<f64>,
}

fn validate(
    model: &CompositeModel,
    val_set: &TensorDataset,
    config: &TrainConfig,
    rule: DecisionRule,
    device: &Device,
) -> Result<Validation> {
    let head = model.label_head();
    let mut engine = MetricEngine::new(rule, config.num_groups);
    let mut loss = AverageMeter::new();
    let mut adversary_accuracy = AverageMeter::new();

    let mut source = val_set.batches(config.batch_size);
    while let Some(batch) = source.next_batch()? {
        let batch = to_device(batch, device)?;
        let embedding = model.encoder().encode(&batch.images, ForwardMode::Eval)?;
        let logits = head.logits(&embedding)?;
        let batch_loss = task_loss(&logits, &batch.targets, head.normalization())
            .map_err(tensor_error("validation loss"))?;
        loss.update(scalar(&batch_loss)?, batch.len());

        let scores = head.normalize(&logits)?;
        engine.observe_tensors(&scores, &batch.targets, &batch.protected)?;

        if let Some(adversary) = model.adversarial_head() {
            let predicted: Vec<u32> = adversary
                .logits(&embedding)?
                .argmax(D::Minus1)
                .and_then(|t| t.to_vec1::<u32>())
                .map_err(tensor_error("adversary predictions"))?;
            let actual = group_ids(&batch.protected, adversary.num_classes())?;
            let hits = predicted.iter().zip(&actual).filter(|(p, a)| p == a).count();
            adversary_accuracy.update(hits as f64 / actual.len().max(1) as f64, actual.len());
        }
    }

    Ok(Validation {
        loss: loss.avg().unwrap_or(f64::MAX),
        summary: engine.summary(),
        adversary_accuracy: adversary_accuracy.avg(),
    })
}

fn protected_targets(protected: &Tensor, num_classes: usize, device: &Device) -> Result<Tensor> {
    let groups = group_ids(protected, num_classes)?;
    one_hot(&groups, num_classes, device).map_err(tensor_error("protected one-hot"))
}

fn to_device(batch: Batch, device: &Device) -> Result<Batch> {
    let move_to = |t: &Tensor| t.to_device(device).map_err(tensor_error("move batch to device"));
    Ok(Batch {
        images: move_to(&batch.images)?,
        targets: move_to(&batch.targets)?,
        protected: move_to(&batch.protected)?,
    })
}

fn scalar(t: &Tensor) -> Result<f64> {
    t.to_scalar::<f32>()
        .map(f64::from)
        .map_err(tensor_error("loss scalar"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use fairvision_core::{BackboneKind, ModelVariant};

    fn hyp(variant: ModelVariant) -> ModelHyperParams {
        ModelHyperParams {
            hidden_size: 8,
            num_classes: 3,
            head_width: 16,
            backbone: BackboneKind::Pooled {
                channels: 3,
                height: 4,
                width: 4,
                feature_dim: 6,
            },
            variant,
            ..Default::default()
        }
    }

    fn dataset(n: usize, seed_offset: f64) -> TensorDataset {
        let device = Device::Cpu;
        let images = Tensor::randn(seed_offset as f32, 1f32, (n, 3, 4, 4), &device).unwrap();
        let targets: Vec<f32> = (0..n * 3).map(|i| ((i % 3 == 0) as u8) as f32).collect();
        let targets = Tensor::from_vec(targets, (n, 3), &device).unwrap();
        let protected: Vec<f32> = (0..n).map(|i| (i % 2) as f32).collect();
        let protected = Tensor::from_vec(protected, n, &device).unwrap();
        TensorDataset::new(images, targets, protected).unwrap()
    }

    #[test]
    fn test_train_config_default() {
        let cfg = TrainConfig::default();
        assert!((cfg.lr - 1e-3).abs() < 1e-12);
        assert_eq!(cfg.batch_size, 16);
        assert_eq!(cfg.patience, 3);
        assert_eq!(cfg.seed, 42);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_train_config_rejects_single_sample_batches() {
        let cfg = TrainConfig {
            batch_size: 1,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(FairVisionError::Config(_))));
    }

    #[test]
    fn test_running_stats_excluded_from_optimizer() {
        let varmap = VarMap::new();
        CompositeModel::new_trainable(
            &hyp(ModelVariant::Baseline),
            ModelVariant::Baseline,
            &varmap,
            &Device::Cpu,
        )
        .unwrap();
        let all = varmap.all_vars().len();
        let trainable = trainable_vars(&varmap, false).unwrap().len();
        assert_eq!(all - trainable, 2);

        // Pooled backbone: one projection weight and bias.
        let frozen = trainable_vars(&varmap, true).unwrap().len();
        assert_eq!(trainable - frozen, 2);
    }

    #[test]
    fn test_train_baseline_saves_loadable_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainConfig {
            output_dir: dir.path().join("best"),
            batch_size: 4,
            max_epochs: 2,
            patience: 5,
            ..Default::default()
        };
        let hyp = hyp(ModelVariant::Baseline);
        let history = train(&config, &hyp, &dataset(10, 0.0), &dataset(6, 0.5), &Device::Cpu)
            .unwrap();

        assert_eq!(history.len(), 2);
        assert!(history[0].improved);
        assert!(history.iter().all(|m| m.train_loss.is_finite()));
        assert!(history.iter().all(|m| m.adversary_accuracy.is_none()));

        let ckpt = Checkpoint::open(&config.output_dir).unwrap();
        assert!(ckpt.meta().running_stats_ready);
        let model = ckpt
            .load_model(ModelVariant::Baseline, &Device::Cpu)
            .unwrap();
        let images = Tensor::zeros((2, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(model.label_scores(&images, ForwardMode::Eval).is_ok());
    }

    #[test]
    fn test_train_debiased_reports_adversary_accuracy() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainConfig {
            output_dir: dir.path().to_path_buf(),
            batch_size: 4,
            max_epochs: 1,
            ..Default::default()
        };
        let hyp = hyp(ModelVariant::Debiased);
        let history = train(&config, &hyp, &dataset(8, 0.0), &dataset(4, 0.0), &Device::Cpu)
            .unwrap();
        let acc = history[0].adversary_accuracy.unwrap();
        assert!((0.0..=1.0).contains(&acc));
    }

    #[test]
    fn test_train_rejects_single_sample_split() {
        let config = TrainConfig::default();
        let single = dataset(4, 0.0).subset(0.25).unwrap();
        assert_eq!(single.len(), 1);
        assert!(train(
            &config,
            &hyp(ModelVariant::Baseline),
            &single,
            &dataset(4, 0.0),
            &Device::Cpu
        )
        .is_err());
    }
}
