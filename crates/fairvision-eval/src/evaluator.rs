//! Fairness-aware evaluation loop.
//!
//! ```text
//! Init → LoadingCheckpoint → Ready → Iterating(i) → Done → Reported
//! ```
//!
//! The model runs in [`ForwardMode::Eval`] for the whole pass, so neither
//! weights nor running statistics move. A failing batch aborts the pass and
//! nothing is written to the sink.

use candle_core::Device;
use fairvision_core::{EvalConfig, FairVisionError, ModelVariant, Result};
use fairvision_model::{select_device, tensor_error, Checkpoint, CompositeModel, ForwardMode};
use indicatif::{ProgressBar, ProgressStyle};

use crate::data::{BatchSource, TensorDataset};
use crate::metrics::{DecisionRule, FairnessSummary, MetricEngine};
use crate::report::{FileSink, ReportSink};

/// Where an [`Evaluator`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalPhase {
    Init,
    LoadingCheckpoint,
    Ready,
    Iterating { batch: usize },
    Done,
    Reported,
}

/// Outcome of a completed pass.
#[derive(Debug, Clone)]
pub struct EvalReport {
    pub summary: FairnessSummary,
    /// The line appended to the sink.
    pub line: String,
    pub batches: usize,
}

/// Runs one evaluation pass over a checkpoint.
pub struct Evaluator {
    config: EvalConfig,
    device: Device,
    phase: EvalPhase,
    model: Option<CompositeModel>,
    engine: Option<MetricEngine>,
}

impl Evaluator {
    /// Validate `config` and select the compute device.
    ///
    /// # Errors
    ///
    /// [`FairVisionError::Config`] before anything is read from disk.
    pub fn new(config: EvalConfig) -> Result<Self> {
        config.validate()?;
        let device = select_device(config.gpu_id);
        Ok(Self::with_device(config, device))
    }

    /// Use an explicit device. `config` is assumed valid.
    pub fn with_device(config: EvalConfig, device: Device) -> Self {
        Self {
            config,
            device,
            phase: EvalPhase::Init,
            model: None,
            engine: None,
        }
    }

    pub fn phase(&self) -> EvalPhase {
        self.phase
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    /// Read the checkpoint and rebuild the baseline model from it.
    ///
    /// # Errors
    ///
    /// [`FairVisionError::CheckpointMismatch`] when the stored weights do not
    /// fit the stored hyperparameters.
    pub fn load_checkpoint(&mut self) -> Result<&CompositeModel> {
        self.phase = EvalPhase::LoadingCheckpoint;
        let checkpoint = Checkpoint::open(&self.config.weights)?;
        let model = checkpoint.load_model(ModelVariant::Baseline, &self.device)?;

        let head = model.label_head();
        let rule = DecisionRule::for_head(
            head.normalization(),
            head.num_classes(),
            self.config.decision_threshold,
        );
        tracing::info!(
            weights = %self.config.weights.display(),
            hidden_size = checkpoint.hyp().hidden_size,
            num_classes = head.num_classes(),
            threshold = rule.threshold,
            "Checkpoint ready for evaluation"
        );

        self.engine = Some(MetricEngine::new(rule, self.config.num_groups));
        self.phase = EvalPhase::Ready;
        Ok(&*self.model.insert(model))
    }

    /// Iterate `source` to exhaustion and append the final line to `sink`.
    ///
    /// Loads the checkpoint first if [`Evaluator::load_checkpoint`] has not
    /// run. Consumes the evaluator so a pass is reported at most once.
    pub fn run<S, R>(mut self, source: &mut S, sink: &mut R) -> Result<EvalReport>
    where
        S: BatchSource + ?Sized,
        R: ReportSink + ?Sized,
    {
        if self.model.is_none() {
            self.load_checkpoint()?;
        }
        let (Some(model), Some(mut engine)) = (self.model.take(), self.engine.take()) else {
            return Err(FairVisionError::Config(
                "evaluator has no model after loading".into(),
            ));
        };
        engine.reset();

        let total = source.batch_count();
        let progress = progress_bar(total as u64, self.config.show_progress);

        let mut batches = 0usize;
        while let Some(batch) = source.next_batch()? {
            self.phase = EvalPhase::Iterating { batch: batches };

            let images = batch
                .images
                .to_device(&self.device)
                .map_err(tensor_error("move images to device"))?;
            let scores = model.label_scores(&images, ForwardMode::Eval)?;
            let targets = batch
                .targets
                .to_device(&self.device)
                .map_err(tensor_error("move targets to device"))?;
            engine.observe_tensors(&scores, &targets, &batch.protected)?;

            batches += 1;
            progress.set_message(engine.summary().report_line());
            progress.inc(1);
        }
        progress.finish_and_clear();
        self.phase = EvalPhase::Done;

        let summary = engine.summary();
        let line = summary.report_line();
        sink.append_line(&line)?;
        self.phase = EvalPhase::Reported;

        tracing::info!(
            batches,
            samples = summary.samples,
            missing_groups = ?summary.missing_groups,
            "{line}"
        );
        Ok(EvalReport {
            summary,
            line,
            batches,
        })
    }
}

fn progress_bar(len: u64, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    match ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}")
    {
        Ok(style) => pb.set_style(style.progress_chars("#>-")),
        Err(e) => tracing::debug!(error = %e, "Falling back to default progress style"),
    }
    pb
}

/// Load the configured split and checkpoint, evaluate, and append the line
/// to `config.log_path`.
pub fn evaluate(config: EvalConfig) -> Result<EvalReport> {
    let evaluator = Evaluator::new(config)?;
    let config = evaluator.config();

    let dataset = TensorDataset::load(&config.data, &Device::Cpu)?.subset(config.subset_fraction)?;
    tracing::info!(
        samples = dataset.len(),
        subset_fraction = config.subset_fraction,
        batch_size = config.batch_size,
        "Evaluating"
    );
    let mut source = dataset.batches(config.batch_size);
    let mut sink = FileSink::new(&config.log_path);
    evaluator.run(&mut source, &mut sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Batch;
    use candle_core::{DType, Tensor};
    use fairvision_core::{BackboneKind, ModelHyperParams};
    use fairvision_model::CheckpointMeta;
    use candle_nn::VarMap;
    use std::path::Path;

    fn hyp() -> ModelHyperParams {
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
            ..Default::default()
        }
    }

    fn write_checkpoint(dir: &Path) {
        let varmap = VarMap::new();
        let model =
            CompositeModel::new_trainable(&hyp(), ModelVariant::Baseline, &varmap, &Device::Cpu)
                .unwrap();
        let images = Tensor::randn(0f32, 1f32, (8, 3, 4, 4), &Device::Cpu).unwrap();
        model.label_scores(&images, ForwardMode::Train).unwrap();
        let meta = CheckpointMeta {
            hyp: hyp(),
            running_stats_ready: true,
            epochs_trained: 1,
        };
        Checkpoint::save(dir, meta, &varmap).unwrap();
    }

    fn config(dir: &Path) -> EvalConfig {
        EvalConfig {
            show_progress: false,
            ..EvalConfig::new(dir)
        }
    }

    /// Yields a good batch and then a malformed one.
    struct FailingSource {
        calls: usize,
    }

    impl BatchSource for FailingSource {
        fn batch_count(&self) -> usize {
            2
        }

        fn next_batch(&mut self) -> Result<Option<Batch>> {
            self.calls += 1;
            let size = if self.calls == 1 { 4 } else { 5 };
            Ok(Some(Batch {
                images: Tensor::randn(0f32, 1f32, (2, 3, size, size), &Device::Cpu).unwrap(),
                targets: Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap(),
                protected: Tensor::new(&[0f32, 1.], &Device::Cpu).unwrap(),
            }))
        }
    }

    #[test]
    fn test_invalid_config_rejected_before_loading() {
        let cfg = EvalConfig {
            batch_size: 0,
            ..EvalConfig::new("/nonexistent")
        };
        assert!(matches!(
            Evaluator::new(cfg),
            Err(FairVisionError::Config(_))
        ));
    }

    #[test]
    fn test_phases_through_load() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(dir.path());
        let mut evaluator = Evaluator::with_device(config(dir.path()), Device::Cpu);
        assert_eq!(evaluator.phase(), EvalPhase::Init);
        let model = evaluator.load_checkpoint().unwrap();
        assert_eq!(model.variant(), ModelVariant::Baseline);
        assert_eq!(evaluator.phase(), EvalPhase::Ready);
    }

    #[test]
    fn test_missing_checkpoint_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut evaluator = Evaluator::with_device(config(dir.path()), Device::Cpu);
        assert!(evaluator.load_checkpoint().is_err());
        assert_eq!(evaluator.phase(), EvalPhase::LoadingCheckpoint);
    }

    #[test]
    fn test_batch_failure_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(dir.path());
        let evaluator = Evaluator::with_device(config(dir.path()), Device::Cpu);
        let mut sink: Vec<String> = Vec::new();
        let err = evaluator
            .run(&mut FailingSource { calls: 0 }, &mut sink)
            .unwrap_err();
        assert!(matches!(err, FairVisionError::Shape { .. }));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_run_reports_once() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(dir.path());

        let images = Tensor::randn(0f32, 1f32, (6, 3, 4, 4), &Device::Cpu).unwrap();
        let targets = Tensor::new(
            &[[1f32, 0., 0.], [0., 1., 0.], [0., 0., 1.], [1., 1., 0.], [0., 0., 0.], [0., 1., 1.]],
            &Device::Cpu,
        )
        .unwrap();
        let protected = Tensor::new(&[0f32, 1., 0., 1., 0., 1.], &Device::Cpu).unwrap();
        let dataset = TensorDataset::new(images, targets, protected).unwrap();

        let evaluator = Evaluator::with_device(config(dir.path()), Device::Cpu);
        let mut sink: Vec<String> = Vec::new();
        let report = evaluator.run(&mut dataset.batches(4), &mut sink).unwrap();

        assert_eq!(report.batches, 2);
        assert_eq!(report.summary.samples, 6);
        assert_eq!(sink, vec![report.line.clone()]);
        assert!(report.line.starts_with("Accuracy: "));
        assert!(report.summary.require_all_groups().is_ok());
    }
}
