//! Baseline and debiased composite models.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use fairvision_core::{ModelHyperParams, ModelVariant, Result};

use crate::backbone::BackboneProvider;
use crate::encoder::Encoder;
use crate::head::TaskHead;
use crate::ForwardMode;

/// Encoder + label head.
pub struct BaselineModel {
    encoder: Encoder,
    label_head: TaskHead,
}

impl BaselineModel {
    pub fn build(
        hyp: &ModelHyperParams,
        provider: &dyn BackboneProvider,
        vb: VarBuilder<'static>,
        stats_ready: bool,
    ) -> Result<Self> {
        let encoder = Encoder::new(provider, hyp.hidden_size, vb.pp("encoder"), stats_ready)?;
        let label_head = label_head(hyp, vb.pp("label_head"))?;
        Ok(Self {
            encoder,
            label_head,
        })
    }

    /// Label scores, `[B, num_classes]`.
    pub fn predict(&self, images: &Tensor, mode: ForwardMode) -> Result<Tensor> {
        let embedding = self.encoder.encode(images, mode)?;
        self.label_head.score(&embedding)
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn label_head(&self) -> &TaskHead {
        &self.label_head
    }
}

/// Everything a debiased forward pass produces.
pub struct DebiasedOutput {
    /// The single embedding both heads consumed.
    pub embedding: Tensor,
    /// `[B, num_classes]`.
    pub label_scores: Tensor,
    /// `[B, num_protected_classes]`.
    pub protected_scores: Tensor,
}

/// Encoder + label head + adversarial head over one shared embedding.
pub struct DebiasedModel {
    encoder: Encoder,
    label_head: TaskHead,
    adversarial_head: TaskHead,
}

impl DebiasedModel {
    pub fn build(
        hyp: &ModelHyperParams,
        provider: &dyn BackboneProvider,
        vb: VarBuilder<'static>,
        stats_ready: bool,
    ) -> Result<Self> {
        let encoder = Encoder::new(provider, hyp.hidden_size, vb.pp("encoder"), stats_ready)?;
        let label_head = label_head(hyp, vb.pp("label_head"))?;
        let adversarial_head = TaskHead::new(
            "adversarial_head",
            hyp.hidden_size,
            hyp.head_width,
            hyp.num_protected_classes,
            hyp.normalization,
            vb.pp("adversarial_head"),
        )?;
        Ok(Self {
            encoder,
            label_head,
            adversarial_head,
        })
    }

    /// `(label_scores, protected_scores)` from one encoder call.
    pub fn predict(&self, images: &Tensor, mode: ForwardMode) -> Result<(Tensor, Tensor)> {
        let out = self.forward(images, mode)?;
        Ok((out.label_scores, out.protected_scores))
    }

    /// Like [`DebiasedModel::predict`], also returning the shared embedding.
    pub fn forward(&self, images: &Tensor, mode: ForwardMode) -> Result<DebiasedOutput> {
        let embedding = self.encoder.encode(images, mode)?;
        let label_scores = self.label_head.score(&embedding)?;
        let protected_scores = self.adversarial_head.score(&embedding)?;
        Ok(DebiasedOutput {
            embedding,
            label_scores,
            protected_scores,
        })
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn label_head(&self) -> &TaskHead {
        &self.label_head
    }

    pub fn adversarial_head(&self) -> &TaskHead {
        &self.adversarial_head
    }
}

fn label_head(hyp: &ModelHyperParams, vb: VarBuilder) -> Result<TaskHead> {
    TaskHead::new(
        "label_head",
        hyp.hidden_size,
        hyp.head_width,
        hyp.num_classes,
        hyp.normalization,
        vb,
    )
}

/// Either composite variant, chosen at construction.
pub enum CompositeModel {
    Baseline(BaselineModel),
    Debiased(DebiasedModel),
}

impl CompositeModel {
    /// Build `variant` from `hyp`, reading weights through `vb`.
    pub fn build(
        hyp: &ModelHyperParams,
        variant: ModelVariant,
        provider: &dyn BackboneProvider,
        vb: VarBuilder<'static>,
        stats_ready: bool,
    ) -> Result<Self> {
        hyp.validate()?;
        Ok(match variant {
            ModelVariant::Baseline => {
                Self::Baseline(BaselineModel::build(hyp, provider, vb, stats_ready)?)
            }
            ModelVariant::Debiased => {
                Self::Debiased(DebiasedModel::build(hyp, provider, vb, stats_ready)?)
            }
        })
    }

    /// Create a freshly initialized model whose variables live in `varmap`.
    ///
    /// The backbone comes from `hyp.backbone`; running statistics start
    /// uninitialized until the first training-mode forward.
    pub fn new_trainable(
        hyp: &ModelHyperParams,
        variant: ModelVariant,
        varmap: &VarMap,
        device: &Device,
    ) -> Result<Self> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        Self::build(hyp, variant, &hyp.backbone, vb, false)
    }

    pub fn variant(&self) -> ModelVariant {
        match self {
            Self::Baseline(_) => ModelVariant::Baseline,
            Self::Debiased(_) => ModelVariant::Debiased,
        }
    }

    /// Label scores for either variant.
    pub fn label_scores(&self, images: &Tensor, mode: ForwardMode) -> Result<Tensor> {
        match self {
            Self::Baseline(m) => m.predict(images, mode),
            Self::Debiased(m) => Ok(m.forward(images, mode)?.label_scores),
        }
    }

    pub fn encoder(&self) -> &Encoder {
        match self {
            Self::Baseline(m) => m.encoder(),
            Self::Debiased(m) => m.encoder(),
        }
    }

    pub fn label_head(&self) -> &TaskHead {
        match self {
            Self::Baseline(m) => m.label_head(),
            Self::Debiased(m) => m.label_head(),
        }
    }

    /// `None` for the baseline variant.
    pub fn adversarial_head(&self) -> Option<&TaskHead> {
        match self {
            Self::Baseline(_) => None,
            Self::Debiased(m) => Some(m.adversarial_head()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::{Backbone, PooledBackbone};
    use fairvision_core::BackboneKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn hyp() -> ModelHyperParams {
        ModelHyperParams {
            hidden_size: 8,
            num_classes: 3,
            num_protected_classes: 2,
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

    /// Pooled backbone that counts how often it runs.
    struct CountingProvider {
        calls: Arc<AtomicUsize>,
    }

    struct CountingBackbone {
        inner: PooledBackbone,
        calls: Arc<AtomicUsize>,
    }

    impl Backbone for CountingBackbone {
        fn input_shape(&self) -> (usize, usize, usize) {
            self.inner.input_shape()
        }
        fn feature_dim(&self) -> usize {
            self.inner.feature_dim()
        }
        fn extract(&self, images: &Tensor) -> candle_core::Result<Tensor> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.extract(images)
        }
    }

    impl BackboneProvider for CountingProvider {
        fn provide(&self, vb: VarBuilder<'static>) -> candle_core::Result<Box<dyn Backbone>> {
            Ok(Box::new(CountingBackbone {
                inner: PooledBackbone::new((3, 4, 4), 6, vb)?,
                calls: Arc::clone(&self.calls),
            }))
        }
    }

    #[test]
    fn test_baseline_predict_shape() {
        let varmap = VarMap::new();
        let model =
            CompositeModel::new_trainable(&hyp(), ModelVariant::Baseline, &varmap, &Device::Cpu)
                .unwrap();
        assert!(model.adversarial_head().is_none());

        let images = Tensor::randn(0f32, 1f32, (4, 3, 4, 4), &Device::Cpu).unwrap();
        let scores = model.label_scores(&images, ForwardMode::Train).unwrap();
        assert_eq!(scores.dims(), &[4, 3]);
    }

    #[test]
    fn test_debiased_heads_share_one_embedding() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = CountingProvider {
            calls: Arc::clone(&calls),
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = DebiasedModel::build(&hyp(), &provider, vb, false).unwrap();

        let images = Tensor::randn(0f32, 1f32, (4, 3, 4, 4), &Device::Cpu).unwrap();
        model.encoder().encode(&images, ForwardMode::Train).unwrap();
        calls.store(0, Ordering::SeqCst);

        let out = model.forward(&images, ForwardMode::Eval).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(out.label_scores.dims(), &[4, 3]);
        assert_eq!(out.protected_scores.dims(), &[4, 2]);

        // Re-scoring the returned embedding reproduces both outputs bit for bit.
        let label = model.label_head().score(&out.embedding).unwrap();
        let protected = model.adversarial_head().score(&out.embedding).unwrap();
        assert_eq!(
            label.to_vec2::<f32>().unwrap(),
            out.label_scores.to_vec2::<f32>().unwrap()
        );
        assert_eq!(
            protected.to_vec2::<f32>().unwrap(),
            out.protected_scores.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_debiased_predict_returns_both_outputs() {
        let varmap = VarMap::new();
        let model =
            CompositeModel::new_trainable(&hyp(), ModelVariant::Debiased, &varmap, &Device::Cpu)
                .unwrap();
        let CompositeModel::Debiased(model) = model else {
            panic!("expected debiased variant");
        };
        let images = Tensor::randn(0f32, 1f32, (2, 3, 4, 4), &Device::Cpu).unwrap();
        let (label, protected) = model.predict(&images, ForwardMode::Train).unwrap();
        assert_eq!(label.dims(), &[2, 3]);
        assert_eq!(protected.dims(), &[2, 2]);
    }

    #[test]
    fn test_invalid_hyperparams_rejected() {
        let varmap = VarMap::new();
        let bad = ModelHyperParams {
            hidden_size: 0,
            ..hyp()
        };
        assert!(
            CompositeModel::new_trainable(&bad, ModelVariant::Baseline, &varmap, &Device::Cpu)
                .is_err()
        );
    }
}
