//! Image → embedding encoder.
//!
//! Backbone features are projected to `hidden_size` and passed through a
//! batch-norm layer (momentum 0.01, eps 1e-5). The running mean/variance
//! only move on [`ForwardMode::Train`] calls.

use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::Tensor;
use candle_nn::{BatchNorm, BatchNormConfig, Linear, Module, ModuleT, VarBuilder};
use fairvision_core::{FairVisionError, Result};

use crate::backbone::{Backbone, BackboneProvider};
use crate::{tensor_error, ForwardMode};

/// Momentum of the running statistic update.
pub const BN_MOMENTUM: f64 = 0.01;

/// Variance epsilon of the embedding normalization.
pub const BN_EPS: f64 = 1e-5;

/// Shared visual encoder.
pub struct Encoder {
    backbone: Box<dyn Backbone>,
    linear: Linear,
    bn: BatchNorm,
    hidden_size: usize,
    /// Set once running statistics hold a real estimate (a training step ran,
    /// or they were restored from a checkpoint).
    stats_ready: AtomicBool,
}

impl Encoder {
    /// Build the encoder under `vb` (`backbone.*`, `linear.*`, `bn.*`).
    ///
    /// `stats_ready` declares whether the running statistics read through
    /// `vb` are already a usable estimate.
    pub fn new(
        provider: &dyn BackboneProvider,
        hidden_size: usize,
        vb: VarBuilder<'static>,
        stats_ready: bool,
    ) -> Result<Self> {
        let backbone = provider
            .provide(vb.pp("backbone"))
            .map_err(tensor_error("encoder backbone"))?;
        let linear = candle_nn::linear(backbone.feature_dim(), hidden_size, vb.pp("linear"))
            .map_err(tensor_error("encoder projection"))?;
        let bn = candle_nn::batch_norm(
            hidden_size,
            BatchNormConfig {
                eps: BN_EPS,
                remove_mean: true,
                affine: true,
                momentum: BN_MOMENTUM,
            },
            vb.pp("bn"),
        )
        .map_err(tensor_error("encoder batch norm"))?;

        Ok(Self {
            backbone,
            linear,
            bn,
            hidden_size,
            stats_ready: AtomicBool::new(stats_ready),
        })
    }

    /// Embedding width.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Expected `(channels, height, width)` of input images.
    pub fn input_shape(&self) -> (usize, usize, usize) {
        self.backbone.input_shape()
    }

    /// Whether eval-mode encoding is possible.
    pub fn stats_ready(&self) -> bool {
        self.stats_ready.load(Ordering::Acquire)
    }

    /// Encode `[B, C, H, W]` images into `[B, hidden_size]` embeddings.
    ///
    /// # Errors
    ///
    /// - [`FairVisionError::Shape`] if the images do not match the backbone input.
    /// - [`FairVisionError::UninitializedStats`] in eval mode before any
    ///   running statistic exists.
    pub fn encode(&self, images: &Tensor, mode: ForwardMode) -> Result<Tensor> {
        let (c, h, w) = self.backbone.input_shape();
        match images.dims() {
            [_, ic, ih, iw] if (*ic, *ih, *iw) == (c, h, w) => {}
            dims => {
                return Err(FairVisionError::Shape {
                    expected: format!("[B, {c}, {h}, {w}]"),
                    actual: format!("{dims:?}"),
                })
            }
        }
        if !mode.is_train() && !self.stats_ready() {
            return Err(FairVisionError::UninitializedStats);
        }

        let features = self
            .backbone
            .extract(images)
            .map_err(tensor_error("backbone forward"))?;
        let width = features.dim(1).map_err(tensor_error("backbone output"))?;
        if width != self.backbone.feature_dim() {
            return Err(FairVisionError::DimensionMismatch {
                component: "encoder projection".into(),
                expected: self.backbone.feature_dim(),
                actual: width,
            });
        }

        let projected = self
            .linear
            .forward(&features)
            .map_err(tensor_error("encoder projection"))?;
        let embedding = self
            .bn
            .forward_t(&projected, mode.is_train())
            .map_err(tensor_error("encoder batch norm"))?;

        if mode.is_train() {
            self.stats_ready.store(true, Ordering::Release);
        }
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use fairvision_core::BackboneKind;

    fn pooled() -> BackboneKind {
        BackboneKind::Pooled {
            channels: 3,
            height: 4,
            width: 4,
            feature_dim: 6,
        }
    }

    fn encoder(varmap: &VarMap, stats_ready: bool) -> Encoder {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        Encoder::new(&pooled(), 8, vb.pp("encoder"), stats_ready).unwrap()
    }

    #[test]
    fn test_encode_output_shape() {
        let varmap = VarMap::new();
        let enc = encoder(&varmap, false);
        let images = Tensor::randn(0f32, 1f32, (4, 3, 4, 4), &Device::Cpu).unwrap();
        let emb = enc.encode(&images, ForwardMode::Train).unwrap();
        assert_eq!(emb.dims(), &[4, 8]);
    }

    #[test]
    fn test_wrong_resolution_is_shape_error() {
        let varmap = VarMap::new();
        let enc = encoder(&varmap, true);
        let images = Tensor::zeros((2, 3, 5, 5), DType::F32, &Device::Cpu).unwrap();
        let err = enc.encode(&images, ForwardMode::Eval).unwrap_err();
        assert!(matches!(err, FairVisionError::Shape { .. }));

        let flat = Tensor::zeros((2, 48), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            enc.encode(&flat, ForwardMode::Eval),
            Err(FairVisionError::Shape { .. })
        ));
    }

    #[test]
    fn test_eval_before_any_statistics_fails() {
        let varmap = VarMap::new();
        let enc = encoder(&varmap, false);
        let images = Tensor::randn(0f32, 1f32, (2, 3, 4, 4), &Device::Cpu).unwrap();
        assert!(matches!(
            enc.encode(&images, ForwardMode::Eval),
            Err(FairVisionError::UninitializedStats)
        ));

        enc.encode(&images, ForwardMode::Train).unwrap();
        assert!(enc.stats_ready());
        assert!(enc.encode(&images, ForwardMode::Eval).is_ok());
    }

    #[test]
    fn test_eval_mode_leaves_running_stats_untouched() {
        let varmap = VarMap::new();
        let enc = encoder(&varmap, false);
        let images = Tensor::randn(2f32, 3f32, (6, 3, 4, 4), &Device::Cpu).unwrap();
        enc.encode(&images, ForwardMode::Train).unwrap();

        let running_mean = |vm: &VarMap| -> Vec<f32> {
            let data = vm.data().lock().unwrap();
            data["encoder.bn.running_mean"].as_tensor().to_vec1().unwrap()
        };
        let before = running_mean(&varmap);

        let first = enc.encode(&images, ForwardMode::Eval).unwrap();
        let second = enc.encode(&images, ForwardMode::Eval).unwrap();
        assert_eq!(before, running_mean(&varmap));
        assert_eq!(
            first.to_vec2::<f32>().unwrap(),
            second.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_train_mode_moves_running_stats() {
        let varmap = VarMap::new();
        let enc = encoder(&varmap, false);
        let images = Tensor::randn(2f32, 3f32, (6, 3, 4, 4), &Device::Cpu).unwrap();
        let before: Vec<f32> = {
            let data = varmap.data().lock().unwrap();
            data["encoder.bn.running_var"].as_tensor().to_vec1().unwrap()
        };
        enc.encode(&images, ForwardMode::Train).unwrap();
        let after: Vec<f32> = {
            let data = varmap.data().lock().unwrap();
            data["encoder.bn.running_var"].as_tensor().to_vec1().unwrap()
        };
        assert_ne!(before, after);
    }
}
