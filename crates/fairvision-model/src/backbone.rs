//! Feature extractors that sit in front of the encoder projection.
//!
//! The encoder never constructs its backbone directly. It receives one from a
//! [`BackboneProvider`], so pretrained registries, checkpoints, and test stubs
//! all plug in the same way. [`BackboneKind`] is itself a provider and covers
//! the two built-in families.

use candle_core::{Module, Tensor, D};
use candle_nn::{Func, Linear, VarBuilder};
use candle_transformers::models::resnet;
use fairvision_core::BackboneKind;

/// A feature extractor mapping `[B, C, H, W]` images to `[B, feature_dim]`.
pub trait Backbone: Send + Sync {
    /// Expected `(channels, height, width)` of each image.
    fn input_shape(&self) -> (usize, usize, usize);

    /// Width of the flat feature vector produced per image.
    fn feature_dim(&self) -> usize;

    /// Extract features. The caller has already validated the input shape.
    fn extract(&self, images: &Tensor) -> candle_core::Result<Tensor>;
}

/// Builds a backbone whose weights live under the given variable prefix.
pub trait BackboneProvider {
    /// Create the backbone, reading (or registering) its weights through `vb`.
    fn provide(&self, vb: VarBuilder<'static>) -> candle_core::Result<Box<dyn Backbone>>;
}

impl BackboneProvider for BackboneKind {
    fn provide(&self, vb: VarBuilder<'static>) -> candle_core::Result<Box<dyn Backbone>> {
        match *self {
            BackboneKind::ResNet { depth } => Ok(Box::new(ResNetBackbone::new(depth, vb)?)),
            BackboneKind::Pooled {
                channels,
                height,
                width,
                feature_dim,
            } => Ok(Box::new(PooledBackbone::new(
                (channels, height, width),
                feature_dim,
                vb,
            )?)),
        }
    }
}

// ---------------------------------------------------------------------------
// ResNet
// ---------------------------------------------------------------------------

/// ResNet with the final fully-connected layer removed.
///
/// The global average pool output is returned as the feature vector
/// (512 wide for depth 18/34, 2048 for 50/101/152).
pub struct ResNetBackbone {
    net: Func<'static>,
    depth: usize,
}

impl ResNetBackbone {
    /// Build a ResNet of the given depth.
    pub fn new(depth: usize, vb: VarBuilder<'static>) -> candle_core::Result<Self> {
        let net = match depth {
            18 => resnet::resnet18_no_final_layer(vb)?,
            34 => resnet::resnet34_no_final_layer(vb)?,
            50 => resnet::resnet50_no_final_layer(vb)?,
            101 => resnet::resnet101_no_final_layer(vb)?,
            152 => resnet::resnet152_no_final_layer(vb)?,
            other => candle_core::bail!("unsupported ResNet depth {other}"),
        };
        Ok(Self { net, depth })
    }

    /// Network depth.
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl Backbone for ResNetBackbone {
    fn input_shape(&self) -> (usize, usize, usize) {
        BackboneKind::ResNet { depth: self.depth }.input_shape()
    }

    fn feature_dim(&self) -> usize {
        BackboneKind::ResNet { depth: self.depth }.feature_dim()
    }

    fn extract(&self, images: &Tensor) -> candle_core::Result<Tensor> {
        self.net.forward(images)?.flatten_from(1)
    }
}

// ---------------------------------------------------------------------------
// Pooled
// ---------------------------------------------------------------------------

/// Spatial mean pooling followed by `Linear(channels → feature_dim)` and ReLU.
pub struct PooledBackbone {
    proj: Linear,
    input_shape: (usize, usize, usize),
    feature_dim: usize,
}

impl PooledBackbone {
    pub fn new(
        input_shape: (usize, usize, usize),
        feature_dim: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let proj = candle_nn::linear(input_shape.0, feature_dim, vb.pp("proj"))?;
        Ok(Self {
            proj,
            input_shape,
            feature_dim,
        })
    }
}

impl Backbone for PooledBackbone {
    fn input_shape(&self) -> (usize, usize, usize) {
        self.input_shape
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn extract(&self, images: &Tensor) -> candle_core::Result<Tensor> {
        // [B, C, H, W] -> [B, C]
        let pooled = images.mean(D::Minus1)?.mean(D::Minus1)?;
        self.proj.forward(&pooled)?.relu()
    }
}
