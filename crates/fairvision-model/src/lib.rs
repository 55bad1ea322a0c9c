//! Composite image classifier with an adversarial protected-attribute head.
//!
//! A single [`Encoder`] maps images to a batch-normalized embedding. A
//! [`TaskHead`] scores the target labels from that embedding; the debiased
//! variant adds a second head that predicts the protected attribute from the
//! very same embedding tensor.
//!
//! # Architecture
//!
//! ```text
//! images → Backbone → Linear(feature_dim → H) → BatchNorm(H) → embedding
//! embedding → Linear(H→512) → ReLU → Linear(512→512) → ReLU
//!           → Linear(512→512) → ReLU → Linear(512→K) → normalize(class axis)
//! ```
//!
//! Every forward call takes an explicit [`ForwardMode`]; there is no
//! train/eval flag stored on the model.

pub mod backbone;
pub mod checkpoint;
pub mod composite;
pub mod device;
pub mod encoder;
pub mod head;

pub use backbone::{Backbone, BackboneProvider, PooledBackbone, ResNetBackbone};
pub use checkpoint::{Checkpoint, CheckpointMeta};
pub use composite::{BaselineModel, CompositeModel, DebiasedModel, DebiasedOutput};
pub use device::select_device;
pub use encoder::Encoder;
pub use head::TaskHead;

use fairvision_core::FairVisionError;

/// Whether a forward pass may update running statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// Batch statistics are used and folded into the running estimate.
    Train,
    /// Frozen running statistics are used; nothing is mutated.
    Eval,
}

impl ForwardMode {
    /// `true` for [`ForwardMode::Train`].
    #[must_use]
    pub fn is_train(self) -> bool {
        matches!(self, Self::Train)
    }
}

/// Map a candle failure into [`FairVisionError::Tensor`] with context.
pub fn tensor_error(context: &'static str) -> impl Fn(candle_core::Error) -> FairVisionError {
    move |e| FairVisionError::Tensor(format!("{context}: {e}"))
}
