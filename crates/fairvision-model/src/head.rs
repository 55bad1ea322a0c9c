//! Task heads scoring an embedding batch.
//!
//! The label head and the adversarial head share this structure and differ
//! only in class count. Score normalization runs along the axis that holds
//! this head's own classes, resolved once at construction.

use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder};
use fairvision_core::{FairVisionError, Result, ScoreNormalization};

use crate::tensor_error;

/// `hidden → width → width → width → num_classes` MLP with score normalization.
pub struct TaskHead {
    name: String,
    fc1: Linear,
    fc2: Linear,
    fc3: Linear,
    out: Linear,
    hidden_size: usize,
    num_classes: usize,
    normalization: ScoreNormalization,
    class_axis: usize,
}

impl TaskHead {
    /// Build a head named `name` under `vb` (`fc1`, `fc2`, `fc3`, `out`).
    ///
    /// # Errors
    ///
    /// [`FairVisionError::Config`] if the class axis cannot be resolved
    /// unambiguously; [`FairVisionError::Tensor`] if weights cannot be created
    /// or read.
    pub fn new(
        name: &str,
        hidden_size: usize,
        width: usize,
        num_classes: usize,
        normalization: ScoreNormalization,
        vb: VarBuilder,
    ) -> Result<Self> {
        let fc1 = candle_nn::linear(hidden_size, width, vb.pp("fc1"))
            .map_err(tensor_error("head fc1"))?;
        let fc2 = candle_nn::linear(width, width, vb.pp("fc2")).map_err(tensor_error("head fc2"))?;
        let fc3 = candle_nn::linear(width, width, vb.pp("fc3")).map_err(tensor_error("head fc3"))?;
        let out = candle_nn::linear(width, num_classes, vb.pp("out"))
            .map_err(tensor_error("head output projection"))?;

        // Linear weights are [out..., in]; output axes follow the batch axis.
        let out_dims = out.weight().dims();
        let out_axes = &out_dims[..out_dims.len().saturating_sub(1)];
        let class_axis = resolve_class_axis(out_axes, num_classes)?;

        Ok(Self {
            name: name.to_string(),
            fc1,
            fc2,
            fc3,
            out,
            hidden_size,
            num_classes,
            normalization,
            class_axis,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn normalization(&self) -> ScoreNormalization {
        self.normalization
    }

    /// Axis of the score tensor that holds this head's classes.
    pub fn class_axis(&self) -> usize {
        self.class_axis
    }

    /// Pre-normalization outputs, `[B, num_classes]`.
    ///
    /// # Errors
    ///
    /// [`FairVisionError::DimensionMismatch`] if the embedding width differs
    /// from the configured hidden size.
    pub fn logits(&self, embedding: &Tensor) -> Result<Tensor> {
        let width = match embedding.dims() {
            [_, width] => *width,
            dims => return Err(FairVisionError::shape(["B", "hidden"], dims)),
        };
        if width != self.hidden_size {
            return Err(FairVisionError::DimensionMismatch {
                component: self.name.clone(),
                expected: self.hidden_size,
                actual: width,
            });
        }

        self.mlp(embedding).map_err(tensor_error("head forward"))
    }

    /// Normalized scores, `[B, num_classes]`.
    pub fn score(&self, embedding: &Tensor) -> Result<Tensor> {
        let logits = self.logits(embedding)?;
        let extent = logits.dim(self.class_axis).map_err(tensor_error("head output"))?;
        if extent != self.num_classes {
            return Err(FairVisionError::DimensionMismatch {
                component: format!("{} scores", self.name),
                expected: self.num_classes,
                actual: extent,
            });
        }

        self.normalize(&logits)
    }

    /// Apply this head's score normalization to already computed logits.
    pub fn normalize(&self, logits: &Tensor) -> Result<Tensor> {
        match self.normalization {
            ScoreNormalization::Softmax => candle_nn::ops::softmax(logits, self.class_axis),
            ScoreNormalization::Sigmoid => candle_nn::ops::sigmoid(logits),
        }
        .map_err(tensor_error("score normalization"))
    }

    fn mlp(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = self.fc1.forward(xs)?.relu()?;
        let xs = self.fc2.forward(&xs)?.relu()?;
        let xs = self.fc3.forward(&xs)?.relu()?;
        self.out.forward(&xs)
    }
}

/// Pick the axis whose extent equals `num_classes`.
///
/// `extents` lists every non-batch axis of the head output, so the returned
/// index is offset by one for the leading batch axis.
fn resolve_class_axis(extents: &[usize], num_classes: usize) -> Result<usize> {
    let candidates: Vec<usize> = extents
        .iter()
        .enumerate()
        .filter(|&(_, &extent)| extent == num_classes)
        .map(|(i, _)| i + 1)
        .collect();

    match candidates.as_slice() {
        [axis] => Ok(*axis),
        [] => Err(FairVisionError::Config(format!(
            "no output axis of extent {num_classes} in {extents:?}"
        ))),
        _ => Err(FairVisionError::Config(format!(
            "class axis is ambiguous: axes {candidates:?} of {extents:?} all have extent {num_classes}"
        ))),
    }
}
