//! Tensor datasets and batch iteration.
//!
//! A dataset file is a single safetensors archive with three tensors:
//! `images` `[N, C, H, W]`, `targets` `[N, K]` (multi-hot), and `protected`
//! (`[N]`, `[N, 1]` group ids, or `[N, G]` one-hot).

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use fairvision_core::{FairVisionError, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

pub const IMAGES: &str = "images";
pub const TARGETS: &str = "targets";
pub const PROTECTED: &str = "protected";

/// One `(images, targets, protected)` triple.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Tensor,
    pub targets: Tensor,
    pub protected: Tensor,
}

impl Batch {
    pub(crate) fn len(&self) -> usize {
        self.images.dims().first().copied().unwrap_or(0)
    }
}

/// A finite sequence of batches whose length is known up front.
pub trait BatchSource {
    /// Number of batches a full pass yields.
    fn batch_count(&self) -> usize;

    /// Next batch, or `None` once the pass is exhausted.
    fn next_batch(&mut self) -> Result<Option<Batch>>;
}

/// In-memory samples with aligned first axes.
#[derive(Debug, Clone)]
pub struct TensorDataset {
    images: Tensor,
    targets: Tensor,
    protected: Tensor,
}

impl TensorDataset {
    /// # Errors
    ///
    /// [`FairVisionError::Shape`] if images are not rank 4, targets not rank
    /// 2, or the three tensors disagree on the number of samples.
    pub fn new(images: Tensor, targets: Tensor, protected: Tensor) -> Result<Self> {
        let n = match images.dims() {
            [n, _, _, _] => *n,
            dims => return Err(FairVisionError::shape(["N", "C", "H", "W"], dims)),
        };
        match targets.dims() {
            [tn, _] if *tn == n => {}
            dims => return Err(FairVisionError::shape([n.to_string(), "K".into()], dims)),
        }
        match protected.dims() {
            [pn] | [pn, _] if *pn == n => {}
            dims => return Err(FairVisionError::shape([n.to_string(), "G".into()], dims)),
        }
        Ok(Self {
            images,
            targets,
            protected,
        })
    }

    /// Read a dataset archive onto `device`.
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let data = std::fs::read(path)?;
        let tensors = safetensors::SafeTensors::deserialize(&data).map_err(|e| {
            FairVisionError::Config(format!(
                "Failed to parse dataset {}: {e}",
                path.display()
            ))
        })?;

        let read = |name: &str| -> Result<Tensor> {
            let view = tensors.tensor(name).map_err(|e| {
                FairVisionError::Config(format!(
                    "Tensor '{name}' not found in {}: {e}",
                    path.display()
                ))
            })?;
            view_to_tensor(&view, device).map_err(|e| {
                FairVisionError::Tensor(format!("Failed to read '{name}' from {}: {e}", path.display()))
            })
        };

        let dataset = Self::new(read(IMAGES)?, read(TARGETS)?, read(PROTECTED)?)?;
        tracing::info!(
            path = %path.display(),
            samples = dataset.len(),
            "Loaded dataset"
        );
        Ok(dataset)
    }

    /// Write the dataset as a safetensors archive.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tensors: HashMap<String, Tensor> = [
            (IMAGES.to_string(), self.images.clone()),
            (TARGETS.to_string(), self.targets.clone()),
            (PROTECTED.to_string(), self.protected.clone()),
        ]
        .into_iter()
        .collect();
        candle_core::safetensors::save(&tensors, path)
            .map_err(|e| FairVisionError::Tensor(format!("Failed to save dataset: {e}")))
    }

    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn images(&self) -> &Tensor {
        &self.images
    }

    pub fn targets(&self) -> &Tensor {
        &self.targets
    }

    pub fn protected(&self) -> &Tensor {
        &self.protected
    }

    /// Keep the leading `ceil(len * fraction)` samples.
    ///
    /// # Errors
    ///
    /// [`FairVisionError::Config`] unless `fraction` is in `(0, 1]`.
    pub fn subset(&self, fraction: f64) -> Result<Self> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(FairVisionError::Config(format!(
                "subset fraction must be in (0, 1], got {fraction}"
            )));
        }
        let keep = ((self.len() as f64) * fraction).ceil() as usize;
        let keep = keep.min(self.len());
        let narrow = |t: &Tensor| {
            t.narrow(0, 0, keep)
                .map_err(|e| FairVisionError::Tensor(format!("Failed to take subset: {e}")))
        };
        Ok(Self {
            images: narrow(&self.images)?,
            targets: narrow(&self.targets)?,
            protected: narrow(&self.protected)?,
        })
    }

    /// Sequential batches of at most `batch_size` samples.
    pub fn batches(&self, batch_size: usize) -> TensorBatchSource {
        TensorBatchSource::new(self.clone(), batch_size)
    }
}

fn view_to_tensor(
    view: &safetensors::tensor::TensorView<'_>,
    device: &Device,
) -> candle_core::Result<Tensor> {
    use safetensors::Dtype;

    let shape: Vec<usize> = view.shape().to_vec();
    let raw = view.data();
    match view.dtype() {
        Dtype::F32 => {
            let values: Vec<f32> = raw
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            Tensor::from_vec(values, shape.as_slice(), device)
        }
        Dtype::I64 => {
            let values: Vec<f32> = raw
                .chunks_exact(8)
                .map(|b| {
                    i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32
                })
                .collect();
            Tensor::from_vec(values, shape.as_slice(), device)
        }
        Dtype::U8 => {
            let values: Vec<f32> = raw.iter().map(|&b| f32::from(b)).collect();
            Tensor::from_vec(values, shape.as_slice(), device)
        }
        other => candle_core::bail!("unsupported dataset dtype {other:?}"),
    }
}

/// Mini-batch iterator over a [`TensorDataset`].
///
/// Yields samples in file order until [`TensorBatchSource::reshuffle`] is
/// called.
pub struct TensorBatchSource {
    dataset: TensorDataset,
    indices: Vec<usize>,
    batch_size: usize,
    pos: usize,
}

impl TensorBatchSource {
    pub fn new(dataset: TensorDataset, batch_size: usize) -> Self {
        let n = dataset.len();
        Self {
            dataset,
            indices: (0..n).collect(),
            batch_size: batch_size.max(1),
            pos: 0,
        }
    }

    /// Reshuffle for a new epoch from `seed + epoch`.
    pub fn reshuffle(&mut self, seed: u64, epoch: usize) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(epoch as u64));
        self.indices.shuffle(&mut rng);
        self.pos = 0;
    }

    /// Restart the pass without changing the order.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }
}

impl BatchSource for TensorBatchSource {
    fn batch_count(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    fn next_batch(&mut self) -> Result<Option<Batch>> {
        let n = self.indices.len();
        if self.pos >= n {
            return Ok(None);
        }

        let end = (self.pos + self.batch_size).min(n);
        let batch_idx: Vec<u32> = self.indices[self.pos..end]
            .iter()
            .map(|&i| i as u32)
            .collect();
        self.pos = end;

        let gather = || -> candle_core::Result<Batch> {
            let idx = Tensor::new(batch_idx.as_slice(), self.dataset.images.device())?;
            Ok(Batch {
                images: self.dataset.images.index_select(&idx, 0)?,
                targets: self.dataset.targets.index_select(&idx, 0)?,
                protected: self.dataset.protected.index_select(&idx, 0)?,
            })
        };
        gather()
            .map(Some)
            .map_err(|e| FairVisionError::Tensor(format!("Failed to gather batch: {e}")))
    }
}
