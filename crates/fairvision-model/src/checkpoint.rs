//! Checkpoint directories: `checkpoint.json` + `model.safetensors`.
//!
//! The JSON record carries the hyperparameters needed to rebuild the model;
//! the safetensors file carries every variable under its model path
//! (`encoder.linear.weight`, `label_head.fc1.bias`, ...).

use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use fairvision_core::{FairVisionError, ModelHyperParams, ModelVariant, Result};
use serde::{Deserialize, Serialize};

use crate::backbone::BackboneProvider;
use crate::composite::CompositeModel;

/// Name of the hyperparameter record inside a checkpoint directory.
pub const META_FILE: &str = "checkpoint.json";

/// Name of the weights file inside a checkpoint directory.
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Metadata stored next to the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub hyp: ModelHyperParams,
    /// Whether the stored batch-norm running statistics came from training.
    #[serde(default)]
    pub running_stats_ready: bool,
    #[serde(default)]
    pub epochs_trained: u64,
}

/// An opened, immutable checkpoint.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    dir: PathBuf,
    meta: CheckpointMeta,
}

impl Checkpoint {
    /// Read and validate the metadata of the checkpoint at `dir`.
    ///
    /// # Errors
    ///
    /// [`FairVisionError::Io`] / [`FairVisionError::Serialization`] when the
    /// record cannot be read; [`FairVisionError::CheckpointMismatch`] when the
    /// hyperparameters are unusable or the weights file is missing.
    pub fn open(dir: &Path) -> Result<Self> {
        let meta_str = std::fs::read_to_string(dir.join(META_FILE))?;
        let meta: CheckpointMeta = serde_json::from_str(&meta_str)?;
        meta.hyp.validate().map_err(|e| {
            FairVisionError::CheckpointMismatch(format!("stored hyperparameters: {e}"))
        })?;

        let weights = dir.join(WEIGHTS_FILE);
        if !weights.is_file() {
            return Err(FairVisionError::CheckpointMismatch(format!(
                "missing weights file {}",
                weights.display()
            )));
        }

        tracing::debug!(
            dir = %dir.display(),
            hidden_size = meta.hyp.hidden_size,
            num_classes = meta.hyp.num_classes,
            variant = %meta.hyp.variant,
            "Opened checkpoint"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            meta,
        })
    }

    /// Write `varmap` and `meta` into `dir`, creating it if needed.
    pub fn save(dir: &Path, meta: CheckpointMeta, varmap: &VarMap) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        varmap
            .save(dir.join(WEIGHTS_FILE))
            .map_err(|e| FairVisionError::Tensor(format!("Failed to save weights: {e}")))?;
        std::fs::write(dir.join(META_FILE), serde_json::to_string_pretty(&meta)?)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            meta,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn meta(&self) -> &CheckpointMeta {
        &self.meta
    }

    pub fn hyp(&self) -> &ModelHyperParams {
        &self.meta.hyp
    }

    pub fn weights_path(&self) -> PathBuf {
        self.dir.join(WEIGHTS_FILE)
    }

    /// Rebuild `variant` from the stored weights using the recorded backbone.
    pub fn load_model(&self, variant: ModelVariant, device: &Device) -> Result<CompositeModel> {
        self.load_model_with(variant, &self.meta.hyp.backbone, device)
    }

    /// Rebuild `variant` with an explicitly supplied backbone provider.
    ///
    /// # Errors
    ///
    /// [`FairVisionError::CheckpointMismatch`] if any variable is missing or
    /// has a shape other than the hyperparameters imply.
    pub fn load_model_with(
        &self,
        variant: ModelVariant,
        provider: &dyn BackboneProvider,
        device: &Device,
    ) -> Result<CompositeModel> {
        // SAFETY: memory-mapping safetensors is the standard candle pattern.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[self.weights_path()], DType::F32, device)
                .map_err(|e| {
                    FairVisionError::CheckpointMismatch(format!("Failed to map weights: {e}"))
                })?
        };

        let model = CompositeModel::build(
            &self.meta.hyp,
            variant,
            provider,
            vb,
            self.meta.running_stats_ready,
        )
        .map_err(|e| match e {
            FairVisionError::Tensor(msg) => FairVisionError::CheckpointMismatch(msg),
            other => other,
        })?;

        tracing::info!(
            path = %self.weights_path().display(),
            %variant,
            "Loaded model weights"
        );
        Ok(model)
    }
}
