//! Core types, configuration, and errors for FairVision
//!
//! This crate contains the foundational types shared across all FairVision
//! components: the hyperparameter record stored alongside model weights, the
//! evaluation and logging configuration, and the error taxonomy used by the
//! model and evaluation crates. It deliberately has no tensor dependency.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Model hyperparameters
// ---------------------------------------------------------------------------

/// Which composite model to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelVariant {
    /// Encoder + label head.
    #[default]
    Baseline,
    /// Encoder + label head + adversarial head on the shared embedding.
    Debiased,
}

impl std::fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Baseline => write!(f, "baseline"),
            Self::Debiased => write!(f, "debiased"),
        }
    }
}

/// How a task head turns its final projection into scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreNormalization {
    /// Softmax over the class axis of each sample.
    #[default]
    Softmax,
    /// Independent logistic score per class.
    Sigmoid,
}

impl ScoreNormalization {
    /// Default decision threshold for a head with `num_classes` outputs.
    ///
    /// Softmax scores are compared against the uniform score `1/num_classes`;
    /// sigmoid scores against `0.5`.
    #[must_use]
    pub fn default_threshold(self, num_classes: usize) -> f64 {
        match self {
            Self::Softmax => 1.0 / num_classes.max(1) as f64,
            Self::Sigmoid => 0.5,
        }
    }
}

/// Feature extractor feeding the encoder's projection layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackboneKind {
    /// ResNet without its final fully-connected layer.
    ResNet {
        /// Network depth: 18, 34, 50, 101, or 152.
        depth: usize,
    },
    /// Spatial mean pooling followed by a learned linear map.
    ///
    /// Cheap enough to run on CPU in tests and smoke runs.
    Pooled {
        /// Expected image channels.
        channels: usize,
        /// Expected image height.
        height: usize,
        /// Expected image width.
        width: usize,
        /// Width of the produced feature vector.
        feature_dim: usize,
    },
}

/// ResNet depths available from the backbone provider.
pub const RESNET_DEPTHS: [usize; 5] = [18, 34, 50, 101, 152];

impl BackboneKind {
    /// Width of the flat feature vector produced per image.
    #[must_use]
    pub fn feature_dim(&self) -> usize {
        match *self {
            Self::ResNet { depth } if depth < 50 => 512,
            Self::ResNet { .. } => 2048,
            Self::Pooled { feature_dim, .. } => feature_dim,
        }
    }

    /// Expected `(channels, height, width)` of each input image.
    #[must_use]
    pub fn input_shape(&self) -> (usize, usize, usize) {
        match *self {
            Self::ResNet { .. } => (3, 224, 224),
            Self::Pooled {
                channels,
                height,
                width,
                ..
            } => (channels, height, width),
        }
    }
}

impl Default for BackboneKind {
    fn default() -> Self {
        Self::ResNet { depth: 152 }
    }
}

/// Hyperparameters needed to reconstruct a composite model.
///
/// Stored in every checkpoint next to the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHyperParams {
    /// Embedding width produced by the encoder.
    pub hidden_size: usize,
    /// Number of target classes (label head outputs).
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    /// Number of protected-attribute categories (adversarial head outputs).
    #[serde(default = "default_num_protected_classes")]
    pub num_protected_classes: usize,
    /// Width of the three hidden layers in each task head.
    #[serde(default = "default_head_width")]
    pub head_width: usize,
    /// Score normalization applied by both heads.
    #[serde(default)]
    pub normalization: ScoreNormalization,
    /// Feature extractor in front of the encoder projection.
    #[serde(default)]
    pub backbone: BackboneKind,
    /// Composite model variant the weights were trained for.
    #[serde(default)]
    pub variant: ModelVariant,
}

fn default_num_classes() -> usize {
    39
}

fn default_num_protected_classes() -> usize {
    2
}

fn default_head_width() -> usize {
    512
}

impl Default for ModelHyperParams {
    fn default() -> Self {
        Self {
            hidden_size: 512,
            num_classes: default_num_classes(),
            num_protected_classes: default_num_protected_classes(),
            head_width: default_head_width(),
            normalization: ScoreNormalization::default(),
            backbone: BackboneKind::default(),
            variant: ModelVariant::default(),
        }
    }
}

impl ModelHyperParams {
    /// Check that the record can describe a buildable model.
    ///
    /// # Errors
    ///
    /// Returns [`FairVisionError::Config`] for zero-sized layers or an
    /// unsupported backbone.
    pub fn validate(&self) -> Result<()> {
        if self.hidden_size == 0 {
            return Err(FairVisionError::Config("hidden_size must be > 0".into()));
        }
        if self.num_classes == 0 {
            return Err(FairVisionError::Config("num_classes must be > 0".into()));
        }
        if self.num_protected_classes < 2 {
            return Err(FairVisionError::Config(format!(
                "num_protected_classes must be >= 2, got {}",
                self.num_protected_classes
            )));
        }
        if self.head_width == 0 {
            return Err(FairVisionError::Config("head_width must be > 0".into()));
        }
        match self.backbone {
            BackboneKind::ResNet { depth } if !RESNET_DEPTHS.contains(&depth) => {
                Err(FairVisionError::Config(format!(
                    "unsupported ResNet depth {depth}; expected one of {RESNET_DEPTHS:?}"
                )))
            }
            BackboneKind::Pooled {
                channels,
                height,
                width,
                feature_dim,
            } if channels == 0 || height == 0 || width == 0 || feature_dim == 0 => Err(
                FairVisionError::Config("pooled backbone dimensions must be > 0".into()),
            ),
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation configuration
// ---------------------------------------------------------------------------

/// Configuration for one evaluation pass.
///
/// Loaded from YAML and/or command-line flags, then validated before any
/// checkpoint is opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Checkpoint directory (`checkpoint.json` + `model.safetensors`).
    pub weights: PathBuf,
    /// Evaluation split stored as a safetensors tensor dataset.
    #[serde(default = "default_data_path")]
    pub data: PathBuf,
    /// Samples per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Fraction of the split to evaluate, in `(0, 1]`.
    #[serde(default = "default_subset_fraction")]
    pub subset_fraction: f64,
    /// Append-only file receiving the final metrics line.
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    /// Accelerator ordinal; falls back to CPU when unavailable.
    #[serde(default)]
    pub gpu_id: usize,
    /// Score threshold for a positive prediction. `None` uses the
    /// normalization's default (see [`ScoreNormalization::default_threshold`]).
    #[serde(default)]
    pub decision_threshold: Option<f64>,
    /// Number of protected groups expected in the pass.
    #[serde(default = "default_num_groups")]
    pub num_groups: usize,
    /// Render a progress bar while iterating.
    #[serde(default = "default_show_progress")]
    pub show_progress: bool,
    /// Logging setup for the binary.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_data_path() -> PathBuf {
    PathBuf::from("data/valid.safetensors")
}

fn default_batch_size() -> usize {
    16
}

fn default_subset_fraction() -> f64 {
    1.0
}

fn default_log_path() -> PathBuf {
    PathBuf::from("test.log")
}

fn default_num_groups() -> usize {
    2
}

fn default_show_progress() -> bool {
    true
}

impl EvalConfig {
    /// Build a configuration with defaults for everything but the checkpoint.
    pub fn new(weights: impl Into<PathBuf>) -> Self {
        Self {
            weights: weights.into(),
            data: default_data_path(),
            batch_size: default_batch_size(),
            subset_fraction: default_subset_fraction(),
            log_path: default_log_path(),
            gpu_id: 0,
            decision_threshold: None,
            num_groups: default_num_groups(),
            show_progress: default_show_progress(),
            logging: LoggingConfig::default(),
        }
    }

    /// Reject invalid combinations before the evaluation starts.
    ///
    /// # Errors
    ///
    /// Returns [`FairVisionError::Config`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(FairVisionError::Config("batch_size must be > 0".into()));
        }
        if !(self.subset_fraction > 0.0 && self.subset_fraction <= 1.0) {
            return Err(FairVisionError::Config(format!(
                "subset fraction must be in (0, 1], got {}",
                self.subset_fraction
            )));
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
        if self.weights.as_os_str().is_empty() {
            return Err(FairVisionError::Config("weights path is required".into()));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: `text` (human-readable) or `json` (structured).
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Core error types.
#[derive(thiserror::Error, Debug)]
pub enum FairVisionError {
    /// Malformed or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Checkpoint hyperparameters do not match the stored weights.
    #[error("Checkpoint mismatch: {0}")]
    CheckpointMismatch(String),

    /// A tensor's shape violates a component contract.
    #[error("Shape error: expected {expected}, got {actual}")]
    Shape {
        /// Shape the component accepts.
        expected: String,
        /// Shape that was supplied.
        actual: String,
    },

    /// A feature axis has the wrong width for the component consuming it.
    #[error("Dimension mismatch in {component}: expected width {expected}, got {actual}")]
    DimensionMismatch {
        /// Component that rejected the input.
        component: String,
        /// Configured width.
        expected: usize,
        /// Supplied width.
        actual: usize,
    },

    /// Eval-mode normalization requested before running statistics exist.
    #[error("Running normalization statistics are uninitialized")]
    UninitializedStats,

    /// A protected group never appeared during the whole pass.
    #[error("Insufficient protected groups: group(s) {missing:?} never appeared")]
    InsufficientGroups {
        /// Group ids with zero samples.
        missing: Vec<u32>,
    },

    /// Tensor backend failure.
    #[error("Tensor error: {0}")]
    Tensor(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization / deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FairVisionError {
    /// Shape error from two printable shapes.
    pub fn shape(expected: impl std::fmt::Debug, actual: impl std::fmt::Debug) -> Self {
        Self::Shape {
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }
}

/// Convenience alias for `std::result::Result<T, FairVisionError>`.
pub type Result<T> = std::result::Result<T, FairVisionError>;
