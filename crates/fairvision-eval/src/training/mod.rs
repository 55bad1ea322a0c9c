//! Training pipeline for the composite model.
//!
//! Trains the encoder and label head end to end with AdamW and early
//! stopping on validation label loss. For the debiased variant the
//! adversarial head is fit on a detached copy of the embedding, which
//! measures how much protected-attribute information the embedding carries.

pub mod loss;
pub mod trainer;

pub use trainer::{train, EpochMetrics, TrainConfig};
