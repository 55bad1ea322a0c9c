//! Fairness-aware evaluation and training for FairVision models.
//!
//! - [`metrics`]: per-batch accuracy and group-fairness gaps, plus the
//!   size-weighted [`MetricEngine`] folding them over a pass.
//! - [`evaluator`]: the checkpoint → batches → report loop.
//! - [`training`]: AdamW training with early stopping.
//! - [`data`] / [`report`]: batch sources and report sinks.

pub mod config;
pub mod data;
pub mod evaluator;
pub mod logging;
pub mod meter;
pub mod metrics;
pub mod report;
pub mod training;

pub use data::{Batch, BatchSource, TensorBatchSource, TensorDataset};
pub use evaluator::{evaluate, EvalPhase, EvalReport, Evaluator};
pub use meter::AverageMeter;
pub use metrics::{BatchMetrics, DecisionRule, FairnessSummary, MetricEngine, MetricValue};
pub use report::{FileSink, ReportSink};
