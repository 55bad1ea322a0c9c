//! Accuracy and group-fairness metrics for multi-label predictions.
//!
//! Every (sample, label) entry is one binary decision: the label is
//! predicted positive iff its score reaches the [`DecisionRule`] threshold.
//!
//! - **Accuracy**: fraction of entries whose decision matches the target
//!   (per-label average correctness).
//! - **Equality gap 0 / 1**: spread across protected groups of the
//!   predicted-positive rate over entries whose target is negative / positive.
//! - **Parity gap**: spread across groups of the unconditional
//!   predicted-positive rate.
//!
//! The spread is `max - min` over groups, i.e. the absolute difference for
//! two groups. A gap is undefined for a batch in which any group has no
//! qualifying entry.

pub mod engine;

pub use engine::{FairnessSummary, MetricEngine, MetricValue};

use candle_core::{DType, Tensor};
use fairvision_core::{FairVisionError, Result, ScoreNormalization};

/// Target values at or above this are positive labels.
const TARGET_POSITIVE: f32 = 0.5;

/// Threshold turning a score into a positive/negative decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionRule {
    pub threshold: f64,
}

impl DecisionRule {
    /// Rule for a head's scores, honoring an explicit override.
    pub fn for_head(
        normalization: ScoreNormalization,
        num_classes: usize,
        threshold: Option<f64>,
    ) -> Self {
        Self {
            threshold: threshold.unwrap_or_else(|| normalization.default_threshold(num_classes)),
        }
    }

    #[inline]
    pub fn is_positive(&self, score: f32) -> bool {
        f64::from(score) >= self.threshold
    }
}

/// Per-group decision counts within one batch.
#[derive(Debug, Clone, Default, PartialEq)]
struct GroupCounts {
    samples: usize,
    entries: usize,
    predicted_positive: usize,
    negatives: usize,
    predicted_positive_on_negative: usize,
    positives: usize,
    predicted_positive_on_positive: usize,
}

/// Metrics of a single batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchMetrics {
    pub batch_size: usize,
    /// Per-label average correctness in `[0, 1]`.
    pub accuracy: f64,
    /// `None` when some group has no negative-target entry in this batch.
    pub equality_gap_0: Option<f64>,
    /// `None` when some group has no positive-target entry in this batch.
    pub equality_gap_1: Option<f64>,
    /// `None` when some group has no sample in this batch.
    pub parity_gap: Option<f64>,
    /// Samples per protected group.
    pub group_sizes: Vec<usize>,
}

impl BatchMetrics {
    /// Compute batch metrics from row-major scores and targets.
    ///
    /// # Errors
    ///
    /// [`FairVisionError::Shape`] if rows, targets, and groups disagree in
    /// length or width; [`FairVisionError::Config`] for a group id outside
    /// `0..num_groups`.
    pub fn compute(
        scores: &[Vec<f32>],
        targets: &[Vec<f32>],
        groups: &[u32],
        rule: DecisionRule,
        num_groups: usize,
    ) -> Result<Self> {
        if scores.len() != targets.len() || scores.len() != groups.len() {
            return Err(FairVisionError::shape(
                [scores.len(), scores.len(), scores.len()],
                [scores.len(), targets.len(), groups.len()],
            ));
        }

        let mut per_group = vec![GroupCounts::default(); num_groups];
        let mut correct = 0usize;
        let mut entries = 0usize;

        for ((row, target), &group) in scores.iter().zip(targets).zip(groups) {
            if row.len() != target.len() {
                return Err(FairVisionError::shape(row.len(), target.len()));
            }
            let counts = per_group.get_mut(group as usize).ok_or_else(|| {
                FairVisionError::Config(format!(
                    "protected group {group} outside 0..{num_groups}"
                ))
            })?;
            counts.samples += 1;

            for (&score, &t) in row.iter().zip(target) {
                let predicted = rule.is_positive(score);
                let actual = t >= TARGET_POSITIVE;
                if predicted == actual {
                    correct += 1;
                }
                entries += 1;

                counts.entries += 1;
                counts.predicted_positive += usize::from(predicted);
                if actual {
                    counts.positives += 1;
                    counts.predicted_positive_on_positive += usize::from(predicted);
                } else {
                    counts.negatives += 1;
                    counts.predicted_positive_on_negative += usize::from(predicted);
                }
            }
        }

        let accuracy = if entries > 0 {
            correct as f64 / entries as f64
        } else {
            0.0
        };

        Ok(Self {
            batch_size: scores.len(),
            accuracy,
            equality_gap_0: rate_spread(
                per_group
                    .iter()
                    .map(|c| (c.predicted_positive_on_negative, c.negatives)),
            ),
            equality_gap_1: rate_spread(
                per_group
                    .iter()
                    .map(|c| (c.predicted_positive_on_positive, c.positives)),
            ),
            parity_gap: rate_spread(per_group.iter().map(|c| (c.predicted_positive, c.entries))),
            group_sizes: per_group.iter().map(|c| c.samples).collect(),
        })
    }

    /// Compute batch metrics straight from model outputs.
    ///
    /// `label_scores` and `targets` are `[B, K]`; `protected` is `[B]`,
    /// `[B, 1]` (group ids) or `[B, num_groups]` (one-hot).
    pub fn from_tensors(
        label_scores: &Tensor,
        targets: &Tensor,
        protected: &Tensor,
        rule: DecisionRule,
        num_groups: usize,
    ) -> Result<Self> {
        if label_scores.dims() != targets.dims() || label_scores.rank() != 2 {
            return Err(FairVisionError::shape(targets.dims(), label_scores.dims()));
        }
        let scores = to_rows(label_scores)?;
        let targets = to_rows(targets)?;
        let groups = group_ids(protected, num_groups)?;
        Self::compute(&scores, &targets, &groups, rule, num_groups)
    }
}

/// `max(rate) - min(rate)` over groups; `None` if any group has no entries.
fn rate_spread(counts: impl Iterator<Item = (usize, usize)>) -> Option<f64> {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for (hits, total) in counts {
        if total == 0 {
            return None;
        }
        let rate = hits as f64 / total as f64;
        lo = lo.min(rate);
        hi = hi.max(rate);
    }
    (hi >= lo).then_some(hi - lo)
}

fn to_rows(t: &Tensor) -> Result<Vec<Vec<f32>>> {
    t.to_dtype(DType::F32)
        .and_then(|t| t.to_vec2::<f32>())
        .map_err(|e| FairVisionError::Tensor(format!("Failed to read batch rows: {e}")))
}

/// Decode the protected-attribute tensor into one group id per sample.
///
/// # Errors
///
/// [`FairVisionError::Config`] for a non-finite or non-integral id, an id
/// outside `0..num_groups`, or a one-hot row without a unique positive
/// maximum.
pub fn group_ids(protected: &Tensor, num_groups: usize) -> Result<Vec<u32>> {
    let read_err = |e: candle_core::Error| {
        FairVisionError::Tensor(format!("Failed to read protected attribute: {e}"))
    };
    let values: Vec<f32> = match protected.dims() {
        [_] | [_, 1] => protected
            .to_dtype(DType::F32)
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(read_err)?,
        [_, width] if *width == num_groups => {
            let rows = protected
                .to_dtype(DType::F32)
                .and_then(|t| t.to_vec2::<f32>())
                .map_err(read_err)?;
            return rows.iter().map(|row| one_hot_group(row)).collect();
        }
        [_, width] => {
            return Err(FairVisionError::DimensionMismatch {
                component: "protected attribute".into(),
                expected: num_groups,
                actual: *width,
            })
        }
        dims => return Err(FairVisionError::shape(["B", "num_groups"], dims)),
    };

    values
        .into_iter()
        .map(|v| {
            if !v.is_finite() || (v - v.round()).abs() > GROUP_ID_TOLERANCE {
                return Err(FairVisionError::Config(format!(
                    "protected attribute value {v} is not a group id"
                )));
            }
            let id = v.round();
            if id < 0.0 || id as usize >= num_groups {
                Err(FairVisionError::Config(format!(
                    "protected attribute value {v} outside 0..{num_groups}"
                )))
            } else {
                Ok(id as u32)
            }
        })
        .collect()
}

/// Group ids must be integral up to this tolerance.
const GROUP_ID_TOLERANCE: f32 = 1e-6;

/// Index of the single maximal entry of a one-hot row.
fn one_hot_group(row: &[f32]) -> Result<u32> {
    if row.iter().any(|v| !v.is_finite()) {
        return Err(FairVisionError::Config(format!(
            "one-hot protected attribute {row:?} has non-finite entries"
        )));
    }
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut winners = row.iter().enumerate().filter(|&(_, &v)| v == max);
    match (winners.next(), winners.next()) {
        (Some((i, _)), None) if max > 0.0 => Ok(i as u32),
        _ => Err(FairVisionError::Config(format!(
            "one-hot protected attribute {row:?} has no unique maximum"
        ))),
    }
}
