//! Running aggregation of batch metrics over one evaluation pass.

use std::fmt;

use candle_core::Tensor;
use fairvision_core::{FairVisionError, Result};

use super::{BatchMetrics, DecisionRule};
use crate::meter::AverageMeter;

/// A reported metric: a number, or `undefined` when no batch contributed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Defined(f64),
    Undefined,
}

impl MetricValue {
    pub fn value(self) -> Option<f64> {
        match self {
            Self::Defined(v) => Some(v),
            Self::Undefined => None,
        }
    }

    pub fn is_defined(self) -> bool {
        matches!(self, Self::Defined(_))
    }
}

impl From<Option<f64>> for MetricValue {
    fn from(v: Option<f64>) -> Self {
        v.map_or(Self::Undefined, Self::Defined)
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Defined(v) => write!(f, "{v:.4}"),
            Self::Undefined => write!(f, "undefined"),
        }
    }
}

/// Final (or in-progress) averages of a pass.
#[derive(Debug, Clone, PartialEq)]
pub struct FairnessSummary {
    pub accuracy: MetricValue,
    pub equality_gap_0: MetricValue,
    pub equality_gap_1: MetricValue,
    pub parity_gap: MetricValue,
    /// Samples folded into the accuracy meter.
    pub samples: usize,
    pub batches: usize,
    /// Protected groups that never appeared in the pass.
    pub missing_groups: Vec<u32>,
}

impl FairnessSummary {
    /// The one-line report appended to the sink.
    pub fn report_line(&self) -> String {
        format!(
            "Accuracy: {}, Equality Gap 0: {}, Equality Gap 1: {}, Parity Gap: {}",
            self.accuracy, self.equality_gap_0, self.equality_gap_1, self.parity_gap
        )
    }

    /// Fail if some protected group was never observed.
    ///
    /// # Errors
    ///
    /// [`FairVisionError::InsufficientGroups`] naming the absent groups.
    pub fn require_all_groups(&self) -> Result<()> {
        if self.missing_groups.is_empty() {
            Ok(())
        } else {
            Err(FairVisionError::InsufficientGroups {
                missing: self.missing_groups.clone(),
            })
        }
    }
}

impl fmt::Display for FairnessSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.report_line())
    }
}

/// Size-weighted running averages of accuracy and the fairness gaps.
#[derive(Debug, Clone)]
pub struct MetricEngine {
    rule: DecisionRule,
    num_groups: usize,
    accuracy: AverageMeter,
    equality_gap_0: AverageMeter,
    equality_gap_1: AverageMeter,
    parity_gap: AverageMeter,
    group_sizes: Vec<usize>,
    batches: usize,
}

impl MetricEngine {
    pub fn new(rule: DecisionRule, num_groups: usize) -> Self {
        Self {
            rule,
            num_groups,
            accuracy: AverageMeter::new(),
            equality_gap_0: AverageMeter::new(),
            equality_gap_1: AverageMeter::new(),
            parity_gap: AverageMeter::new(),
            group_sizes: vec![0; num_groups],
            batches: 0,
        }
    }

    pub fn rule(&self) -> DecisionRule {
        self.rule
    }

    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    /// Start a new pass.
    pub fn reset(&mut self) {
        self.accuracy.reset();
        self.equality_gap_0.reset();
        self.equality_gap_1.reset();
        self.parity_gap.reset();
        self.group_sizes = vec![0; self.num_groups];
        self.batches = 0;
    }

    /// Fold one batch into the running averages.
    ///
    /// A gap that is undefined for this batch leaves its meter untouched.
    pub fn observe(&mut self, batch: &BatchMetrics) {
        let n = batch.batch_size;
        self.accuracy.update(batch.accuracy, n);
        if let Some(gap) = batch.equality_gap_0 {
            self.equality_gap_0.update(gap, n);
        }
        if let Some(gap) = batch.equality_gap_1 {
            self.equality_gap_1.update(gap, n);
        }
        if let Some(gap) = batch.parity_gap {
            self.parity_gap.update(gap, n);
        }
        for (total, size) in self.group_sizes.iter_mut().zip(&batch.group_sizes) {
            *total += size;
        }
        self.batches += 1;
    }

    /// Compute and fold the metrics of one scored batch.
    pub fn observe_tensors(
        &mut self,
        label_scores: &Tensor,
        targets: &Tensor,
        protected: &Tensor,
    ) -> Result<BatchMetrics> {
        let batch =
            BatchMetrics::from_tensors(label_scores, targets, protected, self.rule, self.num_groups)?;
        self.observe(&batch);
        Ok(batch)
    }

    /// Samples seen per protected group so far.
    pub fn group_sizes(&self) -> &[usize] {
        &self.group_sizes
    }

    /// Current averages.
    ///
    /// Fairness metrics read `undefined` whenever a group is missing from the
    /// pass as a whole or when no batch ever contributed to the gap.
    pub fn summary(&self) -> FairnessSummary {
        let missing_groups: Vec<u32> = self
            .group_sizes
            .iter()
            .enumerate()
            .filter(|&(_, &n)| n == 0)
            .map(|(g, _)| g as u32)
            .collect();

        let gap = |meter: &AverageMeter| -> MetricValue {
            if missing_groups.is_empty() {
                meter.avg().into()
            } else {
                MetricValue::Undefined
            }
        };

        FairnessSummary {
            accuracy: self.accuracy.avg().into(),
            equality_gap_0: gap(&self.equality_gap_0),
            equality_gap_1: gap(&self.equality_gap_1),
            parity_gap: gap(&self.parity_gap),
            samples: self.accuracy.count(),
            batches: self.batches,
            missing_groups,
        }
    }
}
