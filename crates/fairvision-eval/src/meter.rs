//! Size-weighted running averages.

/// Running mean over an evaluation pass, weighted by batch size.
///
/// `avg = sum(value_i * n_i) / sum(n_i)`, which equals the per-sample mean
/// when each batch value is itself a per-sample mean.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AverageMeter {
    last: f64,
    sum: f64,
    count: usize,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all accumulated state for a new pass.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Fold in a batch value computed over `n` samples.
    pub fn update(&mut self, value: f64, n: usize) {
        if n == 0 {
            return;
        }
        self.last = value;
        self.sum += value * n as f64;
        self.count += n;
    }

    /// Mean so far, or `None` before the first update.
    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Most recent batch value.
    pub fn last(&self) -> f64 {
        self.last
    }

    /// Number of samples folded in.
    pub fn count(&self) -> usize {
        self.count
    }
}
