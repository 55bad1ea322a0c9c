//! Task losses computed from head logits.

use candle_core::{Device, Tensor, D};
use fairvision_core::ScoreNormalization;

/// Loss matching the head's score normalization.
///
/// - Softmax: cross-entropy against the target rows normalized to sum to one.
///   All-zero rows contribute nothing.
/// - Sigmoid: mean binary cross-entropy with logits.
pub fn task_loss(
    logits: &Tensor,
    targets: &Tensor,
    normalization: ScoreNormalization,
) -> candle_core::Result<Tensor> {
    let targets = targets.to_dtype(logits.dtype())?;
    match normalization {
        ScoreNormalization::Softmax => soft_cross_entropy(logits, &targets),
        ScoreNormalization::Sigmoid => bce_with_logits(logits, &targets),
    }
}

fn soft_cross_entropy(logits: &Tensor, targets: &Tensor) -> candle_core::Result<Tensor> {
    let row_sums = targets.sum_keepdim(D::Minus1)?.affine(1.0, 1e-6)?;
    let weights = targets.broadcast_div(&row_sums)?;
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    weights.mul(&log_probs)?.sum(D::Minus1)?.neg()?.mean_all()
}

/// `max(x, 0) - x * t + log(1 + exp(-|x|))`, averaged over all entries.
fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> candle_core::Result<Tensor> {
    let softplus = logits.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    logits
        .relu()?
        .sub(&logits.mul(targets)?)?
        .add(&softplus)?
        .mean_all()
}

/// One-hot `[B, num_groups]` encoding of per-sample group ids.
pub fn one_hot(groups: &[u32], num_groups: usize, device: &Device) -> candle_core::Result<Tensor> {
    let mut values = vec![0f32; groups.len() * num_groups];
    for (row, &g) in groups.iter().enumerate() {
        let g = g as usize;
        if g >= num_groups {
            candle_core::bail!("group id {g} outside 0..{num_groups}");
        }
        values[row * num_groups + g] = 1.0;
    }
    Tensor::from_vec(values, (groups.len(), num_groups), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn scalar(t: Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_soft_cross_entropy_uniform_logits() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 4), DType::F32, &device).unwrap();
        let targets = Tensor::new(&[[1f32, 0., 0., 0.], [0., 1., 1., 0.]], &device).unwrap();
        let loss = scalar(task_loss(&logits, &targets, ScoreNormalization::Softmax).unwrap());
        assert!((loss - 4f32.ln()).abs() < 1e-4);
    }

    #[test]
    fn test_soft_cross_entropy_rewards_correct_class() {
        let device = Device::Cpu;
        let targets = Tensor::new(&[[1f32, 0., 0.]], &device).unwrap();
        let good = Tensor::new(&[[5f32, 0., 0.]], &device).unwrap();
        let bad = Tensor::new(&[[0f32, 5., 0.]], &device).unwrap();
        let good = scalar(task_loss(&good, &targets, ScoreNormalization::Softmax).unwrap());
        let bad = scalar(task_loss(&bad, &targets, ScoreNormalization::Softmax).unwrap());
        assert!(good < bad);
    }

    #[test]
    fn test_bce_with_logits_at_zero_is_ln2() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((3, 2), DType::F32, &device).unwrap();
        let targets = Tensor::new(&[[1f32, 0.], [0., 1.], [1., 1.]], &device).unwrap();
        let loss = scalar(task_loss(&logits, &targets, ScoreNormalization::Sigmoid).unwrap());
        assert!((loss - 2f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_bce_with_large_logits_is_stable() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[100f32, -100.]], &device).unwrap();
        let targets = Tensor::new(&[[1f32, 0.]], &device).unwrap();
        let loss = scalar(task_loss(&logits, &targets, ScoreNormalization::Sigmoid).unwrap());
        assert!(loss.is_finite());
        assert!(loss < 1e-4);
    }

    #[test]
    fn test_one_hot() {
        let t = one_hot(&[1, 0, 1], 2, &Device::Cpu).unwrap();
        assert_eq!(
            t.to_vec2::<f32>().unwrap(),
            vec![vec![0., 1.], vec![1., 0.], vec![0., 1.]]
        );
        assert!(one_hot(&[2], 2, &Device::Cpu).is_err());
    }
}
