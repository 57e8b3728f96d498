use crate::common::*;
use tch_goodies::TensorExt as _;

#[derive(Debug, Clone)]
pub struct SmoothL1LossInit {
    /// The transition point between the quadratic and linear zones.
    pub beta: f64,
    pub reduction: Reduction,
}

impl SmoothL1LossInit {
    pub fn default(reduction: Reduction) -> Self {
        Self {
            beta: 1.0,
            reduction,
        }
    }

    pub fn build(self) -> Result<SmoothL1Loss> {
        let Self { beta, reduction } = self;
        ensure!(beta >= 0.0, "beta must be non-negative, but get {}", beta);
        Ok(SmoothL1Loss { beta, reduction })
    }
}

/// Element-wise smooth L1 loss.
///
/// It is `0.5 * x^2 / beta` when `|x| < beta`, otherwise `|x| - 0.5 * beta`.
/// A zero beta degenerates to the L1 loss.
#[derive(Debug)]
pub struct SmoothL1Loss {
    beta: f64,
    reduction: Reduction,
}

impl SmoothL1Loss {
    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Tensor {
        let Self { beta, reduction } = *self;
        debug_assert_eq!(
            input.size(),
            target.size(),
            "input and target tensors must have equal shape"
        );

        // return zero tensor if (1) input is empty and (2) using mean reduction
        if input.is_empty() && reduction == Reduction::Mean {
            return Tensor::zeros(&[], (Kind::Float, input.device())).set_requires_grad(false);
        }

        let diff = (input - target).abs();
        let loss = if beta < 1e-5 {
            diff
        } else {
            let quadratic = diff.lt(beta).to_kind(diff.kind());
            let linear = 1.0 - &quadratic;
            &quadratic * &diff * &diff * (0.5 / beta) + linear * (&diff - 0.5 * beta)
        };

        match reduction {
            Reduction::None => loss,
            Reduction::Sum => loss.sum(Kind::Float),
            Reduction::Mean => loss.mean(Kind::Float),
            Reduction::Other(_) => unimplemented!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn smooth_l1_zones() -> Result<()> {
        let loss_fn = SmoothL1LossInit {
            beta: 1.0,
            reduction: Reduction::None,
        }
        .build()?;
        let input = Tensor::of_slice(&[0.5f32, -3.0, 1.0]);
        let target = Tensor::zeros(&[3], (Kind::Float, Device::Cpu));
        let loss: Vec<f32> = Vec::from(&loss_fn.forward(&input, &target));

        assert_abs_diff_eq!(loss[0], 0.125, epsilon = 1e-6);
        assert_abs_diff_eq!(loss[1], 2.5, epsilon = 1e-6);
        assert_abs_diff_eq!(loss[2], 0.5, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn smooth_l1_zero_beta_is_l1() -> Result<()> {
        let loss_fn = SmoothL1LossInit {
            beta: 0.0,
            reduction: Reduction::Sum,
        }
        .build()?;
        let input = Tensor::of_slice(&[0.5f32, -3.0, 0.01]);
        let target = Tensor::zeros(&[3], (Kind::Float, Device::Cpu));
        let loss = f64::from(loss_fn.forward(&input, &target));
        assert_abs_diff_eq!(loss, 3.51, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn smooth_l1_reject_negative_beta() {
        assert!(SmoothL1LossInit {
            beta: -1.0,
            reduction: Reduction::Sum,
        }
        .build()
        .is_err());
    }
}
