use crate::common::*;
use tch_goodies::TensorExt as _;

/// Softmax cross entropy against class indexes.
#[derive(Debug)]
pub struct CrossEntropyLoss {
    reduction: Reduction,
}

impl CrossEntropyLoss {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }

    /// Computes the loss of `[num_samples, num_classes]` logits against a
    /// `[num_samples]` int64 target.
    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Tensor {
        let (num_samples, num_classes) = input.size2().unwrap();
        debug_assert!(
            target.kind() == Kind::Int64 && target.size1().unwrap() == num_samples,
            "expect target a [{}] int64 tensor",
            num_samples
        );
        debug_assert!(
            target.is_empty()
                || (bool::from(target.ge(0).all()) && bool::from(target.lt(num_classes).all())),
            "target values must be in range of [0, {})",
            num_classes
        );

        // return zero tensor if (1) input is empty and (2) using mean reduction
        if input.is_empty() && self.reduction == Reduction::Mean {
            return Tensor::zeros(&[], (Kind::Float, input.device())).set_requires_grad(false);
        }

        let loss = -input
            .log_softmax(1, Kind::Float)
            .gather(1, &target.unsqueeze(1), false)
            .squeeze_dim(1);

        match self.reduction {
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
    fn cross_entropy_values() {
        let input = Tensor::of_slice(&[0.0f32, 0.0, 10.0, 0.0, 0.0, 0.0]).view([2, 3]);
        let target = Tensor::of_slice(&[2i64, 1]);

        let loss: Vec<f32> = Vec::from(&CrossEntropyLoss::new(Reduction::None).forward(&input, &target));
        let confident = -(10f32.exp() / (10f32.exp() + 2.0)).ln();
        assert_abs_diff_eq!(loss[0], confident, epsilon = 1e-5);
        assert_abs_diff_eq!(loss[1], 3f32.ln(), epsilon = 1e-5);

        let mean = f64::from(CrossEntropyLoss::new(Reduction::Mean).forward(&input, &target));
        assert_abs_diff_eq!(mean, (confident + 3f32.ln()) as f64 / 2.0, epsilon = 1e-5);
    }

    #[test]
    fn cross_entropy_empty_input() {
        let input = Tensor::zeros(&[0, 5], (Kind::Float, Device::Cpu));
        let target = Tensor::zeros(&[0], (Kind::Int64, Device::Cpu));
        let loss = CrossEntropyLoss::new(Reduction::Mean).forward(&input, &target);
        assert_eq!(f64::from(loss), 0.0);
    }

    #[test]
    fn cross_entropy_converges() -> Result<()> {
        let device = Device::Cpu;
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let loss_fn = CrossEntropyLoss::new(Reduction::Mean);

        let input = root.zeros("input", &[16, 4]);
        let target = Tensor::arange(16, (Kind::Int64, device)).remainder(4);
        let mut optimizer = nn::Sgd::default().build(&vs, 1.0)?;

        for _ in 0..200 {
            let loss = loss_fn.forward(&input, &target);
            optimizer.backward_step(&loss);
        }

        let (_, argmax) = input.max_dim(1, false);
        ensure!(
            bool::from(argmax.eq_tensor(&target).all()),
            "the loss does not converge"
        );
        Ok(())
    }
}
