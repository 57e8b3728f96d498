use crate::common::*;

#[derive(Debug, Clone)]
pub struct FrozenBatchNormInit {
    pub eps: f64,
}

impl Default for FrozenBatchNormInit {
    fn default() -> Self {
        Self { eps: 1e-5 }
    }
}

impl FrozenBatchNormInit {
    pub fn build<'p, P>(self, path: P, out_dim: i64) -> FrozenBatchNorm
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self { eps } = self;

        FrozenBatchNorm {
            ws: path.ones_no_train("weight", &[out_dim]),
            bs: path.zeros_no_train("bias", &[out_dim]),
            running_mean: path.zeros_no_train("running_mean", &[out_dim]),
            running_var: path.ones_no_train("running_var", &[out_dim]),
            eps,
        }
    }
}

/// Batch normalization with fixed statistics and affine parameters.
///
/// All tensors are registered as non-trainable, so the layer behaves the same in
/// training and inference.
#[derive(Debug)]
pub struct FrozenBatchNorm {
    pub ws: Tensor,
    pub bs: Tensor,
    pub running_mean: Tensor,
    pub running_var: Tensor,
    eps: f64,
}

impl nn::ModuleT for FrozenBatchNorm {
    fn forward_t(&self, input: &Tensor, _train: bool) -> Tensor {
        let Self {
            ref ws,
            ref bs,
            ref running_mean,
            ref running_var,
            eps,
        } = *self;

        let scale = ws * (running_var + eps).rsqrt();
        let shift = bs - running_mean * &scale;
        input * scale.view([1, -1, 1, 1]) + shift.view([1, -1, 1, 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn frozen_batch_norm_affine() {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let mut norm = FrozenBatchNormInit { eps: 0.0 }.build(&root / "bn", 2);

        tch::no_grad(|| {
            norm.ws.copy_(&Tensor::of_slice(&[2.0f32, 1.0]));
            norm.bs.copy_(&Tensor::of_slice(&[1.0f32, 0.0]));
            norm.running_mean.copy_(&Tensor::of_slice(&[1.0f32, 3.0]));
            norm.running_var.copy_(&Tensor::of_slice(&[4.0f32, 1.0]));
        });

        let input = Tensor::of_slice(&[3.0f32, 5.0]).view([1, 2, 1, 1]);
        let output: Vec<f32> = Vec::from(&norm.forward_t(&input, true).view([-1]));
        // (3 - 1) / 2 * 2 + 1 and (5 - 3) / 1 * 1 + 0
        assert_abs_diff_eq!(output[0], 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(output[1], 2.0, epsilon = 1e-6);

        // nothing is trainable
        assert!(vs.trainable_variables().is_empty());
    }
}
