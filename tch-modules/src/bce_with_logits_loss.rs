use tch_goodies::TensorExt as _;

use crate::common::*;

#[derive(Debug)]
pub struct BceWithLogitsLossInit {
    pub pos_weight: Option<f64>,
    pub reduction: Reduction,
}

impl BceWithLogitsLossInit {
    pub fn default(reduction: Reduction) -> Self {
        Self {
            pos_weight: None,
            reduction,
        }
    }

    pub fn build(self) -> BceWithLogitsLoss {
        let Self {
            pos_weight,
            reduction,
        } = self;

        BceWithLogitsLoss {
            pos_weight,
            reduction,
        }
    }
}

/// Sigmoid binary cross entropy over raw logits.
#[derive(Debug)]
pub struct BceWithLogitsLoss {
    pos_weight: Option<f64>,
    reduction: Reduction,
}

impl BceWithLogitsLoss {
    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Tensor {
        debug_assert_eq!(
            input.size(),
            target.size(),
            "input and target tensors must have equal shape"
        );
        debug_assert!(
            target.is_empty() || bool::from(target.ge(0.0).logical_and(&target.le(1.0)).all()),
            "target values must be in range of [0.0, 1.0]"
        );

        let device = input.device();

        // return zero tensor if (1) input is empty and (2) using mean reduction
        if input.is_empty() && self.reduction == Reduction::Mean {
            return Tensor::zeros(&[], (Kind::Float, device)).set_requires_grad(false);
        }

        let pos_weight = self
            .pos_weight
            .map(|weight| Tensor::of_slice(&[weight as f32]).to_device(device));

        input.binary_cross_entropy_with_logits(
            &target.to_kind(input.kind()),
            None,
            pos_weight.as_ref(),
            self.reduction,
        )
    }
}
