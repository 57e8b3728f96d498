use crate::common::*;

/// Loss names in reporting order.
pub const LOSS_KEYS: [&str; 5] = ["total_loss", "rpn_cls", "rpn_loc", "rcnn_cls", "rcnn_loc"];

/// Scalar losses of one training step.
#[derive(Debug, TensorLike)]
pub struct LossOutput {
    pub total_loss: Tensor,
    pub rpn_cls: Tensor,
    pub rpn_loc: Tensor,
    pub rcnn_cls: Tensor,
    pub rcnn_loc: Tensor,
}

impl LossOutput {
    /// Sums up the stage losses into the total loss.
    pub fn new(rpn_cls: Tensor, rpn_loc: Tensor, rcnn_cls: Tensor, rcnn_loc: Tensor) -> Self {
        let total_loss = &rpn_cls + &rpn_loc + &rcnn_cls + &rcnn_loc;
        Self {
            total_loss,
            rpn_cls,
            rpn_loc,
            rcnn_cls,
            rcnn_loc,
        }
    }

    /// Losses paired with their names in [LOSS_KEYS] order.
    pub fn named_losses(&self) -> [(&'static str, &Tensor); 5] {
        [
            (LOSS_KEYS[0], &self.total_loss),
            (LOSS_KEYS[1], &self.rpn_cls),
            (LOSS_KEYS[2], &self.rpn_loc),
            (LOSS_KEYS[3], &self.rcnn_cls),
            (LOSS_KEYS[4], &self.rcnn_loc),
        ]
    }

    /// Copies the loss values to host.
    pub fn to_values(&self) -> IndexMap<&'static str, f64> {
        self.named_losses()
            .into_iter()
            .map(|(name, loss)| (name, f64::from(loss)))
            .collect()
    }

    pub fn is_finite(&self) -> bool {
        self.named_losses()
            .iter()
            .all(|(_, loss)| bool::from(loss.isfinite().all()))
    }
}
