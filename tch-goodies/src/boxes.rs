use crate::common::*;

/// Checked tensor of boxes in `[num_boxes, 4]` shape with `(x1, y1, x2, y2)` columns.
#[derive(Debug, TensorLike, Getters)]
pub struct XyxyTensor {
    #[get = "pub"]
    pub(crate) tensor: Tensor,
}

impl XyxyTensor {
    pub fn new(tensor: Tensor) -> Result<Self> {
        let (_, num_cols) = tensor.size2()?;
        ensure!(
            num_cols == 4,
            "expect a [num_boxes, 4] tensor, but get shape {:?}",
            tensor.size()
        );
        Ok(Self { tensor })
    }

    pub fn empty(device: Device) -> Self {
        Self {
            tensor: Tensor::zeros(&[0, 4], (Kind::Float, device)),
        }
    }

    pub fn into_tensor(self) -> Tensor {
        self.tensor
    }

    pub fn num_boxes(&self) -> i64 {
        self.tensor.size()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.num_boxes() == 0
    }

    pub fn device(&self) -> Device {
        self.tensor.device()
    }

    pub fn x1(&self) -> Tensor {
        self.tensor.select(1, 0)
    }

    pub fn y1(&self) -> Tensor {
        self.tensor.select(1, 1)
    }

    pub fn x2(&self) -> Tensor {
        self.tensor.select(1, 2)
    }

    pub fn y2(&self) -> Tensor {
        self.tensor.select(1, 3)
    }

    pub fn widths(&self) -> Tensor {
        self.x2() - self.x1()
    }

    pub fn heights(&self) -> Tensor {
        self.y2() - self.y1()
    }

    /// Box areas in `[num_boxes]` shape.
    pub fn area(&self) -> Tensor {
        self.widths() * self.heights()
    }

    pub fn index_select(&self, indexes: &Tensor) -> Self {
        Self {
            tensor: self.tensor.index_select(0, indexes),
        }
    }

    pub fn cat(boxes: &[impl Borrow<Self>]) -> Self {
        let tensors: Vec<_> = boxes
            .iter()
            .map(|boxes| boxes.borrow().tensor.shallow_clone())
            .collect();
        Self {
            tensor: Tensor::cat(&tensors, 0),
        }
    }

    /// Computes the `[num_self, num_other]` IoU matrix.
    pub fn pairwise_iou(&self, other: &Self) -> Tensor {
        let lhs_area = self.area();
        let rhs_area = other.area();

        let lhs = self.tensor.unsqueeze(1);
        let rhs = other.tensor.unsqueeze(0);

        let max_xy1 = lhs.narrow(2, 0, 2).maximum(&rhs.narrow(2, 0, 2));
        let min_xy2 = lhs.narrow(2, 2, 2).minimum(&rhs.narrow(2, 2, 2));
        let inter_wh = (min_xy2 - max_xy1).clamp_min(0.0);
        let inter_area = inter_wh.select(2, 0) * inter_wh.select(2, 1);

        let union_area = lhs_area.unsqueeze(1) + rhs_area.unsqueeze(0) - &inter_area;

        // zero-area pairs have zero IoU
        inter_area / union_area.clamp_min(1e-8)
    }

    /// Clamps coordinates into the `[0, width] x [0, height]` image region.
    pub fn clip(&self, height: f64, width: f64) -> Self {
        let x1 = self.x1().clamp(0.0, width);
        let y1 = self.y1().clamp(0.0, height);
        let x2 = self.x2().clamp(0.0, width);
        let y2 = self.y2().clamp(0.0, height);
        Self {
            tensor: Tensor::stack(&[x1, y1, x2, y2], 1),
        }
    }

    /// Boolean mask of boxes whose width and height both exceed `min_size`.
    pub fn nonempty(&self, min_size: f64) -> Tensor {
        self.widths()
            .gt(min_size)
            .logical_and(&self.heights().gt(min_size))
    }

    /// Applies the per-axis scale `(scale_x, scale_y)` on coordinates.
    pub fn scale(&self, scale_x: f64, scale_y: f64) -> Self {
        let factor = Tensor::of_slice(&[scale_x as f32, scale_y as f32, scale_x as f32, scale_y as f32])
            .to_device(self.device())
            .view([1, 4]);
        Self {
            tensor: &self.tensor * factor,
        }
    }
}

impl From<XyxyTensor> for Tensor {
    fn from(from: XyxyTensor) -> Self {
        from.tensor
    }
}

impl TryFrom<Tensor> for XyxyTensor {
    type Error = Error;

    fn try_from(from: Tensor) -> Result<Self, Self::Error> {
        Self::new(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn boxes(values: &[[f32; 4]]) -> XyxyTensor {
        let flat: Vec<f32> = values.iter().flatten().cloned().collect();
        XyxyTensor::new(Tensor::of_slice(&flat).view([-1, 4])).unwrap()
    }

    #[test]
    fn reject_wrong_shape() {
        assert!(XyxyTensor::new(Tensor::zeros(&[3, 5], (Kind::Float, Device::Cpu))).is_err());
        assert!(XyxyTensor::new(Tensor::zeros(&[4], (Kind::Float, Device::Cpu))).is_err());
    }

    #[test]
    fn pairwise_iou_matrix() {
        let lhs = boxes(&[[0.0, 0.0, 2.0, 2.0], [0.0, 0.0, 1.0, 1.0]]);
        let rhs = boxes(&[
            [1.0, 1.0, 3.0, 3.0],
            [0.0, 0.0, 2.0, 2.0],
            [5.0, 5.0, 6.0, 6.0],
        ]);
        let iou = lhs.pairwise_iou(&rhs);
        assert_eq!(iou.size(), vec![2, 3]);

        let iou: Vec<f32> = Vec::from(&iou.view([-1]));
        let expect = [1.0 / 7.0, 1.0, 0.0, 0.0, 0.25, 0.0];
        iou.iter().zip(expect.iter()).for_each(|(&lhs, &rhs)| {
            assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-6);
        });
    }

    #[test]
    fn degenerate_boxes_have_zero_iou() {
        let lhs = boxes(&[[1.0, 1.0, 1.0, 1.0]]);
        let iou = f32::from(&lhs.pairwise_iou(&lhs).view([-1]));
        assert_abs_diff_eq!(iou, 0.0);
    }

    #[test]
    fn clip_and_filter() {
        let input = boxes(&[[-4.0, 2.0, 20.0, 8.0], [12.0, 0.0, 15.0, 3.0]]);
        let clipped = input.clip(10.0, 10.0);
        let values: Vec<f32> = Vec::from(&clipped.tensor().view([-1]));
        assert_eq!(values, vec![0.0, 2.0, 10.0, 8.0, 10.0, 0.0, 10.0, 3.0]);

        let keep: Vec<bool> = Vec::from(&clipped.nonempty(0.0));
        assert_eq!(keep, vec![true, false]);
    }
}
