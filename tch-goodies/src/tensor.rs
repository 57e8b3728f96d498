use crate::common::*;

pub trait TensorExt {
    fn is_empty(&self) -> bool;

    fn f_sum_tensors<T>(tensors: impl IntoIterator<Item = T>) -> Result<Tensor>
    where
        T: Borrow<Tensor>,
    {
        let mut iter = tensors.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| format_err!("the input iterator must not be empty"))?
            .borrow()
            .shallow_clone();
        let sum = iter.try_fold(first, |lhs, rhs| lhs.f_add(rhs.borrow()))?;
        Ok(sum)
    }

    fn sum_tensors<T>(tensors: impl IntoIterator<Item = T>) -> Tensor
    where
        T: Borrow<Tensor>,
    {
        Self::f_sum_tensors(tensors).unwrap()
    }

    /// Pads a `[batch, channel, height, width]` tensor at bottom and right so that
    /// height and width become multiples of `divisor`.
    fn f_pad_to_multiple(&self, divisor: i64, value: f64) -> Result<Tensor>;

    fn pad_to_multiple(&self, divisor: i64, value: f64) -> Tensor {
        self.f_pad_to_multiple(divisor, value).unwrap()
    }

    /// Pads a `[channel, height, width]` tensor to the given size at bottom and right.
    fn f_pad_to_size(&self, height: i64, width: i64, value: f64) -> Result<Tensor>;

    /// Creates a zero scalar on the same device that does not require gradient.
    fn zero_scalar_like(&self) -> Tensor;

    fn has_nan(&self) -> bool;
}

impl TensorExt for Tensor {
    fn is_empty(&self) -> bool {
        self.numel() == 0
    }

    fn f_pad_to_multiple(&self, divisor: i64, value: f64) -> Result<Tensor> {
        ensure!(divisor > 0, "divisor must be positive");
        let (batch_size, channels, height, width) = self.size4()?;
        let new_height = (height + divisor - 1) / divisor * divisor;
        let new_width = (width + divisor - 1) / divisor * divisor;

        if new_height == height && new_width == width {
            return Ok(self.shallow_clone());
        }

        let mut canvas = Tensor::f_zeros(
            &[batch_size, channels, new_height, new_width],
            (self.kind(), self.device()),
        )? + value;
        canvas
            .f_narrow(2, 0, height)?
            .f_narrow(3, 0, width)?
            .f_copy_(self)?;
        Ok(canvas)
    }

    fn f_pad_to_size(&self, height: i64, width: i64, value: f64) -> Result<Tensor> {
        let (channels, orig_h, orig_w) = self.size3()?;
        ensure!(
            orig_h <= height && orig_w <= width,
            "cannot pad a {}x{} image to smaller size {}x{}",
            orig_h,
            orig_w,
            height,
            width
        );

        let mut canvas =
            Tensor::f_zeros(&[channels, height, width], (self.kind(), self.device()))? + value;
        canvas
            .f_narrow(1, 0, orig_h)?
            .f_narrow(2, 0, orig_w)?
            .f_copy_(self)?;
        Ok(canvas)
    }

    fn zero_scalar_like(&self) -> Tensor {
        Tensor::zeros(&[], (Kind::Float, self.device())).set_requires_grad(false)
    }

    fn has_nan(&self) -> bool {
        bool::from(self.isnan().any())
    }
}
