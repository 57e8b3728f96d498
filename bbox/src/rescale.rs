use crate::{common::*, Xyxy, HW};

/// Axis-aligned scaling between two image sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rescale<T> {
    pub sy: T,
    pub sx: T,
}

impl<T> Rescale<T>
where
    T: Copy + Num + PartialOrd,
{
    pub fn uniform(scale: T) -> Self {
        Self {
            sy: scale,
            sx: scale,
        }
    }

    /// The scaling that maps an image of `src` size onto `tgt` size.
    pub fn from_sizes(src: &HW<T>, tgt: &HW<T>) -> Self {
        Self {
            sy: tgt.h() / src.h(),
            sx: tgt.w() / src.w(),
        }
    }

    pub fn inverse(&self) -> Self {
        Self {
            sy: T::one() / self.sy,
            sx: T::one() / self.sx,
        }
    }
}

impl<T> Rescale<T>
where
    T: Float,
{
    /// Computes the scale that resizes the short side of `size` to `short_size`,
    /// reduced when the long side would exceed `max_size`.
    pub fn short_side(size: &HW<T>, short_size: T, max_size: T) -> Self {
        let short = size.short_side();
        let long = size.long_side();
        let mut scale = short_size / short;
        if (long * scale).round() > max_size {
            scale = max_size / long;
        }
        Self::uniform(scale)
    }

    pub fn apply_size(&self, size: &HW<T>) -> HW<T> {
        HW::from_hw([(size.h() * self.sy).round(), (size.w() * self.sx).round()])
    }
}

impl<T> Mul<&Xyxy<T>> for &Rescale<T>
where
    T: Copy + Num + PartialOrd,
{
    type Output = Xyxy<T>;

    fn mul(self, rhs: &Xyxy<T>) -> Self::Output {
        rhs.rescale(self)
    }
}

impl<T> Mul<&Rescale<T>> for &Rescale<T>
where
    T: Copy + Num,
{
    type Output = Rescale<T>;

    fn mul(self, rhs: &Rescale<T>) -> Self::Output {
        Rescale {
            sy: self.sy * rhs.sy,
            sx: self.sx * rhs.sx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn rescale_inverse() {
        let orig = Rescale { sy: 2.0, sx: 4.0 };
        assert_eq!(orig.inverse().inverse(), orig);
        assert_eq!(&orig * &orig.inverse(), Rescale::uniform(1.0));
    }

    #[test]
    fn rescale_short_side() {
        // 480x640 -> short side 800
        let scale = Rescale::short_side(&HW::from_hw([480.0, 640.0]), 800.0, 1333.0);
        assert_abs_diff_eq!(scale.sy, 800.0 / 480.0);
        let size = scale.apply_size(&HW::from_hw([480.0, 640.0]));
        assert_eq!(size, HW::from_hw([800.0, 1067.0]));
    }

    #[test]
    fn rescale_short_side_capped_by_max() {
        // a panorama hits the long-side cap first
        let scale = Rescale::short_side(&HW::from_hw([200.0, 1000.0]), 800.0, 1333.0);
        assert_abs_diff_eq!(scale.sx, 1.333);
        let size = scale.apply_size(&HW::from_hw([200.0, 1000.0]));
        assert_eq!(size, HW::from_hw([267.0, 1333.0]));
    }

    #[test]
    fn rescale_box() {
        let scale = Rescale { sy: 0.5, sx: 2.0 };
        let bbox = Xyxy::from_xyxy([1.0, 2.0, 3.0, 4.0]);
        assert_eq!((&scale * &bbox).xyxy(), [2.0, 1.0, 6.0, 2.0]);
    }
}
