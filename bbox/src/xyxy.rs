use crate::{common::*, Rescale, HW};

/// Bounding box in corner format, `(x1, y1)` is the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "with-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Xyxy<T> {
    pub(crate) x1: T,
    pub(crate) y1: T,
    pub(crate) x2: T,
    pub(crate) y2: T,
}

impl<T> Xyxy<T> {
    pub fn try_cast<V>(self) -> Option<Xyxy<V>>
    where
        T: ToPrimitive,
        V: NumCast,
    {
        Some(Xyxy {
            x1: V::from(self.x1)?,
            y1: V::from(self.y1)?,
            x2: V::from(self.x2)?,
            y2: V::from(self.y2)?,
        })
    }

    pub fn cast<V>(self) -> Xyxy<V>
    where
        T: ToPrimitive,
        V: NumCast,
    {
        self.try_cast().unwrap()
    }
}

impl<T> Xyxy<T>
where
    T: Copy + Num + PartialOrd,
{
    pub fn try_from_xyxy(xyxy: [T; 4]) -> Result<Self> {
        let [x1, y1, x2, y2] = xyxy;
        ensure!(x2 >= x1 && y2 >= y1, "x2 >= x1 and y2 >= y1 must hold");
        Ok(Self { x1, y1, x2, y2 })
    }

    pub fn from_xyxy(xyxy: [T; 4]) -> Self {
        Self::try_from_xyxy(xyxy).unwrap()
    }

    /// Builds a box from the COCO `[x, y, w, h]` layout.
    pub fn try_from_xywh(xywh: [T; 4]) -> Result<Self> {
        let [x, y, w, h] = xywh;
        Self::try_from_xyxy([x, y, x + w, y + h])
    }

    pub fn x1(&self) -> T {
        self.x1
    }

    pub fn y1(&self) -> T {
        self.y1
    }

    pub fn x2(&self) -> T {
        self.x2
    }

    pub fn y2(&self) -> T {
        self.y2
    }

    pub fn w(&self) -> T {
        self.x2 - self.x1
    }

    pub fn h(&self) -> T {
        self.y2 - self.y1
    }

    pub fn cx(&self) -> T {
        let two = T::one() + T::one();
        self.x1 + self.w() / two
    }

    pub fn cy(&self) -> T {
        let two = T::one() + T::one();
        self.y1 + self.h() / two
    }

    pub fn hw(&self) -> HW<T> {
        HW::from_hw([self.h(), self.w()])
    }

    pub fn area(&self) -> T {
        self.w() * self.h()
    }

    pub fn xyxy(&self) -> [T; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    pub fn xywh(&self) -> [T; 4] {
        [self.x1, self.y1, self.w(), self.h()]
    }

    /// Returns true if the box has zero width or height.
    pub fn is_degenerate(&self) -> bool {
        self.w() <= T::zero() || self.h() <= T::zero()
    }

    pub fn intersect_with(&self, other: &Self) -> Option<Self> {
        let x1 = max(self.x1, other.x1);
        let y1 = max(self.y1, other.y1);
        let x2 = min(self.x2, other.x2);
        let y2 = min(self.y2, other.y2);
        Self::try_from_xyxy([x1, y1, x2, y2]).ok()
    }

    pub fn intersect_area_with(&self, other: &Self) -> T {
        self.intersect_with(other)
            .map(|inter| inter.area())
            .unwrap_or_else(T::zero)
    }

    pub fn iou_with(&self, other: &Self) -> T {
        let inter = self.intersect_area_with(other);
        let union = self.area() + other.area() - inter;
        if union <= T::zero() {
            T::zero()
        } else {
            inter / union
        }
    }

    /// Clips the box into the image of the given size.
    pub fn clip(&self, size: &HW<T>) -> Self {
        let zero = T::zero();
        let clamp = |value: T, upper: T| min(max(value, zero), upper);

        Self {
            x1: clamp(self.x1, size.w()),
            y1: clamp(self.y1, size.h()),
            x2: clamp(self.x2, size.w()),
            y2: clamp(self.y2, size.h()),
        }
    }

    /// Mirrors the box horizontally inside an image of width `image_w`.
    pub fn hflip(&self, image_w: T) -> Self {
        Self {
            x1: image_w - self.x2,
            y1: self.y1,
            x2: image_w - self.x1,
            y2: self.y2,
        }
    }

    pub fn rescale(&self, rescale: &Rescale<T>) -> Self {
        Self {
            x1: self.x1 * rescale.sx,
            y1: self.y1 * rescale.sy,
            x2: self.x2 * rescale.sx,
            y2: self.y2 * rescale.sy,
        }
    }
}

fn max<T: PartialOrd>(lhs: T, rhs: T) -> T {
    if lhs >= rhs {
        lhs
    } else {
        rhs
    }
}

fn min<T: PartialOrd>(lhs: T, rhs: T) -> T {
    if lhs <= rhs {
        lhs
    } else {
        rhs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn xyxy_from_coco_layout() {
        let bbox = Xyxy::try_from_xywh([10.0, 20.0, 30.0, 40.0]).unwrap();
        assert_eq!(bbox.xyxy(), [10.0, 20.0, 40.0, 60.0]);
        assert_eq!(bbox.xywh(), [10.0, 20.0, 30.0, 40.0]);
        assert_abs_diff_eq!(bbox.cx(), 25.0);
        assert_abs_diff_eq!(bbox.cy(), 40.0);
    }

    #[test]
    fn xyxy_reject_inverted_corners() {
        assert!(Xyxy::try_from_xyxy([5.0, 0.0, 1.0, 1.0]).is_err());
        assert!(Xyxy::try_from_xywh([0.0, 0.0, 1.0, -1.0]).is_err());
    }

    #[test]
    fn xyxy_iou() {
        let lhs = Xyxy::from_xyxy([0.0, 0.0, 2.0, 2.0]);
        let rhs = Xyxy::from_xyxy([1.0, 1.0, 3.0, 3.0]);
        assert_abs_diff_eq!(lhs.intersect_area_with(&rhs), 1.0);
        assert_abs_diff_eq!(lhs.iou_with(&rhs), 1.0 / 7.0);

        let far = Xyxy::from_xyxy([10.0, 10.0, 11.0, 11.0]);
        assert_abs_diff_eq!(lhs.iou_with(&far), 0.0);
    }

    #[test]
    fn xyxy_clip_and_flip() {
        let bbox = Xyxy::from_xyxy([-5.0, 2.0, 120.0, 50.0]);
        let clipped = bbox.clip(&HW::from_hw([40.0, 100.0]));
        assert_eq!(clipped.xyxy(), [0.0, 2.0, 100.0, 40.0]);

        let flipped = Xyxy::from_xyxy([10.0, 0.0, 30.0, 5.0]).hflip(100.0);
        assert_eq!(flipped.xyxy(), [70.0, 0.0, 90.0, 5.0]);
    }

    #[test]
    fn xyxy_degenerate() {
        assert!(Xyxy::from_xyxy([1.0, 1.0, 1.0, 5.0]).is_degenerate());
        assert!(!Xyxy::from_xyxy([1.0, 1.0, 2.0, 5.0]).is_degenerate());
    }
}
