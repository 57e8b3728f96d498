//! Pools ROI features from the pyramid level matching each ROI's size.

use crate::common::*;
use tch_goodies::{PoolingMethod, RoiAlign, RoiAlignInit};

#[derive(Debug, Clone)]
pub struct RoiPoolerInit {
    /// Strides of the input levels, from fine to coarse.
    pub strides: Vec<i64>,
    pub output_size: [i64; 2],
    pub method: PoolingMethod,
    pub sampling_ratio: i64,
    /// The level a ROI of `canonical_size` pixels is assigned to.
    pub canonical_level: i64,
    pub canonical_size: f64,
}

impl RoiPoolerInit {
    pub fn new(strides: Vec<i64>, output_size: [i64; 2], method: PoolingMethod) -> Self {
        Self {
            strides,
            output_size,
            method,
            sampling_ratio: 2,
            canonical_level: 4,
            canonical_size: 224.0,
        }
    }

    pub fn build(self) -> Result<RoiPooler> {
        let Self {
            strides,
            output_size,
            method,
            sampling_ratio,
            canonical_level,
            canonical_size,
        } = self;

        ensure!(!strides.is_empty(), "strides must not be empty");
        ensure!(
            strides.iter().all(|stride| stride.count_ones() == 1),
            "strides must be powers of two"
        );
        ensure!(
            strides.iter().tuple_windows().all(|(lhs, rhs)| lhs * 2 == *rhs),
            "strides must be consecutive powers of two"
        );
        ensure!(canonical_size > 0.0, "canonical_size must be positive");

        let min_level = strides[0].trailing_zeros() as i64;
        let max_level = min_level + strides.len() as i64 - 1;
        let align = RoiAlignInit {
            sampling_ratio,
            method,
            ..RoiAlignInit::new(output_size)
        }
        .build()?;

        Ok(RoiPooler {
            strides,
            output_size,
            align,
            min_level,
            max_level,
            canonical_level,
            canonical_size,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RoiPooler {
    strides: Vec<i64>,
    output_size: [i64; 2],
    align: RoiAlign,
    min_level: i64,
    max_level: i64,
    canonical_level: i64,
    canonical_size: f64,
}

impl RoiPooler {
    pub fn output_size(&self) -> [i64; 2] {
        self.output_size
    }

    /// Returns the 0-based index into the input levels for each `[num_rois, 5]` ROI.
    pub fn assign_levels(&self, rois: &Tensor) -> Tensor {
        let boxes = rois.narrow(1, 1, 4);
        let widths = boxes.select(1, 2) - boxes.select(1, 0);
        let heights = boxes.select(1, 3) - boxes.select(1, 1);
        let sizes = (widths * heights).clamp_min(0.0).sqrt();

        let levels = ((sizes / self.canonical_size + 1e-8).log2() + self.canonical_level as f64)
            .floor()
            .clamp(self.min_level as f64, self.max_level as f64);
        (levels - self.min_level as f64).to_kind(Kind::Int64)
    }

    /// Pools `[num_rois, channels, ph, pw]` features in the order of `rois`.
    pub fn forward(&self, features: &[impl Borrow<Tensor>], rois: &Tensor) -> Result<Tensor> {
        ensure!(
            features.len() == self.strides.len(),
            "expect {} feature levels, but get {}",
            self.strides.len(),
            features.len()
        );
        let (num_rois, num_cols) = rois.size2()?;
        ensure!(num_cols == 5, "rois must be a [num_rois, 5] tensor");

        let first = features[0].borrow();
        let (_, channels, _, _) = first.size4()?;
        let device = first.device();
        let [ph, pw] = self.output_size;

        if num_rois == 0 {
            return Ok(Tensor::zeros(&[0, channels, ph, pw], (first.kind(), device)));
        }

        let levels = self.assign_levels(rois);
        let (pooled, indexes): (Vec<_>, Vec<_>) = izip!(features, &self.strides)
            .enumerate()
            .filter_map(|(level, (feature, &stride))| {
                let indexes = levels.eq(level as i64).nonzero().view([-1]);
                if indexes.is_empty() {
                    return None;
                }
                let level_rois = rois.index_select(0, &indexes);
                let pooled = self
                    .align
                    .forward(feature.borrow(), &level_rois, 1.0 / stride as f64);
                Some(pooled.map(|pooled| (pooled, indexes)))
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .unzip();

        let output = Tensor::cat(&pooled, 0);
        let inverse = Tensor::cat(&indexes, 0).argsort(0, false);
        Ok(output.index_select(0, &inverse))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pooler() -> RoiPooler {
        RoiPoolerInit::new(vec![4, 8, 16, 32], [7, 7], PoolingMethod::RoiAlign)
            .build()
            .unwrap()
    }

    #[test]
    fn assign_levels_by_size() {
        let rois = Tensor::of_slice(&[
            0.0f32, 0.0, 0.0, 224.0, 224.0, // canonical size, level 4
            0.0, 0.0, 0.0, 112.0, 112.0, // level 3
            0.0, 0.0, 0.0, 16.0, 16.0, // below the finest, clamped to level 2
            0.0, 0.0, 0.0, 1000.0, 1000.0, // above the coarsest, clamped to level 5
        ])
        .view([4, 5]);
        let levels: Vec<i64> = Vec::from(&pooler().assign_levels(&rois));
        assert_eq!(levels, vec![2, 1, 0, 3]);
    }

    #[test]
    fn pooled_features_follow_roi_order() -> Result<()> {
        // each level is filled with its own index
        let features: Vec<_> = [64, 32, 16, 8]
            .iter()
            .enumerate()
            .map(|(level, &size)| {
                Tensor::full(&[1, 2, size, size], level as f64, (Kind::Float, Device::Cpu))
            })
            .collect();
        let rois = Tensor::of_slice(&[
            0.0f32, 0.0, 0.0, 200.0, 200.0, //
            0.0, 10.0, 10.0, 26.0, 26.0, //
            0.0, 0.0, 0.0, 100.0, 100.0,
        ])
        .view([3, 5]);

        let pooled = pooler().forward(&features, &rois)?;
        assert_eq!(pooled.size(), vec![3, 2, 7, 7]);

        let means: Vec<f32> = Vec::from(&pooled.mean_dim(&[1, 2, 3], false, Kind::Float));
        let expect: Vec<f32> = Vec::from(&pooler().assign_levels(&rois).to_kind(Kind::Float));
        means.iter().zip_eq(&expect).for_each(|(mean, expect)| {
            assert!((mean - expect).abs() < 1e-4);
        });
        Ok(())
    }

    #[test]
    fn pool_empty_rois() -> Result<()> {
        let features: Vec<_> = [16, 8, 4, 2]
            .iter()
            .map(|&size| Tensor::zeros(&[1, 3, size, size], (Kind::Float, Device::Cpu)))
            .collect();
        let rois = Tensor::zeros(&[0, 5], (Kind::Float, Device::Cpu));
        assert_eq!(pooler().forward(&features, &rois)?.size(), vec![0, 3, 7, 7]);
        Ok(())
    }

    #[test]
    fn reject_mismatched_levels() {
        let features = vec![Tensor::zeros(&[1, 3, 8, 8], (Kind::Float, Device::Cpu))];
        let rois = Tensor::zeros(&[1, 5], (Kind::Float, Device::Cpu));
        assert!(pooler().forward(&features, &rois).is_err());
    }
}
