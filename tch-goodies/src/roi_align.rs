use crate::common::*;

/// The reduction applied over the sampling points of each output bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolingMethod {
    /// Average of bilinearly sampled points.
    #[serde(rename = "roi_align")]
    RoiAlign,
    /// Maximum of bilinearly sampled points.
    #[serde(rename = "roi_pool")]
    RoiPool,
}

#[derive(Debug, Clone)]
pub struct RoiAlignInit {
    pub output_size: [i64; 2],
    pub sampling_ratio: i64,
    pub aligned: bool,
    pub method: PoolingMethod,
}

impl RoiAlignInit {
    pub fn new(output_size: [i64; 2]) -> Self {
        Self {
            output_size,
            sampling_ratio: 2,
            aligned: true,
            method: PoolingMethod::RoiAlign,
        }
    }

    pub fn build(self) -> Result<RoiAlign> {
        let Self {
            output_size,
            sampling_ratio,
            aligned,
            method,
        } = self;
        let [ph, pw] = output_size;
        ensure!(ph > 0 && pw > 0, "output_size must be positive");
        ensure!(sampling_ratio > 0, "sampling_ratio must be positive");

        Ok(RoiAlign {
            output_size,
            sampling_ratio,
            aligned,
            method,
        })
    }
}

/// Pools fixed-size features from boxes on a feature map.
///
/// Sampling points are read with the framework's bilinear grid sampler and
/// reduced per output bin.
#[derive(Debug, Clone)]
pub struct RoiAlign {
    output_size: [i64; 2],
    sampling_ratio: i64,
    aligned: bool,
    method: PoolingMethod,
}

impl RoiAlign {
    /// Pools `[num_rois, channels, ph, pw]` features.
    ///
    /// `input` is a `[batch, channels, height, width]` feature map and `rois` is a
    /// `[num_rois, 5]` tensor with `(batch_index, x1, y1, x2, y2)` rows in image
    /// coordinates. `spatial_scale` maps image coordinates to feature coordinates.
    pub fn forward(&self, input: &Tensor, rois: &Tensor, spatial_scale: f64) -> Result<Tensor> {
        let Self {
            output_size: [ph, pw],
            sampling_ratio: sr,
            aligned,
            method,
        } = *self;

        let (batch_size, channels, height, width) = input.size4()?;
        let (num_rois, num_cols) = rois.size2()?;
        ensure!(num_cols == 5, "rois must be a [num_rois, 5] tensor");
        let device = input.device();
        let kind = input.kind();

        if num_rois == 0 {
            return Ok(Tensor::zeros(&[0, channels, ph, pw], (kind, device)));
        }

        let grid = {
            let rois = rois.to_kind(kind);
            let offset = if aligned { 0.5 } else { 0.0 };
            let x1 = rois.select(1, 1) * spatial_scale - offset;
            let y1 = rois.select(1, 2) * spatial_scale - offset;
            let x2 = rois.select(1, 3) * spatial_scale - offset;
            let y2 = rois.select(1, 4) * spatial_scale - offset;

            let (roi_w, roi_h) = if aligned {
                (&x2 - &x1, &y2 - &y1)
            } else {
                ((&x2 - &x1).clamp_min(1.0), (&y2 - &y1).clamp_min(1.0))
            };
            let bin_w = roi_w / pw as f64;
            let bin_h = roi_h / ph as f64;

            // index i = bin * sr + sample maps to bin + (sample + 0.5) / sr
            let steps_x = (Tensor::arange(pw * sr, (kind, device)) + 0.5) / sr as f64;
            let steps_y = (Tensor::arange(ph * sr, (kind, device)) + 0.5) / sr as f64;
            let xs = x1.unsqueeze(1) + bin_w.unsqueeze(1) * steps_x.unsqueeze(0);
            let ys = y1.unsqueeze(1) + bin_h.unsqueeze(1) * steps_y.unsqueeze(0);

            // normalize to [-1, 1] with corner-aligned pixel centers
            let gx = xs * (2.0 / (width - 1).max(1) as f64) - 1.0;
            let gy = ys * (2.0 / (height - 1).max(1) as f64) - 1.0;

            let gx = gx
                .unsqueeze(1)
                .expand(&[num_rois, ph * sr, pw * sr], false);
            let gy = gy
                .unsqueeze(2)
                .expand(&[num_rois, ph * sr, pw * sr], false);
            Tensor::stack(&[gx, gy], 3)
        };

        // group rois by image to sample each feature map once
        let batch_indexes: Vec<i64> = Vec::from(
            &rois
                .select(1, 0)
                .to_kind(Kind::Int64)
                .to_device(Device::Cpu),
        );
        let groups = batch_indexes
            .iter()
            .enumerate()
            .map(|(roi_index, &batch_index)| (batch_index, roi_index as i64))
            .into_group_map();

        let (outputs, orders): (Vec<_>, Vec<_>) = groups
            .into_iter()
            .sorted_by_key(|(batch_index, _)| *batch_index)
            .map(|(batch_index, roi_indexes)| -> Result<_> {
                ensure!(
                    (0..batch_size).contains(&batch_index),
                    "roi batch index {} is out of range",
                    batch_index
                );
                let num_selected = roi_indexes.len() as i64;
                let selected = Tensor::of_slice(&roi_indexes).to_device(device);
                let sub_grid = grid
                    .index_select(0, &selected)
                    .view([1, num_selected * ph * sr, pw * sr, 2]);
                let feature = input.narrow(0, batch_index, 1);

                // [1, C, n * ph * sr, pw * sr]
                let sampled = feature.f_grid_sampler(
                    &sub_grid, /* bilinear */ 0, /* zeros */ 0, /* align_corners */ true,
                )?;
                let sampled = sampled
                    .view([channels, num_selected, ph * sr, pw * sr])
                    .permute(&[1, 0, 2, 3]);

                let pooled = match method {
                    PoolingMethod::RoiAlign => sampled.f_avg_pool2d(
                        &[sr, sr],
                        &[sr, sr],
                        &[0, 0],
                        false,
                        true,
                        None::<i64>,
                    )?,
                    PoolingMethod::RoiPool => {
                        sampled.f_max_pool2d(&[sr, sr], &[sr, sr], &[0, 0], &[1, 1], false)?
                    }
                };

                Ok((pooled, roi_indexes))
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .unzip();

        // restore the input order
        let output = Tensor::cat(&outputs, 0);
        let order: Vec<i64> = orders.into_iter().flatten().collect();
        let inverse = Tensor::of_slice(&order).to_device(device).argsort(0, false);
        Ok(output.index_select(0, &inverse))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn roi_align_constant_map() -> Result<()> {
        let input = Tensor::ones(&[2, 3, 16, 16], (Kind::Float, Device::Cpu)) * 2.0;
        let rois = Tensor::of_slice(&[
            1.0f32, 4.0, 4.0, 20.0, 20.0, //
            0.0, 2.0, 2.0, 8.0, 8.0,
        ])
        .view([2, 5]);
        let pooler = RoiAlignInit::new([7, 7]).build()?;
        let output = pooler.forward(&input, &rois, 0.5)?;

        assert_eq!(output.size(), vec![2, 3, 7, 7]);
        // sampling points are inside the map, so bilinear weights sum to one
        assert_abs_diff_eq!(f64::from(output.mean(Kind::Float)), 2.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn roi_align_keep_input_order() -> Result<()> {
        // image 0 is zeros, image 1 is ones
        let input = Tensor::stack(
            &[
                Tensor::zeros(&[1, 8, 8], (Kind::Float, Device::Cpu)),
                Tensor::ones(&[1, 8, 8], (Kind::Float, Device::Cpu)),
            ],
            0,
        );
        let rois = Tensor::of_slice(&[
            1.0f32, 1.0, 1.0, 6.0, 6.0, //
            0.0, 1.0, 1.0, 6.0, 6.0, //
            1.0, 2.0, 2.0, 5.0, 5.0,
        ])
        .view([3, 5]);
        let pooler = RoiAlignInit::new([2, 2]).build()?;
        let output = pooler.forward(&input, &rois, 1.0)?;
        let means: Vec<f32> = Vec::from(&output.mean_dim(&[1, 2, 3], false, Kind::Float));
        assert_abs_diff_eq!(means[0], 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(means[1], 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(means[2], 1.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn roi_pool_takes_maximum() -> Result<()> {
        // a horizontal ramp 0..7
        let input = Tensor::arange(8, (Kind::Float, Device::Cpu))
            .view([1, 1, 1, 8])
            .expand(&[1, 1, 8, 8], false)
            .contiguous();
        let rois = Tensor::of_slice(&[0.0f32, 0.5, 0.5, 7.5, 7.5]).view([1, 5]);
        let pooler = RoiAlignInit {
            method: PoolingMethod::RoiPool,
            ..RoiAlignInit::new([1, 1])
        }
        .build()?;
        let pool = pooler.forward(&input, &rois, 1.0)?;

        let align = RoiAlignInit::new([1, 1]).build()?;
        let avg = align.forward(&input, &rois, 1.0)?;

        assert!(f64::from(&pool) > f64::from(&avg));
        Ok(())
    }

    #[test]
    fn roi_align_empty_rois() -> Result<()> {
        let input = Tensor::ones(&[1, 4, 8, 8], (Kind::Float, Device::Cpu));
        let rois = Tensor::zeros(&[0, 5], (Kind::Float, Device::Cpu));
        let output = RoiAlignInit::new([7, 7])
            .build()?
            .forward(&input, &rois, 0.25)?;
        assert_eq!(output.size(), vec![0, 4, 7, 7]);
        Ok(())
    }
}
