//! Anchor boxes tiled over feature maps.

use crate::common::*;
use rcnn_config::AnchorConfig;

#[derive(Debug, Clone)]
pub struct AnchorGeneratorInit {
    pub base_size: f64,
    pub scales: Vec<f64>,
    /// Height over width ratios.
    pub aspect_ratios: Vec<f64>,
    pub offset: f64,
}

impl AnchorGeneratorInit {
    pub fn from_config(config: &AnchorConfig) -> Self {
        let AnchorConfig {
            anchor_base_size,
            ref anchor_scales,
            ref anchor_aspect_ratios,
            anchor_offset,
        } = *config;

        Self {
            base_size: anchor_base_size.raw(),
            scales: anchor_scales.iter().map(|scale| scale.raw()).collect(),
            aspect_ratios: anchor_aspect_ratios.iter().map(|ratio| ratio.raw()).collect(),
            offset: anchor_offset.raw(),
        }
    }

    pub fn build(self) -> Result<AnchorGenerator> {
        let Self {
            base_size,
            scales,
            aspect_ratios,
            offset,
        } = self;

        ensure!(base_size > 0.0, "base_size must be positive");
        ensure!(
            !scales.is_empty() && scales.iter().all(|&scale| scale > 0.0),
            "scales must be non-empty and positive"
        );
        ensure!(
            !aspect_ratios.is_empty() && aspect_ratios.iter().all(|&ratio| ratio > 0.0),
            "aspect_ratios must be non-empty and positive"
        );

        Ok(AnchorGenerator {
            base_size,
            scales,
            aspect_ratios,
            offset,
        })
    }
}

/// Generates anchors for each cell of a feature map.
///
/// On a level with stride `s`, every cell carries one anchor per `(scale, ratio)` pair
/// with side `base_size * scale * s`, reshaped by the ratio while keeping its area.
#[derive(Debug, Clone)]
pub struct AnchorGenerator {
    base_size: f64,
    scales: Vec<f64>,
    aspect_ratios: Vec<f64>,
    offset: f64,
}

impl AnchorGenerator {
    pub fn num_cell_anchors(&self) -> i64 {
        (self.scales.len() * self.aspect_ratios.len()) as i64
    }

    /// Returns `[num_cell_anchors, 4]` boxes centered at the origin.
    pub fn cell_anchors(&self, stride: i64, device: Device) -> Tensor {
        let values: Vec<f32> = self
            .scales
            .iter()
            .cartesian_product(self.aspect_ratios.iter())
            .flat_map(|(&scale, &ratio)| {
                let size = self.base_size * scale * stride as f64;
                let w = size / ratio.sqrt();
                let h = size * ratio.sqrt();
                [-w / 2.0, -h / 2.0, w / 2.0, h / 2.0]
            })
            .map(|value| value as f32)
            .collect();
        Tensor::of_slice(&values).view([-1, 4]).to_device(device)
    }

    /// Returns `[height * width * num_cell_anchors, 4]` anchors in `(row, col, anchor)` order.
    pub fn grid_anchors(&self, height: i64, width: i64, stride: i64, device: Device) -> Tensor {
        let stride_f = stride as f64;
        let xs = (Tensor::arange(width, (Kind::Float, device)) + 0.5) * stride_f + self.offset;
        let ys = (Tensor::arange(height, (Kind::Float, device)) + 0.5) * stride_f + self.offset;
        let cx = xs.view([1, width]).expand(&[height, width], false).reshape(&[-1]);
        let cy = ys.view([height, 1]).expand(&[height, width], false).reshape(&[-1]);
        let shifts = Tensor::stack(&[&cx, &cy, &cx, &cy], 1);

        let cells = self.cell_anchors(stride, device);
        (shifts.unsqueeze(1) + cells.unsqueeze(0)).view([-1, 4])
    }

    /// Generates anchors for each `[batch, channels, height, width]` feature map.
    pub fn forward(&self, features: &[impl Borrow<Tensor>], strides: &[i64]) -> Result<Vec<Tensor>> {
        ensure!(
            features.len() == strides.len(),
            "the number of features and strides mismatch"
        );
        features
            .iter()
            .zip(strides)
            .map(|(feature, &stride)| -> Result<_> {
                let feature = feature.borrow();
                let (_, _, height, width) = feature.size4()?;
                Ok(self.grid_anchors(height, width, stride, feature.device()))
            })
            .collect()
    }
}
