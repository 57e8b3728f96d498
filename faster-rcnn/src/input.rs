//! Image loading, resizing and batching into model inputs.

use crate::{common::*, model::ModelInput};

/// Loads an image as a `[3, height, width]` uint8 RGB tensor.
pub fn load_image(path: impl AsRef<Path>) -> Result<Tensor> {
    let path = path.as_ref();
    let image = tch::vision::image::load(path)
        .with_context(|| format!("unable to load image '{}'", path.display()))?;
    let (channels, _, _) = image.size3()?;
    ensure!(
        channels == 3,
        "expect 3 channels in image '{}', but get {}",
        path.display(),
        channels
    );
    Ok(image)
}

/// Converts a `[3, height, width]` RGB image to BGR float pixels in 0..255.
pub fn to_bgr_float(image: &Tensor) -> Tensor {
    image.flip(&[0]).to_kind(Kind::Float)
}

/// Resizes images so that the short side meets `short_size` unless the long
/// side exceeds `max_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeShortSide {
    pub short_size: usize,
    pub max_size: usize,
}

impl ResizeShortSide {
    pub fn from_mode(mode: &ModeConfig) -> Self {
        Self {
            short_size: mode.image_short_size,
            max_size: mode.image_max_size,
        }
    }

    pub fn output_size(&self, size: &HW<f64>) -> HW<f64> {
        Rescale::short_side(size, self.short_size as f64, self.max_size as f64).apply_size(size)
    }

    /// Resizes a `[channels, height, width]` image bilinearly, and returns the
    /// scale from the input size to the output size.
    pub fn forward(&self, image: &Tensor) -> Result<(Tensor, Rescale<f64>)> {
        let (_, height, width) = image.size3()?;
        ensure!(height > 0 && width > 0, "cannot resize an empty image");

        let orig_size = HW::from_hw([height as f64, width as f64]);
        let new_size = self.output_size(&orig_size);
        let resized = image
            .to_kind(Kind::Float)
            .unsqueeze(0)
            .f_upsample_bilinear2d(
                &[new_size.h() as i64, new_size.w() as i64],
                false,
                None,
                None,
            )?
            .squeeze_dim(0);

        Ok((resized, Rescale::from_sizes(&orig_size, &new_size)))
    }
}

/// A ground truth box with its 1-based class id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GtBox {
    pub bbox: Xyxy<f64>,
    pub class: usize,
}

/// An image ready for batching.
#[derive(Debug, TensorLike)]
pub struct ImageRecord {
    /// `[3, height, width]` BGR float image after resizing.
    pub image: Tensor,
    /// The size before resizing.
    #[tensor_like(copy)]
    pub orig_size: HW<f64>,
    /// Boxes in resized image coordinates.
    #[tensor_like(clone)]
    pub gt_boxes: Vec<GtBox>,
}

impl ImageRecord {
    /// Loads, converts and resizes an image, and rescales its boxes accordingly.
    pub fn load(path: impl AsRef<Path>, gt_boxes: &[GtBox], resize: &ResizeShortSide) -> Result<Self> {
        let image = to_bgr_float(&load_image(path)?);
        Self::from_image(&image, gt_boxes, resize)
    }

    /// Builds a record from a `[3, height, width]` BGR image and boxes in its coordinates.
    pub fn from_image(image: &Tensor, gt_boxes: &[GtBox], resize: &ResizeShortSide) -> Result<Self> {
        let (_, height, width) = image.size3()?;
        let (image, rescale) = resize.forward(image)?;
        let gt_boxes = gt_boxes
            .iter()
            .map(|gt| GtBox {
                bbox: gt.bbox.rescale(&rescale),
                class: gt.class,
            })
            .collect();

        Ok(Self {
            image,
            orig_size: HW::from_hw([height as f64, width as f64]),
            gt_boxes,
        })
    }

    /// The `(height, width)` after resizing.
    pub fn size(&self) -> HW<f64> {
        let size = self.image.size();
        HW::from_hw([size[1] as f64, size[2] as f64])
    }

    /// Mirrors the image and its boxes horizontally.
    pub fn hflip(&self) -> Self {
        let image_w = self.size().w();
        Self {
            image: self.image.flip(&[2]),
            orig_size: self.orig_size,
            gt_boxes: self
                .gt_boxes
                .iter()
                .map(|gt| GtBox {
                    bbox: gt.bbox.hflip(image_w),
                    class: gt.class,
                })
                .collect(),
        }
    }
}

/// Pads images to the largest size in the batch and packs boxes into a
/// `[batch, max_gt_boxes, 5]` tensor.
pub fn collate(records: &[impl Borrow<ImageRecord>], max_gt_boxes: usize) -> Result<ModelInput> {
    ensure!(!records.is_empty(), "cannot collate an empty batch");
    let records: Vec<&ImageRecord> = records.iter().map(|record| record.borrow()).collect();

    let max_h = records.iter().map(|record| record.size().h() as i64).max().unwrap_or(0);
    let max_w = records.iter().map(|record| record.size().w() as i64).max().unwrap_or(0);

    let images: Vec<_> = records
        .iter()
        .map(|record| record.image.f_pad_to_size(max_h, max_w, 0.0))
        .collect::<Result<_>>()?;
    let image = Tensor::stack(&images, 0);

    let mut im_info = Vec::with_capacity(records.len() * 5);
    let mut gt_values = vec![0f32; records.len() * max_gt_boxes * 5];

    for (index, record) in records.iter().enumerate() {
        if record.gt_boxes.len() > max_gt_boxes {
            warn!(
                "drop {} boxes exceeding the limit of {} boxes per image",
                record.gt_boxes.len() - max_gt_boxes,
                max_gt_boxes
            );
        }
        let num_gt = record.gt_boxes.len().min(max_gt_boxes);
        let size = record.size();
        im_info.extend([
            size.h(),
            size.w(),
            record.orig_size.h(),
            record.orig_size.w(),
            num_gt as f64,
        ]);

        let rows = &mut gt_values[(index * max_gt_boxes * 5)..((index + 1) * max_gt_boxes * 5)];
        rows.chunks_mut(5)
            .zip(&record.gt_boxes)
            .for_each(|(row, gt)| {
                let [x1, y1, x2, y2] = gt.bbox.xyxy();
                row.copy_from_slice(&[
                    x1 as f32,
                    y1 as f32,
                    x2 as f32,
                    y2 as f32,
                    gt.class as f32,
                ]);
            });
    }

    let batch_size = records.len() as i64;
    let im_info = Tensor::of_slice(&im_info)
        .to_kind(Kind::Float)
        .view([batch_size, 5]);
    let gt_boxes = Tensor::of_slice(&gt_values).view([batch_size, max_gt_boxes as i64, 5]);

    Ok(ModelInput {
        image,
        im_info,
        gt_boxes: Some(gt_boxes),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(height: i64, width: i64, gt_boxes: Vec<GtBox>) -> ImageRecord {
        ImageRecord {
            image: Tensor::ones(&[3, height, width], (Kind::Float, Device::Cpu)),
            orig_size: HW::from_hw([height as f64 * 2.0, width as f64 * 2.0]),
            gt_boxes,
        }
    }

    #[test]
    fn resize_short_side_and_cap() -> Result<()> {
        let resize = ResizeShortSide {
            short_size: 800,
            max_size: 1333,
        };

        let image = Tensor::zeros(&[3, 480, 640], (Kind::Float, Device::Cpu));
        let (resized, rescale) = resize.forward(&image)?;
        assert_eq!(resized.size(), vec![3, 800, 1067]);
        assert!((rescale.sy - 800.0 / 480.0).abs() < 1e-9);

        let image = Tensor::zeros(&[3, 100, 1000], (Kind::Float, Device::Cpu));
        let (resized, _) = resize.forward(&image)?;
        assert_eq!(resized.size(), vec![3, 133, 1333]);
        Ok(())
    }

    #[test]
    fn rescale_boxes_with_image() -> Result<()> {
        let resize = ResizeShortSide {
            short_size: 200,
            max_size: 1000,
        };
        let image = Tensor::zeros(&[3, 100, 150], (Kind::Float, Device::Cpu));
        let gt = GtBox {
            bbox: Xyxy::from_xyxy([10.0, 20.0, 30.0, 40.0]),
            class: 3,
        };
        let record = ImageRecord::from_image(&image, &[gt], &resize)?;
        assert_eq!(record.size(), HW::from_hw([200.0, 300.0]));
        assert_eq!(record.orig_size, HW::from_hw([100.0, 150.0]));
        assert_eq!(record.gt_boxes[0].bbox.xyxy(), [20.0, 40.0, 60.0, 80.0]);
        assert_eq!(record.gt_boxes[0].class, 3);
        Ok(())
    }

    #[test]
    fn hflip_mirrors_boxes() {
        let gt = GtBox {
            bbox: Xyxy::from_xyxy([10.0, 0.0, 30.0, 5.0]),
            class: 1,
        };
        let flipped = record(8, 100, vec![gt]).hflip();
        assert_eq!(flipped.gt_boxes[0].bbox.xyxy(), [70.0, 0.0, 90.0, 5.0]);
        assert_eq!(flipped.image.size(), vec![3, 8, 100]);
    }

    #[test]
    fn collate_pads_images_and_boxes() -> Result<()> {
        let gt = GtBox {
            bbox: Xyxy::from_xyxy([1.0, 2.0, 3.0, 4.0]),
            class: 7,
        };
        let records = vec![record(20, 30, vec![gt; 3]), record(25, 10, vec![])];
        let input = collate(&records, 2)?;

        assert_eq!(input.image.size(), vec![2, 3, 25, 30]);
        let im_info: Vec<f32> = Vec::from(&input.im_info.view([-1]));
        assert_eq!(
            im_info,
            vec![20.0, 30.0, 40.0, 60.0, 2.0, 25.0, 10.0, 50.0, 20.0, 0.0]
        );

        let gt_boxes = input.gt_boxes.unwrap();
        assert_eq!(gt_boxes.size(), vec![2, 2, 5]);
        let first: Vec<f32> = Vec::from(&gt_boxes.get(0).get(1));
        assert_eq!(first, vec![1.0, 2.0, 3.0, 4.0, 7.0]);
        assert_eq!(f64::from(gt_boxes.get(1).abs().sum(Kind::Float)), 0.0);
        Ok(())
    }

    #[test]
    fn collate_rejects_empty_batch() {
        let records: Vec<ImageRecord> = vec![];
        assert!(collate(&records, 10).is_err());
    }
}
