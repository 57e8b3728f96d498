//! The detector network and its components.

pub mod backbone;
pub mod faster_rcnn;
pub mod fpn;
pub mod pooler;
pub mod rcnn;
pub mod rpn;

pub use backbone::*;
pub use faster_rcnn::*;
pub use fpn::*;
pub use pooler::*;
pub use rcnn::*;
pub use rpn::*;

use crate::common::*;

/// The valid ground truth of one image.
#[derive(Debug)]
pub(crate) struct GroundTruth {
    pub boxes: XyxyTensor,
    /// `[num_gt]` 1-based class ids.
    pub classes: Tensor,
}

/// Takes the first `im_info[index, 4]` rows of the padded `[batch, max_gt, 5]` gt tensor.
pub(crate) fn ground_truth(gt_boxes: &Tensor, im_info: &Tensor, index: i64) -> Result<GroundTruth> {
    let (batch_size, max_gt, num_cols) = gt_boxes.size3()?;
    ensure!(num_cols == 5, "gt_boxes must be a [batch, max_gt, 5] tensor");
    ensure!(
        (0..batch_size).contains(&index),
        "image index {} is out of range",
        index
    );

    let num_gt = (im_info.double_value(&[index, 4]) as i64).clamp(0, max_gt);
    let rows = gt_boxes.get(index).narrow(0, 0, num_gt);
    Ok(GroundTruth {
        boxes: XyxyTensor::new(rows.narrow(1, 0, 4).to_kind(Kind::Float))?,
        classes: rows.select(1, 4).to_kind(Kind::Int64),
    })
}

/// The `(height, width)` of the resized image before padding.
pub(crate) fn image_size(im_info: &Tensor, index: i64) -> (f64, f64) {
    (
        im_info.double_value(&[index, 0]),
        im_info.double_value(&[index, 1]),
    )
}

/// Picks the named features in order.
pub(crate) fn select_features(
    features: &IndexMap<String, Tensor>,
    names: &[String],
) -> Result<Vec<Tensor>> {
    names
        .iter()
        .map(|name| {
            features
                .get(name)
                .map(|feature| feature.shallow_clone())
                .ok_or_else(|| format_err!("feature '{}' is missing", name))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ground_truth_takes_valid_rows() -> Result<()> {
        let gt_boxes = Tensor::zeros(&[2, 4, 5], (Kind::Float, Device::Cpu));
        let _ = gt_boxes
            .get(1)
            .get(0)
            .copy_(&Tensor::of_slice(&[1.0f32, 2.0, 30.0, 40.0, 3.0]));
        let im_info = Tensor::of_slice(&[
            100.0f32, 100.0, 100.0, 100.0, 0.0, //
            100.0, 100.0, 100.0, 100.0, 1.0,
        ])
        .view([2, 5]);

        assert!(ground_truth(&gt_boxes, &im_info, 0)?.boxes.is_empty());

        let gt = ground_truth(&gt_boxes, &im_info, 1)?;
        assert_eq!(gt.boxes.num_boxes(), 1);
        let classes: Vec<i64> = Vec::from(&gt.classes);
        assert_eq!(classes, vec![3]);

        assert!(ground_truth(&gt_boxes, &im_info, 2).is_err());
        Ok(())
    }
}
