use crate::{boxes::XyxyTensor, common::*};

/// The number of IoU rows computed at once.
const NMS_CHUNK_SIZE: i64 = 512;

/// Greedy non-maximum suppression.
///
/// Device memory is bounded by `NMS_CHUNK_SIZE` rows of the IoU matrix.
///
/// Returns the indexes of kept boxes in `[num_kept]` shape, ordered by descending score.
pub fn nms(boxes: &XyxyTensor, scores: &Tensor, iou_threshold: f64) -> Result<Tensor> {
    tch::no_grad(|| -> Result<_> {
        let num_boxes = boxes.num_boxes();
        let num_scores = scores
            .size1()
            .map_err(|_| format_err!("scores should be a 1d tensor"))?;
        ensure!(
            num_boxes == num_scores,
            "boxes and scores should have same number of elements in dimension 0"
        );
        let device = boxes.device();

        if num_boxes == 0 {
            return Ok(Tensor::zeros(&[0], (Kind::Int64, device)));
        }

        let order = scores.argsort(0, /* descending = */ true);
        let sorted = boxes.index_select(&order).into_tensor();
        let order: Vec<i64> = Vec::from(&order.to_device(Device::Cpu));

        let mut suppressed = vec![false; num_boxes as usize];
        let mut keep: Vec<i64> = vec![];

        // IoU rows are computed on device in bounded chunks against the boxes that
        // follow the chunk, and only the thresholded mask is copied to host
        for chunk_start in (0..num_boxes).step_by(NMS_CHUNK_SIZE as usize) {
            let chunk_len = NMS_CHUNK_SIZE.min(num_boxes - chunk_start);
            let first = chunk_start as usize;
            let last = first + chunk_len as usize;
            if suppressed[first..last].iter().all(|&flag| flag) {
                continue;
            }

            let num_cols = num_boxes - chunk_start;
            let rows = XyxyTensor::new(sorted.narrow(0, chunk_start, chunk_len))?;
            let cols = XyxyTensor::new(sorted.narrow(0, chunk_start, num_cols))?;
            let mask: Vec<u8> = Vec::from(
                &rows
                    .pairwise_iou(&cols)
                    .gt(iou_threshold)
                    .to_kind(Kind::Uint8)
                    .to_device(Device::Cpu)
                    .view([-1]),
            );
            let num_cols = num_cols as usize;

            for row in 0..(chunk_len as usize) {
                let li = first + row;
                if suppressed[li] {
                    continue;
                }
                keep.push(order[li]);
                let row_mask = &mask[(row * num_cols)..((row + 1) * num_cols)];

                for col in (row + 1)..num_cols {
                    if row_mask[col] != 0 {
                        suppressed[first + col] = true;
                    }
                }
            }
        }

        Ok(Tensor::of_slice(&keep)
            .set_requires_grad(false)
            .to_device(device))
    })
}

/// Non-maximum suppression applied independently within each group.
///
/// Boxes of different groups never suppress each other. It shifts each group into
/// a disjoint coordinate range and runs a single [nms] pass.
pub fn batched_nms(
    boxes: &XyxyTensor,
    scores: &Tensor,
    groups: &Tensor,
    iou_threshold: f64,
) -> Result<Tensor> {
    tch::no_grad(|| -> Result<_> {
        if boxes.is_empty() {
            return nms(boxes, scores, iou_threshold);
        }
        ensure!(
            groups.size1()? == boxes.num_boxes(),
            "groups and boxes should have same number of elements in dimension 0"
        );

        let max_coordinate = f64::from(boxes.tensor().max());
        let offsets = groups.to_kind(Kind::Float) * (max_coordinate + 1.0);
        let shifted = XyxyTensor::new(boxes.tensor() + offsets.unsqueeze(1))?;
        nms(&shifted, scores, iou_threshold)
    })
}
