//! Turning raw predictions into per-class detections.

use crate::common::*;
use rcnn_config::TestConfig;
use tch_goodies::batched_nms;

/// Raw predictions for one image in original image coordinates.
#[derive(Debug, TensorLike)]
pub struct InferenceOutput {
    /// `[num_rois, num_classes]` foreground probabilities.
    pub pred_scores: Tensor,
    /// `[num_rois, num_classes, 4]` per-class boxes.
    pub pred_boxes: Tensor,
}

#[derive(Debug, Clone)]
pub struct DetectionPostProcessInit {
    pub score_threshold: f64,
    pub nms_threshold: f64,
    pub max_detections: usize,
}

impl DetectionPostProcessInit {
    pub fn from_config(config: &TestConfig) -> Self {
        Self {
            score_threshold: config.test_cls_threshold.raw(),
            nms_threshold: config.test_nms.raw(),
            max_detections: config.test_max_boxes_per_image,
        }
    }

    pub fn build(self) -> Result<DetectionPostProcess> {
        let Self {
            score_threshold,
            nms_threshold,
            max_detections,
        } = self;
        ensure!(
            (0.0..=1.0).contains(&score_threshold),
            "score_threshold must be in range [0, 1]"
        );
        ensure!(
            (0.0..=1.0).contains(&nms_threshold),
            "nms_threshold must be in range [0, 1]"
        );

        Ok(DetectionPostProcess {
            score_threshold,
            nms_threshold,
            max_detections,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DetectionPostProcess {
    score_threshold: f64,
    nms_threshold: f64,
    max_detections: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// 1-based class id.
    pub class: usize,
    pub score: f32,
    pub bbox: Xyxy<f32>,
}

impl DetectionPostProcess {
    /// Returns detections sorted by descending score.
    pub fn forward(&self, output: &InferenceOutput) -> Result<Vec<Detection>> {
        let InferenceOutput {
            pred_scores,
            pred_boxes,
        } = output;
        let (num_rois, num_classes) = pred_scores.size2()?;
        ensure!(
            pred_boxes.size() == [num_rois, num_classes, 4],
            "pred_boxes shape {:?} does not match pred_scores shape {:?}",
            pred_boxes.size(),
            pred_scores.size()
        );

        tch::no_grad(|| -> Result<_> {
            let scores = pred_scores.reshape(&[-1]);
            let candidates = scores.gt(self.score_threshold).nonzero().view([-1]);
            let scores = scores.index_select(0, &candidates);
            let boxes = XyxyTensor::new(pred_boxes.reshape(&[-1, 4]).index_select(0, &candidates))?;
            let classes = candidates.fmod(num_classes);

            let keep = batched_nms(&boxes, &scores, &classes, self.nms_threshold)?;
            let keep = keep.narrow(0, 0, (self.max_detections as i64).min(keep.size1()?));

            let scores: Vec<f32> = Vec::from(&scores.index_select(0, &keep).to_device(Device::Cpu));
            let classes: Vec<i64> = Vec::from(&classes.index_select(0, &keep).to_device(Device::Cpu));
            let boxes: Vec<f32> = Vec::from(
                &boxes
                    .index_select(&keep)
                    .tensor()
                    .to_kind(Kind::Float)
                    .to_device(Device::Cpu)
                    .view([-1]),
            );

            let detections = izip!(scores, classes, boxes.chunks(4))
                .filter_map(|(score, class, coords)| {
                    let bbox = Xyxy::try_from_xyxy([coords[0], coords[1], coords[2], coords[3]]).ok()?;
                    Some(Detection {
                        class: class as usize + 1,
                        score,
                        bbox,
                    })
                })
                .collect();
            Ok(detections)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post_process(max_detections: usize) -> DetectionPostProcess {
        DetectionPostProcessInit {
            score_threshold: 0.05,
            nms_threshold: 0.5,
            max_detections,
        }
        .build()
        .unwrap()
    }

    /// Two rois by two classes. Both rois overlap heavily.
    fn output() -> InferenceOutput {
        let pred_scores = Tensor::of_slice(&[
            0.9f32, 0.01, //
            0.8, 0.6,
        ])
        .view([2, 2]);
        let pred_boxes = Tensor::of_slice(&[
            0.0f32, 0.0, 10.0, 10.0, 0.0, 0.0, 10.0, 10.0, //
            1.0, 1.0, 11.0, 11.0, 20.0, 20.0, 30.0, 30.0,
        ])
        .view([2, 2, 4]);
        InferenceOutput {
            pred_scores,
            pred_boxes,
        }
    }

    #[test]
    fn suppress_within_classes() -> Result<()> {
        let detections = post_process(100).forward(&output())?;

        // roi 1 of class 1 is suppressed by roi 0, the low score pair is dropped
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].class, 1);
        assert!((detections[0].score - 0.9).abs() < 1e-6);
        assert_eq!(detections[0].bbox, Xyxy::from_xyxy([0.0, 0.0, 10.0, 10.0]));
        assert_eq!(detections[1].class, 2);
        assert!((detections[1].score - 0.6).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn limit_detections() -> Result<()> {
        let detections = post_process(1).forward(&output())?;
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class, 1);
        Ok(())
    }

    #[test]
    fn no_candidates() -> Result<()> {
        let output = InferenceOutput {
            pred_scores: Tensor::zeros(&[3, 2], (Kind::Float, Device::Cpu)),
            pred_boxes: Tensor::zeros(&[3, 2, 4], (Kind::Float, Device::Cpu)),
        };
        assert!(post_process(100).forward(&output)?.is_empty());
        Ok(())
    }
}
