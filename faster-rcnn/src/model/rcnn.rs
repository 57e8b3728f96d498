//! Second-stage box head refining proposals into class scores and boxes.

use super::{ground_truth, select_features, RoiPooler, RoiPoolerInit};
use crate::{
    box_coder::BoxCoder,
    common::*,
    matching::{sample_labels, MatchOutput, Matcher, MatcherInit, SampledIndexes},
};
use tch_goodies::PoolingMethod;
use tch_modules::{CrossEntropyLoss, SmoothL1Loss, SmoothL1LossInit};

#[derive(Debug, Clone)]
pub struct RcnnInit {
    pub in_channels: i64,
    pub in_features: Vec<String>,
    pub strides: Vec<i64>,
    pub pooling_method: PoolingMethod,
    pub pooling_size: [i64; 2],
    pub fc_channels: i64,
    /// The number of foreground classes.
    pub num_classes: i64,
    pub class_aware_box: bool,
    pub matcher: MatcherInit,
    pub num_rois: i64,
    pub fg_ratio: f64,
    pub box_coder: BoxCoder,
    pub smooth_l1_beta: f64,
}

impl RcnnInit {
    pub fn from_config(config: &FasterRcnnConfig, in_channels: i64) -> Result<Self> {
        let rcnn = &config.rcnn;
        let [ph, pw] = rcnn.pooling_size;

        Ok(Self {
            in_channels,
            in_features: rcnn.rcnn_in_features.clone(),
            strides: rcnn.rcnn_stride.iter().map(|&stride| stride as i64).collect(),
            pooling_method: rcnn.pooling_method,
            pooling_size: [ph as i64, pw as i64],
            fc_channels: rcnn.rcnn_fc_channels as i64,
            num_classes: config.data.num_classes as i64,
            class_aware_box: rcnn.class_aware_box,
            matcher: MatcherInit {
                positive_threshold: rcnn.fg_threshold.raw(),
                negative_high: rcnn.bg_threshold_high.raw(),
                negative_low: rcnn.bg_threshold_low.raw(),
                ignore_label: -1,
                allow_low_quality: false,
            },
            num_rois: rcnn.num_rois as i64,
            fg_ratio: rcnn.fg_ratio.raw(),
            box_coder: BoxCoder::from_config(&config.box_coder)?,
            smooth_l1_beta: config.loss.rcnn_smooth_l1_beta.raw(),
        })
    }

    pub fn build<'p, P>(self, path: P) -> Result<Rcnn>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            in_channels,
            in_features,
            strides,
            pooling_method,
            pooling_size,
            fc_channels,
            num_classes,
            class_aware_box,
            matcher,
            num_rois,
            fg_ratio,
            box_coder,
            smooth_l1_beta,
        } = self;

        ensure!(num_classes > 0, "num_classes must be positive");
        ensure!(
            in_features.len() == strides.len(),
            "in_features and strides must have equal length"
        );

        let pooler = RoiPoolerInit::new(strides, pooling_size, pooling_method).build()?;
        let [ph, pw] = pooling_size;

        let hidden_config = nn::LinearConfig {
            ws_init: nn::Init::KaimingUniform,
            bs_init: Some(nn::Init::Const(0.0)),
            bias: true,
        };
        let fc1 = nn::linear(
            path / "fc1",
            in_channels * ph * pw,
            fc_channels,
            hidden_config,
        );
        let fc2 = nn::linear(path / "fc2", fc_channels, fc_channels, hidden_config);

        let pred_cls = nn::linear(
            path / "pred_cls",
            fc_channels,
            num_classes + 1,
            nn::LinearConfig {
                ws_init: nn::Init::Randn {
                    mean: 0.0,
                    stdev: 0.01,
                },
                ..hidden_config
            },
        );
        let pred_delta = nn::linear(
            path / "pred_delta",
            fc_channels,
            if class_aware_box { num_classes * 4 } else { 4 },
            nn::LinearConfig {
                ws_init: nn::Init::Randn {
                    mean: 0.0,
                    stdev: 0.001,
                },
                ..hidden_config
            },
        );

        Ok(Rcnn {
            in_features,
            pooler,
            fc1,
            fc2,
            pred_cls,
            pred_delta,
            num_classes,
            class_aware_box,
            matcher: matcher.build()?,
            num_rois,
            fg_ratio,
            box_coder,
            cls_loss: CrossEntropyLoss::new(Reduction::Mean),
            loc_loss: SmoothL1LossInit {
                beta: smooth_l1_beta,
                reduction: Reduction::Sum,
            }
            .build()?,
        })
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct Rcnn {
    in_features: Vec<String>,
    pooler: RoiPooler,
    #[derivative(Debug = "ignore")]
    fc1: nn::Linear,
    #[derivative(Debug = "ignore")]
    fc2: nn::Linear,
    #[derivative(Debug = "ignore")]
    pred_cls: nn::Linear,
    #[derivative(Debug = "ignore")]
    pred_delta: nn::Linear,
    num_classes: i64,
    class_aware_box: bool,
    matcher: Matcher,
    num_rois: i64,
    fg_ratio: f64,
    box_coder: BoxCoder,
    cls_loss: CrossEntropyLoss,
    loc_loss: SmoothL1Loss,
}

#[derive(Debug, TensorLike)]
pub struct RcnnLosses {
    pub rcnn_cls: Tensor,
    pub rcnn_loc: Tensor,
}

#[derive(Debug, TensorLike)]
pub struct RcnnPrediction {
    /// `[num_rois, num_classes * 4]` decoded boxes.
    pub boxes: Tensor,
    /// `[num_rois, num_classes]` foreground probabilities.
    pub scores: Tensor,
}

/// Sampled ROIs and their training targets.
#[derive(Debug, TensorLike)]
struct RoiTargets {
    rois: Tensor,
    labels: Tensor,
    /// Regression targets of foreground ROIs, in the order they appear in `rois`.
    deltas: Tensor,
}

impl Rcnn {
    pub fn num_classes(&self) -> i64 {
        self.num_classes
    }

    pub fn forward_train(
        &self,
        features: &IndexMap<String, Tensor>,
        rois: &Tensor,
        im_info: &Tensor,
        gt_boxes: &Tensor,
    ) -> Result<RcnnLosses> {
        let features = select_features(features, &self.in_features)?;
        let RoiTargets {
            rois,
            labels,
            deltas: target_deltas,
        } = self.sample_targets(rois, im_info, gt_boxes)?;

        let (cls_logits, pred_deltas) = self.head(&features, &rois)?;
        let rcnn_cls = self.cls_loss.forward(&cls_logits, &labels);

        let fg_indexes = labels.gt(0).nonzero().view([-1]);
        let num_fg = fg_indexes.size1()?;
        let pred_deltas = pred_deltas.index_select(0, &fg_indexes);
        let pred_deltas = if self.class_aware_box {
            let class_indexes = (labels.index_select(0, &fg_indexes) - 1)
                .view([num_fg, 1, 1])
                .expand(&[num_fg, 1, 4], false);
            pred_deltas
                .view([num_fg, self.num_classes, 4])
                .gather(1, &class_indexes, false)
                .squeeze_dim(1)
        } else {
            pred_deltas
        };

        let num_sampled = labels.size1()?;
        let rcnn_loc =
            self.loc_loss.forward(&pred_deltas, &target_deltas) / num_sampled.max(1) as f64;

        Ok(RcnnLosses { rcnn_cls, rcnn_loc })
    }

    pub fn inference(
        &self,
        features: &IndexMap<String, Tensor>,
        rois: &Tensor,
    ) -> Result<RcnnPrediction> {
        let features = select_features(features, &self.in_features)?;
        let (cls_logits, deltas) = self.head(&features, rois)?;

        let scores = cls_logits
            .softmax(1, Kind::Float)
            .narrow(1, 1, self.num_classes);
        let deltas = if self.class_aware_box {
            deltas
        } else {
            deltas.repeat(&[1, self.num_classes])
        };
        let proposals = XyxyTensor::new(rois.narrow(1, 1, 4))?;
        let boxes = self.box_coder.decode(&proposals, &deltas)?;

        Ok(RcnnPrediction { boxes, scores })
    }

    fn head(&self, features: &[Tensor], rois: &Tensor) -> Result<(Tensor, Tensor)> {
        let xs = self
            .pooler
            .forward(features, rois)?
            .flatten(1, -1)
            .apply(&self.fc1)
            .relu()
            .apply(&self.fc2)
            .relu();
        Ok((xs.apply(&self.pred_cls), xs.apply(&self.pred_delta)))
    }

    /// Appends gt to the proposals of each image, then samples foreground and
    /// background ROIs with their labels and regression targets.
    fn sample_targets(&self, rois: &Tensor, im_info: &Tensor, gt_boxes: &Tensor) -> Result<RoiTargets> {
        let (batch_size, _, _) = gt_boxes.size3()?;
        let device = rois.device();

        tch::no_grad(|| -> Result<_> {
            let mut sampled_rois = vec![];
            let mut sampled_labels = vec![];
            let mut target_deltas = vec![];

            for index in 0..batch_size {
                let gt = ground_truth(gt_boxes, im_info, index)?;
                let image_rois = rois.index_select(
                    0,
                    &rois.select(1, 0).eq(index as f64).nonzero().view([-1]),
                );
                let proposals = XyxyTensor::new(image_rois.narrow(1, 1, 4))?;
                let candidates = XyxyTensor::cat(&[&proposals, &gt.boxes]);

                let iou = gt.boxes.pairwise_iou(&candidates);
                let MatchOutput {
                    matched_indexes,
                    labels,
                } = self.matcher.forward(&iou)?;
                let SampledIndexes { positive, negative } =
                    sample_labels(&labels, self.num_rois, self.fg_ratio)?;

                let fg_gt_indexes = matched_indexes.index_select(0, &positive);
                let fg_boxes = candidates.index_select(&positive);
                let bg_boxes = candidates.index_select(&negative);
                target_deltas.push(
                    self.box_coder
                        .encode(&fg_boxes, &gt.boxes.index_select(&fg_gt_indexes)),
                );

                let labels = Tensor::cat(
                    &[
                        gt.classes.index_select(0, &fg_gt_indexes),
                        Tensor::zeros(&[negative.size1()?], (Kind::Int64, device)),
                    ],
                    0,
                );
                let boxes = XyxyTensor::cat(&[fg_boxes, bg_boxes]);
                let batch_indexes = Tensor::full(
                    &[boxes.num_boxes(), 1],
                    index as f64,
                    (Kind::Float, device),
                );
                sampled_rois.push(Tensor::cat(&[batch_indexes, boxes.into_tensor()], 1));
                sampled_labels.push(labels);
            }

            Ok(RoiTargets {
                rois: Tensor::cat(&sampled_rois, 0),
                labels: Tensor::cat(&sampled_labels, 0),
                deltas: Tensor::cat(&target_deltas, 0),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_rcnn(root: &nn::Path, class_aware_box: bool) -> Result<Rcnn> {
        let mut config = FasterRcnnConfig::default();
        config.data.num_classes = 3;
        config.rcnn.class_aware_box = class_aware_box;
        RcnnInit {
            fc_channels: 32,
            ..RcnnInit::from_config(&config, 8)?
        }
        .build(root / "rcnn")
    }

    /// p2..p5 features of a 64x64 image.
    fn pyramid() -> IndexMap<String, Tensor> {
        [("p2", 16), ("p3", 8), ("p4", 4), ("p5", 2)]
            .iter()
            .map(|&(name, size)| {
                let feature = Tensor::randn(&[1, 8, size, size], (Kind::Float, Device::Cpu));
                (name.to_string(), feature)
            })
            .collect()
    }

    fn proposals() -> Tensor {
        Tensor::of_slice(&[
            0.0f32, 4.0, 4.0, 30.0, 30.0, //
            0.0, 10.0, 10.0, 50.0, 50.0, //
            0.0, 40.0, 40.0, 60.0, 60.0,
        ])
        .view([3, 5])
    }

    #[test]
    fn rcnn_train_losses() -> Result<()> {
        for class_aware_box in [true, false] {
            let vs = nn::VarStore::new(Device::Cpu);
            let rcnn = small_rcnn(&vs.root(), class_aware_box)?;

            let im_info = Tensor::of_slice(&[64.0f32, 64.0, 64.0, 64.0, 1.0]).view([1, 5]);
            let gt_boxes = Tensor::of_slice(&[8.0f32, 8.0, 40.0, 40.0, 2.0]).view([1, 1, 5]);
            let losses = rcnn.forward_train(&pyramid(), &proposals(), &im_info, &gt_boxes)?;

            let rcnn_cls = f64::from(&losses.rcnn_cls);
            let rcnn_loc = f64::from(&losses.rcnn_loc);
            assert!(rcnn_cls.is_finite() && rcnn_cls > 0.0);
            assert!(rcnn_loc.is_finite() && rcnn_loc >= 0.0);
            assert!(losses.rcnn_cls.requires_grad());
        }
        Ok(())
    }

    #[test]
    fn rcnn_samples_appended_gt() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let rcnn = small_rcnn(&vs.root(), true)?;

        let im_info = Tensor::of_slice(&[64.0f32, 64.0, 64.0, 64.0, 1.0]).view([1, 5]);
        let gt_boxes = Tensor::of_slice(&[8.0f32, 8.0, 40.0, 40.0, 2.0]).view([1, 1, 5]);
        let empty_rois = Tensor::zeros(&[0, 5], (Kind::Float, Device::Cpu));
        let targets = rcnn.sample_targets(&empty_rois, &im_info, &gt_boxes)?;

        // the gt box itself is the only candidate
        let labels: Vec<i64> = Vec::from(&targets.labels);
        assert_eq!(labels, vec![2]);
        assert_eq!(targets.deltas.size(), vec![1, 4]);
        assert!(f64::from(targets.deltas.abs().max()) < 1e-5);
        Ok(())
    }

    #[test]
    fn rcnn_inference_shapes() -> Result<()> {
        for class_aware_box in [true, false] {
            let vs = nn::VarStore::new(Device::Cpu);
            let rcnn = small_rcnn(&vs.root(), class_aware_box)?;

            let prediction = tch::no_grad(|| rcnn.inference(&pyramid(), &proposals()))?;
            assert_eq!(prediction.boxes.size(), vec![3, 12]);
            assert_eq!(prediction.scores.size(), vec![3, 3]);

            // background takes the remaining probability
            let row_sums: Vec<f32> = Vec::from(&prediction.scores.sum_dim_intlist(&[1], false, Kind::Float));
            assert!(row_sums.iter().all(|&sum| sum > 0.0 && sum < 1.0));
        }
        Ok(())
    }
}
