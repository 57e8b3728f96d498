//! Region proposal network.

use super::{ground_truth, image_size, select_features};
use crate::{
    anchor::{AnchorGenerator, AnchorGeneratorInit},
    box_coder::BoxCoder,
    common::*,
    matching::{sample_labels, MatchOutput, Matcher, MatcherInit, SampledIndexes},
};
use tch_goodies::batched_nms;
use tch_modules::{BceWithLogitsLoss, BceWithLogitsLossInit, SmoothL1Loss, SmoothL1LossInit};

#[derive(Debug, Clone)]
pub struct RpnInit {
    pub in_channels: i64,
    pub in_features: Vec<String>,
    pub strides: Vec<i64>,
    pub channels: i64,
    pub anchor: AnchorGeneratorInit,
    pub nms_threshold: f64,
    pub matcher: MatcherInit,
    pub num_sample_anchors: i64,
    pub positive_fraction: f64,
    pub smooth_l1_beta: f64,
    pub train_mode: ModeConfig,
    pub test_mode: ModeConfig,
}

impl RpnInit {
    pub fn from_config(config: &FasterRcnnConfig, in_channels: i64) -> Self {
        let rpn = &config.rpn;

        Self {
            in_channels,
            in_features: rpn.rpn_in_features.clone(),
            strides: rpn.rpn_stride.iter().map(|&stride| stride as i64).collect(),
            channels: rpn.rpn_channel as i64,
            anchor: AnchorGeneratorInit::from_config(&config.anchor),
            nms_threshold: rpn.rpn_nms_threshold.raw(),
            matcher: MatcherInit {
                positive_threshold: rpn.rpn_positive_overlap.raw(),
                negative_high: rpn.rpn_negative_overlap.raw(),
                negative_low: 0.0,
                ignore_label: rpn.ignore_label,
                allow_low_quality: rpn.allow_low_quality,
            },
            num_sample_anchors: rpn.num_sample_anchors as i64,
            positive_fraction: rpn.positive_anchor_ratio.raw(),
            smooth_l1_beta: config.loss.rpn_smooth_l1_beta.raw(),
            train_mode: config.mode(true),
            test_mode: config.mode(false),
        }
    }

    pub fn build<'p, P>(self, path: P) -> Result<Rpn>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            in_channels,
            in_features,
            strides,
            channels,
            anchor,
            nms_threshold,
            matcher,
            num_sample_anchors,
            positive_fraction,
            smooth_l1_beta,
            train_mode,
            test_mode,
        } = self;

        ensure!(!in_features.is_empty(), "in_features must not be empty");
        ensure!(
            in_features.len() == strides.len(),
            "in_features and strides must have equal length"
        );
        ensure!(
            (0.0..=1.0).contains(&nms_threshold),
            "nms_threshold must be in range [0, 1]"
        );

        let anchor_generator = anchor.build()?;
        let num_cell_anchors = anchor_generator.num_cell_anchors();

        let conv_config = nn::ConvConfig {
            ws_init: nn::Init::Randn {
                mean: 0.0,
                stdev: 0.01,
            },
            bs_init: nn::Init::Const(0.0),
            ..Default::default()
        };
        let conv = nn::conv2d(
            path / "rpn_conv",
            in_channels,
            channels,
            3,
            nn::ConvConfig {
                padding: 1,
                ..conv_config
            },
        );
        let objectness = nn::conv2d(
            path / "rpn_cls_score",
            channels,
            num_cell_anchors,
            1,
            conv_config,
        );
        let deltas = nn::conv2d(
            path / "rpn_bbox_offsets",
            channels,
            num_cell_anchors * 4,
            1,
            conv_config,
        );

        Ok(Rpn {
            in_features,
            strides,
            conv,
            objectness,
            deltas,
            anchor_generator,
            box_coder: BoxCoder::identity(),
            nms_threshold,
            matcher: matcher.build()?,
            num_sample_anchors,
            positive_fraction,
            cls_loss: BceWithLogitsLossInit::default(Reduction::Mean).build(),
            loc_loss: SmoothL1LossInit {
                beta: smooth_l1_beta,
                reduction: Reduction::Sum,
            }
            .build()?,
            train_mode,
            test_mode,
        })
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct Rpn {
    in_features: Vec<String>,
    strides: Vec<i64>,
    #[derivative(Debug = "ignore")]
    conv: nn::Conv2D,
    #[derivative(Debug = "ignore")]
    objectness: nn::Conv2D,
    #[derivative(Debug = "ignore")]
    deltas: nn::Conv2D,
    anchor_generator: AnchorGenerator,
    box_coder: BoxCoder,
    nms_threshold: f64,
    matcher: Matcher,
    num_sample_anchors: i64,
    positive_fraction: f64,
    cls_loss: BceWithLogitsLoss,
    loc_loss: SmoothL1Loss,
    train_mode: ModeConfig,
    test_mode: ModeConfig,
}

#[derive(Debug, TensorLike)]
pub struct RpnLosses {
    pub rpn_cls: Tensor,
    pub rpn_loc: Tensor,
}

#[derive(Debug)]
pub struct RpnOutput {
    /// `[num_rois, 5]` proposals with `(batch_index, x1, y1, x2, y2)` rows.
    pub rois: Tensor,
    /// Present in training.
    pub losses: Option<RpnLosses>,
}

impl Rpn {
    pub fn forward_t(
        &self,
        features: &IndexMap<String, Tensor>,
        im_info: &Tensor,
        gt_boxes: Option<&Tensor>,
        train: bool,
    ) -> Result<RpnOutput> {
        let features = select_features(features, &self.in_features)?;
        let batch_size = features[0].size()[0];

        // logits in [batch, h * w * a], deltas in [batch, h * w * a, 4]
        let (logits, deltas): (Vec<_>, Vec<_>) = features
            .iter()
            .map(|feature| -> Result<_> {
                let (batch_size, _, height, width) = feature.size4()?;
                let xs = feature.apply(&self.conv).relu();
                let logits = xs
                    .apply(&self.objectness)
                    .permute(&[0, 2, 3, 1])
                    .reshape(&[batch_size, -1]);
                let deltas = xs
                    .apply(&self.deltas)
                    .view([batch_size, -1, 4, height, width])
                    .permute(&[0, 3, 4, 1, 2])
                    .reshape(&[batch_size, -1, 4]);
                Ok((logits, deltas))
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .unzip();

        let anchors = self.anchor_generator.forward(&features, &self.strides)?;

        let mode = if train {
            &self.train_mode
        } else {
            &self.test_mode
        };
        let rois = self.propose(&logits, &deltas, &anchors, im_info, batch_size, mode)?;

        let losses = if train {
            let gt_boxes =
                gt_boxes.ok_or_else(|| format_err!("ground truth is required in training"))?;
            Some(self.losses(&logits, &deltas, &anchors, im_info, gt_boxes)?)
        } else {
            None
        };

        Ok(RpnOutput { rois, losses })
    }

    fn propose(
        &self,
        logits: &[Tensor],
        deltas: &[Tensor],
        anchors: &[Tensor],
        im_info: &Tensor,
        batch_size: i64,
        mode: &ModeConfig,
    ) -> Result<Tensor> {
        let prev_nms_top_n = mode.prev_nms_top_n as i64;
        let post_nms_top_n = mode.post_nms_top_n as i64;

        tch::no_grad(|| -> Result<_> {
            let rois: Vec<_> = (0..batch_size)
                .map(|index| -> Result<_> {
                    let (height, width) = image_size(im_info, index);

                    let mut level_boxes = vec![];
                    let mut level_scores = vec![];
                    let mut level_ids = vec![];

                    for (level, (logits, deltas, anchors)) in
                        izip!(logits, deltas, anchors).enumerate()
                    {
                        let scores = logits.get(index);
                        let num_anchors = scores.size1()?;
                        let (scores, order) =
                            scores.topk(prev_nms_top_n.min(num_anchors), 0, true, true);

                        let anchors = XyxyTensor::new(anchors.index_select(0, &order))?;
                        let deltas = deltas.get(index).index_select(0, &order);
                        let boxes = XyxyTensor::new(self.box_coder.decode(&anchors, &deltas)?)?
                            .clip(height, width);

                        let keep = boxes.nonempty(0.0).nonzero().view([-1]);
                        let boxes = boxes.index_select(&keep);
                        let scores = scores.index_select(0, &keep);
                        let ids = Tensor::full(
                            &[boxes.num_boxes()],
                            level as i64,
                            (Kind::Int64, scores.device()),
                        );

                        level_boxes.push(boxes);
                        level_scores.push(scores);
                        level_ids.push(ids);
                    }

                    let boxes = XyxyTensor::cat(&level_boxes);
                    let scores = Tensor::cat(&level_scores, 0);
                    let ids = Tensor::cat(&level_ids, 0);

                    let keep = batched_nms(&boxes, &scores, &ids, self.nms_threshold)?;
                    let keep = keep.narrow(0, 0, post_nms_top_n.min(keep.size1()?));
                    let boxes = boxes.index_select(&keep);

                    let batch_indexes = Tensor::full(
                        &[boxes.num_boxes(), 1],
                        index as f64,
                        (Kind::Float, boxes.device()),
                    );
                    Ok(Tensor::cat(&[batch_indexes, boxes.into_tensor()], 1))
                })
                .collect::<Result<_>>()?;

            Ok(Tensor::cat(&rois, 0))
        })
    }

    fn losses(
        &self,
        logits: &[Tensor],
        deltas: &[Tensor],
        anchors: &[Tensor],
        im_info: &Tensor,
        gt_boxes: &Tensor,
    ) -> Result<RpnLosses> {
        let logits = Tensor::cat(logits, 1);
        let deltas = Tensor::cat(deltas, 1);
        let anchors = XyxyTensor::new(Tensor::cat(anchors, 0))?;
        let (batch_size, _) = logits.size2()?;
        let device = logits.device();

        let mut pred_logits = vec![];
        let mut target_labels = vec![];
        let mut pred_deltas = vec![];
        let mut target_deltas = vec![];
        let mut num_sampled = 0;

        for index in 0..batch_size {
            let gt = ground_truth(gt_boxes, im_info, index)?;

            let (matched_indexes, sampled) = tch::no_grad(|| -> Result<_> {
                let iou = gt.boxes.pairwise_iou(&anchors);
                let MatchOutput {
                    matched_indexes,
                    labels,
                } = self.matcher.forward(&iou)?;
                let sampled =
                    sample_labels(&labels, self.num_sample_anchors, self.positive_fraction)?;
                Ok((matched_indexes, sampled))
            })?;
            num_sampled += sampled.num_sampled();
            let SampledIndexes { positive, negative } = sampled;

            let indexes = Tensor::cat(&[&positive, &negative], 0);
            let labels = Tensor::cat(
                &[
                    Tensor::ones(&[positive.size1()?], (Kind::Float, device)),
                    Tensor::zeros(&[negative.size1()?], (Kind::Float, device)),
                ],
                0,
            );
            pred_logits.push(logits.get(index).index_select(0, &indexes));
            target_labels.push(labels);

            let matched_gt = gt
                .boxes
                .index_select(&matched_indexes.index_select(0, &positive));
            let positive_anchors = anchors.index_select(&positive);
            target_deltas.push(self.box_coder.encode(&positive_anchors, &matched_gt));
            pred_deltas.push(deltas.get(index).index_select(0, &positive));
        }

        let rpn_cls = self.cls_loss.forward(
            &Tensor::cat(&pred_logits, 0),
            &Tensor::cat(&target_labels, 0),
        );
        let rpn_loc = self.loc_loss.forward(
            &Tensor::cat(&pred_deltas, 0),
            &Tensor::cat(&target_deltas, 0),
        ) / num_sampled.max(1) as f64;

        Ok(RpnLosses { rpn_cls, rpn_loc })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_rpn(root: &nn::Path) -> Result<Rpn> {
        let config = FasterRcnnConfig::default();
        RpnInit {
            channels: 16,
            ..RpnInit::from_config(&config, 8)
        }
        .build(root / "rpn")
    }

    /// p2..p6 features of a 64x64 image.
    fn pyramid(batch_size: i64) -> IndexMap<String, Tensor> {
        [("p2", 16), ("p3", 8), ("p4", 4), ("p5", 2), ("p6", 1)]
            .iter()
            .map(|&(name, size)| {
                let feature = Tensor::randn(&[batch_size, 8, size, size], (Kind::Float, Device::Cpu));
                (name.to_string(), feature)
            })
            .collect()
    }

    fn image_info(batch_size: i64, num_gt: f32) -> Tensor {
        Tensor::of_slice(&[64.0f32, 64.0, 64.0, 64.0, num_gt])
            .view([1, 5])
            .repeat(&[batch_size, 1])
    }

    #[test]
    fn rpn_train_outputs() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let rpn = small_rpn(&vs.root())?;

        let features = pyramid(2);
        let im_info = image_info(2, 1.0);
        let gt_boxes = Tensor::of_slice(&[8.0f32, 8.0, 40.0, 40.0, 1.0])
            .view([1, 1, 5])
            .repeat(&[2, 3, 1]);

        let output = rpn.forward_t(&features, &im_info, Some(&gt_boxes), true)?;

        let (num_rois, num_cols) = output.rois.size2()?;
        assert_eq!(num_cols, 5);
        assert!(num_rois > 0 && num_rois <= 2 * 2000);

        // proposals lie inside the image
        let coords = output.rois.narrow(1, 1, 4);
        assert!(bool::from(coords.ge(0.0).all()));
        assert!(bool::from(coords.le(64.0).all()));

        let losses = output.losses.unwrap();
        let rpn_cls = f64::from(&losses.rpn_cls);
        let rpn_loc = f64::from(&losses.rpn_loc);
        assert!(rpn_cls.is_finite() && rpn_cls > 0.0);
        assert!(rpn_loc.is_finite() && rpn_loc >= 0.0);
        assert!(losses.rpn_cls.requires_grad());
        Ok(())
    }

    #[test]
    fn rpn_inference_outputs() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let rpn = small_rpn(&vs.root())?;

        let output = tch::no_grad(|| rpn.forward_t(&pyramid(1), &image_info(1, 0.0), None, false))?;
        assert!(output.losses.is_none());
        let (num_rois, _) = output.rois.size2()?;
        assert!(num_rois <= 1000);
        let batch_indexes: Vec<f32> = Vec::from(&output.rois.select(1, 0));
        assert!(batch_indexes.iter().all(|&index| index == 0.0));
        Ok(())
    }

    #[test]
    fn rpn_train_without_gt_objects() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let rpn = small_rpn(&vs.root())?;

        let gt_boxes = Tensor::zeros(&[1, 4, 5], (Kind::Float, Device::Cpu));
        let output = rpn.forward_t(&pyramid(1), &image_info(1, 0.0), Some(&gt_boxes), true)?;
        let losses = output.losses.unwrap();
        assert_eq!(f64::from(&losses.rpn_loc), 0.0);
        assert!(f64::from(&losses.rpn_cls).is_finite());
        Ok(())
    }

    #[test]
    fn rpn_train_requires_gt() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let rpn = small_rpn(&vs.root())?;
        assert!(rpn
            .forward_t(&pyramid(1), &image_info(1, 0.0), None, true)
            .is_err());
        Ok(())
    }
}
