//! Configuration sections grouped by the detector stage they control.

use crate::common::*;

pub use anchor::*;
pub use backbone::*;
pub use box_coder::*;
pub use data::*;
pub use loss::*;
pub use rcnn::*;
pub use rpn::*;
pub use testing::*;
pub use training::*;

mod backbone {
    use super::*;

    /// Bottom-up network and feature pyramid options.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct BackboneConfig {
        /// The normalization layer in residual blocks.
        pub resnet_norm: NormKind,
        /// Stages below this index are frozen. 0 freezes nothing, 1 freezes the stem,
        /// 2 also freezes `res2`, and so on.
        pub backbone_freeze_at: usize,
        pub fpn_out_channels: usize,
    }

    impl Default for BackboneConfig {
        fn default() -> Self {
            Self {
                resnet_norm: NormKind::FrozenBatchNorm,
                backbone_freeze_at: 2,
                fpn_out_channels: 256,
            }
        }
    }
}

mod data {
    use super::*;

    /// The location of a dataset split.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DatasetSpec {
        pub name: String,
        /// Image directory relative to the dataset directory.
        pub root: PathBuf,
        /// Annotation file relative to the dataset directory.
        pub ann_file: PathBuf,
    }

    /// Dataset and input normalization options.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct DataConfig {
        pub train_dataset: DatasetSpec,
        pub test_dataset: DatasetSpec,
        /// Number of foreground classes, excluding background.
        pub num_classes: usize,
        /// Per-channel mean in BGR order.
        pub img_mean: Vec<R64>,
        /// Per-channel standard deviation in BGR order.
        pub img_std: Vec<R64>,
        /// The number of ground truth rows per image in a batch.
        pub max_gt_boxes: usize,
        /// Images are zero-padded so height and width are multiples of this value.
        pub size_divisibility: usize,
    }

    impl Default for DataConfig {
        fn default() -> Self {
            Self {
                train_dataset: DatasetSpec {
                    name: "coco".into(),
                    root: "train2017".into(),
                    ann_file: "annotations/instances_train2017.json".into(),
                },
                test_dataset: DatasetSpec {
                    name: "coco".into(),
                    root: "val2017".into(),
                    ann_file: "annotations/instances_val2017.json".into(),
                },
                num_classes: 80,
                img_mean: vec![r64(103.530), r64(116.280), r64(123.675)],
                img_std: vec![r64(57.375), r64(57.120), r64(58.395)],
                max_gt_boxes: 100,
                size_divisibility: 32,
            }
        }
    }
}

mod anchor {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct AnchorConfig {
        pub anchor_base_size: R64,
        pub anchor_scales: Vec<R64>,
        /// Height over width ratios.
        pub anchor_aspect_ratios: Vec<R64>,
        /// Shift added to anchor centers in pixels.
        pub anchor_offset: R64,
    }

    impl Default for AnchorConfig {
        fn default() -> Self {
            Self {
                anchor_base_size: r64(16.0),
                anchor_scales: vec![r64(0.5)],
                anchor_aspect_ratios: vec![r64(0.5), r64(1.0), r64(2.0)],
                anchor_offset: r64(-0.5),
            }
        }
    }

    impl AnchorConfig {
        /// The number of anchors placed on each feature cell.
        pub fn num_cell_anchors(&self) -> usize {
            self.anchor_scales.len() * self.anchor_aspect_ratios.len()
        }
    }
}

mod box_coder {
    use super::*;

    /// Normalization of box regression targets in the second stage.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct BoxCoderConfig {
        pub bbox_normalize_means: Option<[R64; 4]>,
        pub bbox_normalize_stds: Option<[R64; 4]>,
    }

    impl Default for BoxCoderConfig {
        fn default() -> Self {
            Self {
                bbox_normalize_means: None,
                bbox_normalize_stds: Some([r64(0.1), r64(0.1), r64(0.2), r64(0.2)]),
            }
        }
    }
}

mod rpn {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct RpnConfig {
        pub rpn_stride: Vec<usize>,
        pub rpn_in_features: Vec<String>,
        pub rpn_channel: usize,
        pub rpn_nms_threshold: R64,
        /// Marks the best matching anchors of each ground truth as positive.
        pub allow_low_quality: bool,
        pub num_sample_anchors: usize,
        pub positive_anchor_ratio: R64,
        pub rpn_positive_overlap: R64,
        pub rpn_negative_overlap: R64,
        pub ignore_label: i64,
    }

    impl Default for RpnConfig {
        fn default() -> Self {
            Self {
                rpn_stride: vec![4, 8, 16, 32, 64],
                rpn_in_features: ["p2", "p3", "p4", "p5", "p6"]
                    .iter()
                    .map(|name| name.to_string())
                    .collect(),
                rpn_channel: 256,
                rpn_nms_threshold: r64(0.7),
                allow_low_quality: true,
                num_sample_anchors: 256,
                positive_anchor_ratio: r64(0.5),
                rpn_positive_overlap: r64(0.7),
                rpn_negative_overlap: r64(0.3),
                ignore_label: -1,
            }
        }
    }
}

mod rcnn {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct RcnnConfig {
        pub pooling_method: PoolingMethod,
        /// Output height and width of pooled features.
        pub pooling_size: [usize; 2],
        /// The number of sampled proposals per image.
        pub num_rois: usize,
        pub fg_ratio: R64,
        pub fg_threshold: R64,
        pub bg_threshold_high: R64,
        pub bg_threshold_low: R64,
        pub rcnn_in_features: Vec<String>,
        pub rcnn_stride: Vec<usize>,
        pub rcnn_fc_channels: usize,
        /// Regresses one box per class rather than a shared box.
        pub class_aware_box: bool,
    }

    impl Default for RcnnConfig {
        fn default() -> Self {
            Self {
                pooling_method: PoolingMethod::RoiAlign,
                pooling_size: [7, 7],
                num_rois: 512,
                fg_ratio: r64(0.5),
                fg_threshold: r64(0.5),
                bg_threshold_high: r64(0.5),
                bg_threshold_low: r64(0.0),
                rcnn_in_features: ["p2", "p3", "p4", "p5"]
                    .iter()
                    .map(|name| name.to_string())
                    .collect(),
                rcnn_stride: vec![4, 8, 16, 32],
                rcnn_fc_channels: 1024,
                class_aware_box: true,
            }
        }
    }
}

mod loss {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct LossConfig {
        pub rpn_smooth_l1_beta: R64,
        pub rcnn_smooth_l1_beta: R64,
    }

    impl Default for LossConfig {
        fn default() -> Self {
            Self {
                rpn_smooth_l1_beta: r64(3.0),
                rcnn_smooth_l1_beta: r64(1.0),
            }
        }
    }
}

mod training {
    use super::*;

    /// Training schedule and input sizes.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct TrainConfig {
        pub train_image_short_size: usize,
        pub train_image_max_size: usize,
        pub train_prev_nms_top_n: usize,
        pub train_post_nms_top_n: usize,
        pub num_losses: usize,
        /// Learning rate per image. It is multiplied by the batch size.
        pub basic_lr: R64,
        pub momentum: R64,
        pub weight_decay: R64,
        pub log_interval: usize,
        pub nr_images_epoch: usize,
        pub max_epoch: usize,
        pub warm_iters: usize,
        pub lr_decay_rate: R64,
        /// Epochs at which the learning rate is multiplied by `lr_decay_rate`.
        #[serde(alias = "lr_decay_sates")]
        pub lr_decay_stages: Vec<usize>,
    }

    impl Default for TrainConfig {
        fn default() -> Self {
            Self {
                train_image_short_size: 800,
                train_image_max_size: 1333,
                train_prev_nms_top_n: 2000,
                train_post_nms_top_n: 1000,
                num_losses: 5,
                basic_lr: r64(0.02 / 16.0),
                momentum: r64(0.9),
                weight_decay: r64(1e-4),
                log_interval: 20,
                nr_images_epoch: 80000,
                max_epoch: 18,
                warm_iters: 500,
                lr_decay_rate: r64(0.1),
                lr_decay_stages: vec![12, 16, 17],
            }
        }
    }
}

mod testing {
    use super::*;

    /// Inference input sizes and output filtering.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct TestConfig {
        pub test_image_short_size: usize,
        pub test_image_max_size: usize,
        pub test_prev_nms_top_n: usize,
        pub test_post_nms_top_n: usize,
        pub test_max_boxes_per_image: usize,
        pub test_vis_threshold: R64,
        pub test_cls_threshold: R64,
        pub test_nms: R64,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            Self {
                test_image_short_size: 800,
                test_image_max_size: 1333,
                test_prev_nms_top_n: 1000,
                test_post_nms_top_n: 1000,
                test_max_boxes_per_image: 100,
                test_vis_threshold: r64(0.3),
                test_cls_threshold: r64(0.05),
                test_nms: r64(0.5),
            }
        }
    }
}
