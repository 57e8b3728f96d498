use crate::{common::*, sections::*};

/// The complete detector configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FasterRcnnConfig {
    pub backbone: BackboneConfig,
    pub data: DataConfig,
    pub anchor: AnchorConfig,
    pub box_coder: BoxCoderConfig,
    pub rpn: RpnConfig,
    pub rcnn: RcnnConfig,
    pub loss: LossConfig,
    pub train: TrainConfig,
    pub test: TestConfig,
}

/// Input sizes and proposal counts selected for training or testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeConfig {
    pub image_short_size: usize,
    pub image_max_size: usize,
    pub prev_nms_top_n: usize,
    pub post_nms_top_n: usize,
}

impl FasterRcnnConfig {
    /// Loads a json5 file and validates it. Missing fields take default values.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config file '{}'", path.display()))?;
        let config: Self = json5::from_str(&text)
            .with_context(|| format!("unable to parse config file '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json5_str(text: &str) -> Result<Self> {
        let config: Self = json5::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let Self {
            backbone,
            data,
            anchor,
            box_coder,
            rpn,
            rcnn,
            loss,
            train,
            test,
        } = self;

        // backbone
        ensure!(
            backbone.backbone_freeze_at <= 5,
            "backbone_freeze_at must be in range 0..=5, but get {}",
            backbone.backbone_freeze_at
        );
        ensure!(
            backbone.fpn_out_channels > 0,
            "fpn_out_channels must be positive"
        );

        // data
        ensure!(data.num_classes > 0, "num_classes must be positive");
        ensure!(
            data.img_mean.len() == 3 && data.img_std.len() == 3,
            "img_mean and img_std must have exactly 3 values"
        );
        ensure!(
            data.img_std.iter().all(|&value| value > 0.0),
            "img_std values must be positive"
        );
        ensure!(
            data.size_divisibility > 0,
            "size_divisibility must be positive"
        );

        // anchor
        ensure!(
            anchor.anchor_base_size > 0.0,
            "anchor_base_size must be positive"
        );
        ensure!(
            !anchor.anchor_scales.is_empty() && anchor.anchor_scales.iter().all(|&s| s > 0.0),
            "anchor_scales must be non-empty and positive"
        );
        ensure!(
            !anchor.anchor_aspect_ratios.is_empty()
                && anchor.anchor_aspect_ratios.iter().all(|&r| r > 0.0),
            "anchor_aspect_ratios must be non-empty and positive"
        );

        // box coder
        if let Some(stds) = &box_coder.bbox_normalize_stds {
            ensure!(
                stds.iter().all(|&value| value > 0.0),
                "bbox_normalize_stds values must be positive"
            );
        }

        // rpn
        check_levels("rpn", &rpn.rpn_in_features, &rpn.rpn_stride)?;
        ensure!(rpn.rpn_channel > 0, "rpn_channel must be positive");
        check_ratio("rpn_nms_threshold", rpn.rpn_nms_threshold)?;
        check_ratio("positive_anchor_ratio", rpn.positive_anchor_ratio)?;
        check_ratio("rpn_positive_overlap", rpn.rpn_positive_overlap)?;
        check_ratio("rpn_negative_overlap", rpn.rpn_negative_overlap)?;
        ensure!(
            rpn.rpn_negative_overlap <= rpn.rpn_positive_overlap,
            "rpn_negative_overlap must not exceed rpn_positive_overlap"
        );
        ensure!(
            !(0..=1).contains(&rpn.ignore_label),
            "ignore_label must differ from 0 and 1"
        );

        // rcnn
        check_levels("rcnn", &rcnn.rcnn_in_features, &rcnn.rcnn_stride)?;
        ensure!(
            rcnn.pooling_size.iter().all(|&size| size > 0),
            "pooling_size must be positive"
        );
        ensure!(rcnn.num_rois > 0, "num_rois must be positive");
        ensure!(
            rcnn.rcnn_fc_channels > 0,
            "rcnn_fc_channels must be positive"
        );
        check_ratio("fg_ratio", rcnn.fg_ratio)?;
        check_ratio("fg_threshold", rcnn.fg_threshold)?;
        check_ratio("bg_threshold_high", rcnn.bg_threshold_high)?;
        check_ratio("bg_threshold_low", rcnn.bg_threshold_low)?;
        ensure!(
            rcnn.bg_threshold_low <= rcnn.bg_threshold_high,
            "bg_threshold_low must not exceed bg_threshold_high"
        );

        // loss
        ensure!(
            loss.rpn_smooth_l1_beta >= 0.0 && loss.rcnn_smooth_l1_beta >= 0.0,
            "smooth L1 betas must be non-negative"
        );

        // training
        ensure!(
            train.train_image_short_size > 0
                && train.train_image_short_size <= train.train_image_max_size,
            "train_image_short_size must be positive and not exceed train_image_max_size"
        );
        ensure!(
            train.train_prev_nms_top_n > 0 && train.train_post_nms_top_n > 0,
            "train NMS top-n values must be positive"
        );
        ensure!(train.basic_lr > 0.0, "basic_lr must be positive");
        check_ratio("momentum", train.momentum)?;
        ensure!(train.weight_decay >= 0.0, "weight_decay must be non-negative");
        check_ratio("lr_decay_rate", train.lr_decay_rate)?;
        ensure!(train.log_interval > 0, "log_interval must be positive");
        ensure!(train.max_epoch > 0, "max_epoch must be positive");
        ensure!(
            train
                .lr_decay_stages
                .iter()
                .tuple_windows()
                .all(|(lhs, rhs)| lhs < rhs),
            "lr_decay_stages must be strictly increasing"
        );

        // testing
        ensure!(
            test.test_image_short_size > 0
                && test.test_image_short_size <= test.test_image_max_size,
            "test_image_short_size must be positive and not exceed test_image_max_size"
        );
        ensure!(
            test.test_prev_nms_top_n > 0 && test.test_post_nms_top_n > 0,
            "test NMS top-n values must be positive"
        );
        check_ratio("test_vis_threshold", test.test_vis_threshold)?;
        check_ratio("test_cls_threshold", test.test_cls_threshold)?;
        check_ratio("test_nms", test.test_nms)?;

        Ok(())
    }

    /// The number of training steps per epoch for a given total batch size.
    pub fn steps_per_epoch(&self, batch_size: usize) -> usize {
        (self.train.nr_images_epoch / batch_size.max(1)).max(1)
    }

    /// The total number of training steps.
    pub fn max_steps(&self, batch_size: usize) -> usize {
        self.train.max_epoch * self.steps_per_epoch(batch_size)
    }

    pub fn mode(&self, train: bool) -> ModeConfig {
        if train {
            ModeConfig {
                image_short_size: self.train.train_image_short_size,
                image_max_size: self.train.train_image_max_size,
                prev_nms_top_n: self.train.train_prev_nms_top_n,
                post_nms_top_n: self.train.train_post_nms_top_n,
            }
        } else {
            ModeConfig {
                image_short_size: self.test.test_image_short_size,
                image_max_size: self.test.test_image_max_size,
                prev_nms_top_n: self.test.test_prev_nms_top_n,
                post_nms_top_n: self.test.test_post_nms_top_n,
            }
        }
    }

    /// The number of cell anchors, shared by all pyramid levels.
    pub fn num_cell_anchors(&self) -> usize {
        self.anchor.num_cell_anchors()
    }
}

fn check_ratio(name: &str, value: R64) -> Result<()> {
    ensure!(
        (0.0..=1.0).contains(&value.raw()),
        "{} must be in range [0, 1], but get {}",
        name,
        value
    );
    Ok(())
}

/// Checks feature names and strides agree, and each stride is a power of two.
fn check_levels(stage: &str, features: &[String], strides: &[usize]) -> Result<()> {
    ensure!(
        !features.is_empty(),
        "{}_in_features must not be empty",
        stage
    );
    ensure!(
        features.len() == strides.len(),
        "{}_in_features and {}_stride must have equal length",
        stage,
        stage
    );
    ensure!(
        features.iter().all_unique(),
        "{}_in_features must not contain duplicates",
        stage
    );
    features
        .iter()
        .zip_eq(strides)
        .try_for_each(|(name, &stride)| -> Result<_> {
            ensure!(
                stride.is_power_of_two(),
                "{} stride {} is not a power of two",
                stage,
                stride
            );
            let level = feature_level(name)?;
            ensure!(
                1 << level == stride,
                "{} feature '{}' is expected to have stride {}, but get {}",
                stage,
                name,
                1 << level,
                stride
            );
            Ok(())
        })
}

/// Parses the pyramid level from a feature name like `p3`.
pub fn feature_level(name: &str) -> Result<usize> {
    let level: usize = name
        .strip_prefix('p')
        .and_then(|level| level.parse().ok())
        .with_context(|| format!("invalid feature name '{}'", name))?;
    ensure!(
        (2..=6).contains(&level),
        "feature '{}' is not produced by the feature pyramid",
        name
    );
    Ok(level)
}
