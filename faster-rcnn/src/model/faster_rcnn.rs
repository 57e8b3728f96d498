//! The two-stage detector assembled from its components.

use super::{
    Fpn, FpnInit, Rcnn, RcnnInit, RcnnLosses, RcnnPrediction, ResNet, ResNetInit, Rpn, RpnInit,
    RpnLosses, RpnOutput,
};
use crate::{common::*, inference::InferenceOutput, loss::LossOutput};
use tch_modules::NormKind;

#[derive(Debug, Clone)]
pub struct FasterRcnnInit {
    pub config: FasterRcnnConfig,
    /// The number of images per step on a device.
    pub batch_size: usize,
}

impl FasterRcnnInit {
    pub fn build<'p, P>(self, path: P) -> Result<FasterRcnn>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self { config, batch_size } = self;
        config.validate()?;
        ensure!(batch_size > 0, "batch_size must be positive");

        let bottom_up = ResNetInit::resnet50(
            config.backbone.resnet_norm,
            config.backbone.backbone_freeze_at,
        )
        .build(path / "bottom_up")?;

        let fpn_channels = config.backbone.fpn_out_channels as i64;
        let fpn = FpnInit {
            in_features: ResNet::OUT_FEATURES
                .iter()
                .map(|name| name.to_string())
                .collect(),
            in_channels: ResNet::OUT_CHANNELS.to_vec(),
            in_strides: ResNet::OUT_STRIDES.to_vec(),
            out_channels: fpn_channels,
            norm: NormKind::None,
            top_block: true,
        }
        .build(path / "fpn")?;

        let rpn = RpnInit::from_config(&config, fpn_channels).build(path / "rpn")?;
        let rcnn = RcnnInit::from_config(&config, fpn_channels)?.build(path / "rcnn")?;

        let to_f32 = |values: &[R64]| -> Vec<f32> {
            values.iter().map(|value| value.raw() as f32).collect()
        };
        let pixel_mean = to_f32(&config.data.img_mean);
        let pixel_std = to_f32(&config.data.img_std);

        info!(
            "built Faster R-CNN with {} classes, FPN levels {:?}",
            config.data.num_classes,
            fpn.out_features()
        );

        Ok(FasterRcnn {
            config,
            batch_size,
            pixel_mean,
            pixel_std,
            bottom_up,
            fpn,
            rpn,
            rcnn,
        })
    }
}

/// Inputs of one step.
#[derive(Debug)]
pub struct ModelInput {
    /// `[batch, 3, height, width]` BGR float images in 0..255.
    pub image: Tensor,
    /// `[batch, 5]` rows of `(resized_h, resized_w, orig_h, orig_w, num_gt)`.
    pub im_info: Tensor,
    /// `[batch, max_gt_boxes, 5]` rows of `(x1, y1, x2, y2, class)`. Required in training.
    pub gt_boxes: Option<Tensor>,
}

impl ModelInput {
    pub fn to_device(&self, device: Device) -> Self {
        Self {
            image: self.image.to_device(device),
            im_info: self.im_info.to_device(device),
            gt_boxes: self.gt_boxes.as_ref().map(|gt| gt.to_device(device)),
        }
    }

    pub fn batch_size(&self) -> i64 {
        self.image.size()[0]
    }
}

#[derive(Debug)]
pub enum ModelOutput {
    Train(LossOutput),
    Inference(InferenceOutput),
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct FasterRcnn {
    #[derivative(Debug = "ignore")]
    config: FasterRcnnConfig,
    batch_size: usize,
    pixel_mean: Vec<f32>,
    pixel_std: Vec<f32>,
    bottom_up: ResNet,
    fpn: Fpn,
    rpn: Rpn,
    rcnn: Rcnn,
}

impl FasterRcnn {
    pub fn config(&self) -> &FasterRcnnConfig {
        &self.config
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_classes(&self) -> i64 {
        self.rcnn.num_classes()
    }

    /// Normalizes pixels by the configured mean and std, then pads the bottom and
    /// right sides to multiples of the size divisibility.
    pub fn preprocess_image(&self, image: &Tensor) -> Result<Tensor> {
        let (_, channels, _, _) = image.size4()?;
        ensure!(
            channels == self.pixel_mean.len() as i64,
            "expect {} image channels, but get {}",
            self.pixel_mean.len(),
            channels
        );
        let device = image.device();
        let mean = Tensor::of_slice(&self.pixel_mean)
            .to_device(device)
            .view([1, -1, 1, 1]);
        let std = Tensor::of_slice(&self.pixel_std)
            .to_device(device)
            .view([1, -1, 1, 1]);

        let normalized = (image.to_kind(Kind::Float) - mean) / std;
        normalized.f_pad_to_multiple(self.config.data.size_divisibility as i64, 0.0)
    }

    pub fn forward_t(&self, input: &ModelInput, train: bool) -> Result<ModelOutput> {
        let ModelInput {
            image,
            im_info,
            gt_boxes,
        } = input;

        let gt_boxes = match (train, gt_boxes) {
            (true, None) => bail!("gt_boxes is required in training"),
            (true, Some(gt_boxes)) => Some(gt_boxes),
            (false, _) => None,
        };

        let image = self.preprocess_image(image)?;
        let bottom_up = self.bottom_up.forward_t(&image, train);
        let features = self.fpn.forward_t(&bottom_up, train)?;

        let output = match gt_boxes {
            Some(gt_boxes) => ModelOutput::Train(self.forward_train(&features, im_info, gt_boxes)?),
            None => ModelOutput::Inference(self.inference(&features, im_info)?),
        };
        Ok(output)
    }

    pub fn forward_train(
        &self,
        features: &IndexMap<String, Tensor>,
        im_info: &Tensor,
        gt_boxes: &Tensor,
    ) -> Result<LossOutput> {
        let RpnOutput { rois, losses } = self.rpn.forward_t(features, im_info, Some(gt_boxes), true)?;
        let RpnLosses { rpn_cls, rpn_loc } =
            losses.ok_or_else(|| format_err!("the RPN did not produce losses"))?;
        let RcnnLosses { rcnn_cls, rcnn_loc } =
            self.rcnn.forward_train(features, &rois, im_info, gt_boxes)?;

        Ok(LossOutput::new(rpn_cls, rpn_loc, rcnn_cls, rcnn_loc))
    }

    /// Predicts boxes in original image coordinates for a single image.
    pub fn inference(
        &self,
        features: &IndexMap<String, Tensor>,
        im_info: &Tensor,
    ) -> Result<InferenceOutput> {
        let (batch_size, _) = im_info.size2()?;
        ensure!(
            batch_size == 1,
            "inference supports batch size 1, but get {}",
            batch_size
        );

        let RpnOutput { rois, .. } = self.rpn.forward_t(features, im_info, None, false)?;
        let RcnnPrediction { boxes, scores } = self.rcnn.inference(features, &rois)?;

        let [resized_h, resized_w, orig_h, orig_w] =
            [0, 1, 2, 3].map(|col| im_info.double_value(&[0, col]));
        ensure!(
            orig_h > 0.0 && orig_w > 0.0,
            "im_info has non-positive original image size"
        );
        let scale_h = resized_h / orig_h;
        let scale_w = resized_w / orig_w;

        let boxes = XyxyTensor::new(boxes.view([-1, 4]))?
            .scale(1.0 / scale_w, 1.0 / scale_h)
            .clip(orig_h, orig_w);

        Ok(InferenceOutput {
            pred_scores: scores,
            pred_boxes: boxes.into_tensor().view([-1, self.num_classes(), 4]),
        })
    }

    /// Builds a batch of two 224x224 images with two gt boxes each.
    pub fn dummy_inputs(&self, device: Device) -> ModelInput {
        let max_gt = self.config.data.max_gt_boxes as i64;
        let num_classes = self.config.data.num_classes as f32;

        let image = Tensor::rand(&[2, 3, 224, 224], (Kind::Float, device)) * 255.0;
        let im_info = Tensor::of_slice(&[224.0f32, 224.0, 224.0, 224.0, 2.0])
            .view([1, 5])
            .repeat(&[2, 1])
            .to_device(device);

        let gt_boxes = Tensor::zeros(&[2, max_gt, 5], (Kind::Float, device));
        let valid = Tensor::of_slice(&[
            20.0f32, 30.0, 120.0, 150.0, 1.0, //
            60.0, 40.0, 200.0, 180.0, num_classes,
        ])
        .view([1, 2, 5])
        .repeat(&[2, 1, 1])
        .to_device(device);
        let _ = gt_boxes.narrow(1, 0, 2).copy_(&valid);

        ModelInput {
            image,
            im_info,
            gt_boxes: Some(gt_boxes),
        }
    }
}
