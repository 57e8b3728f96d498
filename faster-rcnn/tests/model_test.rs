use anyhow::Result;
use faster_rcnn::{
    DetectionPostProcessInit, FasterRcnnInit, ModelInput, ModelOutput, LOSS_KEYS,
};
use rcnn_config::FasterRcnnConfig;
use tch::{nn, nn::OptimizerConfig, Device, Kind, Tensor};

fn small_config() -> FasterRcnnConfig {
    let mut config = FasterRcnnConfig::default();
    config.data.num_classes = 4;
    config.rpn.num_sample_anchors = 64;
    config.rcnn.num_rois = 32;
    config.train.train_prev_nms_top_n = 200;
    config.train.train_post_nms_top_n = 100;
    config.test.test_prev_nms_top_n = 100;
    config.test.test_post_nms_top_n = 50;
    config
}

#[test]
fn train_step_on_dummy_inputs() -> Result<()> {
    let vs = nn::VarStore::new(Device::Cpu);
    let model = FasterRcnnInit {
        config: small_config(),
        batch_size: 2,
    }
    .build(&vs.root())?;
    let mut optimizer = nn::Sgd {
        momentum: 0.9,
        dampening: 0.0,
        wd: 1e-4,
        nesterov: false,
    }
    .build(&vs, 1e-3)?;

    let input = model.dummy_inputs(Device::Cpu);
    let losses = match model.forward_t(&input, true)? {
        ModelOutput::Train(losses) => losses,
        ModelOutput::Inference(_) => panic!("expect losses in training"),
    };

    let values = losses.to_values();
    assert_eq!(values.keys().cloned().collect::<Vec<_>>(), LOSS_KEYS);
    assert!(losses.is_finite());
    let stage_sum: f64 = values.values().skip(1).sum();
    assert!((values["total_loss"] - stage_sum).abs() < 1e-4);

    optimizer.backward_step(&losses.total_loss);
    Ok(())
}

#[test]
fn inference_on_single_image() -> Result<()> {
    let config = small_config();
    let vs = nn::VarStore::new(Device::Cpu);
    let model = FasterRcnnInit {
        config: config.clone(),
        batch_size: 1,
    }
    .build(&vs.root())?;

    // a 200x300 image enlarged 1.2 times to 240x360
    let input = ModelInput {
        image: Tensor::rand(&[1, 3, 240, 360], (Kind::Float, Device::Cpu)) * 255.0,
        im_info: Tensor::of_slice(&[240.0f32, 360.0, 200.0, 300.0, 0.0]).view([1, 5]),
        gt_boxes: None,
    };
    let output = match tch::no_grad(|| model.forward_t(&input, false))? {
        ModelOutput::Inference(output) => output,
        ModelOutput::Train(_) => panic!("expect predictions in inference"),
    };

    let (num_rois, num_classes) = output.pred_scores.size2()?;
    assert!(num_rois <= 50);
    assert_eq!(num_classes, 4);
    assert_eq!(output.pred_boxes.size(), vec![num_rois, 4, 4]);

    // boxes are in original image coordinates
    if num_rois > 0 {
        let xs = output.pred_boxes.select(2, 2);
        let ys = output.pred_boxes.select(2, 3);
        assert!(f64::from(xs.max()) <= 300.0);
        assert!(f64::from(ys.max()) <= 200.0);
    }

    let post_process = DetectionPostProcessInit::from_config(&config.test).build()?;
    let detections = post_process.forward(&output)?;
    assert!(detections.len() <= config.test.test_max_boxes_per_image);
    assert!(detections
        .iter()
        .all(|detection| (1..=4).contains(&detection.class)));
    Ok(())
}
