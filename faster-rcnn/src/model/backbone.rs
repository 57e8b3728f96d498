//! Residual bottom-up network.

use crate::common::*;
use tch_modules::{ConvNorm2D, ConvNorm2DInit, NormKind};

/// The bottom-up network configuration.
#[derive(Debug, Clone)]
pub struct ResNetInit {
    /// Number of bottleneck blocks in each of the four stages.
    pub blocks: [usize; 4],
    pub stem_channels: i64,
    pub norm: NormKind,
    /// 0 freezes nothing, 1 freezes the stem, `n >= 2` freezes the stem and the
    /// first `n - 1` stages.
    pub freeze_at: usize,
}

impl ResNetInit {
    pub fn resnet50(norm: NormKind, freeze_at: usize) -> Self {
        Self {
            blocks: [3, 4, 6, 3],
            stem_channels: 64,
            norm,
            freeze_at,
        }
    }

    pub fn build<'p, P>(self, path: P) -> Result<ResNet>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            blocks,
            stem_channels,
            norm,
            freeze_at,
        } = self;
        ensure!(freeze_at <= 5, "freeze_at must be in range 0..=5");
        ensure!(
            blocks.iter().all(|&count| count > 0),
            "each stage must have at least one block"
        );

        let mut stem = ConvNorm2DInit {
            s: 2,
            norm,
            ..ConvNorm2DInit::new(3, stem_channels, 7)
        }
        .build(path / "conv1");

        let mut in_c = stem_channels;
        let mut stages: Vec<_> = blocks
            .iter()
            .enumerate()
            .map(|(stage_index, &num_blocks)| {
                let mid_c = stem_channels << stage_index;
                let out_c = mid_c * 4;
                let first_stride = if stage_index == 0 { 1 } else { 2 };
                let stage_path = path / format!("layer{}", stage_index + 1);

                let stage: Vec<_> = (0..num_blocks)
                    .map(|block_index| {
                        let block = BottleneckInit {
                            in_c,
                            mid_c,
                            out_c,
                            stride: if block_index == 0 { first_stride } else { 1 },
                            norm,
                        }
                        .build(&stage_path / block_index.to_string());
                        in_c = out_c;
                        block
                    })
                    .collect();
                stage
            })
            .collect();

        if freeze_at >= 1 {
            stem.freeze();
        }
        stages
            .iter_mut()
            .take(freeze_at.saturating_sub(1))
            .flatten()
            .for_each(|block| block.freeze());

        Ok(ResNet { stem, stages })
    }
}

/// Residual network yielding `res2` to `res5` features.
#[derive(Debug)]
pub struct ResNet {
    stem: ConvNorm2D,
    stages: Vec<Vec<Bottleneck>>,
}

impl ResNet {
    pub const OUT_FEATURES: [&'static str; 4] = ["res2", "res3", "res4", "res5"];
    pub const OUT_CHANNELS: [i64; 4] = [256, 512, 1024, 2048];
    pub const OUT_STRIDES: [i64; 4] = [4, 8, 16, 32];

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> IndexMap<String, Tensor> {
        let xs = self
            .stem
            .forward_t(xs, train)
            .relu()
            .max_pool2d(&[3, 3], &[2, 2], &[1, 1], &[1, 1], false);

        self.stages
            .iter()
            .zip(Self::OUT_FEATURES)
            .scan(xs, |xs, (stage, name)| {
                *xs = stage
                    .iter()
                    .fold(xs.shallow_clone(), |xs, block| block.forward_t(&xs, train));
                Some((name.to_string(), xs.shallow_clone()))
            })
            .collect()
    }

    pub fn is_stem_frozen(&self) -> bool {
        self.stem.is_frozen()
    }

    /// Returns whether every block of the 0-based stage is frozen.
    pub fn is_stage_frozen(&self, stage_index: usize) -> bool {
        self.stages[stage_index].iter().all(|block| block.is_frozen())
    }
}

#[derive(Debug, Clone)]
struct BottleneckInit {
    in_c: i64,
    mid_c: i64,
    out_c: i64,
    stride: i64,
    norm: NormKind,
}

impl BottleneckInit {
    fn build<'p, P>(self, path: P) -> Bottleneck
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            in_c,
            mid_c,
            out_c,
            stride,
            norm,
        } = self;

        let conv1 = ConvNorm2DInit {
            norm,
            ..ConvNorm2DInit::new(in_c, mid_c, 1)
        }
        .build(path / "conv1");
        // the 3x3 conv carries the stride
        let conv2 = ConvNorm2DInit {
            s: stride,
            norm,
            ..ConvNorm2DInit::new(mid_c, mid_c, 3)
        }
        .build(path / "conv2");
        let conv3 = ConvNorm2DInit {
            norm,
            ..ConvNorm2DInit::new(mid_c, out_c, 1)
        }
        .build(path / "conv3");
        let shortcut = (in_c != out_c || stride != 1).then(|| {
            ConvNorm2DInit {
                s: stride,
                norm,
                ..ConvNorm2DInit::new(in_c, out_c, 1)
            }
            .build(path / "shortcut")
        });

        Bottleneck {
            conv1,
            conv2,
            conv3,
            shortcut,
        }
    }
}

#[derive(Debug)]
struct Bottleneck {
    conv1: ConvNorm2D,
    conv2: ConvNorm2D,
    conv3: ConvNorm2D,
    shortcut: Option<ConvNorm2D>,
}

impl Bottleneck {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let ys = self.conv1.forward_t(xs, train).relu();
        let ys = self.conv2.forward_t(&ys, train).relu();
        let ys = self.conv3.forward_t(&ys, train);
        let identity = match &self.shortcut {
            Some(shortcut) => shortcut.forward_t(xs, train),
            None => xs.shallow_clone(),
        };
        (ys + identity).relu()
    }

    fn freeze(&mut self) {
        self.conv1.freeze();
        self.conv2.freeze();
        self.conv3.freeze();
        if let Some(shortcut) = &mut self.shortcut {
            shortcut.freeze();
        }
    }

    fn is_frozen(&self) -> bool {
        self.conv1.is_frozen() && self.conv2.is_frozen() && self.conv3.is_frozen()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resnet50_feature_shapes() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let resnet = ResNetInit::resnet50(NormKind::FrozenBatchNorm, 2).build(&root / "bottom_up")?;

        let input = Tensor::randn(&[1, 3, 64, 96], (Kind::Float, Device::Cpu));
        let features = tch::no_grad(|| resnet.forward_t(&input, false));

        let names: Vec<_> = features.keys().cloned().collect();
        assert_eq!(names, ResNet::OUT_FEATURES);
        izip!(features.values(), ResNet::OUT_CHANNELS, ResNet::OUT_STRIDES).for_each(
            |(feature, channels, stride)| {
                assert_eq!(feature.size(), vec![1, channels, 64 / stride, 96 / stride]);
            },
        );
        Ok(())
    }

    #[test]
    fn resnet50_freeze_stages() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let resnet = ResNetInit::resnet50(NormKind::FrozenBatchNorm, 2).build(&root / "bottom_up")?;

        assert!(resnet.is_stem_frozen());
        assert!(resnet.is_stage_frozen(0));
        assert!(!resnet.is_stage_frozen(1));

        let frozen = vs
            .variables()
            .into_iter()
            .filter(|(name, _)| name.starts_with("bottom_up.conv1.") || name.starts_with("bottom_up.layer1."))
            .all(|(_, tensor)| !tensor.requires_grad());
        assert!(frozen);

        let trainable = vs
            .variables()
            .into_iter()
            .filter(|(name, _)| name.starts_with("bottom_up.layer2.") && name.ends_with("conv.weight"))
            .all(|(_, tensor)| tensor.requires_grad());
        assert!(trainable);
        Ok(())
    }

    #[test]
    fn resnet50_no_freeze() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let resnet = ResNetInit::resnet50(NormKind::BatchNorm, 0).build(&root / "bottom_up")?;
        assert!(!resnet.is_stem_frozen());
        assert!((0..4).all(|index| !resnet.is_stage_frozen(index)));
        Ok(())
    }
}
