//! Feature pyramid over the bottom-up features.

use crate::common::*;
use tch_modules::{ConvNorm2D, ConvNorm2DInit, NormKind};

#[derive(Debug, Clone)]
pub struct FpnInit {
    /// Bottom-up feature names, from fine to coarse.
    pub in_features: Vec<String>,
    pub in_channels: Vec<i64>,
    pub in_strides: Vec<i64>,
    pub out_channels: i64,
    pub norm: NormKind,
    /// Appends a level by stride-2 subsampling of the coarsest output.
    pub top_block: bool,
}

impl FpnInit {
    pub fn build<'p, P>(self, path: P) -> Result<Fpn>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            in_features,
            in_channels,
            in_strides,
            out_channels,
            norm,
            top_block,
        } = self;

        ensure!(!in_features.is_empty(), "in_features must not be empty");
        ensure!(
            in_features.len() == in_channels.len() && in_features.len() == in_strides.len(),
            "in_features, in_channels and in_strides must have equal length"
        );
        ensure!(
            in_strides.iter().all(|stride| stride.count_ones() == 1),
            "strides must be powers of two"
        );
        ensure!(
            in_strides.iter().tuple_windows().all(|(lhs, rhs)| lhs * 2 == *rhs),
            "strides must be consecutive powers of two"
        );

        let level_of = |stride: i64| stride.trailing_zeros();

        let (lateral_convs, output_convs): (Vec<_>, Vec<_>) = in_channels
            .iter()
            .zip_eq(&in_strides)
            .map(|(&in_c, &stride)| {
                let level = level_of(stride);
                let lateral = ConvNorm2DInit {
                    norm,
                    ..ConvNorm2DInit::new(in_c, out_channels, 1)
                }
                .build(path / format!("fpn_lateral{}", level));
                let output = ConvNorm2DInit {
                    norm,
                    ..ConvNorm2DInit::new(out_channels, out_channels, 3)
                }
                .build(path / format!("fpn_output{}", level));
                (lateral, output)
            })
            .unzip();

        let mut out_features: Vec<String> = in_strides
            .iter()
            .map(|&stride| format!("p{}", level_of(stride)))
            .collect();
        let mut out_strides = in_strides.clone();
        if let (true, Some(&last_stride)) = (top_block, in_strides.last()) {
            out_features.push(format!("p{}", level_of(last_stride) + 1));
            out_strides.push(last_stride * 2);
        }

        Ok(Fpn {
            in_features,
            out_features,
            out_strides,
            lateral_convs,
            output_convs,
            top_block,
        })
    }
}

/// Top-down pathway with lateral connections.
#[derive(Debug)]
pub struct Fpn {
    in_features: Vec<String>,
    out_features: Vec<String>,
    out_strides: Vec<i64>,
    lateral_convs: Vec<ConvNorm2D>,
    output_convs: Vec<ConvNorm2D>,
    top_block: bool,
}

impl Fpn {
    pub fn out_features(&self) -> &[String] {
        &self.out_features
    }

    pub fn out_strides(&self) -> &[i64] {
        &self.out_strides
    }

    pub fn forward_t(
        &self,
        bottom_up: &IndexMap<String, Tensor>,
        train: bool,
    ) -> Result<IndexMap<String, Tensor>> {
        let inputs: Vec<&Tensor> = self
            .in_features
            .iter()
            .map(|name| {
                bottom_up
                    .get(name)
                    .ok_or_else(|| format_err!("bottom-up feature '{}' is missing", name))
            })
            .collect::<Result<_>>()?;

        // walk from the coarsest level to the finest
        let mut outputs = Vec::with_capacity(inputs.len());
        let mut prev: Option<Tensor> = None;

        for (input, lateral, output) in izip!(
            inputs.iter().rev(),
            self.lateral_convs.iter().rev(),
            self.output_convs.iter().rev()
        ) {
            let lateral = lateral.forward_t(input, train);
            let merged = match prev {
                Some(prev) => {
                    let (_, _, height, width) = lateral.size4()?;
                    lateral + prev.upsample_nearest2d(&[height, width], None, None)
                }
                None => lateral,
            };
            outputs.push(output.forward_t(&merged, train));
            prev = Some(merged);
        }
        outputs.reverse();

        if let (true, Some(last)) = (self.top_block, outputs.last()) {
            let extra = last.max_pool2d(&[1, 1], &[2, 2], &[0, 0], &[1, 1], false);
            outputs.push(extra);
        }

        Ok(self.out_features.iter().cloned().zip_eq(outputs).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::backbone::ResNet;

    fn resnet_fpn_init() -> FpnInit {
        FpnInit {
            in_features: ResNet::OUT_FEATURES.iter().map(|name| name.to_string()).collect(),
            in_channels: ResNet::OUT_CHANNELS.to_vec(),
            in_strides: ResNet::OUT_STRIDES.to_vec(),
            out_channels: 16,
            norm: NormKind::None,
            top_block: true,
        }
    }

    #[test]
    fn fpn_output_shapes() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let fpn = resnet_fpn_init().build(&root / "fpn")?;
        assert_eq!(fpn.out_features(), &["p2", "p3", "p4", "p5", "p6"]);
        assert_eq!(fpn.out_strides(), &[4, 8, 16, 32, 64]);

        let bottom_up: IndexMap<String, Tensor> = izip!(
            ResNet::OUT_FEATURES,
            ResNet::OUT_CHANNELS,
            [16, 8, 4, 2]
        )
        .map(|(name, channels, size)| {
            let feature = Tensor::randn(&[2, channels, size, size], (Kind::Float, Device::Cpu));
            (name.to_string(), feature)
        })
        .collect();

        let outputs = fpn.forward_t(&bottom_up, false)?;
        let shapes: Vec<_> = outputs.values().map(|output| output.size()).collect();
        assert_eq!(
            shapes,
            vec![
                vec![2, 16, 16, 16],
                vec![2, 16, 8, 8],
                vec![2, 16, 4, 4],
                vec![2, 16, 2, 2],
                vec![2, 16, 1, 1],
            ]
        );
        Ok(())
    }

    #[test]
    fn fpn_missing_feature() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let fpn = resnet_fpn_init().build(&root / "fpn")?;
        let bottom_up = IndexMap::new();
        assert!(fpn.forward_t(&bottom_up, false).is_err());
        Ok(())
    }

    #[test]
    fn fpn_reject_gapped_strides() {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let result = FpnInit {
            in_strides: vec![4, 8, 32, 64],
            ..resnet_fpn_init()
        }
        .build(&root / "fpn");
        assert!(result.is_err());
    }
}
