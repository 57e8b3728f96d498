use crate::{
    common::*,
    frozen_batch_norm::{FrozenBatchNorm, FrozenBatchNormInit},
};

/// The normalization layer kind used by convolution blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr)]
pub enum NormKind {
    #[serde(rename = "FrozenBN")]
    #[strum(serialize = "FrozenBN")]
    FrozenBatchNorm,
    #[serde(rename = "BN")]
    #[strum(serialize = "BN")]
    BatchNorm,
    #[serde(rename = "GN")]
    #[strum(serialize = "GN")]
    GroupNorm,
    #[serde(rename = "None", alias = "")]
    #[strum(serialize = "None")]
    None,
}

impl Default for NormKind {
    fn default() -> Self {
        Self::FrozenBatchNorm
    }
}

#[derive(Debug, Clone)]
pub struct Norm2DInit {
    pub kind: NormKind,
    pub eps: f64,
    pub num_groups: i64,
}

impl Norm2DInit {
    pub fn new(kind: NormKind) -> Self {
        Self {
            kind,
            eps: 1e-5,
            num_groups: 32,
        }
    }

    pub fn build<'p, P>(self, path: P, out_dim: i64) -> Norm2D
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            kind,
            eps,
            num_groups,
        } = self;

        match kind {
            NormKind::FrozenBatchNorm => {
                Norm2D::FrozenBatchNorm(FrozenBatchNormInit { eps }.build(path, out_dim))
            }
            NormKind::BatchNorm => Norm2D::BatchNorm(nn::batch_norm2d(
                path,
                out_dim,
                nn::BatchNormConfig {
                    eps,
                    ..Default::default()
                },
            )),
            NormKind::GroupNorm => Norm2D::GroupNorm(nn::group_norm(
                path,
                num_groups,
                out_dim,
                nn::GroupNormConfig {
                    eps,
                    ..Default::default()
                },
            )),
            NormKind::None => Norm2D::Identity,
        }
    }
}

#[derive(Debug)]
pub enum Norm2D {
    FrozenBatchNorm(FrozenBatchNorm),
    BatchNorm(nn::BatchNorm),
    GroupNorm(nn::GroupNorm),
    Identity,
}

impl Norm2D {
    /// Stops gradient on the affine parameters.
    pub fn freeze(&mut self) {
        match self {
            Self::BatchNorm(norm) => {
                freeze_opt(&norm.ws);
                freeze_opt(&norm.bs);
            }
            Self::GroupNorm(norm) => {
                freeze_opt(&norm.ws);
                freeze_opt(&norm.bs);
            }
            Self::FrozenBatchNorm(_) | Self::Identity => {}
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Self::Identity)
    }
}

fn freeze_opt(tensor: &Option<Tensor>) {
    if let Some(tensor) = tensor {
        let _ = tensor.set_requires_grad(false);
    }
}

impl nn::ModuleT for Norm2D {
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        match self {
            Self::FrozenBatchNorm(norm) => norm.forward_t(input, train),
            Self::BatchNorm(norm) => norm.forward_t(input, train),
            Self::GroupNorm(norm) => input.apply(norm),
            Self::Identity => input.shallow_clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Wrapper {
        norm: NormKind,
    }

    #[test]
    fn norm_kind_names() {
        let parse = |text: &str| serde_json::from_str::<Wrapper>(text).unwrap().norm;
        assert_eq!(parse(r#"{"norm": "FrozenBN"}"#), NormKind::FrozenBatchNorm);
        assert_eq!(parse(r#"{"norm": "BN"}"#), NormKind::BatchNorm);
        assert_eq!(parse(r#"{"norm": "GN"}"#), NormKind::GroupNorm);
        assert_eq!(parse(r#"{"norm": ""}"#), NormKind::None);
        assert_eq!(NormKind::FrozenBatchNorm.as_ref(), "FrozenBN");
    }

    #[test]
    fn norm_output_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let input = Tensor::randn(&[2, 64, 5, 5], (Kind::Float, Device::Cpu));

        [
            NormKind::FrozenBatchNorm,
            NormKind::BatchNorm,
            NormKind::GroupNorm,
            NormKind::None,
        ]
        .iter()
        .enumerate()
        .for_each(|(index, &kind)| {
            let norm = Norm2DInit::new(kind).build(&root / format!("norm{}", index), 64);
            assert_eq!(norm.forward_t(&input, true).size(), input.size());
        });
    }
}
