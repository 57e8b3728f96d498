use crate::{
    common::*,
    norm::{Norm2D, Norm2DInit, NormKind},
};

#[derive(Debug, Clone)]
pub struct ConvNorm2DInit {
    pub in_c: i64,
    pub out_c: i64,
    pub k: i64,
    pub s: i64,
    pub p: i64,
    pub d: i64,
    pub g: i64,
    /// Adds a bias term. It is ignored unless the norm is [NormKind::None].
    pub bias: bool,
    pub norm: NormKind,
    pub ws_init: nn::Init,
}

impl ConvNorm2DInit {
    pub fn new(in_c: i64, out_c: i64, k: i64) -> Self {
        Self {
            in_c,
            out_c,
            k,
            s: 1,
            p: k / 2,
            d: 1,
            g: 1,
            bias: true,
            norm: NormKind::None,
            ws_init: nn::Init::KaimingUniform,
        }
    }

    pub fn build<'p, P>(self, path: P) -> ConvNorm2D
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();

        let Self {
            in_c,
            out_c,
            k,
            s,
            p,
            d,
            g,
            bias,
            norm,
            ws_init,
        } = self;

        // the norm layer carries the shift when present
        let bias = bias && norm == NormKind::None;

        let conv = nn::conv2d(
            path / "conv",
            in_c,
            out_c,
            k,
            nn::ConvConfig {
                stride: s,
                padding: p,
                dilation: d,
                groups: g,
                bias,
                ws_init,
                bs_init: nn::Init::Const(0.0),
                ..Default::default()
            },
        );
        let norm = Norm2DInit::new(norm).build(path / "norm", out_c);

        ConvNorm2D {
            conv,
            norm,
            frozen: false,
        }
    }
}

/// A 2D convolution followed by an optional normalization layer.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ConvNorm2D {
    #[derivative(Debug = "ignore")]
    conv: nn::Conv2D,
    norm: Norm2D,
    frozen: bool,
}

impl nn::ModuleT for ConvNorm2D {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let Self {
            ref conv,
            ref norm,
            frozen,
        } = *self;

        // frozen layers keep their statistics
        norm.forward_t(&xs.apply(conv), train && !frozen)
    }
}

impl ConvNorm2D {
    /// Stops gradient on all parameters and runs the norm layer in inference mode.
    pub fn freeze(&mut self) {
        let Self {
            conv: nn::Conv2D { ws, bs, .. },
            norm,
            frozen,
        } = self;

        let _ = ws.set_requires_grad(false);
        if let Some(bs) = bs {
            let _ = bs.set_requires_grad(false);
        }
        norm.freeze();
        *frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn weight(&self) -> &Tensor {
        &self.conv.ws
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_norm_output_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let conv = ConvNorm2DInit {
            s: 2,
            norm: NormKind::FrozenBatchNorm,
            ..ConvNorm2DInit::new(3, 8, 3)
        }
        .build(&root / "block");

        let input = Tensor::randn(&[1, 3, 16, 16], (Kind::Float, Device::Cpu));
        let output = conv.forward_t(&input, true);
        assert_eq!(output.size(), vec![1, 8, 8, 8]);
    }

    #[test]
    fn conv_norm_freeze() {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let mut conv = ConvNorm2DInit::new(3, 4, 1).build(&root / "block");
        assert!(conv.weight().requires_grad());

        conv.freeze();
        assert!(conv.is_frozen());
        assert!(!conv.weight().requires_grad());

        let input = Tensor::randn(&[1, 3, 4, 4], (Kind::Float, Device::Cpu));
        let output = conv.forward_t(&input, true);
        assert!(!output.requires_grad());
    }
}
