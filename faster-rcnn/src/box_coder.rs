use crate::common::*;
use rcnn_config::BoxCoderConfig;

/// The upper bound of decoded log-scale deltas, so boxes grow at most 1000/16 times.
pub const DEFAULT_SCALE_CLAMP: f64 = 4.135_166_556_742_356; // ln(1000 / 16)

/// Encodes boxes as `(dx, dy, dw, dh)` deltas relative to reference boxes.
///
/// The deltas are normalized by `(delta - mean) / std` per coordinate.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxCoder {
    means: [f64; 4],
    stds: [f64; 4],
    scale_clamp: f64,
}

impl BoxCoder {
    pub fn new(means: Option<[f64; 4]>, stds: Option<[f64; 4]>) -> Result<Self> {
        let means = means.unwrap_or([0.0; 4]);
        let stds = stds.unwrap_or([1.0; 4]);
        ensure!(
            stds.iter().all(|&value| value > 0.0),
            "box coder stds must be positive"
        );
        Ok(Self {
            means,
            stds,
            scale_clamp: DEFAULT_SCALE_CLAMP,
        })
    }

    /// The coder without normalization.
    pub fn identity() -> Self {
        Self {
            means: [0.0; 4],
            stds: [1.0; 4],
            scale_clamp: DEFAULT_SCALE_CLAMP,
        }
    }

    pub fn from_config(config: &BoxCoderConfig) -> Result<Self> {
        let to_raw = |values: &[R64; 4]| values.map(|value| value.raw());
        Self::new(
            config.bbox_normalize_means.as_ref().map(to_raw),
            config.bbox_normalize_stds.as_ref().map(to_raw),
        )
    }

    /// Computes `[num_boxes, 4]` deltas that transform `boxes` into `targets`.
    pub fn encode(&self, boxes: &XyxyTensor, targets: &XyxyTensor) -> Tensor {
        debug_assert_eq!(boxes.num_boxes(), targets.num_boxes());
        let device = boxes.device();

        let (bcx, bcy, bw, bh) = centers_and_sizes(boxes);
        let (tcx, tcy, tw, th) = centers_and_sizes(targets);

        let dx = (tcx - &bcx) / &bw;
        let dy = (tcy - &bcy) / &bh;
        let dw = (tw / &bw).log();
        let dh = (th / &bh).log();
        let deltas = Tensor::stack(&[dx, dy, dw, dh], 1);

        (deltas - self.means_tensor(device)) / self.stds_tensor(device)
    }

    /// Applies `[num_boxes, 4 * k]` deltas on `[num_boxes, 4]` boxes.
    ///
    /// Each group of four columns is decoded independently, which serves
    /// class-aware regression. The output has the same shape as `deltas`.
    pub fn decode(&self, boxes: &XyxyTensor, deltas: &Tensor) -> Result<Tensor> {
        let (num_boxes, num_cols) = deltas.size2()?;
        ensure!(
            num_boxes == boxes.num_boxes(),
            "expect {} rows of deltas, but get {}",
            boxes.num_boxes(),
            num_boxes
        );
        ensure!(
            num_cols % 4 == 0,
            "the number of delta columns must be a multiple of 4"
        );
        let device = deltas.device();

        let deltas = deltas.view([num_boxes, -1, 4]) * self.stds_tensor(device).unsqueeze(0)
            + self.means_tensor(device).unsqueeze(0);
        let dx = deltas.select(2, 0);
        let dy = deltas.select(2, 1);
        let dw = deltas.select(2, 2).clamp_max(self.scale_clamp);
        let dh = deltas.select(2, 3).clamp_max(self.scale_clamp);

        let (cx, cy, w, h) = centers_and_sizes(boxes);
        let (cx, cy, w, h) = (
            cx.unsqueeze(1),
            cy.unsqueeze(1),
            w.unsqueeze(1),
            h.unsqueeze(1),
        );

        let pred_cx = dx * &w + cx;
        let pred_cy = dy * &h + cy;
        let pred_w = dw.exp() * w;
        let pred_h = dh.exp() * h;

        let x1 = &pred_cx - &pred_w * 0.5;
        let y1 = &pred_cy - &pred_h * 0.5;
        let x2 = pred_cx + pred_w * 0.5;
        let y2 = pred_cy + pred_h * 0.5;

        Ok(Tensor::stack(&[x1, y1, x2, y2], 2).view([num_boxes, num_cols]))
    }

    fn means_tensor(&self, device: Device) -> Tensor {
        let values = self.means.map(|value| value as f32);
        Tensor::of_slice(&values).to_device(device).view([1, 4])
    }

    fn stds_tensor(&self, device: Device) -> Tensor {
        let values = self.stds.map(|value| value as f32);
        Tensor::of_slice(&values).to_device(device).view([1, 4])
    }
}

fn centers_and_sizes(boxes: &XyxyTensor) -> (Tensor, Tensor, Tensor, Tensor) {
    let w = boxes.widths();
    let h = boxes.heights();
    let cx = boxes.x1() + &w * 0.5;
    let cy = boxes.y1() + &h * 0.5;
    (cx, cy, w, h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn boxes(values: &[[f32; 4]]) -> XyxyTensor {
        let flat: Vec<f32> = values.iter().flatten().cloned().collect();
        XyxyTensor::new(Tensor::of_slice(&flat).view([-1, 4])).unwrap()
    }

    #[test]
    fn encode_known_deltas() {
        let coder = BoxCoder::identity();
        let anchors = boxes(&[[0.0, 0.0, 10.0, 10.0]]);
        let targets = boxes(&[[5.0, 0.0, 25.0, 10.0]]);
        let deltas: Vec<f32> = Vec::from(&coder.encode(&anchors, &targets).view([-1]));

        // centers move from (5, 5) to (15, 5), width doubles
        assert_abs_diff_eq!(deltas[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(deltas[1], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(deltas[2], 2f32.ln(), epsilon = 1e-6);
        assert_abs_diff_eq!(deltas[3], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn decode_inverts_normalized_encode() -> Result<()> {
        let coder = BoxCoder::from_config(&BoxCoderConfig::default())?;
        let anchors = boxes(&[[0.0, 0.0, 10.0, 20.0], [30.0, 30.0, 50.0, 40.0]]);
        let targets = boxes(&[[2.0, 1.0, 14.0, 15.0], [25.0, 28.0, 60.0, 45.0]]);

        let deltas = coder.encode(&anchors, &targets);
        let decoded = coder.decode(&anchors, &deltas)?;
        let diff = f64::from((decoded - targets.tensor()).abs().max());
        assert!(diff < 1e-4);
        Ok(())
    }

    #[test]
    fn decode_class_aware_columns() -> Result<()> {
        let coder = BoxCoder::identity();
        let anchors = boxes(&[[0.0, 0.0, 10.0, 10.0]]);
        let deltas = Tensor::of_slice(&[0.0f32, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]).view([1, 8]);
        let decoded: Vec<f32> = Vec::from(&coder.decode(&anchors, &deltas)?.view([-1]));
        assert_eq!(decoded.len(), 8);
        assert_abs_diff_eq!(decoded[0], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(decoded[2], 10.0, epsilon = 1e-6);
        assert_abs_diff_eq!(decoded[4], 10.0, epsilon = 1e-6);
        assert_abs_diff_eq!(decoded[6], 20.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn decode_clamps_scale() -> Result<()> {
        let coder = BoxCoder::identity();
        let anchors = boxes(&[[0.0, 0.0, 16.0, 16.0]]);
        let deltas = Tensor::of_slice(&[0.0f32, 0.0, 100.0, 100.0]).view([1, 4]);
        let decoded = XyxyTensor::new(coder.decode(&anchors, &deltas)?)?;
        let width = f64::from(decoded.widths().get(0));
        assert_abs_diff_eq!(width, 1000.0, epsilon = 1e-2);
        Ok(())
    }

    #[test]
    fn decode_rejects_bad_columns() {
        let coder = BoxCoder::identity();
        let anchors = boxes(&[[0.0, 0.0, 16.0, 16.0]]);
        let deltas = Tensor::zeros(&[1, 6], (Kind::Float, Device::Cpu));
        assert!(coder.decode(&anchors, &deltas).is_err());
    }
}
