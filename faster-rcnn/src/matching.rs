//! Assignment of ground truth to candidate boxes, and balanced sampling of the result.

use crate::common::*;

pub const POSITIVE_LABEL: i64 = 1;
pub const NEGATIVE_LABEL: i64 = 0;

#[derive(Debug, Clone)]
pub struct MatcherInit {
    /// Candidates with IoU at least this value are positive.
    pub positive_threshold: f64,
    /// Candidates with IoU in `[negative_low, negative_high)` are negative.
    pub negative_high: f64,
    pub negative_low: f64,
    /// The label of candidates that are neither positive nor negative.
    pub ignore_label: i64,
    /// Makes the best candidates of each ground truth positive.
    pub allow_low_quality: bool,
}

impl MatcherInit {
    pub fn build(self) -> Result<Matcher> {
        let Self {
            positive_threshold,
            negative_high,
            negative_low,
            ignore_label,
            allow_low_quality,
        } = self;

        ensure!(
            negative_low <= negative_high && negative_high <= positive_threshold,
            "thresholds must satisfy negative_low <= negative_high <= positive_threshold"
        );
        ensure!(
            ignore_label != POSITIVE_LABEL && ignore_label != NEGATIVE_LABEL,
            "ignore_label must differ from positive and negative labels"
        );

        Ok(Matcher {
            positive_threshold,
            negative_high,
            negative_low,
            ignore_label,
            allow_low_quality,
        })
    }
}

/// Labels candidates by their best IoU against ground truth boxes.
#[derive(Debug, Clone)]
pub struct Matcher {
    positive_threshold: f64,
    negative_high: f64,
    negative_low: f64,
    ignore_label: i64,
    allow_low_quality: bool,
}

/// The best matching ground truth and the label of each candidate.
#[derive(Debug, TensorLike)]
pub struct MatchOutput {
    /// `[num_candidates]` ground truth indexes. Meaningless for non-positive candidates.
    pub matched_indexes: Tensor,
    /// `[num_candidates]` labels, one of 1, 0 or the ignore label.
    pub labels: Tensor,
}

impl Matcher {
    pub fn ignore_label(&self) -> i64 {
        self.ignore_label
    }

    /// Matches a `[num_gt, num_candidates]` IoU matrix.
    ///
    /// Without ground truth, every candidate is negative.
    pub fn forward(&self, iou: &Tensor) -> Result<MatchOutput> {
        let Self {
            positive_threshold,
            negative_high,
            negative_low,
            ignore_label,
            allow_low_quality,
        } = *self;

        tch::no_grad(|| -> Result<_> {
            let (num_gt, num_candidates) = iou.size2()?;
            let device = iou.device();

            if num_gt == 0 {
                return Ok(MatchOutput {
                    matched_indexes: Tensor::zeros(&[num_candidates], (Kind::Int64, device)),
                    labels: Tensor::full(
                        &[num_candidates],
                        NEGATIVE_LABEL,
                        (Kind::Int64, device),
                    ),
                });
            }

            let (max_iou, matched_indexes) = iou.max_dim(0, false);

            let negative = max_iou
                .ge(negative_low)
                .logical_and(&max_iou.lt(negative_high));
            let positive = max_iou.ge(positive_threshold);
            let positive = if allow_low_quality {
                let (best_per_gt, _) = iou.max_dim(1, true);
                let low_quality = iou
                    .eq_tensor(&best_per_gt)
                    .logical_and(&best_per_gt.gt(0.0))
                    .any_dim(0, false);
                positive.logical_or(&low_quality)
            } else {
                positive
            };

            let labels = Tensor::full(&[num_candidates], ignore_label, (Kind::Int64, device))
                .masked_fill(&negative, NEGATIVE_LABEL)
                .masked_fill(&positive, POSITIVE_LABEL);

            Ok(MatchOutput {
                matched_indexes,
                labels,
            })
        })
    }
}

/// Indexes of sampled positive and negative candidates.
#[derive(Debug, TensorLike)]
pub struct SampledIndexes {
    pub positive: Tensor,
    pub negative: Tensor,
}

impl SampledIndexes {
    pub fn num_positive(&self) -> i64 {
        self.positive.size()[0]
    }

    pub fn num_negative(&self) -> i64 {
        self.negative.size()[0]
    }

    pub fn num_sampled(&self) -> i64 {
        self.num_positive() + self.num_negative()
    }
}

/// Randomly picks up to `num_samples * positive_fraction` positives, and fills
/// the rest of `num_samples` with negatives.
pub fn sample_labels(
    labels: &Tensor,
    num_samples: i64,
    positive_fraction: f64,
) -> Result<SampledIndexes> {
    ensure!(num_samples >= 0, "num_samples must be non-negative");
    ensure!(
        (0.0..=1.0).contains(&positive_fraction),
        "positive_fraction must be in range [0, 1]"
    );

    tch::no_grad(|| -> Result<_> {
        let positive = labels.eq(POSITIVE_LABEL).nonzero().view([-1]);
        let negative = labels.eq(NEGATIVE_LABEL).nonzero().view([-1]);

        let num_positive = ((num_samples as f64 * positive_fraction) as i64).min(positive.size()[0]);
        let num_negative = (num_samples - num_positive).min(negative.size()[0]);

        Ok(SampledIndexes {
            positive: random_subset(&positive, num_positive),
            negative: random_subset(&negative, num_negative),
        })
    })
}

fn random_subset(indexes: &Tensor, count: i64) -> Tensor {
    let total = indexes.size()[0];
    if count >= total {
        return indexes.shallow_clone();
    }
    let perm = Tensor::randperm(total, (Kind::Int64, indexes.device())).narrow(0, 0, count);
    indexes.index_select(0, &perm)
}
