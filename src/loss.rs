use burn::tensor::{backend::Backend, cast::ToElement, Int, Tensor};

use crate::model::FlowOutput;

/// Named loss terms of one batch, each of shape `[1]`
#[derive(Debug, Clone)]
pub struct LossTerms<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub log_mle: Tensor<B, 1>,
    pub loss_dur: Tensor<B, 1>,
}

impl<B: Backend> LossTerms<B> {
    pub const NAMES: [&'static str; 3] = ["loss", "log_mle", "loss_dur"];

    /// Host values, in the order of [`LossTerms::NAMES`]
    pub fn values(&self) -> [f64; 3] {
        [
            self.loss.clone().into_scalar().to_f64(),
            self.log_mle.clone().into_scalar().to_f64(),
            self.loss_dur.clone().into_scalar().to_f64(),
        ]
    }
}

/// Training objective of a flow model
pub trait Criterion<B: Backend> {
    fn loss(
        &self,
        output: &FlowOutput<B>,
        mel_lengths: Tensor<B, 1, Int>,
        text_lengths: Tensor<B, 1, Int>,
    ) -> LossTerms<B>;
}

/// Negative log-likelihood of the mels under the aligned prior plus the
/// duration regression error.
///
/// Padded positions are expected to be zero in every output tensor, so plain
/// sums equal masked sums.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlowTtsLoss;

impl GlowTtsLoss {
    const HALF_LOG_2PI: f64 = 0.918_938_533_204_672_7;

    pub fn new() -> Self {
        Self
    }
}

impl<B: Backend> Criterion<B> for GlowTtsLoss {
    fn loss(
        &self,
        output: &FlowOutput<B>,
        mel_lengths: Tensor<B, 1, Int>,
        text_lengths: Tensor<B, 1, Int>,
    ) -> LossTerms<B> {
        let [_, channels, _] = output.z.dims();

        let scaled_dist = (output.z.clone() - output.y_mean.clone()).powf_scalar(2.0)
            * output.y_log_scale.clone().mul_scalar(-2.0).exp();
        let nll = output.y_log_scale.clone().sum() + scaled_dist.sum().mul_scalar(0.5)
            - output.logdet.clone().sum();
        let num_values = mel_lengths.float().sum().mul_scalar(channels as f64);
        let log_mle = (nll / num_values).add_scalar(Self::HALF_LOG_2PI);

        let loss_dur = (output.dur_log_pred.clone() - output.dur_log_total.clone())
            .powf_scalar(2.0)
            .sum()
            / text_lengths.float().sum();

        LossTerms {
            loss: log_mle.clone() + loss_dur.clone(),
            log_mle,
            loss_dur,
        }
    }
}
