use burn::{
    config::Config,
    module::{Module, Param},
    tensor::{backend::Backend, Tensor},
};

/// Flow layer whose parameters can be set from the statistics of real data
pub trait DdiFlow {
    fn supports_ddi(&self) -> bool {
        true
    }

    /// Arm (or disarm) data-dependent initialization for the next forward pass
    fn set_ddi(&mut self, ddi: bool);
}

/// Activation normalization config
#[derive(Config, Debug)]
pub struct ActNormConfig {
    channels: usize,
}

impl ActNormConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ActNorm<B> {
        ActNorm {
            logs: Param::from_tensor(Tensor::zeros([1, self.channels, 1], device)),
            bias: Param::from_tensor(Tensor::zeros([1, self.channels, 1], device)),
            initialized: true,
        }
    }
}

/// Per-channel affine flow, `y = bias + exp(logs) * x`
#[derive(Module, Debug)]
pub struct ActNorm<B: Backend> {
    /// `[1, channels, 1]`
    logs: Param<Tensor<B, 3>>,
    /// `[1, channels, 1]`
    bias: Param<Tensor<B, 3>>,
    initialized: bool,
}

impl<B: Backend> ActNorm<B> {
    /// Forward flow on `x [batch, channels, time]` under `x_mask [batch, 1, time]`.
    ///
    /// Returns the output and the log-determinant per example.
    pub fn forward(&self, x: Tensor<B, 3>, x_mask: Tensor<B, 3>) -> (Tensor<B, 3>, Tensor<B, 1>) {
        let logs = self.logs.val();
        let y = (self.bias.val() + logs.clone().exp() * x) * x_mask.clone();
        let [batch, _, _] = x_mask.dims();
        let x_len = x_mask.sum_dim(2).reshape([batch]);
        let logdet = x_len * logs.sum();
        (y, logdet)
    }

    /// Forward pass that first fits the parameters to `x` when DDI is armed
    pub fn forward_initializing(
        &mut self,
        x: Tensor<B, 3>,
        x_mask: Tensor<B, 3>,
    ) -> (Tensor<B, 3>, Tensor<B, 1>) {
        if !self.initialized {
            self.initialize(x.clone(), x_mask.clone());
            self.initialized = true;
        }
        self.forward(x, x_mask)
    }

    pub fn reverse(&self, y: Tensor<B, 3>, y_mask: Tensor<B, 3>) -> Tensor<B, 3> {
        (y - self.bias.val()) * self.logs.val().neg().exp() * y_mask
    }

    /// Zero-mean, unit-variance outputs over the masked batch
    fn initialize(&mut self, x: Tensor<B, 3>, x_mask: Tensor<B, 3>) {
        let x = x.detach();
        let x_mask = x_mask.detach();

        // sum over batch and time, keeping [1, channels, 1]
        let masked_sum = |t: Tensor<B, 3>| t.sum_dim(0).sum_dim(2);
        let denom = masked_sum(x_mask.clone());
        let m = masked_sum(x.clone() * x_mask.clone()) / denom.clone();
        let m_sq = masked_sum(x.clone() * x * x_mask) / denom;
        let v = m_sq - m.clone().powf_scalar(2.0);
        let logs = v.clamp_min(1e-6).log().mul_scalar(0.5);

        let bias_init = m.neg() * logs.clone().neg().exp();
        let logs_init = logs.neg();

        self.bias = self.bias.clone().map(|_| bias_init.detach().require_grad());
        self.logs = self.logs.clone().map(|_| logs_init.detach().require_grad());
    }

    pub fn logs(&self) -> Tensor<B, 3> {
        self.logs.val()
    }

    pub fn bias(&self) -> Tensor<B, 3> {
        self.bias.val()
    }
}

impl<B: Backend> DdiFlow for ActNorm<B> {
    fn set_ddi(&mut self, ddi: bool) {
        self.initialized = !ddi;
    }
}

#[cfg(all(test, feature = "ndarray"))]
mod tests {
    use super::*;
    use crate::testing::TestBackend;
    use burn::tensor::{cast::ToElement, Distribution};

    #[test]
    fn test_ddi_normalizes_outputs() {
        let device = Default::default();
        let mut norm = ActNormConfig::new(3).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 3>::random([4, 3, 16], Distribution::Normal(2.0, 3.0), &device);
        let mask = Tensor::<TestBackend, 3>::ones([4, 1, 16], &device);

        norm.set_ddi(true);
        let (y, _) = norm.forward_initializing(x.clone(), mask.clone());

        let mean = y.clone().mean().into_scalar().to_f64();
        let var = y.powf_scalar(2.0).mean().into_scalar().to_f64() - mean * mean;
        assert!(mean.abs() < 1e-3);
        assert!((var - 1.0).abs() < 1e-2);

        // armed once: a second batch leaves the parameters untouched
        let logs = norm.logs();
        norm.forward_initializing(x.mul_scalar(10.0), mask);
        let diff = (norm.logs() - logs).abs().max().into_scalar().to_f64();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_reverse_inverts_forward() {
        let device = Default::default();
        let mut norm = ActNormConfig::new(2).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 3>::random([2, 2, 5], Distribution::Default, &device);
        let mask = Tensor::<TestBackend, 3>::ones([2, 1, 5], &device);
        norm.set_ddi(true);
        let (y, logdet) = norm.forward_initializing(x.clone(), mask.clone());
        let x_back = norm.reverse(y, mask);

        let err = (x_back - x).abs().max().into_scalar().to_f64();
        assert!(err < 1e-4);
        assert_eq!(logdet.dims(), [2]);
    }

    #[test]
    fn test_fresh_layer_is_identity() {
        let device = Default::default();
        let norm = ActNormConfig::new(2).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 3>::random([1, 2, 3], Distribution::Default, &device);
        let mask = Tensor::<TestBackend, 3>::ones([1, 1, 3], &device);
        let (y, logdet) = norm.forward(x.clone(), mask);
        assert!((y - x).abs().max().into_scalar().to_f64() < 1e-7);
        assert_eq!(logdet.into_scalar().to_f64(), 0.0);
    }
}
