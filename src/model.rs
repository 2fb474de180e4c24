use std::sync::Arc;

use burn::{
    module::{AutodiffModule, Module},
    optim::GradientsParams,
    tensor::{
        backend::{AutodiffBackend, Backend},
        Int, Tensor,
    },
};

use crate::distributed::ProcessGroup;
use crate::errors::Result;
use crate::flows::DdiFlow;
use crate::format::{FormattedBatch, SpeakerConditioning};
use crate::grad;
use crate::params::synchronize_params;

/// Outputs of a training forward pass
#[derive(Debug, Clone)]
pub struct FlowOutput<B: Backend> {
    /// Latent of the mel frames, `[batch, channels, frames]`
    pub z: Tensor<B, 3>,
    /// Log-determinant of the decoder flows, `[batch]`
    pub logdet: Tensor<B, 1>,
    /// Prior mean aligned to the frames, `[batch, channels, frames]`
    pub y_mean: Tensor<B, 3>,
    /// Prior log standard deviation, `[batch, channels, frames]`
    pub y_log_scale: Tensor<B, 3>,
    /// `[batch, frames, tokens]`
    pub alignments: Tensor<B, 3>,
    /// Predicted log durations, `[batch, 1, tokens]`
    pub dur_log_pred: Tensor<B, 3>,
    /// Log durations taken from the alignment, `[batch, 1, tokens]`
    pub dur_log_total: Tensor<B, 3>,
}

/// Outputs of text-only inference
#[derive(Debug, Clone)]
pub struct InferenceOutput<B: Backend> {
    /// `[batch, channels, frames]`
    pub spec: Tensor<B, 3>,
    /// `[batch, frames, tokens]`
    pub alignments: Tensor<B, 3>,
}

/// Flow-based text to mel model driven by the training loops
pub trait GlowModel<B: Backend>: Module<B> {
    fn forward(&self, batch: &FormattedBatch<B>) -> FlowOutput<B>;

    /// Forward pass that lets armed flows fit themselves to the batch
    fn forward_initializing(&mut self, batch: &FormattedBatch<B>) -> FlowOutput<B>;

    fn inference(
        &self,
        text: Tensor<B, 2, Int>,
        text_lengths: Tensor<B, 1, Int>,
        speaker: Option<SpeakerConditioning<B>>,
    ) -> InferenceOutput<B>;

    /// Decoder flow layers, in forward order
    fn decoder_flows_mut(&mut self) -> Vec<&mut dyn DdiFlow>;
}

/// Single-replica or data-parallel handle on the trained model.
///
/// The loops only talk to this trait, so the same code trains on one device or
/// on several replicas in lockstep.
pub trait ModelWrapper<B: AutodiffBackend, M: AutodiffModule<B>> {
    fn unwrap(&self) -> &M;

    fn unwrap_mut(&mut self) -> &mut M;

    fn into_inner(self) -> M;

    /// Average the gradients over the replicas before the optimizer step
    fn average_gradients(&self, grads: GradientsParams) -> Result<GradientsParams>;

    /// Copy the parameters of rank 0 to every replica
    fn synchronize_parameters(&mut self) -> Result<()>;
}

/// Model trained on a single device
#[derive(Debug, Clone)]
pub struct PlainModel<M> {
    model: M,
}

impl<M> PlainModel<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }
}

impl<B: AutodiffBackend, M: AutodiffModule<B>> ModelWrapper<B, M> for PlainModel<M> {
    fn unwrap(&self) -> &M {
        &self.model
    }

    fn unwrap_mut(&mut self) -> &mut M {
        &mut self.model
    }

    fn into_inner(self) -> M {
        self.model
    }

    fn average_gradients(&self, grads: GradientsParams) -> Result<GradientsParams> {
        Ok(grads)
    }

    fn synchronize_parameters(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Model replica of a data-parallel group
pub struct DistributedModel<M> {
    model: M,
    group: Arc<dyn ProcessGroup>,
}

impl<M> DistributedModel<M> {
    /// Join the group, starting from the parameters of rank 0.
    ///
    /// Collective: every replica of `group` has to wrap its model.
    pub fn new<B: Backend>(model: M, group: Arc<dyn ProcessGroup>) -> Result<Self>
    where
        M: Module<B>,
    {
        let model = synchronize_params(model, group.as_ref())?;
        Ok(Self { model, group })
    }

    pub fn group(&self) -> &dyn ProcessGroup {
        self.group.as_ref()
    }
}

impl<B: AutodiffBackend, M: AutodiffModule<B>> ModelWrapper<B, M> for DistributedModel<M> {
    fn unwrap(&self) -> &M {
        &self.model
    }

    fn unwrap_mut(&mut self) -> &mut M {
        &mut self.model
    }

    fn into_inner(self) -> M {
        self.model
    }

    fn average_gradients(&self, grads: GradientsParams) -> Result<GradientsParams> {
        grad::average_gradients(&self.model, grads, self.group.as_ref())
    }

    fn synchronize_parameters(&mut self) -> Result<()> {
        self.model = synchronize_params(self.model.clone(), self.group.as_ref())?;
        Ok(())
    }
}

#[cfg(all(test, feature = "ndarray"))]
mod tests {
    use super::*;
    use crate::distributed::launch_replicas;
    use crate::params::ParamSnapshot;
    use crate::testing::TestBackend;
    use burn::nn::{Initializer, LinearConfig};

    #[test]
    fn test_plain_model_passes_through() {
        let linear = LinearConfig::new(2, 2)
            .with_initializer(Initializer::Constant { value: 1.5 })
            .init::<TestBackend>(&Default::default());
        let before = ParamSnapshot::capture(&linear).unwrap();

        let mut wrapper = PlainModel::new(linear);
        ModelWrapper::<TestBackend, _>::synchronize_parameters(&mut wrapper).unwrap();
        let inner = ModelWrapper::<TestBackend, _>::into_inner(wrapper);
        assert_eq!(ParamSnapshot::capture(&inner).unwrap(), before);
    }

    fn constant_linear(value: f32) -> burn::nn::Linear<TestBackend> {
        LinearConfig::new(2, 1)
            .with_initializer(Initializer::Constant { value })
            .init::<TestBackend>(&Default::default())
    }

    #[test]
    fn test_replicas_start_from_rank_zero() {
        let results = launch_replicas(2, |group| {
            let value = 1.0 + 2.0 * group.rank() as f32;
            let wrapper = DistributedModel::new(constant_linear(value), group)?;
            ParamSnapshot::capture(ModelWrapper::<TestBackend, _>::unwrap(&wrapper))
        })
        .unwrap();

        assert_eq!(results[0], results[1]);
        for tensor in &results[0].tensors {
            assert!(tensor.values.iter().all(|&v| v == 1.0));
        }
    }

    #[test]
    fn test_synchronize_discards_replica_drift() {
        let results = launch_replicas(2, |group| {
            let mut wrapper = DistributedModel::new(constant_linear(1.0), group.clone())?;
            // replicas diverge, as after fitting flows to their own shards
            let drift = constant_linear(5.0 + group.rank() as f32);
            *ModelWrapper::<TestBackend, _>::unwrap_mut(&mut wrapper) = drift;
            ModelWrapper::<TestBackend, _>::synchronize_parameters(&mut wrapper)?;
            ParamSnapshot::capture(ModelWrapper::<TestBackend, _>::unwrap(&wrapper))
        })
        .unwrap();

        assert_eq!(results[0], results[1]);
        assert!(results[1].tensors[0].values.iter().all(|&v| v == 5.0));
    }
}
